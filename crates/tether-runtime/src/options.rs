//! Bridge configuration

use crate::defaults::{DEFAULT_DYNAMIC_CLASS_SUFFIX, DEFAULT_MAX_FINALIZER_RETRIES};

/// How aggregate types are described to the native call primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructPassing {
    /// Nested aggregates stay nested
    Nested,
    /// Aggregates are flattened to their scalar leaves, depth first
    Flattened,
}

impl StructPassing {
    /// Convention of the build target
    pub fn for_target() -> Self {
        if cfg!(all(target_arch = "arm", target_os = "ios")) {
            StructPassing::Flattened
        } else {
            StructPassing::Nested
        }
    }
}

/// Per-context bridge options.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Aggregate passing convention for native calls.
    pub struct_passing: StructPassing,
    /// Inserted between the base name and the counter of generated class names.
    pub dynamic_class_suffix: String,
    /// Serialize class allocation even when the runtime reports it collision-safe.
    pub serialize_class_allocation: bool,
    /// Finalizer retries before a stuck wrapper is reported (default: 64).
    pub max_finalizer_retries: u32,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            struct_passing: StructPassing::for_target(),
            dynamic_class_suffix: DEFAULT_DYNAMIC_CLASS_SUFFIX.to_string(),
            serialize_class_allocation: false,
            max_finalizer_retries: DEFAULT_MAX_FINALIZER_RETRIES,
        }
    }
}

impl BridgeOptions {
    pub fn with_struct_passing(mut self, passing: StructPassing) -> Self {
        self.struct_passing = passing;
        self
    }

    pub fn with_dynamic_class_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.dynamic_class_suffix = suffix.into();
        self
    }

    pub fn with_serialized_class_allocation(mut self, serialize: bool) -> Self {
        self.serialize_class_allocation = serialize;
        self
    }

    pub fn with_max_finalizer_retries(mut self, retries: u32) -> Self {
        self.max_finalizer_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let options = BridgeOptions::default()
            .with_struct_passing(StructPassing::Flattened)
            .with_dynamic_class_suffix("_X")
            .with_max_finalizer_retries(3);
        assert_eq!(options.struct_passing, StructPassing::Flattened);
        assert_eq!(options.dynamic_class_suffix, "_X");
        assert_eq!(options.max_finalizer_retries, 3);
        assert!(!options.serialize_class_allocation);
        assert!(options.with_serialized_class_allocation(true).serialize_class_allocation);
    }
}
