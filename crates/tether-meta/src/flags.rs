//! Record kinds and flag bits of the meta header

/// Kind of a top-level record, stored in the low 3 bits of the header flags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKind {
    Undefined = 0,
    Struct,
    Union,
    Function,
    JsCode,
    Var,
    Interface,
    Protocol,
}

impl MetaKind {
    /// Mask selecting the kind bits of the header flags
    pub const MASK: u16 = 0b111;

    /// Extract the kind from header flags
    pub fn from_flags(flags: u16) -> Self {
        match flags & Self::MASK {
            1 => MetaKind::Struct,
            2 => MetaKind::Union,
            3 => MetaKind::Function,
            4 => MetaKind::JsCode,
            5 => MetaKind::Var,
            6 => MetaKind::Interface,
            7 => MetaKind::Protocol,
            _ => MetaKind::Undefined,
        }
    }

    /// The kind bits
    pub fn bits(self) -> u16 {
        self as u16
    }
}

/// Flag bits shared by every record
pub mod common {
    pub const HAS_NAME: u16 = 1 << 7;
    pub const IS_IOS_APP_EXTENSION_AVAILABLE: u16 = 1 << 6;
    pub const HAS_DEMANGLED_NAME: u16 = 1 << 8;
}

/// Flag bits of function records
pub mod function {
    pub const IS_VARIADIC: u16 = 1 << 5;
    pub const OWNS_RETURNED_COCOA_OBJECT: u16 = 1 << 4;
    pub const RETURNS_UNMANAGED: u16 = 1 << 3;
}

/// Flag bits of method and property records
pub mod member {
    pub const IS_OPTIONAL: u16 = 1 << 0;
}

/// Flag bits of method records
pub mod method {
    pub const IS_INITIALIZER: u16 = 1 << 1;
    pub const IS_VARIADIC: u16 = 1 << 2;
    pub const IS_NULL_TERMINATED_VARIADIC: u16 = 1 << 3;
    pub const OWNS_RETURNED_COCOA_OBJECT: u16 = 1 << 4;
    pub const HAS_ERROR_OUT_PARAMETER: u16 = 1 << 5;
}

/// Flag bits of property records
pub mod property {
    pub const HAS_GETTER: u16 = 1 << 2;
    pub const HAS_SETTER: u16 = 1 << 3;
}

/// Flag bits of module records
pub mod module {
    pub const IS_FRAMEWORK: u8 = 1 << 0;
    pub const IS_SYSTEM: u8 = 1 << 1;
}

/// Flag bits of library records
pub mod library {
    pub const IS_FRAMEWORK: u8 = 1 << 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_through_flags() {
        for kind in [
            MetaKind::Struct,
            MetaKind::Union,
            MetaKind::Function,
            MetaKind::JsCode,
            MetaKind::Var,
            MetaKind::Interface,
            MetaKind::Protocol,
        ] {
            let flags = kind.bits() | common::HAS_NAME | common::HAS_DEMANGLED_NAME;
            assert_eq!(MetaKind::from_flags(flags), kind);
        }
    }

    #[test]
    fn test_member_flags_reuse_kind_bits() {
        // members carry no kind, so their flags may live in the kind bits
        assert_ne!(property::HAS_GETTER & MetaKind::MASK, 0);
        assert_ne!(method::IS_VARIADIC & MetaKind::MASK, 0);
        assert_eq!(method::HAS_ERROR_OUT_PARAMETER & MetaKind::MASK, 0);
    }
}
