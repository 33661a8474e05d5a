//! Scripted subclasses of native classes
//!
//! `Base.extend(methods, options)` returns a constructor right away. The
//! native class behind it is built on first instantiation: a class pair is
//! allocated under a unique name, every override of a known method or
//! property gets a trampoline installed as its implementation, declared
//! protocols are added and the pair is registered.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use tether_meta::{Member, Meta, MethodMeta};

use crate::context::{prototype_of, ExecutionContext};
use crate::error::BridgeError;
use crate::ffi::{Trampoline, TrampolineTarget};
use crate::objrt::{method_type_string, Class, Protocol, Sel};
use crate::script::{ObjectRef, Property, ScriptResult, ScriptValue};
use crate::wrapper::{Wrapper, WrapperKind};

/// Attempts before giving up on a free class name
const MAX_NAME_PROBES: usize = 1024;

static CLASS_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Held across probe and allocation when the runtime cannot detect
/// concurrent duplicates itself
static ALLOCATION_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Native side of a scripted subclass
#[derive(Debug, Default)]
pub struct ClassExtension {
    pub requested_name: Option<String>,
    pub protocols: Vec<(Protocol, Option<Arc<Meta>>)>,
    /// Implementations installed on the native class
    pub trampolines: Vec<Trampoline>,
}

/// Second argument of `extend`
#[derive(Debug, Default, Clone)]
pub struct ExtendOptions {
    pub name: Option<String>,
    /// Protocol objects
    pub protocols: Vec<ScriptValue>,
}

impl ExtendOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            protocols: Vec::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: ScriptValue) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Read `{ name, protocols }` from a script object
    pub fn from_value(ctx: &ExecutionContext, value: Option<&ScriptValue>) -> ScriptResult<Self> {
        let Some(value) = value.filter(|v| !v.is_nullish()) else {
            return Ok(Self::default());
        };
        let name = match ctx.get(value, "name")? {
            ScriptValue::String(name) => Some(name.to_string()),
            _ => None,
        };
        let protocols = match ctx.get(value, "protocols")? {
            ScriptValue::Object(list) if list.is_array() => list.elements(),
            _ => Vec::new(),
        };
        Ok(Self { name, protocols })
    }
}

/// Constructor of a scripted subclass of `base`
pub fn extend_class(
    ctx: &ExecutionContext,
    base: &ScriptValue,
    methods: &ScriptValue,
    options: ExtendOptions,
) -> ScriptResult<ObjectRef> {
    let base = base
        .as_object()
        .filter(|o| o.wrapper().map(|c| c.kind()) == Some(WrapperKind::NativeClass))
        .ok_or(BridgeError::InvalidReceiver("class constructor"))?;
    let meta = ctx.class_meta(base)?;

    let mut protocols = Vec::with_capacity(options.protocols.len());
    for protocol in &options.protocols {
        let cell = protocol
            .as_object()
            .and_then(|o| o.wrapper())
            .ok_or(BridgeError::InvalidReceiver("protocol"))?;
        let wrapper = cell.get()?;
        match &*wrapper {
            Wrapper::NativeProtocol(p) => protocols.push((p.protocol, p.meta.clone())),
            _ => return Err(BridgeError::InvalidReceiver("protocol").into()),
        }
    }

    let extension = ClassExtension {
        requested_name: options.name,
        protocols,
        trampolines: Vec::new(),
    };
    let constructor =
        ctx.build_constructor(ptr::null_mut(), meta, Some(base.clone()), Some(extension));

    if let (Some(prototype), Some(methods)) = (prototype_of(&constructor), methods.as_object()) {
        for key in methods.keys() {
            match methods.get_own(&key) {
                Some(Property::Value(value)) => prototype.set_value(key, value),
                Some(Property::Accessor { getter, setter }) => {
                    prototype.define_accessor(key, getter, setter)
                }
                None => {}
            }
        }
    }
    Ok(constructor)
}

/// Native class of a scripted subclass, built on first call
pub fn ensure_extended(ctx: &ExecutionContext, constructor: &ObjectRef) -> ScriptResult<Class> {
    let cell = constructor
        .wrapper()
        .ok_or(BridgeError::InvalidReceiver("class constructor"))?;
    let (requested, protocols, meta) = {
        let wrapper = cell.get()?;
        match &*wrapper {
            Wrapper::NativeClass(class) if !class.class.is_null() => return Ok(class.class),
            Wrapper::NativeClass(class) => match &class.extension {
                Some(extension) => (
                    extension.requested_name.clone(),
                    extension.protocols.clone(),
                    class.meta.clone(),
                ),
                None => {
                    return Err(BridgeError::ClassCreation(
                        "class has no native counterpart".into(),
                    )
                    .into())
                }
            },
            _ => return Err(BridgeError::InvalidReceiver("class constructor").into()),
        }
    };

    let base = constructor
        .prototype()
        .ok_or_else(|| BridgeError::ClassCreation("subclass without a base".into()))?;
    let superclass = ctx.class_pointer(&base)?;

    // Every fallible step happens before the class pair exists
    let mut overrides = Vec::new();
    if let Some(prototype) = prototype_of(constructor) {
        let mut sources: Vec<Arc<Meta>> = meta.into_iter().collect();
        sources.extend(protocols.iter().filter_map(|(_, meta)| meta.clone()));

        for key in prototype.keys() {
            if key == "constructor" {
                continue;
            }
            let members: Vec<Member> = sources
                .iter()
                .flat_map(|source| ctx.store().members_by_js_name(source.clone(), &key, false))
                .collect();
            let is_accessor = matches!(prototype.get_own(&key), Some(Property::Accessor { .. }));
            let mut installed = Vec::new();

            for member in members {
                let candidates = match member {
                    Member::Method(method) if !is_accessor => {
                        vec![(method, TrampolineTarget::Method { js_name: key.clone() })]
                    }
                    Member::Property(property) if is_accessor => {
                        let mut accessors = Vec::new();
                        if let Some(getter) = property.getter.clone() {
                            let target = TrampolineTarget::Getter { js_name: key.clone() };
                            accessors.push((getter, target));
                        }
                        if let Some(setter) = property.setter.clone() {
                            let target = TrampolineTarget::Setter { js_name: key.clone() };
                            accessors.push((setter, target));
                        }
                        accessors
                    }
                    _ => Vec::new(),
                };
                for (method, target) in candidates {
                    if installed.iter().any(|s: &String| s == method.selector()) {
                        continue;
                    }
                    installed.push(method.selector().to_string());
                    overrides.push(build_override(ctx, &method, target)?);
                }
            }
        }
    }

    let runtime = ctx.runtime();
    let serialize = !runtime.allocation_is_atomic() || ctx.options().serialize_class_allocation;
    let (class, name) = {
        let _guard = serialize.then(|| ALLOCATION_LOCK.lock());
        allocate(ctx, superclass, requested.as_deref())?
    };

    let mut trampolines = Vec::with_capacity(overrides.len());
    for entry in overrides {
        if !runtime.add_method(class, entry.selector, entry.trampoline.code(), &entry.types) {
            log::warn!("could not add {} to {}", entry.name, name);
        }
        trampolines.push(entry.trampoline);
    }

    for (protocol, _) in &protocols {
        if !protocol.is_null() {
            runtime.add_protocol(class, *protocol);
        }
    }
    runtime.register_class_pair(class);
    log::debug!(
        "registered {} ({} overrides) extending {}",
        name,
        trampolines.len(),
        runtime.class_name(superclass)
    );

    {
        let mut wrapper = cell.get_mut()?;
        if let Wrapper::NativeClass(native) = &mut *wrapper {
            native.class = class;
            if let Some(extension) = &mut native.extension {
                extension.trampolines = trampolines;
            }
        }
    }
    ctx.caches()
        .insert_class_constructor(class as usize, constructor.clone());
    Ok(class)
}

/// A method override ready to be added to the new class
struct Override {
    name: String,
    selector: Sel,
    types: String,
    trampoline: Trampoline,
}

fn build_override(
    ctx: &ExecutionContext,
    method: &MethodMeta,
    target: TrampolineTarget,
) -> ScriptResult<Override> {
    let signature = ctx.signature(&method.encodings);
    let layout = ctx.layout(&signature, 2)?;
    Ok(Override {
        name: method.selector().to_string(),
        selector: ctx.runtime().register_selector(method.selector()),
        types: method_type_string(&method.encodings, ctx.store()),
        trampoline: Trampoline::new(ctx, layout, target)?,
    })
}

/// Allocate a class pair under the requested name, or the first free
/// generated one
fn allocate(
    ctx: &ExecutionContext,
    superclass: Class,
    requested: Option<&str>,
) -> ScriptResult<(Class, String)> {
    let runtime = ctx.runtime();
    if let Some(name) = requested {
        if let Some(class) = runtime.allocate_class_pair(superclass, name) {
            return Ok((class, name.to_string()));
        }
        log::debug!("class name {} is taken", name);
    }

    let stem = match requested {
        Some(name) => name.to_string(),
        None => format!(
            "{}{}",
            runtime.class_name(superclass),
            ctx.options().dynamic_class_suffix
        ),
    };
    for _ in 0..MAX_NAME_PROBES {
        let name = format!("{}_{}", stem, CLASS_COUNTER.fetch_add(1, Ordering::Relaxed) + 1);
        if let Some(class) = runtime.allocate_class_pair(superclass, &name) {
            return Ok((class, name));
        }
    }
    Err(BridgeError::ClassCreation(format!("no free class name for {}", stem)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objrt::{HostRuntime, ObjectRuntime};

    #[test]
    fn test_generated_names_are_unique() {
        let runtime = HostRuntime::new();
        let root = runtime.get_class("NSObject").unwrap();
        let taken = runtime.allocate_class_pair(root, "BuilderTaken").unwrap();
        runtime.register_class_pair(taken);

        let store = Arc::new(crate::testing::empty_store());
        let ctx = ExecutionContext::new(Arc::new(runtime), store);
        let (first, first_name) = allocate(&ctx, root, Some("BuilderTaken")).unwrap();
        let (second, second_name) = allocate(&ctx, root, Some("BuilderTaken")).unwrap();
        assert_ne!(first, taken);
        assert_ne!(first, second);
        assert_ne!(first_name, second_name);
        assert!(first_name.starts_with("BuilderTaken_"));
    }

    #[test]
    fn test_options_from_value() {
        let store = Arc::new(crate::testing::empty_store());
        let ctx = ExecutionContext::new(Arc::new(HostRuntime::new()), store);
        let value = ScriptValue::Object(crate::script::ScriptObject::from_entries([(
            "name",
            ScriptValue::string("Named"),
        )]));
        let options = ExtendOptions::from_value(&ctx, Some(&value)).unwrap();
        assert_eq!(options.name.as_deref(), Some("Named"));
        assert!(options.protocols.is_empty());
        assert!(ExtendOptions::from_value(&ctx, None).unwrap().name.is_none());
    }
}
