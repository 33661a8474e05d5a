//! Execution context
//!
//! One [`ExecutionContext`] per script context. It owns the per-context
//! caches and the wrapper heap, and is the entry point for every operation
//! that crosses the boundary. It is thread-confined; only the metadata
//! store, the object runtime and the worker registry are shared.

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use tether_meta::{Meta, MetaKind, MetadataStore, MethodMeta, TypeEncoding};

use crate::caches::Caches;
use crate::class_builder::{self, ExtendOptions};
use crate::defaults::DEFAULT_WORKER_QUEUE_WAIT_MS;
use crate::error::BridgeError;
use crate::ffi::{
    block_invoke, call_native, read_field, AbiType, CallFrame, CallLayout, KeepAlive, NativeCall,
    Position, Signature, StructInfo,
};
use crate::interop;
use crate::lifecycle::{DrainReport, ScriptHeap};
use crate::objrt::{Class, Id, ObjectRuntime, Protocol};
use crate::options::BridgeOptions;
use crate::script::{
    ObjectBuilder, ObjectRef, Property, ScriptError, ScriptObject, ScriptResult, ScriptValue,
};
use crate::symbols::SymbolResolver;
use crate::worker::{self, WorkerRegistry, WorkerScope};
use crate::wrapper::{
    BlockWrapper, ClassWrapper, FunctionWrapper, ObjectWrapper, PointerWrapper, ProtocolWrapper,
    ReferenceStorage, ReferenceWrapper, StructStorage, StructWrapper, Wrapper,
};

pub struct ContextInner {
    runtime: Arc<dyn ObjectRuntime>,
    store: Arc<MetadataStore>,
    symbols: Arc<SymbolResolver>,
    options: BridgeOptions,
    heap: ScriptHeap,
    caches: Caches,
    pending_error: RefCell<Option<ScriptError>>,
    call_depth: Cell<usize>,
    deferred: RefCell<KeepAlive>,
}

/// Handle to a script execution context
#[derive(Clone)]
pub struct ExecutionContext(Rc<ContextInner>);

/// Guard for one native call; the outermost one drains deferred releases
pub struct CallScope<'a> {
    ctx: &'a ExecutionContext,
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        let depth = self.ctx.0.call_depth.get() - 1;
        self.ctx.0.call_depth.set(depth);
        if depth == 0 {
            self.ctx.release_deferred();
        }
    }
}

impl ExecutionContext {
    pub fn new(runtime: Arc<dyn ObjectRuntime>, store: Arc<MetadataStore>) -> Self {
        Self::with_options(runtime, store, BridgeOptions::default())
    }

    pub fn with_options(
        runtime: Arc<dyn ObjectRuntime>,
        store: Arc<MetadataStore>,
        options: BridgeOptions,
    ) -> Self {
        log::debug!("new execution context ({:?} struct passing)", options.struct_passing);
        ExecutionContext(Rc::new(ContextInner {
            runtime,
            store,
            symbols: Arc::new(SymbolResolver::new()),
            options,
            heap: ScriptHeap::new(),
            caches: Caches::new(),
            pending_error: RefCell::new(None),
            call_depth: Cell::new(0),
            deferred: RefCell::new(KeepAlive::default()),
        }))
    }

    pub fn downgrade(&self) -> Weak<ContextInner> {
        Rc::downgrade(&self.0)
    }

    pub fn upgrade(inner: &Weak<ContextInner>) -> Option<Self> {
        inner.upgrade().map(ExecutionContext)
    }

    // ===== Accessors =====

    pub fn runtime(&self) -> &dyn ObjectRuntime {
        self.0.runtime.as_ref()
    }

    pub fn store(&self) -> &MetadataStore {
        &self.0.store
    }

    pub fn symbols(&self) -> &SymbolResolver {
        &self.0.symbols
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.0.options
    }

    pub fn heap(&self) -> &ScriptHeap {
        &self.0.heap
    }

    pub fn caches(&self) -> &Caches {
        &self.0.caches
    }

    // ===== Types =====

    pub fn abi_type(&self, encoding: &TypeEncoding, position: Position) -> ScriptResult<AbiType> {
        Ok(self.0.caches.abi_type(self.store(), encoding, position)?)
    }

    pub fn struct_info(&self, encoding: &TypeEncoding) -> ScriptResult<Rc<StructInfo>> {
        Ok(self.0.caches.struct_info(self.store(), encoding)?)
    }

    pub fn signature(&self, encodings: &[TypeEncoding]) -> Signature {
        self.0.caches.signature(encodings)
    }

    pub fn layout(&self, signature: &Signature, implicit: usize) -> ScriptResult<Rc<CallLayout>> {
        Ok(self
            .0
            .caches
            .layout(self.store(), self.options(), signature, implicit)?)
    }

    // ===== Call bookkeeping =====

    pub fn enter_call(&self) -> CallScope<'_> {
        self.0.call_depth.set(self.0.call_depth.get() + 1);
        CallScope { ctx: self }
    }

    pub fn call_depth(&self) -> usize {
        self.0.call_depth.get()
    }

    /// Keep `keep` alive until the outermost native call returns
    pub fn defer(&self, keep: KeepAlive) {
        if !keep.is_empty() {
            self.0.deferred.borrow_mut().append(keep);
        }
    }

    fn release_deferred(&self) {
        self.runtime().drain_autorelease_pool();
        let deferred = std::mem::take(&mut *self.0.deferred.borrow_mut());
        drop(deferred);
    }

    /// Park an error raised inside a native callback
    pub fn set_pending_error(&self, error: ScriptError) {
        let mut pending = self.0.pending_error.borrow_mut();
        if pending.is_none() {
            *pending = Some(error);
        }
    }

    pub fn take_pending_error(&self) -> Option<ScriptError> {
        self.0.pending_error.borrow_mut().take()
    }

    // ===== Lifecycle =====

    /// Watch a wrapped object for finalization
    pub fn track(&self, object: &ObjectRef) -> Weak<ScriptObject> {
        self.0.heap.register(object)
    }

    /// Finalize unreachable wrappers
    pub fn collect_garbage(&self) -> DrainReport {
        let queued = self.0.heap.collect();
        let report = self.0.heap.drain(self);
        if self.call_depth() == 0 {
            self.release_deferred();
        }
        log::trace!(
            "collected {} wrappers: {} disposed, {} retried",
            queued,
            report.disposed,
            report.retried
        );
        report
    }

    // ===== Script operations =====

    /// Property read, running accessors
    pub fn get(&self, target: &ScriptValue, name: &str) -> ScriptResult<ScriptValue> {
        let object = match target {
            ScriptValue::Object(object) => object,
            v if v.is_nullish() => {
                return Err(ScriptError::type_error(format!(
                    "Cannot read properties of {} (reading '{}')",
                    v, name
                )))
            }
            _ => return Ok(ScriptValue::Undefined),
        };
        if object.is_array() && name == "length" {
            return Ok(ScriptValue::Number(object.elements().len() as f64));
        }
        match object.find_property(name) {
            Some(Property::Value(value)) => Ok(value),
            Some(Property::Accessor {
                getter: Some(getter), ..
            }) => getter(self, target, &[]),
            _ => Ok(ScriptValue::Undefined),
        }
    }

    /// Property write, running setters
    pub fn set(&self, target: &ScriptValue, name: &str, value: ScriptValue) -> ScriptResult<()> {
        let Some(object) = target.as_object() else {
            return Err(ScriptError::type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                target, name
            )));
        };
        match object.find_property(name) {
            Some(Property::Accessor {
                setter: Some(setter), ..
            }) => setter(self, target, &[value]).map(|_| ()),
            Some(Property::Accessor { setter: None, .. }) => Err(ScriptError::type_error(format!(
                "Cannot set property {} which has only a getter",
                name
            ))),
            _ => {
                object.set_value(name, value);
                Ok(())
            }
        }
    }

    pub fn call(
        &self,
        function: &ScriptValue,
        this: &ScriptValue,
        args: &[ScriptValue],
    ) -> ScriptResult<ScriptValue> {
        match function.as_object().and_then(|f| f.callable()) {
            Some(call) => call(self, this, args),
            None => Err(ScriptError::type_error(format!("{} is not a function", function))),
        }
    }

    /// `new constructor(...args)`
    pub fn construct(
        &self,
        constructor: &ScriptValue,
        args: &[ScriptValue],
    ) -> ScriptResult<ScriptValue> {
        match constructor.as_object().and_then(|c| c.constructor()) {
            Some(construct) => construct(self, constructor, args),
            None => Err(ScriptError::type_error(format!("{} is not a constructor", constructor))),
        }
    }

    /// Call `js_name` on `this`, a method of `target`
    pub fn invoke(
        &self,
        target: &ScriptValue,
        js_name: &str,
        args: &[ScriptValue],
    ) -> ScriptResult<ScriptValue> {
        let function = self.get(target, js_name)?;
        self.call(&function, target, args)
    }

    // ===== Globals =====

    /// Script-visible global for a metadata name or `interop`
    pub fn global(&self, name: &str) -> ScriptResult<ScriptValue> {
        if let Some(value) = self.0.caches.global(name) {
            return Ok(value);
        }
        if name == "interop" {
            let value = ScriptValue::Object(interop::install(self)?);
            self.0.caches.insert_global(name, value.clone());
            return Ok(value);
        }

        let meta = self
            .store()
            .lookup(name)
            .ok_or_else(|| BridgeError::UnknownDeclaration(name.to_string()))?;
        let value = match &*meta {
            Meta::Class(class) if class.is_protocol() => {
                let protocol = self.runtime().get_protocol(meta.name()).unwrap_or(ptr::null_mut());
                self.protocol_object(protocol, Some(meta.clone()))
            }
            Meta::Class(_) => {
                let class = self
                    .runtime()
                    .get_class(meta.name())
                    .ok_or_else(|| BridgeError::UnknownDeclaration(meta.name().to_string()))?;
                ScriptValue::Object(self.class_object(class)?)
            }
            Meta::Function(function) => {
                let address = self.symbols().resolve(meta.name()).map_err(BridgeError::from)?;
                let owns = function.owns_returned_object() && !function.returns_unmanaged();
                self.function_value(
                    address as usize,
                    function.encodings.clone(),
                    owns,
                    function.returns_unmanaged(),
                )
            }
            Meta::Record(_) => {
                let encoding = match meta.kind() {
                    MetaKind::Union => TypeEncoding::UnionDeclarationReference {
                        name: name.to_string(),
                    },
                    _ => TypeEncoding::struct_ref(name),
                };
                let info = self.struct_info(&encoding)?;
                ScriptValue::Object(interop::struct_type(self, &info))
            }
            Meta::JsCode(code) => match code.enum_members() {
                Some(members) => {
                    let object = ObjectBuilder::new().wrapper(Wrapper::Enum(meta.clone())).build();
                    for (key, value) in members {
                        object.set_value(key, ScriptValue::Number(value));
                    }
                    ScriptValue::Object(object)
                }
                None => code
                    .constant_value()
                    .map(|value| worker::from_message(&value))
                    .unwrap_or_default(),
            },
            Meta::Var(var) => {
                // Variables are read on every access
                let address = self.symbols().resolve(meta.name()).map_err(BridgeError::from)?;
                return read_field(self, &var.encoding, address as *const u8, None);
            }
        };
        self.0.caches.insert_global(name, value.clone());
        Ok(value)
    }

    // ===== Classes =====

    /// Constructor of a native class
    pub fn class_value(&self, class: Class) -> ScriptResult<ScriptValue> {
        self.class_object(class).map(ScriptValue::Object)
    }

    pub(crate) fn class_object(&self, class: Class) -> ScriptResult<ObjectRef> {
        if let Some(constructor) = self.0.caches.class_constructor(class as usize) {
            return Ok(constructor);
        }

        let runtime = self.runtime();
        let name = runtime.class_name(class);
        let mut meta = None;
        let mut current = Some(class);
        while let Some(c) = current {
            if let Some(found) = self.store().find_interface(&runtime.class_name(c)) {
                meta = Some(found);
                break;
            }
            current = runtime.superclass(c);
        }
        let exact = meta.as_ref().is_some_and(|m| m.name() == name);

        let base = match runtime.superclass(class) {
            Some(superclass) => Some(self.class_object(superclass)?),
            None => None,
        };
        let constructor = self.build_constructor(class, meta.clone(), base, None);
        if let (Some(meta), true) = (&meta, exact) {
            self.install_members(&constructor, meta);
        }
        log::trace!("constructor for native class {}", name);
        self.0
            .caches
            .insert_class_constructor(class as usize, constructor.clone());
        Ok(constructor)
    }

    /// A class constructor and its prototype object
    pub(crate) fn build_constructor(
        &self,
        class: Class,
        meta: Option<Arc<Meta>>,
        base: Option<ObjectRef>,
        extension: Option<class_builder::ClassExtension>,
    ) -> ObjectRef {
        let base_prototype = base.as_ref().and_then(prototype_of);
        let prototype = ObjectBuilder::new().prototype(base_prototype).build();
        let constructor = ObjectBuilder::new()
            .prototype(base)
            .construct(Rc::new(construct_instance))
            .wrapper(Wrapper::NativeClass(ClassWrapper { class, meta, extension }))
            .build();
        constructor.set_value("prototype", ScriptValue::Object(prototype.clone()));
        prototype.set_value("constructor", ScriptValue::Object(constructor.clone()));
        constructor
    }

    fn install_members(&self, constructor: &ObjectRef, meta: &Arc<Meta>) {
        let Some(prototype) = prototype_of(constructor) else {
            return;
        };
        let sources = self
            .store()
            .ancestry(meta.clone())
            .into_iter()
            .filter(|m| Arc::ptr_eq(m, meta) || m.as_class().is_some_and(|c| c.is_protocol()));

        for source in sources {
            let Some(class) = source.as_class() else {
                continue;
            };
            for (target, methods, is_static) in [
                (&prototype, &class.instance_methods, false),
                (constructor, &class.static_methods, true),
            ] {
                for method in methods {
                    let js_name = method.js_name();
                    if !target.has_own(js_name) {
                        let function = method_function(meta.clone(), js_name, is_static);
                        target.set_value(js_name, function);
                    }
                }
            }
            for (target, properties) in [
                (&prototype, &class.instance_properties),
                (constructor, &class.static_properties),
            ] {
                for property in properties {
                    if target.has_own(property.js_name()) {
                        continue;
                    }
                    let getter = property.getter.clone().map(accessor_getter);
                    let setter = property.setter.clone().map(accessor_setter);
                    target.define_accessor(property.js_name(), getter, setter);
                }
            }
        }

        let extend = ScriptObject::function(|ctx, this, args| {
            let methods = args.first().cloned().unwrap_or_default();
            let options = ExtendOptions::from_value(ctx, args.get(1))?;
            class_builder::extend_class(ctx, this, &methods, options).map(ScriptValue::Object)
        });
        constructor.set_value("extend", ScriptValue::Object(extend));
    }

    /// Class pointer behind a constructor, extending a scripted subclass on
    /// first use
    pub fn class_pointer(&self, constructor: &ObjectRef) -> ScriptResult<Class> {
        let class = {
            let cell = constructor
                .wrapper()
                .ok_or(BridgeError::InvalidReceiver("class constructor"))?;
            let wrapper = cell.get()?;
            match &*wrapper {
                Wrapper::NativeClass(class) => class.class,
                _ => return Err(BridgeError::InvalidReceiver("class constructor").into()),
            }
        };
        if !class.is_null() {
            return Ok(class);
        }
        class_builder::ensure_extended(self, constructor)
    }

    /// Metadata behind a class constructor
    pub fn class_meta(&self, constructor: &ObjectRef) -> ScriptResult<Option<Arc<Meta>>> {
        let cell = constructor
            .wrapper()
            .ok_or(BridgeError::InvalidReceiver("class constructor"))?;
        let wrapper = cell.get()?;
        match &*wrapper {
            Wrapper::NativeClass(class) => Ok(class.meta.clone()),
            _ => Err(BridgeError::InvalidReceiver("class constructor").into()),
        }
    }

    /// Scripted subclass of a native class constructor
    pub fn extend_class(
        &self,
        base: &ScriptValue,
        methods: &ScriptValue,
        options: ExtendOptions,
    ) -> ScriptResult<ObjectRef> {
        class_builder::extend_class(self, base, methods, options)
    }

    pub fn protocol_value(&self, protocol: Protocol) -> ScriptResult<ScriptValue> {
        if let Some(object) = self.0.caches.protocol_object(protocol as usize) {
            return Ok(ScriptValue::Object(object));
        }
        let meta = self
            .store()
            .find_protocol(&self.runtime().protocol_name(protocol));
        Ok(self.protocol_object(protocol, meta))
    }

    fn protocol_object(&self, protocol: Protocol, meta: Option<Arc<Meta>>) -> ScriptValue {
        if let Some(object) = self.0.caches.protocol_object(protocol as usize) {
            return ScriptValue::Object(object);
        }
        let name = meta.as_ref().map(|m| m.js_name().to_string());
        let object = ObjectBuilder::new()
            .wrapper(Wrapper::NativeProtocol(ProtocolWrapper { protocol, meta }))
            .build();
        if let Some(name) = name {
            object.set_value("name", ScriptValue::from(name));
        }
        if !protocol.is_null() {
            self.0
                .caches
                .insert_protocol_object(protocol as usize, object.clone());
        }
        ScriptValue::Object(object)
    }

    // ===== Native objects =====

    /// The script object for a native instance
    ///
    /// `owned` means the caller holds a +1 retain that the wrapper adopts;
    /// otherwise the wrapper takes its own retain.
    pub fn wrap_native_object(&self, object: Id, owned: bool) -> ScriptResult<ScriptValue> {
        if object.is_null() {
            return Ok(ScriptValue::Null);
        }
        let runtime = self.runtime();
        if runtime.is_class(object) {
            return self.class_value(object);
        }
        if let Some(existing) = self.0.heap.lookup_instance(object) {
            if owned {
                runtime.release(object);
            }
            return Ok(ScriptValue::Object(existing));
        }

        let constructor = self.class_object(runtime.class_of(object))?;
        if !owned {
            runtime.retain(object);
        }
        let wrapper = ObjectBuilder::new()
            .prototype(prototype_of(&constructor))
            .wrapper(Wrapper::NativeObject(ObjectWrapper {
                object,
                super_class: None,
                owner: None,
            }))
            .build();
        self.0.heap.insert_instance(object, &wrapper);
        self.0.heap.register(&wrapper);
        Ok(ScriptValue::Object(wrapper))
    }

    /// A view of `this` whose methods dispatch from the superclass of its
    /// current dispatch class
    pub fn super_of(&self, this: &ScriptValue) -> ScriptResult<ScriptValue> {
        let owner = this
            .as_object()
            .ok_or(BridgeError::InvalidReceiver("native object"))?;
        let runtime = self.runtime();
        let (object, current) = {
            let cell = owner.wrapper().ok_or(BridgeError::InvalidReceiver("native object"))?;
            let wrapper = cell.get()?;
            match &*wrapper {
                Wrapper::NativeObject(o) => {
                    let current = match o.super_class {
                        Some(class) => runtime.superclass(class),
                        None => Some(runtime.class_of(o.object)),
                    };
                    (o.object, current)
                }
                _ => return Err(BridgeError::InvalidReceiver("native object").into()),
            }
        };
        let classes = current.and_then(|current| {
            runtime
                .superclass(current)
                .map(|superclass| (current, superclass))
        });
        let (current, superclass) =
            classes.ok_or(BridgeError::InvalidReceiver("object with a superclass"))?;
        let constructor = self.class_object(superclass)?;
        let view = ObjectBuilder::new()
            .prototype(prototype_of(&constructor))
            .wrapper(Wrapper::NativeObject(ObjectWrapper {
                object,
                super_class: Some(current),
                owner: Some(owner.clone()),
            }))
            .super_view()
            .build();
        self.0.heap.register(&view);
        Ok(ScriptValue::Object(view))
    }

    /// Receiver pointer and dispatch class of `this`, and whether sends go
    /// through the super lookup
    fn receiver(&self, this: &ScriptValue) -> ScriptResult<(Id, Class, bool)> {
        if this.is_nullish() {
            return Ok((ptr::null_mut(), ptr::null_mut(), false));
        }
        let object = this
            .as_object()
            .ok_or(BridgeError::InvalidReceiver("native object"))?;
        let native = {
            let cell = object.wrapper().ok_or(BridgeError::InvalidReceiver("native object"))?;
            let wrapper = cell.get()?;
            match &*wrapper {
                Wrapper::NativeObject(o) => Some((o.object, o.super_class)),
                Wrapper::NativeClass(_) => None,
                _ => return Err(BridgeError::InvalidReceiver("native object").into()),
            }
        };
        let runtime = self.runtime();
        match native {
            Some((object, Some(class))) => Ok((object, class, true)),
            Some((object, None)) => Ok((object, runtime.class_of(object), false)),
            None => {
                let class = self.class_pointer(object)?;
                Ok((class, runtime.class_of(class), false))
            }
        }
    }

    /// Overload of `js_name` for `args`, then the native call
    pub fn call_method(
        &self,
        meta: &Arc<Meta>,
        this: &ScriptValue,
        js_name: &str,
        is_static: bool,
        args: &[ScriptValue],
    ) -> ScriptResult<ScriptValue> {
        let store = self.store();
        match store.find_method(meta.clone(), js_name, is_static, args.len()) {
            Some(method) => self.send(this, &method, args),
            None => {
                let candidates = store.members_by_js_name(meta.clone(), js_name, is_static);
                let expected = candidates.iter().find_map(|m| match m {
                    tether_meta::Member::Method(method) => Some(method.arity()),
                    tether_meta::Member::Property(_) => None,
                });
                Err(match expected {
                    Some(expected) => BridgeError::ArgumentCount {
                        expected,
                        actual: args.len(),
                    },
                    None => BridgeError::UnknownDeclaration(js_name.to_string()),
                }
                .into())
            }
        }
    }

    /// Message send of `method` to `this`
    pub fn send(
        &self,
        this: &ScriptValue,
        method: &MethodMeta,
        args: &[ScriptValue],
    ) -> ScriptResult<ScriptValue> {
        let (receiver, dispatch, is_super) = self.receiver(this)?;
        let runtime = self.runtime();
        let selector = runtime.register_selector(method.selector());
        let address = if receiver.is_null() {
            ptr::null()
        } else {
            let imp = if is_super {
                runtime.lookup_super_imp(dispatch, selector)
            } else {
                runtime.lookup_imp(dispatch, selector)
            };
            imp.ok_or_else(|| BridgeError::UnrecognizedSelector {
                selector: method.selector().to_string(),
                class: runtime.class_name(dispatch),
            })?
        };
        let implicit = [receiver as *const c_void, selector];
        let call = NativeCall {
            address,
            signature: &method.encodings,
            implicit: &implicit,
            owns_returned: method.owns_returned_object(),
            error_out: method.has_error_out_parameter(),
        };
        call_native(self, &call, args)
    }

    /// Send a selector without arguments that returns an object, bypassing
    /// the wrapper layer
    pub(crate) fn send_raw(&self, receiver: Id, selector: &str) -> ScriptResult<Id> {
        let runtime = self.runtime();
        let sel = runtime.register_selector(selector);
        let class = runtime.class_of(receiver);
        let imp = runtime
            .lookup_imp(class, sel)
            .ok_or_else(|| BridgeError::UnrecognizedSelector {
                selector: selector.to_string(),
                class: runtime.class_name(class),
            })?;
        let signature = self.signature(&[TypeEncoding::InstanceType]);
        let layout = self.layout(&signature, 2)?;
        let mut frame = CallFrame::new(&layout);
        unsafe {
            ptr::write_unaligned(frame.arg_slot(0) as *mut Id, receiver);
            ptr::write_unaligned(frame.arg_slot(1) as *mut *const c_void, sel);
            frame.invoke(imp);
            Ok(ptr::read_unaligned(frame.ret_slot() as *const Id))
        }
    }

    // ===== Other native values =====

    /// A callable native function
    pub fn function_value(
        &self,
        address: usize,
        signature: Signature,
        owns_returned: bool,
        returns_unmanaged: bool,
    ) -> ScriptValue {
        let call_signature = signature.clone();
        let object = ObjectBuilder::new()
            .call(Rc::new(move |ctx, _this, args| {
                let mut call = NativeCall::function(address as *const c_void, &call_signature);
                call.owns_returned = owns_returned;
                call_native(ctx, &call, args)
            }))
            .wrapper(Wrapper::Function(FunctionWrapper {
                address,
                signature,
                owns_returned,
                returns_unmanaged,
            }))
            .build();
        self.0.heap.register(&object);
        ScriptValue::Object(object)
    }

    /// A callable native block
    pub fn block_value(&self, address: usize, signature: Signature) -> ScriptValue {
        let call_signature = signature.clone();
        let object = ObjectBuilder::new()
            .call(Rc::new(move |ctx, _this, args| {
                let invoke = unsafe { block_invoke(address as *const c_void) };
                let implicit = [address as *const c_void];
                let call = NativeCall {
                    address: invoke,
                    signature: &call_signature,
                    implicit: &implicit,
                    owns_returned: false,
                    error_out: false,
                };
                call_native(ctx, &call, args)
            }))
            .wrapper(Wrapper::Block(BlockWrapper {
                address,
                signature,
                script: None,
            }))
            .build();
        self.0.heap.register(&object);
        ScriptValue::Object(object)
    }

    /// The pointer object for `address`, one per address while alive
    pub fn pointer_value(&self, address: usize) -> ScriptValue {
        if let Some(existing) = self.0.caches.pointer(address) {
            return ScriptValue::Object(existing);
        }
        let object = ObjectBuilder::new()
            .prototype(Some(interop::pointer_prototype(self)))
            .wrapper(Wrapper::Pointer(PointerWrapper {
                address,
                adopted: false,
            }))
            .build();
        self.0.caches.insert_pointer(address, &object);
        self.0.heap.register(&object);
        ScriptValue::Object(object)
    }

    /// A typed reference to memory owned elsewhere
    pub fn reference_value(
        &self,
        encoding: &TypeEncoding,
        address: usize,
    ) -> ScriptResult<ScriptValue> {
        let abi = self.abi_type(encoding, Position::Field)?;
        let object = interop::new_reference(
            self,
            ReferenceWrapper {
                encoding: Some(encoding.clone()),
                abi: Some(abi),
                storage: ReferenceStorage::Borrowed(address),
                pending: ScriptValue::Undefined,
                keep: KeepAlive::default(),
            },
        );
        Ok(ScriptValue::Object(object))
    }

    /// A struct value of type `info`
    pub fn struct_value(
        &self,
        info: Rc<StructInfo>,
        storage: StructStorage,
    ) -> ScriptResult<ScriptValue> {
        let constructor = interop::struct_type(self, &info);
        let object = ObjectBuilder::new()
            .prototype(prototype_of(&constructor))
            .wrapper(Wrapper::Struct(StructWrapper { info, storage }))
            .build();
        self.0.heap.register(&object);
        Ok(ScriptValue::Object(object))
    }

    // ===== Workers =====

    /// Start a worker running `entry` and return its script object
    pub fn spawn_worker<F>(&self, entry: F) -> ScriptResult<ScriptValue>
    where
        F: FnOnce(WorkerScope) + Send + 'static,
    {
        let state = WorkerRegistry::global()
            .spawn(entry)
            .map_err(|e| ScriptError::Error(format!("Cannot start worker: {}", e)))?;
        let object = ObjectBuilder::new()
            .prototype(Some(worker_prototype(self)))
            .wrapper(Wrapper::Worker(state))
            .build();
        self.0.heap.register(&object);
        Ok(ScriptValue::Object(object))
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("store", &self.0.store)
            .field("heap", &self.0.heap.stats())
            .field("call_depth", &self.0.call_depth.get())
            .finish()
    }
}

// ============================================================================
// Constructors and members
// ============================================================================

/// `constructor.prototype`
pub(crate) fn prototype_of(constructor: &ObjectRef) -> Option<ObjectRef> {
    constructor
        .own_value("prototype")
        .and_then(|p| p.as_object().cloned())
}

fn method_function(meta: Arc<Meta>, js_name: &str, is_static: bool) -> ScriptValue {
    let js_name = js_name.to_string();
    ScriptValue::Object(ScriptObject::function(move |ctx, this, args| {
        ctx.call_method(&meta, this, &js_name, is_static, args)
    }))
}

fn accessor_getter(getter: Arc<MethodMeta>) -> crate::script::NativeFunction {
    Rc::new(move |ctx, this, _args| ctx.send(this, &getter, &[]))
}

fn accessor_setter(setter: Arc<MethodMeta>) -> crate::script::NativeFunction {
    Rc::new(move |ctx, this, args| {
        let value = args.first().cloned().unwrap_or_default();
        ctx.send(this, &setter, &[value]).map(|_| ScriptValue::Undefined)
    })
}

/// `new C(...args)` for native class constructors: `alloc`, then the
/// initializer matching the argument count
fn construct_instance(
    ctx: &ExecutionContext,
    constructor: &ScriptValue,
    args: &[ScriptValue],
) -> ScriptResult<ScriptValue> {
    let object = constructor
        .as_object()
        .ok_or(BridgeError::InvalidReceiver("class constructor"))?;
    let class = ctx.class_pointer(object)?;
    let meta = ctx.class_meta(object)?;

    let initializer = meta.and_then(|meta| {
        ctx.store()
            .ancestry(meta)
            .into_iter()
            .filter_map(|m| {
                m.as_class()
                    .filter(|c| !c.is_protocol())
                    .map(|c| c.initializers().to_vec())
            })
            .flatten()
            .find(|m| {
                m.arity() == args.len()
                    || (m.has_error_out_parameter() && m.arity() == args.len() + 1)
            })
    });

    let instance = ctx.send_raw(class, "alloc")?;
    if instance.is_null() {
        return Ok(ScriptValue::Null);
    }

    match initializer {
        Some(initializer) => {
            let runtime = ctx.runtime();
            let selector = runtime.register_selector(initializer.selector());
            let dispatch = runtime.class_of(instance);
            let Some(imp) = runtime.lookup_imp(dispatch, selector) else {
                runtime.release(instance);
                return Err(BridgeError::UnrecognizedSelector {
                    selector: initializer.selector().to_string(),
                    class: runtime.class_name(dispatch),
                }
                .into());
            };
            let implicit = [instance as *const c_void, selector];
            let call = NativeCall {
                address: imp,
                signature: &initializer.encodings,
                implicit: &implicit,
                owns_returned: true,
                error_out: initializer.has_error_out_parameter(),
            };
            call_native(ctx, &call, args)
        }
        None if args.is_empty() => {
            let initialized = ctx.send_raw(instance, "init")?;
            ctx.wrap_native_object(initialized, true)
        }
        None => {
            ctx.runtime().release(instance);
            Err(ScriptError::type_error(
                "No initializer found that matches constructor invocation.",
            ))
        }
    }
}

fn worker_prototype(ctx: &ExecutionContext) -> ObjectRef {
    if let Some(prototype) = ctx.caches().prototype("Worker") {
        return prototype;
    }
    let prototype = ScriptObject::new();
    prototype.set_value(
        "postMessage",
        ScriptValue::Object(ScriptObject::function(|_ctx, this, args| {
            let state = worker_state(this)?;
            let message = worker::to_message(&args.first().cloned().unwrap_or_default());
            Ok(ScriptValue::Bool(state.post_message(message)))
        })),
    );
    prototype.set_value(
        "receiveMessage",
        ScriptValue::Object(ScriptObject::function(|_ctx, this, _args| {
            let state = worker_state(this)?;
            Ok(state
                .receive_message(Duration::from_millis(DEFAULT_WORKER_QUEUE_WAIT_MS))
                .map(|message| worker::from_message(&message))
                .unwrap_or_default())
        })),
    );
    prototype.set_value(
        "terminate",
        ScriptValue::Object(ScriptObject::function(|_ctx, this, _args| {
            worker_state(this)?.terminate();
            Ok(ScriptValue::Undefined)
        })),
    );
    prototype.define_accessor(
        "isRunning",
        Some(Rc::new(|_ctx, this, _args| Ok(ScriptValue::Bool(worker_state(this)?.is_running())))),
        None,
    );
    ctx.caches().insert_prototype("Worker", prototype.clone());
    prototype
}

fn worker_state(this: &ScriptValue) -> ScriptResult<Arc<worker::WorkerState>> {
    let cell = this
        .as_object()
        .and_then(|o| o.wrapper())
        .ok_or(BridgeError::InvalidReceiver("Worker"))?;
    let wrapper = cell.get()?;
    match &*wrapper {
        Wrapper::Worker(state) => Ok(state.clone()),
        _ => Err(BridgeError::InvalidReceiver("Worker").into()),
    }
}
