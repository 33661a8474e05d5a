//! Per-context caches
//!
//! Everything here is owned by one execution context and never shared
//! across threads, so plain `RefCell`s suffice.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tether_meta::{MetadataStore, TypeEncoding, TypeKind};

use crate::error::{BridgeError, BridgeResult};
use crate::ffi::{
    layout_key, AbiType, CallLayout, LayoutKey, Position, Signature, StructCache, StructInfo,
};
use crate::options::BridgeOptions;
use crate::script::{ObjectRef, ScriptObject, ScriptValue};

#[derive(Default)]
pub struct Caches {
    structs: StructCache,
    layouts: RefCell<FxHashMap<LayoutKey, Rc<CallLayout>>>,
    signatures: RefCell<FxHashMap<Vec<TypeEncoding>, Signature>>,
    /// Class constructors by native class pointer
    classes: RefCell<FxHashMap<usize, ObjectRef>>,
    protocols: RefCell<FxHashMap<usize, ObjectRef>>,
    /// Struct constructors by structural name
    struct_types: RefCell<FxHashMap<String, ObjectRef>>,
    pointers: RefCell<FxHashMap<usize, Weak<ScriptObject>>>,
    globals: RefCell<FxHashMap<String, ScriptValue>>,
    /// Shared prototypes of the interop types
    prototypes: RefCell<FxHashMap<&'static str, ObjectRef>>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Types and layouts =====

    pub fn abi_type(
        &self,
        store: &MetadataStore,
        encoding: &TypeEncoding,
        position: Position,
    ) -> BridgeResult<AbiType> {
        self.structs.abi_type(store, encoding, position)
    }

    pub fn struct_info(
        &self,
        store: &MetadataStore,
        encoding: &TypeEncoding,
    ) -> BridgeResult<Rc<StructInfo>> {
        self.structs.struct_info(store, encoding)
    }

    /// Shared signature for an encoding list, so equal lists share a layout
    pub fn signature(&self, encodings: &[TypeEncoding]) -> Signature {
        if let Some(signature) = self.signatures.borrow().get(encodings) {
            return signature.clone();
        }
        let signature: Signature = Arc::from(encodings);
        self.signatures
            .borrow_mut()
            .insert(encodings.to_vec(), signature.clone());
        signature
    }

    /// Call layout for `signature` with `implicit` leading pointer parameters
    pub fn layout(
        &self,
        store: &MetadataStore,
        options: &BridgeOptions,
        signature: &Signature,
        implicit: usize,
    ) -> BridgeResult<Rc<CallLayout>> {
        let key = layout_key(signature, implicit);
        if let Some(layout) = self.layouts.borrow().get(&key) {
            return Ok(layout.clone());
        }

        let (ret, params) = match signature.split_first() {
            Some((ret, params)) => (self.abi_type(store, ret, Position::Parameter)?, params),
            None => (AbiType::Void, &[][..]),
        };
        let mut abis = vec![AbiType::Pointer; implicit];
        for param in params {
            if matches!(param, TypeEncoding::Void) {
                return Err(BridgeError::UnsupportedEncoding(TypeKind::Void));
            }
            abis.push(self.abi_type(store, param, Position::Parameter)?);
        }
        let layout = Rc::new(CallLayout::new(
            signature.clone(),
            implicit,
            abis,
            ret,
            options.struct_passing,
        ));
        self.layouts.borrow_mut().insert(key, layout.clone());
        Ok(layout)
    }

    // ===== Constructors =====

    pub fn class_constructor(&self, class: usize) -> Option<ObjectRef> {
        self.classes.borrow().get(&class).cloned()
    }

    pub fn insert_class_constructor(&self, class: usize, constructor: ObjectRef) {
        self.classes.borrow_mut().insert(class, constructor);
    }

    pub fn protocol_object(&self, protocol: usize) -> Option<ObjectRef> {
        self.protocols.borrow().get(&protocol).cloned()
    }

    pub fn insert_protocol_object(&self, protocol: usize, object: ObjectRef) {
        self.protocols.borrow_mut().insert(protocol, object);
    }

    pub fn struct_type(&self, name: &str) -> Option<ObjectRef> {
        self.struct_types.borrow().get(name).cloned()
    }

    pub fn insert_struct_type(&self, name: &str, constructor: ObjectRef) {
        self.struct_types
            .borrow_mut()
            .insert(name.to_string(), constructor);
    }

    // ===== Pointers =====

    pub fn pointer(&self, address: usize) -> Option<ObjectRef> {
        self.pointers.borrow().get(&address).and_then(Weak::upgrade)
    }

    pub fn insert_pointer(&self, address: usize, object: &ObjectRef) {
        self.pointers
            .borrow_mut()
            .insert(address, Rc::downgrade(object));
    }

    /// Drop the cache entry of a disposed pointer object
    pub fn forget_pointer(&self, address: usize, handle: &Weak<ScriptObject>) {
        let mut pointers = self.pointers.borrow_mut();
        if pointers
            .get(&address)
            .is_some_and(|current| Weak::ptr_eq(current, handle))
        {
            pointers.remove(&address);
        }
    }

    // ===== Globals =====

    pub fn global(&self, name: &str) -> Option<ScriptValue> {
        self.globals.borrow().get(name).cloned()
    }

    pub fn insert_global(&self, name: &str, value: ScriptValue) {
        self.globals.borrow_mut().insert(name.to_string(), value);
    }

    pub fn prototype(&self, name: &'static str) -> Option<ObjectRef> {
        self.prototypes.borrow().get(name).cloned()
    }

    pub fn insert_prototype(&self, name: &'static str, prototype: ObjectRef) {
        self.prototypes.borrow_mut().insert(name, prototype);
    }

    pub fn layout_count(&self) -> usize {
        self.layouts.borrow().len()
    }
}
