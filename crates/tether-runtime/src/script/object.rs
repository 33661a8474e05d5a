//! Script objects

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use super::{ScriptResult, ScriptValue};
use crate::context::ExecutionContext;
use crate::wrapper::{Wrapper, WrapperCell};

pub type ObjectRef = Rc<ScriptObject>;

/// Host function callable from script: `(context, this, arguments)`
pub type NativeFunction =
    Rc<dyn Fn(&ExecutionContext, &ScriptValue, &[ScriptValue]) -> ScriptResult<ScriptValue>>;

/// An own property slot
#[derive(Clone)]
pub enum Property {
    Value(ScriptValue),
    Accessor {
        getter: Option<NativeFunction>,
        setter: Option<NativeFunction>,
    },
}

/// A script object
///
/// Each object carries at most one wrapper. A super view aliases the native
/// object of another wrapper and never releases it.
pub struct ScriptObject {
    properties: RefCell<FxHashMap<String, Property>>,
    prototype: RefCell<Option<ObjectRef>>,
    call: Option<NativeFunction>,
    construct: Option<NativeFunction>,
    elements: Option<RefCell<Vec<ScriptValue>>>,
    wrapper: RefCell<Option<Rc<WrapperCell>>>,
    is_super: bool,
}

/// Builder for objects with behaviour
#[derive(Default)]
pub struct ObjectBuilder {
    prototype: Option<ObjectRef>,
    call: Option<NativeFunction>,
    construct: Option<NativeFunction>,
    elements: Option<Vec<ScriptValue>>,
    wrapper: Option<Wrapper>,
    is_super: bool,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prototype(mut self, prototype: Option<ObjectRef>) -> Self {
        self.prototype = prototype;
        self
    }

    pub fn call(mut self, call: NativeFunction) -> Self {
        self.call = Some(call);
        self
    }

    pub fn construct(mut self, construct: NativeFunction) -> Self {
        self.construct = Some(construct);
        self
    }

    pub fn elements(mut self, elements: Vec<ScriptValue>) -> Self {
        self.elements = Some(elements);
        self
    }

    pub fn wrapper(mut self, wrapper: Wrapper) -> Self {
        self.wrapper = Some(wrapper);
        self
    }

    pub fn super_view(mut self) -> Self {
        self.is_super = true;
        self
    }

    pub fn build(self) -> ObjectRef {
        Rc::new(ScriptObject {
            properties: RefCell::new(FxHashMap::default()),
            prototype: RefCell::new(self.prototype),
            call: self.call,
            construct: self.construct,
            elements: self.elements.map(RefCell::new),
            wrapper: RefCell::new(self.wrapper.map(|w| Rc::new(WrapperCell::new(w)))),
            is_super: self.is_super,
        })
    }
}

impl ScriptObject {
    /// A plain object
    pub fn new() -> ObjectRef {
        ObjectBuilder::new().build()
    }

    pub fn with_prototype(prototype: ObjectRef) -> ObjectRef {
        ObjectBuilder::new().prototype(Some(prototype)).build()
    }

    /// A function object
    pub fn function<F>(function: F) -> ObjectRef
    where
        F: Fn(&ExecutionContext, &ScriptValue, &[ScriptValue]) -> ScriptResult<ScriptValue> + 'static,
    {
        ObjectBuilder::new().call(Rc::new(function)).build()
    }

    /// An array object
    pub fn array(elements: Vec<ScriptValue>) -> ObjectRef {
        ObjectBuilder::new().elements(elements).build()
    }

    /// A plain object holding the given data properties
    pub fn from_entries<I, K>(entries: I) -> ObjectRef
    where
        I: IntoIterator<Item = (K, ScriptValue)>,
        K: Into<String>,
    {
        let object = Self::new();
        for (key, value) in entries {
            object.set_value(key, value);
        }
        object
    }

    // ===== Properties =====

    /// Own property
    pub fn get_own(&self, name: &str) -> Option<Property> {
        self.properties.borrow().get(name).cloned()
    }

    /// Own or inherited property
    pub fn find_property(&self, name: &str) -> Option<Property> {
        if let Some(property) = self.get_own(name) {
            return Some(property);
        }
        let mut current = self.prototype();
        while let Some(object) = current {
            if let Some(property) = object.get_own(name) {
                return Some(property);
            }
            current = object.prototype();
        }
        None
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.properties.borrow().contains_key(name)
    }

    /// Define or overwrite an own data property
    pub fn set_value(&self, name: impl Into<String>, value: ScriptValue) {
        self.properties
            .borrow_mut()
            .insert(name.into(), Property::Value(value));
    }

    pub fn define_accessor(
        &self,
        name: impl Into<String>,
        getter: Option<NativeFunction>,
        setter: Option<NativeFunction>,
    ) {
        self.properties
            .borrow_mut()
            .insert(name.into(), Property::Accessor { getter, setter });
    }

    /// Own data value, ignoring accessors
    pub fn own_value(&self, name: &str) -> Option<ScriptValue> {
        match self.properties.borrow().get(name) {
            Some(Property::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Own property names, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.properties.borrow().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn prototype(&self) -> Option<ObjectRef> {
        self.prototype.borrow().clone()
    }

    pub fn set_prototype(&self, prototype: Option<ObjectRef>) {
        *self.prototype.borrow_mut() = prototype;
    }

    // ===== Behaviour =====

    pub fn is_callable(&self) -> bool {
        self.call.is_some()
    }

    pub fn is_constructor(&self) -> bool {
        self.construct.is_some()
    }

    pub fn callable(&self) -> Option<NativeFunction> {
        self.call.clone()
    }

    pub fn constructor(&self) -> Option<NativeFunction> {
        self.construct.clone()
    }

    pub fn is_array(&self) -> bool {
        self.elements.is_some()
    }

    /// Array elements; empty for non-arrays
    pub fn elements(&self) -> Vec<ScriptValue> {
        self.elements
            .as_ref()
            .map(|e| e.borrow().clone())
            .unwrap_or_default()
    }

    // ===== Wrapper =====

    pub fn wrapper(&self) -> Option<Rc<WrapperCell>> {
        self.wrapper.borrow().clone()
    }

    /// Attach a wrapper. Returns the new cell.
    pub fn set_wrapper(&self, wrapper: Wrapper) -> Rc<WrapperCell> {
        let cell = Rc::new(WrapperCell::new(wrapper));
        *self.wrapper.borrow_mut() = Some(cell.clone());
        cell
    }

    pub fn is_super(&self) -> bool {
        self.is_super
    }
}

impl fmt::Debug for ScriptObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ScriptObject");
        debug.field("address", &(self as *const Self));
        if let Some(cell) = self.wrapper.borrow().as_ref() {
            debug.field("wrapper", &cell.kind());
        }
        debug.field("keys", &self.keys()).finish()
    }
}
