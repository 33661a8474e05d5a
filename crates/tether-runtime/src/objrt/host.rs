//! In-process object runtime
//!
//! Objects start with a `#[repr(C)]` header holding the isa pointer and an
//! atomic retain count. Class objects carry the same header, pointing at
//! their metaclass, so class methods dispatch like instance methods. Classes
//! are never freed.

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::{Class, Id, Imp, ObjectRuntime, Protocol, Sel};

static STATE: Lazy<HostState> = Lazy::new(HostState::bootstrap);

thread_local! {
    static AUTORELEASE_POOL: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

#[repr(C)]
struct ObjectHeader {
    isa: *const ClassData,
    retain_count: AtomicUsize,
}

enum Payload {
    Empty,
    String { value: String, c_value: CString },
    Error(String),
}

#[repr(C)]
struct HostObject {
    header: ObjectHeader,
    payload: Payload,
}

struct MethodEntry {
    imp: usize,
    types: String,
}

#[repr(C)]
struct ClassData {
    header: ObjectHeader,
    superclass: *const ClassData,
    name: String,
    is_meta: bool,
    methods: RwLock<FxHashMap<usize, MethodEntry>>,
    protocols: RwLock<Vec<usize>>,
    registered: AtomicBool,
}

struct ProtocolData {
    name: String,
}

struct HostState {
    /// Every allocated class, registered or not
    classes: DashMap<String, usize>,
    selectors: Mutex<FxHashMap<String, usize>>,
    protocols: DashMap<String, usize>,
    root_meta: usize,
    string_class: usize,
    error_class: usize,
}

impl HostState {
    fn bootstrap() -> Self {
        let mut state = HostState {
            classes: DashMap::new(),
            selectors: Mutex::new(FxHashMap::default()),
            protocols: DashMap::new(),
            root_meta: 0,
            string_class: 0,
            error_class: 0,
        };

        let root = state.allocate(ptr::null(), "NSObject");
        let (root, root_meta) = match root {
            Some(root) => (root, unsafe { (*root).header.isa as *mut ClassData }),
            None => unreachable!("class table starts empty"),
        };
        // The root metaclass inherits from the root class.
        unsafe {
            (*root_meta).superclass = root;
        }
        state.root_meta = root_meta as usize;

        state.add(root_meta, "alloc", object_alloc as Imp, "@@:");
        state.add(root_meta, "new", object_new as Imp, "@@:");
        state.add(root, "init", object_init as Imp, "@@:");
        state.add(root, "description", object_description as Imp, "@@:");
        state.add(root, "retainCount", object_retain_count as Imp, "Q@:");
        state.register(root);

        if let Some(string) = state.allocate(root, "NSString") {
            let meta = unsafe { (*string).header.isa as *mut ClassData };
            state.add(meta, "stringWithUTF8String:", string_with_utf8 as Imp, "@@:*");
            state.add(string, "length", string_length as Imp, "Q@:");
            state.add(string, "UTF8String", string_utf8 as Imp, "*@:");
            state.register(string);
            state.string_class = string as usize;
        }

        if let Some(error) = state.allocate(root, "NSError") {
            let meta = unsafe { (*error).header.isa as *mut ClassData };
            state.add(meta, "errorWithDescription:", error_with_description as Imp, "@@:@");
            state.add(error, "localizedDescription", error_localized_description as Imp, "@@:");
            state.register(error);
            state.error_class = error as usize;
        }

        log::debug!("host runtime bootstrapped with {} classes", state.classes.len());
        state
    }

    fn allocate(&self, superclass: *const ClassData, name: &str) -> Option<*mut ClassData> {
        let entry = match self.classes.entry(name.to_string()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(entry) => entry,
        };

        let super_meta = if superclass.is_null() {
            ptr::null()
        } else {
            unsafe { (*superclass).header.isa }
        };
        let meta = Box::into_raw(Box::new(ClassData::new(
            self.root_meta as *const ClassData,
            super_meta,
            name,
            true,
        )));
        if self.root_meta == 0 {
            // Root metaclass is its own class.
            unsafe {
                (*meta).header.isa = meta;
            }
        }
        let class = Box::into_raw(Box::new(ClassData::new(meta, superclass, name, false)));
        entry.insert(class as usize);
        Some(class)
    }

    fn add(&self, class: *mut ClassData, selector: &str, imp: Imp, types: &str) {
        let sel = self.selector(selector);
        unsafe { &*class }.methods.write().insert(
            sel as usize,
            MethodEntry {
                imp: imp as usize,
                types: types.to_string(),
            },
        );
    }

    fn register(&self, class: *mut ClassData) {
        unsafe { &*class }.registered.store(true, Ordering::Release);
    }

    fn selector(&self, name: &str) -> Sel {
        let mut selectors = self.selectors.lock();
        if let Some(&sel) = selectors.get(name) {
            return sel as Sel;
        }
        let sel = CString::new(name).unwrap_or_default().into_raw() as usize;
        selectors.insert(name.to_string(), sel);
        sel as Sel
    }
}

impl ClassData {
    fn new(isa: *const ClassData, superclass: *const ClassData, name: &str, is_meta: bool) -> Self {
        ClassData {
            header: ObjectHeader {
                isa,
                retain_count: AtomicUsize::new(1),
            },
            superclass,
            name: name.to_string(),
            is_meta,
            methods: RwLock::new(FxHashMap::default()),
            protocols: RwLock::new(Vec::new()),
            registered: AtomicBool::new(false),
        }
    }
}

fn class_data<'a>(class: Class) -> &'a ClassData {
    unsafe { &*(class as *const ClassData) }
}

fn header<'a>(object: Id) -> &'a ObjectHeader {
    unsafe { &*(object as *const ObjectHeader) }
}

/// Handle to the process-wide in-process runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRuntime;

impl HostRuntime {
    pub fn new() -> Self {
        Lazy::force(&STATE);
        HostRuntime
    }

    /// Allocate and register a class in one step
    pub fn define_class(&self, name: &str, superclass: Class) -> Option<Class> {
        let class = self.allocate_class_pair(superclass, name)?;
        self.register_class_pair(class);
        Some(class)
    }

    /// Create a protocol, or return the existing one
    pub fn register_protocol(&self, name: &str) -> Protocol {
        *STATE
            .protocols
            .entry(name.to_string())
            .or_insert_with(|| {
                Box::into_raw(Box::new(ProtocolData {
                    name: name.to_string(),
                })) as usize
            }) as Protocol
    }

    /// Native type string recorded for a method of `class` itself
    pub fn method_types(&self, class: Class, selector: Sel) -> Option<String> {
        class_data(class)
            .methods
            .read()
            .get(&(selector as usize))
            .map(|m| m.types.clone())
    }

    fn payload<'a>(&self, object: Id) -> Option<&'a Payload> {
        if object.is_null() || self.is_class(object) {
            return None;
        }
        Some(unsafe { &(*(object as *const HostObject)).payload })
    }

    fn new_object(&self, class: usize, payload: Payload) -> Id {
        Box::into_raw(Box::new(HostObject {
            header: ObjectHeader {
                isa: class as *const ClassData,
                retain_count: AtomicUsize::new(1),
            },
            payload,
        })) as Id
    }
}

impl ObjectRuntime for HostRuntime {
    fn get_class(&self, name: &str) -> Option<Class> {
        let class = *STATE.classes.get(name)?;
        class_data(class as Class)
            .registered
            .load(Ordering::Acquire)
            .then_some(class as Class)
    }

    fn class_of(&self, object: Id) -> Class {
        if object.is_null() {
            return ptr::null_mut();
        }
        header(object).isa as Class
    }

    fn superclass(&self, class: Class) -> Option<Class> {
        let superclass = class_data(class).superclass;
        (!superclass.is_null()).then_some(superclass as Class)
    }

    fn class_name(&self, class: Class) -> String {
        if class.is_null() {
            return "nil".to_string();
        }
        class_data(class).name.clone()
    }

    fn is_class(&self, object: Id) -> bool {
        !object.is_null() && unsafe { (*header(object).isa).is_meta }
    }

    fn register_selector(&self, name: &str) -> Sel {
        STATE.selector(name)
    }

    fn selector_name(&self, selector: Sel) -> String {
        if selector.is_null() {
            return String::new();
        }
        unsafe { CStr::from_ptr(selector as *const c_char) }
            .to_string_lossy()
            .into_owned()
    }

    fn lookup_imp(&self, class: Class, selector: Sel) -> Option<Imp> {
        let mut current = class as *const ClassData;
        while !current.is_null() {
            let data = unsafe { &*current };
            if let Some(entry) = data.methods.read().get(&(selector as usize)) {
                return Some(entry.imp as Imp);
            }
            current = data.superclass;
        }
        None
    }

    fn lookup_super_imp(&self, class: Class, selector: Sel) -> Option<Imp> {
        let superclass = self.superclass(class)?;
        self.lookup_imp(superclass, selector)
    }

    fn allocate_class_pair(&self, superclass: Class, name: &str) -> Option<Class> {
        STATE
            .allocate(superclass as *const ClassData, name)
            .map(|class| class as Class)
    }

    fn add_method(&self, class: Class, selector: Sel, imp: Imp, types: &str) -> bool {
        let mut methods = class_data(class).methods.write();
        if methods.contains_key(&(selector as usize)) {
            return false;
        }
        methods.insert(
            selector as usize,
            MethodEntry {
                imp: imp as usize,
                types: types.to_string(),
            },
        );
        true
    }

    fn register_class_pair(&self, class: Class) {
        STATE.register(class as *mut ClassData);
    }

    fn allocation_is_atomic(&self) -> bool {
        true
    }

    fn get_protocol(&self, name: &str) -> Option<Protocol> {
        STATE.protocols.get(name).map(|p| *p as Protocol)
    }

    fn protocol_name(&self, protocol: Protocol) -> String {
        unsafe { &*(protocol as *const ProtocolData) }.name.clone()
    }

    fn add_protocol(&self, class: Class, protocol: Protocol) -> bool {
        let mut protocols = class_data(class).protocols.write();
        if protocols.contains(&(protocol as usize)) {
            return false;
        }
        protocols.push(protocol as usize);
        true
    }

    fn conforms_to(&self, class: Class, protocol: Protocol) -> bool {
        let mut current = class as *const ClassData;
        while !current.is_null() {
            let data = unsafe { &*current };
            if data.protocols.read().contains(&(protocol as usize)) {
                return true;
            }
            current = data.superclass;
        }
        false
    }

    fn create_instance(&self, class: Class) -> Id {
        self.new_object(class as usize, Payload::Empty)
    }

    fn retain(&self, object: Id) -> Id {
        if !object.is_null() && !self.is_class(object) {
            header(object).retain_count.fetch_add(1, Ordering::Relaxed);
        }
        object
    }

    fn release(&self, object: Id) {
        if object.is_null() || self.is_class(object) {
            return;
        }
        if header(object).retain_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            drop(unsafe { Box::from_raw(object as *mut HostObject) });
        }
    }

    fn retain_count(&self, object: Id) -> usize {
        if object.is_null() {
            return 0;
        }
        header(object).retain_count.load(Ordering::Relaxed)
    }

    fn autorelease(&self, object: Id) -> Id {
        if !object.is_null() {
            AUTORELEASE_POOL.with(|pool| pool.borrow_mut().push(object as usize));
        }
        object
    }

    fn drain_autorelease_pool(&self) {
        let pending = AUTORELEASE_POOL.with(|pool| std::mem::take(&mut *pool.borrow_mut()));
        for object in pending {
            self.release(object as Id);
        }
    }

    fn new_string(&self, value: &str) -> Id {
        let c_value = CString::new(value.replace('\0', "")).unwrap_or_default();
        self.new_object(
            STATE.string_class,
            Payload::String {
                value: value.to_string(),
                c_value,
            },
        )
    }

    fn string_value(&self, object: Id) -> Option<String> {
        match self.payload(object)? {
            Payload::String { value, .. } => Some(value.clone()),
            _ => None,
        }
    }

    fn new_error(&self, description: &str) -> Id {
        self.new_object(STATE.error_class, Payload::Error(description.to_string()))
    }

    fn describe(&self, object: Id) -> String {
        if object.is_null() {
            return "nil".to_string();
        }
        if self.is_class(object) {
            return self.class_name(object);
        }
        match self.payload(object) {
            Some(Payload::String { value, .. }) => value.clone(),
            Some(Payload::Error(description)) => description.clone(),
            _ => format!("<{}: {:p}>", self.class_name(self.class_of(object)), object),
        }
    }
}

// ============================================================================
// Built-in method implementations
// ============================================================================

unsafe extern "C" fn object_alloc(class: Id, _cmd: Sel) -> Id {
    HostRuntime.create_instance(class)
}

unsafe extern "C" fn object_new(class: Id, _cmd: Sel) -> Id {
    HostRuntime.create_instance(class)
}

unsafe extern "C" fn object_init(this: Id, _cmd: Sel) -> Id {
    this
}

unsafe extern "C" fn object_description(this: Id, _cmd: Sel) -> Id {
    let runtime = HostRuntime;
    runtime.autorelease(runtime.new_string(&runtime.describe(this)))
}

unsafe extern "C" fn object_retain_count(this: Id, _cmd: Sel) -> usize {
    HostRuntime.retain_count(this)
}

unsafe extern "C" fn string_with_utf8(_class: Id, _cmd: Sel, value: *const c_char) -> Id {
    if value.is_null() {
        return ptr::null_mut();
    }
    let value = unsafe { CStr::from_ptr(value) }.to_string_lossy();
    let runtime = HostRuntime;
    runtime.autorelease(runtime.new_string(&value))
}

unsafe extern "C" fn string_length(this: Id, _cmd: Sel) -> usize {
    match HostRuntime.payload(this) {
        Some(Payload::String { value, .. }) => value.encode_utf16().count(),
        _ => 0,
    }
}

unsafe extern "C" fn string_utf8(this: Id, _cmd: Sel) -> *const c_char {
    match HostRuntime.payload(this) {
        Some(Payload::String { c_value, .. }) => c_value.as_ptr(),
        _ => ptr::null(),
    }
}

unsafe extern "C" fn error_with_description(_class: Id, _cmd: Sel, description: Id) -> Id {
    let runtime = HostRuntime;
    let description = runtime.describe(description);
    runtime.autorelease(runtime.new_error(&description))
}

unsafe extern "C" fn error_localized_description(this: Id, _cmd: Sel) -> Id {
    let runtime = HostRuntime;
    runtime.autorelease(runtime.new_string(&runtime.describe(this)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_classes() {
        let runtime = HostRuntime::new();
        let object = runtime.get_class("NSObject").unwrap();
        let string = runtime.get_class("NSString").unwrap();
        assert_eq!(runtime.superclass(string), Some(object));
        assert_eq!(runtime.class_name(string), "NSString");
        assert!(runtime.is_class(string));

        let alloc = runtime.register_selector("alloc");
        let meta = runtime.class_of(string);
        assert!(runtime.lookup_imp(meta, alloc).is_some());
        assert!(runtime.lookup_imp(string, alloc).is_none());
    }

    #[test]
    fn test_super_lookup_skips_own_methods() {
        let runtime = HostRuntime::new();
        let root = runtime.get_class("NSObject").unwrap();
        let base = runtime.allocate_class_pair(root, "SuperLookupBase").unwrap();
        let derived = runtime.allocate_class_pair(base, "SuperLookupDerived").unwrap();
        let selector = runtime.register_selector("superLookupValue");
        let base_imp = 0x1000 as Imp;
        let derived_imp = 0x2000 as Imp;
        assert!(runtime.add_method(base, selector, base_imp, "i@:"));
        assert!(runtime.add_method(derived, selector, derived_imp, "i@:"));

        assert_eq!(runtime.lookup_imp(derived, selector), Some(derived_imp));
        assert_eq!(runtime.lookup_super_imp(derived, selector), Some(base_imp));
        assert_eq!(runtime.lookup_super_imp(base, selector), None);
        assert_eq!(runtime.lookup_super_imp(root, selector), None);
    }

    #[test]
    fn test_selectors_are_interned() {
        let runtime = HostRuntime::new();
        let a = runtime.register_selector("initWithFrame:");
        let b = runtime.register_selector("initWithFrame:");
        assert_eq!(a, b);
        assert_eq!(runtime.selector_name(a), "initWithFrame:");
    }

    #[test]
    fn test_retain_release() {
        let runtime = HostRuntime::new();
        let string = runtime.new_string("hello");
        assert_eq!(runtime.retain_count(string), 1);
        runtime.retain(string);
        assert_eq!(runtime.retain_count(string), 2);
        runtime.release(string);
        assert_eq!(runtime.string_value(string).as_deref(), Some("hello"));
        runtime.release(string);
    }

    #[test]
    fn test_class_pair_collision() {
        let runtime = HostRuntime::new();
        let root = runtime.get_class("NSObject").unwrap();
        let first = runtime.allocate_class_pair(root, "HostCollision").unwrap();
        assert!(runtime.allocate_class_pair(root, "HostCollision").is_none());
        assert!(runtime.get_class("HostCollision").is_none());
        runtime.register_class_pair(first);
        assert_eq!(runtime.get_class("HostCollision"), Some(first));
    }

    #[test]
    fn test_protocol_conformance() {
        let runtime = HostRuntime::new();
        let root = runtime.get_class("NSObject").unwrap();
        let class = runtime.define_class("HostConforming", root).unwrap();
        let protocol = runtime.register_protocol("HostDelegate");
        assert!(!runtime.conforms_to(class, protocol));
        assert!(runtime.add_protocol(class, protocol));
        assert!(runtime.conforms_to(class, protocol));
        assert_eq!(runtime.protocol_name(protocol), "HostDelegate");
    }

    #[test]
    fn test_describe() {
        let runtime = HostRuntime::new();
        let error = runtime.new_error("The operation couldn't be completed.");
        assert_eq!(runtime.describe(error), "The operation couldn't be completed.");
        runtime.release(error);
        assert_eq!(runtime.describe(ptr::null_mut()), "nil");
    }
}
