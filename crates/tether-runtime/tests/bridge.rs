//! End-to-end tests: metadata, native functions and classes of the host
//! runtime, driven through an execution context

use std::cell::Cell;
use std::ffi::c_void;
use std::io::Write;
use std::sync::Arc;

use once_cell::sync::Lazy;

use tether_meta::decl::{
    DeclCommon, EnumDecl, EnumMemberDecl, FieldDecl, FunctionDecl, InterfaceDecl, MethodDecl,
    RecordDecl,
};
use tether_meta::{
    BinarySerializer, DeclType, Declaration, DeclarationGraph, MetadataStore, ModuleDecl,
};
use tether_runtime::interop::is_struct_of;
use tether_runtime::objrt::{Class, Id, Protocol, Sel};
use tether_runtime::{
    BridgeOptions, ExecutionContext, ExtendOptions, HostRuntime, ObjectRuntime, ScriptError,
    ScriptObject, ScriptValue, StructPassing, Wrapper,
};

// ============================================================================
// Native side
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Point {
    x: f64,
    y: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Size {
    width: f64,
    height: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Rect {
    origin: Point,
    size: Size,
}

extern "C" fn tether_identity(value: i32) -> i32 {
    value
}

extern "C" fn tether_make_point(x: f64, y: f64) -> Point {
    Point { x, y }
}

extern "C" fn tether_point_sum(point: Point) -> f64 {
    point.x + point.y
}

extern "C" fn tether_make_rect(x: f64, y: f64, width: f64, height: f64) -> Rect {
    Rect {
        origin: Point { x, y },
        size: Size { width, height },
    }
}

/// Mixes every field so a misplaced member changes the result
extern "C" fn tether_rect_score(rect: Rect) -> f64 {
    rect.origin.x * 1000.0 + rect.origin.y * 100.0 + rect.size.width * 10.0 + rect.size.height
}

extern "C" fn tether_clamp(value: u8) -> u8 {
    value
}

extern "C" fn tether_apply(function: extern "C" fn(i32) -> i32, value: i32) -> i32 {
    function(value)
}

unsafe extern "C" fn tether_write_out(out: *mut i32) {
    unsafe { *out = 42 };
}

unsafe extern "C" fn counter_double(_this: Id, _cmd: Sel, value: i32) -> i32 {
    value * 2
}

unsafe extern "C" fn counter_compute(_this: Id, _cmd: Sel, value: i32) -> i32 {
    value + 1
}

unsafe extern "C" fn counter_me(this: Id, _cmd: Sel) -> Id {
    this
}

unsafe extern "C" fn counter_fail(_this: Id, _cmd: Sel, error: *mut Id) -> bool {
    if !error.is_null() {
        let runtime = HostRuntime::new();
        unsafe { *error = runtime.autorelease(runtime.new_error("boom")) };
    }
    false
}

thread_local! {
    static LAST_FAILED_RESULT: Cell<usize> = const { Cell::new(0) };
}

/// Returns a +1 object and reports an error; keeps one extra retain so the
/// test can observe the balance
unsafe extern "C" fn counter_new_failing(_this: Id, _cmd: Sel, error: *mut Id) -> Id {
    let runtime = HostRuntime::new();
    let object = runtime.create_instance(runtime.get_class("NSObject").unwrap());
    runtime.retain(object);
    LAST_FAILED_RESULT.with(|last| last.set(object as usize));
    if !error.is_null() {
        unsafe { *error = runtime.autorelease(runtime.new_error("half done")) };
    }
    object
}

unsafe extern "C" fn counter_protocol(_this: Id, _cmd: Sel) -> Protocol {
    HostRuntime::new().register_protocol("Tracking")
}

static COUNTER_CLASS: Lazy<usize> = Lazy::new(|| {
    let runtime = HostRuntime::new();
    let root = runtime.get_class("NSObject").unwrap();
    let class = runtime.allocate_class_pair(root, "Counter").unwrap();
    let methods: [(&str, *const c_void, &str); 6] = [
        ("double:", counter_double as *const c_void, "i@:i"),
        ("compute:", counter_compute as *const c_void, "i@:i"),
        ("me", counter_me as *const c_void, "@@:"),
        ("failWithError:", counter_fail as *const c_void, "B@:^@"),
        ("protocolValue", counter_protocol as *const c_void, "@@:"),
        ("newWithError:", counter_new_failing as *const c_void, "@@:^@"),
    ];
    for (selector, imp, types) in methods {
        let selector = runtime.register_selector(selector);
        assert!(runtime.add_method(class, selector, imp, types));
    }
    runtime.register_class_pair(class);
    class as usize
});

// ============================================================================
// Metadata
// ============================================================================

fn interface(name: &str, base: Option<&str>, methods: Vec<MethodDecl>) -> Declaration {
    Declaration::Interface(InterfaceDecl {
        common: DeclCommon::named(name),
        base: base.map(str::to_string),
        protocols: Vec::new(),
        methods,
        properties: Vec::new(),
    })
}

fn function(name: &str, return_type: DeclType, parameters: Vec<DeclType>) -> Declaration {
    Declaration::Function(FunctionDecl {
        common: DeclCommon::named(name),
        return_type,
        parameters,
        is_variadic: false,
        owns_returned: false,
        returns_unmanaged: false,
    })
}

fn metadata_bytes() -> Vec<u8> {
    let mut init = MethodDecl::new("init", DeclType::Instancetype, vec![]);
    init.is_initializer = true;
    let description = MethodDecl::new("description", DeclType::interface("NSString"), vec![]);

    let declarations = vec![
        interface("NSObject", None, vec![init, description]),
        interface("NSString", Some("NSObject"), vec![]),
        interface("NSError", Some("NSObject"), vec![]),
        interface(
            "Counter",
            Some("NSObject"),
            vec![
                MethodDecl::new("double:", DeclType::Int, vec![DeclType::Int]),
                MethodDecl::new("compute:", DeclType::Int, vec![DeclType::Int]),
                MethodDecl::new("me", DeclType::interface("Counter"), vec![]),
                MethodDecl::new(
                    "failWithError:",
                    DeclType::Bool,
                    vec![DeclType::pointer(DeclType::pointer(DeclType::interface("NSError")))],
                ),
                MethodDecl::new("protocolValue", DeclType::Protocol, vec![]),
                // No native implementation; a void parameter has no call layout
                MethodDecl::new("ignore:", DeclType::Void, vec![DeclType::Void]),
                MethodDecl::new(
                    "newWithError:",
                    DeclType::interface("NSObject"),
                    vec![DeclType::pointer(DeclType::pointer(DeclType::interface("NSError")))],
                ),
            ],
        ),
        Declaration::Struct(RecordDecl {
            common: DeclCommon::named("CGPoint"),
            fields: vec![
                FieldDecl {
                    name: "x".into(),
                    ty: DeclType::Double,
                },
                FieldDecl {
                    name: "y".into(),
                    ty: DeclType::Double,
                },
            ],
        }),
        Declaration::Struct(RecordDecl {
            common: DeclCommon::named("CGSize"),
            fields: vec![
                FieldDecl {
                    name: "width".into(),
                    ty: DeclType::Double,
                },
                FieldDecl {
                    name: "height".into(),
                    ty: DeclType::Double,
                },
            ],
        }),
        Declaration::Struct(RecordDecl {
            common: DeclCommon::named("CGRect"),
            fields: vec![
                FieldDecl {
                    name: "origin".into(),
                    ty: DeclType::record("CGPoint"),
                },
                FieldDecl {
                    name: "size".into(),
                    ty: DeclType::record("CGSize"),
                },
            ],
        }),
        Declaration::Enum(EnumDecl {
            common: DeclCommon::named("Color"),
            members: vec![
                EnumMemberDecl {
                    name: "Red".into(),
                    value: 0,
                },
                EnumMemberDecl {
                    name: "Green".into(),
                    value: 1,
                },
            ],
        }),
        function("tether_identity", DeclType::Int, vec![DeclType::Int]),
        function(
            "tether_make_point",
            DeclType::record("CGPoint"),
            vec![DeclType::Double, DeclType::Double],
        ),
        function("tether_point_sum", DeclType::Double, vec![DeclType::record("CGPoint")]),
        function(
            "tether_make_rect",
            DeclType::record("CGRect"),
            vec![DeclType::Double, DeclType::Double, DeclType::Double, DeclType::Double],
        ),
        function("tether_rect_score", DeclType::Double, vec![DeclType::record("CGRect")]),
        function("tether_clamp", DeclType::UnsignedChar, vec![DeclType::UnsignedChar]),
        function(
            "tether_apply",
            DeclType::Int,
            vec![
                DeclType::FunctionPointer {
                    return_type: Box::new(DeclType::Int),
                    parameters: vec![DeclType::Int],
                },
                DeclType::Int,
            ],
        ),
        function("tether_write_out", DeclType::Void, vec![DeclType::pointer(DeclType::Int)]),
    ];

    let mut module = ModuleDecl::new("Fixtures");
    module.declarations = declarations;
    let graph = DeclarationGraph {
        modules: vec![module],
    };
    let output = BinarySerializer::default().serialize(&graph).unwrap();
    assert!(output.skipped.is_empty());
    output.file.to_bytes()
}

fn metadata() -> MetadataStore {
    MetadataStore::from_bytes(metadata_bytes()).unwrap()
}

fn context() -> ExecutionContext {
    context_with(StructPassing::for_target())
}

fn context_with(passing: StructPassing) -> ExecutionContext {
    Lazy::force(&COUNTER_CLASS);
    let options = BridgeOptions::default().with_struct_passing(passing);
    let ctx =
        ExecutionContext::with_options(Arc::new(HostRuntime::new()), Arc::new(metadata()), options);
    let symbols = ctx.symbols();
    symbols.register("tether_identity", tether_identity as *const c_void);
    symbols.register("tether_make_point", tether_make_point as *const c_void);
    symbols.register("tether_point_sum", tether_point_sum as *const c_void);
    symbols.register("tether_make_rect", tether_make_rect as *const c_void);
    symbols.register("tether_rect_score", tether_rect_score as *const c_void);
    symbols.register("tether_clamp", tether_clamp as *const c_void);
    symbols.register("tether_apply", tether_apply as *const c_void);
    symbols.register("tether_write_out", tether_write_out as *const c_void);
    ctx
}

fn native_id(value: &ScriptValue) -> Id {
    let cell = value.as_object().unwrap().wrapper().unwrap();
    let wrapper = cell.get().unwrap();
    match &*wrapper {
        Wrapper::NativeObject(object) => object.object,
        other => panic!("not a native object: {:?}", other.kind()),
    }
}

fn number(value: f64) -> ScriptValue {
    ScriptValue::Number(value)
}

// ============================================================================
// Functions and values
// ============================================================================

#[test]
fn test_function_call() {
    let ctx = context();
    let identity = ctx.global("tether_identity").unwrap();
    let result = ctx.call(&identity, &ScriptValue::Undefined, &[number(5.0)]).unwrap();
    assert_eq!(result.as_number(), Some(5.0));

    let error = ctx.call(&identity, &ScriptValue::Undefined, &[]).unwrap_err();
    assert!(matches!(error, ScriptError::TypeError(_)));
}

#[test]
fn test_struct_round_trip() {
    let ctx = context();
    let make = ctx.global("tether_make_point").unwrap();
    let sum = ctx.global("tether_point_sum").unwrap();

    let point = ctx
        .call(&make, &ScriptValue::Undefined, &[number(1.5), number(2.5)])
        .unwrap();
    assert_eq!(ctx.get(&point, "x").unwrap().as_number(), Some(1.5));
    assert_eq!(ctx.get(&point, "y").unwrap().as_number(), Some(2.5));

    let total = ctx.call(&sum, &ScriptValue::Undefined, &[point.clone()]).unwrap();
    assert_eq!(total.as_number(), Some(4.0));

    ctx.set(&point, "x", number(10.0)).unwrap();
    let total = ctx.call(&sum, &ScriptValue::Undefined, &[point]).unwrap();
    assert_eq!(total.as_number(), Some(12.5));

    let literal =
        ScriptValue::Object(ScriptObject::from_entries([("x", number(1.0)), ("y", number(2.0))]));
    let total = ctx.call(&sum, &ScriptValue::Undefined, &[literal]).unwrap();
    assert_eq!(total.as_number(), Some(3.0));
}

#[test]
fn test_nested_struct_under_both_passings() {
    for passing in [StructPassing::Nested, StructPassing::Flattened] {
        let ctx = context_with(passing);
        let make = ctx.global("tether_make_rect").unwrap();
        let score = ctx.global("tether_rect_score").unwrap();

        let corners = [number(1.0), number(2.0), number(3.0), number(4.0)];
        let rect = ctx.call(&make, &ScriptValue::Undefined, &corners).unwrap();
        let origin = ctx.get(&rect, "origin").unwrap();
        let size = ctx.get(&rect, "size").unwrap();
        assert_eq!(ctx.get(&origin, "x").unwrap().as_number(), Some(1.0), "{passing:?}");
        assert_eq!(ctx.get(&origin, "y").unwrap().as_number(), Some(2.0), "{passing:?}");
        assert_eq!(ctx.get(&size, "width").unwrap().as_number(), Some(3.0), "{passing:?}");
        assert_eq!(ctx.get(&size, "height").unwrap().as_number(), Some(4.0), "{passing:?}");

        let total = ctx.call(&score, &ScriptValue::Undefined, &[rect.clone()]).unwrap();
        assert_eq!(total.as_number(), Some(1234.0), "{passing:?}");

        // Writes through the projections land in the owning rect
        ctx.set(&origin, "x", number(5.0)).unwrap();
        ctx.set(&size, "height", number(9.0)).unwrap();
        let again = ctx.get(&rect, "origin").unwrap();
        assert_eq!(ctx.get(&again, "x").unwrap().as_number(), Some(5.0), "{passing:?}");

        let total = ctx.call(&score, &ScriptValue::Undefined, &[rect]).unwrap();
        assert_eq!(total.as_number(), Some(5239.0), "{passing:?}");
    }
}

#[test]
fn test_struct_type_constructor() {
    let ctx = context();
    let point_type = ctx.global("CGPoint").unwrap();
    let init = ScriptValue::Object(ScriptObject::from_entries([("x", number(3.0))]));
    let point = ctx.construct(&point_type, &[init]).unwrap();
    assert_eq!(ctx.get(&point, "x").unwrap().as_number(), Some(3.0));
    assert_eq!(ctx.get(&point, "y").unwrap().as_number(), Some(0.0));
    assert!(is_struct_of(&point, point_type.as_object().unwrap()));

    let equals = ctx.get(&point_type, "equals").unwrap();
    let same =
        ScriptValue::Object(ScriptObject::from_entries([("x", number(3.0)), ("y", number(0.0))]));
    let result = ctx.call(&equals, &point_type, &[point, same]).unwrap();
    assert_eq!(result.as_bool(), Some(true));
}

#[test]
fn test_numeric_clamping() {
    let ctx = context();
    let clamp = ctx.global("tether_clamp").unwrap();
    let high = ctx.call(&clamp, &ScriptValue::Undefined, &[number(300.0)]).unwrap();
    assert_eq!(high.as_number(), Some(255.0));
    let low = ctx.call(&clamp, &ScriptValue::Undefined, &[number(-5.0)]).unwrap();
    assert_eq!(low.as_number(), Some(0.0));
    let truthy = ctx.call(&clamp, &ScriptValue::Undefined, &[ScriptValue::Bool(true)]).unwrap();
    assert_eq!(truthy.as_number(), Some(1.0));
}

#[test]
fn test_script_callback() {
    let ctx = context();
    let apply = ctx.global("tether_apply").unwrap();
    let triple = ScriptValue::Object(ScriptObject::function(|_ctx, _this, args| {
        Ok(ScriptValue::Number(args[0].to_number() * 3.0))
    }));
    let result = ctx
        .call(&apply, &ScriptValue::Undefined, &[triple.clone(), number(7.0)])
        .unwrap();
    assert_eq!(result.as_number(), Some(21.0));

    // the callback is reused for the same function
    let again = ctx.call(&apply, &ScriptValue::Undefined, &[triple, number(2.0)]).unwrap();
    assert_eq!(again.as_number(), Some(6.0));
}

#[test]
fn test_callback_error_is_rethrown() {
    let ctx = context();
    let apply = ctx.global("tether_apply").unwrap();
    let failing = ScriptValue::Object(ScriptObject::function(|_ctx, _this, _args| {
        Err(ScriptError::RangeError("too large".into()))
    }));
    let error = ctx
        .call(&apply, &ScriptValue::Undefined, &[failing, number(1.0)])
        .unwrap_err();
    assert_eq!(error, ScriptError::RangeError("too large".into()));
}

#[test]
fn test_enum_global() {
    let ctx = context();
    let color = ctx.global("Color").unwrap();
    assert_eq!(ctx.get(&color, "Green").unwrap().as_number(), Some(1.0));
    assert_eq!(ctx.get(&color, "Red").unwrap().as_number(), Some(0.0));
}

#[test]
fn test_metadata_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&metadata_bytes()).unwrap();
    let store = MetadataStore::open(file.path()).unwrap();
    let ctx = ExecutionContext::new(Arc::new(HostRuntime::new()), Arc::new(store));
    let color = ctx.global("Color").unwrap();
    assert_eq!(ctx.get(&color, "Green").unwrap().as_number(), Some(1.0));
}

#[test]
fn test_unknown_global() {
    let ctx = context();
    assert!(ctx.global("NoSuchThing").is_err());
}

// ============================================================================
// Objects
// ============================================================================

#[test]
fn test_construct_and_call() {
    let ctx = context();
    let counter_type = ctx.global("Counter").unwrap();
    let counter = ctx.construct(&counter_type, &[]).unwrap();

    let doubled = ctx.invoke(&counter, "double", &[number(21.0)]).unwrap();
    assert_eq!(doubled.as_number(), Some(42.0));

    let description = ctx.invoke(&counter, "description", &[]).unwrap();
    assert!(description.as_str().unwrap().starts_with("<Counter: "));

    let runtime = HostRuntime::new();
    assert_eq!(runtime.retain_count(native_id(&counter)), 1);
}

#[test]
fn test_instance_identity() {
    let ctx = context();
    let counter_type = ctx.global("Counter").unwrap();
    let counter = ctx.construct(&counter_type, &[]).unwrap();
    let me = ctx.invoke(&counter, "me", &[]).unwrap();
    assert!(me.strict_equals(&counter));
    assert_eq!(HostRuntime::new().retain_count(native_id(&counter)), 1);
}

#[test]
fn test_error_out_parameter_throws() {
    let ctx = context();
    let counter_type = ctx.global("Counter").unwrap();
    let counter = ctx.construct(&counter_type, &[]).unwrap();
    let error = ctx.invoke(&counter, "failWithError", &[]).unwrap_err();
    assert_eq!(error, ScriptError::Native("boom".into()));
}

#[test]
fn test_error_out_releases_owned_result() {
    let ctx = context();
    let counter_type = ctx.global("Counter").unwrap();
    let counter = ctx.construct(&counter_type, &[]).unwrap();
    let error = ctx.invoke(&counter, "newWithError", &[]).unwrap_err();
    assert_eq!(error, ScriptError::Native("half done".into()));

    let object = LAST_FAILED_RESULT.with(Cell::get) as Id;
    let runtime = ctx.runtime();
    // Only the extra retain of the native side is left
    assert_eq!(runtime.retain_count(object), 1);
    runtime.release(object);
}

#[test]
fn test_nil_receiver_returns_empty_value() {
    let ctx = context();
    let meta = ctx.store().lookup("Counter").unwrap();
    let result = ctx
        .call_method(&meta, &ScriptValue::Null, "protocolValue", false, &[])
        .unwrap();
    assert!(result.is_undefined());
    let result = ctx
        .call_method(&meta, &ScriptValue::Null, "double", false, &[number(4.0)])
        .unwrap();
    assert_eq!(result.as_number(), Some(0.0));
}

#[test]
fn test_wrapper_disposal_and_rewrap() {
    let ctx = context();
    let runtime = HostRuntime::new();
    let counter_type = ctx.global("Counter").unwrap();
    let counter = ctx.construct(&counter_type, &[]).unwrap();
    let id = native_id(&counter);
    runtime.retain(id);
    assert_eq!(runtime.retain_count(id), 2);

    let old = std::rc::Rc::downgrade(counter.as_object().unwrap());
    drop(counter);
    let report = ctx.collect_garbage();
    assert!(report.disposed >= 1);
    assert!(old.upgrade().is_none());
    assert_eq!(runtime.retain_count(id), 1);

    let again = ctx.wrap_native_object(id, false).unwrap();
    assert_eq!(native_id(&again), id);
    assert_eq!(runtime.retain_count(id), 2);
    drop(again);
    ctx.collect_garbage();
    runtime.release(id);
}

// ============================================================================
// Subclassing
// ============================================================================

#[test]
fn test_subclass_override_through_native_dispatch() {
    let ctx = context();
    let runtime = HostRuntime::new();
    let counter_type = ctx.global("Counter").unwrap();

    let methods = ScriptValue::Object(ScriptObject::from_entries([(
        "compute",
        ScriptValue::Object(ScriptObject::function(|_ctx, _this, args| {
            Ok(ScriptValue::Number(args[0].to_number() * 10.0))
        })),
    )]));
    let derived = ctx
        .extend_class(&counter_type, &methods, ExtendOptions::named("DerivedCounter"))
        .unwrap();
    let instance = ctx.construct(&ScriptValue::Object(derived), &[]).unwrap();

    let id = native_id(&instance);
    let class: Class = runtime.class_of(id);
    assert_ne!(class as usize, *COUNTER_CLASS);
    assert!(runtime.class_name(class).starts_with("DerivedCounter"));

    let selector = runtime.register_selector("compute:");
    let imp = runtime.lookup_imp(class, selector).unwrap();
    let compute: unsafe extern "C" fn(Id, Sel, i32) -> i32 = unsafe { std::mem::transmute(imp) };
    assert_eq!(unsafe { compute(id, selector, 4) }, 40);
    assert_eq!(runtime.method_types(class, selector).as_deref(), Some("i@:i"));

    let scripted = ctx.invoke(&instance, "compute", &[number(4.0)]).unwrap();
    assert_eq!(scripted.as_number(), Some(40.0));

    let base = ctx.super_of(&instance).unwrap();
    let native = ctx.invoke(&base, "compute", &[number(4.0)]).unwrap();
    assert_eq!(native.as_number(), Some(5.0));
    let inherited = ctx.invoke(&base, "double", &[number(4.0)]).unwrap();
    assert_eq!(inherited.as_number(), Some(8.0));

    // A super view of the super view dispatches above Counter
    let root = ctx.super_of(&base).unwrap();
    assert!(ctx.invoke(&root, "compute", &[number(4.0)]).is_err());

    // inherited, not overridden
    let doubled = ctx.invoke(&instance, "double", &[number(3.0)]).unwrap();
    assert_eq!(doubled.as_number(), Some(6.0));
}

#[test]
fn test_class_name_collision() {
    let ctx = context();
    let runtime = HostRuntime::new();
    let counter_type = ctx.global("Counter").unwrap();
    let empty = ScriptValue::Object(ScriptObject::new());

    let first = ctx
        .extend_class(&counter_type, &empty, ExtendOptions::named("CollidingCounter"))
        .unwrap();
    let second = ctx
        .extend_class(&counter_type, &empty, ExtendOptions::named("CollidingCounter"))
        .unwrap();
    let a = ctx.construct(&ScriptValue::Object(first), &[]).unwrap();
    let b = ctx.construct(&ScriptValue::Object(second), &[]).unwrap();

    let class_a = runtime.class_of(native_id(&a));
    let class_b = runtime.class_of(native_id(&b));
    assert_ne!(class_a, class_b);
    assert_ne!(runtime.class_name(class_a), runtime.class_name(class_b));
    assert!(runtime.get_class(&runtime.class_name(class_a)).is_some());
    assert!(runtime.get_class(&runtime.class_name(class_b)).is_some());
}

#[test]
fn test_failed_extension_frees_requested_name() {
    let ctx = context();
    let runtime = HostRuntime::new();
    let counter_type = ctx.global("Counter").unwrap();

    let unsupported = ScriptValue::Object(ScriptObject::from_entries([(
        "ignore",
        ScriptValue::Object(ScriptObject::function(|_ctx, _this, _args| {
            Ok(ScriptValue::Undefined)
        })),
    )]));
    let broken = ctx
        .extend_class(&counter_type, &unsupported, ExtendOptions::named("UnbuildableCounter"))
        .unwrap();
    assert!(ctx.construct(&ScriptValue::Object(broken), &[]).is_err());
    assert!(runtime.get_class("UnbuildableCounter").is_none());

    let empty = ScriptValue::Object(ScriptObject::new());
    let working = ctx
        .extend_class(&counter_type, &empty, ExtendOptions::named("UnbuildableCounter"))
        .unwrap();
    let instance = ctx.construct(&ScriptValue::Object(working), &[]).unwrap();
    let class = runtime.class_of(native_id(&instance));
    assert_eq!(runtime.class_name(class), "UnbuildableCounter");
}

#[test]
fn test_subclass_adopts_protocol() {
    let ctx = context();
    let runtime = HostRuntime::new();
    let counter_type = ctx.global("Counter").unwrap();
    let counter = ctx.construct(&counter_type, &[]).unwrap();
    let protocol = ctx.invoke(&counter, "protocolValue", &[]).unwrap();
    assert!(protocol.as_object().is_some());
    // one script object per native protocol
    assert!(ctx.invoke(&counter, "protocolValue", &[]).unwrap().strict_equals(&protocol));

    let empty = ScriptValue::Object(ScriptObject::new());
    let tracked = ctx
        .extend_class(
            &counter_type,
            &empty,
            ExtendOptions::named("TrackedCounter").with_protocol(protocol),
        )
        .unwrap();
    let instance = ctx.construct(&ScriptValue::Object(tracked), &[]).unwrap();
    let class = runtime.class_of(native_id(&instance));
    let tracking = runtime.get_protocol("Tracking").unwrap();
    assert!(runtime.conforms_to(class, tracking));
}

// ============================================================================
// Interop
// ============================================================================

#[test]
fn test_typed_reference() {
    let ctx = context();
    let interop = ctx.global("interop").unwrap();
    let types = ctx.get(&interop, "types").unwrap();
    let int32 = ctx.get(&types, "int32").unwrap();
    let reference_type = ctx.get(&interop, "Reference").unwrap();

    let reference = ctx.construct(&reference_type, &[int32.clone(), number(5.0)]).unwrap();
    assert_eq!(ctx.get(&reference, "value").unwrap().as_number(), Some(5.0));
    ctx.set(&reference, "value", number(9.0)).unwrap();
    assert_eq!(ctx.get(&reference, "value").unwrap().as_number(), Some(9.0));

    let size_of = ctx.get(&interop, "sizeof").unwrap();
    let size = ctx.call(&size_of, &interop, &[int32]).unwrap();
    assert_eq!(size.as_number(), Some(4.0));
    let point_type = ctx.global("CGPoint").unwrap();
    let size = ctx.call(&size_of, &interop, &[point_type]).unwrap();
    assert_eq!(size.as_number(), Some(16.0));
}

#[test]
fn test_untyped_reference_as_out_parameter() {
    let ctx = context();
    let interop = ctx.global("interop").unwrap();
    let reference_type = ctx.get(&interop, "Reference").unwrap();
    let reference = ctx.construct(&reference_type, &[]).unwrap();

    let write_out = ctx.global("tether_write_out").unwrap();
    ctx.call(&write_out, &ScriptValue::Undefined, &[reference.clone()]).unwrap();
    assert_eq!(ctx.get(&reference, "value").unwrap().as_number(), Some(42.0));
}

#[test]
fn test_pointer_arithmetic() {
    let ctx = context();
    let interop = ctx.global("interop").unwrap();
    let alloc = ctx.get(&interop, "alloc").unwrap();
    let pointer = ctx.call(&alloc, &interop, &[number(16.0)]).unwrap();

    let base = ctx.invoke(&pointer, "toNumber", &[]).unwrap().as_number().unwrap();
    assert!(base > 0.0);
    let next = ctx.invoke(&pointer, "add", &[number(8.0)]).unwrap();
    assert_eq!(ctx.invoke(&next, "toNumber", &[]).unwrap().as_number(), Some(base + 8.0));
    let back = ctx.invoke(&next, "subtract", &[number(8.0)]).unwrap();
    assert!(back.strict_equals(&pointer));

    let hex = ctx.invoke(&pointer, "toHexString", &[]).unwrap();
    assert!(hex.as_str().unwrap().starts_with("0x"));
}

// ============================================================================
// Workers
// ============================================================================

#[test]
fn test_worker_messages_and_deferred_disposal() {
    let ctx = context();
    let worker = ctx
        .spawn_worker(|scope| {
            while let Some(message) = scope.recv() {
                scope.post(message);
            }
        })
        .unwrap();

    let posted = ctx.invoke(&worker, "postMessage", &[number(5.0)]).unwrap();
    assert_eq!(posted.as_bool(), Some(true));
    let mut reply = ScriptValue::Null;
    for _ in 0..100 {
        reply = ctx.invoke(&worker, "receiveMessage", &[]).unwrap();
        if !reply.is_nullish() {
            break;
        }
    }
    assert_eq!(reply.as_number(), Some(5.0));

    let state = {
        let cell = worker.as_object().unwrap().wrapper().unwrap();
        let wrapper = cell.get().unwrap();
        match &*wrapper {
            Wrapper::Worker(state) => state.clone(),
            other => panic!("not a worker: {:?}", other.kind()),
        }
    };

    drop(worker);
    let report = ctx.collect_garbage();
    assert_eq!(report.retried, 1);

    state.terminate();
    state.join();
    let report = ctx.collect_garbage();
    assert_eq!(report.disposed, 1);
    assert_eq!(report.retried, 0);
}
