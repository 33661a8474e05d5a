//! Integration tests: declaration graph → binary file → store

use std::sync::Arc;

use tether_meta::decl::{
    CategoryDecl, ConstantDecl, DeclCommon, EnumDecl, EnumMemberDecl, FieldDecl, FunctionDecl,
    InterfaceDecl, MethodDecl, PropertyDecl, ProtocolDecl, RecordDecl, VarDecl,
};
use tether_meta::flags;
use tether_meta::{
    BinarySerializer, DeclType, Declaration, DeclarationGraph, Member, Meta, MetaFileBuilderOptions,
    MetaKind, MetadataStore, ModuleDecl, TypeEncoding,
};

fn graph(module: &str, declarations: Vec<Declaration>) -> DeclarationGraph {
    let mut decl = ModuleDecl::new(module);
    decl.is_framework = true;
    decl.declarations = declarations;
    DeclarationGraph {
        modules: vec![decl],
    }
}

fn build(graph: &DeclarationGraph) -> (MetadataStore, Vec<String>) {
    let output = BinarySerializer::default().serialize(graph).unwrap();
    let skipped = output
        .skipped
        .iter()
        .map(|e| e.detailed_message())
        .collect();
    (
        MetadataStore::from_bytes(output.file.to_bytes()).unwrap(),
        skipped,
    )
}

fn interface(
    name: &str,
    base: Option<&str>,
    protocols: &[&str],
    methods: Vec<MethodDecl>,
) -> Declaration {
    Declaration::Interface(InterfaceDecl {
        common: DeclCommon::named(name),
        base: base.map(str::to_string),
        protocols: protocols.iter().map(|p| p.to_string()).collect(),
        methods,
        properties: Vec::new(),
    })
}

fn protocol(name: &str, methods: Vec<MethodDecl>) -> Declaration {
    Declaration::Protocol(ProtocolDecl {
        common: DeclCommon::named(name),
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

fn record(name: &str, fields: Vec<(&str, DeclType)>) -> Declaration {
    Declaration::Struct(RecordDecl {
        common: DeclCommon::named(name),
        fields: fields
            .into_iter()
            .map(|(name, ty)| FieldDecl {
                name: name.to_string(),
                ty,
            })
            .collect(),
    })
}

fn class(meta: &Arc<Meta>) -> &tether_meta::ClassMeta {
    meta.as_class().expect("class record")
}

// ============================================================================
// Classes
// ============================================================================

#[test]
fn test_interface_round_trip() {
    let mut init = MethodDecl::new(
        "initWithFrame:",
        DeclType::Instancetype,
        vec![DeclType::record("CGRect")],
    );
    init.is_initializer = true;
    let copy = MethodDecl::new("copy", DeclType::Id { protocols: vec![] }, vec![]);
    let save = MethodDecl::new(
        "writeToFile:error:",
        DeclType::Bool,
        vec![
            DeclType::interface("NSString"),
            DeclType::pointer(DeclType::pointer(DeclType::interface("NSError"))),
        ],
    );

    let graph = graph(
        "UIKit",
        vec![
            record("CGRect", vec![("x", DeclType::Double), ("y", DeclType::Double)]),
            interface("NSObject", None, &[], vec![]),
            interface("UIView", Some("NSObject"), &[], vec![save, init, copy]),
        ],
    );
    let (store, skipped) = build(&graph);
    assert!(skipped.is_empty(), "{:?}", skipped);

    let view = store.lookup("UIView").unwrap();
    let view = class(&view);
    assert_eq!(view.header.kind(), MetaKind::Interface);
    assert_eq!(view.base_name.as_deref(), Some("NSObject"));

    // sorted by script name
    let names: Vec<_> = view.instance_methods.iter().map(|m| m.js_name().to_string()).collect();
    assert_eq!(names, vec!["copy", "initWithFrame", "writeToFileError"]);
    assert_eq!(view.initializers_start_index, 1);
    assert_eq!(view.initializers().len(), 2);

    let copy = &view.instance_methods[0];
    assert!(copy.owns_returned_object());
    let save = &view.instance_methods[2];
    assert!(save.has_error_out_parameter());
    assert_eq!(save.selector(), "writeToFile:error:");
    assert_eq!(save.arity(), 2);

    let init = &view.instance_methods[1];
    assert_eq!(init.parameter_types(), &[TypeEncoding::struct_ref("CGRect")]);
}

#[test]
fn test_lookup_by_native_name() {
    let mut decl = DeclCommon::named("NSURLSession");
    decl.js_name = Some("URLSession".into());
    let graph = graph(
        "Foundation",
        vec![Declaration::Interface(InterfaceDecl {
            common: decl,
            base: None,
            protocols: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
        })],
    );
    let (store, _) = build(&graph);
    let by_js = store.lookup("URLSession").unwrap();
    let by_native = store.find_interface("NSURLSession").unwrap();
    assert!(Arc::ptr_eq(&by_js, &by_native));
    assert_eq!(by_js.name(), "NSURLSession");
    assert!(by_js.header().has_flag(flags::common::HAS_NAME));
    assert!(store.find_protocol("NSURLSession").is_none());
}

#[test]
fn test_category_members_are_merged() {
    let category = Declaration::Category(CategoryDecl {
        name: "Extras".into(),
        extends: "NSString".into(),
        protocols: vec!["NSCopying".into()],
        methods: vec![MethodDecl::new("uppercaseString", DeclType::interface("NSString"), vec![])],
        properties: Vec::new(),
    });
    let graph = graph(
        "Foundation",
        vec![
            protocol("NSCopying", vec![]),
            interface(
                "NSString",
                None,
                &[],
                vec![MethodDecl::new("length", DeclType::ULong, vec![])],
            ),
            category,
        ],
    );
    let (store, _) = build(&graph);
    let string = store.lookup("NSString").unwrap();
    let string = class(&string);
    assert_eq!(string.instance_methods.len(), 2);
    assert_eq!(string.protocols, vec!["NSCopying"]);
}

#[test]
fn test_duplicate_members_are_removed() {
    let description = || MethodDecl::new("description", DeclType::interface("NSString"), vec![]);
    let graph = graph(
        "Foundation",
        vec![
            protocol("NSObjectProtocol", vec![description()]),
            interface("NSObject", None, &["NSObjectProtocol"], vec![description()]),
            interface(
                "NSArray",
                Some("NSObject"),
                &[],
                vec![
                    description(),
                    // same selector, different signature: kept
                    MethodDecl::new("description", DeclType::CString, vec![]),
                ],
            ),
        ],
    );
    let (store, _) = build(&graph);

    let object = store.lookup("NSObject").unwrap();
    assert!(class(&object).instance_methods.is_empty());
    let array = store.lookup("NSArray").unwrap();
    let array_methods = &class(&array).instance_methods;
    assert_eq!(array_methods.len(), 1);
    assert_eq!(array_methods[0].return_type(), &TypeEncoding::CString);

    // the removed member is still reachable through the protocol
    let found = store.find_method(array.clone(), "description", false, 0).unwrap();
    assert_eq!(found.return_type(), &TypeEncoding::CString);
    let members = store.members_by_js_name(object, "description", false);
    assert_eq!(members.len(), 1);
    assert!(matches!(members[0], Member::Method(_)));
}

#[test]
fn test_find_method_accepts_omitted_error_parameter() {
    let method = MethodDecl::new(
        "removeItemAtPath:error:",
        DeclType::Bool,
        vec![
            DeclType::interface("NSString"),
            DeclType::pointer(DeclType::pointer(DeclType::interface("NSError"))),
        ],
    );
    let graph = graph(
        "Foundation",
        vec![interface("NSFileManager", None, &[], vec![method])],
    );
    let (store, _) = build(&graph);
    let manager = store.lookup("NSFileManager").unwrap();
    assert!(store.find_method(manager.clone(), "removeItemAtPathError", false, 1).is_some());
    assert!(store.find_method(manager.clone(), "removeItemAtPathError", false, 2).is_some());
    assert!(store.find_method(manager, "removeItemAtPathError", false, 3).is_none());
}

#[test]
fn test_properties() {
    let property = PropertyDecl {
        name: "frame".into(),
        js_name: None,
        is_static: false,
        is_optional: false,
        getter: Some(MethodDecl::new("frame", DeclType::Double, vec![])),
        setter: Some(MethodDecl::new("setFrame:", DeclType::Void, vec![DeclType::Double])),
    };
    let graph = graph(
        "UIKit",
        vec![Declaration::Interface(InterfaceDecl {
            common: DeclCommon::named("UIView"),
            base: None,
            protocols: Vec::new(),
            methods: Vec::new(),
            properties: vec![property],
        })],
    );
    let (store, _) = build(&graph);
    let view = store.lookup("UIView").unwrap();
    let frame = class(&view).property_named("frame", false).unwrap();
    assert_eq!(frame.getter.as_ref().unwrap().selector(), "frame");
    assert_eq!(frame.setter.as_ref().unwrap().selector(), "setFrame:");
}

// ============================================================================
// Name collisions
// ============================================================================

#[test]
fn test_name_collisions_follow_priority() {
    let graph = graph(
        "Foundation",
        vec![
            record("NSThing", vec![("a", DeclType::Int)]),
            function("NSThing", DeclType::Void, vec![]),
            Declaration::Var(VarDecl {
                common: DeclCommon::named("NSThing"),
                ty: DeclType::Int,
                value: None,
            }),
            interface("NSThing", None, &[], vec![]),
        ],
    );
    let (store, _) = build(&graph);

    assert_eq!(store.lookup("NSThing").unwrap().kind(), MetaKind::Interface);
    assert_eq!(store.lookup("NSThingFunction").unwrap().kind(), MetaKind::Function);
    assert_eq!(store.lookup("NSThingVar").unwrap().kind(), MetaKind::Var);
    let renamed = store.lookup("NSThingStruct").unwrap();
    assert_eq!(renamed.kind(), MetaKind::Struct);
    assert_eq!(renamed.name(), "NSThing");
}

#[test]
fn test_collision_index_suffix() {
    let graph = graph(
        "Foundation",
        vec![
            function("Mode", DeclType::Void, vec![]),
            Declaration::EnumConstant(ConstantDecl {
                common: DeclCommon::named("Mode"),
                value: "1".into(),
            }),
            Declaration::Var(VarDecl {
                common: DeclCommon::named("Mode"),
                ty: DeclType::Int,
                value: None,
            }),
        ],
    );
    let (store, _) = build(&graph);
    assert_eq!(store.lookup("Mode").unwrap().kind(), MetaKind::Function);
    assert_eq!(store.lookup("ModeVar").unwrap().kind(), MetaKind::Var);
    let constant = store.lookup("ModeVar2").unwrap();
    assert_eq!(constant.kind(), MetaKind::JsCode);
    assert_eq!(
        constant.as_js_code().unwrap().constant_value(),
        Some(serde_json::json!(1))
    );
}

#[test]
fn test_collisions_can_be_disabled() {
    let graph = graph(
        "Foundation",
        vec![
            function("Thing", DeclType::Void, vec![]),
            record("Thing", vec![("a", DeclType::Int)]),
        ],
    );
    let options = MetaFileBuilderOptions {
        resolve_name_collisions: false,
        ..MetaFileBuilderOptions::default()
    };
    let output = BinarySerializer::new(options).serialize(&graph).unwrap();
    let store = MetadataStore::from_bytes(output.file.to_bytes()).unwrap();
    assert_eq!(store.lookup("Thing").unwrap().kind(), MetaKind::Function);
    assert!(store.lookup("ThingStruct").is_none());
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_variadic_function_is_dropped() {
    let graph = graph(
        "Foundation",
        vec![Declaration::Function(FunctionDecl {
            common: DeclCommon::named("NSLog"),
            return_type: DeclType::Void,
            parameters: vec![DeclType::interface("NSString")],
            is_variadic: true,
            owns_returned: false,
            returns_unmanaged: false,
        })],
    );
    let (store, skipped) = build(&graph);
    assert!(store.lookup("NSLog").is_none());
    assert_eq!(
        skipped,
        vec!["[Name: 'NSLog', JsName: 'NSLog', Module: 'Foundation'] : Variadic functions are not supported."]
    );
}

#[test]
fn test_failed_dependency_chains() {
    let graph = graph(
        "Foundation",
        vec![
            record(
                "Broken",
                vec![("v", DeclType::Unsupported { description: "vector of bool".into() })],
            ),
            record("Outer", vec![("inner", DeclType::record("Broken"))]),
            function("useOuter", DeclType::Void, vec![DeclType::record("Outer")]),
            function("fine", DeclType::Int, vec![DeclType::Int]),
        ],
    );
    let (store, skipped) = build(&graph);
    assert!(store.lookup("Broken").is_none());
    assert!(store.lookup("Outer").is_none());
    assert!(store.lookup("useOuter").is_none());
    assert!(store.lookup("fine").is_some());

    assert_eq!(skipped.len(), 3);
    assert!(skipped.iter().any(|s| s.ends_with(
        "Can't create meta dependency. --> Can't create meta dependency. --> Unsupported type: vector of bool"
    )));
}

#[test]
fn test_hard_error_aborts() {
    let graph = graph(
        "Foundation",
        vec![record(
            "Bad",
            vec![(
                "items",
                DeclType::ConstantArray {
                    element: Box::new(DeclType::Int),
                    size: -4,
                },
            )],
        )],
    );
    let error = BinarySerializer::default().serialize(&graph).err().unwrap();
    assert!(error.is_hard());
    assert_eq!(error.declaration().unwrap().name, "Bad");
}

// ============================================================================
// Records, enums and files
// ============================================================================

#[test]
fn test_enum_table() {
    let graph = graph(
        "UIKit",
        vec![Declaration::Enum(EnumDecl {
            common: DeclCommon::named("UIViewContentMode"),
            members: vec![
                EnumMemberDecl {
                    name: "ScaleToFill".into(),
                    value: 0,
                },
                EnumMemberDecl {
                    name: "Redraw".into(),
                    value: 3,
                },
            ],
        })],
    );
    let (store, _) = build(&graph);
    let meta = store.lookup("UIViewContentMode").unwrap();
    let code = meta.as_js_code().unwrap();
    assert!(code.is_enum());
    let mut members = code.enum_members().unwrap();
    members.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        members,
        vec![("Redraw".to_string(), 3.0), ("ScaleToFill".to_string(), 0.0)]
    );
}

#[test]
fn test_nested_record_encodings() {
    let graph = graph(
        "CoreGraphics",
        vec![
            record("CGPoint", vec![("x", DeclType::Double), ("y", DeclType::Double)]),
            record("CGSize", vec![("width", DeclType::Double), ("height", DeclType::Double)]),
            record(
                "CGRect",
                vec![("origin", DeclType::record("CGPoint")), ("size", DeclType::record("CGSize"))],
            ),
        ],
    );
    let (store, _) = build(&graph);
    let rect = store.record("CGRect");
    assert_eq!(rect.fields[0].encoding, TypeEncoding::struct_ref("CGPoint"));
    assert_eq!(rect.fields[1].encoding, TypeEncoding::struct_ref("CGSize"));
}

#[test]
fn test_save_and_open() {
    let graph = graph(
        "Foundation",
        vec![function("abs", DeclType::Int, vec![DeclType::Int])],
    );
    let output = BinarySerializer::default().serialize(&graph).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metadata.bin");
    output.file.save_to_path(&path).unwrap();

    let store = MetadataStore::open(&path).unwrap();
    let abs = store.lookup("abs").unwrap();
    let abs = abs.as_function().unwrap();
    assert_eq!(abs.return_type(), &TypeEncoding::Int);
    assert_eq!(abs.parameter_types(), &[TypeEncoding::Int]);

    let module = store.module_of(&store.lookup("abs").unwrap()).unwrap().unwrap();
    assert!(module.is_framework());
}

#[test]
fn test_graph_from_json_builds() {
    let json = r#"{
        "modules": [{
            "name": "Foundation.NSString",
            "declarations": [
                {"kind": "interface", "name": "NSString",
                 "methods": [{"selector": "stringWithUTF8String:", "is_static": true,
                              "return_type": {"type": "instancetype"},
                              "parameters": [{"type": "c_string"}]}]}
            ]
        }]
    }"#;
    let graph: DeclarationGraph = serde_json::from_str(json).unwrap();
    let (store, skipped) = build(&graph);
    assert!(skipped.is_empty());
    let string = store.lookup("NSString").unwrap();
    let method = &class(&string).static_methods[0];
    assert_eq!(method.js_name(), "stringWithUTF8String");
    assert_eq!(method.parameter_types(), &[TypeEncoding::CString]);
    let module = store.module_of(&string).unwrap().unwrap();
    assert_eq!(module.name, "Foundation");
}

#[test]
fn test_global_store_installs_once() {
    let decls = graph("Globals", vec![function("abs", DeclType::Int, vec![DeclType::Int])]);
    let (first, _) = build(&decls);
    let (second, _) = build(&decls);

    let installed = MetadataStore::install_global(first).unwrap();
    assert!(installed.lookup("abs").is_some());
    assert!(MetadataStore::install_global(second).is_err());
    assert!(std::ptr::eq(MetadataStore::global().unwrap(), installed));
}
