//! Binary serializer
//!
//! Turns a [`DeclarationGraph`] into a [`MetaFile`]. The pipeline is:
//! merge categories, drop variadic functions, resolve script name collisions,
//! convert source types into [`TypeEncoding`]s, remove members duplicated
//! from ancestors, then write every record to the heap.
//!
//! Errors are caught per declaration: a soft error drops the declaration and
//! is reported in [`SerializeOutput::skipped`], a hard error aborts the build.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::binary::{BinaryWriter, MetaFileOffset};
use crate::decl::{
    Declaration, DeclarationGraph, DeclCommon, DeclType, FieldDecl, MethodDecl, ModuleDecl,
    PropertyDecl,
};
use crate::encoding::{RecordField, TypeEncoding, MAX_INLINE_COUNT};
use crate::error::{CreationError, CreationResult, DeclarationInfo};
use crate::file::MetaFile;
use crate::filters;
use crate::flags::{self, MetaKind};
use crate::meta::Version;

/// Producer switches
#[derive(Debug, Clone)]
pub struct MetaFileBuilderOptions {
    /// Reject variadic C functions with a soft error
    pub drop_variadic_functions: bool,
    /// Rename declarations whose script names collide within a module
    pub resolve_name_collisions: bool,
    /// Drop members already declared by a base interface or protocol
    pub remove_duplicate_members: bool,
}

impl Default for MetaFileBuilderOptions {
    fn default() -> Self {
        Self {
            drop_variadic_functions: true,
            resolve_name_collisions: true,
            remove_duplicate_members: true,
        }
    }
}

/// Result of a successful build
pub struct SerializeOutput {
    pub file: MetaFile,
    /// Declarations dropped by soft errors
    pub skipped: Vec<CreationError>,
}

// ============================================================================
// Working representation
// ============================================================================

/// Kind of a prepared declaration, in collision priority order (lowest first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum ItemKind {
    EnumConstant,
    Enum,
    Union,
    Struct,
    Var,
    Function,
    Protocol,
    Interface,
}

impl ItemKind {
    /// Suffix appended to a renamed declaration
    pub(crate) fn rename_suffix(self) -> &'static str {
        match self {
            ItemKind::Interface => "Interface",
            ItemKind::Protocol => "Protocol",
            ItemKind::Function => "Function",
            ItemKind::Var | ItemKind::EnumConstant => "Var",
            ItemKind::Struct => "Struct",
            ItemKind::Union => "Union",
            ItemKind::Enum => "Enum",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Item {
    pub(crate) module: usize,
    pub(crate) kind: ItemKind,
    pub(crate) js_name: String,
    pub(crate) decl: Declaration,
}

impl Item {
    pub(crate) fn common(&self) -> Option<&DeclCommon> {
        match &self.decl {
            Declaration::Interface(d) => Some(&d.common),
            Declaration::Protocol(d) => Some(&d.common),
            Declaration::Function(d) => Some(&d.common),
            Declaration::Struct(d) | Declaration::Union(d) => Some(&d.common),
            Declaration::Enum(d) => Some(&d.common),
            Declaration::EnumConstant(d) => Some(&d.common),
            Declaration::Var(d) => Some(&d.common),
            Declaration::Category(_) => None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.decl.name()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PreparedMethod {
    pub(crate) selector: String,
    pub(crate) js_name: String,
    pub(crate) flags: u16,
    pub(crate) introduced: Option<Version>,
    pub(crate) encodings: Vec<TypeEncoding>,
    pub(crate) constructor_tokens: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PreparedProperty {
    pub(crate) name: String,
    pub(crate) js_name: String,
    pub(crate) flags: u16,
    pub(crate) getter: Option<PreparedMethod>,
    pub(crate) setter: Option<PreparedMethod>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PreparedClass {
    /// Native name of the base interface
    pub(crate) base: Option<String>,
    /// Native names of adopted protocols
    pub(crate) protocols: Vec<String>,
    pub(crate) instance_methods: Vec<PreparedMethod>,
    pub(crate) static_methods: Vec<PreparedMethod>,
    pub(crate) instance_properties: Vec<PreparedProperty>,
    pub(crate) static_properties: Vec<PreparedProperty>,
}

#[derive(Debug, Clone)]
pub(crate) enum Body {
    Class(PreparedClass),
    Function { encodings: Vec<TypeEncoding>, flags: u16 },
    Record { fields: Vec<RecordField> },
    JsCode(String),
    Var(TypeEncoding),
}

#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub(crate) module: usize,
    pub(crate) kind: ItemKind,
    pub(crate) name: String,
    pub(crate) js_name: String,
    pub(crate) flags: u16,
    pub(crate) introduced: Option<Version>,
    pub(crate) body: Body,
}

impl Prepared {
    pub(crate) fn meta_kind(&self) -> MetaKind {
        match (&self.body, self.kind) {
            (Body::Class(_), ItemKind::Protocol) => MetaKind::Protocol,
            (Body::Class(_), _) => MetaKind::Interface,
            (Body::Function { .. }, _) => MetaKind::Function,
            (Body::Record { .. }, ItemKind::Union) => MetaKind::Union,
            (Body::Record { .. }, _) => MetaKind::Struct,
            (Body::JsCode(_), _) => MetaKind::JsCode,
            (Body::Var(_), _) => MetaKind::Var,
        }
    }
}

/// Script names of the declarations that types may refer to
#[derive(Default)]
struct Names {
    records: FxHashMap<String, String>,
    interfaces: FxHashMap<String, String>,
    protocols: FxHashMap<String, String>,
    failed_records: FxHashMap<String, CreationError>,
}

impl Names {
    fn protocol_js(&self, native: &str) -> String {
        self.protocols
            .get(native)
            .cloned()
            .unwrap_or_else(|| native.to_string())
    }

    fn record_js(&self, native: &str) -> CreationResult<String> {
        if let Some(js) = self.records.get(native) {
            return Ok(js.clone());
        }
        match self.failed_records.get(native) {
            Some(inner) => Err(CreationError::chain(
                "Can't create meta dependency.",
                inner.clone(),
            )),
            None => Err(CreationError::soft(format!(
                "Can't resolve record declaration '{}'.",
                native
            ))),
        }
    }
}

// ============================================================================
// Serializer
// ============================================================================

/// Builds a metadata file from a declaration graph
pub struct BinarySerializer {
    options: MetaFileBuilderOptions,
}

impl BinarySerializer {
    pub fn new(options: MetaFileBuilderOptions) -> Self {
        Self { options }
    }

    /// Run the whole pipeline
    pub fn serialize(&self, graph: &DeclarationGraph) -> CreationResult<SerializeOutput> {
        let mut skipped = Vec::new();
        let mut items = collect_items(graph)?;

        filters::merge_categories(graph, &mut items, &mut skipped);

        if self.options.drop_variadic_functions {
            items.retain(|item| match &item.decl {
                Declaration::Function(f) if f.is_variadic => {
                    skipped.push(
                        CreationError::soft("Variadic functions are not supported.")
                            .with_declaration(info(graph, item)),
                    );
                    false
                }
                _ => true,
            });
        }

        if self.options.resolve_name_collisions {
            filters::resolve_name_collisions(graph, &mut items);
        }

        let mut prepared = prepare(graph, &items, &mut skipped)?;

        if self.options.remove_duplicate_members {
            filters::remove_duplicate_members(&mut prepared);
        }

        log::debug!(
            "serializing {} declarations ({} skipped)",
            prepared.len(),
            skipped.len()
        );

        let file = write_file(graph, &prepared);
        Ok(SerializeOutput { file, skipped })
    }
}

impl Default for BinarySerializer {
    fn default() -> Self {
        Self::new(MetaFileBuilderOptions::default())
    }
}

fn info(graph: &DeclarationGraph, item: &Item) -> DeclarationInfo {
    DeclarationInfo {
        name: item.name().to_string(),
        js_name: item.js_name.clone(),
        module: graph.modules[item.module].name.clone(),
    }
}

fn collect_items(graph: &DeclarationGraph) -> CreationResult<Vec<Item>> {
    let mut items = Vec::new();
    for (module, decl_module) in graph.modules.iter().enumerate() {
        for decl in &decl_module.declarations {
            if decl.name().is_empty() {
                return Err(CreationError::hard(format!(
                    "Declaration without a name in module '{}'.",
                    decl_module.name
                )));
            }
            let kind = match decl {
                Declaration::Interface(_) => ItemKind::Interface,
                Declaration::Protocol(_) => ItemKind::Protocol,
                Declaration::Function(_) => ItemKind::Function,
                Declaration::Struct(_) => ItemKind::Struct,
                Declaration::Union(_) => ItemKind::Union,
                Declaration::Enum(_) => ItemKind::Enum,
                Declaration::EnumConstant(_) => ItemKind::EnumConstant,
                Declaration::Var(_) => ItemKind::Var,
                // merged into their interface
                Declaration::Category(_) => continue,
            };
            let js_name = match decl {
                Declaration::Interface(d) => d.common.js_name(),
                Declaration::Protocol(d) => d.common.js_name(),
                Declaration::Function(d) => d.common.js_name(),
                Declaration::Struct(d) | Declaration::Union(d) => d.common.js_name(),
                Declaration::Enum(d) => d.common.js_name(),
                Declaration::EnumConstant(d) => d.common.js_name(),
                Declaration::Var(d) => d.common.js_name(),
                Declaration::Category(d) => &d.name,
            };
            items.push(Item {
                module,
                kind,
                js_name: js_name.to_string(),
                decl: decl.clone(),
            });
        }
    }
    Ok(items)
}

// ============================================================================
// Type conversion
// ============================================================================

fn convert_type(ty: &DeclType, names: &Names) -> CreationResult<TypeEncoding> {
    let encoding = match ty {
        DeclType::Void => TypeEncoding::Void,
        DeclType::Bool => TypeEncoding::Bool,
        DeclType::Short => TypeEncoding::Short,
        DeclType::UShort => TypeEncoding::UShort,
        DeclType::Int => TypeEncoding::Int,
        DeclType::UInt => TypeEncoding::UInt,
        DeclType::Long => TypeEncoding::Long,
        DeclType::ULong => TypeEncoding::ULong,
        DeclType::LongLong => TypeEncoding::LongLong,
        DeclType::ULongLong => TypeEncoding::ULongLong,
        DeclType::SignedChar => TypeEncoding::Char,
        DeclType::UnsignedChar => TypeEncoding::UChar,
        DeclType::Char => TypeEncoding::CharS,
        DeclType::Unichar => TypeEncoding::Unichar,
        DeclType::CString => TypeEncoding::CString,
        DeclType::Float => TypeEncoding::Float,
        DeclType::Double => TypeEncoding::Double,
        DeclType::VaList => TypeEncoding::VaList,
        DeclType::Selector => TypeEncoding::Selector,
        DeclType::Instancetype => TypeEncoding::InstanceType,
        DeclType::Protocol => TypeEncoding::ProtocolType,
        DeclType::Class { .. } => TypeEncoding::Class,
        DeclType::Id { protocols } => TypeEncoding::Id {
            protocols: protocols.iter().map(|p| names.protocol_js(p)).collect(),
        },
        DeclType::Interface { name, protocols } => TypeEncoding::InterfaceDeclarationReference {
            name: names
                .interfaces
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.clone()),
            protocols: protocols.iter().map(|p| names.protocol_js(p)).collect(),
        },
        DeclType::BridgedInterface { bridged_to, .. } => match bridged_to {
            Some(target) => convert_type(&DeclType::interface(target.clone()), names)?,
            None => TypeEncoding::id(),
        },
        DeclType::Pointer { target } => TypeEncoding::pointer(convert_type(target, names)?),
        DeclType::ConstantArray { element, size } => TypeEncoding::ConstantArray {
            size: checked_size(*size)?,
            element: Box::new(convert_type(element, names)?),
        },
        DeclType::ExtVector { element, size } => TypeEncoding::Vector {
            size: checked_size(*size)?,
            element: Box::new(convert_type(element, names)?),
        },
        DeclType::IncompleteArray { element } => TypeEncoding::IncompleteArray {
            element: Box::new(convert_type(element, names)?),
        },
        DeclType::Block {
            return_type,
            parameters,
        } => TypeEncoding::Block {
            signature: convert_signature(return_type, parameters, names)?,
        },
        DeclType::FunctionPointer {
            return_type,
            parameters,
        } => TypeEncoding::FunctionPointer {
            signature: convert_signature(return_type, parameters, names)?,
        },
        DeclType::Struct { name } => TypeEncoding::StructDeclarationReference {
            name: names.record_js(name)?,
        },
        DeclType::Union { name } => TypeEncoding::UnionDeclarationReference {
            name: names.record_js(name)?,
        },
        DeclType::AnonymousStruct { fields } => TypeEncoding::AnonymousStruct {
            fields: convert_fields(fields, names)?,
        },
        DeclType::AnonymousUnion { fields } => TypeEncoding::AnonymousUnion {
            fields: convert_fields(fields, names)?,
        },
        DeclType::Enum { underlying, .. } | DeclType::TypeArgument { underlying, .. } => {
            convert_type(underlying, names)?
        }
        DeclType::Unsupported { description } => {
            return Err(CreationError::soft(format!(
                "Unsupported type: {}",
                description
            )))
        }
    };
    Ok(encoding)
}

fn checked_size(size: i32) -> CreationResult<i32> {
    if size < 0 {
        Err(CreationError::hard(format!("Negative array size {}.", size)))
    } else {
        Ok(size)
    }
}

fn convert_signature(
    return_type: &DeclType,
    parameters: &[DeclType],
    names: &Names,
) -> CreationResult<Vec<TypeEncoding>> {
    if parameters.len() + 1 > MAX_INLINE_COUNT {
        return Err(CreationError::soft(format!(
            "Signature with {} parameters exceeds the limit of {}.",
            parameters.len(),
            MAX_INLINE_COUNT - 1
        )));
    }
    std::iter::once(return_type)
        .chain(parameters)
        .map(|ty| convert_type(ty, names))
        .collect()
}

fn convert_fields(fields: &[FieldDecl], names: &Names) -> CreationResult<Vec<RecordField>> {
    if fields.len() > MAX_INLINE_COUNT {
        return Err(CreationError::soft(format!(
            "Anonymous record with {} fields exceeds the limit of {}.",
            fields.len(),
            MAX_INLINE_COUNT
        )));
    }
    fields
        .iter()
        .map(|f| Ok(RecordField::new(f.name.clone(), convert_type(&f.ty, names)?)))
        .collect()
}

/// `alloc`, `new`, `copy` and `mutableCopy` families return a +1 object
pub fn selector_returns_owned(selector: &str) -> bool {
    ["alloc", "new", "copy", "mutableCopy"].iter().any(|family| {
        selector.strip_prefix(family).is_some_and(|rest| {
            rest.is_empty()
                || rest.starts_with(':')
                || rest.chars().next().is_some_and(char::is_uppercase)
        })
    })
}

fn convert_method(method: &MethodDecl, names: &Names) -> CreationResult<PreparedMethod> {
    if method.selector.is_empty() {
        return Err(CreationError::hard("Method without a selector."));
    }
    let encodings = convert_signature(&method.return_type, &method.parameters, names)
        .map_err(|e| {
            CreationError::chain(format!("Can't create method '{}'.", method.selector), e)
        })?;

    let mut flags = 0u16;
    if method.is_optional {
        flags |= flags::member::IS_OPTIONAL;
    }
    if method.is_initializer {
        flags |= flags::method::IS_INITIALIZER;
    }
    if method.is_variadic {
        flags |= flags::method::IS_VARIADIC;
    }
    if method.is_null_terminated_variadic {
        flags |= flags::method::IS_NULL_TERMINATED_VARIADIC;
    }
    if method
        .owns_returned
        .unwrap_or_else(|| selector_returns_owned(&method.selector))
    {
        flags |= flags::method::OWNS_RETURNED_COCOA_OBJECT;
    }
    if method
        .parameters
        .last()
        .is_some_and(DeclType::is_error_out_pointer)
    {
        flags |= flags::method::HAS_ERROR_OUT_PARAMETER;
    }

    Ok(PreparedMethod {
        selector: method.selector.clone(),
        js_name: method.js_name(),
        flags,
        introduced: method.introduced.map(Version::from),
        encodings,
        constructor_tokens: method.constructor_tokens.clone().unwrap_or_default(),
    })
}

fn convert_property(property: &PropertyDecl, names: &Names) -> CreationResult<PreparedProperty> {
    let mut flags = 0u16;
    if property.is_optional {
        flags |= flags::member::IS_OPTIONAL;
    }
    let getter = property
        .getter
        .as_ref()
        .map(|m| convert_method(m, names))
        .transpose()?;
    let setter = property
        .setter
        .as_ref()
        .map(|m| convert_method(m, names))
        .transpose()?;
    if getter.is_some() {
        flags |= flags::property::HAS_GETTER;
    }
    if setter.is_some() {
        flags |= flags::property::HAS_SETTER;
    }
    Ok(PreparedProperty {
        name: property.name.clone(),
        js_name: property.js_name.clone().unwrap_or_else(|| property.name.clone()),
        flags,
        getter,
        setter,
    })
}

/// Convert the members of a class; a member that fails is skipped on its own
fn convert_class(
    base: Option<&String>,
    protocols: &[String],
    methods: &[MethodDecl],
    properties: &[PropertyDecl],
    names: &Names,
    on_error: &mut dyn FnMut(CreationError) -> CreationResult<()>,
) -> CreationResult<PreparedClass> {
    let mut class = PreparedClass {
        base: base.cloned(),
        protocols: protocols.to_vec(),
        ..PreparedClass::default()
    };
    for method in methods {
        match convert_method(method, names) {
            Ok(prepared) if method.is_static => class.static_methods.push(prepared),
            Ok(prepared) => class.instance_methods.push(prepared),
            Err(e) => on_error(e)?,
        }
    }
    for property in properties {
        match convert_property(property, names) {
            Ok(prepared) if property.is_static => class.static_properties.push(prepared),
            Ok(prepared) => class.instance_properties.push(prepared),
            Err(e) => on_error(e)?,
        }
    }
    Ok(class)
}

fn enum_js_code(members: &[crate::decl::EnumMemberDecl]) -> CreationResult<String> {
    let entries = members
        .iter()
        .map(|m| {
            serde_json::to_string(&m.name)
                .map(|name| format!("{}:{}", name, m.value))
                .map_err(|e| CreationError::hard(e.to_string()))
        })
        .collect::<CreationResult<Vec<_>>>()?;
    Ok(format!("__tsEnum({{{}}})", entries.join(",")))
}

fn common_flags(common: &DeclCommon, js_name: &str) -> (u16, Option<Version>) {
    let mut flags = 0u16;
    if common.app_extension_available {
        flags |= flags::common::IS_IOS_APP_EXTENSION_AVAILABLE;
    }
    if common.name != js_name {
        flags |= flags::common::HAS_NAME;
    }
    (flags, common.introduced.map(Version::from))
}

fn prepare(
    graph: &DeclarationGraph,
    items: &[Item],
    skipped: &mut Vec<CreationError>,
) -> CreationResult<Vec<Prepared>> {
    let mut names = Names::default();
    for item in items {
        let map = match item.kind {
            ItemKind::Struct | ItemKind::Union => &mut names.records,
            ItemKind::Interface => &mut names.interfaces,
            ItemKind::Protocol => &mut names.protocols,
            _ => continue,
        };
        map.insert(item.name().to_string(), item.js_name.clone());
    }

    // Records may depend on each other; drop failures until the set is stable.
    let mut records: FxHashMap<String, Vec<RecordField>> = FxHashMap::default();
    loop {
        let mut failed_any = false;
        for item in items {
            let (Declaration::Struct(record) | Declaration::Union(record)) = &item.decl else {
                continue;
            };
            if names.failed_records.contains_key(&record.common.name) {
                continue;
            }
            match convert_fields(&record.fields, &names) {
                Ok(fields) => {
                    records.insert(record.common.name.clone(), fields);
                }
                Err(e) if e.is_hard() => return Err(e.with_declaration(info(graph, item))),
                Err(e) => {
                    names.records.remove(&record.common.name);
                    records.remove(&record.common.name);
                    names.failed_records.insert(record.common.name.clone(), e);
                    failed_any = true;
                }
            }
        }
        if !failed_any {
            break;
        }
    }
    for (name, error) in &names.failed_records {
        let record = items.iter().find(|i| {
            i.name() == name && matches!(i.kind, ItemKind::Struct | ItemKind::Union)
        });
        if let Some(item) = record {
            skipped.push(error.clone().with_declaration(info(graph, item)));
        }
    }

    let mut prepared = Vec::new();
    for item in items {
        let Some(common) = item.common() else {
            continue;
        };
        let (flags, introduced) = common_flags(common, &item.js_name);

        let body = match &item.decl {
            Declaration::Struct(record) | Declaration::Union(record) => {
                match records.remove(&record.common.name) {
                    Some(fields) => Ok(Body::Record { fields }),
                    None => continue,
                }
            }
            Declaration::Interface(d) => {
                let mut on_error = |e: CreationError| -> CreationResult<()> {
                    if e.is_hard() {
                        return Err(e.with_declaration(info(graph, item)));
                    }
                    skipped.push(e.with_declaration(info(graph, item)));
                    Ok(())
                };
                convert_class(
                    d.base.as_ref(),
                    &d.protocols,
                    &d.methods,
                    &d.properties,
                    &names,
                    &mut on_error,
                )
                .map(Body::Class)
            }
            Declaration::Protocol(d) => {
                let mut on_error = |e: CreationError| -> CreationResult<()> {
                    if e.is_hard() {
                        return Err(e.with_declaration(info(graph, item)));
                    }
                    skipped.push(e.with_declaration(info(graph, item)));
                    Ok(())
                };
                convert_class(
                    None,
                    &d.protocols,
                    &d.methods,
                    &d.properties,
                    &names,
                    &mut on_error,
                )
                .map(Body::Class)
            }
            Declaration::Function(d) => {
                convert_signature(&d.return_type, &d.parameters, &names).map(|encodings| {
                    let mut flags = 0u16;
                    if d.is_variadic {
                        flags |= flags::function::IS_VARIADIC;
                    }
                    if d.owns_returned {
                        flags |= flags::function::OWNS_RETURNED_COCOA_OBJECT;
                    }
                    if d.returns_unmanaged {
                        flags |= flags::function::RETURNS_UNMANAGED;
                    }
                    Body::Function { encodings, flags }
                })
            }
            Declaration::Enum(d) => enum_js_code(&d.members).map(Body::JsCode),
            Declaration::EnumConstant(d) => Ok(Body::JsCode(d.value.clone())),
            Declaration::Var(d) => match &d.value {
                Some(value) => Ok(Body::JsCode(value.clone())),
                None => convert_type(&d.ty, &names).map(Body::Var),
            },
            Declaration::Category(_) => continue,
        };

        match body {
            Ok(body) => prepared.push(Prepared {
                module: item.module,
                kind: item.kind,
                name: item.name().to_string(),
                js_name: item.js_name.clone(),
                flags,
                introduced,
                body,
            }),
            Err(e) if e.is_hard() => return Err(e.with_declaration(info(graph, item))),
            Err(e) => skipped.push(e.with_declaration(info(graph, item))),
        }
    }

    // Protocol and base references are written by script name.
    for item in &mut prepared {
        if let Body::Class(class) = &mut item.body {
            class.protocols.retain(|p| names.protocols.contains_key(p));
        }
    }
    Ok(prepared)
}

// ============================================================================
// Writing
// ============================================================================

struct Writer<'a> {
    graph: &'a DeclarationGraph,
    file: MetaFile,
    protocols_js: FxHashMap<&'a str, &'a str>,
    interfaces_js: FxHashMap<&'a str, &'a str>,
}

fn write_file<'a>(graph: &'a DeclarationGraph, prepared: &'a [Prepared]) -> MetaFile {
    let mut writer = Writer {
        graph,
        file: MetaFile::new(prepared.len()),
        protocols_js: FxHashMap::default(),
        interfaces_js: FxHashMap::default(),
    };
    for item in prepared {
        match item.kind {
            ItemKind::Protocol => {
                writer.protocols_js.insert(&item.name, &item.js_name);
            }
            ItemKind::Interface => {
                writer.interfaces_js.insert(&item.name, &item.js_name);
            }
            _ => {}
        }
    }

    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for item in prepared {
        let offset = writer.write_top_level(item);
        if seen.insert(&item.js_name) {
            writer.file.register_in_global_table(&item.js_name, offset);
        } else {
            log::warn!(
                "script name '{}' from module '{}' is already taken",
                item.js_name,
                graph.modules[item.module].name
            );
        }
        match item.kind {
            ItemKind::Interface => writer.file.register_interface(&item.name, offset),
            ItemKind::Protocol => writer.file.register_protocol(&item.name, offset),
            _ => {}
        }
    }
    writer.file
}

impl<'a> Writer<'a> {
    fn heap(&mut self) -> &mut BinaryWriter {
        self.file.heap()
    }

    fn module_offset(&mut self, module: &ModuleDecl) -> MetaFileOffset {
        let top_level = module.top_level_name().to_string();
        let existing = self.file.get_from_top_level_modules_table(&top_level);
        if existing != 0 {
            return existing;
        }

        let mut libraries = Vec::new();
        for library in &module.libraries {
            let name = self.heap().push_string(&library.name);
            let flags = if library.is_framework {
                flags::library::IS_FRAMEWORK
            } else {
                0
            };
            let offset = self.heap().push_byte(flags);
            self.heap().push_pointer(name);
            libraries.push(offset);
        }
        let libraries = self.heap().push_binary_array(&libraries);
        let name = self.heap().push_string(&top_level);

        let mut flags = 0u8;
        if module.is_framework {
            flags |= flags::module::IS_FRAMEWORK;
        }
        if module.is_system {
            flags |= flags::module::IS_SYSTEM;
        }
        let offset = self.heap().push_byte(flags);
        self.heap().push_pointer(name);
        self.heap().push_pointer(libraries);

        self.file
            .register_in_top_level_modules_table(&top_level, offset);
        offset
    }

    /// Write the names block; returns the `names` field and the HasName flag
    fn names(&mut self, name: &str, js_name: &str) -> (MetaFileOffset, u16) {
        if name != js_name {
            let js = self.heap().push_string(js_name);
            let native = self.heap().push_string(name);
            let names = self.heap().push_pointer(js);
            self.heap().push_pointer(native);
            (names, flags::common::HAS_NAME)
        } else {
            (self.heap().push_string(js_name), 0)
        }
    }

    fn header(
        &mut self,
        names: MetaFileOffset,
        module: MetaFileOffset,
        flags: u16,
        introduced: Option<Version>,
    ) -> MetaFileOffset {
        let offset = self.heap().push_pointer(names);
        self.heap().push_pointer(module);
        self.heap().push_short(flags);
        self.heap().push_byte(introduced.map(Version::to_byte).unwrap_or(0));
        offset
    }

    fn write_method(&mut self, method: &PreparedMethod, module: MetaFileOffset) -> MetaFileOffset {
        let (names, has_name) = self.names(&method.selector, &method.js_name);
        let encoding = TypeEncoding::save_list(&method.encodings, self.heap());
        let tokens = self.heap().push_string(&method.constructor_tokens);
        let offset = self.header(names, module, method.flags | has_name, method.introduced);
        self.heap().push_pointer(encoding);
        self.heap().push_pointer(tokens);
        offset
    }

    fn write_property(
        &mut self,
        property: &PreparedProperty,
        module: MetaFileOffset,
    ) -> MetaFileOffset {
        let (names, has_name) = self.names(&property.name, &property.js_name);
        let getter = property.getter.as_ref().map(|m| self.write_method(m, module));
        let setter = property.setter.as_ref().map(|m| self.write_method(m, module));
        let offset = self.header(names, module, property.flags | has_name, None);
        if let Some(getter) = getter {
            self.heap().push_pointer(getter);
        }
        if let Some(setter) = setter {
            self.heap().push_pointer(setter);
        }
        offset
    }

    fn write_methods(
        &mut self,
        methods: &[PreparedMethod],
        module: MetaFileOffset,
    ) -> (MetaFileOffset, i16) {
        let mut sorted: Vec<&PreparedMethod> = methods.iter().collect();
        sorted.sort_by(|a, b| a.js_name.cmp(&b.js_name));
        let first_initializer = sorted
            .iter()
            .position(|m| m.flags & flags::method::IS_INITIALIZER != 0)
            .map(|i| i as i16)
            .unwrap_or(-1);
        let offsets: Vec<_> = sorted.iter().map(|m| self.write_method(m, module)).collect();
        (self.heap().push_binary_array(&offsets), first_initializer)
    }

    fn write_properties(
        &mut self,
        properties: &[PreparedProperty],
        module: MetaFileOffset,
    ) -> MetaFileOffset {
        let mut sorted: Vec<&PreparedProperty> = properties.iter().collect();
        sorted.sort_by(|a, b| a.js_name.cmp(&b.js_name));
        let offsets: Vec<_> = sorted.iter().map(|p| self.write_property(p, module)).collect();
        self.heap().push_binary_array(&offsets)
    }

    fn write_top_level(&mut self, item: &Prepared) -> MetaFileOffset {
        let graph = self.graph;
        let module = self.module_offset(&graph.modules[item.module]);
        let (names, has_name) = self.names(&item.name, &item.js_name);
        let flags = (item.flags & !MetaKind::MASK) | has_name | item.meta_kind().bits();

        match &item.body {
            Body::Class(class) => {
                let (instance_methods, initializers) =
                    self.write_methods(&class.instance_methods, module);
                let (static_methods, _) = self.write_methods(&class.static_methods, module);
                let instance_properties = self.write_properties(&class.instance_properties, module);
                let static_properties = self.write_properties(&class.static_properties, module);

                let mut protocol_names: Vec<String> = class
                    .protocols
                    .iter()
                    .map(|p| {
                        self.protocols_js
                            .get(p.as_str())
                            .map_or(p.clone(), |js| js.to_string())
                    })
                    .collect();
                protocol_names.sort();
                let protocol_offsets: Vec<_> = protocol_names
                    .iter()
                    .map(|p| self.heap().push_string(p))
                    .collect();
                let protocols = if protocol_offsets.is_empty() {
                    0
                } else {
                    self.heap().push_binary_array(&protocol_offsets)
                };

                let base = match (&class.base, item.kind) {
                    (Some(base), ItemKind::Interface) => {
                        let js = self
                            .interfaces_js
                            .get(base.as_str())
                            .map_or(base.clone(), |js| js.to_string());
                        Some(self.heap().push_string(&js))
                    }
                    (None, ItemKind::Interface) => Some(0),
                    _ => None,
                };

                let offset = self.header(names, module, flags, item.introduced);
                self.heap().push_pointer(instance_methods);
                self.heap().push_pointer(static_methods);
                self.heap().push_pointer(instance_properties);
                self.heap().push_pointer(static_properties);
                self.heap().push_pointer(protocols);
                self.heap().push_short(initializers as u16);
                if let Some(base) = base {
                    self.heap().push_pointer(base);
                }
                offset
            }
            Body::Function { encodings, flags: function_flags } => {
                let encoding = TypeEncoding::save_list(encodings, self.heap());
                let offset = self.header(names, module, flags | function_flags, item.introduced);
                self.heap().push_pointer(encoding);
                offset
            }
            Body::Record { fields } => {
                let name_offsets: Vec<_> = fields
                    .iter()
                    .map(|f| self.heap().push_string(&f.name))
                    .collect();
                let field_names = self.heap().push_binary_array(&name_offsets);
                let encodings: Vec<_> = fields.iter().map(|f| f.encoding.clone()).collect();
                let field_encodings = TypeEncoding::save_list(&encodings, self.heap());
                let offset = self.header(names, module, flags, item.introduced);
                self.heap().push_pointer(field_names);
                self.heap().push_pointer(field_encodings);
                offset
            }
            Body::JsCode(code) => {
                let code = self.heap().push_string(code);
                let offset = self.header(names, module, flags, item.introduced);
                self.heap().push_pointer(code);
                offset
            }
            Body::Var(encoding) => {
                let encoding = TypeEncoding::save_list(std::slice::from_ref(encoding), self.heap());
                let offset = self.header(names, module, flags, item.introduced);
                self.heap().push_pointer(encoding);
                offset
            }
        }
    }
}
