//! Typed metadata records
//!
//! Records are decoded from the heap on first use and are immutable after
//! that, so they are shared behind `Arc` by every execution context.

use std::sync::Arc;

use crate::binary::{BinaryReader, DecodeError, MetaFileOffset};
use crate::encoding::{RecordField, TypeEncoding};
use crate::flags::{self, MetaKind};

/// Availability version packed as `major << 3 | minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// Unpack a version byte; 0 means unknown
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte == 0 {
            None
        } else {
            Some(Version {
                major: byte >> 3,
                minor: byte & 0b111,
            })
        }
    }

    /// Pack into a version byte
    pub fn to_byte(self) -> u8 {
        (self.major << 3) | (self.minor & 0b111)
    }
}

/// Fields common to every record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaHeader {
    /// Name exposed to script code
    pub js_name: String,
    /// Native name (selector for methods)
    pub name: String,
    /// Offset of the owning top-level module record
    pub module: MetaFileOffset,
    pub flags: u16,
    pub introduced: Option<Version>,
}

impl MetaHeader {
    /// Decode the header at the reader's position
    pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self, DecodeError> {
        let names = reader.read_pointer()?;
        let module = reader.read_pointer()?;
        let flags = reader.read_u16()?;
        let introduced = Version::from_byte(reader.read_u8()?);

        let (js_name, name) = if flags & flags::common::HAS_NAME != 0 {
            let mut names_reader = BinaryReader::at(reader.buffer(), names);
            let js = names_reader.read_pointer()?;
            let native = names_reader.read_pointer()?;
            (
                reader.string_at(js)?.to_string(),
                reader.string_at(native)?.to_string(),
            )
        } else {
            let js = reader.string_at(names)?.to_string();
            (js.clone(), js)
        };

        Ok(MetaHeader {
            js_name,
            name,
            module,
            flags,
            introduced,
        })
    }

    /// Kind bits of the header
    pub fn kind(&self) -> MetaKind {
        MetaKind::from_flags(self.flags)
    }

    /// Test a flag bit
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

// ============================================================================
// Members
// ============================================================================

/// An instance or class method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodMeta {
    pub header: MetaHeader,
    /// Return type followed by the parameter types
    pub encodings: Arc<[TypeEncoding]>,
    pub constructor_tokens: String,
}

impl MethodMeta {
    fn read(heap: &[u8], offset: MetaFileOffset) -> Result<Self, DecodeError> {
        let mut reader = BinaryReader::at(heap, offset);
        let header = MetaHeader::read(&mut reader)?;
        let encoding = reader.read_pointer()?;
        let tokens = reader.read_pointer()?;
        Ok(MethodMeta {
            header,
            encodings: TypeEncoding::read_list(heap, encoding)?.into(),
            constructor_tokens: if tokens == 0 {
                String::new()
            } else {
                reader.string_at(tokens)?.to_string()
            },
        })
    }

    /// The selector
    pub fn selector(&self) -> &str {
        &self.header.name
    }

    pub fn js_name(&self) -> &str {
        &self.header.js_name
    }

    pub fn return_type(&self) -> &TypeEncoding {
        &self.encodings[0]
    }

    pub fn parameter_types(&self) -> &[TypeEncoding] {
        &self.encodings[1..]
    }

    /// Number of script-visible arguments. A trailing error out-parameter
    /// may be omitted by the caller.
    pub fn arity(&self) -> usize {
        self.parameter_types().len()
    }

    pub fn is_initializer(&self) -> bool {
        self.header.has_flag(flags::method::IS_INITIALIZER)
    }

    pub fn is_variadic(&self) -> bool {
        self.header.has_flag(flags::method::IS_VARIADIC)
    }

    pub fn is_null_terminated_variadic(&self) -> bool {
        self.header.has_flag(flags::method::IS_NULL_TERMINATED_VARIADIC)
    }

    pub fn owns_returned_object(&self) -> bool {
        self.header.has_flag(flags::method::OWNS_RETURNED_COCOA_OBJECT)
    }

    pub fn has_error_out_parameter(&self) -> bool {
        self.header.has_flag(flags::method::HAS_ERROR_OUT_PARAMETER)
    }

    pub fn is_optional(&self) -> bool {
        self.header.has_flag(flags::member::IS_OPTIONAL)
    }
}

/// A declared property with its accessor methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMeta {
    pub header: MetaHeader,
    pub getter: Option<Arc<MethodMeta>>,
    pub setter: Option<Arc<MethodMeta>>,
}

impl PropertyMeta {
    fn read(heap: &[u8], offset: MetaFileOffset) -> Result<Self, DecodeError> {
        let mut reader = BinaryReader::at(heap, offset);
        let header = MetaHeader::read(&mut reader)?;
        let getter = if header.has_flag(flags::property::HAS_GETTER) {
            Some(Arc::new(MethodMeta::read(heap, reader.read_pointer()?)?))
        } else {
            None
        };
        let setter = if header.has_flag(flags::property::HAS_SETTER) {
            Some(Arc::new(MethodMeta::read(heap, reader.read_pointer()?)?))
        } else {
            None
        };
        Ok(PropertyMeta {
            header,
            getter,
            setter,
        })
    }

    pub fn js_name(&self) -> &str {
        &self.header.js_name
    }

    pub fn is_optional(&self) -> bool {
        self.header.has_flag(flags::member::IS_OPTIONAL)
    }
}

// ============================================================================
// Top-level records
// ============================================================================

/// Interface or protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMeta {
    pub header: MetaHeader,
    pub instance_methods: Vec<Arc<MethodMeta>>,
    pub static_methods: Vec<Arc<MethodMeta>>,
    pub instance_properties: Vec<Arc<PropertyMeta>>,
    pub static_properties: Vec<Arc<PropertyMeta>>,
    /// Script names of the adopted protocols
    pub protocols: Vec<String>,
    /// Index of the first initializer among `instance_methods`, or -1
    pub initializers_start_index: i16,
    /// Script name of the base interface. Always `None` for protocols.
    pub base_name: Option<String>,
}

impl ClassMeta {
    fn read(
        heap: &[u8],
        reader: &mut BinaryReader<'_>,
        header: MetaHeader,
    ) -> Result<Self, DecodeError> {
        let instance_methods = reader.read_pointer()?;
        let static_methods = reader.read_pointer()?;
        let instance_properties = reader.read_pointer()?;
        let static_properties = reader.read_pointer()?;
        let protocols = reader.read_pointer()?;
        let initializers_start_index = reader.read_i16()?;
        let base_name = if header.kind() == MetaKind::Interface {
            match reader.read_pointer()? {
                0 => None,
                offset => Some(reader.string_at(offset)?.to_string()),
            }
        } else {
            None
        };

        let methods = |offset| -> Result<Vec<Arc<MethodMeta>>, DecodeError> {
            reader
                .array_at(offset)?
                .into_iter()
                .map(|m| MethodMeta::read(heap, m).map(Arc::new))
                .collect()
        };
        let properties = |offset| -> Result<Vec<Arc<PropertyMeta>>, DecodeError> {
            reader
                .array_at(offset)?
                .into_iter()
                .map(|p| PropertyMeta::read(heap, p).map(Arc::new))
                .collect()
        };

        Ok(ClassMeta {
            instance_methods: methods(instance_methods)?,
            static_methods: methods(static_methods)?,
            instance_properties: properties(instance_properties)?,
            static_properties: properties(static_properties)?,
            protocols: reader.strings_at(protocols)?,
            initializers_start_index,
            base_name,
            header,
        })
    }

    pub fn is_protocol(&self) -> bool {
        self.header.kind() == MetaKind::Protocol
    }

    /// Initializer methods (`init…`) of the interface
    pub fn initializers(&self) -> &[Arc<MethodMeta>] {
        if self.initializers_start_index < 0 {
            return &[];
        }
        let start = (self.initializers_start_index as usize).min(self.instance_methods.len());
        &self.instance_methods[start..]
    }

    /// Directly declared methods with the given script name
    pub fn methods_named(
        &self,
        js_name: &str,
        is_static: bool,
    ) -> impl Iterator<Item = &Arc<MethodMeta>> {
        let list = if is_static {
            &self.static_methods
        } else {
            &self.instance_methods
        };
        let js_name = js_name.to_string();
        list.iter().filter(move |m| m.js_name() == js_name)
    }

    /// Directly declared property with the given script name
    pub fn property_named(&self, js_name: &str, is_static: bool) -> Option<&Arc<PropertyMeta>> {
        let list = if is_static {
            &self.static_properties
        } else {
            &self.instance_properties
        };
        list.iter().find(|p| p.js_name() == js_name)
    }
}

/// Native C function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionMeta {
    pub header: MetaHeader,
    /// Return type followed by the parameter types
    pub encodings: Arc<[TypeEncoding]>,
}

impl FunctionMeta {
    pub fn return_type(&self) -> &TypeEncoding {
        &self.encodings[0]
    }

    pub fn parameter_types(&self) -> &[TypeEncoding] {
        &self.encodings[1..]
    }

    pub fn owns_returned_object(&self) -> bool {
        self.header.has_flag(flags::function::OWNS_RETURNED_COCOA_OBJECT)
    }

    pub fn returns_unmanaged(&self) -> bool {
        self.header.has_flag(flags::function::RETURNS_UNMANAGED)
    }

    pub fn is_variadic(&self) -> bool {
        self.header.has_flag(flags::function::IS_VARIADIC)
    }
}

/// Struct or union declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub header: MetaHeader,
    pub fields: Vec<RecordField>,
}

impl RecordMeta {
    pub fn is_union(&self) -> bool {
        self.header.kind() == MetaKind::Union
    }
}

/// Enum, enum constant or constant var with a literal value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsCodeMeta {
    pub header: MetaHeader,
    pub js_code: String,
}

const ENUM_PREFIX: &str = "__tsEnum(";

impl JsCodeMeta {
    /// Whether the code describes an enum table
    pub fn is_enum(&self) -> bool {
        self.js_code.starts_with(ENUM_PREFIX) && self.js_code.ends_with(')')
    }

    /// Members of an enum table
    pub fn enum_members(&self) -> Option<Vec<(String, f64)>> {
        let body = self
            .js_code
            .strip_prefix(ENUM_PREFIX)?
            .strip_suffix(')')?;
        let table: serde_json::Map<String, serde_json::Value> = serde_json::from_str(body).ok()?;
        Some(
            table
                .into_iter()
                .filter_map(|(name, value)| value.as_f64().map(|v| (name, v)))
                .collect(),
        )
    }

    /// Value of a scalar constant
    pub fn constant_value(&self) -> Option<serde_json::Value> {
        if self.is_enum() {
            return None;
        }
        serde_json::from_str(&self.js_code).ok()
    }
}

/// Global variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarMeta {
    pub header: MetaHeader,
    pub encoding: TypeEncoding,
}

/// Any top-level record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Meta {
    Class(ClassMeta),
    Function(FunctionMeta),
    Record(RecordMeta),
    JsCode(JsCodeMeta),
    Var(VarMeta),
}

impl Meta {
    /// Decode the top-level record at `offset`
    pub fn read(heap: &[u8], offset: MetaFileOffset) -> Result<Meta, DecodeError> {
        if offset == 0 {
            return Err(DecodeError::NullOffset);
        }
        let mut reader = BinaryReader::at(heap, offset);
        let header = MetaHeader::read(&mut reader)?;

        let meta = match header.kind() {
            MetaKind::Interface | MetaKind::Protocol => {
                Meta::Class(ClassMeta::read(heap, &mut reader, header)?)
            }
            MetaKind::Function => {
                let encoding = reader.read_pointer()?;
                Meta::Function(FunctionMeta {
                    header,
                    encodings: TypeEncoding::read_list(heap, encoding)?.into(),
                })
            }
            MetaKind::Struct | MetaKind::Union => {
                let names = reader.read_pointer()?;
                let encodings = reader.read_pointer()?;
                let names = reader.strings_at(names)?;
                let encodings = TypeEncoding::read_list(heap, encodings)?;
                let fields = names
                    .into_iter()
                    .zip(encodings)
                    .map(|(name, encoding)| RecordField { name, encoding })
                    .collect();
                Meta::Record(RecordMeta { header, fields })
            }
            MetaKind::JsCode => {
                let code = reader.read_pointer()?;
                Meta::JsCode(JsCodeMeta {
                    js_code: reader.string_at(code)?.to_string(),
                    header,
                })
            }
            MetaKind::Var => {
                let encoding = reader.read_pointer()?;
                let mut list = TypeEncoding::read_list(heap, encoding)?;
                if list.is_empty() {
                    return Err(DecodeError::UnexpectedEnd(encoding as usize));
                }
                Meta::Var(VarMeta {
                    header,
                    encoding: list.swap_remove(0),
                })
            }
            MetaKind::Undefined => {
                return Err(DecodeError::InvalidKind(0, offset as usize));
            }
        };
        Ok(meta)
    }

    pub fn header(&self) -> &MetaHeader {
        match self {
            Meta::Class(m) => &m.header,
            Meta::Function(m) => &m.header,
            Meta::Record(m) => &m.header,
            Meta::JsCode(m) => &m.header,
            Meta::Var(m) => &m.header,
        }
    }

    pub fn js_name(&self) -> &str {
        &self.header().js_name
    }

    pub fn name(&self) -> &str {
        &self.header().name
    }

    pub fn kind(&self) -> MetaKind {
        self.header().kind()
    }

    pub fn as_class(&self) -> Option<&ClassMeta> {
        match self {
            Meta::Class(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionMeta> {
        match self {
            Meta::Function(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordMeta> {
        match self {
            Meta::Record(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_js_code(&self) -> Option<&JsCodeMeta> {
        match self {
            Meta::JsCode(m) => Some(m),
            _ => None,
        }
    }
}

// ============================================================================
// Modules
// ============================================================================

/// A library linked by a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryMeta {
    pub flags: u8,
    pub name: String,
}

impl LibraryMeta {
    pub fn is_framework(&self) -> bool {
        self.flags & flags::library::IS_FRAMEWORK != 0
    }
}

/// A top-level module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMeta {
    pub flags: u8,
    pub name: String,
    pub libraries: Vec<LibraryMeta>,
}

impl ModuleMeta {
    /// Decode the module record at `offset`
    pub fn read(heap: &[u8], offset: MetaFileOffset) -> Result<Self, DecodeError> {
        if offset == 0 {
            return Err(DecodeError::NullOffset);
        }
        let mut reader = BinaryReader::at(heap, offset);
        let flags = reader.read_u8()?;
        let name = reader.read_pointer()?;
        let libraries = reader.read_pointer()?;

        let libraries = reader
            .array_at(libraries)?
            .into_iter()
            .map(|library| {
                let mut lib_reader = BinaryReader::at(heap, library);
                let flags = lib_reader.read_u8()?;
                let name = lib_reader.read_pointer()?;
                Ok(LibraryMeta {
                    flags,
                    name: reader.string_at(name)?.to_string(),
                })
            })
            .collect::<Result<_, DecodeError>>()?;

        Ok(ModuleMeta {
            flags,
            name: reader.string_at(name)?.to_string(),
            libraries,
        })
    }

    pub fn is_framework(&self) -> bool {
        self.flags & flags::module::IS_FRAMEWORK != 0
    }

    pub fn is_system(&self) -> bool {
        self.flags & flags::module::IS_SYSTEM != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn js_code(code: &str) -> JsCodeMeta {
        JsCodeMeta {
            header: MetaHeader {
                js_name: "E".into(),
                name: "E".into(),
                module: 0,
                flags: MetaKind::JsCode.bits(),
                introduced: None,
            },
            js_code: code.into(),
        }
    }

    #[test]
    fn test_version_packing() {
        let version = Version { major: 13, minor: 4 };
        assert_eq!(Version::from_byte(version.to_byte()), Some(version));
        assert_eq!(Version::from_byte(0), None);
    }

    #[test]
    fn test_enum_members() {
        let meta = js_code(r#"__tsEnum({"Left":0,"Right":1,"Huge":18446744073709551615})"#);
        assert!(meta.is_enum());
        let members = meta.enum_members().unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.contains(&("Right".to_string(), 1.0)));
    }

    #[test]
    fn test_constant_value() {
        let meta = js_code("42");
        assert!(!meta.is_enum());
        assert_eq!(meta.constant_value(), Some(serde_json::json!(42)));
        assert_eq!(meta.enum_members(), None);
    }
}
