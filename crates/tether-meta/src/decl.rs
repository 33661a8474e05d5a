//! Declaration graph consumed by the binary serializer
//!
//! This is the in-memory shape produced by a header-scanning front end. It is
//! serde-serializable so the graph can be handed over as JSON.

use serde::{Deserialize, Serialize};

use crate::meta::Version;

/// A whole declaration graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclarationGraph {
    pub modules: Vec<ModuleDecl>,
}

/// A module and its declarations. Dotted names (`UIKit.UIView`) belong to the
/// top-level module named by their first component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDecl {
    pub name: String,
    #[serde(default)]
    pub is_framework: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub libraries: Vec<LibraryDecl>,
    #[serde(default)]
    pub declarations: Vec<Declaration>,
}

impl ModuleDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_framework: false,
            is_system: false,
            libraries: Vec::new(),
            declarations: Vec::new(),
        }
    }

    /// Name of the top-level module
    pub fn top_level_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryDecl {
    pub name: String,
    #[serde(default)]
    pub is_framework: bool,
}

/// Availability version as written in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDecl {
    pub major: u8,
    #[serde(default)]
    pub minor: u8,
}

impl From<VersionDecl> for Version {
    fn from(v: VersionDecl) -> Self {
        Version {
            major: v.major,
            minor: v.minor,
        }
    }
}

/// Fields every declaration carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclCommon {
    /// Native name
    pub name: String,
    /// Script name; defaults to the native name
    #[serde(default)]
    pub js_name: Option<String>,
    #[serde(default)]
    pub introduced: Option<VersionDecl>,
    #[serde(default)]
    pub app_extension_available: bool,
}

impl DeclCommon {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            js_name: None,
            introduced: None,
            app_extension_available: false,
        }
    }

    pub fn js_name(&self) -> &str {
        self.js_name.as_deref().unwrap_or(&self.name)
    }
}

/// A top-level declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Declaration {
    Interface(InterfaceDecl),
    Protocol(ProtocolDecl),
    Category(CategoryDecl),
    Function(FunctionDecl),
    Struct(RecordDecl),
    Union(RecordDecl),
    Enum(EnumDecl),
    EnumConstant(ConstantDecl),
    Var(VarDecl),
}

impl Declaration {
    /// Native name of the declaration
    pub fn name(&self) -> &str {
        match self {
            Declaration::Interface(d) => &d.common.name,
            Declaration::Protocol(d) => &d.common.name,
            Declaration::Category(d) => &d.name,
            Declaration::Function(d) => &d.common.name,
            Declaration::Struct(d) | Declaration::Union(d) => &d.common.name,
            Declaration::Enum(d) => &d.common.name,
            Declaration::EnumConstant(d) => &d.common.name,
            Declaration::Var(d) => &d.common.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDecl {
    #[serde(flatten)]
    pub common: DeclCommon,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodDecl>,
    #[serde(default)]
    pub properties: Vec<PropertyDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolDecl {
    #[serde(flatten)]
    pub common: DeclCommon,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodDecl>,
    #[serde(default)]
    pub properties: Vec<PropertyDecl>,
}

/// Members added to an existing interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDecl {
    pub name: String,
    /// Native name of the extended interface
    pub extends: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodDecl>,
    #[serde(default)]
    pub properties: Vec<PropertyDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDecl {
    pub selector: String,
    #[serde(default)]
    pub js_name: Option<String>,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_optional: bool,
    #[serde(default)]
    pub is_initializer: bool,
    #[serde(default)]
    pub is_variadic: bool,
    #[serde(default)]
    pub is_null_terminated_variadic: bool,
    /// Explicit ownership of the returned object; inferred from the selector
    /// family when absent
    #[serde(default)]
    pub owns_returned: Option<bool>,
    #[serde(default)]
    pub constructor_tokens: Option<String>,
    #[serde(default)]
    pub introduced: Option<VersionDecl>,
    pub return_type: DeclType,
    #[serde(default)]
    pub parameters: Vec<DeclType>,
}

impl MethodDecl {
    pub fn new(
        selector: impl Into<String>,
        return_type: DeclType,
        parameters: Vec<DeclType>,
    ) -> Self {
        Self {
            selector: selector.into(),
            js_name: None,
            is_static: false,
            is_optional: false,
            is_initializer: false,
            is_variadic: false,
            is_null_terminated_variadic: false,
            owns_returned: None,
            constructor_tokens: None,
            introduced: None,
            return_type,
            parameters,
        }
    }

    /// Script name: the selector with `:` separators removed and each
    /// following segment capitalized, unless given explicitly
    pub fn js_name(&self) -> String {
        if let Some(name) = &self.js_name {
            return name.clone();
        }
        let mut name = String::new();
        for (i, part) in self.selector.split(':').filter(|p| !p.is_empty()).enumerate() {
            if i == 0 {
                name.push_str(part);
            } else {
                let mut chars = part.chars();
                if let Some(first) = chars.next() {
                    name.extend(first.to_uppercase());
                    name.push_str(chars.as_str());
                }
            }
        }
        name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDecl {
    pub name: String,
    #[serde(default)]
    pub js_name: Option<String>,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_optional: bool,
    #[serde(default)]
    pub getter: Option<MethodDecl>,
    #[serde(default)]
    pub setter: Option<MethodDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    #[serde(flatten)]
    pub common: DeclCommon,
    pub return_type: DeclType,
    #[serde(default)]
    pub parameters: Vec<DeclType>,
    #[serde(default)]
    pub is_variadic: bool,
    #[serde(default)]
    pub owns_returned: bool,
    #[serde(default)]
    pub returns_unmanaged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: DeclType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDecl {
    #[serde(flatten)]
    pub common: DeclCommon,
    pub fields: Vec<FieldDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumMemberDecl {
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDecl {
    #[serde(flatten)]
    pub common: DeclCommon,
    pub members: Vec<EnumMemberDecl>,
}

/// An enum member exposed as a global constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantDecl {
    #[serde(flatten)]
    pub common: DeclCommon,
    /// Script literal of the value
    pub value: String,
}

/// Global variable; `value` holds a script literal for compile-time constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    #[serde(flatten)]
    pub common: DeclCommon,
    #[serde(rename = "type")]
    pub ty: DeclType,
    #[serde(default)]
    pub value: Option<String>,
}

/// Source-level type as seen by the front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeclType {
    Void,
    Bool,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    SignedChar,
    UnsignedChar,
    Char,
    Unichar,
    CString,
    Float,
    Double,
    VaList,
    Selector,
    Instancetype,
    Protocol,
    Class {
        #[serde(default)]
        protocols: Vec<String>,
    },
    Id {
        #[serde(default)]
        protocols: Vec<String>,
    },
    Interface {
        name: String,
        #[serde(default)]
        protocols: Vec<String>,
    },
    /// Toll-free bridged reference; `None` bridges to plain `id`
    BridgedInterface {
        name: String,
        #[serde(default)]
        bridged_to: Option<String>,
    },
    Pointer {
        target: Box<DeclType>,
    },
    ConstantArray {
        element: Box<DeclType>,
        size: i32,
    },
    IncompleteArray {
        element: Box<DeclType>,
    },
    ExtVector {
        element: Box<DeclType>,
        size: i32,
    },
    Block {
        return_type: Box<DeclType>,
        #[serde(default)]
        parameters: Vec<DeclType>,
    },
    FunctionPointer {
        return_type: Box<DeclType>,
        #[serde(default)]
        parameters: Vec<DeclType>,
    },
    /// Named struct, by native name
    Struct {
        name: String,
    },
    /// Named union, by native name
    Union {
        name: String,
    },
    AnonymousStruct {
        fields: Vec<FieldDecl>,
    },
    AnonymousUnion {
        fields: Vec<FieldDecl>,
    },
    Enum {
        name: String,
        underlying: Box<DeclType>,
    },
    TypeArgument {
        name: String,
        underlying: Box<DeclType>,
    },
    /// A type the front end could not describe
    Unsupported {
        description: String,
    },
}

impl DeclType {
    pub fn pointer(target: DeclType) -> Self {
        DeclType::Pointer {
            target: Box::new(target),
        }
    }

    pub fn interface(name: impl Into<String>) -> Self {
        DeclType::Interface {
            name: name.into(),
            protocols: Vec::new(),
        }
    }

    pub fn record(name: impl Into<String>) -> Self {
        DeclType::Struct { name: name.into() }
    }

    /// `NSError **`
    pub fn is_error_out_pointer(&self) -> bool {
        match self {
            DeclType::Pointer { target } => matches!(
                target.as_ref(),
                DeclType::Pointer { target } if matches!(
                    target.as_ref(),
                    DeclType::Interface { name, .. } if name == "NSError"
                )
            ),
            _ => false,
        }
    }
}
