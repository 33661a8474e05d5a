//! Type encodings
//!
//! A [`TypeEncoding`] is a recursive, tagged description of a native value's
//! type. The binary form is a one-byte tag followed by a kind-specific
//! payload. Names are stored as heap string offsets; nested encodings are
//! written inline so that a list of encodings is one contiguous run of bytes.

use serde::{Deserialize, Serialize};

use crate::binary::{BinaryReader, BinaryWriter, DecodeError, MetaFileOffset};

/// Longest signature or anonymous field list an encoding can hold; the count is one byte
pub const MAX_INLINE_COUNT: usize = u8::MAX as usize;

/// Binary tag of a type encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void = 0,
    Bool,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Char,
    UChar,
    Unichar,
    CharS,
    CString,
    Float,
    Double,
    InterfaceDeclarationReference,
    StructDeclarationReference,
    UnionDeclarationReference,
    Pointer,
    VaList,
    Selector,
    Class,
    ProtocolType,
    InstanceType,
    Id,
    ConstantArray,
    IncompleteArray,
    FunctionPointer,
    Block,
    AnonymousStruct,
    AnonymousUnion,
    Vector,
}

impl TypeKind {
    const ALL: [TypeKind; 34] = [
        TypeKind::Void,
        TypeKind::Bool,
        TypeKind::Short,
        TypeKind::UShort,
        TypeKind::Int,
        TypeKind::UInt,
        TypeKind::Long,
        TypeKind::ULong,
        TypeKind::LongLong,
        TypeKind::ULongLong,
        TypeKind::Char,
        TypeKind::UChar,
        TypeKind::Unichar,
        TypeKind::CharS,
        TypeKind::CString,
        TypeKind::Float,
        TypeKind::Double,
        TypeKind::InterfaceDeclarationReference,
        TypeKind::StructDeclarationReference,
        TypeKind::UnionDeclarationReference,
        TypeKind::Pointer,
        TypeKind::VaList,
        TypeKind::Selector,
        TypeKind::Class,
        TypeKind::ProtocolType,
        TypeKind::InstanceType,
        TypeKind::Id,
        TypeKind::ConstantArray,
        TypeKind::IncompleteArray,
        TypeKind::FunctionPointer,
        TypeKind::Block,
        TypeKind::AnonymousStruct,
        TypeKind::AnonymousUnion,
        TypeKind::Vector,
    ];

    /// Convert a tag byte into a kind
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// The tag byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A named field of an anonymous record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordField {
    pub name: String,
    pub encoding: TypeEncoding,
}

impl RecordField {
    pub fn new(name: impl Into<String>, encoding: TypeEncoding) -> Self {
        Self {
            name: name.into(),
            encoding,
        }
    }
}

/// Description of a native type
///
/// Structurally identical trees compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeEncoding {
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
    Char,
    UChar,
    Unichar,
    CharS,
    CString,
    Float,
    Double,
    InterfaceDeclarationReference {
        name: String,
        #[serde(default)]
        protocols: Vec<String>,
    },
    StructDeclarationReference {
        name: String,
    },
    UnionDeclarationReference {
        name: String,
    },
    Pointer {
        target: Box<TypeEncoding>,
    },
    VaList,
    Selector,
    Class,
    ProtocolType,
    InstanceType,
    Id {
        #[serde(default)]
        protocols: Vec<String>,
    },
    ConstantArray {
        size: i32,
        element: Box<TypeEncoding>,
    },
    IncompleteArray {
        element: Box<TypeEncoding>,
    },
    /// Return type first, then the parameters
    FunctionPointer {
        signature: Vec<TypeEncoding>,
    },
    /// Return type first, then the parameters (the block literal itself is implicit)
    Block {
        signature: Vec<TypeEncoding>,
    },
    AnonymousStruct {
        fields: Vec<RecordField>,
    },
    AnonymousUnion {
        fields: Vec<RecordField>,
    },
    Vector {
        size: i32,
        element: Box<TypeEncoding>,
    },
}

impl TypeEncoding {
    /// Shorthand for a pointer to `target`
    pub fn pointer(target: TypeEncoding) -> Self {
        TypeEncoding::Pointer {
            target: Box::new(target),
        }
    }

    /// Shorthand for a struct declaration reference
    pub fn struct_ref(name: impl Into<String>) -> Self {
        TypeEncoding::StructDeclarationReference { name: name.into() }
    }

    /// Shorthand for a bare `id`
    pub fn id() -> Self {
        TypeEncoding::Id {
            protocols: Vec::new(),
        }
    }

    /// The binary tag of this encoding
    pub fn kind(&self) -> TypeKind {
        match self {
            TypeEncoding::Void => TypeKind::Void,
            TypeEncoding::Bool => TypeKind::Bool,
            TypeEncoding::Short => TypeKind::Short,
            TypeEncoding::UShort => TypeKind::UShort,
            TypeEncoding::Int => TypeKind::Int,
            TypeEncoding::UInt => TypeKind::UInt,
            TypeEncoding::Long => TypeKind::Long,
            TypeEncoding::ULong => TypeKind::ULong,
            TypeEncoding::LongLong => TypeKind::LongLong,
            TypeEncoding::ULongLong => TypeKind::ULongLong,
            TypeEncoding::Char => TypeKind::Char,
            TypeEncoding::UChar => TypeKind::UChar,
            TypeEncoding::Unichar => TypeKind::Unichar,
            TypeEncoding::CharS => TypeKind::CharS,
            TypeEncoding::CString => TypeKind::CString,
            TypeEncoding::Float => TypeKind::Float,
            TypeEncoding::Double => TypeKind::Double,
            TypeEncoding::InterfaceDeclarationReference { .. } => {
                TypeKind::InterfaceDeclarationReference
            }
            TypeEncoding::StructDeclarationReference { .. } => TypeKind::StructDeclarationReference,
            TypeEncoding::UnionDeclarationReference { .. } => TypeKind::UnionDeclarationReference,
            TypeEncoding::Pointer { .. } => TypeKind::Pointer,
            TypeEncoding::VaList => TypeKind::VaList,
            TypeEncoding::Selector => TypeKind::Selector,
            TypeEncoding::Class => TypeKind::Class,
            TypeEncoding::ProtocolType => TypeKind::ProtocolType,
            TypeEncoding::InstanceType => TypeKind::InstanceType,
            TypeEncoding::Id { .. } => TypeKind::Id,
            TypeEncoding::ConstantArray { .. } => TypeKind::ConstantArray,
            TypeEncoding::IncompleteArray { .. } => TypeKind::IncompleteArray,
            TypeEncoding::FunctionPointer { .. } => TypeKind::FunctionPointer,
            TypeEncoding::Block { .. } => TypeKind::Block,
            TypeEncoding::AnonymousStruct { .. } => TypeKind::AnonymousStruct,
            TypeEncoding::AnonymousUnion { .. } => TypeKind::AnonymousUnion,
            TypeEncoding::Vector { .. } => TypeKind::Vector,
        }
    }

    // ===== Serialization =====

    /// Append this encoding to the heap and return its offset
    pub fn save(&self, writer: &mut BinaryWriter) -> MetaFileOffset {
        let mut bytes = Vec::new();
        self.encode_into(writer, &mut bytes);
        writer.push_bytes(&bytes)
    }

    /// Append an encoding list (4-byte count followed by inline encodings)
    pub fn save_list(encodings: &[TypeEncoding], writer: &mut BinaryWriter) -> MetaFileOffset {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(encodings.len() as u32).to_le_bytes());
        for encoding in encodings {
            encoding.encode_into(writer, &mut bytes);
        }
        writer.push_bytes(&bytes)
    }

    // Strings and protocol arrays go to the heap first so the encoding bytes
    // themselves stay contiguous.
    fn encode_into(&self, heap: &mut BinaryWriter, out: &mut Vec<u8>) {
        out.push(self.kind().to_u8());
        match self {
            TypeEncoding::InterfaceDeclarationReference { name, protocols } => {
                let name = heap.push_string(name);
                let protocols = save_protocols(protocols, heap);
                out.extend_from_slice(&name.to_le_bytes());
                out.extend_from_slice(&protocols.to_le_bytes());
            }
            TypeEncoding::StructDeclarationReference { name }
            | TypeEncoding::UnionDeclarationReference { name } => {
                let name = heap.push_string(name);
                out.extend_from_slice(&name.to_le_bytes());
            }
            TypeEncoding::Id { protocols } => {
                let protocols = save_protocols(protocols, heap);
                out.extend_from_slice(&protocols.to_le_bytes());
            }
            TypeEncoding::Pointer { target } => target.encode_into(heap, out),
            TypeEncoding::IncompleteArray { element } => element.encode_into(heap, out),
            TypeEncoding::ConstantArray { size, element }
            | TypeEncoding::Vector { size, element } => {
                out.extend_from_slice(&size.to_le_bytes());
                element.encode_into(heap, out);
            }
            TypeEncoding::FunctionPointer { signature } | TypeEncoding::Block { signature } => {
                debug_assert!(signature.len() <= MAX_INLINE_COUNT);
                out.push(signature.len() as u8);
                for encoding in signature {
                    encoding.encode_into(heap, out);
                }
            }
            TypeEncoding::AnonymousStruct { fields } | TypeEncoding::AnonymousUnion { fields } => {
                debug_assert!(fields.len() <= MAX_INLINE_COUNT);
                out.push(fields.len() as u8);
                for field in fields {
                    let name = heap.push_string(&field.name);
                    out.extend_from_slice(&name.to_le_bytes());
                }
                for field in fields {
                    field.encoding.encode_into(heap, out);
                }
            }
            _ => {}
        }
    }

    /// Decode one encoding at the reader's position
    pub fn read(reader: &mut BinaryReader<'_>) -> Result<TypeEncoding, DecodeError> {
        let position = reader.position();
        let tag = reader.read_u8()?;
        let kind = TypeKind::from_u8(tag).ok_or(DecodeError::InvalidTag(tag, position))?;

        let encoding = match kind {
            TypeKind::Void => TypeEncoding::Void,
            TypeKind::Bool => TypeEncoding::Bool,
            TypeKind::Short => TypeEncoding::Short,
            TypeKind::UShort => TypeEncoding::UShort,
            TypeKind::Int => TypeEncoding::Int,
            TypeKind::UInt => TypeEncoding::UInt,
            TypeKind::Long => TypeEncoding::Long,
            TypeKind::ULong => TypeEncoding::ULong,
            TypeKind::LongLong => TypeEncoding::LongLong,
            TypeKind::ULongLong => TypeEncoding::ULongLong,
            TypeKind::Char => TypeEncoding::Char,
            TypeKind::UChar => TypeEncoding::UChar,
            TypeKind::Unichar => TypeEncoding::Unichar,
            TypeKind::CharS => TypeEncoding::CharS,
            TypeKind::CString => TypeEncoding::CString,
            TypeKind::Float => TypeEncoding::Float,
            TypeKind::Double => TypeEncoding::Double,
            TypeKind::VaList => TypeEncoding::VaList,
            TypeKind::Selector => TypeEncoding::Selector,
            TypeKind::Class => TypeEncoding::Class,
            TypeKind::ProtocolType => TypeEncoding::ProtocolType,
            TypeKind::InstanceType => TypeEncoding::InstanceType,
            TypeKind::InterfaceDeclarationReference => {
                let name = reader.read_pointer()?;
                let protocols = reader.read_pointer()?;
                TypeEncoding::InterfaceDeclarationReference {
                    name: reader.string_at(name)?.to_string(),
                    protocols: reader.strings_at(protocols)?,
                }
            }
            TypeKind::StructDeclarationReference => {
                let name = reader.read_pointer()?;
                TypeEncoding::StructDeclarationReference {
                    name: reader.string_at(name)?.to_string(),
                }
            }
            TypeKind::UnionDeclarationReference => {
                let name = reader.read_pointer()?;
                TypeEncoding::UnionDeclarationReference {
                    name: reader.string_at(name)?.to_string(),
                }
            }
            TypeKind::Id => {
                let protocols = reader.read_pointer()?;
                TypeEncoding::Id {
                    protocols: reader.strings_at(protocols)?,
                }
            }
            TypeKind::Pointer => TypeEncoding::Pointer {
                target: Box::new(TypeEncoding::read(reader)?),
            },
            TypeKind::IncompleteArray => TypeEncoding::IncompleteArray {
                element: Box::new(TypeEncoding::read(reader)?),
            },
            TypeKind::ConstantArray => {
                let size = reader.read_i32()?;
                TypeEncoding::ConstantArray {
                    size,
                    element: Box::new(TypeEncoding::read(reader)?),
                }
            }
            TypeKind::Vector => {
                let size = reader.read_i32()?;
                TypeEncoding::Vector {
                    size,
                    element: Box::new(TypeEncoding::read(reader)?),
                }
            }
            TypeKind::FunctionPointer => TypeEncoding::FunctionPointer {
                signature: read_inline(reader)?,
            },
            TypeKind::Block => TypeEncoding::Block {
                signature: read_inline(reader)?,
            },
            TypeKind::AnonymousStruct => TypeEncoding::AnonymousStruct {
                fields: read_fields(reader)?,
            },
            TypeKind::AnonymousUnion => TypeEncoding::AnonymousUnion {
                fields: read_fields(reader)?,
            },
        };

        Ok(encoding)
    }

    /// Decode an encoding list stored at `offset`
    pub fn read_list(
        heap: &[u8],
        offset: MetaFileOffset,
    ) -> Result<Vec<TypeEncoding>, DecodeError> {
        if offset == 0 {
            return Err(DecodeError::NullOffset);
        }
        let mut reader = BinaryReader::at(heap, offset);
        let count = reader.read_u32()?;
        (0..count).map(|_| TypeEncoding::read(&mut reader)).collect()
    }
}

fn save_protocols(protocols: &[String], heap: &mut BinaryWriter) -> MetaFileOffset {
    if protocols.is_empty() {
        return 0;
    }
    let offsets: Vec<_> = protocols.iter().map(|p| heap.push_string(p)).collect();
    heap.push_binary_array(&offsets)
}

fn read_inline(reader: &mut BinaryReader<'_>) -> Result<Vec<TypeEncoding>, DecodeError> {
    let count = reader.read_u8()?;
    (0..count).map(|_| TypeEncoding::read(reader)).collect()
}

fn read_fields(reader: &mut BinaryReader<'_>) -> Result<Vec<RecordField>, DecodeError> {
    let count = reader.read_u8()? as usize;
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = reader.read_pointer()?;
        names.push(reader.string_at(offset)?.to_string());
    }
    names
        .into_iter()
        .map(|name| Ok(RecordField::new(name, TypeEncoding::read(reader)?)))
        .collect()
}
