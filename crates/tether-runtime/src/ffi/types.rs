//! Native ABI types and struct layouts
//!
//! Every [`TypeEncoding`] maps to an [`AbiType`]. Records expand to a
//! [`StructInfo`] holding the logical field table; the description handed to
//! the call primitive is derived from it on demand and may be flattened
//! without touching the field offsets.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use libffi::middle::Type;
use rustc_hash::FxHashMap;
use tether_meta::{MetadataStore, RecordField, TypeEncoding};

use crate::error::{BridgeError, BridgeResult};
use crate::options::StructPassing;

/// Native type of a value slot
#[derive(Debug, Clone)]
pub enum AbiType {
    Void,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Pointer,
    /// Inline array, only inside records
    Array {
        element: Box<AbiType>,
        count: usize,
        size: usize,
        align: usize,
    },
    Struct(Rc<StructInfo>),
}

/// Where a type appears. Arrays decay to pointers in parameter position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Parameter,
    Field,
}

impl AbiType {
    pub fn size(&self) -> usize {
        match self {
            AbiType::Void => 0,
            AbiType::U8 | AbiType::I8 => 1,
            AbiType::U16 | AbiType::I16 => 2,
            AbiType::U32 | AbiType::I32 | AbiType::F32 => 4,
            AbiType::U64 | AbiType::I64 | AbiType::F64 => 8,
            AbiType::Pointer => mem::size_of::<usize>(),
            AbiType::Array { size, .. } => *size,
            AbiType::Struct(info) => info.size,
        }
    }

    pub fn align(&self) -> usize {
        match self {
            AbiType::Void | AbiType::U8 | AbiType::I8 => 1,
            AbiType::U16 | AbiType::I16 => 2,
            AbiType::U32 | AbiType::I32 | AbiType::F32 => 4,
            AbiType::U64 | AbiType::I64 => mem::align_of::<u64>(),
            AbiType::F64 => mem::align_of::<f64>(),
            AbiType::Pointer => mem::align_of::<usize>(),
            AbiType::Array { align, .. } => *align,
            AbiType::Struct(info) => info.align,
        }
    }

    /// Integer type narrower than a machine word
    pub fn is_small_integer(&self) -> bool {
        matches!(
            self,
            AbiType::U8 | AbiType::I8 | AbiType::U16 | AbiType::I16
        ) || (mem::size_of::<usize>() > 4 && matches!(self, AbiType::U32 | AbiType::I32))
    }

    /// Type description for the call primitive
    pub fn to_ffi(&self, passing: StructPassing) -> Type {
        match self {
            AbiType::Void => Type::void(),
            AbiType::U8 => Type::u8(),
            AbiType::I8 => Type::i8(),
            AbiType::U16 => Type::u16(),
            AbiType::I16 => Type::i16(),
            AbiType::U32 => Type::u32(),
            AbiType::I32 => Type::i32(),
            AbiType::U64 => Type::u64(),
            AbiType::I64 => Type::i64(),
            AbiType::F32 => Type::f32(),
            AbiType::F64 => Type::f64(),
            AbiType::Pointer => Type::pointer(),
            AbiType::Array { .. } => {
                let mut members = Vec::new();
                self.push_member(passing, &mut members);
                Type::structure(members)
            }
            AbiType::Struct(info) => Type::structure(info.ffi_members(passing)),
        }
    }

    fn push_member(&self, passing: StructPassing, out: &mut Vec<Type>) {
        match self {
            AbiType::Array { element, count, .. } => {
                for _ in 0..*count {
                    element.push_member(passing, out);
                }
            }
            AbiType::Struct(info) if passing == StructPassing::Flattened => {
                out.extend(info.ffi_members(passing));
            }
            other => out.push(other.to_ffi(passing)),
        }
    }

    /// Scalar leaves in depth-first order
    pub fn leaves(&self) -> Vec<AbiType> {
        let mut out = Vec::new();
        self.push_leaves(&mut out);
        out
    }

    fn push_leaves(&self, out: &mut Vec<AbiType>) {
        match self {
            AbiType::Array { element, count, .. } => {
                for _ in 0..*count {
                    element.push_leaves(out);
                }
            }
            AbiType::Struct(info) => {
                for field in &info.fields {
                    field.abi.push_leaves(out);
                }
            }
            other => out.push(other.clone()),
        }
    }
}

/// A field of a record with its byte offset
#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub encoding: TypeEncoding,
    pub abi: AbiType,
    pub offset: usize,
}

/// Layout of a struct or union
#[derive(Debug)]
pub struct StructInfo {
    /// Record name, or the structural name of an anonymous record
    pub name: String,
    /// Encoding that resolves back to this record
    pub encoding: TypeEncoding,
    pub fields: Vec<StructField>,
    pub size: usize,
    pub align: usize,
    pub is_union: bool,
}

impl StructInfo {
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub(crate) fn ffi_members(&self, passing: StructPassing) -> Vec<Type> {
        let mut members = Vec::new();
        if self.is_union {
            self.push_union_members(passing, &mut members);
        } else {
            for field in &self.fields {
                field.abi.push_member(passing, &mut members);
            }
        }
        if members.is_empty() {
            members.push(Type::u8());
        }
        members
    }

    /// A union is described by its register class: a float-only union as its
    /// widest member, anything else as integer words of its alignment
    fn push_union_members(&self, passing: StructPassing, out: &mut Vec<Type>) {
        let leaves: Vec<AbiType> = self.fields.iter().flat_map(|f| f.abi.leaves()).collect();
        let float_only = !leaves.is_empty()
            && leaves.iter().all(|l| matches!(l, AbiType::F32 | AbiType::F64));
        if float_only {
            if let Some(widest) = self.fields.iter().max_by_key(|f| f.abi.size()) {
                widest.abi.push_member(passing, out);
                out.extend((widest.abi.size()..self.size).map(|_| Type::u8()));
                return;
            }
        }

        let (word, word_size) = match self.align {
            0 | 1 => (Type::u8(), 1),
            2 => (Type::u16(), 2),
            4 => (Type::u32(), 4),
            _ => (Type::u64(), 8),
        };
        out.extend((0..self.size / word_size).map(|_| word.clone()));
        out.extend((0..self.size % word_size).map(|_| Type::u8()));
    }
}

/// Round `offset` up to a multiple of `align`
pub fn align_to(offset: usize, align: usize) -> usize {
    let align = align.max(1);
    offset.div_ceil(align) * align
}

/// Offsets, size and alignment of a record from its `(size, align)` fields
pub fn record_layout(fields: &[(usize, usize)], is_union: bool) -> (Vec<usize>, usize, usize) {
    let align = fields.iter().map(|&(_, a)| a).max().unwrap_or(1).max(1);
    if is_union {
        let size = fields.iter().map(|&(s, _)| s).max().unwrap_or(0);
        return (vec![0; fields.len()], align_to(size, align), align);
    }

    let mut offsets = Vec::with_capacity(fields.len());
    let mut end = 0;
    for &(size, field_align) in fields {
        let offset = align_to(end, field_align);
        offsets.push(offset);
        end = offset + size;
    }
    (offsets, align_to(end, align), align)
}

/// Structural name of an anonymous record
pub fn structural_name(fields: &[RecordField], is_union: bool) -> String {
    let mut out = String::from(if is_union { "?(" } else { "?{" });
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(&field.name);
        out.push(':');
        push_shape(&mut out, &field.encoding);
    }
    out.push(if is_union { ')' } else { '}' });
    out
}

fn push_shape(out: &mut String, encoding: &TypeEncoding) {
    match encoding {
        TypeEncoding::StructDeclarationReference { name } => {
            out.push_str("struct ");
            out.push_str(name);
        }
        TypeEncoding::UnionDeclarationReference { name } => {
            out.push_str("union ");
            out.push_str(name);
        }
        TypeEncoding::AnonymousStruct { fields } => out.push_str(&structural_name(fields, false)),
        TypeEncoding::AnonymousUnion { fields } => out.push_str(&structural_name(fields, true)),
        TypeEncoding::ConstantArray { size, element } | TypeEncoding::Vector { size, element } => {
            out.push_str(&format!("[{}]", size));
            push_shape(out, element);
        }
        TypeEncoding::Pointer { target } => {
            out.push('*');
            push_shape(out, target);
        }
        other => out.push_str(&format!("{:?}", other.kind())),
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Per-context struct layouts, keyed by structural name
#[derive(Default)]
pub struct StructCache {
    infos: RefCell<FxHashMap<String, Rc<StructInfo>>>,
}

impl StructCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.infos.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.borrow().is_empty()
    }

    /// Native type of an encoding
    pub fn abi_type(
        &self,
        store: &MetadataStore,
        encoding: &TypeEncoding,
        position: Position,
    ) -> BridgeResult<AbiType> {
        let long_is_64 = mem::size_of::<libc::c_long>() == 8;
        Ok(match encoding {
            TypeEncoding::Void => AbiType::Void,
            TypeEncoding::Bool | TypeEncoding::UChar => AbiType::U8,
            TypeEncoding::Char | TypeEncoding::CharS => AbiType::I8,
            TypeEncoding::Short => AbiType::I16,
            TypeEncoding::UShort | TypeEncoding::Unichar => AbiType::U16,
            TypeEncoding::Int => AbiType::I32,
            TypeEncoding::UInt => AbiType::U32,
            TypeEncoding::Long if long_is_64 => AbiType::I64,
            TypeEncoding::Long => AbiType::I32,
            TypeEncoding::ULong if long_is_64 => AbiType::U64,
            TypeEncoding::ULong => AbiType::U32,
            TypeEncoding::LongLong => AbiType::I64,
            TypeEncoding::ULongLong => AbiType::U64,
            TypeEncoding::Float => AbiType::F32,
            TypeEncoding::Double => AbiType::F64,
            TypeEncoding::CString
            | TypeEncoding::InterfaceDeclarationReference { .. }
            | TypeEncoding::Pointer { .. }
            | TypeEncoding::VaList
            | TypeEncoding::Selector
            | TypeEncoding::Class
            | TypeEncoding::ProtocolType
            | TypeEncoding::InstanceType
            | TypeEncoding::Id { .. }
            | TypeEncoding::IncompleteArray { .. }
            | TypeEncoding::FunctionPointer { .. }
            | TypeEncoding::Block { .. } => AbiType::Pointer,
            TypeEncoding::ConstantArray { .. } if position == Position::Parameter => {
                AbiType::Pointer
            }
            TypeEncoding::ConstantArray { size, element } => {
                let element = self.abi_type(store, element, Position::Field)?;
                let count = (*size).max(0) as usize;
                AbiType::Array {
                    size: element.size() * count,
                    align: element.align(),
                    element: Box::new(element),
                    count,
                }
            }
            TypeEncoding::Vector { size, element } => {
                let element = self.abi_type(store, element, Position::Field)?;
                let count = (*size).max(0) as usize;
                let align = (element.size() * count).next_power_of_two().clamp(1, 16);
                AbiType::Array {
                    size: align_to(element.size() * count, align),
                    align,
                    element: Box::new(element),
                    count,
                }
            }
            TypeEncoding::StructDeclarationReference { .. }
            | TypeEncoding::UnionDeclarationReference { .. }
            | TypeEncoding::AnonymousStruct { .. }
            | TypeEncoding::AnonymousUnion { .. } => {
                AbiType::Struct(self.struct_info(store, encoding)?)
            }
        })
    }

    /// Layout of a record encoding, computed once per structural name
    ///
    /// # Panics
    /// When a declaration reference does not resolve to a record.
    pub fn struct_info(
        &self,
        store: &MetadataStore,
        encoding: &TypeEncoding,
    ) -> BridgeResult<Rc<StructInfo>> {
        let (key, fields, is_union) = match encoding {
            TypeEncoding::StructDeclarationReference { name }
            | TypeEncoding::UnionDeclarationReference { name } => {
                if let Some(info) = self.infos.borrow().get(name) {
                    return Ok(info.clone());
                }
                let record = store.record(name);
                let is_union = record.is_union();
                (name.clone(), record.fields, is_union)
            }
            TypeEncoding::AnonymousStruct { fields } => {
                (structural_name(fields, false), fields.clone(), false)
            }
            TypeEncoding::AnonymousUnion { fields } => {
                (structural_name(fields, true), fields.clone(), true)
            }
            other => return Err(BridgeError::UnsupportedEncoding(other.kind())),
        };
        if let Some(info) = self.infos.borrow().get(&key) {
            return Ok(info.clone());
        }

        let abis = fields
            .iter()
            .map(|field| self.abi_type(store, &field.encoding, Position::Field))
            .collect::<BridgeResult<Vec<_>>>()?;
        let sizes: Vec<_> = abis.iter().map(|a| (a.size(), a.align())).collect();
        let (offsets, size, align) = record_layout(&sizes, is_union);

        let info = Rc::new(StructInfo {
            name: key.clone(),
            encoding: encoding.clone(),
            fields: fields
                .into_iter()
                .zip(abis)
                .zip(offsets)
                .map(|((field, abi), offset)| StructField {
                    name: field.name,
                    encoding: field.encoding,
                    abi,
                    offset,
                })
                .collect(),
            size,
            align,
            is_union,
        });
        log::trace!("struct layout {}: {} bytes, align {}", key, size, align);
        Ok(self.infos.borrow_mut().entry(key).or_insert(info).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_formula() {
        // char, double, short, int
        let (offsets, size, align) = record_layout(&[(1, 1), (8, 8), (2, 2), (4, 4)], false);
        assert_eq!(offsets, vec![0, 8, 16, 20]);
        assert_eq!(size, 24);
        assert_eq!(align, 8);

        let (offsets, size, _) = record_layout(&[(4, 4), (1, 1)], false);
        assert_eq!(offsets, vec![0, 4]);
        assert_eq!(size, 8);
    }

    #[test]
    fn test_union_layout() {
        let (offsets, size, align) = record_layout(&[(1, 1), (8, 8), (3, 1)], true);
        assert_eq!(offsets, vec![0, 0, 0]);
        assert_eq!(size, 8);
        assert_eq!(align, 8);
    }

    #[test]
    fn test_empty_layout() {
        let (offsets, size, align) = record_layout(&[], false);
        assert!(offsets.is_empty());
        assert_eq!(size, 0);
        assert_eq!(align, 1);
    }

    #[test]
    fn test_structural_name() {
        let fields = vec![
            RecordField::new("x", TypeEncoding::Double),
            RecordField::new("tag", TypeEncoding::struct_ref("CGSize")),
        ];
        assert_eq!(structural_name(&fields, false), "?{x:Double;tag:struct CGSize}");
        assert_ne!(structural_name(&fields, false), structural_name(&fields, true));
    }

    #[test]
    fn test_leaves_depth_first() {
        let inner = Rc::new(StructInfo {
            name: "inner".into(),
            encoding: TypeEncoding::Void,
            fields: vec![
                StructField {
                    name: "a".into(),
                    encoding: TypeEncoding::Float,
                    abi: AbiType::F32,
                    offset: 0,
                },
                StructField {
                    name: "b".into(),
                    encoding: TypeEncoding::Int,
                    abi: AbiType::I32,
                    offset: 4,
                },
            ],
            size: 8,
            align: 4,
            is_union: false,
        });
        let outer = AbiType::Array {
            element: Box::new(AbiType::Struct(inner)),
            count: 2,
            size: 16,
            align: 4,
        };
        let leaves = outer.leaves();
        assert_eq!(leaves.len(), 4);
        assert!(matches!(leaves[0], AbiType::F32));
        assert!(matches!(leaves[3], AbiType::I32));
    }
}
