//! Call layouts and per-call arenas
//!
//! A [`CallLayout`] is computed once per signature: the call interface for
//! the primitive plus the offsets of every argument slot and the return slot
//! inside one arena. Arena layout:
//!
//! ```text
//! [argument pointer array][slot 0][slot 1]...[return slot]
//! ```
//!
//! Each slot is at least a machine word and rounded to the slot granularity.

use std::ffi::c_void;
use std::mem;
use std::sync::Arc;

use libffi::middle::{Cif, CodePtr};
use libffi::raw;
use tether_meta::TypeEncoding;

use super::buffer::RawBuffer;
use super::types::{align_to, AbiType};
use crate::defaults::{DEFAULT_MIN_SLOT_SIZE, DEFAULT_SLOT_GRANULARITY};
use crate::options::StructPassing;

/// Signature with the return type first
pub type Signature = Arc<[TypeEncoding]>;

/// Cache key: signature identity plus the implicit leading parameter count
pub type LayoutKey = (usize, usize);

pub fn layout_key(signature: &Signature, implicit: usize) -> LayoutKey {
    (Arc::as_ptr(signature) as *const TypeEncoding as usize, implicit)
}

fn slot_size(size: usize) -> usize {
    align_to(size.max(DEFAULT_MIN_SLOT_SIZE), DEFAULT_SLOT_GRANULARITY)
}

/// Call interface and arena layout for one signature
pub struct CallLayout {
    cif: Cif,
    /// Keeps the signature alive so its address stays a valid cache key
    signature: Signature,
    implicit: usize,
    params: Vec<AbiType>,
    ret: AbiType,
    arg_offsets: Vec<usize>,
    ret_offset: usize,
    size: usize,
}

impl CallLayout {
    /// `params` includes the implicit leading parameters
    pub fn new(
        signature: Signature,
        implicit: usize,
        params: Vec<AbiType>,
        ret: AbiType,
        passing: StructPassing,
    ) -> Self {
        let cif = Cif::new(params.iter().map(|p| p.to_ffi(passing)), ret.to_ffi(passing));

        let mut offset = slot_size(params.len() * mem::size_of::<*mut c_void>());
        let mut arg_offsets = Vec::with_capacity(params.len());
        for param in &params {
            arg_offsets.push(offset);
            offset += slot_size(param.size());
        }
        let ret_offset = offset;
        let size = ret_offset + slot_size(ret.size());

        log::trace!(
            "call layout: {} parameters ({} implicit), arena {} bytes",
            params.len(),
            implicit,
            size
        );

        Self {
            cif,
            signature,
            implicit,
            params,
            ret,
            arg_offsets,
            ret_offset,
            size,
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn implicit(&self) -> usize {
        self.implicit
    }

    /// Parameter count including the implicit ones
    pub fn arg_count(&self) -> usize {
        self.params.len()
    }

    pub fn param(&self, index: usize) -> &AbiType {
        &self.params[index]
    }

    pub fn ret(&self) -> &AbiType {
        &self.ret
    }

    pub fn arena_size(&self) -> usize {
        self.size
    }

    pub fn arg_offset(&self, index: usize) -> usize {
        self.arg_offsets[index]
    }

    pub fn ret_offset(&self) -> usize {
        self.ret_offset
    }

    pub(crate) fn cif(&self) -> &Cif {
        &self.cif
    }
}

/// One call's arena
pub struct CallFrame<'a> {
    layout: &'a CallLayout,
    arena: RawBuffer,
}

impl<'a> CallFrame<'a> {
    pub fn new(layout: &'a CallLayout) -> Self {
        let arena = RawBuffer::zeroed(layout.size, DEFAULT_SLOT_GRANULARITY);
        let base = arena.as_ptr();
        let pointers = base as *mut *mut c_void;
        for (i, &offset) in layout.arg_offsets.iter().enumerate() {
            unsafe { *pointers.add(i) = base.add(offset) as *mut c_void };
        }
        Self { layout, arena }
    }

    pub fn layout(&self) -> &CallLayout {
        self.layout
    }

    /// Storage of argument `index`
    pub fn arg_slot(&self, index: usize) -> *mut u8 {
        let offset = self.layout.arg_offset(index);
        self.checked(offset, self.layout.params[index].size())
    }

    pub fn ret_slot(&self) -> *mut u8 {
        self.checked(self.layout.ret_offset, self.layout.ret.size())
    }

    fn checked(&self, offset: usize, size: usize) -> *mut u8 {
        assert!(
            offset + size <= self.arena.len(),
            "arena slot {}+{} out of bounds ({} bytes)",
            offset,
            size,
            self.arena.len()
        );
        unsafe { self.arena.as_ptr().add(offset) }
    }

    /// Call `function` with the arguments currently in the slots
    ///
    /// # Safety
    /// `function` must be a native function with exactly the layout's signature.
    pub unsafe fn invoke(&mut self, function: *const c_void) {
        let code = CodePtr(function as *mut c_void);
        unsafe {
            raw::ffi_call(
                self.layout.cif.as_raw_ptr(),
                Some(*code.as_safe_fun()),
                self.ret_slot() as *mut c_void,
                self.arena.as_ptr() as *mut *mut c_void,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::ffi::types::{StructField, StructInfo};

    extern "C" fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    extern "C" fn scale(x: f64, factor: i64) -> f64 {
        x * factor as f64
    }

    fn layout(params: Vec<AbiType>, ret: AbiType) -> CallLayout {
        CallLayout::new(
            Arc::from(Vec::<TypeEncoding>::new()),
            0,
            params,
            ret,
            StructPassing::Nested,
        )
    }

    #[test]
    fn test_arena_offsets() {
        let layout = layout(vec![AbiType::I32, AbiType::F64, AbiType::U8], AbiType::I64);
        // 3 pointers = 24 bytes, rounded to 32
        assert_eq!(layout.arg_offset(0), 32);
        assert_eq!(layout.arg_offset(1), 48);
        assert_eq!(layout.arg_offset(2), 64);
        assert_eq!(layout.ret_offset(), 80);
        assert_eq!(layout.arena_size(), 96);
    }

    #[test]
    fn test_invoke_int() {
        let layout = layout(vec![AbiType::I32, AbiType::I32], AbiType::I32);
        let mut frame = CallFrame::new(&layout);
        unsafe {
            *(frame.arg_slot(0) as *mut i32) = 40;
            *(frame.arg_slot(1) as *mut i32) = 2;
            frame.invoke(add as *const c_void);
            assert_eq!(*(frame.ret_slot() as *const i32), 42);
        }
    }

    #[test]
    fn test_invoke_double() {
        let layout = layout(vec![AbiType::F64, AbiType::I64], AbiType::F64);
        let mut frame = CallFrame::new(&layout);
        unsafe {
            *(frame.arg_slot(0) as *mut f64) = 1.5;
            *(frame.arg_slot(1) as *mut i64) = 4;
            frame.invoke(scale as *const c_void);
            assert_eq!(*(frame.ret_slot() as *const f64), 6.0);
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    union IntOrFloat {
        i: i32,
        f: f32,
    }

    extern "C" fn union_int(value: IntOrFloat) -> i32 {
        unsafe { value.i }
    }

    fn union_abi(fields: Vec<(&str, AbiType, TypeEncoding)>, size: usize) -> AbiType {
        let fields = fields
            .into_iter()
            .map(|(name, abi, encoding)| StructField {
                name: name.to_string(),
                encoding,
                abi,
                offset: 0,
            })
            .collect();
        AbiType::Struct(Rc::new(StructInfo {
            name: "IntOrFloat".to_string(),
            encoding: TypeEncoding::Void,
            fields,
            size,
            align: size,
            is_union: true,
        }))
    }

    #[test]
    fn test_invoke_mixed_union_by_value() {
        let abi = union_abi(
            vec![
                ("i", AbiType::I32, TypeEncoding::Int),
                ("f", AbiType::F32, TypeEncoding::Float),
            ],
            4,
        );
        for passing in [StructPassing::Nested, StructPassing::Flattened] {
            let layout = CallLayout::new(
                Arc::from(Vec::<TypeEncoding>::new()),
                0,
                vec![abi.clone()],
                AbiType::I32,
                passing,
            );
            let mut frame = CallFrame::new(&layout);
            unsafe {
                *(frame.arg_slot(0) as *mut i32) = 1234;
                frame.invoke(union_int as *const c_void);
                assert_eq!(*(frame.ret_slot() as *const i32), 1234);
            }
        }
    }

    #[test]
    fn test_union_members_by_class() {
        let mixed = union_abi(
            vec![
                ("i", AbiType::I32, TypeEncoding::Int),
                ("f", AbiType::F32, TypeEncoding::Float),
            ],
            4,
        );
        let floats = union_abi(
            vec![
                ("f", AbiType::F32, TypeEncoding::Float),
                ("d", AbiType::F64, TypeEncoding::Double),
            ],
            8,
        );
        let (AbiType::Struct(mixed), AbiType::Struct(floats)) = (mixed, floats) else {
            unreachable!()
        };
        assert_eq!(mixed.ffi_members(StructPassing::Nested).len(), 1);
        assert_eq!(floats.ffi_members(StructPassing::Nested).len(), 1);
    }

    #[test]
    fn test_layout_key_identity() {
        let a: Signature = Arc::from(vec![TypeEncoding::Int]);
        let b: Signature = Arc::from(vec![TypeEncoding::Int]);
        assert_eq!(layout_key(&a, 0), layout_key(&a.clone(), 0));
        assert_ne!(layout_key(&a, 0), layout_key(&b, 0));
        assert_ne!(layout_key(&a, 0), layout_key(&a, 2));
    }
}
