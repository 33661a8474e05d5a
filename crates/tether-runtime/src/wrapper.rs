//! Value Wrapper Model
//!
//! A [`Wrapper`] sits in the wrapper slot of a bridged script object and
//! records which native entity the object stands for. Disposal is variant
//! specific and lives in the lifecycle manager.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;
use std::sync::Arc;

use tether_meta::{Meta, TypeEncoding};

use crate::class_builder::ClassExtension;
use crate::error::{BridgeError, BridgeResult};
use crate::ffi::{AbiType, KeepAlive, RawBuffer, ScriptBlock, Signature, StructInfo, Trampoline};
use crate::objrt::{Class, Id, Protocol};
use crate::script::{ObjectRef, ScriptValue};
use crate::worker::WorkerState;

/// Discriminant of a [`Wrapper`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperKind {
    Primitive,
    Enum,
    Struct,
    StructType,
    NativeObject,
    NativeClass,
    NativeProtocol,
    Function,
    Block,
    Pointer,
    Reference,
    FunctionReference,
    Worker,
}

/// Memory behind a struct value
#[derive(Debug)]
pub enum StructStorage {
    /// Private copy
    Owned(RawBuffer),
    /// Projection into memory owned by another value
    Borrowed {
        address: usize,
        owner: Option<ScriptValue>,
    },
}

#[derive(Debug)]
pub struct StructWrapper {
    pub info: Rc<StructInfo>,
    pub storage: StructStorage,
}

impl StructWrapper {
    pub fn data(&self) -> *mut u8 {
        match &self.storage {
            StructStorage::Owned(buffer) => buffer.as_ptr(),
            StructStorage::Borrowed { address, .. } => *address as *mut u8,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data(), self.info.size) }
    }
}

/// A retained native instance, or a super view of one
#[derive(Debug)]
pub struct ObjectWrapper {
    pub object: Id,
    /// Set on super views: sends go through the super lookup from this class
    pub super_class: Option<Class>,
    /// Super views keep the aliased script object alive
    pub owner: Option<ObjectRef>,
}

#[derive(Debug)]
pub struct ClassWrapper {
    /// Null while a scripted subclass is not yet extended
    pub class: Class,
    pub meta: Option<Arc<Meta>>,
    pub extension: Option<ClassExtension>,
}

#[derive(Debug)]
pub struct ProtocolWrapper {
    pub protocol: Protocol,
    pub meta: Option<Arc<Meta>>,
}

/// A native function callable from script
#[derive(Debug)]
pub struct FunctionWrapper {
    pub address: usize,
    pub signature: Signature,
    pub owns_returned: bool,
    pub returns_unmanaged: bool,
}

/// A block: native, or built around a script function
#[derive(Debug)]
pub struct BlockWrapper {
    pub address: usize,
    pub signature: Signature,
    pub script: Option<ScriptBlock>,
}

#[derive(Debug)]
pub struct PointerWrapper {
    pub address: usize,
    /// Freed on disposal
    pub adopted: bool,
}

#[derive(Debug, Default)]
pub enum ReferenceStorage {
    #[default]
    Unset,
    Owned(RawBuffer),
    Borrowed(usize),
}

/// Typed indirection
#[derive(Debug, Default)]
pub struct ReferenceWrapper {
    pub encoding: Option<TypeEncoding>,
    pub abi: Option<AbiType>,
    pub storage: ReferenceStorage,
    /// Value held until the reference gets a type
    pub pending: ScriptValue,
    /// Memory the referenced value points into
    pub keep: KeepAlive,
}

impl ReferenceWrapper {
    /// Address of the referenced memory; 0 while untyped
    pub fn address(&self) -> usize {
        match &self.storage {
            ReferenceStorage::Unset => 0,
            ReferenceStorage::Owned(buffer) => buffer.as_ptr() as usize,
            ReferenceStorage::Borrowed(address) => *address,
        }
    }
}

/// Native entry points created for a script function
#[derive(Debug, Default)]
pub struct FunctionReferenceWrapper {
    /// The wrapped function. `None` when the wrapper sits on the function itself.
    pub function: Option<ObjectRef>,
    pub trampolines: Vec<Trampoline>,
}

impl FunctionReferenceWrapper {
    pub fn find(&self, signature: &[TypeEncoding]) -> Option<&Trampoline> {
        self.trampolines
            .iter()
            .find(|t| t.signature().as_ref() == signature)
    }
}

/// Native backing of a bridged script object
#[derive(Debug)]
pub enum Wrapper {
    Primitive(TypeEncoding),
    Enum(Arc<Meta>),
    Struct(StructWrapper),
    StructType(Rc<StructInfo>),
    NativeObject(ObjectWrapper),
    NativeClass(ClassWrapper),
    NativeProtocol(ProtocolWrapper),
    Function(FunctionWrapper),
    Block(BlockWrapper),
    Pointer(PointerWrapper),
    Reference(ReferenceWrapper),
    FunctionReference(FunctionReferenceWrapper),
    Worker(Arc<WorkerState>),
}

impl Wrapper {
    pub fn kind(&self) -> WrapperKind {
        match self {
            Wrapper::Primitive(_) => WrapperKind::Primitive,
            Wrapper::Enum(_) => WrapperKind::Enum,
            Wrapper::Struct(_) => WrapperKind::Struct,
            Wrapper::StructType(_) => WrapperKind::StructType,
            Wrapper::NativeObject(_) => WrapperKind::NativeObject,
            Wrapper::NativeClass(_) => WrapperKind::NativeClass,
            Wrapper::NativeProtocol(_) => WrapperKind::NativeProtocol,
            Wrapper::Function(_) => WrapperKind::Function,
            Wrapper::Block(_) => WrapperKind::Block,
            Wrapper::Pointer(_) => WrapperKind::Pointer,
            Wrapper::Reference(_) => WrapperKind::Reference,
            Wrapper::FunctionReference(_) => WrapperKind::FunctionReference,
            Wrapper::Worker(_) => WrapperKind::Worker,
        }
    }

    /// Native address the wrapper stands for, where it has one
    pub fn native_address(&self) -> Option<usize> {
        match self {
            Wrapper::Struct(s) => Some(s.data() as usize),
            Wrapper::NativeObject(o) => Some(o.object as usize),
            Wrapper::NativeClass(c) if !c.class.is_null() => Some(c.class as usize),
            Wrapper::NativeProtocol(p) => Some(p.protocol as usize),
            Wrapper::Function(f) => Some(f.address),
            Wrapper::Block(b) => Some(b.address),
            Wrapper::Pointer(p) => Some(p.address),
            Wrapper::Reference(r) if r.address() != 0 => Some(r.address()),
            _ => None,
        }
    }
}

/// Shared slot holding a wrapper and its disposal state
#[derive(Debug)]
pub struct WrapperCell {
    wrapper: RefCell<Wrapper>,
    disposed: Cell<bool>,
}

impl WrapperCell {
    pub fn new(wrapper: Wrapper) -> Self {
        Self {
            wrapper: RefCell::new(wrapper),
            disposed: Cell::new(false),
        }
    }

    pub fn kind(&self) -> WrapperKind {
        self.wrapper.borrow().kind()
    }

    /// Borrow a live wrapper
    pub fn get(&self) -> BridgeResult<Ref<'_, Wrapper>> {
        if self.disposed.get() {
            return Err(BridgeError::Disposed);
        }
        Ok(self.wrapper.borrow())
    }

    pub fn get_mut(&self) -> BridgeResult<RefMut<'_, Wrapper>> {
        if self.disposed.get() {
            return Err(BridgeError::Disposed);
        }
        Ok(self.wrapper.borrow_mut())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Access for the disposal path, which may run on a disposed cell
    pub(crate) fn raw(&self) -> RefMut<'_, Wrapper> {
        self.wrapper.borrow_mut()
    }

    pub(crate) fn mark_disposed(&self) {
        self.disposed.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposed_cell_rejects_access() {
        let cell = WrapperCell::new(Wrapper::Pointer(PointerWrapper {
            address: 0x1000,
            adopted: false,
        }));
        assert_eq!(cell.kind(), WrapperKind::Pointer);
        assert_eq!(cell.get().unwrap().native_address(), Some(0x1000));
        cell.mark_disposed();
        assert!(matches!(cell.get(), Err(BridgeError::Disposed)));
    }

    #[test]
    fn test_reference_address() {
        let mut reference = ReferenceWrapper::default();
        assert_eq!(reference.address(), 0);
        reference.storage = ReferenceStorage::Borrowed(0x2000);
        assert_eq!(reference.address(), 0x2000);
    }
}
