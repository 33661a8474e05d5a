//! Script value ⇄ native value conversion
//!
//! [`write_value`] stores a script value into a native slot and
//! [`read_value`] decodes one, both dispatching on the slot's encoding.
//! Anything a written slot points to (C strings, array copies, call-scoped
//! callbacks) is parked in a [`KeepAlive`] that outlives the call.

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::rc::Rc;

use tether_meta::TypeEncoding;

use super::buffer::RawBuffer;
use super::closure::{ScriptBlock, Trampoline, TrampolineTarget};
use super::types::{AbiType, Position, StructInfo};
use crate::context::ExecutionContext;
use crate::error::BridgeError;
use crate::objrt::{Class, Id, Protocol};
use crate::script::{ObjectRef, ScriptError, ScriptObject, ScriptResult, ScriptValue};
use crate::wrapper::{
    BlockWrapper, FunctionReferenceWrapper, ReferenceStorage, StructStorage, Wrapper, WrapperCell,
    WrapperKind,
};

/// Native memory that must stay valid until a call returns
#[derive(Default)]
pub struct KeepAlive {
    strings: Vec<CString>,
    buffers: Vec<RawBuffer>,
    blocks: Vec<ScriptBlock>,
    trampolines: Vec<Trampoline>,
    values: Vec<ScriptValue>,
}

impl KeepAlive {
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
            && self.buffers.is_empty()
            && self.blocks.is_empty()
            && self.trampolines.is_empty()
            && self.values.is_empty()
    }

    pub fn append(&mut self, other: KeepAlive) {
        self.strings.extend(other.strings);
        self.buffers.extend(other.buffers);
        self.blocks.extend(other.blocks);
        self.trampolines.extend(other.trampolines);
        self.values.extend(other.values);
    }

    pub fn hold(&mut self, value: ScriptValue) {
        self.values.push(value);
    }
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("strings", &self.strings.len())
            .field("buffers", &self.buffers.len())
            .field("callbacks", &(self.blocks.len() + self.trampolines.len()))
            .finish()
    }
}

fn mismatch(encoding: &TypeEncoding, value: &ScriptValue) -> ScriptError {
    BridgeError::mismatch(encoding.kind(), value.type_name()).into()
}

fn unsupported(encoding: &TypeEncoding) -> ScriptError {
    BridgeError::UnsupportedEncoding(encoding.kind()).into()
}

unsafe fn write_pointer(dest: *mut u8, pointer: *const c_void) {
    unsafe { ptr::write_unaligned(dest as *mut *const c_void, pointer) };
}

unsafe fn read_pointer(src: *const u8) -> *mut c_void {
    unsafe { ptr::read_unaligned(src as *const *mut c_void) }
}

// ============================================================================
// Numbers
// ============================================================================

/// Store `n` as `abi`. Float to integer casts saturate, so out-of-range
/// values clamp to the type's bounds and NaN becomes zero.
pub unsafe fn write_number(abi: &AbiType, dest: *mut u8, n: f64) -> bool {
    unsafe {
        match abi {
            AbiType::U8 => ptr::write_unaligned(dest, n as u8),
            AbiType::I8 => ptr::write_unaligned(dest as *mut i8, n as i8),
            AbiType::U16 => ptr::write_unaligned(dest as *mut u16, n as u16),
            AbiType::I16 => ptr::write_unaligned(dest as *mut i16, n as i16),
            AbiType::U32 => ptr::write_unaligned(dest as *mut u32, n as u32),
            AbiType::I32 => ptr::write_unaligned(dest as *mut i32, n as i32),
            AbiType::U64 => ptr::write_unaligned(dest as *mut u64, n as u64),
            AbiType::I64 => ptr::write_unaligned(dest as *mut i64, n as i64),
            AbiType::F32 => ptr::write_unaligned(dest as *mut f32, n as f32),
            AbiType::F64 => ptr::write_unaligned(dest as *mut f64, n),
            _ => return false,
        }
    }
    true
}

pub unsafe fn read_number(abi: &AbiType, src: *const u8) -> Option<f64> {
    unsafe {
        Some(match abi {
            AbiType::U8 => *src as f64,
            AbiType::I8 => *(src as *const i8) as f64,
            AbiType::U16 => ptr::read_unaligned(src as *const u16) as f64,
            AbiType::I16 => ptr::read_unaligned(src as *const i16) as f64,
            AbiType::U32 => ptr::read_unaligned(src as *const u32) as f64,
            AbiType::I32 => ptr::read_unaligned(src as *const i32) as f64,
            AbiType::U64 => ptr::read_unaligned(src as *const u64) as f64,
            AbiType::I64 => ptr::read_unaligned(src as *const i64) as f64,
            AbiType::F32 => ptr::read_unaligned(src as *const f32) as f64,
            AbiType::F64 => ptr::read_unaligned(src as *const f64),
            _ => return None,
        })
    }
}

fn is_character(encoding: &TypeEncoding) -> bool {
    matches!(
        encoding,
        TypeEncoding::Char | TypeEncoding::UChar | TypeEncoding::CharS | TypeEncoding::Unichar
    )
}

fn number_argument(encoding: &TypeEncoding, value: &ScriptValue) -> ScriptResult<f64> {
    match value {
        ScriptValue::Number(n) => Ok(*n),
        ScriptValue::Bool(b) => Ok(*b as u8 as f64),
        ScriptValue::String(s) if is_character(encoding) => {
            let mut units = s.encode_utf16();
            match (units.next(), units.next()) {
                (Some(unit), None) => Ok(unit as f64),
                _ => Err(mismatch(encoding, value)),
            }
        }
        _ => Err(mismatch(encoding, value)),
    }
}

// ============================================================================
// Writing
// ============================================================================

/// Write `value` into a parameter or return slot
pub fn write_value(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    dest: *mut u8,
    value: &ScriptValue,
    keep: &mut KeepAlive,
) -> ScriptResult<()> {
    write(ctx, encoding, dest, value, keep, Position::Parameter)
}

/// Write `value` into a record field or referenced memory
pub fn write_field(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    dest: *mut u8,
    value: &ScriptValue,
    keep: &mut KeepAlive,
) -> ScriptResult<()> {
    write(ctx, encoding, dest, value, keep, Position::Field)
}

fn write(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    dest: *mut u8,
    value: &ScriptValue,
    keep: &mut KeepAlive,
    position: Position,
) -> ScriptResult<()> {
    match encoding {
        TypeEncoding::Void => Ok(()),
        TypeEncoding::Bool => {
            unsafe { *dest = value.truthy() as u8 };
            Ok(())
        }
        TypeEncoding::Short
        | TypeEncoding::UShort
        | TypeEncoding::Int
        | TypeEncoding::UInt
        | TypeEncoding::Long
        | TypeEncoding::ULong
        | TypeEncoding::LongLong
        | TypeEncoding::ULongLong
        | TypeEncoding::Char
        | TypeEncoding::UChar
        | TypeEncoding::Unichar
        | TypeEncoding::CharS
        | TypeEncoding::Float
        | TypeEncoding::Double => {
            let n = number_argument(encoding, value)?;
            let abi = ctx.abi_type(encoding, position)?;
            unsafe { write_number(&abi, dest, n) };
            Ok(())
        }
        TypeEncoding::CString => {
            let pointer = cstring_argument(ctx, encoding, value, keep)?;
            unsafe { write_pointer(dest, pointer) };
            Ok(())
        }
        TypeEncoding::Selector => {
            let selector = match value {
                v if v.is_nullish() => ptr::null(),
                ScriptValue::String(name) => ctx.runtime().register_selector(name),
                other => return Err(mismatch(encoding, other)),
            };
            unsafe { write_pointer(dest, selector) };
            Ok(())
        }
        TypeEncoding::Class => {
            let class = class_argument(ctx, encoding, value)?;
            unsafe { write_pointer(dest, class) };
            Ok(())
        }
        TypeEncoding::ProtocolType => {
            let protocol = protocol_argument(encoding, value)?;
            unsafe { write_pointer(dest, protocol) };
            Ok(())
        }
        TypeEncoding::Id { .. }
        | TypeEncoding::InstanceType
        | TypeEncoding::InterfaceDeclarationReference { .. } => {
            let object = object_argument(ctx, encoding, value)?;
            unsafe { write_pointer(dest, object) };
            Ok(())
        }
        TypeEncoding::Pointer { target } | TypeEncoding::IncompleteArray { element: target } => {
            let pointer = pointer_argument(ctx, encoding, target, value, keep)?;
            unsafe { write_pointer(dest, pointer) };
            Ok(())
        }
        TypeEncoding::ConstantArray { element, .. } if position == Position::Parameter => {
            let pointer = pointer_argument(ctx, encoding, element, value, keep)?;
            unsafe { write_pointer(dest, pointer) };
            Ok(())
        }
        TypeEncoding::ConstantArray { size, element } | TypeEncoding::Vector { size, element } => {
            write_inline_array(ctx, encoding, element, *size, dest, value, keep)
        }
        TypeEncoding::FunctionPointer { signature } => {
            let pointer = function_pointer_argument(ctx, encoding, signature, value, keep)?;
            unsafe { write_pointer(dest, pointer) };
            Ok(())
        }
        TypeEncoding::Block { signature } => {
            let pointer = block_argument(ctx, encoding, signature, value, keep)?;
            unsafe { write_pointer(dest, pointer) };
            Ok(())
        }
        TypeEncoding::StructDeclarationReference { .. }
        | TypeEncoding::UnionDeclarationReference { .. }
        | TypeEncoding::AnonymousStruct { .. }
        | TypeEncoding::AnonymousUnion { .. } => {
            let info = ctx.struct_info(encoding)?;
            write_struct(ctx, &info, dest, value, keep)
        }
        TypeEncoding::VaList => Err(unsupported(encoding)),
    }
}

/// Kind and native address of the wrapper behind `value`
fn wrapped_address(value: &ScriptValue) -> ScriptResult<Option<(WrapperKind, usize)>> {
    let Some(cell) = value.as_object().and_then(|o| o.wrapper()) else {
        return Ok(None);
    };
    let wrapper = cell.get().map_err(ScriptError::from)?;
    Ok(Some((wrapper.kind(), wrapper.native_address().unwrap_or(0))))
}

fn cstring_argument(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    value: &ScriptValue,
    keep: &mut KeepAlive,
) -> ScriptResult<*const c_void> {
    match value {
        v if v.is_nullish() => Ok(ptr::null()),
        ScriptValue::String(s) => {
            let c_string = CString::new(s.as_bytes()).map_err(|_| mismatch(encoding, value))?;
            let pointer = c_string.as_ptr() as *const c_void;
            keep.strings.push(c_string);
            Ok(pointer)
        }
        ScriptValue::Object(_) => {
            let char_type = TypeEncoding::Char;
            pointer_argument(ctx, encoding, &char_type, value, keep)
        }
        other => Err(mismatch(encoding, other)),
    }
}

fn class_argument(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    value: &ScriptValue,
) -> ScriptResult<Class> {
    if value.is_nullish() {
        return Ok(ptr::null_mut());
    }
    match value.as_object() {
        Some(object) => match object.wrapper().map(|c| c.kind()) {
            Some(WrapperKind::NativeClass) => ctx.class_pointer(object),
            _ => Err(mismatch(encoding, value)),
        },
        None => Err(mismatch(encoding, value)),
    }
}

fn protocol_argument(encoding: &TypeEncoding, value: &ScriptValue) -> ScriptResult<Protocol> {
    if value.is_nullish() {
        return Ok(ptr::null_mut());
    }
    match wrapped_address(value)? {
        Some((WrapperKind::NativeProtocol, address)) => Ok(address as Protocol),
        _ => Err(mismatch(encoding, value)),
    }
}

fn object_argument(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    value: &ScriptValue,
) -> ScriptResult<Id> {
    match value {
        v if v.is_nullish() => Ok(ptr::null_mut()),
        ScriptValue::String(s) => {
            let runtime = ctx.runtime();
            Ok(runtime.autorelease(runtime.new_string(s)))
        }
        ScriptValue::Object(object) => {
            let kind = object.wrapper().map(|c| c.kind());
            if kind == Some(WrapperKind::NativeClass) {
                return ctx.class_pointer(object);
            }
            match wrapped_address(value)? {
                Some((
                    WrapperKind::NativeObject
                    | WrapperKind::NativeProtocol
                    | WrapperKind::Function
                    | WrapperKind::Block
                    | WrapperKind::Pointer,
                    address,
                )) => Ok(address as Id),
                _ => Err(mismatch(encoding, value)),
            }
        }
        other => Err(mismatch(encoding, other)),
    }
}

fn pointer_argument(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    target: &TypeEncoding,
    value: &ScriptValue,
    keep: &mut KeepAlive,
) -> ScriptResult<*const c_void> {
    let object = match value {
        v if v.is_nullish() => return Ok(ptr::null()),
        ScriptValue::String(_)
            if matches!(
                target,
                TypeEncoding::Char | TypeEncoding::UChar | TypeEncoding::CharS
            ) =>
        {
            return cstring_argument(ctx, &TypeEncoding::CString, value, keep);
        }
        ScriptValue::Object(object) => object,
        other => return Err(mismatch(encoding, other)),
    };

    if let Some(cell) = object.wrapper() {
        if cell.kind() == WrapperKind::Reference {
            return Ok(bind_reference(ctx, &cell, target)? as *const c_void);
        }
        if cell.kind() == WrapperKind::NativeClass {
            return Ok(ctx.class_pointer(object)? as *const c_void);
        }
        return match wrapped_address(value)? {
            Some((
                WrapperKind::Pointer
                | WrapperKind::Struct
                | WrapperKind::NativeObject
                | WrapperKind::NativeProtocol
                | WrapperKind::Function
                | WrapperKind::Block,
                address,
            )) => Ok(address as *const c_void),
            _ => Err(mismatch(encoding, value)),
        };
    }

    if object.is_array() {
        let abi = ctx.abi_type(target, Position::Field)?;
        let elements = object.elements();
        let size = abi.size().max(1);
        let buffer = RawBuffer::zeroed(size * elements.len().max(1), abi.align());
        for (i, element) in elements.iter().enumerate() {
            write_field(ctx, target, unsafe { buffer.as_ptr().add(i * size) }, element, keep)?;
        }
        let pointer = buffer.as_ptr() as *const c_void;
        keep.buffers.push(buffer);
        return Ok(pointer);
    }

    Err(mismatch(encoding, value))
}

fn write_inline_array(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    element: &TypeEncoding,
    count: i32,
    dest: *mut u8,
    value: &ScriptValue,
    keep: &mut KeepAlive,
) -> ScriptResult<()> {
    if value.is_nullish() {
        return Ok(());
    }
    let object = match value.as_object() {
        Some(object) if object.is_array() => object,
        _ => return Err(mismatch(encoding, value)),
    };
    let size = ctx.abi_type(element, Position::Field)?.size();
    let count = count.max(0) as usize;
    for (i, item) in object.elements().iter().take(count).enumerate() {
        write_field(ctx, element, unsafe { dest.add(i * size) }, item, keep)?;
    }
    Ok(())
}

/// Copy or build a record at `dest`
pub fn write_struct(
    ctx: &ExecutionContext,
    info: &Rc<StructInfo>,
    dest: *mut u8,
    value: &ScriptValue,
    keep: &mut KeepAlive,
) -> ScriptResult<()> {
    if value.is_nullish() {
        unsafe { ptr::write_bytes(dest, 0, info.size) };
        return Ok(());
    }
    let Some(object) = value.as_object() else {
        return Err(mismatch(&info.encoding, value));
    };

    if let Some(cell) = object.wrapper() {
        let wrapper = cell.get().map_err(ScriptError::from)?;
        return match &*wrapper {
            Wrapper::Struct(source) if source.info.name == info.name => {
                unsafe { ptr::copy(source.data(), dest, info.size) };
                Ok(())
            }
            _ => Err(mismatch(&info.encoding, value)),
        };
    }

    unsafe { ptr::write_bytes(dest, 0, info.size) };
    for field in &info.fields {
        let field_value = ctx.get(value, &field.name)?;
        if field_value.is_undefined() {
            continue;
        }
        write_field(ctx, &field.encoding, unsafe { dest.add(field.offset) }, &field_value, keep)?;
    }
    Ok(())
}

// ============================================================================
// Callbacks
// ============================================================================

fn function_pointer_argument(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    signature: &[TypeEncoding],
    value: &ScriptValue,
    keep: &mut KeepAlive,
) -> ScriptResult<*const c_void> {
    let object = match value {
        v if v.is_nullish() => return Ok(ptr::null()),
        ScriptValue::Object(object) => object,
        other => return Err(mismatch(encoding, other)),
    };

    match object.wrapper() {
        Some(cell) if cell.kind() == WrapperKind::FunctionReference => {
            function_reference_code(ctx, object, &cell, signature)
        }
        Some(cell) if matches!(cell.kind(), WrapperKind::Function | WrapperKind::Pointer) => {
            let wrapper = cell.get().map_err(ScriptError::from)?;
            Ok(wrapper.native_address().unwrap_or(0) as *const c_void)
        }
        None if object.is_callable() => {
            let cell =
                object.set_wrapper(Wrapper::FunctionReference(FunctionReferenceWrapper::default()));
            ctx.track(object);
            function_reference_code(ctx, object, &cell, signature)
        }
        _ if object.is_callable() => {
            log::warn!("function already carries a wrapper; using a call-scoped callback");
            let layout = ctx.layout(&ctx.signature(signature), 0)?;
            let target = TrampolineTarget::Function(Rc::downgrade(object));
            let trampoline = Trampoline::new(ctx, layout, target)?;
            let code = trampoline.code();
            keep.trampolines.push(trampoline);
            keep.hold(value.clone());
            Ok(code)
        }
        _ => Err(mismatch(encoding, value)),
    }
}

/// Entry point of a function reference for `signature`, built on first use
fn function_reference_code(
    ctx: &ExecutionContext,
    object: &ObjectRef,
    cell: &WrapperCell,
    signature: &[TypeEncoding],
) -> ScriptResult<*const c_void> {
    {
        let wrapper = cell.get().map_err(ScriptError::from)?;
        if let Wrapper::FunctionReference(reference) = &*wrapper {
            if let Some(trampoline) = reference.find(signature) {
                return Ok(trampoline.code());
            }
        }
    }

    let function = {
        let wrapper = cell.get().map_err(ScriptError::from)?;
        match &*wrapper {
            Wrapper::FunctionReference(reference) => {
                reference.function.clone().unwrap_or_else(|| object.clone())
            }
            _ => return Err(BridgeError::InvalidReceiver("FunctionReference").into()),
        }
    };
    let layout = ctx.layout(&ctx.signature(signature), 0)?;
    let target = TrampolineTarget::Function(Rc::downgrade(&function));
    let trampoline = Trampoline::new(ctx, layout, target)?;
    let code = trampoline.code();

    let mut wrapper = cell.get_mut().map_err(ScriptError::from)?;
    if let Wrapper::FunctionReference(reference) = &mut *wrapper {
        reference.trampolines.push(trampoline);
    }
    Ok(code)
}

fn block_argument(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    signature: &[TypeEncoding],
    value: &ScriptValue,
    keep: &mut KeepAlive,
) -> ScriptResult<*const c_void> {
    let object = match value {
        v if v.is_nullish() => return Ok(ptr::null()),
        ScriptValue::Object(object) => object,
        other => return Err(mismatch(encoding, other)),
    };

    if let Some(cell) = object.wrapper() {
        let wrapper = cell.get().map_err(ScriptError::from)?;
        match &*wrapper {
            Wrapper::Block(block)
                if block.script.is_none() || block.signature.as_ref() == signature =>
            {
                return Ok(block.address as *const c_void);
            }
            Wrapper::Pointer(pointer) => return Ok(pointer.address as *const c_void),
            _ => {}
        }
    }
    if !object.is_callable() {
        return Err(mismatch(encoding, value));
    }

    let signature = ctx.signature(signature);
    let layout = ctx.layout(&signature, 1)?;
    let target = TrampolineTarget::Function(Rc::downgrade(object));
    let trampoline = Trampoline::new(ctx, layout, target)?;
    let block = ScriptBlock::new(trampoline);
    let address = block.as_ptr() as *const c_void;

    if object.wrapper().is_none() {
        object.set_wrapper(Wrapper::Block(BlockWrapper {
            address: address as usize,
            signature,
            script: Some(block),
        }));
        ctx.track(object);
    } else {
        log::warn!("function already carries a wrapper; using a call-scoped block");
        keep.blocks.push(block);
        keep.hold(value.clone());
    }
    Ok(address)
}

// ============================================================================
// References
// ============================================================================

/// Give an untyped reference the type `target` and return its address.
/// A pending value is written into the fresh storage.
pub(crate) fn bind_reference(
    ctx: &ExecutionContext,
    cell: &WrapperCell,
    target: &TypeEncoding,
) -> ScriptResult<usize> {
    let pending = {
        let mut wrapper = cell.get_mut().map_err(ScriptError::from)?;
        let Wrapper::Reference(reference) = &mut *wrapper else {
            return Err(BridgeError::InvalidReceiver("Reference").into());
        };
        if reference.encoding.is_some() || matches!(target, TypeEncoding::Void) {
            if matches!(reference.storage, ReferenceStorage::Unset) {
                let buffer = RawBuffer::zeroed(std::mem::size_of::<usize>(), 8);
                reference.storage = ReferenceStorage::Owned(buffer);
            }
            return Ok(reference.address());
        }
        let abi = ctx.abi_type(target, Position::Field)?;
        let buffer = RawBuffer::zeroed(abi.size().max(1), abi.align());
        reference.storage = ReferenceStorage::Owned(buffer);
        reference.encoding = Some(target.clone());
        reference.abi = Some(abi);
        std::mem::take(&mut reference.pending)
    };

    let address = {
        let wrapper = cell.get().map_err(ScriptError::from)?;
        match &*wrapper {
            Wrapper::Reference(reference) => reference.address(),
            _ => 0,
        }
    };
    if !pending.is_undefined() {
        let mut keep = KeepAlive::default();
        write_field(ctx, target, address as *mut u8, &pending, &mut keep)?;
        let mut wrapper = cell.get_mut().map_err(ScriptError::from)?;
        if let Wrapper::Reference(reference) = &mut *wrapper {
            reference.keep.append(keep);
        }
    }
    Ok(address)
}

// ============================================================================
// Reading
// ============================================================================

/// Decode a return or parameter slot. `owned` marks an object reference the
/// caller already holds a +1 retain on.
pub fn read_value(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    src: *const u8,
    owned: bool,
) -> ScriptResult<ScriptValue> {
    read(ctx, encoding, src, owned, Position::Parameter, None)
}

/// Decode a record field or referenced memory. Nested records are
/// projections kept alive by `owner`.
pub fn read_field(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    src: *const u8,
    owner: Option<&ScriptValue>,
) -> ScriptResult<ScriptValue> {
    read(ctx, encoding, src, false, Position::Field, owner)
}

fn read(
    ctx: &ExecutionContext,
    encoding: &TypeEncoding,
    src: *const u8,
    owned: bool,
    position: Position,
    owner: Option<&ScriptValue>,
) -> ScriptResult<ScriptValue> {
    match encoding {
        TypeEncoding::Void => Ok(ScriptValue::Undefined),
        TypeEncoding::Bool => Ok(ScriptValue::Bool(unsafe { *src } != 0)),
        TypeEncoding::Unichar => {
            let unit = unsafe { ptr::read_unaligned(src as *const u16) };
            Ok(ScriptValue::from(String::from_utf16_lossy(&[unit])))
        }
        TypeEncoding::Short
        | TypeEncoding::UShort
        | TypeEncoding::Int
        | TypeEncoding::UInt
        | TypeEncoding::Long
        | TypeEncoding::ULong
        | TypeEncoding::LongLong
        | TypeEncoding::ULongLong
        | TypeEncoding::Char
        | TypeEncoding::UChar
        | TypeEncoding::CharS
        | TypeEncoding::Float
        | TypeEncoding::Double => {
            let abi = ctx.abi_type(encoding, position)?;
            unsafe { read_number(&abi, src) }
                .map(ScriptValue::Number)
                .ok_or_else(|| unsupported(encoding))
        }
        TypeEncoding::CString => {
            let pointer = unsafe { read_pointer(src) } as *const c_char;
            if pointer.is_null() {
                return Ok(ScriptValue::Null);
            }
            let value = unsafe { CStr::from_ptr(pointer) }.to_string_lossy().into_owned();
            Ok(ScriptValue::from(value))
        }
        TypeEncoding::Selector => {
            let selector = unsafe { read_pointer(src) } as *const c_void;
            if selector.is_null() {
                return Ok(ScriptValue::Null);
            }
            Ok(ScriptValue::from(ctx.runtime().selector_name(selector)))
        }
        TypeEncoding::Class => {
            let class = unsafe { read_pointer(src) };
            if class.is_null() {
                return Ok(ScriptValue::Null);
            }
            ctx.class_value(class)
        }
        TypeEncoding::ProtocolType => {
            let protocol = unsafe { read_pointer(src) };
            if protocol.is_null() {
                return Ok(ScriptValue::Undefined);
            }
            ctx.protocol_value(protocol)
        }
        TypeEncoding::Id { .. }
        | TypeEncoding::InstanceType
        | TypeEncoding::InterfaceDeclarationReference { .. } => {
            let object = unsafe { read_pointer(src) };
            if object.is_null() {
                return Ok(ScriptValue::Null);
            }
            let runtime = ctx.runtime();
            if let Some(value) = runtime.string_value(object) {
                if owned {
                    runtime.release(object);
                }
                return Ok(ScriptValue::from(value));
            }
            ctx.wrap_native_object(object, owned)
        }
        TypeEncoding::Pointer { target } | TypeEncoding::IncompleteArray { element: target } => {
            let address = unsafe { read_pointer(src) } as usize;
            if address == 0 {
                return Ok(ScriptValue::Null);
            }
            if matches!(**target, TypeEncoding::Void) {
                return Ok(ctx.pointer_value(address));
            }
            ctx.reference_value(target, address)
        }
        TypeEncoding::ConstantArray { element, .. } if position == Position::Parameter => {
            let address = unsafe { read_pointer(src) } as usize;
            if address == 0 {
                return Ok(ScriptValue::Null);
            }
            ctx.reference_value(element, address)
        }
        TypeEncoding::ConstantArray { size, element } | TypeEncoding::Vector { size, element } => {
            let stride = ctx.abi_type(element, Position::Field)?.size();
            let elements = (0..(*size).max(0) as usize)
                .map(|i| read_field(ctx, element, unsafe { src.add(i * stride) }, owner))
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(ScriptValue::Object(ScriptObject::array(elements)))
        }
        TypeEncoding::FunctionPointer { signature } => {
            let address = unsafe { read_pointer(src) } as usize;
            if address == 0 {
                return Ok(ScriptValue::Null);
            }
            Ok(ctx.function_value(address, ctx.signature(signature), false, false))
        }
        TypeEncoding::Block { signature } => {
            let address = unsafe { read_pointer(src) } as usize;
            if address == 0 {
                return Ok(ScriptValue::Null);
            }
            Ok(ctx.block_value(address, ctx.signature(signature)))
        }
        TypeEncoding::StructDeclarationReference { .. }
        | TypeEncoding::UnionDeclarationReference { .. }
        | TypeEncoding::AnonymousStruct { .. }
        | TypeEncoding::AnonymousUnion { .. } => {
            let info = ctx.struct_info(encoding)?;
            let storage = match owner {
                Some(owner) => StructStorage::Borrowed {
                    address: src as usize,
                    owner: Some(owner.clone()),
                },
                None => {
                    let buffer = unsafe { RawBuffer::copy_from(src, info.size, info.align) };
                    StructStorage::Owned(buffer)
                }
            };
            ctx.struct_value(info, storage)
        }
        TypeEncoding::VaList => Err(unsupported(encoding)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_clamp() {
        let mut slot = [0u8; 8];
        unsafe {
            write_number(&AbiType::U8, slot.as_mut_ptr(), 300.0);
            assert_eq!(slot[0], u8::MAX);
            write_number(&AbiType::I8, slot.as_mut_ptr(), -1000.0);
            assert_eq!(slot[0] as i8, i8::MIN);
            write_number(&AbiType::I32, slot.as_mut_ptr(), f64::NAN);
            assert_eq!(read_number(&AbiType::I32, slot.as_ptr()), Some(0.0));
            write_number(&AbiType::U32, slot.as_mut_ptr(), -5.0);
            assert_eq!(read_number(&AbiType::U32, slot.as_ptr()), Some(0.0));
            write_number(&AbiType::I64, slot.as_mut_ptr(), 1e300);
            assert_eq!(ptr::read_unaligned(slot.as_ptr() as *const i64), i64::MAX);
        }
    }

    #[test]
    fn test_number_argument() {
        assert_eq!(number_argument(&TypeEncoding::Int, &ScriptValue::Bool(true)), Ok(1.0));
        assert_eq!(number_argument(&TypeEncoding::Unichar, &ScriptValue::string("A")), Ok(65.0));
        assert!(number_argument(&TypeEncoding::Int, &ScriptValue::string("A")).is_err());
        assert!(number_argument(&TypeEncoding::Unichar, &ScriptValue::string("AB")).is_err());
        assert!(number_argument(&TypeEncoding::Double, &ScriptValue::Undefined).is_err());
    }

    #[test]
    fn test_struct_read_by_value_copies() {
        use std::sync::Arc;
        use tether_meta::RecordField;

        let ctx = ExecutionContext::new(
            Arc::new(crate::objrt::HostRuntime::new()),
            Arc::new(crate::testing::empty_store()),
        );
        let encoding = TypeEncoding::AnonymousStruct {
            fields: vec![
                RecordField::new("x", TypeEncoding::Double),
                RecordField::new("y", TypeEncoding::Double),
            ],
        };
        let mut source = [1.5f64, -2.0f64];
        let value = read_value(&ctx, &encoding, source.as_ptr() as *const u8, false).unwrap();
        source[0] = 99.0;
        assert_eq!(ctx.get(&value, "x").unwrap().as_number(), Some(1.5));
        assert_eq!(ctx.get(&value, "y").unwrap().as_number(), Some(-2.0));
    }

    #[test]
    fn test_keep_alive() {
        let mut keep = KeepAlive::default();
        assert!(keep.is_empty());
        keep.hold(ScriptValue::Null);
        let mut other = KeepAlive::default();
        other.append(keep);
        assert!(!other.is_empty());
    }
}
