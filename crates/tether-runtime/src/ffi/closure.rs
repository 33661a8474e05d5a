//! Reverse calls: native entry points that re-enter script code
//!
//! A [`Trampoline`] is a libffi closure whose user data names the context
//! and the script target. Errors raised by the target cannot unwind through
//! native frames; they are parked on the context and rethrown when the
//! outer native call returns.

use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::{Rc, Weak};

use libffi::low::{self, ffi_cif, ffi_closure, CodePtr};

use super::call::{CallLayout, Signature};
use super::marshal::{self, KeepAlive};
use super::types::AbiType;
use crate::context::{ContextInner, ExecutionContext};
use crate::error::{BridgeError, BridgeResult};
use crate::objrt::Id;
use crate::script::{ScriptError, ScriptObject, ScriptResult, ScriptValue};

/// Script code a trampoline runs
#[derive(Debug, Clone)]
pub enum TrampolineTarget {
    /// A script function, held weakly
    Function(Weak<ScriptObject>),
    /// A method found on the receiver's script object
    Method { js_name: String },
    Getter { js_name: String },
    Setter { js_name: String },
}

struct TrampolineData {
    context: Weak<ContextInner>,
    layout: Rc<CallLayout>,
    target: TrampolineTarget,
}

/// Native-callable entry point into script code
pub struct Trampoline {
    closure: *mut ffi_closure,
    code: CodePtr,
    data: Box<TrampolineData>,
}

impl Trampoline {
    /// Build a closure for `layout`. The layout's implicit parameter count
    /// decides the calling shape: 0 for functions, 1 for blocks, 2 for methods.
    pub fn new(
        ctx: &ExecutionContext,
        layout: Rc<CallLayout>,
        target: TrampolineTarget,
    ) -> BridgeResult<Self> {
        let data = Box::new(TrampolineData {
            context: ctx.downgrade(),
            layout,
            target,
        });

        let (closure, code) = unsafe {
            let (closure, code) = low::closure_alloc();
            if closure.is_null() {
                return Err(BridgeError::Callback("closure allocation failed".into()));
            }
            if let Err(e) = low::prep_closure(
                closure,
                data.layout.cif().as_raw_ptr(),
                trampoline_entry,
                &*data as *const TrampolineData,
                code,
            ) {
                low::closure_free(closure);
                return Err(BridgeError::Callback(format!("{:?}", e)));
            }
            (closure, code)
        };

        Ok(Self { closure, code, data })
    }

    /// Native entry point
    pub fn code(&self) -> *const c_void {
        self.code.as_ptr()
    }

    pub fn signature(&self) -> &Signature {
        self.data.layout.signature()
    }

    pub fn target(&self) -> &TrampolineTarget {
        &self.data.target
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        unsafe { low::closure_free(self.closure) };
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("code", &self.code.as_ptr())
            .field("target", &self.data.target)
            .finish()
    }
}

unsafe extern "C" fn trampoline_entry(
    _cif: &ffi_cif,
    result: &mut u8,
    args: *const *const c_void,
    data: &TrampolineData,
) {
    let result = result as *mut u8;
    let ret_size = data.layout.ret().size().max(mem::size_of::<usize>());

    let Some(ctx) = ExecutionContext::upgrade(&data.context) else {
        log::warn!("native callback after its context was torn down");
        unsafe { ptr::write_bytes(result, 0, ret_size) };
        return;
    };

    let outcome =
        panic::catch_unwind(AssertUnwindSafe(|| unsafe { dispatch(&ctx, data, result, args) }));
    let error = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error,
        Err(_) => ScriptError::Error("panic in native callback".into()),
    };
    unsafe { ptr::write_bytes(result, 0, ret_size) };
    ctx.set_pending_error(error);
}

unsafe fn dispatch(
    ctx: &ExecutionContext,
    data: &TrampolineData,
    result: *mut u8,
    args: *const *const c_void,
) -> ScriptResult<()> {
    let layout = &data.layout;
    let signature = layout.signature();
    let implicit = layout.implicit();

    let this = if implicit == 2 {
        let receiver = unsafe { *(*args as *const Id) };
        ctx.wrap_native_object(receiver, false)?
    } else {
        ScriptValue::Undefined
    };

    let mut arguments = Vec::with_capacity(signature.len().saturating_sub(1));
    for (i, encoding) in signature.iter().skip(1).enumerate() {
        let slot = unsafe { *args.add(implicit + i) } as *const u8;
        arguments.push(marshal::read_value(ctx, encoding, slot, false)?);
    }

    let value = match &data.target {
        TrampolineTarget::Function(function) => {
            let function = function
                .upgrade()
                .ok_or_else(|| ScriptError::Error("callback function has been collected".into()))?;
            ctx.call(&ScriptValue::Object(function), &ScriptValue::Undefined, &arguments)?
        }
        TrampolineTarget::Method { js_name } => {
            let method = ctx.get(&this, js_name)?;
            ctx.call(&method, &this, &arguments)?
        }
        TrampolineTarget::Getter { js_name } => ctx.get(&this, js_name)?,
        TrampolineTarget::Setter { js_name } => {
            let value = arguments.into_iter().next().unwrap_or_default();
            ctx.set(&this, js_name, value)?;
            ScriptValue::Undefined
        }
    };

    if let Some(encoding) = signature.first() {
        let mut keep = KeepAlive::default();
        marshal::write_value(ctx, encoding, result, &value, &mut keep)?;
        unsafe { widen_integer(layout.ret(), result) };
        ctx.defer(keep);
    }
    Ok(())
}

/// Closures must return small integers widened to a full register
unsafe fn widen_integer(abi: &AbiType, result: *mut u8) {
    if !abi.is_small_integer() {
        return;
    }
    let value: u64 = unsafe {
        match abi {
            AbiType::U8 => *result as u64,
            AbiType::I8 => *(result as *const i8) as i64 as u64,
            AbiType::U16 => ptr::read_unaligned(result as *const u16) as u64,
            AbiType::I16 => ptr::read_unaligned(result as *const i16) as i64 as u64,
            AbiType::U32 => ptr::read_unaligned(result as *const u32) as u64,
            AbiType::I32 => ptr::read_unaligned(result as *const i32) as i64 as u64,
            _ => return,
        }
    };
    unsafe { ptr::write_unaligned(result as *mut usize, value as usize) };
}

// ============================================================================
// Block literals
// ============================================================================

const BLOCK_IS_GLOBAL: i32 = 1 << 28;

#[repr(C)]
struct BlockDescriptor {
    reserved: libc::c_ulong,
    size: libc::c_ulong,
}

/// Native block layout
#[repr(C)]
pub struct BlockLiteral {
    pub isa: *const c_void,
    pub flags: i32,
    pub reserved: i32,
    /// `fn(block, args...)`
    pub invoke: *const c_void,
    descriptor: *const BlockDescriptor,
}

static BLOCK_DESCRIPTOR: BlockDescriptor = BlockDescriptor {
    reserved: 0,
    size: mem::size_of::<BlockLiteral>() as libc::c_ulong,
};

static GLOBAL_BLOCK_CLASS: [usize; 4] = [0; 4];

/// A block whose invoke function is a trampoline
pub struct ScriptBlock {
    literal: Box<BlockLiteral>,
    trampoline: Trampoline,
}

impl ScriptBlock {
    /// `trampoline` must have been built with one implicit parameter
    pub fn new(trampoline: Trampoline) -> Self {
        let literal = Box::new(BlockLiteral {
            isa: GLOBAL_BLOCK_CLASS.as_ptr() as *const c_void,
            flags: BLOCK_IS_GLOBAL,
            reserved: 0,
            invoke: trampoline.code(),
            descriptor: &BLOCK_DESCRIPTOR,
        });
        Self { literal, trampoline }
    }

    pub fn as_ptr(&self) -> *mut c_void {
        &*self.literal as *const BlockLiteral as *mut c_void
    }

    pub fn signature(&self) -> &Signature {
        self.trampoline.signature()
    }
}

impl fmt::Debug for ScriptBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptBlock")
            .field("literal", &self.as_ptr())
            .field("trampoline", &self.trampoline)
            .finish()
    }
}

/// Invoke function of a native block
///
/// # Safety
/// `block` must point to a block literal.
pub unsafe fn block_invoke(block: *const c_void) -> *const c_void {
    unsafe { (*(block as *const BlockLiteral)).invoke }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widen_signed() {
        let mut slot = [0xffu8; 8];
        unsafe {
            *(slot.as_mut_ptr() as *mut i8) = -2;
            widen_integer(&AbiType::I8, slot.as_mut_ptr());
            assert_eq!(ptr::read_unaligned(slot.as_ptr() as *const i64), -2);
        }
    }

    #[test]
    fn test_widen_unsigned() {
        let mut slot = [0xffu8; 8];
        unsafe {
            ptr::write_unaligned(slot.as_mut_ptr() as *mut u16, 0xfffe);
            widen_integer(&AbiType::U16, slot.as_mut_ptr());
            assert_eq!(ptr::read_unaligned(slot.as_ptr() as *const u64), 0xfffe);
        }
    }
}
