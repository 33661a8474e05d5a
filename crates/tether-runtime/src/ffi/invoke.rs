//! Forward calls: script arguments in, native call, script result out

use std::ffi::c_void;
use std::ptr;

use tether_meta::{TypeEncoding, TypeKind};

use super::call::{CallFrame, Signature};
use super::marshal::{self, KeepAlive};
use crate::context::ExecutionContext;
use crate::error::BridgeError;
use crate::objrt::Id;
use crate::script::{ScriptError, ScriptResult, ScriptValue};

/// One native call
pub struct NativeCall<'a> {
    pub address: *const c_void,
    /// Return type first
    pub signature: &'a Signature,
    /// Leading parameters not visible to script (receiver and selector)
    pub implicit: &'a [*const c_void],
    /// The result carries a +1 retain the caller must balance
    pub owns_returned: bool,
    /// The last parameter is an `NSError **` out-parameter
    pub error_out: bool,
}

impl<'a> NativeCall<'a> {
    pub fn function(address: *const c_void, signature: &'a Signature) -> Self {
        Self {
            address,
            signature,
            implicit: &[],
            owns_returned: false,
            error_out: false,
        }
    }
}

/// Perform `call` with script arguments
///
/// A null receiver skips the native call; the zeroed return slot decodes to
/// the type's empty value.
pub fn call_native(
    ctx: &ExecutionContext,
    call: &NativeCall<'_>,
    args: &[ScriptValue],
) -> ScriptResult<ScriptValue> {
    let Some((ret, params)) = call.signature.split_first() else {
        return Err(BridgeError::UnsupportedEncoding(TypeKind::Void).into());
    };

    let append_error = call.error_out && args.len() + 1 == params.len();
    let explicit = if append_error { params.len() - 1 } else { params.len() };
    if args.len() != explicit {
        return Err(BridgeError::ArgumentCount {
            expected: explicit,
            actual: args.len(),
        }
        .into());
    }

    let implicit = call.implicit.len();
    let layout = ctx.layout(call.signature, implicit)?;
    let mut frame = CallFrame::new(&layout);
    let mut keep = KeepAlive::default();

    for (i, value) in call.implicit.iter().enumerate() {
        unsafe { ptr::write_unaligned(frame.arg_slot(i) as *mut *const c_void, *value) };
    }
    for (i, (encoding, value)) in params.iter().zip(args).enumerate() {
        marshal::write_value(ctx, encoding, frame.arg_slot(implicit + i), value, &mut keep)?;
    }

    let mut error: Id = ptr::null_mut();
    if append_error {
        let slot = frame.arg_slot(implicit + explicit);
        unsafe { ptr::write_unaligned(slot as *mut *mut Id, &mut error as *mut Id) };
    }

    let skip = implicit > 0 && call.implicit[0].is_null();
    let scope = ctx.enter_call();
    if skip {
        log::trace!("call with nil receiver skipped");
    } else {
        unsafe { frame.invoke(call.address) };
    }

    let owned = call.owns_returned && !skip;
    if let Some(pending) = ctx.take_pending_error() {
        if owned {
            release_returned(ctx, ret, frame.ret_slot());
        }
        return Err(pending);
    }
    if !error.is_null() {
        if owned {
            release_returned(ctx, ret, frame.ret_slot());
        }
        return Err(ScriptError::Native(ctx.runtime().describe(error)));
    }

    let result = marshal::read_value(ctx, ret, frame.ret_slot(), owned);
    drop(scope);
    result
}


/// Balance a +1 object result that never reaches script
fn release_returned(ctx: &ExecutionContext, ret: &TypeEncoding, slot: *const u8) {
    if !matches!(
        ret,
        TypeEncoding::Id { .. }
            | TypeEncoding::InstanceType
            | TypeEncoding::InterfaceDeclarationReference { .. }
    ) {
        return;
    }
    let object = unsafe { ptr::read_unaligned(slot as *const Id) };
    if !object.is_null() {
        ctx.runtime().release(object);
    }
}
