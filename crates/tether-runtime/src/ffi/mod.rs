//! FFI Call Engine
//!
//! Layout of native types, per-signature call interfaces and arenas,
//! marshalling between script and native values, and the trampolines that
//! let native code call back into script.

mod buffer;
mod call;
mod closure;
mod invoke;
mod marshal;
mod types;

pub use buffer::RawBuffer;
pub use call::{layout_key, CallFrame, CallLayout, LayoutKey, Signature};
pub use closure::{block_invoke, BlockLiteral, ScriptBlock, Trampoline, TrampolineTarget};
pub use invoke::{call_native, NativeCall};
pub use marshal::{
    read_field, read_number, read_value, write_field, write_number, write_struct, write_value,
    KeepAlive,
};
pub use types::{
    align_to, record_layout, structural_name, AbiType, Position, StructCache, StructField,
    StructInfo,
};

pub(crate) use marshal::bind_reference;
