//! The `interop` global
//!
//! Script-side access to raw memory: `Pointer`, typed `Reference`s,
//! `FunctionReference`, struct type constructors, the primitive `types`
//! table and the memory helpers (`alloc`, `free`, `adopt`, `sizeof`,
//! `handleof`).

use std::mem;
use std::rc::Rc;

use tether_meta::TypeEncoding;

use crate::context::{prototype_of, ExecutionContext};
use crate::error::BridgeError;
use crate::ffi::{
    bind_reference, read_field, write_field, write_struct, KeepAlive, Position, RawBuffer,
    StructInfo,
};
use crate::script::{
    ObjectBuilder, ObjectRef, ScriptError, ScriptObject, ScriptResult, ScriptValue,
};
use crate::wrapper::{
    FunctionReferenceWrapper, PointerWrapper, ReferenceStorage, ReferenceWrapper, StructStorage,
    Wrapper, WrapperCell,
};

const POINTER_SIZE: usize = mem::size_of::<usize>();

fn function(
    f: impl Fn(&ExecutionContext, &ScriptValue, &[ScriptValue]) -> ScriptResult<ScriptValue> + 'static,
) -> ScriptValue {
    ScriptValue::Object(ScriptObject::function(f))
}

fn arg(args: &[ScriptValue], index: usize) -> ScriptValue {
    args.get(index).cloned().unwrap_or_default()
}

fn cell_of(value: &ScriptValue, expected: &'static str) -> ScriptResult<Rc<WrapperCell>> {
    value
        .as_object()
        .and_then(|o| o.wrapper())
        .ok_or_else(|| BridgeError::InvalidReceiver(expected).into())
}

/// Build the `interop` object
pub fn install(ctx: &ExecutionContext) -> ScriptResult<ObjectRef> {
    let interop = ScriptObject::new();

    let pointer = ObjectBuilder::new()
        .construct(Rc::new(|ctx, _this, args| {
            let address = arg(args, 0).to_number();
            Ok(ctx.pointer_value(address as usize))
        }))
        .build();
    pointer.set_value("prototype", ScriptValue::Object(pointer_prototype(ctx)));
    interop.set_value("Pointer", ScriptValue::Object(pointer));

    let reference = ObjectBuilder::new()
        .construct(Rc::new(construct_reference))
        .build();
    reference.set_value("prototype", ScriptValue::Object(reference_prototype(ctx)));
    interop.set_value("Reference", ScriptValue::Object(reference));

    let function_reference = ObjectBuilder::new()
        .construct(Rc::new(|ctx, _this, args| {
            let target = arg(args, 0);
            let function = target
                .as_object()
                .filter(|f| f.is_callable())
                .ok_or_else(|| ScriptError::type_error("FunctionReference expects a function"))?;
            let object = ObjectBuilder::new()
                .wrapper(Wrapper::FunctionReference(FunctionReferenceWrapper {
                    function: Some(function.clone()),
                    trampolines: Vec::new(),
                }))
                .build();
            ctx.track(&object);
            Ok(ScriptValue::Object(object))
        }))
        .build();
    interop.set_value("FunctionReference", ScriptValue::Object(function_reference));

    interop.set_value("types", ScriptValue::Object(primitive_types()));

    interop.set_value(
        "alloc",
        function(|ctx, _this, args| {
            let size = arg(args, 0).to_number().max(0.0) as usize;
            let address = unsafe { libc::calloc(size.max(1), 1) } as usize;
            if address == 0 {
                return Err(ScriptError::RangeError(format!("cannot allocate {} bytes", size)));
            }
            let object = ObjectBuilder::new()
                .prototype(Some(pointer_prototype(ctx)))
                .wrapper(Wrapper::Pointer(PointerWrapper { address, adopted: true }))
                .build();
            ctx.caches().insert_pointer(address, &object);
            ctx.track(&object);
            Ok(ScriptValue::Object(object))
        }),
    );
    interop.set_value(
        "free",
        function(|_ctx, _this, args| {
            let cell = cell_of(&arg(args, 0), "Pointer")?;
            let mut wrapper = cell.get_mut()?;
            let Wrapper::Pointer(pointer) = &mut *wrapper else {
                return Err(BridgeError::InvalidReceiver("Pointer").into());
            };
            unsafe { libc::free(pointer.address as *mut libc::c_void) };
            pointer.adopted = false;
            Ok(ScriptValue::Undefined)
        }),
    );
    interop.set_value(
        "adopt",
        function(|_ctx, _this, args| {
            let value = arg(args, 0);
            let cell = cell_of(&value, "Pointer")?;
            let mut wrapper = cell.get_mut()?;
            let Wrapper::Pointer(pointer) = &mut *wrapper else {
                return Err(BridgeError::InvalidReceiver("Pointer").into());
            };
            pointer.adopted = true;
            Ok(value.clone())
        }),
    );
    interop.set_value("sizeof", function(|ctx, _this, args| size_of_value(ctx, &arg(args, 0))));
    interop.set_value(
        "handleof",
        function(|ctx, _this, args| {
            let value = arg(args, 0);
            let cell = cell_of(&value, "wrapped value")?;
            if let Some(encoding) = reference_encoding(&cell)? {
                let address = bind_reference(ctx, &cell, &encoding)?;
                return Ok(ctx.pointer_value(address));
            }
            let address = cell.get()?.native_address().unwrap_or(0);
            if address == 0 {
                return Ok(ScriptValue::Null);
            }
            Ok(ctx.pointer_value(address))
        }),
    );

    Ok(interop)
}

// ============================================================================
// Types
// ============================================================================

fn primitive_types() -> ObjectRef {
    let types = ScriptObject::new();
    let entries = [
        ("void", TypeEncoding::Void),
        ("bool", TypeEncoding::Bool),
        ("int8", TypeEncoding::CharS),
        ("uint8", TypeEncoding::UChar),
        ("int16", TypeEncoding::Short),
        ("uint16", TypeEncoding::UShort),
        ("int32", TypeEncoding::Int),
        ("uint32", TypeEncoding::UInt),
        ("int64", TypeEncoding::LongLong),
        ("uint64", TypeEncoding::ULongLong),
        ("float", TypeEncoding::Float),
        ("double", TypeEncoding::Double),
        ("unichar", TypeEncoding::Unichar),
        ("UTF8CString", TypeEncoding::CString),
        ("id", TypeEncoding::id()),
        ("class", TypeEncoding::Class),
        ("protocol", TypeEncoding::ProtocolType),
        ("selector", TypeEncoding::Selector),
    ];
    for (name, encoding) in entries {
        let object = ObjectBuilder::new().wrapper(Wrapper::Primitive(encoding)).build();
        types.set_value(name, ScriptValue::Object(object));
    }
    types
}

/// Encoding named by a type object: a primitive, a struct type or a class
fn type_encoding(value: &ScriptValue) -> ScriptResult<Option<TypeEncoding>> {
    let Some(cell) = value.as_object().and_then(|o| o.wrapper()) else {
        return Ok(None);
    };
    let wrapper = cell.get()?;
    Ok(match &*wrapper {
        Wrapper::Primitive(encoding) => Some(encoding.clone()),
        Wrapper::StructType(info) => Some(info.encoding.clone()),
        Wrapper::NativeClass(_) | Wrapper::NativeProtocol(_) => Some(TypeEncoding::id()),
        _ => None,
    })
}

fn size_of_value(ctx: &ExecutionContext, value: &ScriptValue) -> ScriptResult<ScriptValue> {
    let cell = cell_of(value, "type")?;
    let wrapper = cell.get()?;
    let size = match &*wrapper {
        Wrapper::Primitive(encoding) => ctx.abi_type(encoding, Position::Field)?.size(),
        Wrapper::StructType(info) => info.size,
        Wrapper::Struct(value) => value.info.size,
        Wrapper::Reference(reference) => {
            reference.abi.as_ref().map_or(POINTER_SIZE, |abi| abi.size())
        }
        _ => POINTER_SIZE,
    };
    Ok(ScriptValue::Number(size as f64))
}

// ============================================================================
// Pointer
// ============================================================================

fn pointer_address(this: &ScriptValue) -> ScriptResult<usize> {
    let cell = cell_of(this, "Pointer")?;
    let wrapper = cell.get()?;
    match &*wrapper {
        Wrapper::Pointer(pointer) => Ok(pointer.address),
        _ => Err(BridgeError::InvalidReceiver("Pointer").into()),
    }
}

/// Address of a pointer object, `None` for anything else
fn pointer_target(value: &ScriptValue) -> ScriptResult<Option<usize>> {
    let Some(cell) = value.as_object().and_then(|o| o.wrapper()) else {
        return Ok(None);
    };
    let wrapper = cell.get()?;
    Ok(match &*wrapper {
        Wrapper::Pointer(pointer) => Some(pointer.address),
        _ => None,
    })
}

/// Shared prototype of pointer objects
pub fn pointer_prototype(ctx: &ExecutionContext) -> ObjectRef {
    if let Some(prototype) = ctx.caches().prototype("Pointer") {
        return prototype;
    }
    let prototype = ScriptObject::new();
    prototype.set_value(
        "add",
        function(|ctx, this, args| {
            let offset = arg(args, 0).to_number() as isize;
            Ok(ctx.pointer_value(pointer_address(this)?.wrapping_add_signed(offset)))
        }),
    );
    prototype.set_value(
        "subtract",
        function(|ctx, this, args| {
            let offset = arg(args, 0).to_number() as isize;
            Ok(ctx.pointer_value(pointer_address(this)?.wrapping_add_signed(offset.wrapping_neg())))
        }),
    );
    prototype.set_value(
        "toNumber",
        function(|_ctx, this, _args| Ok(ScriptValue::Number(pointer_address(this)? as f64))),
    );
    prototype.set_value(
        "toString",
        function(|_ctx, this, _args| {
            Ok(format!("<Pointer: {:#x}>", pointer_address(this)?).into())
        }),
    );
    prototype.set_value(
        "toHexString",
        function(|_ctx, this, _args| Ok(format!("{:#x}", pointer_address(this)?).into())),
    );
    prototype.set_value(
        "toDecimalString",
        function(|_ctx, this, _args| Ok(pointer_address(this)?.to_string().into())),
    );
    ctx.caches().insert_prototype("Pointer", prototype.clone());
    prototype
}

// ============================================================================
// Reference
// ============================================================================

fn reference_encoding(cell: &WrapperCell) -> ScriptResult<Option<TypeEncoding>> {
    let wrapper = cell.get()?;
    Ok(match &*wrapper {
        Wrapper::Reference(reference) => {
            Some(reference.encoding.clone().unwrap_or(TypeEncoding::Void))
        }
        _ => None,
    })
}

/// A reference object with the shared prototype, tracked for disposal
pub fn new_reference(ctx: &ExecutionContext, reference: ReferenceWrapper) -> ObjectRef {
    let object = ObjectBuilder::new()
        .prototype(Some(reference_prototype(ctx)))
        .wrapper(Wrapper::Reference(reference))
        .build();
    ctx.track(&object);
    object
}

/// `new Reference()`, `new Reference(value)`, `new Reference(type)` and
/// `new Reference(type, value)`. A pointer value makes the reference point
/// at that memory.
fn construct_reference(
    ctx: &ExecutionContext,
    _this: &ScriptValue,
    args: &[ScriptValue],
) -> ScriptResult<ScriptValue> {
    let first = arg(args, 0);
    let Some(encoding) = type_encoding(&first)? else {
        let object = new_reference(
            ctx,
            ReferenceWrapper {
                pending: first,
                ..ReferenceWrapper::default()
            },
        );
        return Ok(ScriptValue::Object(object));
    };

    let abi = ctx.abi_type(&encoding, Position::Field)?;
    let value = arg(args, 1);
    let target = pointer_target(&value)?;

    let mut keep = KeepAlive::default();
    let storage = match target {
        Some(address) => {
            keep.hold(value.clone());
            ReferenceStorage::Borrowed(address)
        }
        None => {
            let buffer = RawBuffer::zeroed(abi.size().max(1), abi.align());
            if !value.is_undefined() {
                write_field(ctx, &encoding, buffer.as_ptr(), &value, &mut keep)?;
            }
            ReferenceStorage::Owned(buffer)
        }
    };
    let object = new_reference(
        ctx,
        ReferenceWrapper {
            encoding: Some(encoding),
            abi: Some(abi),
            storage,
            pending: ScriptValue::Undefined,
            keep,
        },
    );
    Ok(ScriptValue::Object(object))
}

/// Encoding, stride and address of element `index`; `None` while untyped
fn reference_slot(this: &ScriptValue, index: usize) -> ScriptResult<Option<(TypeEncoding, usize)>> {
    let cell = cell_of(this, "Reference")?;
    let wrapper = cell.get()?;
    let Wrapper::Reference(reference) = &*wrapper else {
        return Err(BridgeError::InvalidReceiver("Reference").into());
    };
    match (&reference.encoding, &reference.abi) {
        (Some(encoding), Some(abi)) => {
            let address = reference.address() + index * abi.size();
            Ok(Some((encoding.clone(), address)))
        }
        _ => Ok(None),
    }
}

fn read_reference(
    ctx: &ExecutionContext,
    this: &ScriptValue,
    index: usize,
) -> ScriptResult<ScriptValue> {
    match reference_slot(this, index)? {
        Some((_, 0)) => Err(ScriptError::Error("reference has no storage".into())),
        Some((encoding, address)) => read_field(ctx, &encoding, address as *const u8, Some(this)),
        None => {
            let cell = cell_of(this, "Reference")?;
            let wrapper = cell.get()?;
            match &*wrapper {
                Wrapper::Reference(reference) if index == 0 => Ok(reference.pending.clone()),
                _ => Ok(ScriptValue::Undefined),
            }
        }
    }
}

fn write_reference(
    ctx: &ExecutionContext,
    this: &ScriptValue,
    index: usize,
    value: ScriptValue,
) -> ScriptResult<()> {
    let cell = cell_of(this, "Reference")?;
    match reference_slot(this, index)? {
        Some((_, 0)) => Err(ScriptError::Error("reference has no storage".into())),
        Some((encoding, address)) => {
            let mut keep = KeepAlive::default();
            write_field(ctx, &encoding, address as *mut u8, &value, &mut keep)?;
            if let Wrapper::Reference(reference) = &mut *cell.get_mut()? {
                reference.keep.append(keep);
            }
            Ok(())
        }
        None => {
            if let Wrapper::Reference(reference) = &mut *cell.get_mut()? {
                reference.pending = value;
            }
            Ok(())
        }
    }
}

fn reference_prototype(ctx: &ExecutionContext) -> ObjectRef {
    if let Some(prototype) = ctx.caches().prototype("Reference") {
        return prototype;
    }
    let prototype = ScriptObject::new();
    prototype.define_accessor(
        "value",
        Some(Rc::new(|ctx, this, _args| read_reference(ctx, this, 0))),
        Some(Rc::new(|ctx, this, args| {
            write_reference(ctx, this, 0, arg(args, 0))?;
            Ok(ScriptValue::Undefined)
        })),
    );
    prototype.set_value(
        "get",
        function(|ctx, this, args| {
            read_reference(ctx, this, arg(args, 0).to_number().max(0.0) as usize)
        }),
    );
    prototype.set_value(
        "set",
        function(|ctx, this, args| {
            let index = arg(args, 0).to_number().max(0.0) as usize;
            write_reference(ctx, this, index, arg(args, 1))?;
            Ok(ScriptValue::Undefined)
        }),
    );
    prototype.set_value(
        "toString",
        function(|_ctx, this, _args| {
            let cell = cell_of(this, "Reference")?;
            let address = cell.get()?.native_address().unwrap_or(0);
            Ok(format!("<Reference: {:#x}>", address).into())
        }),
    );
    ctx.caches().insert_prototype("Reference", prototype.clone());
    prototype
}

// ============================================================================
// Struct types
// ============================================================================

fn struct_data(this: &ScriptValue) -> ScriptResult<*mut u8> {
    let cell = cell_of(this, "struct")?;
    let wrapper = cell.get()?;
    match &*wrapper {
        Wrapper::Struct(value) => Ok(value.data()),
        _ => Err(BridgeError::InvalidReceiver("struct").into()),
    }
}

/// Bytes of a struct value or of a plain object converted to `info`
fn struct_bytes(
    ctx: &ExecutionContext,
    info: &Rc<StructInfo>,
    value: &ScriptValue,
) -> ScriptResult<Vec<u8>> {
    let buffer = RawBuffer::zeroed(info.size, info.align);
    let mut keep = KeepAlive::default();
    write_struct(ctx, info, buffer.as_ptr(), value, &mut keep)?;
    Ok(buffer.as_slice().to_vec())
}

/// Constructor of the struct type `info`, one per structural name
pub fn struct_type(ctx: &ExecutionContext, info: &Rc<StructInfo>) -> ObjectRef {
    if let Some(constructor) = ctx.caches().struct_type(&info.name) {
        return constructor;
    }

    let prototype = ScriptObject::new();
    for field in &info.fields {
        let (encoding, offset) = (field.encoding.clone(), field.offset);
        let getter_encoding = encoding.clone();
        prototype.define_accessor(
            field.name.as_str(),
            Some(Rc::new(move |ctx, this, _args| {
                let data = struct_data(this)?;
                read_field(ctx, &getter_encoding, unsafe { data.add(offset) }, Some(this))
            })),
            Some(Rc::new(move |ctx, this, args| {
                let data = struct_data(this)?;
                let mut keep = KeepAlive::default();
                write_field(ctx, &encoding, unsafe { data.add(offset) }, &arg(args, 0), &mut keep)?;
                ctx.defer(keep);
                Ok(ScriptValue::Undefined)
            })),
        );
    }

    let construct_info = info.clone();
    let constructor = ObjectBuilder::new()
        .construct(Rc::new(move |ctx, _this, args| {
            let info = construct_info.clone();
            let value = arg(args, 0);
            let storage = match pointer_target(&value)? {
                Some(address) => StructStorage::Borrowed {
                    address,
                    owner: Some(value),
                },
                None => {
                    let buffer = RawBuffer::zeroed(info.size, info.align);
                    let mut keep = KeepAlive::default();
                    write_struct(ctx, &info, buffer.as_ptr(), &value, &mut keep)?;
                    ctx.defer(keep);
                    StructStorage::Owned(buffer)
                }
            };
            ctx.struct_value(info, storage)
        }))
        .wrapper(Wrapper::StructType(info.clone()))
        .build();

    let equals_info = info.clone();
    constructor.set_value(
        "equals",
        function(move |ctx, _this, args| {
            let left = struct_bytes(ctx, &equals_info, &arg(args, 0))?;
            let right = struct_bytes(ctx, &equals_info, &arg(args, 1))?;
            Ok(ScriptValue::Bool(left == right))
        }),
    );
    constructor.set_value("prototype", ScriptValue::Object(prototype.clone()));
    prototype.set_value("constructor", ScriptValue::Object(constructor.clone()));

    ctx.caches().insert_struct_type(&info.name, constructor.clone());
    constructor
}

/// Whether `value` is an instance of the struct type `constructor`
pub fn is_struct_of(value: &ScriptValue, constructor: &ObjectRef) -> bool {
    let (Some(object), Some(prototype)) = (value.as_object(), prototype_of(constructor)) else {
        return false;
    };
    object
        .prototype()
        .is_some_and(|p| Rc::ptr_eq(&p, &prototype))
}
