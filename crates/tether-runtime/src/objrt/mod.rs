//! Native object runtime seam
//!
//! [`ObjectRuntime`] is the reflective surface of the class-based native
//! object system: classes, selectors, method implementations, dynamic class
//! allocation and manual reference counting. Handles are raw pointers, as
//! they are for the native system itself.

mod host;

pub use host::HostRuntime;

use std::ffi::c_void;

use tether_meta::{MetadataStore, RecordField, TypeEncoding};

/// Native object
pub type Id = *mut c_void;
/// Native class object
pub type Class = *mut c_void;
/// Interned selector
pub type Sel = *const c_void;
/// Method implementation (`fn(self, _cmd, ...)`)
pub type Imp = *const c_void;
/// Protocol object
pub type Protocol = *mut c_void;

/// Reflection and memory management of the native object system
pub trait ObjectRuntime: Send + Sync {
    // ===== Classes =====

    /// A registered class by name
    fn get_class(&self, name: &str) -> Option<Class>;

    /// Class of an object; the metaclass for a class object
    fn class_of(&self, object: Id) -> Class;

    fn superclass(&self, class: Class) -> Option<Class>;

    fn class_name(&self, class: Class) -> String;

    /// Whether `object` is itself a class
    fn is_class(&self, object: Id) -> bool;

    // ===== Selectors and methods =====

    fn register_selector(&self, name: &str) -> Sel;

    fn selector_name(&self, selector: Sel) -> String;

    /// Implementation found on `class` or its superclasses
    fn lookup_imp(&self, class: Class, selector: Sel) -> Option<Imp>;

    /// Implementation a super send from a method of `class` reaches; the
    /// search starts at the superclass of `class`
    fn lookup_super_imp(&self, class: Class, selector: Sel) -> Option<Imp>;

    // ===== Dynamic classes =====

    /// Allocate a class pair. `None` when the name is taken.
    fn allocate_class_pair(&self, superclass: Class, name: &str) -> Option<Class>;

    /// Add a method to a class being built; `types` is the native type string
    fn add_method(&self, class: Class, selector: Sel, imp: Imp, types: &str) -> bool;

    fn register_class_pair(&self, class: Class);

    /// Whether `allocate_class_pair` rejects concurrent duplicate names on its own
    fn allocation_is_atomic(&self) -> bool;

    // ===== Protocols =====

    fn get_protocol(&self, name: &str) -> Option<Protocol>;

    fn protocol_name(&self, protocol: Protocol) -> String;

    fn add_protocol(&self, class: Class, protocol: Protocol) -> bool;

    fn conforms_to(&self, class: Class, protocol: Protocol) -> bool;

    // ===== Instances =====

    /// Allocate an instance with a retain count of one
    fn create_instance(&self, class: Class) -> Id;

    fn retain(&self, object: Id) -> Id;

    fn release(&self, object: Id);

    fn retain_count(&self, object: Id) -> usize;

    /// Defer a release to the end of the current outermost call
    fn autorelease(&self, object: Id) -> Id;

    fn drain_autorelease_pool(&self);

    // ===== Boxed values =====

    /// New native string with a retain count of one
    fn new_string(&self, value: &str) -> Id;

    /// Contents of a native string object
    fn string_value(&self, object: Id) -> Option<String>;

    /// New native error object with a retain count of one
    fn new_error(&self, description: &str) -> Id;

    /// Human-readable description of an object
    fn describe(&self, object: Id) -> String;
}

// ============================================================================
// Native type strings
// ============================================================================

/// Native type string of a method signature: return type, `self`, `_cmd`,
/// then the parameters
pub fn method_type_string(signature: &[TypeEncoding], store: &MetadataStore) -> String {
    let mut out = String::new();
    if let Some((ret, params)) = signature.split_first() {
        push_type(&mut out, ret, store);
        out.push_str("@:");
        for param in params {
            push_type(&mut out, param, store);
        }
    }
    out
}

fn push_record(
    out: &mut String,
    open: char,
    name: &str,
    fields: &[RecordField],
    close: char,
    store: &MetadataStore,
) {
    out.push(open);
    out.push_str(name);
    out.push('=');
    for field in fields {
        push_type(out, &field.encoding, store);
    }
    out.push(close);
}

fn push_type(out: &mut String, encoding: &TypeEncoding, store: &MetadataStore) {
    let long_is_64 = std::mem::size_of::<libc::c_long>() == 8;
    match encoding {
        TypeEncoding::Void => out.push('v'),
        TypeEncoding::Bool => out.push('B'),
        TypeEncoding::Short => out.push('s'),
        TypeEncoding::UShort | TypeEncoding::Unichar => out.push('S'),
        TypeEncoding::Int => out.push('i'),
        TypeEncoding::UInt => out.push('I'),
        TypeEncoding::Long => out.push(if long_is_64 { 'q' } else { 'l' }),
        TypeEncoding::ULong => out.push(if long_is_64 { 'Q' } else { 'L' }),
        TypeEncoding::LongLong => out.push('q'),
        TypeEncoding::ULongLong => out.push('Q'),
        TypeEncoding::Char | TypeEncoding::CharS => out.push('c'),
        TypeEncoding::UChar => out.push('C'),
        TypeEncoding::CString => out.push('*'),
        TypeEncoding::Float => out.push('f'),
        TypeEncoding::Double => out.push('d'),
        TypeEncoding::InterfaceDeclarationReference { .. }
        | TypeEncoding::Id { .. }
        | TypeEncoding::InstanceType
        | TypeEncoding::ProtocolType => out.push('@'),
        TypeEncoding::Class => out.push('#'),
        TypeEncoding::Selector => out.push(':'),
        TypeEncoding::Block { .. } => out.push_str("@?"),
        TypeEncoding::FunctionPointer { .. } => out.push_str("^?"),
        TypeEncoding::VaList => out.push_str("^v"),
        TypeEncoding::Pointer { target } | TypeEncoding::IncompleteArray { element: target } => {
            out.push('^');
            push_type(out, target, store);
        }
        TypeEncoding::ConstantArray { size, element } | TypeEncoding::Vector { size, element } => {
            out.push('[');
            out.push_str(&size.to_string());
            push_type(out, element, store);
            out.push(']');
        }
        TypeEncoding::StructDeclarationReference { name } => {
            let record = store.record(name);
            push_record(out, '{', &record.header.name, &record.fields, '}', store);
        }
        TypeEncoding::UnionDeclarationReference { name } => {
            let record = store.record(name);
            push_record(out, '(', &record.header.name, &record.fields, ')', store);
        }
        TypeEncoding::AnonymousStruct { fields } => push_record(out, '{', "?", fields, '}', store),
        TypeEncoding::AnonymousUnion { fields } => push_record(out, '(', "?", fields, ')', store),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::empty_store;

    #[test]
    fn test_method_type_string() {
        let store = empty_store();
        let signature = [
            TypeEncoding::Void,
            TypeEncoding::Int,
            TypeEncoding::id(),
            TypeEncoding::pointer(TypeEncoding::Void),
            TypeEncoding::AnonymousStruct {
                fields: vec![
                    RecordField::new("x", TypeEncoding::Double),
                    RecordField::new("y", TypeEncoding::Double),
                ],
            },
        ];
        assert_eq!(method_type_string(&signature, &store), "v@:i@^v{?=dd}");
        assert_eq!(method_type_string(&[], &store), "");
    }
}
