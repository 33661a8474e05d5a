//! Tether metadata
//!
//! The binary description of a native API surface shared by the offline
//! producer and the runtime engine:
//! - [`TypeEncoding`]: tagged description of a native type
//! - [`MetaFile`] / [`MetadataFile`]: hashtable-indexed record heap
//! - [`BinarySerializer`]: builds a file from a [`DeclarationGraph`]
//! - [`MetadataStore`]: lazily decoded, cached typed records

#![warn(rust_2018_idioms)]

pub mod binary;
pub mod decl;
pub mod encoding;
pub mod error;
pub mod file;
mod filters;
pub mod flags;
pub mod hashtable;
pub mod meta;
pub mod serializer;
pub mod store;

pub use binary::{BinaryReader, BinaryWriter, DecodeError, MetaFileOffset};
pub use decl::{Declaration, DeclarationGraph, DeclType, ModuleDecl};
pub use encoding::{RecordField, TypeEncoding, TypeKind};
pub use error::{CreationError, CreationResult, DeclarationInfo};
pub use file::{MetaFile, MetaFileError, MetaFileResult, MetadataFile, NameTable};
pub use flags::MetaKind;
pub use meta::{
    ClassMeta, FunctionMeta, JsCodeMeta, LibraryMeta, Meta, MetaHeader, MethodMeta, ModuleMeta,
    PropertyMeta, RecordMeta, VarMeta, Version,
};
pub use serializer::{BinarySerializer, MetaFileBuilderOptions, SerializeOutput};
pub use store::{Member, MetadataStore};
