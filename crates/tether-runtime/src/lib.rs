//! Tether Runtime
//!
//! Bridges a script engine to a class-based native object system using the
//! metadata produced by `tether-meta`:
//! - **Calls**: script arguments marshalled into native calls and back (`ffi`)
//! - **Wrappers**: script objects standing for native values (`wrapper`)
//! - **Subclassing**: native classes built from script constructors (`class_builder`)
//! - **Lifecycle**: finalization of unreachable wrappers (`lifecycle`)
//! - **Workers**: script contexts on their own threads (`worker`)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_meta::MetadataStore;
//! use tether_runtime::{ExecutionContext, HostRuntime};
//!
//! let store = Arc::new(MetadataStore::open("metadata.bin")?);
//! let ctx = ExecutionContext::new(Arc::new(HostRuntime::new()), store);
//!
//! let object = ctx.global("NSObject")?;
//! let instance = ctx.construct(&object, &[])?;
//! let description = ctx.invoke(&instance, "description", &[])?;
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::missing_safety_doc)]

pub mod caches;
pub mod class_builder;
pub mod context;
pub mod defaults;
pub mod error;
pub mod ffi;
pub mod interop;
pub mod lifecycle;
pub mod objrt;
pub mod options;
pub mod script;
pub mod symbols;
pub mod worker;
pub mod wrapper;

#[cfg(test)]
mod testing;

pub use class_builder::{ClassExtension, ExtendOptions};
pub use context::{CallScope, ExecutionContext};
pub use error::{BridgeError, BridgeResult, LoadError};
pub use lifecycle::{DrainReport, HeapStats, ScriptHeap};
pub use objrt::{HostRuntime, ObjectRuntime};
pub use options::{BridgeOptions, StructPassing};
pub use script::{ObjectBuilder, ObjectRef, ScriptError, ScriptObject, ScriptResult, ScriptValue};
pub use symbols::{Library, SymbolResolver};
pub use worker::{WorkerRegistry, WorkerScope, WorkerState};
pub use wrapper::{Wrapper, WrapperKind};
