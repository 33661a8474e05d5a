//! Metadata Store
//!
//! Lazily materializes heap records into typed [`Meta`] values and caches
//! them by name. Records are immutable once decoded, so one store is shared
//! by every execution context in the process.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rustc_hash::FxHashSet;

use crate::binary::MetaFileOffset;
use crate::file::{MetaFileResult, MetadataFile, NameTable};
use crate::meta::{ClassMeta, Meta, MethodMeta, ModuleMeta, PropertyMeta, RecordMeta};

static GLOBAL_STORE: OnceCell<MetadataStore> = OnceCell::new();

type NameCache = DashMap<String, Option<Arc<Meta>>>;

/// A class member found by script name
#[derive(Debug, Clone)]
pub enum Member {
    Method(Arc<MethodMeta>),
    Property(Arc<PropertyMeta>),
}

/// Typed, cached view over a [`MetadataFile`]
pub struct MetadataStore {
    file: MetadataFile,
    by_js_name: NameCache,
    by_protocol: NameCache,
    by_interface: NameCache,
    records: DashMap<MetaFileOffset, Arc<Meta>>,
    modules: DashMap<MetaFileOffset, Arc<ModuleMeta>>,
}

impl MetadataStore {
    pub fn new(file: MetadataFile) -> Self {
        Self {
            file,
            by_js_name: DashMap::new(),
            by_protocol: DashMap::new(),
            by_interface: DashMap::new(),
            records: DashMap::new(),
            modules: DashMap::new(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> MetaFileResult<Self> {
        Ok(Self::new(MetadataFile::from_bytes(bytes)?))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> MetaFileResult<Self> {
        Ok(Self::new(MetadataFile::open(path)?))
    }

    /// Install the process-wide store. Fails with the given store if one is
    /// already installed.
    pub fn install_global(store: MetadataStore) -> Result<&'static MetadataStore, MetadataStore> {
        GLOBAL_STORE.try_insert(store).map_err(|(_, store)| store)
    }

    /// The process-wide store, if installed
    pub fn global() -> Option<&'static MetadataStore> {
        GLOBAL_STORE.get()
    }

    pub fn file(&self) -> &MetadataFile {
        &self.file
    }

    // ===== Lookup =====

    /// Look up by script name, falling back to native interface and protocol
    /// names
    pub fn try_lookup(&self, name: &str) -> MetaFileResult<Option<Arc<Meta>>> {
        if let Some(meta) = self.cached(&self.by_js_name, NameTable::Global, name)? {
            return Ok(Some(meta));
        }
        if let Some(meta) = self.cached(&self.by_interface, NameTable::Interfaces, name)? {
            return Ok(Some(meta));
        }
        self.cached(&self.by_protocol, NameTable::Protocols, name)
    }

    /// Look up by script or native name
    ///
    /// # Panics
    /// When the record cannot be decoded: the blob does not match this engine.
    pub fn lookup(&self, name: &str) -> Option<Arc<Meta>> {
        self.try_lookup(name)
            .unwrap_or_else(|e| panic!("corrupt metadata while resolving '{}': {}", name, e))
    }

    /// Find a protocol by native name
    pub fn find_protocol(&self, native_name: &str) -> Option<Arc<Meta>> {
        self.cached(&self.by_protocol, NameTable::Protocols, native_name)
            .unwrap_or_else(|e| panic!("corrupt metadata for protocol '{}': {}", native_name, e))
    }

    /// Find an interface by native name
    pub fn find_interface(&self, native_name: &str) -> Option<Arc<Meta>> {
        self.cached(&self.by_interface, NameTable::Interfaces, native_name)
            .unwrap_or_else(|e| panic!("corrupt metadata for interface '{}': {}", native_name, e))
    }

    /// Resolve a struct or union declaration reference
    ///
    /// # Panics
    /// When the name is unknown or not a record. A dangling reference means
    /// the engine and the metadata blob were built from different sources.
    pub fn resolve_record(&self, js_name: &str) -> Arc<Meta> {
        match self.lookup(js_name) {
            Some(meta) if meta.as_record().is_some() => meta,
            Some(meta) => panic!(
                "declaration reference '{}' resolves to a {:?}, not a record",
                js_name,
                meta.kind()
            ),
            None => panic!("unresolved declaration reference '{}'", js_name),
        }
    }

    /// Fields of a resolved record
    pub fn record(&self, js_name: &str) -> RecordMeta {
        match self.resolve_record(js_name).as_ref() {
            Meta::Record(record) => record.clone(),
            _ => unreachable!("resolve_record returns records only"),
        }
    }

    fn cached(
        &self,
        cache: &NameCache,
        table: NameTable,
        name: &str,
    ) -> MetaFileResult<Option<Arc<Meta>>> {
        if let Some(hit) = cache.get(name) {
            return Ok(hit.clone());
        }
        log::trace!("metadata cache miss: {} ({:?})", name, table);
        let meta = match self.file.find(table, name)? {
            Some(offset) => Some(self.meta_at(offset)?),
            None => None,
        };
        Ok(cache.entry(name.to_string()).or_insert(meta).clone())
    }

    /// Decode the record at `offset`, sharing it across name tables
    pub fn meta_at(&self, offset: MetaFileOffset) -> MetaFileResult<Arc<Meta>> {
        if let Some(hit) = self.records.get(&offset) {
            return Ok(hit.clone());
        }
        let meta = Arc::new(Meta::read(self.file.heap(), offset)?);
        Ok(self.records.entry(offset).or_insert(meta).clone())
    }

    // ===== Modules =====

    /// Top-level module owning a record
    pub fn module_of(&self, meta: &Meta) -> MetaFileResult<Option<Arc<ModuleMeta>>> {
        match meta.header().module {
            0 => Ok(None),
            offset => self.module_at(offset).map(Some),
        }
    }

    fn module_at(&self, offset: MetaFileOffset) -> MetaFileResult<Arc<ModuleMeta>> {
        if let Some(hit) = self.modules.get(&offset) {
            return Ok(hit.clone());
        }
        let module = Arc::new(ModuleMeta::read(self.file.heap(), offset)?);
        Ok(self.modules.entry(offset).or_insert(module).clone())
    }

    /// Every top-level module of the file
    pub fn modules(&self) -> MetaFileResult<Vec<Arc<ModuleMeta>>> {
        self.file
            .modules()
            .iter()
            .map(|&offset| self.module_at(offset))
            .collect()
    }

    // ===== Class hierarchy =====

    /// The base interface of a class
    pub fn base_of(&self, class: &ClassMeta) -> Option<Arc<Meta>> {
        class
            .base_name
            .as_deref()
            .and_then(|base| self.lookup(base))
            .filter(|meta| meta.as_class().is_some())
    }

    /// The class itself, its base chain and every adopted protocol,
    /// each visited once
    pub fn ancestry(&self, class: Arc<Meta>) -> Vec<Arc<Meta>> {
        let mut seen = FxHashSet::default();
        let mut order = Vec::new();
        let mut stack = vec![class];
        while let Some(meta) = stack.pop() {
            if !seen.insert(meta.js_name().to_string()) {
                continue;
            }
            if let Some(class) = meta.as_class() {
                for protocol in class.protocols.iter().rev() {
                    if let Some(p) = self.lookup(protocol) {
                        stack.push(p);
                    }
                }
                if let Some(base) = self.base_of(class) {
                    stack.push(base);
                }
            }
            order.push(meta);
        }
        order
    }

    /// Methods and properties named `js_name`, nearest declaration first
    pub fn members_by_js_name(
        &self,
        class: Arc<Meta>,
        js_name: &str,
        is_static: bool,
    ) -> Vec<Member> {
        let mut members = Vec::new();
        for meta in self.ancestry(class) {
            let Some(class) = meta.as_class() else {
                continue;
            };
            members.extend(
                class
                    .methods_named(js_name, is_static)
                    .cloned()
                    .map(Member::Method),
            );
            if let Some(property) = class.property_named(js_name, is_static) {
                members.push(Member::Property(property.clone()));
            }
        }
        members
    }

    /// Overload of `js_name` taking `arg_count` script arguments
    ///
    /// A method with an error out-parameter also accepts the call without it.
    pub fn find_method(
        &self,
        class: Arc<Meta>,
        js_name: &str,
        is_static: bool,
        arg_count: usize,
    ) -> Option<Arc<MethodMeta>> {
        let candidates: Vec<_> = self
            .members_by_js_name(class, js_name, is_static)
            .into_iter()
            .filter_map(|m| match m {
                Member::Method(method) => Some(method),
                Member::Property(_) => None,
            })
            .collect();
        candidates
            .iter()
            .find(|m| m.arity() == arg_count)
            .or_else(|| {
                candidates
                    .iter()
                    .find(|m| m.has_error_out_parameter() && m.arity() == arg_count + 1)
            })
            .cloned()
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("file", &self.file)
            .field("cached", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::{
        DeclCommon, Declaration, DeclarationGraph, DeclType, FieldDecl, FunctionDecl, ModuleDecl,
        RecordDecl,
    };
    use crate::serializer::BinarySerializer;

    fn store_for(declarations: Vec<Declaration>) -> MetadataStore {
        let mut module = ModuleDecl::new("CoreGraphics");
        module.declarations = declarations;
        let graph = DeclarationGraph {
            modules: vec![module],
        };
        let output = BinarySerializer::default().serialize(&graph).unwrap();
        MetadataStore::from_bytes(output.file.to_bytes()).unwrap()
    }

    fn point() -> Declaration {
        Declaration::Struct(RecordDecl {
            common: DeclCommon::named("CGPoint"),
            fields: vec![
                FieldDecl {
                    name: "x".into(),
                    ty: DeclType::Double,
                },
                FieldDecl {
                    name: "y".into(),
                    ty: DeclType::Double,
                },
            ],
        })
    }

    #[test]
    fn test_lookup_is_cached() {
        let store = store_for(vec![point()]);
        let first = store.lookup("CGPoint").unwrap();
        let second = store.lookup("CGPoint").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(store.lookup("CGSize").is_none());
    }

    #[test]
    fn test_resolve_record() {
        let store = store_for(vec![point()]);
        let record = store.record("CGPoint");
        assert_eq!(record.fields.len(), 2);
        assert_eq!(record.fields[1].name, "y");
    }

    #[test]
    #[should_panic(expected = "unresolved declaration reference")]
    fn test_resolve_unknown_record_panics() {
        let store = store_for(vec![point()]);
        store.resolve_record("CGRect");
    }

    #[test]
    fn test_module_of() {
        let store = store_for(vec![Declaration::Function(FunctionDecl {
            common: DeclCommon::named("CGPointMake"),
            return_type: DeclType::record("CGPoint"),
            parameters: vec![DeclType::Double, DeclType::Double],
            is_variadic: false,
            owns_returned: false,
            returns_unmanaged: false,
        }), point()]);
        let meta = store.lookup("CGPointMake").unwrap();
        let module = store.module_of(&meta).unwrap().unwrap();
        assert_eq!(module.name, "CoreGraphics");
        assert_eq!(store.modules().unwrap().len(), 1);
    }
}
