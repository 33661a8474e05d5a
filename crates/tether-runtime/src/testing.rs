//! Fixtures shared by unit tests

use tether_meta::{BinarySerializer, DeclarationGraph, MetadataStore, ModuleDecl};

pub fn empty_store() -> MetadataStore {
    let graph = DeclarationGraph {
        modules: vec![ModuleDecl::new("Empty")],
    };
    let output = BinarySerializer::default().serialize(&graph).unwrap();
    MetadataStore::from_bytes(output.file.to_bytes()).unwrap()
}
