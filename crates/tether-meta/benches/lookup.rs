use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tether_meta::decl::{DeclCommon, FunctionDecl};
use tether_meta::hashtable::string_hash;
use tether_meta::{
    BinarySerializer, DeclType, Declaration, DeclarationGraph, MetadataFile, MetadataStore,
    ModuleDecl, NameTable,
};

fn build(count: usize) -> Vec<u8> {
    let mut module = ModuleDecl::new("Bench");
    module.declarations = (0..count)
        .map(|i| {
            Declaration::Function(FunctionDecl {
                common: DeclCommon::named(format!("function{}", i)),
                return_type: DeclType::Int,
                parameters: vec![DeclType::Int, DeclType::Double],
                is_variadic: false,
                owns_returned: false,
                returns_unmanaged: false,
            })
        })
        .collect();
    let graph = DeclarationGraph {
        modules: vec![module],
    };
    BinarySerializer::default()
        .serialize(&graph)
        .unwrap()
        .file
        .to_bytes()
}

fn bench_hash(c: &mut Criterion) {
    c.bench_function("string_hash", |b| {
        b.iter(|| string_hash(black_box("UIApplicationDidFinishLaunchingNotification")))
    });
}

fn bench_table_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_lookup");
    for count in [100usize, 1_000, 10_000] {
        let file = MetadataFile::from_bytes(build(count)).unwrap();
        let name = format!("function{}", count / 2);
        group.bench_with_input(BenchmarkId::from_parameter(count), &name, |b, name| {
            b.iter(|| file.find(NameTable::Global, black_box(name)).unwrap())
        });
    }
    group.finish();
}

fn bench_store_cached(c: &mut Criterion) {
    let store = MetadataStore::from_bytes(build(1_000)).unwrap();
    store.lookup("function500").unwrap();
    c.bench_function("store_cached_lookup", |b| {
        b.iter(|| store.lookup(black_box("function500")).unwrap())
    });
}

criterion_group!(benches, bench_hash, bench_table_lookup, bench_store_cached);
criterion_main!(benches);
