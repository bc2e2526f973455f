/*!
Performance benchmarks for the flow configuration store.
*/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowstore_core::{
    BytesSerializer, FlowConfigurationStore, GzipCompressor, NoCompression, StorageConfig,
};
use tempfile::TempDir;

// Flow-like XML of roughly the requested size
fn generate_flow(size_kb: usize) -> Vec<u8> {
    let mut flow = String::from("<flowController encoding-version=\"1.4\"><rootGroup>");
    let mut i = 0;
    while flow.len() < size_kb * 1024 {
        flow.push_str(&format!(
            "<processor><id>{i:08x}</id><name>UpdateAttribute {i}</name>\
             <class>org.example.UpdateAttribute</class><schedulingPeriod>0 sec</schedulingPeriod>\
             <property><name>filename</name><value>out-{i}.json</value></property></processor>"
        ));
        i += 1;
    }
    flow.push_str("</rootGroup></flowController>");
    flow.into_bytes()
}

fn bench_atomic_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("atomic_save");

    for size_kb in [16, 256, 2048] {
        let flow = generate_flow(size_kb);
        let temp_dir = TempDir::new().unwrap();
        let store = FlowConfigurationStore::open(temp_dir.path().join("flow.xml.gz")).unwrap();

        group.throughput(Throughput::Bytes(flow.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size_kb), &flow, |b, flow| {
            b.iter(|| {
                store
                    .save_document(black_box(&BytesSerializer(flow)), false)
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");

    for size_kb in [16, 256, 2048] {
        let flow = generate_flow(size_kb);
        let temp_dir = TempDir::new().unwrap();
        let store = FlowConfigurationStore::open(temp_dir.path().join("flow.xml.gz")).unwrap();
        store.save_document(&BytesSerializer(&flow), false).unwrap();

        group.throughput(Throughput::Bytes(flow.len() as u64));
        group.bench_function(BenchmarkId::from_parameter(size_kb), |b| {
            b.iter(|| black_box(store.load_bytes().unwrap()))
        });
    }

    group.finish();
}

fn bench_compression_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression_level");
    let flow = generate_flow(512);
    group.throughput(Throughput::Bytes(flow.len() as u64));

    for level in [1u32, 6, 9] {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig::new(temp_dir.path().join("flow.xml.gz")).with_compression_level(level);
        let store = FlowConfigurationStore::with_compressor(&config, GzipCompressor::with_level(level)).unwrap();

        group.bench_function(BenchmarkId::new("gzip", level), |b| {
            b.iter(|| store.save_document(&BytesSerializer(&flow), false).unwrap())
        });
    }

    let temp_dir = TempDir::new().unwrap();
    let config = StorageConfig::new(temp_dir.path().join("flow.xml"));
    let raw_store = FlowConfigurationStore::with_compressor(&config, NoCompression).unwrap();
    group.bench_function("none", |b| {
        b.iter(|| raw_store.save_document(&BytesSerializer(&flow), false).unwrap())
    });

    group.finish();
}

fn bench_save_with_archive(c: &mut Criterion) {
    let flow = generate_flow(256);
    let temp_dir = TempDir::new().unwrap();
    let config = StorageConfig::new(temp_dir.path().join("flow.xml.gz")).with_archive_max_count(10);
    let store = FlowConfigurationStore::from_config(&config).unwrap();

    c.bench_function("save_with_archive_256kb", |b| {
        b.iter(|| store.save_document(&BytesSerializer(&flow), true).unwrap())
    });
}

criterion_group!(
    benches,
    bench_atomic_save,
    bench_load,
    bench_compression_levels,
    bench_save_with_archive
);
criterion_main!(benches);
