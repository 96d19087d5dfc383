use std::fs::File;
use std::io::Write;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use library_loader::LoaderConfig;
use library_loader::loader::{CpuFamily, ExtractionCache, LibraryDescriptor, make_library_path_in_zip_file};
use zip::write::SimpleFileOptions;

/// Archive path resolution runs once per library on every startup
fn benchmark_path_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_resolution");

    group.bench_function("make_library_path_in_zip_file", |b| {
        b.iter(|| {
            make_library_path_in_zip_file(black_box("monochrome"), &CpuFamily::Arm, true, true)
        })
    });

    let mut config = LoaderConfig::new(["monochrome"]);
    config.cpu_family = CpuFamily::Arm;
    group.bench_function("descriptor_resolve", |b| {
        b.iter(|| LibraryDescriptor::resolve(black_box("monochrome"), &config).path_in_archive(false))
    });

    group.finish();
}

/// A warm cache must not touch the archive
fn benchmark_extraction_cache_hit(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = dir.path().join("base.apk");
    let entry = "lib/arm64-v8a/libmonochrome.so";
    let mut writer = zip::ZipWriter::new(File::create(&archive).expect("create archive"));
    writer.start_file(entry, SimpleFileOptions::default()).expect("start entry");
    writer.write_all(&[0u8; 64 * 1024]).expect("write entry");
    writer.finish().expect("finish archive");

    let cache = ExtractionCache::new(dir.path().join("native_libraries"), "@bench");
    cache.ensure_extracted(&archive, entry).expect("extract");

    c.bench_function("extraction_cache_hit", |b| {
        b.iter(|| cache.ensure_extracted(black_box(&archive), black_box(entry)))
    });
}

criterion_group!(benches, benchmark_path_resolution, benchmark_extraction_cache_hit);
criterion_main!(benches);
