use divan::Bencher;
use lnx_view_pool::{FileIndex, FileViewPool, OpenMode, PoolConfig, StorageId};

fn main() {
    divan::main();
}

#[divan::bench]
fn bench_cached_open(bencher: Bencher) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench");
    std::fs::write(&path, vec![0u8; 8 << 10]).unwrap();

    let pool = FileViewPool::new(PoolConfig::default());
    pool.open_file(StorageId(0), FileIndex(0), &path, 8 << 10, OpenMode::READ)
        .unwrap();

    bencher.bench(|| {
        pool.open_file(
            StorageId(0),
            FileIndex(0),
            divan::black_box(&path),
            8 << 10,
            OpenMode::READ,
        )
        .unwrap()
    });
}

#[divan::bench(sample_count = 100)]
fn bench_open_evict_cycle(bencher: Bencher) {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = (0..2u32)
        .map(|file| {
            let path = dir.path().join(format!("f{file}"));
            std::fs::write(&path, vec![0u8; 4096]).unwrap();
            path
        })
        .collect();

    let pool = FileViewPool::new(PoolConfig {
        size_limit: 1,
        page_size: 4096,
    });

    bencher.bench(|| {
        for (file, path) in paths.iter().enumerate() {
            pool.open_file(
                StorageId(0),
                FileIndex(file as u32),
                divan::black_box(path),
                4096,
                OpenMode::READ,
            )
            .unwrap();
        }
    });
}
