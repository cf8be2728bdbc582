//! Benchmark image file queries with a 1000-record dataset.

use criterion::{criterion_group, criterion_main, Criterion};
use imagetiles_db::models::NewImageFile;
use imagetiles_db::pool::{init_memory_pool, PooledConnection};
use imagetiles_db::queries::image_files;

fn setup() -> (PooledConnection, imagetiles_common::ImageFileId) {
    let pool = init_memory_pool().expect("pool");
    let conn = pool.get().expect("conn");

    let mut first_id = None;
    for i in 0..1000 {
        let project = format!("proj-{}", i % 10);
        let file = image_files::create_image_file(
            &conn,
            NewImageFile::new(format!("tile{i:04}.png"), project, 4096, 2048),
        )
        .unwrap();
        if i == 0 {
            first_id = Some(file.id);
        }
    }

    (conn, first_id.unwrap())
}

fn bench_image_file_queries(c: &mut Criterion) {
    let (conn, file_id) = setup();

    let mut group = c.benchmark_group("image_files");

    group.bench_function("get_by_id", |b| {
        b.iter(|| {
            image_files::get_image_file(&conn, file_id).unwrap();
        });
    });

    group.bench_function("list_page_by_project", |b| {
        b.iter(|| {
            image_files::list_image_files_page(&conn, Some("proj-3"), None, 50).unwrap();
        });
    });

    group.bench_function("count_all", |b| {
        b.iter(|| {
            image_files::count_image_files(&conn, None).unwrap();
        });
    });

    group.bench_function("list_projects", |b| {
        b.iter(|| {
            image_files::list_projects(&conn).unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_image_file_queries);
criterion_main!(benches);
