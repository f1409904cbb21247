//! Benchmarks for catalogue search.
//!
//! Covers query cleanup on its own and the full `search_books` path
//! (cleanup, FTS5 match, rowid ordering) against stores of increasing size.

// Criterion macros generate items without docs - this is expected for benchmarks
// Benchmarks use expect/unwrap for simplicity - panics are acceptable in benchmarks
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use shelfstore::storage::search::{FtsQuery, clean_fragment};
use shelfstore::{Author, Book, CatalogueDb, Series, StoreConfig};
use std::hint::black_box;
use std::time::Duration;

const FAMILIES: [&str; 6] = ["Le Guin", "Herbert", "Brontë", "Pratchett", "Okorafor", "Zola"];
const WORDS: [&str; 8] = [
    "darkness", "river", "winter", "machine", "garden", "empire", "signal", "harbour",
];

// ============================================================================
// Helper Functions
// ============================================================================

/// Creates an in-memory store holding `count` books.
fn populated_store(count: usize) -> CatalogueDb {
    let db = CatalogueDb::in_memory(StoreConfig::default()).expect("in-memory store");
    let session = db.session();
    let tx = session.begin_write().unwrap();
    for i in 0..count {
        let title = format!("The {} {}", WORDS[i % WORDS.len()], WORDS[(i / 3) % WORDS.len()]);
        let mut book = Book::new(title)
            .with_author(Author::new(FAMILIES[i % FAMILIES.len()], "Author"))
            .with_series(Series::new(format!("Cycle {}", i % 17), (i % 9).to_string()));
        book.description = format!("Volume {i} of a long catalogue");
        session.insert_book(&mut book).unwrap();
    }
    tx.commit().unwrap();
    drop(session);
    db
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_query_cleanup(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_cleanup");

    group.bench_function("clean_fragment", |b| {
        b.iter(|| clean_fragment(black_box("Ursula K. Le Guin: The Left-Hand of Darkness -Earthsea")));
    });
    group.bench_function("build_query", |b| {
        b.iter(|| {
            FtsQuery::build(
                black_box(Some("brontë")),
                black_box(Some("wuthering heights")),
                black_box(Some("moor -film")),
            )
            .map(|q| q.to_string())
        });
    });

    group.finish();
}

fn bench_search_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_scaling");
    group.measurement_time(Duration::from_secs(10));

    for count in &[100, 1_000, 10_000] {
        let db = populated_store(*count);
        let session = db.session();

        group.bench_with_input(BenchmarkId::new("keywords", count), count, |b, _| {
            b.iter(|| session.search_books(None, None, black_box(Some("winter garden"))).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("author_scoped", count), count, |b, _| {
            b.iter(|| session.search_books(black_box(Some("bronte")), None, None).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("negated", count), count, |b, _| {
            b.iter(|| {
                session
                    .search_books(None, black_box(Some("empire")), black_box(Some("cycle -harbour")))
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_query_cleanup, bench_search_scaling);
criterion_main!(benches);
