//! Integration tests for the catalogue store on disk.
//!
//! These exercise the public API end to end: identity resolution, ordered
//! associations, merges, the search index, explicit transactions and
//! concurrent sessions sharing one store.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use shelfstore::{Author, Book, Bookshelf, CatalogueDb, Error, Series, StoreConfig, TocEntry};
use std::thread;
use tempfile::TempDir;

fn open(dir: &TempDir) -> CatalogueDb {
    let config = StoreConfig::default().with_database_path(dir.path().join("catalogue.db"));
    CatalogueDb::open(config).expect("open store")
}

fn sample_book() -> Book {
    Book::new("The Left Hand of Darkness")
        .with_author(Author::new("Le Guin", "Ursula K."))
        .with_series(Series::new("Hainish Cycle", "4"))
        .with_bookshelf(Bookshelf::new("Favourites"))
        .with_toc_entry(TocEntry::new(Author::new("Le Guin", "Ursula K."), "Winter's King"))
}

#[test]
fn test_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let (id, uuid) = {
        let db = open(&dir);
        let mut book = sample_book();
        db.session().insert_book(&mut book).unwrap();
        (book.id, book.uuid)
    };

    let db = open(&dir);
    let session = db.session();
    let book = session.get_book_by_uuid(&uuid).unwrap().expect("book persisted");
    assert_eq!(book.id, id);
    assert_eq!(book.authors.len(), 1);
    assert_eq!(book.series[0].number, "4");
    assert_eq!(book.bookshelves[0].name, "Favourites");
    assert_eq!(book.toc[0].title, "Winter's King");
    assert_eq!(session.search_books(Some("guin"), None, None).unwrap(), vec![id]);
}

#[test]
fn test_identity_ignores_case_and_accents() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let session = db.session();

    let mut first = Book::new("Germinal").with_author(Author::new("Zola", "Émile"));
    session.insert_book(&mut first).unwrap();
    let mut second = Book::new("Nana").with_author(Author::new("ZOLA", "emile"));
    session.insert_book(&mut second).unwrap();

    assert_eq!(first.authors[0].id, second.authors[0].id);
    assert_eq!(session.authors().unwrap().len(), 1);
    // Reads return the first stored spelling.
    let stored = session.get_book(second.id).unwrap().unwrap();
    assert_eq!(stored.authors[0].given_names, "Émile");

    let mut probe = Author::new("zola", "EMILE");
    assert_eq!(session.resolve_author(&mut probe).unwrap(), Some(first.authors[0].id));
}

#[test]
fn test_author_merge_keeps_contiguous_positions() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let session = db.session();

    let pratchett = Author::new("Pratchett", "Terry");
    let gaiman = Author::new("Gaiman", "Neil");
    let alias = Author::new("Gaiman", "N.");

    let mut omens = Book::new("Good Omens")
        .with_author(pratchett.clone())
        .with_author(alias.clone())
        .with_author(gaiman.clone());
    session.insert_book(&mut omens).unwrap();
    let mut sandman = Book::new("Sandman").with_author(alias.clone());
    session.insert_book(&mut sandman).unwrap();

    let alias_id = omens.authors[1].id;
    let mut target = gaiman.clone();
    session.global_replace_author(&alias, &mut target).unwrap();

    let names: Vec<String> = session
        .book_authors(omens.id)
        .unwrap()
        .iter()
        .map(Author::given_first)
        .collect();
    assert_eq!(names, vec!["Terry Pratchett", "Neil Gaiman"]);
    assert_eq!(
        session.book_authors(sandman.id).unwrap()[0].given_first(),
        "Neil Gaiman"
    );
    assert!(session.get_author(alias_id).unwrap().is_none());
    assert_eq!(
        session.search_books(Some("neil"), None, None).unwrap(),
        vec![omens.id, sandman.id]
    );
}

#[test]
fn test_search_scopes() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let session = db.session();

    let mut dune = Book::new("Dune").with_author(Author::new("Herbert", "Frank"));
    session.insert_book(&mut dune).unwrap();
    let mut about = Book::new("Frank Herbert: A Life");
    session.insert_book(&mut about).unwrap();

    assert_eq!(session.search_books(Some("herbert"), None, None).unwrap(), vec![dune.id]);
    assert_eq!(session.search_books(None, Some("herbert"), None).unwrap(), vec![about.id]);
    assert_eq!(
        session.search_books(None, None, Some("herbert")).unwrap(),
        vec![dune.id, about.id]
    );
    assert_eq!(
        session.search_books(None, None, Some("herbert -life")).unwrap(),
        vec![dune.id]
    );
}

#[test]
fn test_explicit_transaction_rolls_back_everything() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let session = db.session();

    let tx = session.begin_write().unwrap();
    session.insert_book(&mut sample_book()).unwrap();
    session.insert_book(&mut Book::new("Second")).unwrap();
    assert!(matches!(session.begin_write(), Err(Error::Usage(_))));
    tx.rollback().unwrap();

    assert_eq!(session.book_count().unwrap(), 0);
    assert!(session.authors().unwrap().is_empty());
    assert!(session.search_books(None, None, Some("darkness")).unwrap().is_empty());
}

#[test]
fn test_purge_after_delete() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let session = db.session();

    let mut book = sample_book();
    session.insert_book(&mut book).unwrap();
    assert!(session.delete_book(book.id).unwrap());

    let counts = session.purge().unwrap();
    assert_eq!(counts.authors, 1);
    assert_eq!(counts.series, 1);
    assert!(session.authors().unwrap().is_empty());
}

#[test]
fn test_concurrent_sessions() {
    const WRITERS: usize = 4;
    const BOOKS_PER_WRITER: usize = 20;

    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let db = &db;
            scope.spawn(move || {
                let session = db.session();
                for n in 0..BOOKS_PER_WRITER {
                    let mut book = Book::new(format!("Volume {writer}-{n}"))
                        .with_author(Author::new("Shared", "Author"))
                        .with_author(Author::new(format!("Writer{writer}"), "Solo"));
                    session.insert_book(&mut book).unwrap();
                }
            });
        }
        for _ in 0..2 {
            let db = &db;
            scope.spawn(move || {
                let session = db.session();
                let mut last = 0;
                for _ in 0..50 {
                    let count = session.book_count().unwrap();
                    assert!(count >= last, "book count went backwards");
                    last = count;
                    session.search_books(Some("shared"), None, None).unwrap();
                }
            });
        }
    });

    let session = db.session();
    let total = i64::try_from(WRITERS * BOOKS_PER_WRITER).unwrap();
    assert_eq!(session.book_count().unwrap(), total);
    assert_eq!(session.authors().unwrap().len(), WRITERS + 1);
    assert_eq!(
        session.search_books(Some("shared"), None, None).unwrap().len(),
        WRITERS * BOOKS_PER_WRITER
    );
}

#[test]
fn test_merges_are_atomic_to_readers() {
    const BOOKS: usize = 6;
    const ROUNDS: usize = 15;

    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    {
        let session = db.session();
        for n in 0..BOOKS {
            let mut book = Book::new(format!("Pseudonymous {n}"))
                .with_author(Author::new("Alias", "Pen"))
                .with_toc_entry(TocEntry::new(Author::new("Alias", "Pen"), format!("Piece {n}")));
            session.insert_book(&mut book).unwrap();
        }
    }

    thread::scope(|scope| {
        let db = &db;
        scope.spawn(move || {
            let session = db.session();
            let alias = Author::new("Alias", "Pen");
            let target = Author::new("Target", "Pen");
            for _ in 0..ROUNDS {
                session.global_replace_author(&alias, &mut target.clone()).unwrap();
                session.purge().unwrap();
                session.global_replace_author(&target, &mut alias.clone()).unwrap();
                session.purge().unwrap();
            }
        });
        scope.spawn(move || {
            let session = db.session();
            for _ in 0..40 {
                let tx = session.begin_read().unwrap();
                let alias = session.search_books(Some("alias"), None, None).unwrap().len();
                let target = session.search_books(Some("target"), None, None).unwrap().len();
                let authors = session.authors().unwrap();
                tx.commit().unwrap();

                assert!(
                    (alias, target) == (BOOKS, 0) || (alias, target) == (0, BOOKS),
                    "reader saw a half-applied merge: alias={alias} target={target}"
                );
                assert_eq!(authors.len(), 1, "reader saw both authors at once");
            }
        });
    });

    let session = db.session();
    assert_eq!(session.search_books(Some("alias"), None, None).unwrap().len(), BOOKS);
    assert_eq!(session.authors().unwrap().len(), 1);
}

#[test]
fn test_writes_inside_concurrent_read_transactions_fail_fast() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let barrier = std::sync::Barrier::new(2);
    let (store, barrier) = (&db, &barrier);

    thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(move |n| {
                scope.spawn(move || {
                    let db = store;
                    let session = db.session();
                    let tx = session.begin_read().unwrap();
                    barrier.wait();
                    let result = session.insert_book(&mut Book::new(format!("Blocked {n}")));
                    tx.commit().unwrap();
                    result
                })
            })
            .collect();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err, Error::Usage(_)), "unexpected error: {err:?}");
        }
    });

    let session = db.session();
    assert_eq!(session.book_count().unwrap(), 0);
    assert!(!session.in_transaction());
    session.insert_book(&mut Book::new("Afterwards")).unwrap();
    assert_eq!(session.book_count().unwrap(), 1);
}

#[test]
fn test_non_latin_search() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let session = db.session();
    let mut tolstoy = Book::new("Война и мир").with_author(Author::new("Толстой", "Лев"));
    session.insert_book(&mut tolstoy).unwrap();
    let mut murakami = Book::new("ノルウェイの森").with_author(Author::new("村上", "春樹"));
    session.insert_book(&mut murakami).unwrap();
    let mut hugo = Book::new("Les Misérables").with_author(Author::new("Hugo", "Victor"));
    session.insert_book(&mut hugo).unwrap();

    assert_eq!(session.search_books(None, Some("Война"), None).unwrap(), vec![tolstoy.id]);
    assert_eq!(session.search_books(Some("Толстой"), None, None).unwrap(), vec![tolstoy.id]);
    assert_eq!(session.search_books(None, None, Some("森")).unwrap(), vec![murakami.id]);
    assert_eq!(session.search_books(None, Some("miserables"), None).unwrap(), vec![hugo.id]);

    // Same results from a rebuilt index.
    assert_eq!(session.rebuild_search_index().unwrap(), 3);
    assert_eq!(session.search_books(None, Some("война"), None).unwrap(), vec![tolstoy.id]);
    assert_eq!(session.search_books(None, None, Some("ノルウェイ")).unwrap(), vec![murakami.id]);
}
