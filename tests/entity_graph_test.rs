//! Integration tests for the entity graph over both working stores.

mod common;

use common::Fixture;
use sql_subsetter::config::{AssociationSettings, SubsetConfig};
use sql_subsetter::entity::{DuckDbStore, EntityGraph, Entry, MemoryStore, RowId, Side, WorkingStore};

const DDL: &str = "
CREATE TABLE author (id INTEGER PRIMARY KEY, name VARCHAR(50), active BOOLEAN);
CREATE TABLE book (
    id INTEGER PRIMARY KEY,
    author_id INTEGER NOT NULL REFERENCES author(id),
    title VARCHAR(100)
);
";

const DATA: &str = "
INSERT INTO author VALUES (1, 'Le Guin', TRUE), (2, 'Banks', FALSE);
INSERT INTO book VALUES
    (100, 1, 'The Dispossessed'),
    (101, 1, 'The Lathe of Heaven'),
    (102, 2, 'Excession'),
    (103, 1, 'Always Coming Home');
";

fn stores(fx: &Fixture) -> Vec<(&'static str, Box<dyn WorkingStore>)> {
    vec![
        ("memory", Box::new(MemoryStore::new())),
        (
            "duckdb-global",
            Box::new(DuckDbStore::global(fx.session.connection(), None).unwrap()),
        ),
        (
            "duckdb-local",
            Box::new(DuckDbStore::local_database().unwrap()),
        ),
    ]
}

fn seeds(entities: &EntityGraph<'_>, table: &str) -> Vec<Entry> {
    let id = entities.graph().table_by_name(table).unwrap().id;
    entities
        .entries_of(id, Side::Insert)
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn test_expand_is_idempotent() {
    let fx = Fixture::new(DDL, DATA);
    for (name, store) in stores(&fx) {
        let entities = EntityGraph::new(&fx.graph, &fx.session, store, &fx.config);
        entities.add_seed_by_name("author", "T.id = 1").unwrap();
        let sources = seeds(&entities, "author");
        let inverse = fx.graph.association_by_name("inverse-fk_book_author_author_id").unwrap();

        let first = entities.expand(inverse.id, &sources, 1).unwrap();
        let second = entities.expand(inverse.id, &sources, 1).unwrap();
        assert_eq!(first, 3, "{}", name);
        assert_eq!(second, 0, "{}", name);
        assert_eq!(entities.total(Side::Insert).unwrap(), 4, "{}", name);
    }
}

#[test]
fn test_expanded_entries_record_origin() {
    let fx = Fixture::new(DDL, DATA);
    let entities = fx.entities();
    entities.add_seed_by_name("book", "T.id = 102").unwrap();
    let sources = seeds(&entities, "book");
    let forward = fx.graph.association_by_name("fk_book_author_author_id").unwrap();

    assert_eq!(entities.expand(forward.id, &sources, 1).unwrap(), 1);

    let author = fx.table("author").id;
    let book = fx.table("book").id;
    let entries: Vec<Entry> = entities
        .entries_of(author, Side::Insert)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].row, RowId::int(2));
    assert_eq!(entries[0].birthday, 1);
    assert_eq!(entries[0].parent, Some((book, RowId::int(102))));
    assert_eq!(entries[0].association, Some(forward.id));
    assert!(!entries[0].is_seed());
}

#[test]
fn test_restriction_filters_destination_rows() {
    let config = SubsetConfig {
        associations: [(
            "inverse-fk_book_author_author_id".to_string(),
            AssociationSettings {
                restriction: Some("B.title LIKE 'The %'".to_string()),
                disabled: false,
            },
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    };
    let fx = Fixture::with_config(DDL, DATA, config);
    let entities = fx.entities();
    entities.add_seed_by_name("author", "T.active").unwrap();
    let sources = seeds(&entities, "author");
    let inverse = fx.graph.association_by_name("inverse-fk_book_author_author_id").unwrap();

    assert_eq!(entities.expand(inverse.id, &sources, 1).unwrap(), 2);
    let book = fx.table("book").id;
    assert!(!entities.contains(book, &RowId::int(103), Side::Insert).unwrap());
}

#[test]
fn test_disabled_association_expands_nothing() {
    let config = SubsetConfig {
        associations: [(
            "inverse-fk_book_author_author_id".to_string(),
            AssociationSettings {
                restriction: None,
                disabled: true,
            },
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    };
    let fx = Fixture::with_config(DDL, DATA, config);
    let entities = fx.entities();
    entities.add_seed_by_name("author", "T.id = 1").unwrap();
    let sources = seeds(&entities, "author");
    let inverse = fx.graph.association_by_name("inverse-fk_book_author_author_id").unwrap();

    assert_eq!(entities.expand(inverse.id, &sources, 1).unwrap(), 0);
}

#[test]
fn test_seed_errors_are_query_errors() {
    let fx = Fixture::new(DDL, DATA);
    let entities = fx.entities();

    let unknown = entities.add_seed_by_name("publisher", "1=1").unwrap_err();
    assert_eq!(unknown.code(), "QUERY");

    let malformed = entities.add_seed_by_name("book", "T.id ==== 1").unwrap_err();
    assert_eq!(malformed.code(), "QUERY");
    assert!(malformed.to_string().contains("book"));
}

#[test]
fn test_seeding_twice_adds_nothing() {
    let fx = Fixture::new(DDL, DATA);
    let entities = fx.entities();
    assert_eq!(entities.add_seed_by_name("book", "T.author_id = 1").unwrap(), 3);
    assert_eq!(entities.add_seed_by_name("book", "T.id >= 100").unwrap(), 1);
    assert_eq!(entities.total(Side::Insert).unwrap(), 4);
}

#[test]
fn test_cursor_pages_and_restarts() {
    let fx = Fixture::new(DDL, DATA);
    let entities = fx.entities();
    entities.add_seed_by_name("book", "1=1").unwrap();
    let book = fx.table("book").id;

    let mut cursor = entities.entries_of(book, Side::Insert).with_page_size(3);
    let first = cursor.next_page().unwrap();
    let second = cursor.next_page().unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 1);
    assert!(cursor.next_page().unwrap().is_empty());

    cursor.restart();
    assert_eq!(cursor.next_page().unwrap(), first);
}

#[test]
fn test_deletion_side_is_separate() {
    let fx = Fixture::new(DDL, DATA);
    for (name, store) in stores(&fx) {
        let entities = EntityGraph::new(&fx.graph, &fx.session, store, &fx.config);
        entities.add_seed_by_name("book", "T.author_id = 1").unwrap();
        let book = fx.table("book").id;

        let first_two: Vec<Entry> = seeds(&entities, "book").into_iter().take(2).collect();
        assert_eq!(entities.mark_for_deletion(&first_two).unwrap(), 2, "{}", name);
        assert_eq!(entities.count(book, Side::Delete).unwrap(), 2, "{}", name);

        assert_eq!(entities.mark_subset_for_deletion().unwrap(), 1, "{}", name);
        assert_eq!(entities.total(Side::Delete).unwrap(), 3, "{}", name);
        assert_eq!(entities.touched_tables_on(Side::Delete).unwrap(), vec![book]);

        entities.discard().unwrap();
        assert_eq!(entities.total(Side::Insert).unwrap(), 0, "{}", name);
        assert_eq!(entities.total(Side::Delete).unwrap(), 0, "{}", name);
    }
}

#[test]
fn test_row_counts_per_table() {
    let fx = Fixture::new(DDL, DATA);
    let entities = fx.entities();
    entities.add_seed_by_name("book", "T.author_id = 1").unwrap();
    entities.add_seed_by_name("author", "T.id = 2").unwrap();

    let counts = entities.row_counts().unwrap();
    assert_eq!(counts.get(&fx.table("book").id), Some(&3));
    assert_eq!(counts.get(&fx.table("author").id), Some(&1));
}

#[test]
fn test_same_key_in_two_tables_is_marked_twice() {
    let fx = Fixture::new(DDL, DATA);
    for (name, store) in stores(&fx) {
        let entities = EntityGraph::new(&fx.graph, &fx.session, store, &fx.config);
        let author = fx.table("author").id;
        let book = fx.table("book").id;
        let entry = |table| Entry {
            table,
            row: RowId::int(1),
            birthday: 0,
            parent: None,
            association: None,
        };

        assert_eq!(
            entities.mark_for_deletion(&[entry(author), entry(book)]).unwrap(),
            2,
            "{}",
            name
        );
        assert_eq!(entities.count(author, Side::Delete).unwrap(), 1, "{}", name);
        assert_eq!(entities.count(book, Side::Delete).unwrap(), 1, "{}", name);
    }
}

#[test]
fn test_planned_tables_cover_both_sides() {
    let fx = Fixture::new(DDL, DATA);
    let entities = fx.entities();
    let author = fx.table("author").id;
    let book = fx.table("book").id;
    entities.add_seed_by_name("author", "T.id = 2").unwrap();
    entities
        .mark_for_deletion(&[
            Entry {
                table: book,
                row: RowId::int(100),
                birthday: 0,
                parent: None,
                association: None,
            },
            Entry {
                table: book,
                row: RowId::int(101),
                birthday: 0,
                parent: None,
                association: None,
            },
        ])
        .unwrap();

    assert_eq!(entities.touched_tables().unwrap(), vec![author]);
    assert_eq!(entities.planned_tables().unwrap(), vec![author, book]);
    let counts = entities.row_counts().unwrap();
    assert_eq!(counts.get(&author), Some(&1));
    assert_eq!(counts.get(&book), Some(&2));
}

#[test]
fn test_failed_join_names_association_and_round() {
    let fx = Fixture::new(DDL, DATA);
    let entities = fx.entities();
    entities.add_seed_by_name("author", "T.id = 1").unwrap();
    let sources = seeds(&entities, "author");
    fx.session.execute_batch("DROP TABLE book").unwrap();
    let inverse = fx.graph.association_by_name("inverse-fk_book_author_author_id").unwrap();

    let err = entities.expand(inverse.id, &sources, 3).unwrap_err();
    assert_eq!(err.code(), "QUERY");
    let msg = err.to_string();
    assert!(msg.contains("inverse-fk_book_author_author_id"), "{}", msg);
    assert!(msg.contains("round 3"), "{}", msg);
    assert!(msg.contains("author_id"), "{}", msg);
}
