//! End-to-end export tests: traversal, ordering and script rendering.

mod common;

use ahash::AHashMap;
use common::{Fixture, Recorded, RecordingRenderer, ReplayTarget};
use sql_subsetter::config::{SubsetConfig, WorkingTableScope};
use sql_subsetter::entity::{DuckDbStore, EntityGraph, Entry, RowId, Side};
use sql_subsetter::export::{
    ExportCoordinator, ExportTargets, FileScriptEnhancer, Phase, ScriptEnhancer, ScriptType,
    SqlRenderer,
};
use sql_subsetter::schema::Table;
use sql_subsetter::resolver::{DependencyResolver, ExportPlan};
use sql_subsetter::session::Value;
use sql_subsetter::traversal::TraversalEngine;
use sql_subsetter::{CancellationToken, SubsetError};
use std::fs;
use std::io;
use std::sync::{Arc, Mutex};

const COMPANY_DDL: &str = "
CREATE TABLE department (
    id INTEGER PRIMARY KEY,
    name VARCHAR(50),
    head_id INTEGER
);
CREATE TABLE employee (
    id INTEGER PRIMARY KEY,
    department_id INTEGER NOT NULL REFERENCES department(id),
    manager_id INTEGER REFERENCES employee(id),
    name VARCHAR(50)
);
CREATE TABLE badge (
    code VARCHAR(10),
    employee_id INTEGER REFERENCES employee(id)
);
ALTER TABLE department ADD CONSTRAINT fk_department_head FOREIGN KEY (head_id) REFERENCES employee(id);
";

const COMPANY_DATA: &str = "
INSERT INTO department VALUES (1, 'R&D', 12), (2, 'Sales', NULL), (3, 'Legal', 30);
INSERT INTO employee VALUES
    (10, 1, NULL, 'Ann'),
    (11, 1, 10, 'Bob'),
    (12, 1, 11, 'Cid'),
    (20, 2, NULL, 'Dee'),
    (30, 3, NULL, 'Eve');
INSERT INTO badge VALUES ('B-1', 10), ('B-2', 12), ('B-3', 30);
";

fn closed<'a>(fx: &'a Fixture, seed_table: &str, condition: &str) -> (EntityGraph<'a>, ExportPlan) {
    let entities = fx.entities();
    entities.add_seed_by_name(seed_table, condition).unwrap();
    TraversalEngine::new(&entities).run().unwrap();
    let plan = plan_for(fx, &entities);
    (entities, plan)
}

fn plan_for(fx: &Fixture, entities: &EntityGraph<'_>) -> ExportPlan {
    DependencyResolver::new(&fx.graph, &fx.config)
        .order(
            &entities.planned_tables().unwrap(),
            &entities.row_counts().unwrap(),
        )
        .unwrap()
}

#[test]
fn test_round_trip_leaves_no_violations_and_empty_target() {
    let config = SubsetConfig {
        threads: 4,
        entities_per_statement: 2,
        ..Default::default()
    };
    let fx = Fixture::with_config(COMPANY_DDL, COMPANY_DATA, config);
    let (entities, plan) = closed(&fx, "department", "T.id = 1");
    entities.mark_subset_for_deletion().unwrap();
    assert!(!plan.cycle_plan.is_empty());

    let insert = RecordingRenderer::new();
    let delete = RecordingRenderer::new();
    let targets = ExportTargets::new(&insert).with_delete(&delete);
    let summary = ExportCoordinator::new(&entities)
        .export(&plan, &targets)
        .unwrap();

    let subset_size = entities.total(Side::Insert).unwrap();
    assert_eq!(summary.rows_written, subset_size);
    assert_eq!(summary.rows_deleted, subset_size);

    let mut target = ReplayTarget::new(&fx.graph);
    target.replay(&insert.batches());
    assert!(target.violations.is_empty(), "{:?}", target.violations);
    assert_eq!(target.total_rows() as u64, subset_size);

    target.replay(&delete.batches());
    assert!(target.violations.is_empty(), "{:?}", target.violations);
    assert_eq!(target.total_rows(), 0);
}

#[test]
fn test_deferred_columns_are_nulled_then_patched() {
    let fx = Fixture::new(COMPANY_DDL, COMPANY_DATA);
    let (entities, plan) = closed(&fx, "department", "T.id = 1");

    let insert = RecordingRenderer::new();
    let summary = ExportCoordinator::new(&entities)
        .export(&plan, &ExportTargets::new(&insert))
        .unwrap();

    let batches = insert.batches();
    let dept_insert = batches
        .iter()
        .find(|(t, p, _)| t == "department" && *p == Phase::Insert)
        .unwrap();
    let head = dept_insert.2.columns.iter().position(|c| c == "head_id").unwrap();
    assert!(dept_insert.2.rows.iter().all(|r| r[head] == Value::Null));

    let patch = batches
        .iter()
        .find(|(t, p, _)| t == "department" && *p == Phase::DeferredUpdate)
        .unwrap();
    assert_eq!(patch.2.key_columns, vec!["id".to_string()]);
    assert_eq!(patch.2.rows, vec![vec![Value::Int(1), Value::Int(12)]]);
    assert!(summary.rows_deferred >= 1);

    // Patches come after every insert
    let events = insert.events();
    let last_insert = events
        .iter()
        .rposition(|e| matches!(e, Recorded::Batch(_, Phase::Insert, _)))
        .unwrap();
    let first_patch = events
        .iter()
        .position(|e| matches!(e, Recorded::Batch(_, Phase::DeferredUpdate, _)))
        .unwrap();
    assert!(last_insert < first_patch);
}

#[test]
fn test_no_delete_script_without_tagged_rows() {
    let fx = Fixture::new(COMPANY_DDL, COMPANY_DATA);
    let (entities, plan) = closed(&fx, "department", "T.id = 2");

    let insert = RecordingRenderer::new();
    let delete = RecordingRenderer::new();
    let targets = ExportTargets::new(&insert).with_delete(&delete);
    let summary = ExportCoordinator::new(&entities)
        .export(&plan, &targets)
        .unwrap();

    assert!(summary.rows_written > 0);
    assert_eq!(summary.rows_deleted, 0);
    assert!(delete.events().is_empty());
}

#[test]
fn test_rowid_table_rows_are_exported_whole() {
    let fx = Fixture::new(COMPANY_DDL, COMPANY_DATA);
    let (entities, plan) = closed(&fx, "employee", "T.id = 30");
    entities.mark_subset_for_deletion().unwrap();

    let insert = RecordingRenderer::new();
    let delete = RecordingRenderer::new();
    ExportCoordinator::new(&entities)
        .export(&plan, &ExportTargets::new(&insert).with_delete(&delete))
        .unwrap();

    let badge = insert
        .batches()
        .into_iter()
        .find(|(t, _, _)| t == "badge")
        .unwrap()
        .2;
    assert_eq!(badge.columns, vec!["code".to_string(), "employee_id".to_string()]);
    assert_eq!(badge.key_columns, badge.columns);
    assert_eq!(
        badge.rows,
        vec![vec![Value::Text("B-3".to_string()), Value::Int(30)]]
    );

    let badge_delete = delete
        .batches()
        .into_iter()
        .find(|(t, _, _)| t == "badge")
        .unwrap()
        .2;
    assert_eq!(badge_delete.key_columns, badge_delete.columns);
}

#[test]
fn test_write_failure_reports_table() {
    let config = SubsetConfig {
        threads: 2,
        ..Default::default()
    };
    let fx = Fixture::with_config(COMPANY_DDL, COMPANY_DATA, config);
    let (entities, plan) = closed(&fx, "department", "T.id = 1");

    let insert = RecordingRenderer::failing_on("employee");
    let err = ExportCoordinator::new(&entities)
        .export(&plan, &ExportTargets::new(&insert))
        .unwrap_err();

    match err {
        SubsetError::Write {
            table,
            row,
            message,
        } => {
            assert_eq!(table, "employee");
            assert!(row.is_some());
            assert!(message.contains("disk full"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!insert
        .events()
        .iter()
        .any(|e| matches!(e, Recorded::EndScript)));
}

#[test]
fn test_cancelled_export_stops_before_writing() {
    let fx = Fixture::new(COMPANY_DDL, COMPANY_DATA);
    let (entities, plan) = closed(&fx, "department", "T.id = 2");

    let token = CancellationToken::new();
    token.cancel();
    let insert = RecordingRenderer::new();
    let err = ExportCoordinator::new(&entities)
        .with_cancellation(token)
        .export(&plan, &ExportTargets::new(&insert))
        .unwrap_err();

    assert_eq!(err.code(), "CANCELLED");
    assert!(insert.batches().is_empty());
}

#[test]
fn test_upsert_and_transactional_export() {
    let config = SubsetConfig {
        threads: 4,
        upsert_only: true,
        transactional: true,
        ..Default::default()
    };
    let fx = Fixture::with_config(COMPANY_DDL, COMPANY_DATA, config);
    let (entities, plan) = closed(&fx, "department", "T.id = 2");

    let insert = RecordingRenderer::new();
    let summary = ExportCoordinator::new(&entities)
        .export(&plan, &ExportTargets::new(&insert))
        .unwrap();

    assert_eq!(summary.rows_written, 2);
    assert!(insert
        .batches()
        .iter()
        .all(|(_, p, _)| *p == Phase::Upsert));
}

#[test]
fn test_progress_and_table_stats() {
    let config = SubsetConfig {
        entities_per_statement: 1,
        ..Default::default()
    };
    let fx = Fixture::with_config(COMPANY_DDL, COMPANY_DATA, config);
    let (entities, plan) = closed(&fx, "department", "T.id = 2");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let insert = RecordingRenderer::new();
    let summary = ExportCoordinator::new(&entities)
        .with_progress(move |p| sink.lock().unwrap().push((p.table.clone(), p.rows)))
        .export(&plan, &ExportTargets::new(&insert))
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len() as u64, summary.rows_written);
    let employee = summary
        .table_stats
        .iter()
        .find(|s| s.table == "employee")
        .unwrap();
    assert_eq!(employee.rows, 1);
    assert_eq!(employee.batches, 1);
    assert_eq!(employee.phase, "insert");
}

#[test]
fn test_sql_script_with_enhancers() {
    let dir = tempfile::tempdir().unwrap();
    let prolog = dir.path().join("prolog").join("INSERT");
    let epilog = dir.path().join("epilog").join("INSERT");
    fs::create_dir_all(&prolog).unwrap();
    fs::create_dir_all(&epilog).unwrap();
    fs::write(prolog.join("PROLOG.sql"), "-- custom prolog").unwrap();
    fs::write(prolog.join("employee.sql"), "-- before employee").unwrap();
    fs::write(epilog.join("EPILOG.sql"), "-- custom epilog").unwrap();

    let config = SubsetConfig {
        dialect: "postgres".parse().unwrap(),
        ..Default::default()
    };
    let fx = Fixture::with_config(COMPANY_DDL, COMPANY_DATA, config);
    let (entities, plan) = closed(&fx, "department", "T.id = 2");

    let renderer = SqlRenderer::new(Vec::new(), &fx.config, ScriptType::Insert);
    let enhancer = FileScriptEnhancer::new(dir.path());
    {
        let targets = ExportTargets::new(&renderer).with_enhancer(&enhancer);
        ExportCoordinator::new(&entities)
            .export(&plan, &targets)
            .unwrap();
    }
    let script = String::from_utf8(renderer.into_inner().unwrap()).unwrap();

    let prolog_at = script.find("-- custom prolog").unwrap();
    let before_employee = script.find("-- before employee").unwrap();
    let department = script.find("INSERT INTO \"department\"").unwrap();
    let employee = script.find("INSERT INTO \"employee\"").unwrap();
    let epilog_at = script.find("-- custom epilog").unwrap();
    assert!(prolog_at < department);
    assert!(department < before_employee);
    assert!(before_employee < employee);
    assert!(employee < epilog_at);
    assert!(script.contains("'Sales'"));
}

#[test]
fn test_export_from_session_local_working_table() {
    let config = SubsetConfig {
        scope: WorkingTableScope::SessionLocal,
        threads: 3,
        ..Default::default()
    };
    let fx = Fixture::with_config(COMPANY_DDL, COMPANY_DATA, config);
    let store = DuckDbStore::open(fx.session.connection(), &fx.config).unwrap();
    let entities = EntityGraph::new(&fx.graph, &fx.session, Box::new(store), &fx.config);
    entities.add_seed_by_name("department", "T.id = 1").unwrap();
    TraversalEngine::new(&entities).run().unwrap();
    let plan = plan_for(&fx, &entities);

    let insert = RecordingRenderer::new();
    let summary = ExportCoordinator::new(&entities)
        .export(&plan, &ExportTargets::new(&insert))
        .unwrap();
    assert_eq!(summary.rows_written, entities.total(Side::Insert).unwrap());

    let mut target = ReplayTarget::new(&fx.graph);
    target.replay(&insert.batches());
    assert!(target.violations.is_empty(), "{:?}", target.violations);
}

#[test]
fn test_no_sorting_plan_exports_everything_in_one_wave() {
    let config = SubsetConfig {
        no_sorting: true,
        ..Default::default()
    };
    let fx = Fixture::with_config(COMPANY_DDL, COMPANY_DATA, config);
    let (entities, plan) = closed(&fx, "department", "T.id = 1");
    assert_eq!(plan.insert_waves.len(), 1);

    let insert = RecordingRenderer::new();
    let summary = ExportCoordinator::new(&entities)
        .export(&plan, &ExportTargets::new(&insert))
        .unwrap();
    let counts: AHashMap<_, _> = entities.row_counts().unwrap();
    assert_eq!(summary.rows_written, counts.values().sum::<u64>());
}

const LIBRARY_DDL: &str = "
CREATE TABLE author (id INTEGER PRIMARY KEY, name VARCHAR(50));
CREATE TABLE book (
    id INTEGER PRIMARY KEY,
    author_id INTEGER NOT NULL REFERENCES author(id),
    title VARCHAR(100)
);
CREATE TABLE tag (id INTEGER PRIMARY KEY, label VARCHAR(20));
";

const LIBRARY_DATA: &str = "
INSERT INTO author VALUES (1, 'Le Guin'), (2, 'Banks');
INSERT INTO book VALUES (100, 1, 'The Dispossessed'), (101, 2, 'Excession');
INSERT INTO tag VALUES (7, 'classic'), (8, 'space');
";

fn tag_entry(fx: &Fixture, id: i64) -> Entry {
    Entry {
        table: fx.table("tag").id,
        row: RowId::int(id),
        birthday: 0,
        parent: None,
        association: None,
    }
}

#[test]
fn test_delete_only_tables_are_exported() {
    let fx = Fixture::new(LIBRARY_DDL, LIBRARY_DATA);
    let (entities, _) = closed(&fx, "author", "T.id = 1");
    entities.mark_subset_for_deletion().unwrap();
    entities.mark_for_deletion(&[tag_entry(&fx, 7)]).unwrap();
    let plan = plan_for(&fx, &entities);

    let insert = RecordingRenderer::new();
    let delete = RecordingRenderer::new();
    let summary = ExportCoordinator::new(&entities)
        .export(&plan, &ExportTargets::new(&insert).with_delete(&delete))
        .unwrap();

    assert_eq!(summary.rows_written, 2);
    assert_eq!(summary.rows_deleted, 3);
    assert!(insert.batches().iter().all(|(t, _, _)| t != "tag"));
    let deleted_tags: Vec<_> = delete
        .batches()
        .into_iter()
        .filter(|(t, p, _)| t == "tag" && *p == Phase::Delete)
        .collect();
    assert_eq!(deleted_tags.len(), 1);
    assert_eq!(deleted_tags[0].2.rows.len(), 1);
}

#[test]
fn test_plan_missing_a_deleted_table_is_an_error() {
    let fx = Fixture::new(LIBRARY_DDL, LIBRARY_DATA);
    let (entities, _) = closed(&fx, "author", "T.id = 1");
    entities.mark_for_deletion(&[tag_entry(&fx, 8)]).unwrap();
    let insert_only = DependencyResolver::new(&fx.graph, &fx.config)
        .order(
            &entities.touched_tables().unwrap(),
            &entities.row_counts().unwrap(),
        )
        .unwrap();

    let insert = RecordingRenderer::new();
    let delete = RecordingRenderer::new();
    let err = ExportCoordinator::new(&entities)
        .export(&insert_only, &ExportTargets::new(&insert).with_delete(&delete))
        .unwrap_err();

    match err {
        SubsetError::Write { table, .. } => assert_eq!(table, "tag"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(insert.events().is_empty());
    assert!(delete.events().is_empty());
}

#[test]
fn test_write_failure_wins_over_stopped_workers() {
    let config = SubsetConfig {
        threads: 2,
        entities_per_statement: 1,
        ..Default::default()
    };
    let data = format!(
        "{}\nINSERT INTO tag SELECT i, 'generated' FROM range(100, 400) t(i);",
        LIBRARY_DATA
    );
    let fx = Fixture::with_config(LIBRARY_DDL, &data, config);
    let entities = fx.entities();
    entities.add_seed_by_name("author", "1=1").unwrap();
    entities.add_seed_by_name("tag", "1=1").unwrap();
    let plan = plan_for(&fx, &entities);
    let author = fx.table("author").id;
    let tag = fx.table("tag").id;
    assert!(plan
        .insert_waves
        .iter()
        .any(|w| w.contains(&author) && w.contains(&tag)));

    for _ in 0..10 {
        let insert = RecordingRenderer::failing_on("author");
        let err = ExportCoordinator::new(&entities)
            .export(&plan, &ExportTargets::new(&insert))
            .unwrap_err();
        match err {
            SubsetError::Write { table, message, .. } => {
                assert_eq!(table, "author");
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}

/// Enhancer whose script-level epilog cannot be read
struct BrokenEpilog;

impl ScriptEnhancer for BrokenEpilog {
    fn prolog(&self, _script: ScriptType, _table: Option<&Table>) -> io::Result<Option<String>> {
        Ok(None)
    }

    fn epilog(&self, _script: ScriptType, table: Option<&Table>) -> io::Result<Option<String>> {
        match table {
            None => Err(io::Error::other("permission denied")),
            Some(_) => Ok(None),
        }
    }
}

#[test]
fn test_script_level_failure_names_the_script() {
    let fx = Fixture::new(LIBRARY_DDL, LIBRARY_DATA);
    let (entities, plan) = closed(&fx, "author", "T.id = 2");

    let insert = RecordingRenderer::new();
    let enhancer = BrokenEpilog;
    let err = ExportCoordinator::new(&entities)
        .export(&plan, &ExportTargets::new(&insert).with_enhancer(&enhancer))
        .unwrap_err();

    match err {
        SubsetError::Write { table, row, message } => {
            assert_eq!(table, "<INSERT script>");
            assert!(row.is_none());
            assert!(message.contains("permission denied"));
        }
        other => panic!("unexpected error: {}", other),
    }
}
