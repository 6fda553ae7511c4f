#![allow(missing_docs, unused_results)]

use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use chronicle_core::EntityKey;
use chronicle_settings::{DatabaseSettings, VersioningSettings, VersioningStrategy};
use chronicle_versioning::sqlite::repositories::{AuditRepo, ChangesRepo};
use chronicle_versioning::{
    EntityDef, MetaMap, Result, UnitOfWork, UserTable, VersionStore, VersioningError,
    VersioningManager, VersioningManagerBuilder, VersioningPlugin,
};
use rusqlite::Connection;
use rusqlite::types::Value;

const PRIMARY_TABLES: &str = "
    CREATE TABLE article (id INTEGER PRIMARY KEY, name TEXT, body TEXT, views INTEGER DEFAULT 0);
    CREATE TABLE tag (id INTEGER PRIMARY KEY, label TEXT);
";

fn builder(strategy: VersioningStrategy) -> VersioningManagerBuilder {
    let settings = VersioningSettings {
        strategy,
        ..VersioningSettings::default()
    };
    VersioningManager::builder(settings)
        .with_default_plugins()
        .entity(
            EntityDef::new("Article", "article")
                .key("id", "INTEGER")
                .column("name", "TEXT")
                .column("body", "TEXT"),
        )
        .entity(EntityDef::new("Tag", "tag").key("id", "INTEGER").column("label", "TEXT"))
}

fn open(builder: VersioningManagerBuilder) -> VersionStore {
    let store = VersionStore::in_memory(Arc::new(builder.build().unwrap())).unwrap();
    store.connection().unwrap().execute_batch(PRIMARY_TABLES).unwrap();
    store.create_schema().unwrap();
    store
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn count(store: &VersionStore, table: &str) -> i64 {
    store
        .connection()
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

// ── Net change detection ────────────────────────────────────────────────

#[test]
fn unchanged_values_produce_no_audit() {
    let store = open(builder(VersioningStrategy::Validity));
    let (key, _) = store
        .transact(|tx| tx.insert("Article", &[("name", text("a")), ("body", text("x"))]))
        .unwrap();

    let (_, audit) = store
        .transact(|tx| {
            tx.update("Article", &key, &[("name", text("b"))])?;
            tx.update("Article", &key, &[("name", text("a"))])
        })
        .unwrap();

    assert!(audit.is_none());
    assert_eq!(count(&store, "audit"), 1);
    assert_eq!(count(&store, "article_version"), 1);
}

#[test]
fn insert_then_delete_is_no_change() {
    let store = open(builder(VersioningStrategy::Validity));
    let (_, audit) = store
        .transact(|tx| {
            let key = tx.insert("Article", &[("name", text("tmp"))])?;
            tx.delete("Article", &key)
        })
        .unwrap();
    assert!(audit.is_none());
    assert_eq!(count(&store, "audit"), 0);
    assert_eq!(count(&store, "audit_changes"), 0);
}

#[test]
fn untracked_column_is_ignored() {
    let store = open(builder(VersioningStrategy::Validity));
    let (key, _) = store
        .transact(|tx| tx.insert("Article", &[("name", text("a"))]))
        .unwrap();
    let (_, audit) = store
        .transact(|tx| tx.update("Article", &key, &[("views", Value::Integer(5))]))
        .unwrap();
    assert!(audit.is_none());
}

// ── Changes tracker ─────────────────────────────────────────────────────

#[test]
fn many_entities_one_changes_row_per_type() {
    let store = open(builder(VersioningStrategy::Validity));
    let (_, audit) = store
        .transact(|tx| {
            for i in 0..3 {
                tx.insert("Article", &[("name", text(&format!("a{i}")))])?;
            }
            tx.insert("Tag", &[("label", text("rust"))])?;
            tx.insert("Tag", &[("label", text("sql"))])
        })
        .unwrap();
    let audit = audit.unwrap();

    let conn = store.connection().unwrap();
    let rows = ChangesRepo::list(&conn, "audit_changes").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(store.changes(audit.id).unwrap(), vec!["Article", "Tag"]);
}

#[test]
fn changes_queries() {
    let store = open(builder(VersioningStrategy::Validity));
    let (_, a1) = store
        .transact(|tx| tx.insert("Article", &[("name", text("a"))]))
        .unwrap();
    let (_, a2) = store
        .transact(|tx| tx.insert("Tag", &[("label", text("t"))]))
        .unwrap();
    let (a1, a2) = (a1.unwrap().id, a2.unwrap().id);

    assert_eq!(store.audits_touching("Article").unwrap(), vec![a1]);
    assert_eq!(store.audits_not_touching(&["Article"]).unwrap(), vec![a2]);
    assert!(store.audits_not_touching(&["Article", "Tag"]).unwrap().is_empty());
}

// ── Meta store ──────────────────────────────────────────────────────────

#[test]
fn meta_round_trip_and_remove() {
    let store = open(builder(VersioningStrategy::Validity));
    let (_, audit) = store
        .transact(|tx| {
            let meta = tx.meta()?;
            meta.insert("source", "import")?;
            meta.insert("ticket", "OPS-1")?;
            tx.insert("Article", &[("name", text("a"))])
        })
        .unwrap();
    let id = audit.unwrap().id;

    let reloaded = store.meta(id).unwrap();
    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded.get("ticket").map(String::as_str), Some("OPS-1"));

    {
        let conn = store.connection().unwrap();
        let meta = MetaMap::new(&conn, "audit_meta", id);
        assert_eq!(meta.remove("source").unwrap().as_deref(), Some("import"));
    }
    let reloaded = store.meta(id).unwrap();
    assert!(!reloaded.contains_key("source"));
    assert_eq!(reloaded.len(), 1);
}

#[test]
fn meta_requires_plugin() {
    let manager = VersioningManager::builder(VersioningSettings::default())
        .entity(EntityDef::new("Article", "article").key("id", "INTEGER").column("name", "TEXT"))
        .build()
        .unwrap();
    let store = VersionStore::in_memory(Arc::new(manager)).unwrap();
    store.connection().unwrap().execute_batch(PRIMARY_TABLES).unwrap();
    store.create_schema().unwrap();

    let err = store.transact(|tx| tx.meta().map(|_| ())).unwrap_err();
    assert_matches!(err, VersioningError::PluginNotRegistered(name) if name == "audit_meta");
    assert_matches!(store.changes(chronicle_core::AuditId::new(1)), Err(VersioningError::PluginNotRegistered(_)));
}

// ── Errors ──────────────────────────────────────────────────────────────

#[test]
fn untracked_type_is_not_versioned() {
    let store = open(builder(VersioningStrategy::Validity));
    let err = store
        .transact(|tx| tx.insert("Comment", &[("body", text("hi"))]))
        .unwrap_err();
    assert_matches!(err, VersioningError::ClassNotVersioned(name) if name == "Comment");
    assert_matches!(
        store.history("Comment", &EntityKey::from(1)),
        Err(VersioningError::ClassNotVersioned(_))
    );
}

// ── Plugins ─────────────────────────────────────────────────────────────

struct Recorder {
    name: &'static str,
    calls: Arc<Mutex<Vec<String>>>,
    fail_before_create: bool,
}

impl Recorder {
    fn push(&self, hook: &str) {
        self.calls.lock().unwrap().push(format!("{}:{hook}", self.name));
    }
}

impl VersioningPlugin for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn before_create_version_objects(&self, uow: &mut UnitOfWork, _conn: &Connection) -> Result<()> {
        self.push(&format!("before:{}", uow.version_objects().len()));
        assert!(uow.current_audit().is_some());
        if self.fail_before_create {
            return Err(VersioningError::hook(self.name, "rejected"));
        }
        Ok(())
    }

    fn after_commit(&self, _uow: &mut UnitOfWork, _conn: &Connection) -> Result<()> {
        self.push("commit");
        Ok(())
    }

    fn after_rollback(&self, _uow: &mut UnitOfWork, _conn: &Connection) -> Result<()> {
        self.push("rollback");
        Ok(())
    }
}

fn recorder(name: &'static str, calls: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<Recorder> {
    Arc::new(Recorder {
        name,
        calls: Arc::clone(calls),
        fail_before_create: fail,
    })
}

#[test]
fn plugins_fire_in_registration_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let store = open(
        builder(VersioningStrategy::Validity)
            .plugin(recorder("first", &calls, false))
            .plugin(recorder("second", &calls, false)),
    );
    store
        .transact(|tx| {
            tx.insert("Article", &[("name", text("a"))])?;
            tx.insert("Article", &[("name", text("b"))])
        })
        .unwrap();
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["first:before:2", "second:before:2", "first:commit", "second:commit"]
    );
}

#[test]
fn duplicate_plugin_is_ignored() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let manager = builder(VersioningStrategy::Validity)
        .plugin(recorder("probe", &calls, false))
        .plugin(recorder("probe", &calls, true))
        .build()
        .unwrap();
    assert_eq!(
        manager.plugins().names(),
        vec!["audit_changes", "audit_meta", "probe"]
    );
}

#[test]
fn plugin_failure_aborts_everything() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let store = open(
        builder(VersioningStrategy::Validity)
            .plugin(recorder("observer", &calls, false))
            .plugin(recorder("strict", &calls, true)),
    );

    let err = store
        .transact(|tx| {
            tx.meta()?.insert("source", "test")?;
            tx.insert("Article", &[("name", text("doomed"))])
        })
        .unwrap_err();
    assert_matches!(
        err,
        VersioningError::Hook { ref plugin, ref message } if plugin == "strict" && message == "rejected"
    );

    assert_eq!(count(&store, "article"), 0);
    assert_eq!(count(&store, "audit"), 0);
    assert_eq!(count(&store, "audit_changes"), 0);
    assert_eq!(count(&store, "audit_meta"), 0);
    assert_eq!(count(&store, "article_version"), 0);
    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            "observer:before:1",
            "strict:before:1",
            "observer:rollback",
            "strict:rollback"
        ]
    );
}

#[test]
fn no_changes_skips_before_create_hook() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let store = open(builder(VersioningStrategy::Validity).plugin(recorder("probe", &calls, false)));
    let (_, audit) = store.transact(|_tx| Ok(())).unwrap();
    assert!(audit.is_none());
    assert_eq!(*calls.lock().unwrap(), vec!["probe:commit"]);
}

// ── Audit model ─────────────────────────────────────────────────────────

#[test]
fn audit_display_format() {
    let store = open(builder(VersioningStrategy::Validity));
    let (_, audit) = store
        .transact(|tx| tx.insert("Article", &[("name", text("a"))]))
        .unwrap();
    let audit = audit.unwrap();
    let rendered = audit.to_string();
    assert!(rendered.starts_with("<Audit id=1, issued_at='"));
    assert!(rendered.ends_with("'>"));
    assert!(rendered.contains(&audit.issued_at));
}

#[test]
fn audit_ids_increase_per_transaction() {
    let store = open(builder(VersioningStrategy::Validity));
    let mut ids = Vec::new();
    for i in 0..3 {
        let (_, audit) = store
            .transact(|tx| tx.insert("Tag", &[("label", text(&format!("t{i}")))]))
            .unwrap();
        ids.push(audit.unwrap().id);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn user_id_copies_user_key_type() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chronicle.db");
    let setup = Connection::open(&path).unwrap();
    setup
        .execute_batch(&format!(
            "CREATE TABLE users (handle TEXT PRIMARY KEY, display TEXT);
             INSERT INTO users VALUES ('alice', 'Alice');
             {PRIMARY_TABLES}"
        ))
        .unwrap();
    let user = UserTable::from_connection(&setup, "users").unwrap();
    drop(setup);

    let manager = builder(VersioningStrategy::Validity)
        .user_table(user)
        .build()
        .unwrap();
    let settings = DatabaseSettings {
        path: Some(path.to_string_lossy().into_owned()),
        pool_size: 2,
        ..DatabaseSettings::default()
    };
    let store = VersionStore::open(&settings, Arc::new(manager)).unwrap();
    store.create_schema().unwrap();

    {
        let conn = store.connection().unwrap();
        let ty: String = conn
            .query_row(
                "SELECT type FROM pragma_table_info('audit') WHERE name = 'user_id'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(ty, "TEXT");
    }

    let (_, audit) = store
        .transact(|tx| {
            tx.set_user(Some(text("alice")))?;
            tx.insert("Article", &[("name", text("a"))])
        })
        .unwrap();
    let audit = audit.unwrap();
    let conn = store.connection().unwrap();
    let stored = AuditRepo::get(&conn, "audit", audit.id).unwrap().unwrap();
    assert_eq!(stored.user_id, Some(text("alice")));
    drop(conn);

    let err = store
        .transact(|tx| {
            tx.set_user(Some(text("mallory")))?;
            tx.insert("Article", &[("name", text("b"))])
        })
        .unwrap_err();
    assert_matches!(err, VersioningError::Sqlite(_));
    assert_eq!(count(&store, "article"), 1);
}

// ── Strategies ──────────────────────────────────────────────────────────

#[test]
fn subquery_strategy_is_append_only() {
    let store = open(builder(VersioningStrategy::Subquery));
    let (key, first) = store
        .transact(|tx| tx.insert("Article", &[("name", text("a"))]))
        .unwrap();
    let (_, second) = store
        .transact(|tx| tx.update("Article", &key, &[("name", text("b"))]))
        .unwrap();
    let (first, second) = (first.unwrap().id, second.unwrap().id);

    let has_end: i64 = store
        .connection()
        .unwrap()
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('article_version') WHERE name = 'end_audit_id'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(has_end, 0);

    let history = store.history("Article", &key).unwrap();
    assert!(history.iter().all(|row| row.end_audit_id.is_none()));

    let at_first = store.version_at("Article", &key, first).unwrap().unwrap();
    assert_eq!(at_first.get("name"), Some(&text("a")));
    let at_second = store.version_at("Article", &key, second).unwrap().unwrap();
    assert_eq!(at_second.get("name"), Some(&text("b")));
}
