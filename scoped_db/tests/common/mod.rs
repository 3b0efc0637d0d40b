#![allow(dead_code)]

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Integer, Text};
use scoped_db::DatabaseConfig;
use scoped_db::db::connection::connect;
use std::path::PathBuf;
use tempfile::TempDir;

#[derive(QueryableByName)]
struct Count {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}

pub struct TestDb {
    _dir: TempDir,   // keep alive for the life of the test
    pub url: String, // <tmpdir>/test.db
}

pub fn temp_db() -> TestDb {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let url = p.to_string_lossy().to_string();
    TestDb { _dir: dir, url }
}

/// A small pool over the test database with short timeouts.
pub fn sqlite_config(db: &TestDb) -> DatabaseConfig {
    let mut cfg = DatabaseConfig::new(db.url.clone());
    cfg.pool_size = 2;
    cfg.pool_timeout = 2.0;
    cfg
}

pub fn open(db: &TestDb) -> SqliteConnection {
    connect::<SqliteConnection>(&db.url).expect("connect")
}

pub fn seed_hits(db: &TestDb) {
    open(db)
        .batch_execute("CREATE TABLE hits (id INTEGER PRIMARY KEY, label TEXT NOT NULL);")
        .expect("create hits");
}

pub fn count_rows(conn: &mut SqliteConnection, table: &str) -> i64 {
    let c: Count = sql_query(format!("SELECT COUNT(*) AS n FROM {table}"))
        .get_result(conn)
        .expect("count rows");
    c.n
}

/// User objects of `ty` left in `sqlite_master`.
pub fn count_objects(conn: &mut SqliteConnection, ty: &str) -> i64 {
    let c: Count = sql_query(
        "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = ? AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
    )
    .bind::<Text, _>(ty)
    .get_result(conn)
    .expect("count objects");
    c.n
}

pub fn seed_schema(conn: &mut SqliteConnection) {
    conn.batch_execute(
        r#"
        CREATE TABLE parent (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);
        CREATE TABLE child (
            id INTEGER PRIMARY KEY,
            parent_id INTEGER NOT NULL REFERENCES parent(id)
        );
        CREATE TABLE "odd ""name""" (x INTEGER);
        CREATE INDEX child_parent ON child(parent_id);
        CREATE VIEW parent_names AS SELECT name FROM parent;
        CREATE TRIGGER parent_audit AFTER INSERT ON parent
            BEGIN INSERT INTO child (parent_id) VALUES (NEW.id); END;
        INSERT INTO parent (name) VALUES ('a'), ('b');
        "#,
    )
    .expect("seed schema");
}

pub fn foreign_keys_enabled(conn: &mut SqliteConnection) -> bool {
    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).expect("pragma");
    fk.foreign_keys == 1
}
