//! SQLite: triggers, views, then tables, with foreign keys disabled for the
//! duration and a `VACUUM` afterwards.

use diesel::{
    QueryResult, QueryableByName, RunQueryDsl, SqliteConnection,
    connection::{AnsiTransactionManager, SimpleConnection, TransactionManager},
    sql_query,
    sql_types::Text,
};
use tracing::warn;

use super::{ObjectKind, SchemaDestroyer, quote_ident};

#[derive(QueryableByName)]
struct Name {
    #[diesel(sql_type = Text)]
    name: String,
}

const DROP_ORDER: &[ObjectKind] = &[ObjectKind::Trigger, ObjectKind::View, ObjectKind::Table];

fn master_type(kind: ObjectKind) -> Option<&'static str> {
    match kind {
        ObjectKind::Trigger => Some("trigger"),
        ObjectKind::View => Some("view"),
        ObjectKind::Table => Some("table"),
        ObjectKind::Sequence | ObjectKind::EnumType => None,
    }
}

fn in_transaction(conn: &mut SqliteConnection) -> QueryResult<bool> {
    let depth = AnsiTransactionManager::transaction_manager_status_mut(conn).transaction_depth()?;
    Ok(depth.is_some())
}

impl SchemaDestroyer for SqliteConnection {
    fn drop_order() -> &'static [ObjectKind] {
        DROP_ORDER
    }

    fn list_droppable_objects(&mut self, kind: ObjectKind) -> QueryResult<Vec<String>> {
        let Some(ty) = master_type(kind) else {
            return Ok(Vec::new());
        };
        // sqlite_* objects (e.g. sqlite_sequence) belong to SQLite itself
        let rows: Vec<Name> = sql_query(
            "SELECT name FROM sqlite_master WHERE type = ? AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name",
        )
        .bind::<Text, _>(ty)
        .load(self)?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    fn drop_statement(kind: ObjectKind, name: &str) -> String {
        format!("DROP {} IF EXISTS {}", kind.keyword(), quote_ident(name))
    }

    fn prepare(&mut self) -> QueryResult<()> {
        // PRAGMA foreign_keys is a no-op inside a transaction
        if in_transaction(self)? {
            warn!("destroy running inside a transaction; foreign keys stay enforced");
        }
        self.batch_execute("PRAGMA foreign_keys=OFF")
    }

    fn compact(&mut self) -> QueryResult<()> {
        if in_transaction(self)? {
            warn!("destroy running inside a transaction; skipping VACUUM");
            return Ok(());
        }
        self.batch_execute("VACUUM")
    }

    fn restore(&mut self) -> QueryResult<()> {
        self.batch_execute("PRAGMA foreign_keys=ON")
    }
}
