//! PostgreSQL: sequences, views, enum types, then tables, all `CASCADE`,
//! restricted to the `public` schema.

use diesel::{PgConnection, QueryResult, QueryableByName, RunQueryDsl, sql_query, sql_types::Text};

use super::{ObjectKind, SchemaDestroyer, quote_ident};

#[derive(QueryableByName)]
struct Name {
    #[diesel(sql_type = Text)]
    name: String,
}

const DROP_ORDER: &[ObjectKind] = &[
    ObjectKind::Sequence,
    ObjectKind::View,
    ObjectKind::EnumType,
    ObjectKind::Table,
];

fn catalog_query(kind: ObjectKind) -> Option<&'static str> {
    let sql = match kind {
        ObjectKind::Sequence => {
            // identity sequences belong to their column and go with the table
            "SELECT s.sequence_name::text AS name FROM information_schema.sequences s \
             WHERE s.sequence_schema = 'public' \
             AND NOT EXISTS (SELECT 1 FROM pg_depend d \
                 WHERE d.classid = 'pg_class'::regclass \
                 AND d.objid = format('%I.%I', s.sequence_schema, s.sequence_name)::regclass \
                 AND d.deptype = 'i') \
             ORDER BY 1"
        }
        ObjectKind::View => {
            "SELECT table_name::text AS name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'VIEW' ORDER BY 1"
        }
        ObjectKind::EnumType => {
            "SELECT t.typname::text AS name FROM pg_type t \
             JOIN pg_namespace n ON n.oid = t.typnamespace \
             WHERE t.typtype = 'e' AND n.nspname = 'public' ORDER BY 1"
        }
        ObjectKind::Table => {
            "SELECT table_name::text AS name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' ORDER BY 1"
        }
        ObjectKind::Trigger => return None,
    };
    Some(sql)
}

impl SchemaDestroyer for PgConnection {
    fn drop_order() -> &'static [ObjectKind] {
        DROP_ORDER
    }

    fn list_droppable_objects(&mut self, kind: ObjectKind) -> QueryResult<Vec<String>> {
        let Some(sql) = catalog_query(kind) else {
            return Ok(Vec::new());
        };
        let rows: Vec<Name> = sql_query(sql).load(self)?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    fn drop_statement(kind: ObjectKind, name: &str) -> String {
        format!("DROP {} IF EXISTS \"public\".{} CASCADE", kind.keyword(), quote_ident(name))
    }
}
