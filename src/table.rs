//! Table descriptor: catalog introspection and statement synthesis.
//!
//! A [`TableDescriptor`] is built once per run from the source catalog and
//! is immutable afterwards. It owns the three statements of the copy (key
//! query, keyed fetch, destination insert) plus the declared parameter
//! types of the insert, so workers never synthesize SQL themselves.

use crate::column::{ColumnDescriptor, ColumnKind};
use crate::config::Config;
use crate::error::{PipeError, Result};
use crate::pool::EngineFamily;
use crate::value::SqlValue;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, Row};
use tracing::{debug, info};

const CATALOG_SQL: &str = "\
SELECT a.attname,
       t.typname,
       pg_catalog.format_type(a.atttypid, a.atttypmod),
       a.atttypmod
FROM pg_catalog.pg_attribute a
JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_type t ON t.oid = a.atttypid
WHERE n.nspname = $1
  AND c.relname = $2
  AND a.attnum > 0
  AND NOT a.attisdropped
ORDER BY a.attnum";

/// Everything a worker needs to copy rows of one table.
pub struct TableDescriptor {
    pub source_schema: String,
    pub source_table: String,
    pub destination_schema: String,
    pub destination_table: String,

    /// Copied columns, in source ordinal order.
    pub columns: Vec<ColumnDescriptor>,

    /// Destination column receiving the source row identifier, if enabled.
    pub rowid_column: Option<String>,

    /// Runs once, returns every row identifier in the copy set.
    pub key_sql: String,

    /// Keyed fetch; `$1` is the identifier bind array.
    pub fetch_sql: String,

    /// Destination insert, one row per execution.
    pub insert_sql: String,

    /// Declared parameter types of the insert (PostgreSQL destinations).
    pub insert_param_types: Vec<Type>,

    pub dest_family: EngineFamily,
}

impl TableDescriptor {
    /// Introspect the source table and synthesize the run's statements.
    pub async fn open(
        client: &Client,
        config: &Config,
        dest_family: EngineFamily,
    ) -> Result<Self> {
        let schema = &config.copy.source_schema;
        let table = &config.copy.source_table;

        let rows = client
            .query(CATALOG_SQL, &[schema, table])
            .await
            .map_err(|e| map_catalog_error(e, schema, table))?;
        if rows.is_empty() {
            return Err(PipeError::Descriptor {
                table: format!("{}.{}", schema, table),
                message: "table not found in catalog or has no columns".into(),
            });
        }

        // Advisory chunk size for large-object columns, derived from the
        // server block size.
        let lob_chunk_hint = match client
            .query_one("SELECT current_setting('block_size')::int", &[])
            .await
        {
            Ok(row) => row.get::<_, i32>(0) / 4,
            Err(_) => 2048,
        };

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: &str = row.get(0);
            let typname: &str = row.get(1);
            let formatted: &str = row.get(2);
            let atttypmod: i32 = row.get(3);
            if let Some(col) =
                ColumnDescriptor::from_catalog(name, typname, formatted, atttypmod, lob_chunk_hint)
            {
                columns.push(col);
            }
        }
        if columns.is_empty() {
            return Err(PipeError::Descriptor {
                table: format!("{}.{}", schema, table),
                message: "no copyable columns (all types unsupported)".into(),
            });
        }

        if dest_family == EngineFamily::MySql {
            if let Some(col) = columns.iter().find(|c| {
                matches!(
                    c.kind,
                    ColumnKind::IntervalYearMonth | ColumnKind::IntervalDaySecond
                )
            }) {
                return Err(PipeError::Descriptor {
                    table: format!("{}.{}", schema, table),
                    message: format!(
                        "column '{}' is an interval; MySQL has no interval column type",
                        col.name
                    ),
                });
            }
        }

        let rowid_column = config.copy.rowid_column().map(str::to_string);
        let destination_schema = config.copy.destination_schema().to_string();
        let destination_table = config.copy.destination_table().to_string();

        let key_sql = synthesize_key_sql(schema, table, config.copy.where_clause.as_deref());
        let fetch_sql = synthesize_fetch_sql(schema, table, &columns, rowid_column.is_some());
        let insert_sql = synthesize_insert_sql(
            dest_family,
            &destination_schema,
            &destination_table,
            &columns,
            rowid_column.as_deref(),
        );
        let insert_param_types = insert_param_types(&columns, rowid_column.is_some());

        info!(
            source = format!("{}.{}", schema, table),
            destination = format!("{}.{}", destination_schema, destination_table),
            columns = columns.len(),
            "Built table descriptor"
        );
        debug!(key_sql, "Key query");
        debug!(fetch_sql, "Fetch query");
        debug!(insert_sql, "Insert statement");

        Ok(Self {
            source_schema: schema.clone(),
            source_table: table.clone(),
            destination_schema,
            destination_table,
            columns,
            rowid_column,
            key_sql,
            fetch_sql,
            insert_sql,
            insert_param_types,
            dest_family,
        })
    }

    /// Decode one fetched row into transfer values in insert-parameter
    /// order. With passthrough enabled the identifier occupies position 0
    /// in both the fetch output and the insert parameters.
    pub fn decode_row(&self, row: &Row) -> Result<Vec<SqlValue>> {
        let offset = usize::from(self.rowid_column.is_some());
        let mut values = Vec::with_capacity(self.columns.len() + offset);
        if self.rowid_column.is_some() {
            let id: String = row.try_get(0).map_err(PipeError::Source)?;
            values.push(SqlValue::Text(id));
        }
        for (i, col) in self.columns.iter().enumerate() {
            values.push(col.decode(row, i + offset)?);
        }
        Ok(values)
    }
}

fn map_catalog_error(e: tokio_postgres::Error, schema: &str, table: &str) -> PipeError {
    if e.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE) {
        PipeError::Privilege {
            message: format!("cannot read catalog metadata for {}.{}", schema, table),
            grants: vec![
                format!("GRANT USAGE ON SCHEMA {} TO <user>;", schema),
                format!("GRANT SELECT ON {}.{} TO <user>;", schema, table),
            ],
        }
    } else {
        PipeError::Source(e)
    }
}

/// Quote an identifier for PostgreSQL.
pub fn quote_pg_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote an identifier for MySQL.
pub fn quote_mysql_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Key query: one consistent pass over the source, optionally filtered.
pub fn synthesize_key_sql(schema: &str, table: &str, where_clause: Option<&str>) -> String {
    let mut sql = format!(
        "SELECT t.ctid::text FROM {}.{} t",
        quote_pg_ident(schema),
        quote_pg_ident(table)
    );
    if let Some(pred) = where_clause.filter(|p| !p.trim().is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(pred.trim());
    }
    sql
}

/// Keyed fetch. Column order matches the descriptor; kinds that travel as
/// text are cast on the way out. With passthrough the identifier is
/// re-selected as the first output column.
pub fn synthesize_fetch_sql(
    schema: &str,
    table: &str,
    columns: &[ColumnDescriptor],
    with_rowid: bool,
) -> String {
    let mut select = Vec::with_capacity(columns.len() + 1);
    if with_rowid {
        select.push("t.ctid::text".to_string());
    }
    for col in columns {
        let ident = quote_pg_ident(&col.name);
        if col.kind.travels_as_text() {
            select.push(format!("t.{}::text", ident));
        } else {
            select.push(format!("t.{}", ident));
        }
    }
    format!(
        "SELECT {} FROM {}.{} t WHERE t.ctid = ANY($1::tid[])",
        select.join(", "),
        quote_pg_ident(schema),
        quote_pg_ident(table)
    )
}

/// Destination insert. Parameter order is the column order, with the
/// passthrough identifier first so it lines up with the fetch output.
/// Text-travelling kinds are cast back to their native type inside the
/// statement on PostgreSQL destinations.
pub fn synthesize_insert_sql(
    family: EngineFamily,
    schema: &str,
    table: &str,
    columns: &[ColumnDescriptor],
    rowid_column: Option<&str>,
) -> String {
    match family {
        EngineFamily::Postgres => {
            let mut names = Vec::with_capacity(columns.len() + 1);
            let mut params = Vec::with_capacity(columns.len() + 1);
            if let Some(rowid) = rowid_column {
                names.push(quote_pg_ident(rowid));
                params.push("$1".to_string());
            }
            let offset = usize::from(rowid_column.is_some());
            for (i, col) in columns.iter().enumerate() {
                names.push(quote_pg_ident(&col.name));
                let n = i + offset + 1;
                params.push(match col.kind {
                    ColumnKind::IntervalYearMonth | ColumnKind::IntervalDaySecond => {
                        format!("${}::interval", n)
                    }
                    ColumnKind::Xml => format!("${}::xml", n),
                    _ => format!("${}", n),
                });
            }
            format!(
                "INSERT INTO {}.{} ({}) VALUES ({})",
                quote_pg_ident(schema),
                quote_pg_ident(table),
                names.join(", "),
                params.join(", ")
            )
        }
        EngineFamily::MySql => {
            let mut names = Vec::with_capacity(columns.len() + 1);
            if let Some(rowid) = rowid_column {
                names.push(quote_mysql_ident(rowid));
            }
            names.extend(columns.iter().map(|c| quote_mysql_ident(&c.name)));
            let params = vec!["?"; names.len()];
            format!(
                "INSERT INTO {}.{} ({}) VALUES ({})",
                quote_mysql_ident(schema),
                quote_mysql_ident(table),
                names.join(", "),
                params.join(", ")
            )
        }
    }
}

/// Declared parameter types for a PostgreSQL destination insert, aligned
/// with the parameter order of [`synthesize_insert_sql`].
pub fn insert_param_types(columns: &[ColumnDescriptor], with_rowid: bool) -> Vec<Type> {
    let mut types = Vec::with_capacity(columns.len() + 1);
    if with_rowid {
        types.push(Type::TEXT);
    }
    for col in columns {
        types.push(match col.kind {
            ColumnKind::TinyInt | ColumnKind::SmallInt => Type::INT2,
            ColumnKind::Integer => Type::INT4,
            ColumnKind::BigInt => Type::INT8,
            ColumnKind::Numeric => Type::NUMERIC,
            ColumnKind::Real => Type::FLOAT4,
            ColumnKind::Double => Type::FLOAT8,
            ColumnKind::Char | ColumnKind::VarChar | ColumnKind::Text => Type::TEXT,
            ColumnKind::Bytea => Type::BYTEA,
            ColumnKind::Date | ColumnKind::Timestamp => Type::TIMESTAMP,
            ColumnKind::TimestampTz => Type::TIMESTAMPTZ,
            // Travel as text; the statement casts them back.
            ColumnKind::IntervalYearMonth | ColumnKind::IntervalDaySecond | ColumnKind::Xml => {
                Type::TEXT
            }
        });
    }
    types
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, typname: &str, formatted: &str) -> ColumnDescriptor {
        ColumnDescriptor::from_catalog(name, typname, formatted, -1, 0).unwrap()
    }

    #[test]
    fn key_sql_with_and_without_filter() {
        assert_eq!(
            synthesize_key_sql("sales", "orders", None),
            r#"SELECT t.ctid::text FROM "sales"."orders" t"#
        );
        assert_eq!(
            synthesize_key_sql("sales", "orders", Some("status = 'OPEN'")),
            r#"SELECT t.ctid::text FROM "sales"."orders" t WHERE status = 'OPEN'"#
        );
        // Blank filters are dropped entirely.
        assert_eq!(
            synthesize_key_sql("sales", "orders", Some("  ")),
            r#"SELECT t.ctid::text FROM "sales"."orders" t"#
        );
    }

    #[test]
    fn fetch_sql_casts_text_travellers() {
        let cols = vec![
            col("id", "int8", "bigint"),
            col("lease", "interval", "interval day to second"),
            col("doc", "xml", "xml"),
        ];
        assert_eq!(
            synthesize_fetch_sql("app", "leases", &cols, false),
            r#"SELECT t."id", t."lease"::text, t."doc"::text FROM "app"."leases" t WHERE t.ctid = ANY($1::tid[])"#
        );
    }

    #[test]
    fn fetch_sql_prepends_identifier_for_passthrough() {
        let cols = vec![col("id", "int8", "bigint")];
        assert_eq!(
            synthesize_fetch_sql("app", "leases", &cols, true),
            r#"SELECT t.ctid::text, t."id" FROM "app"."leases" t WHERE t.ctid = ANY($1::tid[])"#
        );
    }

    #[test]
    fn pg_insert_casts_and_leads_with_rowid() {
        let cols = vec![
            col("id", "int8", "bigint"),
            col("lease", "interval", "interval day to second"),
        ];
        assert_eq!(
            synthesize_insert_sql(EngineFamily::Postgres, "app", "leases", &cols, Some("SRC_ROW_ID")),
            r#"INSERT INTO "app"."leases" ("SRC_ROW_ID", "id", "lease") VALUES ($1, $2, $3::interval)"#
        );
    }

    #[test]
    fn mysql_insert_uses_positional_markers() {
        let cols = vec![col("id", "int8", "bigint"), col("name", "varchar", "character varying(40)")];
        assert_eq!(
            synthesize_insert_sql(EngineFamily::MySql, "app", "users", &cols, None),
            "INSERT INTO `app`.`users` (`id`, `name`) VALUES (?, ?)"
        );
    }

    #[test]
    fn param_types_align_with_insert_order() {
        let cols = vec![
            col("id", "int4", "integer"),
            col("doc", "xml", "xml"),
            col("at", "timestamptz", "timestamp with time zone"),
        ];
        assert_eq!(
            insert_param_types(&cols, true),
            vec![Type::TEXT, Type::INT4, Type::TEXT, Type::TIMESTAMPTZ]
        );
    }

    #[test]
    fn synthesis_is_deterministic() {
        let cols = vec![col("a", "int4", "integer"), col("b", "text", "text")];
        let first = synthesize_fetch_sql("s", "t", &cols, false);
        let second = synthesize_fetch_sql("s", "t", &cols, false);
        assert_eq!(first, second);
    }

    #[test]
    fn identifiers_with_quotes_are_escaped() {
        assert_eq!(quote_pg_ident(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(quote_mysql_ident("we`ird"), "`we``ird`");
    }
}
