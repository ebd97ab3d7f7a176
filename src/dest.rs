//! Destination writers.
//!
//! One writer per worker connection. Each `write_commit` call is a single
//! destination transaction; cadence decisions live with the caller.

use crate::error::{PipeError, Result};
use crate::pool::PipeConn;
use crate::table::TableDescriptor;
use crate::value::SqlValue;
use chrono::{Datelike, NaiveDateTime, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Params, TxOpts};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;

const MYSQL_ER_DATA_TOO_LONG: u16 = 1406;

pub enum DestWriter {
    Postgres {
        client: deadpool_postgres::Object,
        stmt: tokio_postgres::Statement,
    },
    MySql {
        conn: mysql_async::Conn,
        stmt: mysql_async::Statement,
    },
}

impl DestWriter {
    /// Prepare the insert on a dedicated destination connection.
    pub async fn new(conn: PipeConn, table: &TableDescriptor) -> Result<Self> {
        match conn {
            PipeConn::Postgres(client) => {
                let stmt = client
                    .prepare_typed(&table.insert_sql, &table.insert_param_types)
                    .await?;
                Ok(DestWriter::Postgres { client, stmt })
            }
            PipeConn::MySql(mut conn) => {
                let stmt = conn.prep(table.insert_sql.as_str()).await?;
                Ok(DestWriter::MySql { conn, stmt })
            }
        }
    }

    /// Insert `rows` inside one transaction and commit it.
    pub async fn write_commit(&mut self, rows: &[Vec<SqlValue>]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        match self {
            DestWriter::Postgres { client, stmt } => {
                let txn = client.transaction().await?;
                for row in rows {
                    let params: Vec<&(dyn ToSql + Sync)> =
                        row.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
                    txn.execute(stmt, &params).await.map_err(map_pg_write_error)?;
                }
                txn.commit().await?;
                Ok(())
            }
            DestWriter::MySql { conn, stmt } => {
                let mut txn = conn.start_transaction(TxOpts::default()).await?;
                let batches: Vec<Params> = rows
                    .iter()
                    .map(|row| {
                        Params::Positional(row.iter().map(to_mysql_value).collect())
                    })
                    .collect();
                txn.exec_batch(&*stmt, batches)
                    .await
                    .map_err(map_mysql_write_error)?;
                txn.commit().await?;
                Ok(())
            }
        }
    }
}

fn map_pg_write_error(e: tokio_postgres::Error) -> PipeError {
    if e.code() == Some(&SqlState::STRING_DATA_RIGHT_TRUNCATION) {
        PipeError::Capacity {
            message: e.to_string(),
            hint: "a destination column is narrower than its source; widen the column".into(),
        }
    } else {
        PipeError::Source(e)
    }
}

fn map_mysql_write_error(e: mysql_async::Error) -> PipeError {
    if let mysql_async::Error::Server(ref server) = e {
        if server.code == MYSQL_ER_DATA_TOO_LONG {
            return PipeError::Capacity {
                message: server.message.clone(),
                hint: "a destination column is narrower than its source; widen the column".into(),
            };
        }
    }
    PipeError::MySql(e)
}

/// Convert a transfer value into the MySQL wire value.
fn to_mysql_value(value: &SqlValue) -> mysql_async::Value {
    use mysql_async::Value;
    match value {
        SqlValue::Null(_) => Value::NULL,
        SqlValue::I8(v) => Value::from(*v),
        SqlValue::I16(v) => Value::from(*v),
        SqlValue::I32(v) => Value::from(*v),
        SqlValue::I64(v) => Value::from(*v),
        SqlValue::F32(v) => Value::from(*v),
        SqlValue::F64(v) => Value::from(*v),
        // Exact decimal text keeps full precision on the wire.
        SqlValue::Decimal(v) => Value::Bytes(v.to_string().into_bytes()),
        SqlValue::Text(v) => Value::from(v.as_str()),
        SqlValue::Bytes(v) => Value::Bytes(v.clone()),
        SqlValue::Timestamp(ts) => naive_to_mysql(*ts),
        SqlValue::TimestampTz(ts) => naive_to_mysql(ts.naive_utc()),
    }
}

fn naive_to_mysql(ts: NaiveDateTime) -> mysql_async::Value {
    mysql_async::Value::Date(
        ts.year() as u16,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
        ts.and_utc().timestamp_subsec_micros(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnKind;
    use chrono::NaiveDate;
    use mysql_async::Value;
    use rust_decimal::Decimal;

    #[test]
    fn null_maps_to_mysql_null() {
        assert_eq!(
            to_mysql_value(&SqlValue::Null(ColumnKind::Integer)),
            Value::NULL
        );
        assert_eq!(to_mysql_value(&SqlValue::Null(ColumnKind::Text)), Value::NULL);
    }

    #[test]
    fn decimal_travels_as_exact_text() {
        let v = to_mysql_value(&SqlValue::Decimal(Decimal::new(123456, 4)));
        assert_eq!(v, Value::Bytes(b"12.3456".to_vec()));
    }

    #[test]
    fn timestamp_maps_to_date_value() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_micro_opt(13, 5, 7, 250)
            .unwrap();
        assert_eq!(
            to_mysql_value(&SqlValue::Timestamp(ts)),
            Value::Date(2024, 3, 9, 13, 5, 7, 250)
        );
    }

    #[test]
    fn scalar_conversions() {
        assert_eq!(to_mysql_value(&SqlValue::I8(-3)), Value::from(-3i8));
        assert_eq!(to_mysql_value(&SqlValue::I64(9)), Value::from(9i64));
        assert_eq!(to_mysql_value(&SqlValue::Text("x".into())), Value::from("x"));
        assert_eq!(
            to_mysql_value(&SqlValue::Bytes(vec![1, 2])),
            Value::Bytes(vec![1, 2])
        );
    }
}
