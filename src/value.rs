//! Transfer value enum for type-safe row handling.

use crate::column::ColumnKind;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

/// One column value in flight between the fetch cursor and the
/// destination insert.
///
/// NULLs carry the column's semantic kind so the destination always
/// receives a typed null.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null(ColumnKind),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
}

impl SqlValue {
    /// Whether this value is a NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null(_) => Ok(IsNull::Yes),
            // PostgreSQL has no 8-bit integer; widen to smallint.
            SqlValue::I8(v) => (*v as i16).to_sql(ty, out),
            SqlValue::I16(v) => v.to_sql(ty, out),
            SqlValue::I32(v) => v.to_sql(ty, out),
            SqlValue::I64(v) => v.to_sql(ty, out),
            SqlValue::F32(v) => v.to_sql(ty, out),
            SqlValue::F64(v) => v.to_sql(ty, out),
            SqlValue::Decimal(v) => v.to_sql(ty, out),
            SqlValue::Text(v) => {
                // The destination text representation cannot hold embedded
                // NUL bytes.
                if v.contains('\0') {
                    v.replace('\0', "").to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Bytes(v) => v.to_sql(ty, out),
            SqlValue::Timestamp(v) => v.to_sql(ty, out),
            SqlValue::TimestampTz(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Parameter types are declared explicitly at prepare time; the
        // variant in hand decides the encoding.
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn null_binds_as_typed_null() {
        for kind in [
            ColumnKind::Integer,
            ColumnKind::Numeric,
            ColumnKind::VarChar,
            ColumnKind::Timestamp,
            ColumnKind::Bytea,
        ] {
            let mut buf = BytesMut::new();
            let got = SqlValue::Null(kind).to_sql(&Type::TEXT, &mut buf).unwrap();
            assert!(matches!(got, IsNull::Yes), "kind {:?}", kind);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn tinyint_widens_to_smallint_encoding() {
        let mut narrow = BytesMut::new();
        SqlValue::I8(-7).to_sql(&Type::INT2, &mut narrow).unwrap();
        let mut wide = BytesMut::new();
        SqlValue::I16(-7).to_sql(&Type::INT2, &mut wide).unwrap();
        assert_eq!(narrow, wide);
    }

    #[test]
    fn embedded_nul_is_stripped() {
        let mut buf = BytesMut::new();
        SqlValue::Text("a\0b".into())
            .to_sql(&Type::TEXT, &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"ab");
    }
}
