//! Column descriptors and the per-type binding strategy.
//!
//! Every supported source column is classified once, at descriptor build
//! time, into a [`ColumnKind`]. The kind is a closed tag: it selects both
//! how a value is read from a fetched row and how it is bound into the
//! destination insert, so the whole type matrix stays exhaustive and
//! statically checkable.

use crate::error::{PipeError, Result};
use crate::value::SqlValue;
use chrono::{DateTime, FixedOffset, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_postgres::Row;
use tracing::warn;

/// Semantic type tag of a source column.
///
/// Zero-scale bounded-precision numerics are narrowed to the smallest
/// sufficient fixed-width integer at classification time, so the integer
/// tags may originate either from a native integer column or from a
/// narrowed `numeric`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    /// Arbitrary-precision decimal (nonzero scale or unbounded precision).
    Numeric,
    /// Binary float.
    Real,
    /// Binary double.
    Double,
    /// Fixed-width character data.
    Char,
    /// Variable-width character data.
    VarChar,
    /// Unbounded character data (character large object).
    Text,
    /// Raw binary / binary large object.
    Bytea,
    Date,
    /// Timestamp without time zone.
    Timestamp,
    /// Timestamp with time zone.
    TimestampTz,
    IntervalYearMonth,
    IntervalDaySecond,
    /// XML document; travels as text and is cast back on insert.
    Xml,
}

impl ColumnKind {
    /// Whether values of this kind are fetched as text and need a cast
    /// back to the native type in the destination insert.
    pub fn travels_as_text(self) -> bool {
        matches!(
            self,
            ColumnKind::IntervalYearMonth | ColumnKind::IntervalDaySecond | ColumnKind::Xml
        )
    }

    /// Whether this kind holds large-object data.
    pub fn is_lob(self) -> bool {
        matches!(self, ColumnKind::Text | ColumnKind::Bytea | ColumnKind::Xml)
    }
}

/// Immutable per-column descriptor, built once from the source catalog.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    /// Column name as stored in the catalog.
    pub name: String,

    /// Semantic type tag.
    pub kind: ColumnKind,

    /// Whether the source representation is `numeric` (integer tags then
    /// decode through an arbitrary-precision value and narrow).
    pub numeric_source: bool,

    /// LOB chunk size hint in bytes; 0 for non-LOB columns.
    pub lob_chunk: i32,
}

/// Narrow a zero-scale bounded-precision decimal to the smallest
/// sufficient integer kind; everything else stays arbitrary-precision.
pub fn narrow_numeric(precision: i32, scale: i32) -> ColumnKind {
    if scale != 0 || precision <= 0 {
        return ColumnKind::Numeric;
    }
    match precision {
        p if p < 3 => ColumnKind::TinyInt,
        p if p < 5 => ColumnKind::SmallInt,
        p if p < 10 => ColumnKind::Integer,
        p if p < 19 => ColumnKind::BigInt,
        _ => ColumnKind::Numeric,
    }
}

/// Extract numeric (precision, scale) from a `pg_attribute.atttypmod`.
/// Returns (0, 0) for unconstrained numerics.
pub fn numeric_typmod(atttypmod: i32) -> (i32, i32) {
    if atttypmod < 4 {
        return (0, 0);
    }
    let packed = atttypmod - 4;
    ((packed >> 16) & 0xffff, packed & 0xffff)
}

/// Classify a catalog row into a semantic kind. `None` means the type is
/// unsupported and the column is excluded from the copy.
pub fn classify(typname: &str, formatted: &str, atttypmod: i32) -> Option<ColumnKind> {
    let kind = match typname {
        "int2" => ColumnKind::SmallInt,
        "int4" => ColumnKind::Integer,
        "int8" => ColumnKind::BigInt,
        "numeric" => {
            let (precision, scale) = numeric_typmod(atttypmod);
            narrow_numeric(precision, scale)
        }
        "float4" => ColumnKind::Real,
        "float8" => ColumnKind::Double,
        "bpchar" => ColumnKind::Char,
        "varchar" => ColumnKind::VarChar,
        "text" => ColumnKind::Text,
        "bytea" => ColumnKind::Bytea,
        "date" => ColumnKind::Date,
        "timestamp" => ColumnKind::Timestamp,
        "timestamptz" => ColumnKind::TimestampTz,
        "interval" => {
            // The catalog keeps one interval type; the field restriction
            // only shows in the formatted name.
            let f = formatted.to_ascii_lowercase();
            if f.ends_with("year") || f.ends_with("to month") || f.ends_with("interval month") {
                ColumnKind::IntervalYearMonth
            } else {
                ColumnKind::IntervalDaySecond
            }
        }
        "xml" => ColumnKind::Xml,
        _ => return None,
    };
    Some(kind)
}

impl ColumnDescriptor {
    /// Build a descriptor from catalog fields, or `None` (with a warning)
    /// when the type is unsupported.
    pub fn from_catalog(
        name: &str,
        typname: &str,
        formatted: &str,
        atttypmod: i32,
        lob_chunk_hint: i32,
    ) -> Option<Self> {
        let Some(kind) = classify(typname, formatted, atttypmod) else {
            warn!(
                column = name,
                data_type = formatted,
                "Datatype is not supported; column excluded from copy"
            );
            return None;
        };
        Some(Self {
            name: name.to_string(),
            kind,
            numeric_source: typname == "numeric",
            lob_chunk: if kind.is_lob() { lob_chunk_hint } else { 0 },
        })
    }

    /// Read this column from a fetched row at `idx` into a transfer value.
    ///
    /// A source NULL always becomes [`SqlValue::Null`] tagged with this
    /// column's kind, never a default value. Narrowing overflow (which the
    /// precision bound should rule out) surfaces as a bind error rather
    /// than silent truncation.
    pub fn decode(&self, row: &Row, idx: usize) -> Result<SqlValue> {
        let value = match self.kind {
            ColumnKind::TinyInt => {
                // Only produced by narrowing, so the wire type is numeric.
                match self.get_decimal(row, idx)? {
                    None => SqlValue::Null(self.kind),
                    Some(d) => SqlValue::I8(self.narrow(d.to_i8(), &d)?),
                }
            }
            ColumnKind::SmallInt => {
                if self.numeric_source {
                    match self.get_decimal(row, idx)? {
                        None => SqlValue::Null(self.kind),
                        Some(d) => SqlValue::I16(self.narrow(d.to_i16(), &d)?),
                    }
                } else {
                    self.get(row, idx, SqlValue::I16)?
                }
            }
            ColumnKind::Integer => {
                if self.numeric_source {
                    match self.get_decimal(row, idx)? {
                        None => SqlValue::Null(self.kind),
                        Some(d) => SqlValue::I32(self.narrow(d.to_i32(), &d)?),
                    }
                } else {
                    self.get(row, idx, SqlValue::I32)?
                }
            }
            ColumnKind::BigInt => {
                if self.numeric_source {
                    match self.get_decimal(row, idx)? {
                        None => SqlValue::Null(self.kind),
                        Some(d) => SqlValue::I64(self.narrow(d.to_i64(), &d)?),
                    }
                } else {
                    self.get(row, idx, SqlValue::I64)?
                }
            }
            ColumnKind::Numeric => self.get(row, idx, SqlValue::Decimal)?,
            ColumnKind::Real => self.get(row, idx, SqlValue::F32)?,
            ColumnKind::Double => self.get(row, idx, SqlValue::F64)?,
            ColumnKind::Char | ColumnKind::VarChar | ColumnKind::Text => {
                self.get(row, idx, SqlValue::Text)?
            }
            ColumnKind::Bytea => self.get(row, idx, SqlValue::Bytes)?,
            ColumnKind::Date => {
                // Dates normalize to the destination timestamp representation.
                match self.try_get::<NaiveDate>(row, idx)? {
                    None => SqlValue::Null(self.kind),
                    Some(d) => SqlValue::Timestamp(d.and_time(chrono::NaiveTime::MIN)),
                }
            }
            ColumnKind::Timestamp => self.get(row, idx, SqlValue::Timestamp)?,
            ColumnKind::TimestampTz => {
                match self.try_get::<DateTime<FixedOffset>>(row, idx)? {
                    None => SqlValue::Null(self.kind),
                    Some(ts) => SqlValue::TimestampTz(ts),
                }
            }
            ColumnKind::IntervalYearMonth | ColumnKind::IntervalDaySecond | ColumnKind::Xml => {
                // Selected as ::text by the fetch query.
                self.get(row, idx, SqlValue::Text)?
            }
        };
        Ok(value)
    }

    fn get<T, F>(&self, row: &Row, idx: usize, wrap: F) -> Result<SqlValue>
    where
        F: FnOnce(T) -> SqlValue,
        for<'a> T: tokio_postgres::types::FromSql<'a>,
    {
        Ok(match self.try_get::<T>(row, idx)? {
            None => SqlValue::Null(self.kind),
            Some(v) => wrap(v),
        })
    }

    fn try_get<T>(&self, row: &Row, idx: usize) -> Result<Option<T>>
    where
        for<'a> T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx).map_err(|e| PipeError::Bind {
            column: self.name.clone(),
            message: e.to_string(),
        })
    }

    fn get_decimal(&self, row: &Row, idx: usize) -> Result<Option<Decimal>> {
        self.try_get::<Decimal>(row, idx)
    }

    fn narrow<T>(&self, narrowed: Option<T>, original: &Decimal) -> Result<T> {
        narrowed.ok_or_else(|| PipeError::Bind {
            column: self.name.clone(),
            message: format!("value {} does not fit the narrowed integer type", original),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_thresholds() {
        assert_eq!(narrow_numeric(1, 0), ColumnKind::TinyInt);
        assert_eq!(narrow_numeric(2, 0), ColumnKind::TinyInt);
        assert_eq!(narrow_numeric(3, 0), ColumnKind::SmallInt);
        assert_eq!(narrow_numeric(4, 0), ColumnKind::SmallInt);
        assert_eq!(narrow_numeric(5, 0), ColumnKind::Integer);
        assert_eq!(narrow_numeric(8, 0), ColumnKind::Integer);
        assert_eq!(narrow_numeric(9, 0), ColumnKind::Integer);
        assert_eq!(narrow_numeric(10, 0), ColumnKind::BigInt);
        assert_eq!(narrow_numeric(18, 0), ColumnKind::BigInt);
        // Precision 19 must NOT be narrowed.
        assert_eq!(narrow_numeric(19, 0), ColumnKind::Numeric);
        assert_eq!(narrow_numeric(38, 0), ColumnKind::Numeric);
    }

    #[test]
    fn nonzero_scale_and_unbounded_stay_decimal() {
        assert_eq!(narrow_numeric(8, 2), ColumnKind::Numeric);
        assert_eq!(narrow_numeric(0, 0), ColumnKind::Numeric);
    }

    #[test]
    fn typmod_unpacking() {
        // numeric(8,0) => ((8 << 16) | 0) + 4
        assert_eq!(numeric_typmod((8 << 16) + 4), (8, 0));
        // numeric(12,4)
        assert_eq!(numeric_typmod((12 << 16) + 4 + 4), (12, 4));
        // unconstrained numeric
        assert_eq!(numeric_typmod(-1), (0, 0));
    }

    #[test]
    fn classifies_native_types() {
        assert_eq!(classify("int4", "integer", -1), Some(ColumnKind::Integer));
        assert_eq!(classify("varchar", "character varying(40)", 44), Some(ColumnKind::VarChar));
        assert_eq!(classify("bytea", "bytea", -1), Some(ColumnKind::Bytea));
        assert_eq!(classify("timestamptz", "timestamp with time zone", -1), Some(ColumnKind::TimestampTz));
        assert_eq!(classify("geometry", "geometry", -1), None);
    }

    #[test]
    fn classifies_interval_fields() {
        assert_eq!(
            classify("interval", "interval year to month", 0),
            Some(ColumnKind::IntervalYearMonth)
        );
        assert_eq!(
            classify("interval", "interval day to second(6)", 0),
            Some(ColumnKind::IntervalDaySecond)
        );
        assert_eq!(
            classify("interval", "interval", -1),
            Some(ColumnKind::IntervalDaySecond)
        );
    }

    #[test]
    fn narrowed_numeric_keeps_numeric_source_flag() {
        let col = ColumnDescriptor::from_catalog("qty", "numeric", "numeric(8,0)", (8 << 16) + 4, 0)
            .unwrap();
        assert_eq!(col.kind, ColumnKind::Integer);
        assert!(col.numeric_source);

        let native = ColumnDescriptor::from_catalog("id", "int4", "integer", -1, 0).unwrap();
        assert_eq!(native.kind, ColumnKind::Integer);
        assert!(!native.numeric_source);
    }

    #[test]
    fn unsupported_type_is_excluded() {
        assert!(ColumnDescriptor::from_catalog("geo", "geometry", "geometry", -1, 0).is_none());
    }

    #[test]
    fn lob_chunk_only_for_lob_kinds() {
        let text = ColumnDescriptor::from_catalog("body", "text", "text", -1, 2048).unwrap();
        assert_eq!(text.lob_chunk, 2048);
        let num = ColumnDescriptor::from_catalog("n", "int8", "bigint", -1, 2048).unwrap();
        assert_eq!(num.lob_chunk, 0);
    }
}
