//! Value coercion from database types to transport values
//!
//! The scan kind is chosen once per column from its declared type name, by
//! exact match:
//!
//! | Declared type                            | Transport value |
//! |------------------------------------------|-----------------|
//! | UInt8, UInt16, UInt32                    | u32             |
//! | UInt64                                   | u64             |
//! | Int8, Int16, Int32                       | i32             |
//! | Int64                                    | i64             |
//! | Float32 / Float64                        | f32 / f64       |
//! | String, FixedString, Nullable(String)    | string          |
//! | Date, DateTime                           | timestamp (UTC) |
//! | anything else                            | string          |
//!
//! Parameterized or wrapped names (`Decimal(18, 3)`, `Nullable(Int32)`,
//! `DateTime64(3)`) are not matched and travel as their textual rendering.
//! A value that does not fit its declared kind is an error, never a silent
//! truncation. SQL NULL becomes JSON `null` in every kind.

use chrono::{DateTime, Utc};
use serde::Serialize;
use streamgate_engine::{ColumnDescriptor, RawRow, RawValue};

/// How a column's values are extracted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    UInt32,
    UInt64,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Timestamp,
    /// Unrecognized type name, rendered as text
    Fallback,
}

impl ScanKind {
    pub fn for_type_name(type_name: &str) -> Self {
        match type_name {
            "UInt8" | "UInt16" | "UInt32" => ScanKind::UInt32,
            "UInt64" => ScanKind::UInt64,
            "Int8" | "Int16" | "Int32" => ScanKind::Int32,
            "Int64" => ScanKind::Int64,
            "Float32" => ScanKind::Float32,
            "Float64" => ScanKind::Float64,
            "String" | "FixedString" | "Nullable(String)" => ScanKind::String,
            "Date" | "DateTime" => ScanKind::Timestamp,
            _ => ScanKind::Fallback,
        }
    }
}

/// A value that is safe to put on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TransportValue {
    Null,
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("column {column} ({type_name}): {reason}")]
pub struct CoercionError {
    pub column: String,
    pub type_name: String,
    pub reason: String,
}

/// Coerce one raw value into the transport value for `kind`
///
/// The `Err` carries only the reason; [`CoercionPlan`] attaches the column.
pub fn coerce(kind: ScanKind, raw: RawValue) -> Result<TransportValue, String> {
    if raw.is_null() {
        return Ok(TransportValue::Null);
    }

    let value = match (kind, raw) {
        (ScanKind::Fallback, raw) => TransportValue::String(raw.to_string()),

        (ScanKind::UInt32, RawValue::Unsigned(v)) => {
            TransportValue::UInt32(u32::try_from(v).map_err(|_| out_of_range(v))?)
        }
        (ScanKind::UInt32, RawValue::Signed(v)) => {
            TransportValue::UInt32(u32::try_from(v).map_err(|_| out_of_range(v))?)
        }
        (ScanKind::UInt64, RawValue::Unsigned(v)) => TransportValue::UInt64(v),
        (ScanKind::UInt64, RawValue::Signed(v)) => {
            TransportValue::UInt64(u64::try_from(v).map_err(|_| out_of_range(v))?)
        }
        (ScanKind::Int32, RawValue::Signed(v)) => {
            TransportValue::Int32(i32::try_from(v).map_err(|_| out_of_range(v))?)
        }
        (ScanKind::Int32, RawValue::Unsigned(v)) => {
            TransportValue::Int32(i32::try_from(v).map_err(|_| out_of_range(v))?)
        }
        (ScanKind::Int64, RawValue::Signed(v)) => TransportValue::Int64(v),
        (ScanKind::Int64, RawValue::Unsigned(v)) => {
            TransportValue::Int64(i64::try_from(v).map_err(|_| out_of_range(v))?)
        }

        (ScanKind::Float32, RawValue::Float32(v)) => TransportValue::Float32(v),
        (ScanKind::Float64, RawValue::Float64(v)) => TransportValue::Float64(v),
        (ScanKind::Float64, RawValue::Float32(v)) => TransportValue::Float64(f64::from(v)),

        (ScanKind::String, RawValue::Text(v)) | (ScanKind::String, RawValue::Other(v)) => {
            TransportValue::String(v)
        }

        (ScanKind::Timestamp, RawValue::Timestamp(v)) => TransportValue::Timestamp(v),
        (ScanKind::Timestamp, RawValue::Date(d)) => match d.and_hms_opt(0, 0, 0) {
            Some(midnight) => TransportValue::Timestamp(midnight.and_utc()),
            None => return Err(format!("date {} has no midnight", d)),
        },

        (kind, raw) => {
            return Err(format!(
                "cannot convert {:?} value '{}' to {:?}",
                raw_variant(&raw),
                raw,
                kind
            ))
        }
    };
    Ok(value)
}

fn out_of_range<T: std::fmt::Display>(value: T) -> String {
    format!("value {} out of range", value)
}

fn raw_variant(raw: &RawValue) -> &'static str {
    match raw {
        RawValue::Null => "null",
        RawValue::Boolean(_) => "boolean",
        RawValue::Signed(_) => "signed integer",
        RawValue::Unsigned(_) => "unsigned integer",
        RawValue::Float32(_) | RawValue::Float64(_) => "float",
        RawValue::Text(_) => "text",
        RawValue::Date(_) => "date",
        RawValue::Timestamp(_) => "timestamp",
        RawValue::Other(_) => "opaque",
    }
}

/// Per-query coercion plan, fixed from the column descriptors
#[derive(Debug, Clone)]
pub struct CoercionPlan {
    columns: Vec<(ColumnDescriptor, ScanKind)>,
}

impl CoercionPlan {
    pub fn new(columns: &[ColumnDescriptor]) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|c| (c.clone(), ScanKind::for_type_name(&c.type_name)))
                .collect(),
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(c, _)| c.name.clone()).collect()
    }

    /// Coerce a whole row; the first failing column aborts the row
    pub fn coerce_row(&self, row: RawRow) -> Result<Vec<TransportValue>, CoercionError> {
        if row.len() != self.columns.len() {
            return Err(CoercionError {
                column: "*".to_string(),
                type_name: "row".to_string(),
                reason: format!(
                    "expected {} values, got {}",
                    self.columns.len(),
                    row.len()
                ),
            });
        }

        self.columns
            .iter()
            .zip(row)
            .map(|((column, kind), raw)| {
                coerce(*kind, raw).map_err(|reason| CoercionError {
                    column: column.name.clone(),
                    type_name: column.type_name.clone(),
                    reason,
                })
            })
            .collect()
    }
}
