//! Arrow → driver value extraction
//!
//! DuckDB hands results over as Arrow record batches. This module names each
//! Arrow column type in the columnar type vocabulary the gateway coerces on
//! (`UInt8`, `Int64`, `Float32`, `String`, `Date`, `DateTime`, ...) and pulls
//! single cells out as [`RawValue`]s.
//!
//! | Arrow Type             | Declared type name | Raw value   |
//! |------------------------|--------------------|-------------|
//! | Int8-Int64             | Int8-Int64         | Signed      |
//! | UInt8-UInt64           | UInt8-UInt64       | Unsigned    |
//! | Float32/Float64        | Float32/Float64    | Float32/64  |
//! | Utf8/LargeUtf8/View    | String             | Text        |
//! | Date32/Date64          | Date               | Date        |
//! | Timestamp(any unit)    | DateTime           | Timestamp   |
//! | Boolean                | Bool               | Boolean     |
//! | anything else          | descriptive name   | Other(text) |

use crate::cursor::{ColumnDescriptor, RawRow, RawValue};
use chrono::{DateTime, NaiveDate};
use duckdb::arrow::array::{
    Array, BooleanArray, Date32Array, Date64Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, LargeStringArray, RecordBatch, StringArray,
    StringViewArray, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray, UInt16Array, UInt32Array, UInt64Array,
    UInt8Array,
};
use duckdb::arrow::datatypes::{DataType, Schema, TimeUnit};
use duckdb::arrow::util::display::ArrayFormatter;

/// Days from 0001-01-01 (CE day 1) to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Downcast and read one cell, `None` if the array is not of the expected type
macro_rules! cell {
    ($array:expr, $ty:ty, $idx:expr) => {
        $array.as_any().downcast_ref::<$ty>().map(|a| a.value($idx))
    };
}

/// Name an Arrow data type the way the columnar database declares it
pub fn declared_type_name(data_type: &DataType) -> String {
    match data_type {
        DataType::Int8 => "Int8".into(),
        DataType::Int16 => "Int16".into(),
        DataType::Int32 => "Int32".into(),
        DataType::Int64 => "Int64".into(),
        DataType::UInt8 => "UInt8".into(),
        DataType::UInt16 => "UInt16".into(),
        DataType::UInt32 => "UInt32".into(),
        DataType::UInt64 => "UInt64".into(),
        DataType::Float32 => "Float32".into(),
        DataType::Float64 => "Float64".into(),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "String".into(),
        DataType::Date32 | DataType::Date64 => "Date".into(),
        DataType::Timestamp(_, _) => "DateTime".into(),
        DataType::Boolean => "Bool".into(),
        DataType::Decimal128(precision, scale) | DataType::Decimal256(precision, scale) => {
            format!("Decimal({}, {})", precision, scale)
        }
        DataType::Binary | DataType::LargeBinary | DataType::BinaryView => "Binary".into(),
        DataType::FixedSizeBinary(width) => format!("FixedBinary({})", width),
        DataType::Null => "Nothing".into(),
        other => format!("{:?}", other),
    }
}

/// Column descriptors for a result schema
pub fn describe_schema(schema: &Schema) -> Vec<ColumnDescriptor> {
    schema
        .fields()
        .iter()
        .map(|field| ColumnDescriptor::new(field.name().clone(), declared_type_name(field.data_type())))
        .collect()
}

/// Extract one row of a record batch
pub fn batch_row(batch: &RecordBatch, row_idx: usize) -> RawRow {
    batch
        .columns()
        .iter()
        .map(|column| raw_value(column.as_ref(), row_idx))
        .collect()
}

/// Extract a single cell as a driver value
pub fn raw_value(array: &dyn Array, row_idx: usize) -> RawValue {
    if array.is_null(row_idx) || array.data_type() == &DataType::Null {
        return RawValue::Null;
    }

    let value = match array.data_type() {
        DataType::Int8 => cell!(array, Int8Array, row_idx).map(|v| RawValue::Signed(v.into())),
        DataType::Int16 => cell!(array, Int16Array, row_idx).map(|v| RawValue::Signed(v.into())),
        DataType::Int32 => cell!(array, Int32Array, row_idx).map(|v| RawValue::Signed(v.into())),
        DataType::Int64 => cell!(array, Int64Array, row_idx).map(RawValue::Signed),
        DataType::UInt8 => cell!(array, UInt8Array, row_idx).map(|v| RawValue::Unsigned(v.into())),
        DataType::UInt16 => {
            cell!(array, UInt16Array, row_idx).map(|v| RawValue::Unsigned(v.into()))
        }
        DataType::UInt32 => {
            cell!(array, UInt32Array, row_idx).map(|v| RawValue::Unsigned(v.into()))
        }
        DataType::UInt64 => cell!(array, UInt64Array, row_idx).map(RawValue::Unsigned),
        DataType::Float32 => cell!(array, Float32Array, row_idx).map(RawValue::Float32),
        DataType::Float64 => cell!(array, Float64Array, row_idx).map(RawValue::Float64),
        DataType::Boolean => cell!(array, BooleanArray, row_idx).map(RawValue::Boolean),
        DataType::Utf8 => cell!(array, StringArray, row_idx).map(|v| RawValue::Text(v.to_string())),
        DataType::LargeUtf8 => {
            cell!(array, LargeStringArray, row_idx).map(|v| RawValue::Text(v.to_string()))
        }
        DataType::Utf8View => {
            cell!(array, StringViewArray, row_idx).map(|v| RawValue::Text(v.to_string()))
        }
        DataType::Date32 => cell!(array, Date32Array, row_idx)
            .and_then(|days| days.checked_add(UNIX_EPOCH_DAYS_FROM_CE))
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .map(RawValue::Date),
        DataType::Date64 => cell!(array, Date64Array, row_idx)
            .and_then(DateTime::from_timestamp_millis)
            .map(|ts| RawValue::Date(ts.date_naive())),
        DataType::Timestamp(unit, _) => timestamp_value(array, row_idx, unit),
        _ => None,
    };

    value.unwrap_or_else(|| RawValue::Other(format_fallback(array, row_idx)))
}

/// Timestamps are stored as UTC offsets from the epoch in every unit
fn timestamp_value(array: &dyn Array, row_idx: usize, unit: &TimeUnit) -> Option<RawValue> {
    let ts = match unit {
        TimeUnit::Second => {
            cell!(array, TimestampSecondArray, row_idx).and_then(|v| DateTime::from_timestamp(v, 0))
        }
        TimeUnit::Millisecond => cell!(array, TimestampMillisecondArray, row_idx)
            .and_then(DateTime::from_timestamp_millis),
        TimeUnit::Microsecond => cell!(array, TimestampMicrosecondArray, row_idx)
            .and_then(DateTime::from_timestamp_micros),
        TimeUnit::Nanosecond => {
            cell!(array, TimestampNanosecondArray, row_idx).map(DateTime::from_timestamp_nanos)
        }
    };
    ts.map(RawValue::Timestamp)
}

/// Arrow's display formatter handles every remaining type (decimals, lists, structs, ...)
fn format_fallback(array: &dyn Array, row_idx: usize) -> String {
    match ArrayFormatter::try_new(array, &Default::default()) {
        Ok(formatter) => formatter.value(row_idx).to_string(),
        Err(_) => format!("<{:?}>", array.data_type()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckdb::arrow::array::{ArrayRef, Decimal128Array};
    use duckdb::arrow::datatypes::Field;
    use std::sync::Arc;

    #[test]
    fn test_declared_type_names() {
        assert_eq!(declared_type_name(&DataType::UInt8), "UInt8");
        assert_eq!(declared_type_name(&DataType::Int64), "Int64");
        assert_eq!(declared_type_name(&DataType::Float32), "Float32");
        assert_eq!(declared_type_name(&DataType::Utf8), "String");
        assert_eq!(declared_type_name(&DataType::Utf8View), "String");
        assert_eq!(declared_type_name(&DataType::Date32), "Date");
        assert_eq!(
            declared_type_name(&DataType::Timestamp(TimeUnit::Microsecond, None)),
            "DateTime"
        );
        assert_eq!(declared_type_name(&DataType::Decimal128(18, 3)), "Decimal(18, 3)");
        assert_eq!(declared_type_name(&DataType::Boolean), "Bool");
    }

    #[test]
    fn test_extract_row_values() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("day", DataType::Date32, true),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(vec![7, -3])),
            Arc::new(StringArray::from(vec![Some("alpha"), None])),
            Arc::new(Date32Array::from(vec![Some(19_723), Some(0)])),
        ];
        let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();

        let descriptors = describe_schema(&schema);
        assert_eq!(descriptors[0], ColumnDescriptor::new("id", "Int32"));
        assert_eq!(descriptors[2], ColumnDescriptor::new("day", "Date"));

        assert_eq!(
            batch_row(&batch, 0),
            vec![
                RawValue::Signed(7),
                RawValue::Text("alpha".into()),
                RawValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            ]
        );
        assert_eq!(
            batch_row(&batch, 1),
            vec![
                RawValue::Signed(-3),
                RawValue::Null,
                RawValue::Date(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
            ]
        );
    }

    #[test]
    fn test_timestamp_units() {
        let array = TimestampMillisecondArray::from(vec![1_700_000_000_123]);
        let expected = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(raw_value(&array, 0), RawValue::Timestamp(expected));
    }

    #[test]
    fn test_decimal_falls_back_to_text() {
        let array = Decimal128Array::from(vec![12345_i128])
            .with_precision_and_scale(10, 2)
            .unwrap();
        assert_eq!(raw_value(&array, 0), RawValue::Other("123.45".into()));
    }
}
