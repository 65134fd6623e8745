//! Streamgate Engine
//!
//! The columnar database side of the gateway: an embedded DuckDB executor, the
//! row cursor that query sessions pull from, and the bulk CSV transfer loops.

mod arrow_values;
pub mod cursor;
pub mod executor;
pub mod transfer;

pub use cursor::{ColumnDescriptor, QueryBackend, RawRow, RawValue, RowCursor, RowSender};
pub use executor::{DuckDbExecutor, ExecutorConfig};
pub use transfer::{export_csv, import_csv, TransferKind, TransferProgress};
