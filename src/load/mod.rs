//! Transform and load: typed conversion of extracted files into tables.
//!
//! - `table`: destination layouts and entry classification
//! - `decode`: Latin-1 decoding and field typing
//! - `batch`: bounded row batches
//! - `storage`: the [`Storage`] seam and [`SqliteStorage`]
//! - `stage`: the resumable [`LoadStage`]

mod batch;
mod decode;
mod stage;
mod storage;
mod table;

pub use batch::RowBatch;
pub use decode::{MalformedRecord, Value, convert_record, decode_text};
pub use stage::{FileLoadStats, LoadError, LoadStage, TableLoadReport, TableLoadState};
pub use storage::{SqliteStorage, Storage, StorageError};
pub use table::{
    ColumnSpec, ColumnType, SourceEncoding, TABLES, TableSpec, classify_entry, table_spec,
};
