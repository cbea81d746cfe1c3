pub mod record;

pub use record::{normalize_line, OrderBookRecord, RecordType, SchemaError};
