pub mod parquet;

pub use parquet::{count_rows, DayFileWriter};
