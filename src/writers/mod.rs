pub mod csv_writer;
pub mod parquet_writer;

pub use csv_writer::{read_header, IncrementalCsvWriter};
pub use parquet_writer::{ParquetFileInfo, ParquetWriter};
