pub mod bucket_reader;
pub mod measurement_reader;

pub use bucket_reader::BucketReader;
pub use measurement_reader::{MeasurementReader, ReadStats};
