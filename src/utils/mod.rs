pub mod constants;
pub mod coordinates;
pub mod filename;
pub mod progress;
pub mod time;

pub use constants::*;
pub use coordinates::validate_coordinates;
pub use filename::{
    generate_default_bucket_filename, generate_default_unified_filename,
    generate_raw_output_filename, sanitize,
};
pub use progress::ProgressReporter;
pub use time::{floor_to_hour, parse_utc, TimeFeatures};
