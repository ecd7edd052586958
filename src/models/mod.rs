pub mod bucket;
pub mod location;
pub mod measurement;
pub mod unified;
pub mod work_unit;

pub use bucket::{AggregationBucket, BucketRecord, BucketStats, StatsAccumulator, BUCKET_HEADER};
pub use location::{Location, Sensor};
pub use measurement::{Measurement, QualityFlag, MEASUREMENT_HEADER};
pub use unified::{ColumnGroup, FillSource, GapFill, GroupValue, UnifiedRow, UnifiedTable};
pub use work_unit::{TruncationReason, UnitOutcome, UnitState, WorkUnit};
