pub mod aggregator;
pub mod deduplicator;
pub mod gap_fill;
pub mod unified_builder;

pub use aggregator::{AggregationReport, FileAggregator, HexHourAggregator};
pub use deduplicator::{DedupReport, Deduplicator};
pub use gap_fill::GapFillPlan;
pub use unified_builder::UnifiedBuilder;
