pub mod fetch_loop;
pub mod orchestrator;
pub mod rate_gate;
pub mod retry;
pub mod strategy;
pub mod summary;

pub use fetch_loop::{FetchConfig, PageFetcher, PageStep, UnitTarget};
pub use orchestrator::{DownloadRequest, Orchestrator};
pub use rate_gate::{Credential, Permit, RateGate};
pub use retry::RetryPolicy;
pub use strategy::{choose_strategy, Batching, ExecutionMode, Strategy, WorkloadStats};
pub use summary::RunSummary;
