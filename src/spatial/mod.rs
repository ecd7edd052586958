pub mod indexer;

pub use indexer::HexIndexer;
