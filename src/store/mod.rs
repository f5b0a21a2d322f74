pub mod chunk;
pub mod chunk_store;
pub mod persistent;

pub use chunk::Chunk;
pub use chunk_store::{ChunkStore, MergeOutcome, RangeRead, SeriesStats, SymbolMetadata};
pub use persistent::{FileStore, MemoryStore, PersistentStore};
