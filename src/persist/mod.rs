mod engine;
mod format;

pub use engine::{
    ensure_store_file, load, load_or_empty, write_snapshot, FlushHandle, FlushStats,
    PersistenceEngine,
};
pub use format::{decode, encode, PersistedEntry};
