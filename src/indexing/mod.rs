// Incremental indexing: skip detection, extraction, the per-file
// pipeline, bulk demultiplexing, debounced scheduling, and pruning.

pub mod change;
pub mod debounce;
pub mod docblock;
pub mod extract;
pub mod pipeline;
pub mod project;
pub mod prune;
