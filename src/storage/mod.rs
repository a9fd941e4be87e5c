pub mod checkpoint;
pub mod disk;
pub mod sink;

pub use checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore, MemoryCheckpointStore};
pub use disk::{DiskCheckpointStore, RawArchive};
pub use sink::{HarvestedItem, ItemBatch, ItemSink, JsonLinesSink, MemorySink};
