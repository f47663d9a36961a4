mod reclaim;
pub mod skiplist;

pub use reclaim::{Cycle, Generation, RealtimeReader, Reclaimer};
pub use skiplist::{Cursor, Editor, NodeId, Position, SkipList, View};
