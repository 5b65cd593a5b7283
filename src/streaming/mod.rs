//! Chunk window selection, load lifecycle, and the streaming manager

pub mod window;
pub mod budget;
pub mod lifecycle;
pub mod manager;

pub use window::{WindowConfig, WindowSelector, WantedChunk};
pub use budget::{FrameTimer, LoadBudget};
pub use lifecycle::{ChunkLifecycle, LifecycleStats};
pub use manager::{StreamingManager, StreamerConfig, StreamStats, TickInput};
