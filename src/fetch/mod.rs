//! Prioritized, de-duplicating, cached fetch scheduling

pub mod scheduler;
pub mod source;
pub mod cache;
pub mod decode;
pub mod fetcher;

pub use scheduler::{Lane, SchedulerConfig, TwoLaneScheduler, Permit};
pub use source::{FetchSource, FetchResponse, FileSource, StreamMeta, BoxFuture};
pub use cache::ByteCache;
pub use decode::{Codec, LineDecoder, compress, decompress, is_supported};
pub use fetcher::{Fetcher, FetchKind, RecordStats};
