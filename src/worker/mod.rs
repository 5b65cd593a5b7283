//! Background worker offload with correlation ids and crash fallback

pub mod coordinator;

pub use coordinator::{
    default_handler, AggregateSummary, HandlerFn, Job, JobId, JobOutput, WorkerCoordinator,
};
