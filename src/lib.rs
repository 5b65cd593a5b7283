//! Worldstream - spatial streaming and prioritized fetch for massive placed-object worlds

pub mod core;
pub mod math;
pub mod fetch;
pub mod world;
pub mod streaming;
pub mod aggregate;
pub mod worker;
