//! # Core Module
//!
//! Fundamental concurrency and container primitives used throughout the
//! server. The world simulation shares large structures (the block map, map
//! blocks themselves) between the simulation thread and emerge workers, so
//! everything here is built around cheap reference-counted sharing with
//! explicit lock guards.
//!
//! ## Key Components
//! - `MtResource`: Thread-safe reference-counted resource with read-write locking
//! - `UniqueQueue`: FIFO queue that silently ignores duplicate insertions

pub mod mt_resource;
pub mod unique_queue;

pub use mt_resource::MtResource;
pub use unique_queue::UniqueQueue;
