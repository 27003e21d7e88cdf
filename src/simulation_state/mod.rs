//! # Simulation State Module
//!
//! The per-tick layer driving the world: the active object registry, the
//! active block modifier scheduler and its growth rules, the asynchronous
//! emerge pipeline, and the environment that sequences them all from the
//! simulation thread.

pub mod abm;
pub mod emerge;
pub mod environment;
pub mod objects;
