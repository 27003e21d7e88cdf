//! # World State Module
//!
//! The authoritative world representation and the algorithms that keep its
//! invariants: the sparse block store, content definitions, lighting, liquid
//! settling and block persistence.

pub mod block;
pub mod content;
pub mod lighting;
pub mod liquid;
pub mod map;
pub mod node;
pub mod persistence;
pub mod position;
