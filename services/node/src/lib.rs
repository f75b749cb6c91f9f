//! # Placenet Node
//!
//! Demo template table and the process runners used by the
//! `placenet-node` binary.

pub mod demo;
pub mod runner;
