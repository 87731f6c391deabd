//! Command implementations.

pub mod graph;
pub mod init;
pub mod retain;
pub mod search;
