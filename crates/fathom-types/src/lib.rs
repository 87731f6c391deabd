//! Core types and traits for the Fathom memory graph.
//!
//! This crate defines the shared data model (facts, entities, links), search
//! request/response shapes, configuration, the error type, and the traits for
//! the external providers the core consumes. It contains no business logic.

pub mod config;
pub mod error;
pub mod memory;
pub mod provider;
pub mod search;
