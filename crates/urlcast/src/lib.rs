//! Public facade crate for `urlcast`.
//!
//! This crate intentionally contains no IO or backend-specific logic.
//! It re-exports the backend-agnostic types/traits from `urlcast-core`.

pub use urlcast_core::*;
