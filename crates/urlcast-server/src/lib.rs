//! HTTP service surface for the urlcast resolution pipeline.
//!
//! The binary lives in `main.rs`; everything else is a library so the
//! contract tests can assemble the router against fixture origins.

pub mod app;
pub mod config;
pub mod groupid;
pub mod routes;
