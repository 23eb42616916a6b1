//! Core of the per-node container log collector: discovers which containers
//! run on the local node, tails their log files with at-least-once delivery
//! across restarts and rotations, and hands parsed lines to an external
//! shipper.
//!
//! The command-line front end, the remote-write transport and the log-store
//! ingest API are treated as external collaborators and live outside this
//! crate's core; see `README`-level docs in `main.rs` for how they're wired
//! together for a standalone binary.

pub mod backoff;
pub mod cli;
pub mod collector;
pub mod concurrency;
pub mod errors;
pub mod k8s;
pub mod node_collector;
pub mod trace;
