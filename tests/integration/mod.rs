//! Integration test suite for keel.
//!
//! These tests drive whole sessions through the public API with scripted
//! executors, so no external command is ever run.
//!
//! # Test Categories
//!
//! - `scenarios`: end-to-end sessions (allocation, failure propagation,
//!   spirals, budget exhaustion, parallel dispatch)
//! - `recovery`: checkpointing, cancellation and resume
//! - `properties`: property tests over graphs, budgets and commitment

mod fixtures;

mod properties;
mod recovery;
mod scenarios;
