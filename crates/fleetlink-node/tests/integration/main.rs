//! Integration test entry point for fleetlink-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod lobby;
mod messaging;
mod requests;
