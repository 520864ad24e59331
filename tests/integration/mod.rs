//! Integration tests for quic-dispatcher
//!
//! These tests drive the router through its public API only, with
//! recording collaborators standing in for the QUIC transport.
//!
//! # Test Organization
//!
//! - `common`: packet builders, recording writer/sessions, manual validator
//! - `scenarios`: end-to-end admission, rejection and expiry flows
//! - `admission`: buffered store caps, accept toggle, session allowance
//! - `time_wait`: back-off, budget, capacity, retention, stateless resets
//! - `ordering`: delivery order and write-blocked servicing
//! - `server`: the tokio event loop on a loopback socket
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test integration_tests
//! cargo test --test integration_tests time_wait
//! ```

pub mod common;

pub mod admission;
pub mod ordering;
pub mod scenarios;
pub mod server;
pub mod time_wait;
