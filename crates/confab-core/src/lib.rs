//! confab-core — shared library for multicast E2EE group calls.
//!
//! # Architecture (Clean Architecture)
//!
//! - **domain**: wire messages, media framing, roster types (no I/O).
//! - **application**: registry, trackers, rate control, session state,
//!   port traits.
//! - **adapters**: JSON stream codec, crypto (X25519 + ChaCha20-Poly1305),
//!   directory server and peer engine (Tokio).

pub mod adapters;
pub mod application;
pub mod domain;
