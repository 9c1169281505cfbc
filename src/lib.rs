//! LoRaWAN Join Server core.
//!
//! The Join Server is the trust anchor for over-the-air activation: it
//! authenticates Join-Requests forwarded by a Network Server, enforces
//! replay protection on device nonces, derives per-session keys and returns
//! an encrypted Join-Accept. Session state is committed through pluggable
//! device and session-key registries.
//!
//! Modules:
//! - [`lorawan`] — MAC frame codec and the AES primitives of the join flow
//! - [`device`] — end-device and session data model
//! - [`registry`] — registry contracts plus an in-memory backend
//! - [`server`] — the join handler and peer key read-back
//! - [`udp`] — datagram control endpoint used by the daemon
//! - [`config`] — TOML configuration

pub mod config;
pub mod device;
pub mod error;
pub mod lorawan;
pub mod registry;
pub mod server;
pub mod udp;
