//! Natschan - NATS channel dispatcher
//!
//! Bridges a durable NATS-backed broker to a dynamic set of HTTP
//! subscribers declared by higher-level channel resources. The dispatcher
//! keeps one durable broker subscription per declared subscriber, forwards
//! every received message over HTTP with optional reply and dead-letter
//! routing, and reports per-subscriber readiness back to the caller.

pub mod broker;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod forwarder;
