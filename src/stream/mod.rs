//! Realtime stream modules.
//!
//! - `client`: TCP transport, handshake, read-loop worker, and events.
//! - `frame`: reassembly of the raw byte stream into complete XML documents.
//! - `proto`: OCP command encoding and telemetry message decoding.
//! - `session`: higher-level session wrapper that tracks lifecycle state.

/// TCP connection, read-loop worker, and stream events.
pub mod client;
/// Byte-stream reassembly into complete XML documents.
pub mod frame;
/// OCP wire protocol: command encoder and telemetry decoder.
pub mod proto;
/// Session wrapper that tracks lifecycle state and terminal transitions.
pub mod session;
