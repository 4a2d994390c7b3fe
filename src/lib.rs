//! User-facing Rust SDK for the OMNIA Control Protocol (OCP).
//!
//! OCP is the XML-over-TCP device-control protocol spoken by the OMNIA
//! metabolic measurement system. This crate implements the real-time
//! telemetry surface: it enables the device's telemetry push with a single
//! command handshake, then consumes the unbounded stream of XML status
//! documents the device emits, reassembling them across arbitrary TCP
//! fragmentation and decoding them into typed records.
//!
//! The crate is organized around one transport surface:
//! - `stream`: realtime TCP client, wire protocol, frame reassembly, and
//!   session state helpers.

/// Realtime stream client, protocol types, frame reassembly, and session
/// state helpers.
pub mod stream;
