#![allow(missing_docs)] // TODO: enforce once the wire protocol stabilises

//! Sweetlink — localhost development bridge.
//!
//! A WebSocket server that lets a command-line tool drive an open browser
//! page: take screenshots, query the DOM, stream console logs, execute
//! snippets, and persist artifacts into the developer's project tree.
//!
//! The crate has two halves:
//! - [`bridge`] — the server: port discovery, peer classification, command
//!   routing, pub/sub fan-out, and artifact persistence.
//! - [`devbar`] — the page-side runtime: multi-port scanning, verification
//!   handshake, reconnect with backoff, console capture, command handlers.

pub mod bridge;
pub mod config;
pub mod devbar;
pub mod logging;
pub mod persist;
pub mod protocol;
pub mod types;
