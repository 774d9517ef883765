//! The devbar runtime: the page-side half of the bridge.
//!
//! Owns the connection state machine, the console capture ring, and the
//! command handlers. DOM access goes through the [`page::PageDriver`] seam;
//! the in-page UI that renders connection status and notifications lives
//! with the consuming application, not here.

pub mod connection;
pub mod console;
pub mod handlers;
pub mod page;

pub use connection::{ConnectionState, DevbarBridge};
pub use console::{ConsoleRing, CONSOLE_RING_CAP};
pub use handlers::CommandHandlers;
pub use page::{Capture, CaptureOptions, DomMatch, ImageFormat, PageDriver, PageError};
