// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Client-side session protocol for the tavern broker.
//!
//! The client keeps a local projection of the session's tables, applies
//! inbound reconciliation with `to_server = false` (so server echoes never
//! loop back out), sends user actions through an injected transport
//! callback, and coordinates content-addressed asset transfers through the
//! io book and the local cache.

mod actions;
mod assets;
mod protocol;
mod session;
mod transport;

pub use actions::{ClientActions, table_from_snapshot};
pub use assets::AssetCoordinator;
pub use protocol::ClientProtocol;
pub use session::{ClientSession, Notice, SendFn};
pub use transport::{Transport, TransportError, connect_tcp, connect_websocket};
