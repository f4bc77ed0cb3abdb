//! High-level client API
//!
//! Parses the connection string, merges [`ClientOptions`], and wires the
//! certificate store, connector, pools and topology monitor together.

#[allow(clippy::module_inception)]
mod client;
mod connection_string;
mod options;
mod read_preference;

pub use client::Client;
pub use connection_string::{ConnectionInfo, SCHEME};
pub use options::{ClientOptions, ClientOptionsBuilder, DEFAULT_SERVER_SELECTION_TIMEOUT};
pub use read_preference::{ReadPreference, LATENCY_WINDOW};
