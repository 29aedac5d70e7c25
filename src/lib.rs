//! Transport and framing engine for streaming XML (XMPP) client connections.
//!
//! An [`XmlStreamClient`] owns one plain or TLS connection, accumulates what
//! the server sends, cuts it into complete XML documents and hands them out
//! through a non-blocking fetch. I/O runs on a background worker thread;
//! the caller is told about new documents and failures through callbacks.
//!
//! ```no_run
//! use fluux_xmlstream::{ClientOptions, ConnectionParameters, TrustPolicy, XmlStreamClient};
//!
//! let params = ConnectionParameters::new("xmpp.example.com", 5223, true);
//! let client = XmlStreamClient::new(
//!     params,
//!     TrustPolicy::default(),
//!     ClientOptions::default(),
//!     |err| eprintln!("stream failed: {}", err),
//!     || {},
//! );
//! client.connect()?;
//! client.write_text("<stream:stream to='example.com' xmlns='jabber:client' \
//!     xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>")?;
//! while let Some(document) = client.fetch_document() {
//!     println!("{}", document.to_xml());
//! }
//! # Ok::<(), fluux_xmlstream::Error>(())
//! ```

/// Emits a `tracing` event only if the connection's [`DebugThreshold`] lets
/// its level through.
macro_rules! log_at {
    ($threshold:expr, $level:expr, $($arg:tt)+) => {
        if $threshold.enables($level) {
            ::tracing::event!($level, $($arg)+);
        }
    };
}

pub mod buffer;
pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod framing;
pub mod logging;
pub mod state;
pub mod transport;
pub mod trust;
pub mod xml;

pub use client::XmlStreamClient;
pub use config::{
    parse_server_input, ClientOptions, ConnectionParameters, DebugThreshold, ServerInput,
    TransportMode,
};
pub use error::{Error, ErrorKind, Result};
pub use state::ConnectionState;
pub use trust::{CertificateChain, TrustEvaluator, TrustPolicy};
pub use xml::{Document, DocumentKind, Element, Node};
