//! Connection parameters and engine options.
//!
//! `ConnectionParameters` describes where to connect and whether TLS is
//! required. `ClientOptions` carries the tunables of one engine instance and
//! can be embedded in an application's own (serde) configuration.

use std::time::Duration;

use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::Level;

use crate::framing::DEFAULT_MAX_DEPTH;

/// Default port for plain XMPP client connections (RFC 6120).
pub const DEFAULT_PLAIN_PORT: u16 = 5222;
/// Default port for direct TLS XMPP client connections (XEP-0368).
pub const DEFAULT_TLS_PORT: u16 = 5223;

/// Transport used by a connection. Fixed once a connect succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Plain,
    Tls,
}

/// Where to connect and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// TCP connection target.
    pub hostname: String,
    pub port: u16,
    /// TLS is required: a plain connect is refused.
    pub use_tls: bool,
    /// XMPP domain for TLS SNI and certificate name checks.
    /// When connecting via SRV, `hostname` is the SRV target (e.g., "v4.mdosch.de")
    /// but TLS must use the XMPP domain (e.g., "diebesban.de") per RFC 6120 §13.7.2.
    #[serde(default)]
    pub domain: Option<String>,
}

impl ConnectionParameters {
    pub fn new(hostname: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            use_tls,
            domain: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Returns the name to use for TLS SNI and certificate verification.
    /// Uses the XMPP domain if available, otherwise the hostname.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.hostname)
    }

    pub fn mode(&self) -> TransportMode {
        if self.use_tls {
            TransportMode::Tls
        } else {
            TransportMode::Plain
        }
    }
}

/// Result of parsing a server input string.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerInput {
    /// Explicit endpoint, connect directly.
    Direct(ConnectionParameters),
    /// Domain only, resolve with [`crate::dns::resolve_xmpp_server`].
    Domain(String),
}

/// Extract optional `?domain=` parameter from a URI path.
/// Returns (host_port_part, optional_domain).
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    if let Some((host_port, query)) = input.split_once('?') {
        let domain = query.strip_prefix("domain=").map(|d| d.to_string());
        (host_port, domain)
    } else {
        (input, None)
    }
}

fn split_host_port(host_port: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port_str)) = host_port.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return (host.to_string(), port);
        }
    }
    (host_port.to_string(), default_port)
}

/// Parse a server input string into either explicit parameters or a domain
/// for SRV resolution.
///
/// Supported formats:
/// - `tls://host:port`, `tls://host:port?domain=d`, `tls://host` (port 5223)
/// - `tcp://host:port`, `tcp://host:port?domain=d`, `tcp://host` (port 5222)
/// - `host:port` (port 5223 = TLS, otherwise plain)
/// - `domain` (SRV resolution)
pub fn parse_server_input(server: &str) -> ServerInput {
    let trimmed = server.trim();

    for (scheme, use_tls, default_port) in [
        ("tls://", true, DEFAULT_TLS_PORT),
        ("tcp://", false, DEFAULT_PLAIN_PORT),
    ] {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            let (host_port, domain) = split_domain_param(rest);
            let (host, port) = split_host_port(host_port, default_port);
            return ServerInput::Direct(ConnectionParameters {
                hostname: host,
                port,
                use_tls,
                domain,
            });
        }
    }

    // host:port (no scheme), rsplit_once handles IPv6 addresses
    if let Some((host, port_str)) = trimmed.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return ServerInput::Direct(ConnectionParameters::new(
                host,
                port,
                port == DEFAULT_TLS_PORT,
            ));
        }
    }

    ServerInput::Domain(trimmed.to_string())
}

/// Minimum severity surfaced by the engine's logging.
///
/// `Verbose` additionally logs raw stream traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugThreshold {
    Verbose,
    Debug,
    Warning,
    #[default]
    Error,
    None,
}

impl DebugThreshold {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            DebugThreshold::Verbose => LevelFilter::TRACE,
            DebugThreshold::Debug => LevelFilter::DEBUG,
            DebugThreshold::Warning => LevelFilter::WARN,
            DebugThreshold::Error => LevelFilter::ERROR,
            DebugThreshold::None => LevelFilter::OFF,
        }
    }

    /// Whether events at `level` pass this threshold.
    pub fn enables(self, level: Level) -> bool {
        level <= self.level_filter()
    }

    pub fn logs_traffic(self) -> bool {
        self == DebugThreshold::Verbose
    }
}

/// Tunables of one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub debug_threshold: DebugThreshold,
    /// Capacity of the raw read slot.
    pub read_chunk_size: usize,
    /// Maximum size of the unconsumed stream.
    ///
    /// Data that never forms a complete document would otherwise grow the
    /// buffer without bound. Typical stanzas are a few KB; the largest
    /// legitimate ones (vCard avatars, MAM result pages) rarely exceed 100 KB.
    pub max_buffer_size: usize,
    /// Deepest element nesting accepted in one document. Deeper input is a
    /// malformed stream.
    pub max_depth: usize,
    /// Maximum number of extracted documents awaiting `fetch_document`.
    pub pending_capacity: usize,
    pub connect_timeout_ms: Option<u64>,
    /// Trust the platform's native root certificates.
    pub use_native_roots: bool,
    /// Additional trust anchors (DER).
    #[serde(skip)]
    pub extra_root_certificates: Vec<CertificateDer<'static>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            debug_threshold: DebugThreshold::default(),
            read_chunk_size: 1024,
            max_buffer_size: 1_024 * 1_024,
            max_depth: DEFAULT_MAX_DEPTH,
            pending_capacity: 256,
            connect_timeout_ms: None,
            use_native_roots: true,
            extra_root_certificates: Vec::new(),
        }
    }
}

impl ClientOptions {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(input: &str) -> ConnectionParameters {
        match parse_server_input(input) {
            ServerInput::Direct(params) => params,
            other => panic!("expected direct endpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tls_uri_with_port() {
        let params = direct("tls://chat.example.com:5223");
        assert_eq!(params, ConnectionParameters::new("chat.example.com", 5223, true));
    }

    #[test]
    fn test_parse_tls_uri_no_port() {
        let params = direct("tls://chat.example.com");
        assert_eq!(params.port, DEFAULT_TLS_PORT);
        assert!(params.use_tls);
    }

    #[test]
    fn test_parse_tcp_uri_no_port() {
        let params = direct("tcp://chat.example.com");
        assert_eq!(params.port, DEFAULT_PLAIN_PORT);
        assert!(!params.use_tls);
    }

    #[test]
    fn test_parse_host_port_5223_is_tls() {
        assert!(direct("chat.example.com:5223").use_tls);
        assert!(!direct("chat.example.com:5222").use_tls);
        assert!(!direct("chat.example.com:443").use_tls);
    }

    #[test]
    fn test_parse_tls_uri_with_domain() {
        let params = direct("tls://v6.mdosch.de:5223?domain=diebesban.de");
        assert_eq!(params.hostname, "v6.mdosch.de");
        assert_eq!(params.domain.as_deref(), Some("diebesban.de"));
        assert_eq!(params.tls_name(), "diebesban.de");
    }

    #[test]
    fn test_parse_bare_domain_with_whitespace() {
        assert_eq!(
            parse_server_input("  example.com \n"),
            ServerInput::Domain("example.com".to_string())
        );
    }

    #[test]
    fn test_tls_name_without_domain() {
        let params = ConnectionParameters::new("chat.example.com", 5223, true);
        assert_eq!(params.tls_name(), "chat.example.com");
    }

    #[test]
    fn test_split_domain_param_unknown_param() {
        let (host_port, domain) = split_domain_param("host:5223?other=value");
        assert_eq!(host_port, "host:5223");
        assert_eq!(domain, None);
    }

    #[test]
    fn test_options_deserialize_partial() {
        let options: ClientOptions =
            serde_json::from_str(r#"{"debug_threshold":"verbose","pending_capacity":4}"#).unwrap();
        assert_eq!(options.debug_threshold, DebugThreshold::Verbose);
        assert_eq!(options.pending_capacity, 4);
        assert_eq!(options.read_chunk_size, 1024);
        assert!(options.use_native_roots);
        assert_eq!(options.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(options.connect_timeout(), None);
    }

    #[test]
    fn test_threshold_ordering() {
        assert!(DebugThreshold::Verbose < DebugThreshold::Error);
        assert_eq!(DebugThreshold::None.level_filter(), LevelFilter::OFF);
        assert!(DebugThreshold::Verbose.logs_traffic());
        assert!(!DebugThreshold::Debug.logs_traffic());
    }

    #[test]
    fn test_threshold_enables() {
        assert!(DebugThreshold::Error.enables(Level::ERROR));
        assert!(!DebugThreshold::Error.enables(Level::WARN));
        assert!(DebugThreshold::Warning.enables(Level::WARN));
        assert!(!DebugThreshold::Warning.enables(Level::INFO));
        assert!(DebugThreshold::Debug.enables(Level::DEBUG));
        assert!(!DebugThreshold::Debug.enables(Level::TRACE));
        assert!(DebugThreshold::Verbose.enables(Level::TRACE));
        assert!(!DebugThreshold::None.enables(Level::ERROR));
    }
}
