//! Transport establishment: plain TCP or direct TLS over TCP.
//!
//! Both paths hand back the same boxed byte stream so the run loop never
//! branches on the mode.

use std::io;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::Level;

use crate::config::{ClientOptions, ConnectionParameters, DebugThreshold};
use crate::error::{Error, Result};

/// A connected, bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Coarse class of a TLS handshake failure, for structured logs.
pub(crate) fn classify_handshake_error(detail: &str) -> &'static str {
    if detail.contains("ertificate") {
        "certificate_error"
    } else if detail.contains("timed out") || detail.contains("timeout") {
        "timeout"
    } else if detail.contains("refused") || detail.contains("reset") {
        "connection_refused"
    } else {
        "other"
    }
}

/// The TLS name as a rustls server name (SNI and certificate name check).
pub(crate) fn server_name(tls_name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(tls_name.to_string())
        .map_err(|e| Error::Configuration(format!("invalid server name `{}`: {}", tls_name, e)))
}

async fn connect_tcp(
    params: &ConnectionParameters,
    timeout: Option<Duration>,
    threshold: DebugThreshold,
    mode: &'static str,
) -> Result<TcpStream> {
    let host = params.hostname.as_str();
    let port = params.port;
    let connect = TcpStream::connect((host, port));

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, connect).await {
            Ok(result) => result,
            Err(_) => {
                log_at!(
                    threshold,
                    Level::ERROR,
                    host, port, mode,
                    timeout_ms = limit.as_millis() as u64,
                    "TCP connect timed out"
                );
                return Err(Error::Connect {
                    host: host.to_string(),
                    port,
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {}ms", limit.as_millis()),
                    ),
                });
            }
        },
        None => connect.await,
    };

    result.map_err(|e| {
        log_at!(
            threshold,
            Level::ERROR,
            host, port, mode,
            error = %e, error_kind = ?e.kind(),
            "TCP connect failed"
        );
        Error::Connect {
            host: host.to_string(),
            port,
            source: e,
        }
    })
}

/// Raw TCP connection to `hostname:port`.
pub async fn connect_plain(
    params: &ConnectionParameters,
    options: &ClientOptions,
) -> Result<BoxedStream> {
    let threshold = options.debug_threshold;
    let tcp_stream = connect_tcp(params, options.connect_timeout(), threshold, "plain").await?;
    log_at!(
        threshold,
        Level::INFO,
        host = %params.hostname, port = params.port,
        "Connected (TCP)"
    );
    Ok(Box::new(tcp_stream))
}

/// TCP connection followed by a TLS handshake. SNI and the certificate
/// name check use [`ConnectionParameters::tls_name`].
///
/// The deadline, if any, covers the TCP connect and the handshake each.
pub async fn connect_tls(
    params: &ConnectionParameters,
    connector: &TlsConnector,
    options: &ClientOptions,
) -> Result<BoxedStream> {
    let tls_name = params.tls_name();
    let server_name = server_name(tls_name)?;
    let timeout = options.connect_timeout();
    let threshold = options.debug_threshold;

    let tcp_stream = connect_tcp(params, timeout, threshold, "direct_tls").await?;

    let handshake = connector.connect(server_name, tcp_stream);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handshake).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            )),
        },
        None => handshake.await,
    };

    let tls_stream = result.map_err(|e| {
        let classification = classify_handshake_error(&e.to_string());
        log_at!(
            threshold,
            Level::ERROR,
            host = %params.hostname, tls_name, error = %e,
            error_class = classification,
            "TLS handshake failed"
        );
        Error::Handshake(format!(
            "TLS handshake failed with {} ({}): {}",
            tls_name, classification, e
        ))
    })?;

    log_at!(
        threshold,
        Level::INFO,
        host = %params.hostname, port = params.port, tls_name,
        "Connected (direct TLS)"
    );
    Ok(Box::new(tls_stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Counts every event that reaches the subscriber.
    struct CountEvents(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for CountEvents {
        fn on_event(&self, _event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn closed_port() -> u16 {
        // Bind then drop to get a port with no listener
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Events emitted while a refused plain connect runs under `threshold`.
    fn events_for_refused_connect(threshold: DebugThreshold) -> usize {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(CountEvents(count.clone()));
        let params = ConnectionParameters::new("127.0.0.1", closed_port(), false);
        let options = ClientOptions {
            debug_threshold: threshold,
            ..ClientOptions::default()
        };

        tracing::subscriber::with_default(subscriber, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            assert!(runtime.block_on(connect_plain(&params, &options)).is_err());
        });
        count.load(Ordering::SeqCst)
    }

    #[test]
    fn test_classify_handshake_error() {
        assert_eq!(
            classify_handshake_error("invalid peer certificate: UnknownIssuer"),
            "certificate_error"
        );
        assert_eq!(classify_handshake_error("operation timed out"), "timeout");
        assert_eq!(classify_handshake_error("connection reset by peer"), "connection_refused");
        assert_eq!(classify_handshake_error("unexpected EOF"), "other");
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        let err = server_name("not a name").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConfigurationError);
    }

    #[tokio::test]
    async fn test_connect_plain_refused() {
        let params = ConnectionParameters::new("127.0.0.1", closed_port(), false);
        match connect_plain(&params, &ClientOptions::default()).await {
            Err(e) => assert_eq!(e.kind(), crate::ErrorKind::ConnectFailure),
            Ok(_) => panic!("connect to a closed port succeeded"),
        }
    }

    #[tokio::test]
    async fn test_connect_plain_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let params = ConnectionParameters::new("127.0.0.1", port, false);
        let options = ClientOptions {
            connect_timeout_ms: Some(5_000),
            ..ClientOptions::default()
        };
        let mut stream = connect_plain(&params, &options).await.unwrap();
        stream.write_all(b"<r/>\n").await.unwrap();
        let mut echo = [0u8; 5];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"<r/>\n");
        server.await.unwrap();
    }

    #[test]
    fn test_threshold_gates_events() {
        assert_eq!(events_for_refused_connect(DebugThreshold::None), 0);
        assert_eq!(events_for_refused_connect(DebugThreshold::Error), 1);
    }
}
