//! The I/O worker: establishes the transport, then moves bytes between the
//! socket, the read buffer and the outbound queue until stopped or failed.
//!
//! Once connected, reading and writing run as two tasks on the worker's
//! runtime, so a read is always pending while a write waits on the peer.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinError;
use tokio_rustls::TlsConnector;
use tracing::Level;

use crate::buffer::ReadBuffer;
use crate::config::{ClientOptions, ConnectionParameters, TransportMode};
use crate::error::{Error, Result};
use crate::framing::try_extract;
use crate::transport::{self, BoxedStream};

use super::Shared;

/// Upper bound on the close_notify / FIN exchange after a stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// What the reader and writer tasks of one connection share.
pub(crate) struct Link {
    pub params: ConnectionParameters,
    pub mode: TransportMode,
    pub options: ClientOptions,
    pub shared: Arc<Shared>,
    /// Cleared by teardown; no callback fires once it is false.
    pub active: Arc<AtomicBool>,
}

/// Everything one connection's worker thread owns.
pub(crate) struct Connection {
    pub link: Arc<Link>,
    /// Present for TLS connections.
    pub connector: Option<TlsConnector>,
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pub stop: oneshot::Receiver<()>,
    pub ready: std_mpsc::Sender<Result<()>>,
}

/// How a connected session ended.
enum Exit {
    Stopped,
    Failed(Error),
}

impl Link {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn fail(&self, err: &Error) {
        log_at!(
            self.options.debug_threshold,
            Level::ERROR,
            host = %self.params.hostname,
            port = self.params.port,
            mode = ?self.mode,
            error = %err,
            error_kind = ?err.kind(),
            "Connection failed"
        );
        if self.is_active() {
            self.shared.fail(err);
        }
    }

    async fn establish(&self, connector: Option<&TlsConnector>) -> Result<BoxedStream> {
        match (self.mode, connector) {
            (TransportMode::Plain, _) => transport::connect_plain(&self.params, &self.options).await,
            (TransportMode::Tls, Some(connector)) => {
                transport::connect_tls(&self.params, connector, &self.options).await
            }
            (TransportMode::Tls, None) => Err(Error::Configuration(
                "TLS connection requested without a TLS connector".to_string(),
            )),
        }
    }

    fn log_traffic(&self, direction: &'static str, bytes: &[u8]) {
        if self.options.debug_threshold.logs_traffic() {
            log_at!(
                self.options.debug_threshold,
                Level::TRACE,
                direction,
                data = %String::from_utf8_lossy(bytes),
                "Traffic"
            );
        }
    }

    /// Frames everything the stream holds. Returns the number of documents
    /// queued.
    fn drain_documents(&self, buffer: &mut ReadBuffer) -> Result<usize> {
        let mut extracted = 0;
        while let Some(document) = try_extract(buffer.active_stream(), self.options.max_depth)? {
            extracted += 1;
            log_at!(
                self.options.debug_threshold,
                Level::DEBUG,
                root = %document.root().name(),
                kind = ?document.kind(),
                remaining = buffer.len(),
                "Extracted document"
            );
            if self.is_active() {
                self.shared.push_document(document);
                self.shared.notify_data();
            }
        }

        if buffer.len() > self.options.max_buffer_size {
            return Err(Error::MalformedStream(format!(
                "{} unframed bytes exceed the {} byte limit",
                buffer.len(),
                self.options.max_buffer_size
            )));
        }
        Ok(extracted)
    }
}

/// Reads until the peer closes, the transport fails or the stream turns out
/// malformed.
async fn read_stream(link: Arc<Link>, mut reader: ReadHalf<BoxedStream>) -> Exit {
    let threshold = link.options.debug_threshold;
    let mut buffer = ReadBuffer::new(link.options.read_chunk_size);
    if let Err(e) = buffer.bind(link.mode) {
        return Exit::Failed(e);
    }

    loop {
        let n = match reader.read(buffer.active_raw_slot()).await {
            Ok(0) => {
                log_at!(
                    threshold,
                    Level::INFO,
                    host = %link.params.hostname,
                    "Connection closed by peer"
                );
                return Exit::Failed(Error::Read(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            Ok(n) => n,
            Err(e) => return Exit::Failed(Error::Read(e)),
        };

        buffer.commit(n);
        link.log_traffic("in", &buffer.active_raw_slot()[..n]);
        match link.drain_documents(&mut buffer) {
            Ok(extracted) => log_at!(
                threshold,
                Level::DEBUG,
                bytes = n,
                extracted,
                buffered = buffer.len(),
                "Read processed"
            ),
            Err(e) => {
                buffer.clear();
                return Exit::Failed(e);
            }
        }
    }
}

/// Sends queued bytes in order until the queue closes or a write fails.
async fn write_outbound(
    link: Arc<Link>,
    writer: Arc<Mutex<WriteHalf<BoxedStream>>>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Exit {
    while let Some(bytes) = outbound.recv().await {
        link.log_traffic("out", &bytes);
        let mut writer = writer.lock().await;
        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            return Exit::Failed(Error::Write(e));
        }
        log_at!(
            link.options.debug_threshold,
            Level::DEBUG,
            bytes = bytes.len(),
            "Write completed"
        );
    }
    Exit::Stopped
}

fn joined(
    result: std::result::Result<Exit, JoinError>,
    task: &str,
    wrap: fn(io::Error) -> Error,
) -> Exit {
    result.unwrap_or_else(|e| {
        let source = io::Error::new(io::ErrorKind::Other, format!("{} task failed: {}", task, e));
        Exit::Failed(wrap(source))
    })
}

/// Runs the reader and writer until one of them ends or `stop` fires. The
/// first failure wins; the other task is aborted without reporting.
async fn session(
    link: Arc<Link>,
    stream: BoxedStream,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: &mut oneshot::Receiver<()>,
) -> Exit {
    let (reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));

    let mut reading = tokio::spawn(read_stream(link.clone(), reader));
    let mut writing = tokio::spawn(write_outbound(link.clone(), writer.clone(), outbound));

    let exit = tokio::select! {
        _ = &mut *stop => Exit::Stopped,
        result = &mut reading => joined(result, "reader", Error::Read),
        result = &mut writing => joined(result, "writer", Error::Write),
    };

    // Abort both tasks so they don't linger holding the stream halves
    reading.abort();
    writing.abort();

    if let Exit::Stopped = exit {
        // Best effort: TLS close_notify or TCP FIN
        let shutdown = async { writer.lock().await.shutdown().await };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_at!(
                link.options.debug_threshold,
                Level::DEBUG,
                error = %e,
                "Shutdown of write half failed"
            ),
            Err(_) => log_at!(
                link.options.debug_threshold,
                Level::DEBUG,
                "Shutdown of write half timed out"
            ),
        }
    }
    exit
}

/// Runs a connected session to its end and reports a failure once.
async fn drive(
    link: Arc<Link>,
    stream: BoxedStream,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: &mut oneshot::Receiver<()>,
) {
    match session(link.clone(), stream, outbound, stop).await {
        Exit::Stopped => log_at!(
            link.options.debug_threshold,
            Level::INFO,
            host = %link.params.hostname,
            "I/O loop stopped"
        ),
        Exit::Failed(err) => link.fail(&err),
    }
}

/// Worker thread entry point.
pub(crate) fn run(conn: Connection) {
    let Connection {
        link,
        connector,
        outbound,
        mut stop,
        ready,
    } = conn;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let err = Error::Connect {
                host: link.params.hostname.clone(),
                port: link.params.port,
                source: e,
            };
            link.fail(&err);
            let _ = ready.send(Err(err));
            return;
        }
    };

    runtime.block_on(async move {
        // Teardown may arrive while the connect or handshake is in flight
        let established = tokio::select! {
            _ = &mut stop => None,
            result = link.establish(connector.as_ref()) => Some(result),
        };

        let stream = match established {
            None => {
                log_at!(
                    link.options.debug_threshold,
                    Level::DEBUG,
                    host = %link.params.hostname,
                    "Connect cancelled by teardown"
                );
                let _ = ready.send(Err(Error::not_connected()));
                return;
            }
            Some(Err(err)) => {
                link.fail(&err);
                let _ = ready.send(Err(err));
                return;
            }
            Some(Ok(stream)) => stream,
        };

        link.shared.connected();
        log_at!(
            link.options.debug_threshold,
            Level::INFO,
            host = %link.params.hostname,
            port = link.params.port,
            mode = ?link.mode,
            "Stream established"
        );
        if ready.send(Ok(())).is_err() {
            return;
        }

        drive(link, stream, outbound, &mut stop).await;
    });
}
