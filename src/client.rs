//! The XML stream engine.
//!
//! [`XmlStreamClient`] owns one connection. Connecting spawns a named worker
//! thread running a current-thread tokio runtime; the worker reports the
//! connect outcome back synchronously and then runs the I/O loop. Completed
//! documents are queued for [`XmlStreamClient::fetch_document`] and announced
//! through the data callback. Failures move the engine to
//! [`ConnectionState::Error`] and are announced through the error callback.
//!
//! Both callbacks run on the worker thread. They may call back into the
//! engine, including [`XmlStreamClient::teardown`].

mod io;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::Level;

use crate::config::{ClientOptions, ConnectionParameters, DebugThreshold, TransportMode};
use crate::error::{Error, Result};
use crate::state::{ConnectionState, Transition};
use crate::transport;
use crate::trust::{create_tls_connector, TrustEvaluator, TrustPolicy};
use crate::xml::{Document, Element, Path};

const WORKER_THREAD_NAME: &str = "fluux-xmlstream-io";

pub type ErrorCallback = dyn Fn(&Error) + Send + Sync;
pub type DataCallback = dyn Fn() + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the caller's thread and the worker.
pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    pending: Mutex<VecDeque<Document>>,
    last_fetched: Mutex<Option<Document>>,
    pending_capacity: usize,
    threshold: DebugThreshold,
    on_error: Box<ErrorCallback>,
    on_data: Box<DataCallback>,
}

impl Shared {
    fn transition(&self, transition: Transition) -> ConnectionState {
        let mut state = lock(&self.state);
        *state = state.apply(transition);
        *state
    }

    pub(crate) fn connected(&self) {
        self.transition(Transition::Established);
    }

    /// Moves to `Error` and fires the error callback.
    pub(crate) fn fail(&self, err: &Error) {
        self.transition(Transition::Failed);
        (self.on_error)(err);
    }

    pub(crate) fn push_document(&self, document: Document) {
        let mut pending = lock(&self.pending);
        if pending.len() >= self.pending_capacity {
            if let Some(dropped) = pending.pop_front() {
                log_at!(
                    self.threshold,
                    Level::WARN,
                    capacity = self.pending_capacity,
                    dropped = %dropped.root().name(),
                    "Pending document queue full, dropping oldest document"
                );
            }
        }
        pending.push_back(document);
    }

    pub(crate) fn notify_data(&self) {
        (self.on_data)();
    }
}

/// Handle on a running worker thread.
struct Worker {
    thread: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    active: Arc<AtomicBool>,
    threshold: DebugThreshold,
}

impl Worker {
    /// Stops the I/O loop and waits for the worker to exit. On the worker
    /// thread itself the thread is detached instead.
    fn stop(mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                log_at!(
                    self.threshold,
                    Level::DEBUG,
                    "Teardown requested from the I/O thread, detaching"
                );
                return;
            }
            if thread.join().is_err() {
                log_at!(self.threshold, Level::ERROR, "I/O thread panicked");
            }
        }
    }
}

/// Streaming XML connection with a synchronous fetch surface.
pub struct XmlStreamClient {
    params: ConnectionParameters,
    evaluator: Arc<TrustEvaluator>,
    options: ClientOptions,
    shared: Arc<Shared>,
    /// Locked by the first successful connect.
    mode: Mutex<Option<TransportMode>>,
    worker: Mutex<Option<Worker>>,
    /// Held for the whole of a connect attempt.
    connecting: Mutex<()>,
}

impl XmlStreamClient {
    pub fn new<E, D>(
        params: ConnectionParameters,
        trust_policy: TrustPolicy,
        options: ClientOptions,
        on_error: E,
        on_data: D,
    ) -> Self
    where
        E: Fn(&Error) + Send + Sync + 'static,
        D: Fn() + Send + Sync + 'static,
    {
        let evaluator = Arc::new(TrustEvaluator::new(trust_policy, params.tls_name()));
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState::Disconnected),
            pending: Mutex::new(VecDeque::new()),
            last_fetched: Mutex::new(None),
            pending_capacity: options.pending_capacity.max(1),
            threshold: options.debug_threshold,
            on_error: Box::new(on_error),
            on_data: Box::new(on_data),
        });

        Self {
            params,
            evaluator,
            options,
            shared,
            mode: Mutex::new(None),
            worker: Mutex::new(None),
            connecting: Mutex::new(()),
        }
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    /// Connects with plain TCP. Refused when the parameters require TLS.
    pub fn connect_plain(&self) -> Result<()> {
        if self.params.use_tls {
            return Err(Error::Configuration(
                "TLS is required for this connection, refusing plain connect".to_string(),
            ));
        }
        self.connect_with(TransportMode::Plain)
    }

    /// Connects with TLS directly over TCP.
    pub fn connect_tls(&self) -> Result<()> {
        self.connect_with(TransportMode::Tls)
    }

    /// Connects in the mode the parameters ask for.
    pub fn connect(&self) -> Result<()> {
        match self.params.mode() {
            TransportMode::Tls => self.connect_tls(),
            TransportMode::Plain => self.connect_plain(),
        }
    }

    /// One connect at a time: a concurrent attempt is refused rather than
    /// queued, so a callback fired during a connect cannot wait on it.
    fn connect_with(&self, mode: TransportMode) -> Result<()> {
        let _connecting = match self.connecting.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(Error::Configuration(
                    "a connect is already in progress".to_string(),
                ))
            }
        };

        if let Some(bound) = *lock(&self.mode) {
            if bound != mode {
                return Err(Error::Configuration(format!(
                    "connection already used {:?}, cannot switch to {:?}",
                    bound, mode
                )));
            }
        }
        if self.current_state().is_connected() {
            return Err(Error::Configuration("already connected".to_string()));
        }

        // Leftovers of a failed or closed connection
        let previous = lock(&self.worker).take();
        if let Some(previous) = previous {
            previous.stop();
        }

        let connector = match mode {
            TransportMode::Tls => {
                transport::server_name(self.params.tls_name())?;
                Some(create_tls_connector(self.evaluator.clone(), &self.options)?)
            }
            TransportMode::Plain => None,
        };

        let threshold = self.options.debug_threshold;
        log_at!(
            threshold,
            Level::INFO,
            host = %self.params.hostname,
            port = self.params.port,
            mode = ?mode,
            tls_name = self.params.tls_name(),
            "Connecting"
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let active = Arc::new(AtomicBool::new(true));

        let connection = io::Connection {
            link: Arc::new(io::Link {
                params: self.params.clone(),
                mode,
                options: self.options.clone(),
                shared: self.shared.clone(),
                active: active.clone(),
            }),
            connector,
            outbound: outbound_rx,
            stop: stop_rx,
            ready: ready_tx,
        };

        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || io::run(connection));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                let err = Error::Connect {
                    host: self.params.hostname.clone(),
                    port: self.params.port,
                    source: e,
                };
                log_at!(threshold, Level::ERROR, error = %err, "Failed to spawn I/O thread");
                self.shared.fail(&err);
                return Err(err);
            }
        };

        // Stored before waiting so a callback fired during connect can tear it down.
        *lock(&self.worker) = Some(Worker {
            thread: Some(thread),
            stop: Some(stop_tx),
            outbound: outbound_tx,
            active,
            threshold,
        });

        let outcome = ready_rx.recv().unwrap_or_else(|_| {
            Err(Error::Connect {
                host: self.params.hostname.clone(),
                port: self.params.port,
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "I/O thread exited before reporting the connect outcome",
                ),
            })
        });

        match outcome {
            Ok(()) => {
                *lock(&self.mode) = Some(mode);
                Ok(())
            }
            Err(err) => {
                let worker = lock(&self.worker).take();
                if let Some(worker) = worker {
                    worker.stop();
                }
                Err(err)
            }
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Transport of the last successful connect.
    pub fn transport_mode(&self) -> Option<TransportMode> {
        *lock(&self.mode)
    }

    /// Queues raw bytes for sending. Never waits for the network.
    pub fn write_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        if !self.current_state().is_connected() {
            return Err(Error::not_connected());
        }
        let worker = lock(&self.worker);
        let sender = worker.as_ref().ok_or_else(Error::not_connected)?;
        sender
            .outbound
            .send(bytes)
            .map_err(|_| Error::not_connected())
    }

    pub fn write_text(&self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes().to_vec())
    }

    pub fn write_document(&self, document: &Document) -> Result<()> {
        self.write_bytes(document.to_xml().into_bytes())
    }

    /// Oldest unfetched document, if any. Never blocks.
    pub fn fetch_document(&self) -> Option<Document> {
        let document = lock(&self.shared.pending).pop_front()?;
        *lock(&self.shared.last_fetched) = Some(document.clone());
        Some(document)
    }

    pub fn pending_documents(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Runs `f` on the oldest pending document, or on the last fetched one
    /// when nothing is pending.
    fn with_current_document<T>(&self, f: impl FnOnce(Option<&Document>) -> T) -> T {
        let pending = lock(&self.shared.pending);
        if let Some(document) = pending.front() {
            return f(Some(document));
        }
        drop(pending);
        let last = lock(&self.shared.last_fetched);
        f(last.as_ref())
    }

    pub fn select_single_node(&self, expression: &str) -> Result<Option<Element>> {
        let path = Path::parse(expression)?;
        Ok(self.with_current_document(|document| {
            document.and_then(|doc| path.select_single(doc).cloned())
        }))
    }

    pub fn select_nodes(&self, expression: &str) -> Result<Vec<Element>> {
        let path = Path::parse(expression)?;
        Ok(self.with_current_document(|document| match document {
            Some(doc) => path.select_all(doc).into_iter().cloned().collect(),
            None => Vec::new(),
        }))
    }

    /// Stops the I/O loop and releases the connection. Idempotent.
    ///
    /// No callback of the torn-down connection fires after this returns.
    /// Leaves `Error` in place; otherwise the state becomes `Disconnected`.
    pub fn teardown(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            log_at!(
                self.options.debug_threshold,
                Level::DEBUG,
                host = %self.params.hostname,
                "Tearing down connection"
            );
            worker.stop();
        }
        self.shared.transition(Transition::Closed);
    }
}

impl Drop for XmlStreamClient {
    fn drop(&mut self) {
        self.teardown();
    }
}
