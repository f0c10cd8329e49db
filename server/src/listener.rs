use crate::{
    pool::{
        WorkerPool,
        WorkerSlot,
    },
    protocol::{
        parse_request,
        ProtocolError,
        Response,
        Status,
    },
};
use chrono::Local;
use flood_bandwidth::MeasurementStore;
use flood_config::ServerConfig;
use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        PoisonError,
        RwLock,
    },
    time::Duration,
};
use tokio::{
    io::{
        AsyncReadExt as _,
        AsyncWriteExt as _,
    },
    net::{
        TcpListener,
        TcpStream,
    },
    task::{
        JoinHandle,
        JoinSet,
    },
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Upper bound for the request line, terminator included.
pub const MAX_REQUEST_LINE: usize = 8 * 1024;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long a connection keeps reading what the client still sends after its response.
const LINGER: Duration = Duration::from_millis(250);

/// Turned-away connections allowed to linger at once. Others are closed right after the 503.
const MAX_LINGERING_REJECTS: usize = 64;

/// The store answering queries, replaceable while connections are being served.
#[derive(Debug, Clone)]
struct SharedStore(Arc<RwLock<Arc<MeasurementStore>>>);

impl SharedStore {
    fn new(store: Arc<MeasurementStore>) -> Self {
        Self(Arc::new(RwLock::new(store)))
    }

    fn get(&self) -> Arc<MeasurementStore> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, store: Arc<MeasurementStore>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = store;
    }
}

/// Accepts connections and answers `retrieve_last` / `retrieve_range` requests from
/// a [`MeasurementStore`], serving at most `workers` connections at a time.
#[derive(Debug)]
pub struct RequestListener {
    config: ServerConfig,
    store: SharedStore,
}

impl RequestListener {
    pub fn new(config: &ServerConfig, store: Arc<MeasurementStore>) -> Self {
        Self {
            config: config.clone(),
            store: SharedStore::new(store),
        }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Only affects a listener that has not been started yet.
    pub fn set_port(&mut self, port: u16) {
        self.config.port = port;
    }

    pub fn store(&self) -> Arc<MeasurementStore> {
        self.store.get()
    }

    pub fn set_store(&self, store: Arc<MeasurementStore>) {
        self.store.set(store);
    }

    /// Binds the listening socket and starts accepting connections in the background.
    pub async fn start(self) -> io::Result<ListenerHandle> {
        let listener = TcpListener::bind(self.config.listen_address()).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, workers = self.config.workers, "Request listener started");

        let cancellation = CancellationToken::new();
        let accept_loop = AcceptLoop {
            listener,
            pool: WorkerPool::new(self.config.workers),
            lingering: WorkerPool::new(MAX_LINGERING_REJECTS),
            store: self.store.clone(),
            read_timeout: self.config.read_timeout,
            shutdown_grace: self.config.shutdown_grace,
        };
        let task = tokio::spawn(accept_loop.run(cancellation.clone()));

        Ok(ListenerHandle {
            local_addr,
            store: self.store,
            cancellation,
            task,
        })
    }
}

/// A running listener. Dropping the handle leaves the listener running.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    store: SharedStore,
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> Arc<MeasurementStore> {
        self.store.get()
    }

    /// Requests accepted afterwards are answered from `store`.
    pub fn set_store(&self, store: Arc<MeasurementStore>) {
        self.store.set(store);
    }

    /// Stops accepting, gives in-flight connections the configured grace period,
    /// aborts the rest and releases the socket.
    pub async fn shutdown(self) {
        self.cancellation.cancel();
        if let Err(err) = self.task.await {
            error!("Request listener task failed: {err}");
        }
        info!(local_addr = %self.local_addr, "Request listener stopped");
    }
}

struct AcceptLoop {
    listener: TcpListener,
    pool: WorkerPool,
    lingering: WorkerPool,
    store: SharedStore,
    read_timeout: Duration,
    shutdown_grace: Duration,
}

impl AcceptLoop {
    async fn run(self, cancellation: CancellationToken) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => break,

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        error!("Connection task failed: {err}");
                    }
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => match self.pool.try_acquire() {
                        Ok(slot) => {
                            trace!(%peer, available = self.pool.available(), "Connection admitted");
                            connections.spawn(serve(socket, peer, self.store.get(), self.read_timeout, slot));
                        }
                        Err(saturated) => {
                            debug!(%peer, "Rejecting connection: {saturated}");
                            match self.lingering.try_acquire() {
                                Ok(slot) => {
                                    connections.spawn(reject(socket, peer, slot));
                                }
                                Err(_) => refuse(socket, peer),
                            }
                        }
                    },
                    Err(err) => {
                        warn!("Failed to accept connection: {err}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        let in_flight = connections.len();
        if in_flight > 0 {
            debug!(in_flight, grace = ?self.shutdown_grace, "Waiting for open connections");
            let drained = tokio::time::timeout(self.shutdown_grace, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(remaining = connections.len(), "Aborting connections still open after the grace period");
                connections.shutdown().await;
            }
        }
        drop(self.listener);
    }
}

async fn serve(
    mut socket: TcpStream,
    peer: SocketAddr,
    store: Arc<MeasurementStore>,
    read_timeout: Duration,
    _slot: WorkerSlot,
) {
    let response = match read_request_line(&mut socket, read_timeout).await {
        Ok(line) => answer(&line, &store).await,
        Err(err) => {
            debug!(%peer, "Unusable request: {err}");
            Response::empty(Status::BadRequest)
        }
    };
    trace!(%peer, status = response.status.code(), "Answering request");
    respond(&mut socket, &response).await;
    linger(&mut socket).await;
}

async fn answer(line: &str, store: &MeasurementStore) -> Response {
    let (from, to) = match parse_request(line).and_then(|spec| spec.resolve(Local::now())) {
        Ok(bounds) => bounds,
        Err(err) => {
            debug!(request = line, "Rejecting request: {err}");
            return Response::empty(Status::BadRequest);
        }
    };

    match store.range_query(from, to).await {
        Ok(records) => {
            debug!(request = line, records = records.len(), "Serving measurements");
            Response::records(&records)
        }
        Err(err) => {
            error!(request = line, "Failed to query measurements: {err}");
            Response::empty(Status::InternalServerError)
        }
    }
}

async fn reject(mut socket: TcpStream, peer: SocketAddr, _slot: WorkerSlot) {
    respond(&mut socket, &Response::empty(Status::ServiceUnavailable)).await;
    linger(&mut socket).await;
    trace!(%peer, "Rejected connection closed");
}

/// Turns a connection away without leaving the accept loop.
fn refuse(socket: TcpStream, peer: SocketAddr) {
    let mut sink = [0u8; 1024];
    while matches!(socket.try_read(&mut sink), Ok(read) if read > 0) {}
    if let Err(err) = socket.try_write(&Response::empty(Status::ServiceUnavailable).to_bytes()) {
        debug!(%peer, "Failed to send response: {err}");
    }
    trace!(%peer, "Refused connection closed");
}

async fn respond(socket: &mut TcpStream, response: &Response) {
    let written = async {
        socket.write_all(&response.to_bytes()).await?;
        socket.flush().await?;
        socket.shutdown().await
    };
    if let Err(err) = written.await {
        debug!("Failed to send response: {err}");
    }
}

/// Reads and discards what the client still sends, until it closes or [`LINGER`] passes.
/// Closing a socket with unread input resets the connection, which can destroy the
/// response before the client has read it.
async fn linger(socket: &mut TcpStream) {
    let mut sink = [0u8; 1024];
    let deadline = Instant::now() + LINGER;
    while let Ok(Ok(read)) = tokio::time::timeout_at(deadline, socket.read(&mut sink)).await {
        if read == 0 {
            break;
        }
    }
}

/// Reads until the request line is complete and returns it. Header lines sent after it
/// are not interpreted.
async fn read_request_line(socket: &mut TcpStream, read_timeout: Duration) -> Result<String, ProtocolError> {
    let deadline = Instant::now() + read_timeout;
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let read = match tokio::time::timeout_at(deadline, socket.read(&mut chunk)).await {
            Ok(read) => read?,
            Err(_) => return Err(ProtocolError::Timeout),
        };
        if read == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..read]);
        if chunk[..read].contains(&b'\n') {
            break;
        }
        if head.len() > MAX_REQUEST_LINE {
            return Err(ProtocolError::TooLarge(MAX_REQUEST_LINE));
        }
    }

    let line = head.split(|byte| *byte == b'\n').next().unwrap_or_default();
    if line.len() >= MAX_REQUEST_LINE {
        return Err(ProtocolError::TooLarge(MAX_REQUEST_LINE));
    }
    let line = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::MalformedRequestLine(String::from_utf8_lossy(line).into_owned()))?;
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(line.to_string())
}
