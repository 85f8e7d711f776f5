// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line-oriented TCP ingest, optionally over TLS.
//!
//! Every accepted connection runs in its own task. Peers outside the allow-list are closed
//! before anything is read. Each non-empty line, with its trailing CR/LF removed, is passed to
//! the [`MessageHandler`] on the connection's task, so a slow handler only stalls that
//! connection.

use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::errors::ListenerError;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) doesn't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Consumer of framed messages. Must not block for long; it runs on the reading connection's
/// task.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: String);
}

impl<F> MessageHandler for F
where
    F: Fn(String) + Send + Sync + 'static,
{
    fn handle(&self, message: String) {
        self(message);
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// CIDR blocks or single addresses allowed to connect. Empty allows everyone.
    pub allow_list: Vec<String>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    /// Longer lines are cut to this many bytes; the rest of the line is discarded.
    pub max_line_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10514,
            allow_list: Vec::new(),
            tls_cert_path: None,
            tls_key_path: None,
            max_line_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, normalize(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNet {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ListenerError::InvalidAllowList(s.to_string());
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let addr = normalize(addr.parse::<IpAddr>().map_err(|_| invalid())?);
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(prefix) => prefix.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(IpNet { addr, prefix })
    }
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 @ IpAddr::V4(_) => v4,
    }
}

/// Set of networks allowed to connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    nets: Vec<IpNet>,
}

impl AllowList {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, ListenerError> {
        let nets = entries
            .iter()
            .map(AsRef::as_ref)
            .filter(|entry| !entry.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<IpNet>, _>>()?;
        Ok(AllowList { nets })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// An empty list allows every address.
    #[must_use]
    pub fn allows(&self, ip: IpAddr) -> bool {
        self.nets.is_empty() || self.nets.iter().any(|net| net.contains(ip))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub accepted: u64,
    /// Connections closed because the peer was not on the allow-list.
    pub rejected: u64,
    pub closed: u64,
    pub messages: u64,
    pub truncated: u64,
    pub accept_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicU64,
    messages: AtomicU64,
    truncated: AtomicU64,
    accept_errors: AtomicU64,
}

struct Connections {
    allow_list: AllowList,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn MessageHandler>,
    max_line_bytes: usize,
    counters: Arc<Counters>,
}

struct Running {
    cancel: CancellationToken,
    accept_loop: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct IngestListener {
    addr: String,
    connections: Arc<Connections>,
    counters: Arc<Counters>,
    running: Mutex<Option<Running>>,
}

impl IngestListener {
    /// Validates the allow-list and loads TLS material. Nothing is bound until
    /// [`IngestListener::start`].
    pub fn new(
        config: ListenerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ListenerError> {
        let allow_list = AllowList::parse(&config.allow_list)?;
        let tls = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(ListenerError::Tls(
                    "both a certificate and a private key are required".to_string(),
                ))
            }
        };
        let counters = Arc::new(Counters::default());
        Ok(IngestListener {
            addr: format!("{}:{}", config.host, config.port),
            connections: Arc::new(Connections {
                allow_list,
                tls,
                handler,
                max_line_bytes: config.max_line_bytes.max(1),
                counters: Arc::clone(&counters),
            }),
            counters,
            running: Mutex::new(None),
        })
    }

    /// Binds the socket and spawns the accept loop. Cancelling `cancel` stops the listener
    /// exactly as [`IngestListener::stop`] does.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<SocketAddr, ListenerError> {
        if lock(&self.running).is_some() {
            return Err(ListenerError::AlreadyStarted);
        }
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: self.addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind {
                addr: self.addr.clone(),
                source,
            })?;

        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(ListenerError::AlreadyStarted);
        }
        let cancel = cancel.child_token();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.connections),
            cancel.clone(),
        ));
        info!(
            "Ingest listener on {}{}",
            local_addr,
            if self.connections.tls.is_some() {
                " (TLS)"
            } else {
                ""
            }
        );
        *running = Some(Running {
            cancel,
            accept_loop,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Closes the socket and every open connection, then waits for their tasks to finish.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.accept_loop.await {
            error!("Ingest listener task failed: {}", e);
        }
        debug!("Ingest listener on {} stopped", running.local_addr);
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().map(|running| running.local_addr)
    }

    #[must_use]
    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            messages: self.counters.messages.load(Ordering::Relaxed),
            truncated: self.counters.truncated.load(Ordering::Relaxed),
            accept_errors: self.counters.accept_errors.load(Ordering::Relaxed),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    connections: Arc<Connections>,
    cancel: CancellationToken,
) {
    let tracker = TaskTracker::new();
    loop {
        let accepted = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                connections
                    .counters
                    .accept_errors
                    .fetch_add(1, Ordering::Relaxed);
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        if !connections.allow_list.allows(peer.ip()) {
            connections.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Rejected connection from {}: not in allow-list", peer);
            drop(stream);
            continue;
        }
        connections.counters.accepted.fetch_add(1, Ordering::Relaxed);
        tracker.spawn(handle_connection(
            stream,
            peer,
            Arc::clone(&connections),
            cancel.clone(),
        ));
    }

    drop(listener);
    tracker.close();
    tracker.wait().await;
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connections: Arc<Connections>,
    cancel: CancellationToken,
) {
    debug!("Accepted connection from {}", peer);
    match &connections.tls {
        Some(acceptor) => {
            let handshake = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                handshake = acceptor.accept(stream) => Some(handshake),
            };
            match handshake {
                Some(Ok(tls_stream)) => {
                    read_messages(tls_stream, peer, &connections, &cancel).await;
                }
                Some(Err(e)) => debug!("TLS handshake with {} failed: {}", peer, e),
                None => {}
            }
        }
        None => read_messages(stream, peer, &connections, &cancel).await,
    }
    connections.counters.closed.fetch_add(1, Ordering::Relaxed);
    debug!("Closed connection from {}", peer);
}

async fn read_messages<S>(
    stream: S,
    peer: SocketAddr,
    connections: &Connections,
    cancel: &CancellationToken,
) where
    S: AsyncRead + Unpin,
{
    let mut reader = tokio::io::BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            read = read_line(&mut reader, &mut line, connections.max_line_bytes) => read,
        };
        let truncated = match read {
            Ok(Some(truncated)) => truncated,
            Ok(None) => break,
            Err(e) => {
                debug!("Read from {} failed: {}", peer, e);
                break;
            }
        };

        if line.is_empty() {
            continue;
        }
        if truncated {
            connections.counters.truncated.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Truncated line from {} to {} bytes",
                peer, connections.max_line_bytes
            );
        }
        connections.counters.messages.fetch_add(1, Ordering::Relaxed);
        connections
            .handler
            .handle(String::from_utf8_lossy(&line).into_owned());
    }
}

/// Reads one `\n`-terminated line into `buf` with its CR/LF terminator removed, keeping at
/// most `max` bytes of content.
///
/// Returns `None` at end of stream, otherwise whether content was cut short. The remainder of
/// an oversized line is consumed and discarded.
async fn read_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    // Room for the content plus a CRLF terminator.
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(2);
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(None);
    }
    let unterminated = buf.last() != Some(&b'\n') && read as u64 == limit;
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    let truncated = unterminated || buf.len() > max;
    buf.truncate(max);

    if unterminated {
        loop {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                break;
            }
            if let Some(pos) = chunk.iter().position(|b| *b == b'\n') {
                reader.consume(pos + 1);
                break;
            }
            let len = chunk.len();
            reader.consume(len);
        }
    }
    Ok(Some(truncated))
}

fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ListenerError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ListenerError::Tls(format!("unsupported protocol versions: {e}")))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| ListenerError::Tls(format!("invalid certificate or key: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ListenerError> {
    let file = File::open(path)
        .map_err(|e| ListenerError::Tls(format!("couldn't open {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ListenerError::Tls(format!("couldn't parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ListenerError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ListenerError> {
    let file = File::open(path)
        .map_err(|e| ListenerError::Tls(format!("couldn't open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ListenerError::Tls(format!("couldn't parse {}: {e}", path.display())))?
        .ok_or_else(|| ListenerError::Tls(format!("no private key found in {}", path.display())))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
