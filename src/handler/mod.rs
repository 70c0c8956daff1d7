//! Datagram listeners: one UDP socket plus one receive task per protocol.
//!
//! Every handler follows the same lifecycle: `listen` binds the socket and
//! makes the handler ready, `start` spawns the receive task, `close`
//! cancels it by revoking the socket. The three protocol variants share
//! the contract and differ only in wire parsing.

mod ipfix;
mod netflow_v5;
mod sflow;

pub use ipfix::IpfixHandler;
pub use netflow_v5::NetflowV5Handler;
pub use sflow::SflowV5Handler;

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket as StdUdpSocket};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connections::{Closer, ConnId, ConnectionManager};
use crate::metrics::CollectorMetrics;
use crate::record::Record;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("already listening")]
    AlreadyListening,
    #[error("already closed")]
    AlreadyClosed,
    #[error("not ready")]
    NotReady,
    #[error("invalid connection id {0}")]
    InvalidConnId(ConnId),
    #[error("cannot resolve '{0}'")]
    Unresolvable(String),
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),
    #[error("invalid bind config: {0}")]
    InvalidConfig(String),
}

/// Validated bundle describing one listener, shared between the handler
/// and its receive task.
#[derive(Clone)]
pub struct BindConfig {
    /// Opaque exporter classifier stamped on every record.
    pub tag: String,
    /// Output channel to the downstream ingestion bus. Blocking sends on
    /// this channel are the system's backpressure mechanism.
    pub channel: mpsc::Sender<Record>,
    /// Shared task tracker; every spawned receive task is registered here
    /// so the owner can wait for all of them on shutdown.
    pub tasks: TaskTracker,
    /// When true, records carry the wall-clock receive time instead of the
    /// protocol-declared export time.
    pub ignore_timestamps: bool,
    /// Reserved flag, currently unused downstream.
    pub local_tz: bool,
    /// When true the IPFIX/v9 handler periodically logs its live session
    /// keys.
    pub session_dump_enabled: bool,
    /// Wall-clock interval between session dumps.
    pub session_dump_interval: Duration,
    pub connections: Arc<ConnectionManager>,
    pub metrics: Arc<CollectorMetrics>,
}

impl BindConfig {
    pub fn validate(&self) -> Result<(), HandlerError> {
        if self.tag.is_empty() {
            return Err(HandlerError::InvalidConfig("empty tag".to_string()));
        }
        if self.channel.is_closed() {
            return Err(HandlerError::InvalidConfig(
                "output channel is closed".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle contract shared by the protocol variants.
pub trait BindHandler: Send + Sync {
    fn name(&self) -> &'static str;
    /// Resolve `host:port` and bind the UDP socket. Must be called from
    /// within a tokio runtime.
    fn listen(&self, addr: &str) -> Result<(), HandlerError>;
    /// Spawn the receive task. `id` must come from
    /// [`ConnectionManager::add`].
    fn start(&self, id: ConnId) -> Result<(), HandlerError>;
    /// Revoke the socket and cancel the receive task.
    fn close(&self) -> Result<(), HandlerError>;
    /// The bound local address, if listening.
    fn local_addr(&self) -> Option<SocketAddr>;
}

impl Closer for IpfixHandler {
    fn close(&self) -> Result<(), HandlerError> {
        BindHandler::close(self)
    }
}

impl Closer for NetflowV5Handler {
    fn close(&self) -> Result<(), HandlerError> {
        BindHandler::close(self)
    }
}

impl Closer for SflowV5Handler {
    fn close(&self) -> Result<(), HandlerError> {
        BindHandler::close(self)
    }
}

struct SocketState {
    socket: Option<Arc<UdpSocket>>,
    ready: bool,
    cancel: CancellationToken,
}

/// Socket lifecycle state machine shared by the handler variants. The
/// mutex is the per-handler lifecycle lock; the receive task itself never
/// takes it.
pub(crate) struct Lifecycle {
    state: Mutex<SocketState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SocketState {
                socket: None,
                ready: false,
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, SocketState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn listen(&self, addr: &str) -> Result<(), HandlerError> {
        let mut state = self.locked();
        if state.socket.is_some() {
            return Err(HandlerError::AlreadyListening);
        }
        let resolved = resolve_udp_addr(addr)?;
        let socket = StdUdpSocket::bind(resolved)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;
        state.socket = Some(Arc::new(socket));
        state.ready = true;
        // a fresh token: a handler re-listening after close starts clean
        state.cancel = CancellationToken::new();
        Ok(())
    }

    /// Check the `start` preconditions and hand out what the receive task
    /// needs: the socket and the cancellation token.
    pub(crate) fn begin(
        &self,
        id: ConnId,
        name: &'static str,
    ) -> Result<(Arc<UdpSocket>, CancellationToken), HandlerError> {
        let state = self.locked();
        let Some(socket) = state.socket.as_ref() else {
            tracing::warn!(handler = name, "start rejected: no socket bound");
            return Err(HandlerError::NotReady);
        };
        if !state.ready {
            tracing::warn!(handler = name, "start rejected: handler not ready");
            return Err(HandlerError::NotReady);
        }
        if id == 0 {
            return Err(HandlerError::InvalidConnId(id));
        }
        Ok((Arc::clone(socket), state.cancel.clone()))
    }

    pub(crate) fn close(&self) -> Result<(), HandlerError> {
        let mut state = self.locked();
        state.ready = false;
        match state.socket.take() {
            Some(_socket) => {
                state.cancel.cancel();
                Ok(())
            }
            None => Err(HandlerError::AlreadyClosed),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.locked()
            .socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }
}

fn resolve_udp_addr(addr: &str) -> Result<SocketAddr, HandlerError> {
    let mut resolved = addr.to_socket_addrs().map_err(HandlerError::Bind)?;
    resolved
        .next()
        .ok_or_else(|| HandlerError::Unresolvable(addr.to_string()))
}

/// Wait for the next datagram, or `None` when the handler was closed or
/// the socket read failed (the normal shutdown path).
pub(crate) async fn next_datagram(
    socket: &UdpSocket,
    cancel: &CancellationToken,
    buffer: &mut [u8],
    name: &'static str,
) -> Option<(usize, SocketAddr)> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        recv = socket.recv_from(buffer) => match recv {
            Ok(pair) => Some(pair),
            Err(err) => {
                crate::debugout!("{name} receive loop ending: {err}");
                None
            }
        },
    }
}
