use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use netflow_parser::NetflowPacket;
use netflow_parser::scoped_parser::AutoScopedParser;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{BindConfig, BindHandler, HandlerError, Lifecycle, next_datagram};
use crate::connections::ConnId;
use crate::debugout;
use crate::record::Record;

const HANDLER_NAME: &str = "netflow-v5";

pub const V5_HEADER_SIZE: usize = 24;
pub const V5_RECORD_SIZE: usize = 48;
/// A v5 packet carries at most 30 flow records.
pub const V5_MAX_RECORDS: usize = 30;

/// Stateless NetFlow v5 listener: fixed record layout, no templates.
pub struct NetflowV5Handler {
    config: BindConfig,
    lifecycle: Lifecycle,
}

impl NetflowV5Handler {
    pub fn new(config: BindConfig) -> Result<Self, HandlerError> {
        config.validate()?;
        Ok(Self {
            config,
            lifecycle: Lifecycle::new(),
        })
    }
}

impl BindHandler for NetflowV5Handler {
    fn name(&self) -> &'static str {
        HANDLER_NAME
    }

    fn listen(&self, addr: &str) -> Result<(), HandlerError> {
        self.lifecycle.listen(addr)
    }

    fn start(&self, id: ConnId) -> Result<(), HandlerError> {
        let (socket, cancel) = self.lifecycle.begin(id, HANDLER_NAME)?;
        let config = self.config.clone();
        self.config.tasks.spawn(async move {
            receive_loop(socket, cancel, config, id).await;
        });
        Ok(())
    }

    fn close(&self) -> Result<(), HandlerError> {
        self.lifecycle.close()
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.lifecycle.local_addr()
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    config: BindConfig,
    id: ConnId,
) {
    let mut parser = AutoScopedParser::new();
    let mut buffer = vec![0u8; V5_HEADER_SIZE + V5_MAX_RECORDS * V5_RECORD_SIZE];

    while let Some((received, peer)) =
        next_datagram(&socket, &cancel, &mut buffer, HANDLER_NAME).await
    {
        config
            .metrics
            .udp_packets_received
            .fetch_add(1, Ordering::Relaxed);
        config
            .metrics
            .udp_bytes_received
            .fetch_add(received as u64, Ordering::Relaxed);

        let payload = &buffer[..received];
        let Ok(packets) = parser.parse_from_source(peer, payload) else {
            // there isn't much to do about bad packets
            config.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            debugout!("{HANDLER_NAME}: rejecting {received} byte packet from {peer}");
            continue;
        };
        let Some(NetflowPacket::V5(v5)) = packets.into_iter().next() else {
            config.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            debugout!("{HANDLER_NAME}: ignoring non-v5 packet from {peer}");
            continue;
        };

        let len = V5_HEADER_SIZE + V5_RECORD_SIZE * v5.header.count as usize;
        if received < len {
            config.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let timestamp = if config.ignore_timestamps {
            SystemTime::now()
        } else {
            UNIX_EPOCH + Duration::new(u64::from(v5.header.unix_secs), v5.header.unix_nsecs)
        };

        let record = Record {
            tag: config.tag.clone(),
            source: peer.ip(),
            timestamp,
            data: payload[..len].to_vec(),
        };
        if config.channel.send(record).await.is_err() {
            // downstream bus is gone; nothing left to forward to
            break;
        }
        config
            .metrics
            .records_forwarded
            .fetch_add(1, Ordering::Relaxed);
    }

    config.connections.del(id);
}
