use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{BindConfig, BindHandler, HandlerError, Lifecycle, next_datagram};
use crate::connections::ConnId;
use crate::debugout;
use crate::record::Record;

const HANDLER_NAME: &str = "sflow-v5";

/// See `sFlowRcvrMaximumDatagramSize` in
/// <https://sflow.org/sflow_version_5.txt>: 1400 plus margin to spare.
const MAX_DATAGRAM_SIZE: usize = 2048;

/// Stateless sFlow v5 listener: validates the datagram and forwards the
/// raw bytes.
pub struct SflowV5Handler {
    config: BindConfig,
    lifecycle: Lifecycle,
}

impl SflowV5Handler {
    pub fn new(config: BindConfig) -> Result<Self, HandlerError> {
        config.validate()?;
        Ok(Self {
            config,
            lifecycle: Lifecycle::new(),
        })
    }
}

impl BindHandler for SflowV5Handler {
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
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

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
        if let Err(err) = sflow_parser::parse_datagram(payload) {
            config.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            debugout!("{HANDLER_NAME}: rejecting packet from {peer}: {err}");
            continue;
        }

        // sFlow datagrams carry switch uptime only, no absolute time
        let record = Record {
            tag: config.tag.clone(),
            source: peer.ip(),
            timestamp: SystemTime::now(),
            data: payload.to_vec(),
        };
        if config.channel.send(record).await.is_err() {
            break;
        }
        config
            .metrics
            .records_forwarded
            .fetch_add(1, Ordering::Relaxed);
    }

    config.connections.del(id);
}
