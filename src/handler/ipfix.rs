use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{BindConfig, BindHandler, HandlerError, Lifecycle, next_datagram};
use crate::connections::ConnId;
use crate::debugout;
use crate::record::Record;
use crate::session::{
    IPFIX_HEADER_SIZE, Session, SessionKey, V9_HEADER_SIZE, VERSION_IPFIX, VERSION_NETFLOW_V9,
};

const HANDLER_NAME: &str = "ipfix";

/// Maximum UDP payload size.
const MAX_DATAGRAM_SIZE: usize = 65507;

/// Stateful IPFIX / NetFlow v9 listener.
///
/// Templates learned from an exporter are cached per
/// `(address, observation domain)` session and re-attached to every
/// outbound message, so the downstream consumer can decode data records
/// regardless of packet ordering. When attachment is impossible the
/// original datagram is forwarded unchanged.
pub struct IpfixHandler {
    config: BindConfig,
    lifecycle: Lifecycle,
}

impl IpfixHandler {
    pub fn new(config: BindConfig) -> Result<Self, HandlerError> {
        config.validate()?;
        Ok(Self {
            config,
            lifecycle: Lifecycle::new(),
        })
    }
}

impl BindHandler for IpfixHandler {
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
    // owned by this task alone; sessions live until process exit
    let mut sessions: HashMap<SessionKey, Session> = HashMap::new();
    let mut last_info_dump = SystemTime::now();
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
        if received < 2 {
            config.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            debugout!("{HANDLER_NAME}: message too short for IPFIX or NetFlow v9, skipping");
            continue;
        }

        // the observation domain is pulled out by hand so the session can
        // be picked before the full parse
        let version = u16::from_be_bytes([payload[0], payload[1]]);
        let domain = match version {
            VERSION_NETFLOW_V9 => {
                if received < V9_HEADER_SIZE {
                    config.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debugout!("{HANDLER_NAME}: message too short for NetFlow v9, skipping");
                    continue;
                }
                u32::from_be_bytes([payload[16], payload[17], payload[18], payload[19]])
            }
            VERSION_IPFIX => {
                if received < IPFIX_HEADER_SIZE {
                    config.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debugout!("{HANDLER_NAME}: message too short for IPFIX, skipping");
                    continue;
                }
                u32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]])
            }
            _ => 0,
        };

        let key = SessionKey::new(domain, peer.ip());
        let is_new = !sessions.contains_key(&key);
        if is_new {
            debugout!("{HANDLER_NAME}: creating new session for {key}");
            tracing::info!(address = %peer.ip(), domain, "creating new session");
            config
                .metrics
                .sessions_created
                .fetch_add(1, Ordering::Relaxed);
        }

        if config.session_dump_enabled
            && last_info_dump.elapsed().unwrap_or_default() > config.session_dump_interval
        {
            for session_key in sessions.keys() {
                tracing::info!(session = %session_key, "IPFIX/NetFlow v9 session dump");
            }
            config.metrics.session_dumps.fetch_add(1, Ordering::Relaxed);
            last_info_dump = SystemTime::now();
        }

        let session = sessions.entry(key).or_insert_with(Session::new);
        let msg = match session.parse(payload) {
            Ok(msg) => msg,
            Err(err) => {
                config.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                debugout!("{HANDLER_NAME}: rejecting packet from {peer}: {err}");
                continue;
            }
        };

        // attach the full learned template set and re-marshal; when the
        // session has no templates yet (or re-marshaling fails) forward the
        // original message, it's all that can be done
        let data = match session.template_records() {
            Ok(templates) if msg.template_record_count > 0 || msg.data_set_count > 0 => {
                match session.marshal(&msg, payload, &templates) {
                    Ok(rebuilt) => {
                        debugout!("{HANDLER_NAME}: attaching {} templates", templates.len());
                        config
                            .metrics
                            .templates_attached
                            .fetch_add(1, Ordering::Relaxed);
                        rebuilt
                    }
                    Err(err) => {
                        debugout!("{HANDLER_NAME}: re-marshal failed, passing original: {err}");
                        config
                            .metrics
                            .passthrough_packets
                            .fetch_add(1, Ordering::Relaxed);
                        payload.to_vec()
                    }
                }
            }
            _ => {
                debugout!("{HANDLER_NAME}: no templates for this message, passing original");
                config
                    .metrics
                    .passthrough_packets
                    .fetch_add(1, Ordering::Relaxed);
                payload.to_vec()
            }
        };

        let timestamp = if config.ignore_timestamps {
            SystemTime::now()
        } else {
            UNIX_EPOCH + Duration::from_secs(u64::from(msg.export_time))
        };

        let record = Record {
            tag: config.tag.clone(),
            source: peer.ip(),
            timestamp,
            data,
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
