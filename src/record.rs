use std::net::IpAddr;
use std::time::SystemTime;

/// Normalized output unit forwarded to the downstream ingestion bus.
///
/// One record is allocated per accepted datagram; ownership moves through
/// the output channel and the payload is never mutated after send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Opaque exporter classifier from the listener configuration.
    pub tag: String,
    /// Address the datagram arrived from.
    pub source: IpAddr,
    /// Wall-clock receive time or the protocol-declared export time,
    /// depending on the listener's timestamp policy.
    pub timestamp: SystemTime,
    /// Datagram bytes, possibly re-marshaled with attached templates.
    pub data: Vec<u8>,
}
