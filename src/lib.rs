//! netflow-collector: a UDP flow-telemetry ingestion front end.
//!
//! Ingests NetFlow v5, NetFlow v9, IPFIX and sFlow v5 datagrams from many
//! exporters, normalizes each datagram into a tagged timestamped
//! [`record::Record`] and forwards it to a downstream ingestion bus over a
//! single bounded channel.
//!
//! ```text
//! UDP socket -> receive loop -> (template attachment) -> Record -> channel -> bus
//! ```
//!
//! NetFlow v9 and IPFIX are stateful on the wire: template records define
//! the shape of later data records. Each exporter/observation-domain pair
//! gets a [`session::Session`] holding the templates learned so far, and
//! every forwarded message either carries the full learned set or is an
//! unmodified passthrough, so the consumer can decode data records
//! independently of packet ordering.
//!
//! Backpressure is the blocking send on the shared channel; when the
//! downstream is slow, receive loops block there and the OS socket buffer
//! absorbs bursts until the kernel starts dropping datagrams. UDP flow
//! telemetry is intrinsically lossy and the collector tolerates that.

pub mod config;
pub mod connections;
pub mod debugout;
pub mod handler;
pub mod metrics;
pub mod record;
pub mod session;
