//! Per-exporter session state for the stateful flow protocols.
//!
//! NetFlow v9 and IPFIX carry template records that define the shape of
//! later data records. A collector that loses the templates produces
//! un-decodable data, so every `(exporter address, observation domain)`
//! pair gets a [`Session`] that learns templates off the wire and can
//! re-marshal a message with the full learned set attached. The walker
//! operates on raw set/flowset framing; record payloads stay opaque.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use thiserror::Error;

pub const VERSION_NETFLOW_V9: u16 = 9;
pub const VERSION_IPFIX: u16 = 10;

/// NetFlow v9 message header: version, count, sys-uptime, unix-secs,
/// sequence, source id.
pub const V9_HEADER_SIZE: usize = 20;
/// IPFIX message header: version, length, export-time, sequence,
/// observation domain id.
pub const IPFIX_HEADER_SIZE: usize = 16;

const V9_SET_ID_TEMPLATE: u16 = 0;
const V9_SET_ID_OPTIONS_TEMPLATE: u16 = 1;
const IPFIX_SET_ID_TEMPLATE: u16 = 2;
const IPFIX_SET_ID_OPTIONS_TEMPLATE: u16 = 3;
const MIN_DATA_SET_ID: u16 = 256;
const SET_HEADER_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message too short ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("message length field {length} does not fit the datagram ({available} bytes)")]
    BadMessageLength { length: usize, available: usize },
    #[error("set at offset {0} has an invalid length")]
    BadSetLength(usize),
    #[error("template record overruns its set")]
    TemplateOverrun,
    #[error("no template records learned for this session")]
    NoTemplates,
    #[error("re-marshaled message does not fit the wire format")]
    Oversize,
}

/// Identifies one exporter stream: the observation domain plus the
/// canonical 16-byte source address. IPv4 occupies the first four bytes,
/// the rest stay zero; IPv6 fills all sixteen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    ip: [u8; 16],
    domain: u32,
}

impl SessionKey {
    pub fn new(domain: u32, addr: IpAddr) -> Self {
        let mut ip = [0u8; 16];
        match addr {
            IpAddr::V4(v4) => ip[..4].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => ip.copy_from_slice(&v6.octets()),
        }
        Self { ip, domain }
    }

    pub fn domain(&self) -> u32 {
        self.domain
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip[4..].iter().all(|b| *b == 0) {
            write!(
                f,
                "{}.{}.{}.{}:{}",
                self.ip[0], self.ip[1], self.ip[2], self.ip[3], self.domain
            )
        } else {
            write!(f, "{}:{}", Ipv6Addr::from(self.ip), self.domain)
        }
    }
}

/// One data-template record as learned off the wire, kept verbatim
/// (4-byte record header plus field specifiers) for re-emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRecord {
    pub template_id: u16,
    pub field_count: u16,
    raw: Vec<u8>,
}

impl TemplateRecord {
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

#[derive(Debug, Clone, Copy)]
struct SetSpan {
    id: u16,
    // byte range over the original datagram, including the 4-byte set header
    start: usize,
    end: usize,
}

/// Summary of one parsed message plus the set layout needed to re-marshal
/// it against the original datagram bytes.
#[derive(Debug)]
pub struct Message {
    pub version: u16,
    /// Export time in unix seconds (the `unix_secs` field for v9).
    pub export_time: u32,
    pub domain: u32,
    /// Template records carried by this message.
    pub template_record_count: usize,
    /// Data sets (set id >= 256) carried by this message.
    pub data_set_count: usize,
    header_size: usize,
    // original record count from the v9 header; zero for IPFIX
    v9_record_count: u16,
    sets: Vec<SetSpan>,
}

/// Template state for one exporter/domain pair. Owned by a single receive
/// task; sessions live until process exit.
#[derive(Debug, Default)]
pub struct Session {
    templates: BTreeMap<u16, TemplateRecord>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    /// Parse a raw v9/IPFIX datagram, learning any template records it
    /// carries. Malformed framing is an error; the caller drops the
    /// datagram.
    pub fn parse(&mut self, payload: &[u8]) -> Result<Message, SessionError> {
        if payload.len() < 2 {
            return Err(SessionError::TooShort(payload.len()));
        }
        match be16(payload, 0) {
            VERSION_NETFLOW_V9 => self.parse_v9(payload),
            VERSION_IPFIX => self.parse_ipfix(payload),
            other => Err(SessionError::UnsupportedVersion(other)),
        }
    }

    fn parse_v9(&mut self, payload: &[u8]) -> Result<Message, SessionError> {
        if payload.len() < V9_HEADER_SIZE {
            return Err(SessionError::TooShort(payload.len()));
        }
        let record_count = be16(payload, 2);
        let export_time = be32(payload, 8);
        let domain = be32(payload, 16);

        let sets = walk_sets(payload, V9_HEADER_SIZE, payload.len())?;
        let mut template_record_count = 0;
        let mut data_set_count = 0;
        for set in &sets {
            match set.id {
                V9_SET_ID_TEMPLATE => {
                    template_record_count +=
                        self.learn_templates(&payload[set.start + SET_HEADER_SIZE..set.end], false)?;
                }
                V9_SET_ID_OPTIONS_TEMPLATE => {}
                id if id >= MIN_DATA_SET_ID => data_set_count += 1,
                _ => {}
            }
        }

        Ok(Message {
            version: VERSION_NETFLOW_V9,
            export_time,
            domain,
            template_record_count,
            data_set_count,
            header_size: V9_HEADER_SIZE,
            v9_record_count: record_count,
            sets,
        })
    }

    fn parse_ipfix(&mut self, payload: &[u8]) -> Result<Message, SessionError> {
        if payload.len() < IPFIX_HEADER_SIZE {
            return Err(SessionError::TooShort(payload.len()));
        }
        let length = be16(payload, 2) as usize;
        if length < IPFIX_HEADER_SIZE || length > payload.len() {
            return Err(SessionError::BadMessageLength {
                length,
                available: payload.len(),
            });
        }
        let export_time = be32(payload, 4);
        let domain = be32(payload, 12);

        let sets = walk_sets(payload, IPFIX_HEADER_SIZE, length)?;
        let mut template_record_count = 0;
        let mut data_set_count = 0;
        for set in &sets {
            match set.id {
                IPFIX_SET_ID_TEMPLATE => {
                    template_record_count +=
                        self.learn_templates(&payload[set.start + SET_HEADER_SIZE..set.end], true)?;
                }
                IPFIX_SET_ID_OPTIONS_TEMPLATE => {}
                id if id >= MIN_DATA_SET_ID => data_set_count += 1,
                _ => {}
            }
        }

        Ok(Message {
            version: VERSION_IPFIX,
            export_time,
            domain,
            template_record_count,
            data_set_count,
            header_size: IPFIX_HEADER_SIZE,
            v9_record_count: 0,
            sets,
        })
    }

    // Learn every template record in a template set body. IPFIX field
    // specifiers grow by four bytes when the enterprise bit is set; v9
    // specifiers are always four bytes.
    fn learn_templates(
        &mut self,
        body: &[u8],
        enterprise_aware: bool,
    ) -> Result<usize, SessionError> {
        let mut learned = 0;
        let mut offset = 0;
        while body.len().saturating_sub(offset) >= 4 {
            let template_id = be16(body, offset);
            let field_count = be16(body, offset + 2);
            if template_id < MIN_DATA_SET_ID || field_count == 0 {
                // zero padding at the end of the set
                break;
            }

            let mut cursor = offset + 4;
            for _ in 0..field_count {
                if cursor + 4 > body.len() {
                    return Err(SessionError::TemplateOverrun);
                }
                let raw_type = be16(body, cursor);
                cursor += 4;
                if enterprise_aware && raw_type & 0x8000 != 0 {
                    if cursor + 4 > body.len() {
                        return Err(SessionError::TemplateOverrun);
                    }
                    cursor += 4;
                }
            }

            self.templates.insert(
                template_id,
                TemplateRecord {
                    template_id,
                    field_count,
                    raw: body[offset..cursor].to_vec(),
                },
            );
            learned += 1;
            offset = cursor;
        }
        Ok(learned)
    }

    /// The full set of template records learned on this session.
    pub fn template_records(&self) -> Result<Vec<TemplateRecord>, SessionError> {
        if self.templates.is_empty() {
            return Err(SessionError::NoTemplates);
        }
        Ok(self.templates.values().cloned().collect())
    }

    /// Rebuild the datagram with a single template set carrying `templates`
    /// in place of the original template sets; every other set is copied
    /// verbatim and the header length (IPFIX) or record count (v9) is
    /// recomputed. On error the caller forwards the original bytes.
    pub fn marshal(
        &self,
        msg: &Message,
        payload: &[u8],
        templates: &[TemplateRecord],
    ) -> Result<Vec<u8>, SessionError> {
        if templates.is_empty() {
            return Err(SessionError::NoTemplates);
        }

        let template_set_id = match msg.version {
            VERSION_NETFLOW_V9 => V9_SET_ID_TEMPLATE,
            _ => IPFIX_SET_ID_TEMPLATE,
        };
        let records_len: usize = templates.iter().map(|t| t.raw.len()).sum();
        let template_set_len = SET_HEADER_SIZE + records_len;
        if template_set_len > u16::MAX as usize {
            return Err(SessionError::Oversize);
        }

        let mut out = Vec::with_capacity(msg.header_size + template_set_len + payload.len());
        out.extend_from_slice(&payload[..msg.header_size]);
        out.extend_from_slice(&template_set_id.to_be_bytes());
        out.extend_from_slice(&(template_set_len as u16).to_be_bytes());
        for template in templates {
            out.extend_from_slice(&template.raw);
        }
        for set in &msg.sets {
            if set.id != template_set_id {
                out.extend_from_slice(&payload[set.start..set.end]);
            }
        }

        match msg.version {
            VERSION_NETFLOW_V9 => {
                // total records: the original count minus this message's own
                // template records, plus the attached set
                let count = (msg.v9_record_count as usize)
                    .checked_sub(msg.template_record_count)
                    .and_then(|c| c.checked_add(templates.len()))
                    .filter(|c| *c <= u16::MAX as usize)
                    .ok_or(SessionError::Oversize)?;
                out[2..4].copy_from_slice(&(count as u16).to_be_bytes());
            }
            _ => {
                let total = out.len();
                if total > u16::MAX as usize {
                    return Err(SessionError::Oversize);
                }
                out[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            }
        }

        Ok(out)
    }
}

fn walk_sets(payload: &[u8], start: usize, end: usize) -> Result<Vec<SetSpan>, SessionError> {
    let mut sets = Vec::new();
    let mut offset = start;
    while offset + SET_HEADER_SIZE <= end {
        let id = be16(payload, offset);
        let len = be16(payload, offset + 2) as usize;
        if len < SET_HEADER_SIZE {
            return Err(SessionError::BadSetLength(offset));
        }
        let set_end = offset + len;
        if set_end > end {
            return Err(SessionError::BadSetLength(offset));
        }
        sets.push(SetSpan {
            id,
            start: offset,
            end: set_end,
        });
        offset = set_end;
    }
    Ok(sets)
}

fn be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn be32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
