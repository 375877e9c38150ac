//! Minimal RFC 1035 wire view.
//!
//! The balancer does not interpret DNS beyond what correlation needs: the
//! 16-bit transaction id and the first question (owner name, type, class).
//! Everything else in a packet is opaque payload that is relayed verbatim.
//!
//! Correlation works by stamping a known value into the id field of every
//! query sent upstream. A resolver echoes both the id and the question
//! section back, so a reply fingerprints to the same key as the query it
//! answers without the balancer keeping any per-packet wire state.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::BytesMut;

use crate::task::Task;

pub const HEADER_SIZE: usize = 12;
pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;

/// Which way a packet is travelling through the balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktDir {
    Request,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    Truncated,
    NoQuestion,
    BadLabel,
    WrongDirection,
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsError::Truncated => write!(f, "truncated packet"),
            DnsError::NoQuestion => write!(f, "no question section"),
            DnsError::BadLabel => write!(f, "bad label"),
            DnsError::WrongDirection => write!(f, "unexpected message direction"),
        }
    }
}

impl std::error::Error for DnsError {}

/// First-question view of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub id: u16,
    /// Wire-format owner name, ASCII case folded.
    pub qname: Vec<u8>,
    pub qtype: u16,
    pub qclass: u16,
}

/// Decode the header and the first question of a packet.
///
/// The QR bit must match `dir`: a reply showing up where a query is
/// expected (or the reverse) is rejected, as are zero-question packets,
/// compression pointers in the question and anything truncated.
pub fn parse(buf: &[u8], dir: PktDir) -> Result<Question, DnsError> {
    if buf.len() < HEADER_SIZE {
        return Err(DnsError::Truncated);
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let is_reply = flags & FLAG_QR != 0;
    if (dir == PktDir::Request && is_reply) || (dir == PktDir::Reply && !is_reply) {
        return Err(DnsError::WrongDirection);
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    if qdcount == 0 {
        return Err(DnsError::NoQuestion);
    }

    let mut pos = HEADER_SIZE;
    let mut qname = Vec::with_capacity(32);
    loop {
        let len = *buf.get(pos).ok_or(DnsError::Truncated)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        // also rejects compression pointers (0xC0 prefix)
        if len > MAX_LABEL_LEN {
            return Err(DnsError::BadLabel);
        }
        let label = buf.get(pos..pos + len).ok_or(DnsError::Truncated)?;
        qname.push(len as u8);
        qname.extend(label.iter().map(|b| b.to_ascii_lowercase()));
        if qname.len() > MAX_NAME_LEN {
            return Err(DnsError::BadLabel);
        }
        pos += len;
    }
    let qtype = read_u16(buf, pos).ok_or(DnsError::Truncated)?;
    let qclass = read_u16(buf, pos + 2).ok_or(DnsError::Truncated)?;

    Ok(Question {
        id,
        qname,
        qtype,
        qclass,
    })
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Stamp a transaction id at the wire offset.
pub fn rewrite_id(buf: &mut [u8], id: u16) {
    if buf.len() >= 2 {
        buf[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Correlation key for an outstanding query.
///
/// Two concurrently outstanding queries from the same client port for the
/// same question collide here; the later one then evicts the earlier in
/// the tracking table, which is the only sane answer when their replies
/// are indistinguishable on the wire.
pub fn fingerprint(question: &Question, correlator: u16) -> u64 {
    let mut hasher = DefaultHasher::new();
    question.qname.hash(&mut hasher);
    question.qtype.hash(&mut hasher);
    question.qclass.hash(&mut hasher);
    correlator.hash(&mut hasher);
    hasher.finish()
}

/// Parse a task's buffer and fill in its correlation fields.
///
/// For requests the correlator is the client UDP port: it is stamped into
/// the wire id (the client's own id is saved for restoration at reply
/// time). For replies the correlator is the id the upstream echoed back,
/// so both directions of one exchange land on the same fingerprint.
pub fn parse_task(task: &mut Task, dir: PktDir) -> Result<(), DnsError> {
    let question = parse(&task.buf, dir)?;
    match dir {
        PktDir::Request => {
            let correlator = task.peer.port();
            task.orig_id = question.id;
            task.fingerprint = fingerprint(&question, correlator);
            rewrite_id(&mut task.buf, correlator);
        }
        PktDir::Reply => {
            task.orig_id = question.id;
            task.fingerprint = fingerprint(&question, question.id);
        }
    }
    Ok(())
}

/// Synthesize a recursion-desired probe query for a liveness check.
pub fn build_probe(name: &str) -> Result<BytesMut, DnsError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + MAX_NAME_LEN + 5);
    buf.extend_from_slice(&0u16.to_be_bytes()); // id, stamped at parse time
    buf.extend_from_slice(&FLAG_RD.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    buf.extend_from_slice(&[0u8; 6]); // an/ns/ar counts

    let trimmed = name.trim().trim_end_matches('.');
    let mut total = 0usize;
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(DnsError::BadLabel);
            }
            total += label.len() + 1;
            if total > MAX_NAME_LEN {
                return Err(DnsError::BadLabel);
            }
            buf.extend_from_slice(&[label.len() as u8]);
            buf.extend_from_slice(label.as_bytes());
        }
    }
    buf.extend_from_slice(&[0]); // root label
    buf.extend_from_slice(&TYPE_A.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(buf)
}
