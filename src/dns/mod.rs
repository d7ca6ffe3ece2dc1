//! Minimal DNS message introspection: enough to key the cache, validate that
//! an upstream response answers the question that was asked, and patch the
//! ID and TTLs in place. Input is never trusted; every offset is bounds
//! checked and compressed names may only point backwards.

use smallvec::SmallVec;
use thiserror::Error;

pub const HEADER_LEN: usize = 12;
pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 64;

const FLAG_QR: u16 = 0x8000;
// The single reserved Z bit. AD and CD share the old three-bit field.
const FLAG_Z: u16 = 0x0040;

/// `A` query for youtube.com with RD set, used to health check servers.
pub const CANARY_QUERY: [u8; 29] = [
    0x95, 0xfa, // id
    0x01, 0x00, // flags, RD=1
    0x00, 0x01, // qdcount
    0x00, 0x00, // ancount
    0x00, 0x00, // nscount
    0x00, 0x00, // arcount
    7, b'y', b'o', b'u', b't', b'u', b'b', b'e', 3, b'c', b'o', b'm', 0, // name
    0x00, 0x01, // type A
    0x00, 0x01, // class IN
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("message shorter than the DNS header")]
    TooShort,
    #[error("message is neither a query nor a response")]
    NotQueryOrResponse,
    #[error("message has no question")]
    NoQuestion,
    #[error("invalid or looping name")]
    BadName,
    #[error("invalid question type")]
    InvalidType,
    #[error("message truncated")]
    Truncated,
    #[error("message has no answers")]
    NoAnswers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    /// Case-insensitive name comparison, exact type and class.
    pub fn matches(&self, other: &Question) -> bool {
        self.qtype == other.qtype
            && self.qclass == other.qclass
            && self.name.eq_ignore_ascii_case(&other.name)
    }

    pub fn key(&self) -> QueryKey {
        QueryKey {
            name: self.name.to_ascii_lowercase(),
            qtype: self.qtype,
        }
    }
}

/// Cache identity of a query. The transaction ID is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub name: String,
    pub qtype: u16,
}

/// The parts of a query the tunnel needs to route and validate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    pub is_response: bool,
    pub question: Question,
}

impl Query {
    pub fn name(&self) -> &str {
        &self.question.name
    }

    pub fn qtype(&self) -> u16 {
        self.question.qtype
    }

    pub fn key(&self) -> QueryKey {
        self.question.key()
    }
}

#[derive(Debug, Clone)]
struct Record {
    rtype: u16,
    ttl: u32,
    ttl_offset: usize,
}

type Records = SmallVec<[Record; 4]>;

#[derive(Debug)]
struct Message {
    id: u16,
    flags: u16,
    questions: SmallVec<[Question; 1]>,
    answers: Records,
    authority: Records,
    additional: Records,
}

impl Message {
    fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    fn is_normal_query(&self) -> bool {
        !self.is_response()
            && !self.questions.is_empty()
            && self.flags & FLAG_Z == 0
            && self.answers.is_empty()
            && self.authority.is_empty()
    }

    fn records(&self) -> impl Iterator<Item = &Record> {
        self.answers
            .iter()
            .chain(self.authority.iter())
            .chain(self.additional.iter())
    }
}

/// Parse the query (or response) in `payload` down to its first question.
pub fn parse_query(payload: &[u8]) -> Result<Query, DnsError> {
    let message = parse_message(payload)?;
    if !message.is_normal_query() && !message.is_response() {
        return Err(DnsError::NotQueryOrResponse);
    }
    let is_response = message.is_response();
    let Some(question) = message.questions.into_iter().next() else {
        return Err(DnsError::NoQuestion);
    };
    if question.qtype == 0 {
        return Err(DnsError::InvalidType);
    }
    Ok(Query {
        id: message.id,
        is_response,
        question,
    })
}

/// Overwrite the transaction ID in place.
pub fn rewrite_id(payload: &mut [u8], id: u16) {
    if payload.len() >= 2 {
        payload[..2].copy_from_slice(&id.to_be_bytes());
    }
}

pub fn read_id(payload: &[u8]) -> Option<u16> {
    (payload.len() >= 2).then(|| u16::from_be_bytes([payload[0], payload[1]]))
}

/// TTL of the first answer record.
pub fn extract_ttl(payload: &[u8]) -> Result<u32, DnsError> {
    let message = parse_message(payload)?;
    message
        .answers
        .first()
        .map(|record| record.ttl)
        .ok_or(DnsError::NoAnswers)
}

/// Subtract `elapsed_secs` from every record TTL, flooring at zero. OPT
/// pseudo-records are left alone since their TTL field carries EDNS flags.
pub fn reduce_ttl(payload: &mut [u8], elapsed_secs: u32) -> Result<(), DnsError> {
    if elapsed_secs == 0 {
        return Ok(());
    }
    let message = parse_message(payload)?;
    for record in message.records() {
        if record.rtype == TYPE_OPT {
            continue;
        }
        let reduced = record.ttl.saturating_sub(elapsed_secs);
        payload[record.ttl_offset..record.ttl_offset + 4].copy_from_slice(&reduced.to_be_bytes());
    }
    Ok(())
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, DnsError> {
    buf.get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .ok_or(DnsError::Truncated)
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, DnsError> {
    buf.get(offset..offset + 4)
        .map(|bytes| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .ok_or(DnsError::Truncated)
}

fn parse_message(payload: &[u8]) -> Result<Message, DnsError> {
    if payload.len() < HEADER_LEN {
        return Err(DnsError::TooShort);
    }
    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let qd_count = read_u16(payload, 4)?;
    let an_count = read_u16(payload, 6)?;
    let ns_count = read_u16(payload, 8)?;
    let ar_count = read_u16(payload, 10)?;

    let mut offset = HEADER_LEN;
    let mut questions = SmallVec::new();
    for _ in 0..qd_count {
        let name = read_name(payload, &mut offset)?;
        let qtype = read_u16(payload, offset)?;
        let qclass = read_u16(payload, offset + 2)?;
        offset += 4;
        questions.push(Question {
            name,
            qtype,
            qclass,
        });
    }

    let answers = read_records(payload, &mut offset, an_count)?;
    let authority = read_records(payload, &mut offset, ns_count)?;
    let additional = read_records(payload, &mut offset, ar_count)?;

    Ok(Message {
        id,
        flags,
        questions,
        answers,
        authority,
        additional,
    })
}

fn read_records(payload: &[u8], offset: &mut usize, count: u16) -> Result<Records, DnsError> {
    let mut records = SmallVec::new();
    for _ in 0..count {
        skip_name(payload, offset)?;
        let rtype = read_u16(payload, *offset)?;
        let ttl_offset = *offset + 4;
        let ttl = read_u32(payload, ttl_offset)?;
        let rdata_len = read_u16(payload, *offset + 8)? as usize;
        let rdata_start = *offset + 10;
        if rdata_start + rdata_len > payload.len() {
            return Err(DnsError::Truncated);
        }
        *offset = rdata_start + rdata_len;
        records.push(Record {
            rtype,
            ttl,
            ttl_offset,
        });
    }
    Ok(records)
}

fn skip_name(buf: &[u8], offset: &mut usize) -> Result<(), DnsError> {
    read_name(buf, offset).map(|_| ())
}

/// Decode a possibly compressed name starting at `offset`, advancing
/// `offset` past the name as it appears in place. Pointers must target an
/// earlier position than the pointer itself, so decoding always terminates.
fn read_name(buf: &[u8], offset: &mut usize) -> Result<String, DnsError> {
    let mut name = String::with_capacity(64);
    let mut encoded_len = 0usize;
    let mut position = *offset;
    let mut jumped = false;
    let mut hops = 0;

    loop {
        let Some(&len_byte) = buf.get(position) else {
            return Err(DnsError::Truncated);
        };
        let len = usize::from(len_byte);
        match len_byte & 0xC0 {
            0x00 if len == 0 => {
                if !jumped {
                    *offset = position + 1;
                }
                break;
            }
            0x00 => {
                let start = position + 1;
                let Some(label) = buf.get(start..start + len) else {
                    return Err(DnsError::Truncated);
                };
                encoded_len += len + 1;
                if encoded_len > MAX_NAME_LEN {
                    return Err(DnsError::BadName);
                }
                if !name.is_empty() {
                    name.push('.');
                }
                push_label(&mut name, label);
                position = start + len;
            }
            0xC0 => {
                let Some(&low) = buf.get(position + 1) else {
                    return Err(DnsError::Truncated);
                };
                let target = ((len & 0x3F) << 8) | usize::from(low);
                hops += 1;
                if target >= position || hops > MAX_POINTER_HOPS {
                    return Err(DnsError::BadName);
                }
                if !jumped {
                    *offset = position + 2;
                    jumped = true;
                }
                position = target;
            }
            // 0x40 and 0x80 label types are reserved.
            _ => return Err(DnsError::BadName),
        }
    }

    if name.is_empty() {
        name.push('.');
    }
    Ok(name)
}

/// Presentation form of one label: dots and backslashes are escaped and
/// bytes outside printable ASCII become `\DDD`, so distinct wire names never
/// share a text form.
fn push_label(name: &mut String, label: &[u8]) {
    for &byte in label {
        match byte {
            b'.' | b'\\' => {
                name.push('\\');
                name.push(char::from(byte));
            }
            0x21..=0x7e => name.push(char::from(byte)),
            _ => name.push_str(&format!("\\{byte:03}")),
        }
    }
}
