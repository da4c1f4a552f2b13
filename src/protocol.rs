use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::BufMut;
use enum_primitive_derive::Primitive;
use modular_bitfield::{bitfield, prelude::*};
use num_traits::FromPrimitive;
use std::{
    io::{Cursor, Read},
    net::Ipv4Addr,
};
use thiserror::Error;
use tracing::trace;

/// Largest datagram accepted from clients or upstreams.
pub const MAX_PACKET_SIZE: usize = 1024;

pub const HEADER_LEN: usize = 12;

/// TTL attached to every locally synthesized answer.
pub const ANSWER_TTL: u32 = 300;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const CLASS_IN: u16 = 1;

pub type ID = u16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet is shorter than the 12 byte header")]
    ShortHeader,
    #[error("packet is a response, not a query")]
    NotAQuery,
    #[error("unsupported opcode {0}")]
    UnsupportedOpCode(u8),
    #[error("truncated messages are not accepted")]
    TruncatedMessage,
    #[error("expected exactly one question, found {0}")]
    QuestionCount(u16),
    #[error("compressed names are not supported")]
    CompressedName,
    #[error("reserved label type {0:#04x}")]
    ReservedLabelType(u8),
    #[error("label runs past the end of the packet")]
    LabelOverrun,
    #[error("label is longer than 63 octets")]
    LabelTooLong,
    #[error("name is longer than 255 octets")]
    NameTooLong,
    #[error("invalid label in name")]
    InvalidLabel,
}

/*
https://datatracker.ietf.org/doc/html/rfc1035#section-3.1

Each label is represented as a one octet length field followed by that
number of octets. Since every domain name ends with the null label of
the root, a domain name is terminated by a length byte of zero.  The
high order two bits of every length octet must be zero, and the
remaining six bits of the length field limit the label to 63 octets or
less.

Compression pointers (high bits 11) are never produced by clients for the
single question we accept, so they are rejected rather than followed.
 */
pub fn read_name(cursor: &mut Cursor<&[u8]>) -> Result<String, ProtocolError> {
    let mut labels = Vec::new();
    let mut total_len = 0usize;

    loop {
        let octet = cursor
            .read_u8()
            .map_err(|_| ProtocolError::LabelOverrun)?;
        total_len += 1;

        // Upper two bits of first octet are used as a type tag
        match octet & 0b1100_0000 {
            0b1100_0000 => return Err(ProtocolError::CompressedName),
            0b1000_0000 | 0b0100_0000 => return Err(ProtocolError::ReservedLabelType(octet)),
            _ => {
                let len = usize::from(octet);

                if len == 0 {
                    return Ok(labels.join("."));
                }

                // Leave room for the root label that must still follow
                total_len += len;
                if total_len + 1 > MAX_NAME_LEN {
                    return Err(ProtocolError::NameTooLong);
                }

                labels.push(read_label_content(cursor, len)?);
            }
        }
    }
}

fn read_label_content(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String, ProtocolError> {
    let mut buf = [0u8; MAX_LABEL_LEN];
    cursor
        .read_exact(&mut buf[0..len])
        .map_err(|_| ProtocolError::LabelOverrun)?;

    let label = std::str::from_utf8(&buf[0..len]).map_err(|_| ProtocolError::InvalidLabel)?;

    // A dot inside one label would read back as a label boundary
    if label.contains('.') {
        return Err(ProtocolError::InvalidLabel);
    }

    Ok(label.to_string())
}

/// Writes `name` as a sequence of length-prefixed labels ending in the root label.
///
/// A single trailing dot is accepted, so `example.com.` and `example.com`
/// encode identically. The empty name encodes as the root.
pub fn write_name<B: BufMut>(name: &str, buf: &mut B) -> Result<(), ProtocolError> {
    let name = name.strip_suffix('.').unwrap_or(name);
    let mut total_len = 1;

    if !name.is_empty() {
        for label in name.split('.') {
            let bytes = label.as_bytes();

            if bytes.is_empty() {
                return Err(ProtocolError::InvalidLabel);
            }
            if bytes.len() > MAX_LABEL_LEN {
                return Err(ProtocolError::LabelTooLong);
            }
            total_len += 1 + bytes.len();
            if total_len > MAX_NAME_LEN {
                return Err(ProtocolError::NameTooLong);
            }

            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
        }
    }

    buf.put_u8(0);
    Ok(())
}

/* Header section

                                1  1  1  1  1  1
  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                      ID                       |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    QDCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    ANCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    NSCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    ARCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
*/
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub id: ID,

    // Query Response
    pub query_response: bool,

    // OPCODE - kind of query, kept raw so unknown values can be reported
    pub operation_code: u8,

    pub authoritative_answer: bool,

    // TC - message was truncated due to length greater than that permitted on the transmission channel
    pub truncated_message: bool,

    pub recursion_desired: bool,

    pub recursion_available: bool,

    // RCODE - 4 bit field set as part of responses
    pub response_code: u8,

    pub question_count: u16,

    pub answer_count: u16,

    // NSCOUNT
    pub authority_count: u16,

    // ARCOUNT
    pub additional_count: u16,
}

#[bitfield]
#[repr(u16)]
#[derive(Debug)]
struct HeaderFlags {
    rcode: B4,
    z: B3,
    ra: bool,
    rd: bool,
    tc: bool,
    aa: bool,
    opcode: B4,
    qr: bool,
}

impl Header {
    pub fn new() -> Header {
        Header {
            id: 0,
            query_response: false,
            operation_code: OpCode::Query as u8,
            authoritative_answer: false,
            truncated_message: false,
            recursion_desired: false,
            recursion_available: false,
            response_code: 0,
            question_count: 0,
            answer_count: 0,
            authority_count: 0,
            additional_count: 0,
        }
    }

    pub fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Header, ProtocolError> {
        if cursor.get_ref().len() < HEADER_LEN {
            return Err(ProtocolError::ShortHeader);
        }

        let mut next = || {
            cursor
                .read_u16::<NetworkEndian>()
                .map_err(|_| ProtocolError::ShortHeader)
        };
        let id = next()?;
        let flags = next()?;
        let qdcount = next()?;
        let ancount = next()?;
        let nscount = next()?;
        let arcount = next()?;

        let flags = HeaderFlags::from(flags);

        trace!(
            id,
            ?flags,
            qdcount,
            ancount,
            nscount,
            arcount,
            "Header::read_from"
        );

        Ok(Header {
            id,
            query_response: flags.qr(),
            operation_code: flags.opcode(),
            authoritative_answer: flags.aa(),
            truncated_message: flags.tc(),
            recursion_desired: flags.rd(),
            recursion_available: flags.ra(),
            response_code: flags.rcode(),
            question_count: qdcount,
            answer_count: ancount,
            authority_count: nscount,
            additional_count: arcount,
        })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        let flags = HeaderFlags::new()
            .with_qr(self.query_response)
            .with_opcode(self.operation_code & 0x0f)
            .with_aa(self.authoritative_answer)
            .with_tc(self.truncated_message)
            .with_rd(self.recursion_desired)
            .with_ra(self.recursion_available)
            .with_z(0)
            .with_rcode(self.response_code & 0x0f);

        buf.put_u16(self.id);
        buf.put_u16(flags.into());
        buf.put_u16(self.question_count);
        buf.put_u16(self.answer_count);
        buf.put_u16(self.authority_count);
        buf.put_u16(self.additional_count);
    }

    /// Checks the header describes something we are willing to answer: a
    /// standard, untruncated query carrying a single question.
    fn validate_query(&self) -> Result<(), ProtocolError> {
        if self.query_response {
            return Err(ProtocolError::NotAQuery);
        }
        match OpCode::from_u8(self.operation_code) {
            Some(OpCode::Query) => (),
            _ => return Err(ProtocolError::UnsupportedOpCode(self.operation_code)),
        }
        if self.truncated_message {
            return Err(ProtocolError::TruncatedMessage);
        }
        if self.question_count != 1 {
            return Err(ProtocolError::QuestionCount(self.question_count));
        }
        Ok(())
    }
}

impl Default for Header {
    fn default() -> Self {
        Header::new()
    }
}

// https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
#[derive(Copy, Clone, Debug, Primitive, PartialEq, Eq)]
pub enum OpCode {
    Query = 0,        // a standard query (QUERY)
    InverseQuery = 1, // an inverse query (IQUERY)
    Status = 2,       // a server status request (STATUS)
                      // 3-15 reserved for future use
}

// https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.2
#[derive(Copy, Clone, Debug, Primitive, PartialEq, Eq, Hash)]
pub enum RecordType {
    A = 1,     // host address, IPv4
    CNAME = 5, // the canonical name for an alias
}

/// A parsed client query. Only the transaction id and the question name
/// take part in resolution; the question type is never consulted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub id: ID,
    pub name: String,
}

impl Query {
    pub fn new(id: ID, name: impl Into<String>) -> Query {
        Query {
            id,
            name: name.into(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Query, ProtocolError> {
        let mut cursor = Cursor::new(bytes);

        let header = Header::read_from(&mut cursor)?;
        header.validate_query()?;

        let name = read_name(&mut cursor)?;

        Ok(Query {
            id: header.id,
            name,
        })
    }

    /// Encodes a recursive A/IN query for this name.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.name.len() + 6);

        let mut header = Header::new();
        header.id = self.id;
        header.recursion_desired = true;
        header.question_count = 1;
        header.write_to(&mut buf);

        write_name(&self.name, &mut buf)?;
        buf.put_u16(RecordType::A as u16);
        buf.put_u16(CLASS_IN);

        Ok(buf)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnswerData {
    A(Ipv4Addr),
    Cname(String),
}

/// A locally synthesized single-record answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Answer {
    pub id: ID,
    pub name: String,
    pub data: AnswerData,
}

impl Answer {
    pub fn rtype(&self) -> RecordType {
        match self.data {
            AnswerData::A(_) => RecordType::A,
            AnswerData::Cname(_) => RecordType::CNAME,
        }
    }

    /// Encodes the answer as a response message.
    ///
    /// The question section is not echoed (QDCOUNT is zero); clients match
    /// the reply on transaction id alone.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut rdata = Vec::new();
        match &self.data {
            AnswerData::A(address) => rdata.put_slice(&address.octets()),
            AnswerData::Cname(target) => write_name(target, &mut rdata)?,
        }
        let rdlength = u16::try_from(rdata.len()).map_err(|_| ProtocolError::NameTooLong)?;

        let mut header = Header::new();
        header.id = self.id;
        header.query_response = true;
        header.authoritative_answer = true;
        header.recursion_available = true;
        header.answer_count = 1;

        let mut buf = Vec::with_capacity(HEADER_LEN + self.name.len() + 12 + rdata.len());
        header.write_to(&mut buf);

        /*
        https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.3

            NAME | TYPE (2) | CLASS (2) | TTL (4) | RDLENGTH (2) | RDATA
        */
        write_name(&self.name, &mut buf)?;
        buf.put_u16(self.rtype() as u16);
        buf.put_u16(CLASS_IN);
        buf.put_u32(ANSWER_TTL);
        buf.put_u16(rdlength);
        buf.put_slice(&rdata);

        Ok(buf)
    }
}


#[cfg(test)]
mod properties {

    use quickcheck::{Arbitrary, Gen, TestResult};
    use quickcheck_macros::quickcheck;
    use rand::Rng;
    use std::cmp;

    use super::*;

    fn gen_range(g: &mut Gen, start: usize, end: usize) -> usize {
        if start >= end {
            return start;
        }
        let range_size = end - start;

        // Note, this is not truely uniform, but the bias is small for small ranges
        start + (usize::arbitrary(g) % range_size)
    }

    fn arbitrary_label(g: &mut Gen, max_len: usize) -> String {
        // Randomly choose a valid label length less than gen size and given max len
        let max_len = cmp::min(max_len, MAX_LABEL_LEN);
        let max_len = cmp::min(max_len, g.size());
        let max_len = gen_range(g, 1, max_len);

        let mut label = String::with_capacity(max_len);

        loop {
            if label.len() == max_len {
                return label;
            }
            let ch = char::arbitrary(g);
            if ch == '.' {
                continue;
            }
            if label.len() + ch.len_utf8() > max_len {
                // Characters are variable length in utf8, try again to gen a shorter one
                continue;
            }
            label.push(ch);
        }
    }

    /// A name made of 1..=63 byte labels, at most 255 octets once encoded.
    #[derive(Clone, Debug)]
    struct Name(String);

    impl Arbitrary for Name {
        fn arbitrary(g: &mut Gen) -> Name {
            let max_name_len = cmp::min(MAX_NAME_LEN, g.size());
            let max_name_len = gen_range(g, 1, max_name_len);

            let mut labels: Vec<String> = Vec::new();

            loop {
                let name_len: i32 = labels.iter().map(|l| l.len() as i32 + 1).sum();
                let max_label_len = max_name_len as i32 - name_len - 2;
                if max_label_len < 1 {
                    break;
                }
                labels.push(arbitrary_label(g, max_label_len as usize));
            }

            Name(labels.join("."))
        }
    }

    #[quickcheck]
    fn write_then_read_name_is_identity(name: Name) {
        let mut buf = vec![];
        write_name(&name.0, &mut buf).unwrap();
        let mut cursor = Cursor::new(&buf[..]);

        assert_eq!(name.0, read_name(&mut cursor).unwrap());
        assert_eq!(cursor.position() as usize, buf.len());
    }

    #[quickcheck]
    fn query_to_bytes_then_from_bytes_keeps_id_and_name(id: u16, name: Name) {
        let bytes = Query::new(id, name.0.clone()).to_bytes().unwrap();

        assert_eq!(Query::from_bytes(&bytes).unwrap(), Query::new(id, name.0));
    }

    #[quickcheck]
    fn query_from_arbitrary_bytes_never_panics(bytes: Vec<u8>) -> TestResult {
        match Query::from_bytes(&bytes) {
            Ok(query) => TestResult::from_bool(query.name.len() <= MAX_NAME_LEN),
            Err(_) => TestResult::passed(),
        }
    }

    #[test]
    fn query_from_random_datagrams_never_panics() {
        let mut rng = rand::thread_rng();

        for _ in 0..10_000 {
            let len = rng.gen_range(0..=2048);
            let mut bytes = vec![0u8; len];
            rng.fill(&mut bytes[..]);
            // Bias towards headers that pass validation so the name decoder is exercised
            if len >= HEADER_LEN && rng.gen_bool(0.5) {
                bytes[2..6].copy_from_slice(&[0x01, 0x00, 0x00, 0x01]);
            }

            let _ = Query::from_bytes(&bytes);
        }
    }
}
