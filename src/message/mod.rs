pub mod enums;
pub mod header;
pub mod question;
pub mod record;

use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter, Endianness};
use thiserror::Error;

pub use enums::{RecordClass, RecordType};
pub use header::Header;
pub use question::Question;
pub use record::Record;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid DNS label")]
    InvalidLabel,

    #[error("DNS name too long")]
    NameTooLong,

    #[error("truncated packet")]
    UnexpectedEnd,

    #[error("invalid bit stream: {0}")]
    BitStream(String),
}

impl From<std::io::Error> for ParseError {
    fn from(e: std::io::Error) -> Self {
        ParseError::BitStream(e.to_string())
    }
}

/// A decoded DNS message. Counts in the header are recomputed from the
/// section vectors on serialization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// Build a single-question recursive query.
    pub fn query(name: &str, qtype: RecordType) -> Self {
        let mut msg = Message::default();
        msg.header.rd = true;
        msg.header.qdcount = 1;
        msg.questions.push(Question::new(name, qtype));
        msg
    }

    /// Build an empty response matching a query's id and question section.
    pub fn reply_to(query: &Message) -> Self {
        let mut msg = Message::default();
        msg.header.id = query.header.id;
        msg.header.qr = true;
        msg.header.rd = query.header.rd;
        msg.header.ra = true;
        msg.questions = query.questions.clone();
        msg.header.qdcount = msg.questions.len() as u16;
        msg
    }

    /// First (and for cacheable queries, only) question.
    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }

    pub fn has_answers(&self) -> bool {
        !self.answers.is_empty()
    }

    /// All resource records across the three response sections.
    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.answers
            .iter_mut()
            .chain(self.authorities.iter_mut())
            .chain(self.additionals.iter_mut())
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let mut reader = BitReader::<_, BigEndian>::new(buf);
        let header = Header::read(&mut reader)?;

        let mut msg = Message {
            header,
            ..Message::default()
        };
        for _ in 0..msg.header.qdcount {
            msg.questions.push(Question::read(&mut reader, buf)?);
        }
        for _ in 0..msg.header.ancount {
            msg.answers.push(Record::read(&mut reader, buf)?);
        }
        for _ in 0..msg.header.nscount {
            msg.authorities.push(Record::read(&mut reader, buf)?);
        }
        for _ in 0..msg.header.arcount {
            msg.additionals.push(Record::read(&mut reader, buf)?);
        }
        Ok(msg)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ParseError> {
        let mut buf = Vec::new();
        let mut writer: BitWriter<&mut Vec<u8>, BigEndian> = BitWriter::new(&mut buf);

        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additionals.len() as u16;
        header.write(&mut writer)?;

        for question in &self.questions {
            question.write(&mut writer)?;
        }
        for record in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
        {
            record.write(&mut writer)?;
        }
        Ok(buf)
    }
}

pub(crate) fn name_to_labels(name: &str) -> Vec<String> {
    name.trim_end_matches('.')
        .split('.')
        .filter(|l| !l.is_empty())
        .map(|l| l.to_ascii_lowercase())
        .collect()
}

pub(crate) fn labels_to_name(labels: &[String]) -> String {
    let mut name = String::with_capacity(64);
    for label in labels.iter().filter(|l| !l.is_empty()) {
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&label.to_ascii_lowercase());
    }
    name
}

pub(crate) fn write_labels<E: Endianness>(
    writer: &mut BitWriter<&mut Vec<u8>, E>,
    labels: &[String],
) -> Result<(), ParseError> {
    for label in labels.iter().filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(ParseError::InvalidLabel);
        }
        writer.write_var::<u8>(8, label.len() as u8)?;
        writer.write_bytes(label.as_bytes())?;
    }
    writer.write_var::<u8>(8, 0)?;
    Ok(())
}

/// Read an owner name, following compression pointers into `packet`.
pub(crate) fn read_name<E: Endianness>(
    reader: &mut BitReader<&[u8], E>,
    packet: &[u8],
) -> Result<Vec<String>, ParseError> {
    let mut labels = Vec::new();
    let mut name_len = 0usize;
    loop {
        let len = reader.read_var::<u8>(8)?;
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = reader.read_var::<u8>(8)?;
            let offset = (((len & 0x3F) as usize) << 8) | low as usize;
            decode_name_at(packet, offset, &mut labels, &mut name_len, 0)?;
            break;
        }
        read_label(reader, len as usize, &mut labels, &mut name_len)?;
    }
    Ok(labels)
}

fn read_label<E: Endianness>(
    reader: &mut BitReader<&[u8], E>,
    len: usize,
    labels: &mut Vec<String>,
    name_len: &mut usize,
) -> Result<(), ParseError> {
    if len > MAX_LABEL_LEN {
        return Err(ParseError::InvalidLabel);
    }
    *name_len += len + 1;
    if *name_len > MAX_NAME_LEN {
        return Err(ParseError::NameTooLong);
    }
    let mut buf = vec![0u8; len];
    reader.read_bytes(&mut buf)?;
    labels.push(String::from_utf8(buf).map_err(|_| ParseError::InvalidLabel)?);
    Ok(())
}

/// Decode the label sequence starting at a pointer target. Pointers must
/// point strictly backwards; hop count is bounded.
fn decode_name_at(
    packet: &[u8],
    mut pos: usize,
    labels: &mut Vec<String>,
    name_len: &mut usize,
    depth: usize,
) -> Result<(), ParseError> {
    if depth >= MAX_POINTER_HOPS {
        return Err(ParseError::InvalidLabel);
    }
    loop {
        let len = *packet.get(pos).ok_or(ParseError::UnexpectedEnd)? as usize;
        if len == 0 {
            return Ok(());
        }
        if len & 0xC0 == 0xC0 {
            let low = *packet.get(pos + 1).ok_or(ParseError::UnexpectedEnd)? as usize;
            let target = ((len & 0x3F) << 8) | low;
            if target >= pos {
                return Err(ParseError::InvalidLabel);
            }
            return decode_name_at(packet, target, labels, name_len, depth + 1);
        }
        if len > MAX_LABEL_LEN {
            return Err(ParseError::InvalidLabel);
        }
        let end = pos + 1 + len;
        let bytes = packet.get(pos + 1..end).ok_or(ParseError::UnexpectedEnd)?;
        *name_len += len + 1;
        if *name_len > MAX_NAME_LEN {
            return Err(ParseError::NameTooLong);
        }
        labels.push(String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::InvalidLabel)?);
        pos = end;
    }
}
