use std::io::{self, Read, Write};
use std::time::Duration;

use super::key::MsgKey;
use crate::message::Message;

/// Snapshot format: a fixed 16-byte header naming the version, then
/// length-prefixed blocks of up to [`BLOCK_ENTRIES`] entries each.
/// Entry layout: 16-byte key, u32 remaining-TTL seconds, u32 response
/// length, response wire bytes. All integers big-endian.
pub(crate) const DUMP_HEADER: &[u8; 16] = b"bifrost_cache_v1";

const BLOCK_ENTRIES: usize = 128;
const BLOCK_MAX_BYTES: u32 = 1 << 20;

pub(crate) struct DumpEntry {
    pub key: MsgKey,
    pub remaining: Duration,
    pub resp: Message,
}

pub(crate) fn write_snapshot<W: Write>(w: &mut W, entries: &[DumpEntry]) -> io::Result<()> {
    w.write_all(DUMP_HEADER)?;

    for chunk in entries.chunks(BLOCK_ENTRIES) {
        let mut block = Vec::new();
        for entry in chunk {
            let remaining = entry.remaining.as_secs();
            if remaining == 0 {
                continue;
            }
            let resp_bytes = entry
                .resp
                .serialize()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            block.extend_from_slice(entry.key.as_bytes());
            block.extend_from_slice(&(remaining.min(u32::MAX as u64) as u32).to_be_bytes());
            block.extend_from_slice(&(resp_bytes.len() as u32).to_be_bytes());
            block.extend_from_slice(&resp_bytes);
        }
        if block.is_empty() {
            continue;
        }
        w.write_all(&(block.len() as u32).to_be_bytes())?;
        w.write_all(&block)?;
    }
    w.flush()
}

/// Read a snapshot back. An unrecognized header is an error; a short or
/// oversized block is a hard stop — entries already decoded are kept,
/// everything at and after the failure point is discarded.
pub(crate) fn read_snapshot<R: Read>(r: &mut R) -> io::Result<Vec<DumpEntry>> {
    let mut header = [0u8; 16];
    r.read_exact(&mut header)?;
    if &header != DUMP_HEADER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unrecognized cache snapshot header",
        ));
    }

    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match r.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let block_len = u32::from_be_bytes(len_buf);
        if block_len == 0 || block_len > BLOCK_MAX_BYTES {
            break;
        }
        let mut block = vec![0u8; block_len as usize];
        if r.read_exact(&mut block).is_err() {
            break; // partially written trailing block
        }
        if !decode_block(&block, &mut entries) {
            break;
        }
    }
    Ok(entries)
}

/// Decode one block; false means a malformed entry stopped the load.
fn decode_block(block: &[u8], entries: &mut Vec<DumpEntry>) -> bool {
    let mut pos = 0usize;
    while pos < block.len() {
        if block.len() - pos < 24 {
            return false;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&block[pos..pos + 16]);
        let remaining = u32::from_be_bytes(block[pos + 16..pos + 20].try_into().unwrap());
        let resp_len = u32::from_be_bytes(block[pos + 20..pos + 24].try_into().unwrap()) as usize;
        pos += 24;

        if block.len() - pos < resp_len {
            return false;
        }
        let resp = match Message::parse(&block[pos..pos + resp_len]) {
            Ok(resp) => resp,
            Err(_) => return false,
        };
        pos += resp_len;

        if remaining == 0 {
            continue;
        }
        entries.push(DumpEntry {
            key: MsgKey::from_bytes(key),
            remaining: Duration::from_secs(remaining as u64),
            resp,
        });
    }
    true
}
