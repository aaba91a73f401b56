use crate::message::Message;

use super::error::Error::{self, *};

/// Terminates every record on the wire. Records are compact JSON, which
/// escapes every control character inside strings, so a raw newline never
/// occurs within a record.
pub const DELIMITER: u8 = b'\n';

/// Serializes a message into a single delimited record.
pub fn encode(msg: &Message) -> Result<Vec<u8>, Error> {
    let mut buf = serde_json::to_vec(msg).map_err(Encode)?;
    debug_assert!(!buf.contains(&DELIMITER));
    buf.push(DELIMITER);
    Ok(buf)
}

/// Parses one record, without its delimiter.
pub fn decode(record: &[u8]) -> Result<Message, Error> {
    serde_json::from_slice(record).map_err(Decode)
}

/// Splits `buf` into every complete record it contains, in arrival order,
/// and the bytes after the last delimiter.
pub fn split_records(buf: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let mut records = Vec::new();
    let mut rest = buf;
    while let Some(pos) = rest.iter().position(|b| *b == DELIMITER) {
        records.push(&rest[..pos]);
        rest = &rest[pos + 1..];
    }
    (records, rest)
}

/// Incremental decoder for a delimited record stream.
///
/// Bytes after the last delimiter of a read are held as the residual and
/// prepended to the next read, so a record may be split across any number of
/// reads. A record that fails to decode is reported in place and the stream
/// carries on with the next one.
pub struct Framer {
    residual: Vec<u8>,
    max_record_len: usize,
    /// set after an oversized partial record was dropped; everything up to
    /// the next delimiter belongs to it
    discarding: bool,
}

impl Framer {
    pub fn new(max_record_len: usize) -> Self {
        Self {
            residual: Vec::new(),
            max_record_len,
            discarding: false,
        }
    }

    /// Feeds newly read bytes and returns the outcome for every record they
    /// complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Message, Error>> {
        let (records, tail) = split_records(bytes);
        let mut out = Vec::with_capacity(records.len());

        for record in records {
            if self.discarding {
                self.discarding = false;
                self.residual.clear();
                continue;
            }
            if self.residual.is_empty() {
                if !record.is_empty() {
                    out.push(decode(record));
                }
            } else {
                self.residual.extend_from_slice(record);
                out.push(decode(&self.residual));
                self.residual.clear();
            }
        }

        if !self.discarding {
            self.residual.extend_from_slice(tail);
            if self.residual.len() > self.max_record_len {
                out.push(Err(RecordTooLong {
                    len: self.residual.len(),
                    limit: self.max_record_len,
                }));
                self.residual.clear();
                self.discarding = true;
            }
        }

        out
    }

    /// The partial record waiting for more bytes.
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(1 << 20)
    }
}
