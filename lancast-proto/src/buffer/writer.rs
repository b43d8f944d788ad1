use std::fmt::Display;

use super::PacketBuffer;

/// Maximum wire length of a single label.
const MAX_LABEL: usize = 63;
/// Maximum wire length of a full name, terminator included.
const MAX_NAME: usize = 255;
/// Compression pointers only have 14 bits for the offset.
const MAX_POINTER: usize = 0x4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterError {
    LabelTooLong(usize),
    NameTooLong(usize),
}

impl Display for WriterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LabelTooLong(size) => write!(f, "label of {size} bytes too long"),
            Self::NameTooLong(size) => write!(f, "name of {size} bytes too long"),
        }
    }
}

impl std::error::Error for WriterError {}

impl From<WriterError> for std::io::Error {
    fn from(value: WriterError) -> Self {
        match value {
            WriterError::LabelTooLong(size) => std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("single label of {size} bytes too long when writing"),
            ),
            WriterError::NameTooLong(size) => std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("name of {size} bytes too long when writing"),
            ),
        }
    }
}

fn wire_labels(name: &str) -> Vec<&str> {
    name.split('.').filter(|label| !label.is_empty()).collect()
}

/// Wire form of `labels`, terminating zero label included.
fn wire_form(labels: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1);
    for label in labels {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

fn find_in(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl PacketBuffer {
    fn ensure(&mut self, extra: usize) {
        let needed = self.pos + extra;
        if needed > self.buf.len() {
            let grown = std::cmp::max(self.buf.len() + 512, needed + needed / 2);
            self.buf.resize(grown, 0);
        }
    }

    fn set(&mut self, pos: usize, val: u8) {
        self.buf[pos] = val;
    }

    /// Patch a 16 bit value at an absolute offset, e.g. an rdata length.
    pub fn set_u16(&mut self, pos: usize, val: u16) {
        self.set(pos, (val >> 8) as u8);
        self.set(pos + 1, (val & 0xFF) as u8);
    }

    fn write(&mut self, val: u8) {
        self.ensure(1);
        self.buf[self.pos] = val;
        self.pos += 1;
    }

    pub fn write_u8(&mut self, val: u8) {
        self.write(val);
    }

    pub fn write_u16(&mut self, val: u16) {
        self.write((val >> 8) as u8);
        self.write((val & 0xFF) as u8);
    }

    pub fn write_u32(&mut self, val: u32) {
        self.write(((val >> 24) & 0xFF) as u8);
        self.write(((val >> 16) & 0xFF) as u8);
        self.write(((val >> 8) & 0xFF) as u8);
        self.write((val & 0xFF) as u8);
    }

    pub fn write_bytes(&mut self, values: &[u8]) {
        self.ensure(values.len());
        self.buf[self.pos..self.pos + values.len()].copy_from_slice(values);
        self.pos += values.len();
    }

    fn write_label(&mut self, label: &str) -> Result<(), WriterError> {
        if label.len() > MAX_LABEL {
            return Err(WriterError::LabelTooLong(label.len()));
        }
        self.write_u8(label.len() as u8);
        self.write_bytes(label.as_bytes());
        Ok(())
    }

    /// Write a domain name with compression.
    ///
    /// Labels go out as `<len><bytes>` with a terminating zero label. Before
    /// each label the already written bytes are searched for the wire form of
    /// the remaining suffix (terminator included); a match below the pointer
    /// ceiling is replaced by a two byte pointer. The search is greedy: the
    /// whole name first, then with the first label dropped, until nothing
    /// matches. Repeated service suffixes compress down to two bytes.
    pub fn write_name(&mut self, name: &str) -> Result<(), WriterError> {
        let labels = wire_labels(name);
        let wire_len = labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1;
        if wire_len > MAX_NAME {
            return Err(WriterError::NameTooLong(wire_len));
        }

        let mut index = 0;
        while index < labels.len() {
            let suffix = wire_form(&labels[index..]);
            if let Some(offset) = find_in(self.filled(), &suffix) {
                if offset < MAX_POINTER {
                    self.write_u16(0xC000 | offset as u16);
                    return Ok(());
                }
            }
            self.write_label(labels[index])?;
            index += 1;
        }
        self.write_u8(0);

        Ok(())
    }

    /// Write a domain name without compression, e.g. for the canonical rdata
    /// form used in probe tiebreaking.
    pub fn write_name_plain(&mut self, name: &str) -> Result<(), WriterError> {
        let labels = wire_labels(name);
        let wire_len = labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1;
        if wire_len > MAX_NAME {
            return Err(WriterError::NameTooLong(wire_len));
        }
        for label in labels {
            self.write_label(label)?;
        }
        self.write_u8(0);

        Ok(())
    }
}
