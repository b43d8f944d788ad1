use crate::buffer::reader::ReaderError;
use crate::buffer::writer::WriterError;
use crate::buffer::PacketBuffer;
use crate::hash::HashWriter;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::question::Question;
use super::{QueryType, CLASS_IN};

/// The high bit of the class field: cache-flush on records, QU on questions.
pub const CLASS_UNIQUE_BIT: u16 = 0x8000;

#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, PartialOrd, Ord)]
#[allow(clippy::upper_case_acronyms)]
pub enum RecordType {
    /// a host address
    A, // 1
    /// a domain name pointer
    PTR, // 12
    /// descriptive text
    TXT, // 16
    /// an IPv6 host address
    AAAA, // 28
    /// the location of a service instance
    SRV, // 33
    /// existence proof for a name, restricted mDNS form
    NSEC, // 47
    Unknown(u16),
}

impl RecordType {
    pub fn into_num(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::PTR => 12,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::SRV => 33,
            RecordType::NSEC => 47,
            RecordType::Unknown(x) => x,
        }
    }

    pub fn from_num(num: u16) -> RecordType {
        match num {
            1 => RecordType::A,
            12 => RecordType::PTR,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            33 => RecordType::SRV,
            47 => RecordType::NSEC,
            _ => RecordType::Unknown(num),
        }
    }

    /// TTL a record of this type carries unless told otherwise. Host scoped
    /// records stay short lived, service naming records live longer.
    pub fn default_ttl(self) -> u32 {
        match self {
            RecordType::PTR | RecordType::TXT => 4500,
            _ => 120,
        }
    }

    /// Whether records of this type are unique (cache-flush) by default.
    /// Only PTR is shared: many hosts legitimately advertise the same
    /// service type pointer.
    pub fn default_unique(self) -> bool {
        !matches!(self, RecordType::PTR)
    }
}

/// One `key[=value]` entry of a TXT record. The raw byte form is kept, a
/// value can be any opaque byte sequence or absent entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtEntry {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl TxtEntry {
    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn pair(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    fn wire(&self) -> Vec<u8> {
        let mut out = self.key.as_bytes().to_vec();
        if let Some(value) = &self.value {
            out.push(b'=');
            out.extend_from_slice(value);
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtData {
    pub entries: Vec<TxtEntry>,
}

impl TxtData {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decoded string form; flag entries map to an empty string.
    pub fn decoded(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|entry| {
                let value = entry
                    .value
                    .as_ref()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default();
                (entry.key.clone(), value)
            })
            .collect()
    }

    /// Raw byte form, values untouched.
    pub fn raw(&self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect()
    }

    fn write(&self, buffer: &mut PacketBuffer) {
        if self.entries.is_empty() {
            // An empty TXT record is a single empty string on the wire.
            buffer.write_u8(0);
            return;
        }
        for entry in &self.entries {
            let wire = entry.wire();
            buffer.write_u8(wire.len() as u8);
            buffer.write_bytes(&wire);
        }
    }

    fn read(buffer: &mut PacketBuffer, data_len: usize) -> Result<Self, ReaderError> {
        let end = buffer.pos() + data_len;
        let mut entries = Vec::new();
        while buffer.pos() < end {
            let len = buffer.read()? as usize;
            let bytes = buffer.read_bytes(len)?;
            if bytes.is_empty() {
                continue;
            }
            match bytes.iter().position(|b| *b == b'=') {
                Some(split) => entries.push(TxtEntry {
                    key: String::from_utf8_lossy(&bytes[..split]).into_owned(),
                    value: Some(bytes[split + 1..].to_vec()),
                }),
                None => entries.push(TxtEntry {
                    key: String::from_utf8_lossy(&bytes).into_owned(),
                    value: None,
                }),
            }
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum RData {
    A {
        addr: Ipv4Addr,
    }, // 1
    PTR {
        target: String,
    }, // 12
    TXT {
        data: TxtData,
    }, // 16
    AAAA {
        addr: Ipv6Addr,
    }, // 28
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    }, // 33
    NSEC {
        next_domain: String,
        types: Vec<u16>,
    }, // 47
    Unknown {
        rtype: u16,
        bytes: Vec<u8>,
    },
}

impl RData {
    pub fn rtype(&self) -> RecordType {
        match self {
            Self::A { .. } => RecordType::A,
            Self::PTR { .. } => RecordType::PTR,
            Self::TXT { .. } => RecordType::TXT,
            Self::AAAA { .. } => RecordType::AAAA,
            Self::SRV { .. } => RecordType::SRV,
            Self::NSEC { .. } => RecordType::NSEC,
            Self::Unknown { rtype, .. } => RecordType::Unknown(*rtype),
        }
    }

    fn write(&self, buffer: &mut PacketBuffer, plain: bool) -> Result<(), WriterError> {
        let name = |buffer: &mut PacketBuffer, value: &str| {
            if plain {
                buffer.write_name_plain(value)
            } else {
                buffer.write_name(value)
            }
        };
        match self {
            Self::A { addr } => buffer.write_bytes(&addr.octets()),
            Self::AAAA { addr } => buffer.write_bytes(&addr.octets()),
            Self::PTR { target } => name(buffer, target)?,
            Self::TXT { data } => data.write(buffer),
            Self::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority);
                buffer.write_u16(*weight);
                buffer.write_u16(*port);
                name(buffer, target)?;
            }
            Self::NSEC { next_domain, types } => {
                name(buffer, next_domain)?;
                let bitmap = nsec_bitmap(types);
                buffer.write_u8(0);
                buffer.write_u8(bitmap.len() as u8);
                buffer.write_bytes(&bitmap);
            }
            Self::Unknown { bytes, .. } => buffer.write_bytes(bytes),
        }
        Ok(())
    }

    fn read(
        buffer: &mut PacketBuffer,
        rtype: u16,
        data_len: usize,
    ) -> Result<Self, ReaderError> {
        match RecordType::from_num(rtype) {
            RecordType::A => {
                let bytes = buffer.read_bytes(4)?;
                Ok(Self::A {
                    addr: Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
                })
            }
            RecordType::AAAA => {
                let bytes = buffer.read_bytes(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes);
                Ok(Self::AAAA {
                    addr: Ipv6Addr::from(octets),
                })
            }
            RecordType::PTR => Ok(Self::PTR {
                target: buffer.read_name()?,
            }),
            RecordType::TXT => Ok(Self::TXT {
                data: TxtData::read(buffer, data_len)?,
            }),
            RecordType::SRV => Ok(Self::SRV {
                priority: buffer.read_u16()?,
                weight: buffer.read_u16()?,
                port: buffer.read_u16()?,
                target: buffer.read_name()?,
            }),
            RecordType::NSEC => {
                let end = buffer.pos() + data_len;
                let next_domain = buffer.read_name()?;
                let mut types = Vec::new();
                while buffer.pos() + 2 <= end {
                    let window = buffer.read()?;
                    let len = buffer.read()? as usize;
                    let bitmap = buffer.read_bytes(len)?;
                    if window != 0 {
                        // Only the restricted window 0 form carries meaning
                        // here, higher windows are skipped.
                        continue;
                    }
                    for (index, byte) in bitmap.iter().enumerate() {
                        for bit in 0..8 {
                            if byte & (0x80 >> bit) != 0 {
                                types.push((index * 8 + bit) as u16);
                            }
                        }
                    }
                }
                Ok(Self::NSEC { next_domain, types })
            }
            RecordType::Unknown(num) => Ok(Self::Unknown {
                rtype: num,
                bytes: buffer.read_bytes(data_len)?,
            }),
        }
    }

    fn feed(&self, writer: &mut HashWriter) {
        match self {
            Self::A { addr } => writer.bytes(&addr.octets()),
            Self::AAAA { addr } => writer.bytes(&addr.octets()),
            Self::PTR { target } => writer.text(target),
            Self::TXT { data } => {
                for entry in &data.entries {
                    writer.text(&entry.key);
                    match &entry.value {
                        Some(value) => writer.bytes(value),
                        None => writer.number(0),
                    }
                }
            }
            Self::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                writer.number(u64::from(*priority));
                writer.number(u64::from(*weight));
                writer.number(u64::from(*port));
                writer.text(target);
            }
            Self::NSEC { types, .. } => {
                // The next domain slot is ignored by readers, identity comes
                // from the type list alone.
                for value in types {
                    writer.number(u64::from(*value));
                }
            }
            Self::Unknown { rtype, bytes } => {
                writer.number(u64::from(*rtype));
                writer.bytes(bytes);
            }
        }
    }
}

/// Window block 0 bitmap in network bit order: type `t` sets bit `0x80 >> (t % 8)`
/// of byte `t / 8`. Only type numbers up to 255 fit this restricted form.
fn nsec_bitmap(types: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    for t in types {
        if *t > 255 {
            continue;
        }
        let byte = (*t / 8) as usize;
        if out.len() <= byte {
            out.resize(byte + 1, 0);
        }
        out[byte] |= 0x80 >> (t % 8);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hashes {
    name: u32,
    rdata: u32,
    whole: u32,
}

/// A resource record plus the deterministic hashes its identity algebra
/// runs on: `namehash` covers (name, type, class), `rdatahash` the
/// canonicalized rdata, `hash` both. Two records are equal iff `hash`
/// matches; they share identity iff `namehash` matches; two unique records
/// sharing identity with different rdata conflict.
#[derive(Debug, Clone)]
pub struct Record {
    pub name: String,
    pub ttl: u32,
    /// The cache-flush (unique) bit.
    pub cache_flush: bool,
    pub rdata: RData,
    /// Companion records a responder suggests shipping alongside this one,
    /// e.g. the SRV and TXT for a PTR. Not part of record identity.
    pub additionals: Vec<Record>,
    hashes: Hashes,
}

impl Record {
    pub fn new(name: impl Into<String>, rdata: RData) -> Self {
        let rtype = rdata.rtype();
        let mut record = Self {
            name: name.into(),
            ttl: rtype.default_ttl(),
            cache_flush: rtype.default_unique(),
            rdata,
            additionals: Vec::new(),
            hashes: Hashes {
                name: 0,
                rdata: 0,
                whole: 0,
            },
        };
        record.rehash();
        record
    }

    pub fn a(name: impl Into<String>, addr: Ipv4Addr) -> Self {
        Self::new(name, RData::A { addr })
    }

    pub fn aaaa(name: impl Into<String>, addr: Ipv6Addr) -> Self {
        Self::new(name, RData::AAAA { addr })
    }

    pub fn ptr(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            RData::PTR {
                target: target.into(),
            },
        )
    }

    pub fn srv(name: impl Into<String>, target: impl Into<String>, port: u16) -> Self {
        Self::new(
            name,
            RData::SRV {
                priority: 0,
                weight: 0,
                port,
                target: target.into(),
            },
        )
    }

    pub fn txt(name: impl Into<String>, data: TxtData) -> Self {
        Self::new(name, RData::TXT { data })
    }

    /// The restricted NSEC used as a negative answer: the record's own name
    /// goes into the next domain slot, which readers ignore but the original
    /// implementations put on the wire.
    pub fn nsec(name: impl Into<String>, types: Vec<RecordType>) -> Self {
        let name = name.into();
        let mut nums: Vec<u16> = types
            .into_iter()
            .map(RecordType::into_num)
            .filter(|num| *num <= 255)
            .collect();
        nums.sort_unstable();
        nums.dedup();
        Self::new(
            name.clone(),
            RData::NSEC {
                next_domain: name,
                types: nums,
            },
        )
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_cache_flush(mut self, cache_flush: bool) -> Self {
        self.cache_flush = cache_flush;
        self
    }

    pub fn with_additionals(mut self, additionals: Vec<Record>) -> Self {
        self.additionals = additionals;
        self
    }

    pub fn rtype(&self) -> RecordType {
        self.rdata.rtype()
    }

    pub fn hash(&self) -> u32 {
        self.hashes.whole
    }

    pub fn namehash(&self) -> u32 {
        self.hashes.name
    }

    pub fn rdatahash(&self) -> u32 {
        self.hashes.rdata
    }

    /// Recompute the identity hashes. Must be called after mutating `name`
    /// or `rdata` in place.
    pub fn rehash(&mut self) {
        let mut name = HashWriter::default();
        name.text(&self.name);
        name.number(u64::from(self.rtype().into_num()));
        name.number(u64::from(CLASS_IN));
        let name = name.finish();

        let mut rdata = HashWriter::default();
        self.rdata.feed(&mut rdata);
        let rdata = rdata.finish();

        let mut whole = HashWriter::default();
        whole.number(u64::from(name));
        whole.number(u64::from(rdata));

        self.hashes = Hashes {
            name,
            rdata,
            whole: whole.finish(),
        };
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.rehash();
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// A goodbye is a record leaving the network.
    pub fn is_goodbye(&self) -> bool {
        self.ttl == 0
    }

    /// Two unique records that share identity but disagree on rdata cannot
    /// coexist on the link.
    pub fn conflicts_with(&self, other: &Record) -> bool {
        self.cache_flush
            && other.cache_flush
            && self.hashes.name == other.hashes.name
            && self.hashes.rdata != other.hashes.rdata
    }

    pub fn can_answer(&self, question: &Question) -> bool {
        match question.qtype {
            QueryType::ANY => {}
            QueryType::Typed(rtype) => {
                if rtype != self.rtype() {
                    return false;
                }
            }
        }
        self.matches_name(&question.name)
    }

    /// Lexicographic order over (class, type, canonical rdata bytes) with
    /// the cache-flush bit cleared. Used only for the simultaneous probe
    /// tiebreak of RFC 6762 §8.2, the later record wins.
    pub fn compare(&self, other: &Record) -> Ordering {
        // Class is always Internet here, so it never decides.
        match self.rtype().into_num().cmp(&other.rtype().into_num()) {
            Ordering::Equal => self.rdata_bytes().cmp(&other.rdata_bytes()),
            unequal => unequal,
        }
    }

    /// Canonical (uncompressed) rdata encoding.
    fn rdata_bytes(&self) -> Vec<u8> {
        let mut buffer = PacketBuffer::default();
        // Canonical names never exceed wire limits if the record was
        // constructable in the first place.
        let _ = self.rdata.write(&mut buffer, true);
        buffer.filled().to_vec()
    }

    /// An equivalent record whose TTL accounts for time already served.
    pub fn clone_with_elapsed(&self, elapsed_secs: u32) -> Record {
        let mut out = self.clone();
        out.ttl = self.ttl.saturating_sub(elapsed_secs);
        out
    }

    pub fn read(buffer: &mut PacketBuffer) -> Result<Record, ReaderError> {
        // NAME a domain name to which this resource record pertains.
        let name = buffer.read_name()?;

        // TYPE two octets containing one of the RR type codes.
        let rtype = buffer.read_u16()?;

        // CLASS two octets; the high bit is the cache-flush bit on this link.
        let class = buffer.read_u16()?;
        let cache_flush = class & CLASS_UNIQUE_BIT != 0;
        let class = class & !CLASS_UNIQUE_BIT;
        if class != CLASS_IN {
            return Err(ReaderError::InvalidClass(class));
        }

        // TTL a 32 bit unsigned integer that specifies the time interval (in
        // seconds) that the resource record may be cached.
        let ttl = buffer.read_u32()?;

        // RDLENGTH an unsigned 16 bit integer, the length in octets of RDATA.
        let data_len = buffer.read_u16()? as usize;

        let rdata = RData::read(buffer, rtype, data_len)?;

        Ok(Record::new(name, rdata)
            .with_ttl(ttl)
            .with_cache_flush(cache_flush))
    }

    pub fn write(&self, buffer: &mut PacketBuffer) -> Result<usize, WriterError> {
        let start_pos = buffer.pos();

        buffer.write_name(&self.name)?;
        buffer.write_u16(self.rtype().into_num());
        let mut class = CLASS_IN;
        if self.cache_flush {
            class |= CLASS_UNIQUE_BIT;
        }
        buffer.write_u16(class);
        buffer.write_u32(self.ttl);

        let len_pos = buffer.pos();
        buffer.write_u16(0);
        self.rdata.write(buffer, false)?;
        let size = buffer.pos() - (len_pos + 2);
        buffer.set_u16(len_pos, size as u16);

        Ok(buffer.pos() - start_pos)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.hashes.whole == other.hashes.whole
    }
}

impl Eq for Record {}

impl std::hash::Hash for Record {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.hashes.whole);
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} IN", self.name, self.ttl)?;
        match &self.rdata {
            RData::A { addr } => write!(f, " A {addr}"),
            RData::AAAA { addr } => write!(f, " AAAA {addr}"),
            RData::PTR { target } => write!(f, " PTR {target}"),
            RData::TXT { data } => write!(f, " TXT ({} entries)", data.entries.len()),
            RData::SRV { port, target, .. } => write!(f, " SRV {port} {target}"),
            RData::NSEC { types, .. } => write!(f, " NSEC {types:?}"),
            RData::Unknown { rtype, bytes } => {
                write!(f, " TYPE{rtype} ({} bytes)", bytes.len())
            }
        }
    }
}
