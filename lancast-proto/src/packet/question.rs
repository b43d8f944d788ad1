use crate::buffer::reader::ReaderError;
use crate::buffer::writer::WriterError;
use crate::buffer::PacketBuffer;
use crate::hash::HashWriter;

use super::record::{Record, CLASS_UNIQUE_BIT};
use super::{QueryType, CLASS_IN};

/// CLASS fields appear in questions; the high bit is the QU (unicast
/// response requested) bit on this link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DnsClass {
    /// IN - the Internet
    Internet = 1,
    /// ANY - matches every class
    Any = 255,
}

impl Default for DnsClass {
    fn default() -> Self {
        Self::Internet
    }
}

impl DnsClass {
    pub fn into_num(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for DnsClass {
    type Error = ReaderError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Internet),
            255 => Ok(Self::Any),
            other => Err(ReaderError::InvalidClass(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Question {
    /// QNAME a domain name represented as a sequence of labels.
    pub name: String,
    /// QTYPE a two octet code which specifies the type of the query, a
    /// record type or ANY.
    pub qtype: QueryType,
    /// QCLASS a two octet code that specifies the class of the query.
    pub qclass: DnsClass,
    /// The QU bit: the querier would like a unicast reply.
    pub unicast_response: bool,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: impl Into<QueryType>) -> Self {
        Self {
            name: name.into(),
            qtype: qtype.into(),
            qclass: DnsClass::default(),
            unicast_response: false,
        }
    }

    pub fn with_unicast_response(mut self, unicast_response: bool) -> Self {
        self.unicast_response = unicast_response;
        self
    }

    /// Deterministic identity, computed like a record's namehash: there is
    /// no rdata to tell questions apart.
    pub fn hash(&self) -> u32 {
        let mut writer = HashWriter::default();
        writer.text(&self.name);
        writer.number(u64::from(self.qtype.into_num()));
        writer.number(u64::from(self.qclass.into_num()));
        writer.finish()
    }

    pub fn can_be_answered_by(&self, record: &Record) -> bool {
        record.can_answer(self)
    }

    pub fn read(buffer: &mut PacketBuffer) -> Result<Self, ReaderError> {
        let name = buffer.read_name()?;
        let qtype = QueryType::from_num(buffer.read_u16()?);
        let class = buffer.read_u16()?;
        let unicast_response = class & CLASS_UNIQUE_BIT != 0;
        let qclass = DnsClass::try_from(class & !CLASS_UNIQUE_BIT)?;

        Ok(Self {
            name,
            qtype,
            qclass,
            unicast_response,
        })
    }

    pub fn write(&self, buffer: &mut PacketBuffer) -> Result<(), WriterError> {
        buffer.write_name(&self.name)?;
        buffer.write_u16(self.qtype.into_num());
        let mut class = self.qclass.into_num();
        if self.unicast_response {
            class |= CLASS_UNIQUE_BIT;
        }
        buffer.write_u16(class);

        Ok(())
    }
}

impl PartialEq for Question {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Question {}
