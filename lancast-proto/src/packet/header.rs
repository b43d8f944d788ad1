use crate::buffer::{PacketBuffer, ReaderError, WriterError};

#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    /// No error condition
    NoError = 0,
    /// Format error - The name server was unable to interpret the query.
    FormatError = 1,
    /// Server failure - The name server was unable to process this query due to a problem with the name server.
    ServerFailure = 2,
    /// Name Error - this code signifies that the domain name referenced in the query does not exist.
    NameError = 3,
    /// Not Implemented - The name server does not support the requested kind of query.
    NotImplemented = 4,
    /// Refused - The name server refuses to perform the specified operation for policy reasons.
    Refused = 5,
}

impl ResponseCode {
    pub fn from_num(num: u8) -> ResponseCode {
        match num {
            1 => ResponseCode::FormatError,
            2 => ResponseCode::ServerFailure,
            3 => ResponseCode::NameError,
            4 => ResponseCode::NotImplemented,
            5 => ResponseCode::Refused,
            _ => ResponseCode::NoError,
        }
    }
}

#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// A 16 bit identifier assigned by the program that generates the query.
    /// Multicast queries leave it zero, legacy resolvers expect it echoed.
    pub id: u16, // 16 bits
    /// QR A one bit field that specifies whether this message is a query (0), or a response (1).
    pub response: bool, // 1 bit
    /// OPCODE A four bit field that specifies kind of query in this message.
    /// Anything but 0 (a standard query) is discarded on this link.
    pub opcode: u8, // 4 bits
    /// AA Authoritative Answer - every multicast response we send is
    /// authoritative by definition.
    pub authoritative: bool, // 1 bit
    /// TC TrunCation - specifies that this message was truncated due to length
    /// and that the known answer list continues in a follow up packet.
    pub truncated: bool, // 1 bit

    /// Response code - this 4 bit field is set as part of responses.
    pub rcode: ResponseCode, // 4 bits

    /// QDCOUNT an unsigned 16 bit integer specifying the number of entries in the question section.
    pub questions: u16, // 16 bits
    /// ANCOUNT an unsigned 16 bit integer specifying the number of resource records in the answer section.
    pub answers: u16, // 16 bits
    /// NSCOUNT an unsigned 16 bit integer specifying the number of name server resource records in the authority records section.
    pub authorities: u16, // 16 bits
    /// ARCOUNT an unsigned 16 bit integer specifying the number of resource records in the additional records section.
    pub additionals: u16, // 16 bits
}

impl Default for Header {
    fn default() -> Self {
        Self {
            id: 0,
            response: false,
            opcode: 0,
            authoritative: false,
            truncated: false,
            rcode: ResponseCode::NoError,
            questions: 0,
            answers: 0,
            authorities: 0,
            additionals: 0,
        }
    }
}

impl Header {
    pub fn query() -> Self {
        Self::default()
    }

    pub fn response() -> Self {
        Self {
            response: true,
            authoritative: true,
            ..Self::default()
        }
    }

    /// A received header is usable when it carries a standard query opcode,
    /// no error, and responses claim authority. Anything else is dropped
    /// without comment.
    pub fn is_valid(&self) -> bool {
        self.opcode == 0 && self.rcode == ResponseCode::NoError && (!self.response || self.authoritative)
    }

    pub fn read(buffer: &mut PacketBuffer) -> Result<Self, ReaderError> {
        let id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let head = (flags >> 8) as u8;
        let tail = (flags & 0xFF) as u8;

        let questions = buffer.read_u16()?;
        let answers = buffer.read_u16()?;
        let authorities = buffer.read_u16()?;
        let additionals = buffer.read_u16()?;

        Ok(Self {
            id,
            response: (head & (1 << 7)) > 0,
            opcode: (head >> 3) & 0x0F,
            authoritative: (head & (1 << 2)) > 0,
            truncated: (head & (1 << 1)) > 0,
            rcode: ResponseCode::from_num(tail & 0x0F),
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// On transmit every flag other than QR, AA and TC is zero; RD, RA and
    /// the rest have no meaning on the multicast link.
    pub fn write(&self, buffer: &mut PacketBuffer) -> Result<(), WriterError> {
        buffer.write_u16(self.id);

        buffer.write_u8(
            ((self.truncated as u8) << 1)
                | ((self.authoritative as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        );

        buffer.write_u8(self.rcode as u8);

        buffer.write_u16(self.questions);
        buffer.write_u16(self.answers);
        buffer.write_u16(self.authorities);
        buffer.write_u16(self.additionals);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Header, ResponseCode};
    use crate::buffer::PacketBuffer;

    #[test]
    fn should_round_trip_response_header() {
        let mut header = Header::response();
        header.answers = 3;
        header.additionals = 2;

        let mut buffer = PacketBuffer::default();
        header.write(&mut buffer).unwrap();
        buffer.pos = 0;

        let parsed = Header::read(&mut buffer).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_valid());
    }

    #[test]
    fn should_reject_response_without_authority() {
        let mut buffer = PacketBuffer::default();
        let mut header = Header::response();
        header.authoritative = false;
        header.write(&mut buffer).unwrap();
        buffer.pos = 0;

        let parsed = Header::read(&mut buffer).unwrap();
        assert!(!parsed.is_valid());
    }

    #[test]
    fn should_reject_nonzero_opcode() {
        let header = Header {
            opcode: 2,
            ..Header::query()
        };
        assert!(!header.is_valid());
    }

    #[test]
    fn should_reject_error_rcode() {
        let header = Header {
            rcode: ResponseCode::Refused,
            ..Header::query()
        };
        assert!(!header.is_valid());
    }
}
