pub mod header;
pub mod question;
pub mod record;

use crate::buffer::{PacketBuffer, ReaderError, WriterError};

use record::{Record, RecordType};

/// The only class on this link.
pub const CLASS_IN: u16 = 1;

/// QTYPE: either a concrete record type or the ANY wildcard (255).
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy)]
#[allow(clippy::upper_case_acronyms)]
pub enum QueryType {
    ANY, // 255
    Typed(RecordType),
}

impl QueryType {
    pub fn into_num(self) -> u16 {
        match self {
            QueryType::ANY => 255,
            QueryType::Typed(rtype) => rtype.into_num(),
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            255 => QueryType::ANY,
            other => QueryType::Typed(RecordType::from_num(other)),
        }
    }

    pub fn matches(&self, rtype: RecordType) -> bool {
        match self {
            QueryType::ANY => true,
            QueryType::Typed(own) => *own == rtype,
        }
    }
}

impl From<RecordType> for QueryType {
    fn from(value: RecordType) -> Self {
        QueryType::Typed(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub header: header::Header,
    pub questions: Vec<question::Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl TryFrom<PacketBuffer> for Packet {
    type Error = ReaderError;

    fn try_from(mut buffer: PacketBuffer) -> Result<Self, Self::Error> {
        let header = header::Header::read(&mut buffer)?;

        let mut questions = Vec::with_capacity(header.questions as usize);
        for _ in 0..header.questions {
            questions.push(question::Question::read(&mut buffer)?);
        }

        let mut answers = Vec::with_capacity(header.answers as usize);
        for _ in 0..header.answers {
            answers.push(Record::read(&mut buffer)?);
        }

        let mut authorities = Vec::with_capacity(header.authorities as usize);
        for _ in 0..header.authorities {
            authorities.push(Record::read(&mut buffer)?);
        }

        let mut additionals = Vec::with_capacity(header.additionals as usize);
        for _ in 0..header.additionals {
            additionals.push(Record::read(&mut buffer)?);
        }

        Ok(Packet {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

impl Packet {
    pub fn new(header: header::Header) -> Self {
        Self {
            header,
            ..Self::default()
        }
    }

    pub fn query() -> Self {
        Self::new(header::Header::query())
    }

    pub fn response() -> Self {
        Self::new(header::Header::response())
    }

    pub fn with_question(mut self, question: question::Question) -> Self {
        self.questions.push(question);
        self
    }

    pub fn with_answer(mut self, record: Record) -> Self {
        self.answers.push(record);
        self
    }

    pub fn with_answers(mut self, records: impl IntoIterator<Item = Record>) -> Self {
        self.answers.extend(records);
        self
    }

    pub fn with_authority(mut self, record: Record) -> Self {
        self.authorities.push(record);
        self
    }

    pub fn with_additional(mut self, record: Record) -> Self {
        self.additionals.push(record);
        self
    }

    /// A probe carries proposed records in the authority section of a query.
    pub fn is_probe(&self) -> bool {
        !self.header.response && !self.authorities.is_empty()
    }

    pub fn is_query(&self) -> bool {
        !self.header.response && self.authorities.is_empty()
    }

    pub fn is_answer(&self) -> bool {
        self.header.response
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.header.is_valid()
    }

    /// Every record of every record section.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }

    pub fn create_buffer(&mut self) -> Result<PacketBuffer, WriterError> {
        let mut buffer = PacketBuffer::default();

        self.header.questions = self.questions.len() as u16;
        self.header.answers = self.answers.len() as u16;
        self.header.authorities = self.authorities.len() as u16;
        self.header.additionals = self.additionals.len() as u16;
        self.header.write(&mut buffer)?;

        for question in &self.questions {
            question.write(&mut buffer)?;
        }
        for rec in &self.answers {
            rec.write(&mut buffer)?;
        }
        for rec in &self.authorities {
            rec.write(&mut buffer)?;
        }
        for rec in &self.additionals {
            rec.write(&mut buffer)?;
        }

        Ok(buffer)
    }

    /// Halve a packet that would not fit a datagram.
    ///
    /// Queries split their (known answer) list and flag truncation on the
    /// first half so responders keep waiting for the rest. Answers split
    /// and recompute each half's additionals from the answers' suggested
    /// companions. A packet that cannot shrink yields two empty halves.
    pub fn split(&self) -> (Packet, Packet) {
        if self.answers.len() < 2 {
            return (Packet::default(), Packet::default());
        }
        let mid = self.answers.len() / 2;

        if self.is_answer() {
            let first = Packet::new(self.header.clone())
                .with_answers(self.answers[..mid].iter().cloned());
            let second = Packet::new(self.header.clone())
                .with_answers(self.answers[mid..].iter().cloned());
            (first.with_suggested_additionals(), second.with_suggested_additionals())
        } else {
            let mut first = Packet::new(self.header.clone())
                .with_answers(self.answers[..mid].iter().cloned());
            first.questions = self.questions.clone();
            first.header.truncated = true;
            let second = Packet::new(self.header.clone())
                .with_answers(self.answers[mid..].iter().cloned());
            (first, second)
        }
    }

    /// Rebuild the additionals section from the answers' suggested
    /// companions, skipping records already answered.
    pub fn with_suggested_additionals(mut self) -> Self {
        let mut additionals: Vec<Record> = Vec::new();
        for answer in &self.answers {
            for suggested in &answer.additionals {
                if self.answers.contains(suggested) || additionals.contains(suggested) {
                    continue;
                }
                additionals.push(suggested.clone());
            }
        }
        self.additionals = additionals;
        self
    }
}
