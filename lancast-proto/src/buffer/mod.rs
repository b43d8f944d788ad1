pub mod reader;
pub mod writer;

pub use reader::ReaderError;
pub use writer::WriterError;

/// Initial allocation for a freshly created buffer. Most mDNS packets fit,
/// the writer grows the storage when they do not.
const INITIAL_SIZE: usize = 512;

#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    pub buf: Vec<u8>,
    pub pos: usize,
}

impl Default for PacketBuffer {
    /// This gives us a fresh buffer for holding the packet contents, and a
    /// field for keeping track of where we are.
    fn default() -> Self {
        PacketBuffer {
            buf: vec![0; INITIAL_SIZE],
            pos: 0,
        }
    }
}

impl PacketBuffer {
    /// Wraps bytes received from the wire so they can be parsed.
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current position within buffer
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// The written portion of the buffer.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}
