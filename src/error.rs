use std::fmt::Display;
use std::net::SocketAddr;

use lancast_proto::buffer::WriterError;

/// Failures of the socket layer. Fatal for the owning component: a
/// responder stops, a resolver goes down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// `send` before `bind`.
    NotBound,
    /// Refusing to put an empty packet on the wire.
    EmptyPacket,
    /// The destination is not on this link.
    BadDestination(SocketAddr),
    /// The transport was shut down under us.
    Closed,
    Writer(WriterError),
    Io(String),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotBound => write!(f, "transport is not bound"),
            Self::EmptyPacket => write!(f, "refusing to send an empty packet"),
            Self::BadDestination(address) => {
                write!(f, "destination {address} is not on the local link")
            }
            Self::Closed => write!(f, "transport was shut down"),
            Self::Writer(error) => write!(f, "unable to encode packet: {error}"),
            Self::Io(error) => write!(f, "socket error: {error}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<WriterError> for TransportError {
    fn from(value: WriterError) -> Self {
        Self::Writer(value)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Transport(TransportError),
    /// A record set that cannot be advertised as given. Raised at
    /// construction, never from inside an event handler.
    Validation(String),
    ProbeTimeout,
    ResolveTimeout,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(error) => write!(f, "{error}"),
            Self::Validation(message) => write!(f, "{message}"),
            Self::ProbeTimeout => write!(f, "Could not probe within 1 min"),
            Self::ResolveTimeout => write!(f, "Resolve query timed out"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn should_render_timeout_messages() {
        assert_eq!(Error::ProbeTimeout.to_string(), "Could not probe within 1 min");
        assert_eq!(Error::ResolveTimeout.to_string(), "Resolve query timed out");
    }
}
