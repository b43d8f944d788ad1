use crate::{Message, MAX_DATAGRAM_SIZE};
use async_stream::stream;
use futures_core::stream::Stream;
use std::sync::Arc;
use tokio::net::UdpSocket;

#[derive(Debug)]
pub struct Receiver {
    socket: Arc<UdpSocket>,
}

impl Receiver {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    async fn receive(&self) -> std::io::Result<Message> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (size, address) = self.socket.recv_from(&mut buffer).await?;
        buffer.truncate(size);
        Ok(Message {
            address,
            bytes: buffer,
        })
    }

    pub fn into_stream(self) -> impl Stream<Item = Message> {
        stream! {
            while let Ok(message) = self.receive().await {
                tracing::trace!("received {} bytes from {:?}", message.bytes.len(), message.address);
                yield message;
            }
        }
    }
}
