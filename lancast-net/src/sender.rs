use crate::Message;
use std::sync::Arc;
use tokio::net::UdpSocket;

#[derive(Debug)]
pub struct Sender {
    socket: Arc<UdpSocket>,
}

impl Sender {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub async fn send(&self, message: &Message) -> std::io::Result<usize> {
        tracing::trace!("sending {} bytes to {:?}", message.bytes.len(), message.address);
        self.socket.send_to(&message.bytes, message.address).await
    }
}
