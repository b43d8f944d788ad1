use async_trait::async_trait;
use lancast_net::{receiver::Receiver, socket, Message, MAX_DATAGRAM_SIZE, MDNS_PORT};
use lancast_proto::buffer::PacketBuffer;
use lancast_proto::packet::record::Record;
use lancast_proto::packet::Packet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::collections::SharedCache;
use crate::error::TransportError;
use crate::hostenv::HostEnv;

/// A packet as it arrived on the wire, with its envelope facts.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub packet: Packet,
    pub origin: SocketAddr,
    /// The origin address belongs to this host (another interface).
    pub local: bool,
}

impl Incoming {
    /// Legacy resolvers query from an ephemeral port and expect unicast
    /// answers with their id echoed.
    pub fn is_legacy(&self) -> bool {
        self.origin.port() != MDNS_PORT
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Channels {
    query: broadcast::Sender<Incoming>,
    probe: broadcast::Sender<Incoming>,
    answer: broadcast::Sender<Incoming>,
    error: broadcast::Sender<TransportError>,
}

impl Channels {
    fn new() -> Self {
        let (query, _) = broadcast::channel(64);
        let (probe, _) = broadcast::channel(64);
        let (answer, _) = broadcast::channel(64);
        let (error, _) = broadcast::channel(16);
        Self {
            query,
            probe,
            answer,
            error,
        }
    }
}

#[derive(Debug, Clone)]
struct SentRecord {
    at: Instant,
    ttl: u32,
}

struct SentExpiry;

impl moka::Expiry<u32, SentRecord> for SentExpiry {
    fn expire_after_create(
        &self,
        _key: &u32,
        value: &SentRecord,
        _now: std::time::Instant,
    ) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_secs(u64::from(value.ttl)))
    }
}

/// Recently transmitted answers, each entry living as long as the record's
/// TTL. Backs the unicast policy: a record multicast recently does not need
/// to go to the group again.
pub struct History {
    inner: moka::sync::Cache<u32, SentRecord>,
}

impl Default for History {
    fn default() -> Self {
        Self {
            inner: moka::sync::Cache::builder()
                .max_capacity(1024)
                .expire_after(SentExpiry)
                .build(),
        }
    }
}

impl History {
    pub fn record(&self, record: &Record) {
        self.inner.insert(
            record.hash(),
            SentRecord {
                at: Instant::now(),
                ttl: record.ttl,
            },
        );
    }

    pub fn has_recently_sent(&self, record: &Record, fraction: f32) -> bool {
        self.inner
            .get(&record.hash())
            .map(|sent| sent.at.elapsed().as_secs_f32() <= sent.ttl as f32 * fraction)
            .unwrap_or(false)
    }
}

/// One logical network interface: send and receive packets, keep the
/// interface's record cache and outgoing history, fan classified inbound
/// packets out to subscribers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn bind(&self) -> Result<(), TransportError>;
    async fn send(&self, packet: Packet, destination: Option<SocketAddr>)
        -> Result<(), TransportError>;

    fn cache(&self) -> &SharedCache;
    fn queries(&self) -> broadcast::Receiver<Incoming>;
    fn probes(&self) -> broadcast::Receiver<Incoming>;
    fn answers(&self) -> broadcast::Receiver<Incoming>;
    fn errors(&self) -> broadcast::Receiver<TransportError>;

    fn has_recently_sent(&self, record: &Record, fraction: f32) -> bool;

    /// Reference counting for shared transports: `acquire` on take,
    /// `release` when done; the last user shuts the sockets down.
    fn acquire(&self);
    async fn release(&self);
}

/// Classify one inbound packet and fan it out. The cache add strictly
/// precedes the answer event, so a subscriber handling `answer` can already
/// read the cache.
pub(crate) fn dispatch(cache: &SharedCache, channels: &Channels, incoming: Incoming) {
    if !incoming.packet.is_valid() {
        tracing::debug!("dropping invalid packet from {:?}", incoming.origin);
        return;
    }
    if incoming.packet.is_answer() {
        if incoming.origin.port() != MDNS_PORT {
            tracing::debug!("dropping answer from legacy port {:?}", incoming.origin);
            return;
        }
        for record in incoming.packet.records() {
            if record.cache_flush {
                cache.flush_related(record);
            }
            cache.add(record.clone());
        }
        let _ = channels.answer.send(incoming);
    } else if incoming.packet.is_probe() {
        if incoming.origin.port() == MDNS_PORT {
            let _ = channels.probe.send(incoming);
        }
    } else {
        let _ = channels.query.send(incoming);
    }
}

/// Whether the core is willing to unicast to this address. Routable and
/// site private destinations are refused: this library only speaks to the
/// local link.
fn sendable_destination(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => {
            if v4.is_multicast() {
                return true;
            }
            let octets = v4.octets();
            let refused = octets[0] == 10
                || octets[0] == 127
                || (octets[0] == 172 && (16..32).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168);
            !refused
        }
        IpAddr::V6(v6) => {
            if v6.is_multicast() {
                return true;
            }
            if v6.is_loopback() {
                return false;
            }
            // unique local fc00::/7
            (v6.segments()[0] & 0xFE00) != 0xFC00
        }
    }
}

fn is_message_size_error(error: &std::io::Error) -> bool {
    // EMSGSIZE: 90 on linux, 40 on the BSDs and macos.
    matches!(error.raw_os_error(), Some(90) | Some(40))
}

#[derive(Debug, serde::Deserialize)]
pub struct Config {
    /// IPv4 address of the interface to join the group on.
    #[serde(default = "Config::default_interface")]
    pub interface: Ipv4Addr,
    /// Receive our own multicast traffic; required for several responders
    /// on one machine, and for the loopback-only test setups.
    #[serde(default = "Config::default_loopback")]
    pub loopback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: Self::default_interface(),
            loopback: Self::default_loopback(),
        }
    }
}

impl Config {
    fn default_interface() -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    fn default_loopback() -> bool {
        true
    }

    pub fn build(self, hostenv: Arc<dyn HostEnv>) -> NetTransport {
        NetTransport::new(self.interface, self.loopback, hostenv)
    }
}

struct Bound {
    send_socket: Arc<UdpSocket>,
    pump: JoinHandle<()>,
}

impl Drop for Bound {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// The real, socket backed transport for one interface.
pub struct NetTransport {
    interface: Ipv4Addr,
    loopback: bool,
    hostenv: Arc<dyn HostEnv>,
    cache: SharedCache,
    history: History,
    channels: Channels,
    bound: Mutex<Option<Bound>>,
    users: AtomicUsize,
}

impl NetTransport {
    pub fn new(interface: Ipv4Addr, loopback: bool, hostenv: Arc<dyn HostEnv>) -> Self {
        Self {
            interface,
            loopback,
            hostenv,
            cache: SharedCache::new(),
            history: History::default(),
            channels: Channels::new(),
            bound: Mutex::new(None),
            users: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for NetTransport {
    /// Bind exactly once, however many callers race here.
    async fn bind(&self) -> Result<(), TransportError> {
        let mut bound = self.bound.lock().await;
        if bound.is_some() {
            return Ok(());
        }

        let receive = socket::receive_socket(self.interface, self.loopback)?;
        let send = socket::send_socket(self.interface)?;
        tracing::info!("transport bound on interface {:?}", self.interface);

        let cache = self.cache.clone();
        let channels = self.channels.clone();
        let hostenv = Arc::clone(&self.hostenv);
        let receiver = Receiver::new(Arc::new(receive));
        let pump = tokio::spawn(async move {
            use futures::StreamExt;
            let stream = receiver.into_stream();
            tokio::pin!(stream);
            while let Some(message) = stream.next().await {
                let Message { address, bytes } = message;
                let packet = match Packet::try_from(PacketBuffer::new(bytes)) {
                    Ok(packet) => packet,
                    Err(error) => {
                        tracing::debug!("unable to read packet from {address:?}: {error}");
                        continue;
                    }
                };
                let local = hostenv.is_local_address(&address.ip());
                dispatch(
                    &cache,
                    &channels,
                    Incoming {
                        packet,
                        origin: address,
                        local,
                    },
                );
            }
        });

        *bound = Some(Bound {
            send_socket: Arc::new(send),
            pump,
        });
        Ok(())
    }

    async fn send(
        &self,
        packet: Packet,
        destination: Option<SocketAddr>,
    ) -> Result<(), TransportError> {
        let socket = {
            let bound = self.bound.lock().await;
            match bound.as_ref() {
                Some(bound) => Arc::clone(&bound.send_socket),
                None => return Err(TransportError::NotBound),
            }
        };
        if packet.is_empty() {
            return Err(TransportError::EmptyPacket);
        }
        let target = destination.unwrap_or_else(lancast_net::group_address);
        if !sendable_destination(&target.ip()) {
            return Err(TransportError::BadDestination(target));
        }

        let mut queue = vec![packet];
        while let Some(mut item) = queue.pop() {
            if item.is_empty() {
                continue;
            }
            if item.is_answer() {
                for record in item.answers.iter().chain(item.additionals.iter()) {
                    self.history.record(record);
                }
            }
            let buffer = item.create_buffer()?;
            if buffer.pos() > MAX_DATAGRAM_SIZE {
                let (first, second) = item.split();
                if first.is_empty() && second.is_empty() {
                    tracing::warn!("packet cannot shrink below datagram size, dropping");
                    continue;
                }
                queue.push(second);
                queue.push(first);
                continue;
            }
            match socket.send_to(buffer.filled(), target).await {
                Ok(_) => {}
                Err(error) if is_message_size_error(&error) => {
                    let (first, second) = item.split();
                    if first.is_empty() && second.is_empty() {
                        tracing::warn!("packet cannot shrink below datagram size, dropping");
                        continue;
                    }
                    queue.push(second);
                    queue.push(first);
                }
                Err(error) => {
                    let error = TransportError::from(error);
                    let _ = self.channels.error.send(error.clone());
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    fn cache(&self) -> &SharedCache {
        &self.cache
    }

    fn queries(&self) -> broadcast::Receiver<Incoming> {
        self.channels.query.subscribe()
    }

    fn probes(&self) -> broadcast::Receiver<Incoming> {
        self.channels.probe.subscribe()
    }

    fn answers(&self) -> broadcast::Receiver<Incoming> {
        self.channels.answer.subscribe()
    }

    fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.channels.error.subscribe()
    }

    fn has_recently_sent(&self, record: &Record, fraction: f32) -> bool {
        self.history.has_recently_sent(record, fraction)
    }

    fn acquire(&self) {
        self.users.fetch_add(1, Ordering::SeqCst);
    }

    async fn release(&self) {
        if self.users.fetch_sub(1, Ordering::SeqCst) == 1 {
            tracing::info!("last user gone, shutting transport down");
            let mut bound = self.bound.lock().await;
            *bound = None;
        }
    }
}
