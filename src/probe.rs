use lancast_proto::packet::question::Question;
use lancast_proto::packet::record::Record;
use lancast_proto::packet::{Packet, QueryType};
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::collections::RecordCollection;
use crate::offswitch::Offswitch;
use crate::transport::{Incoming, Transport};

/// Probes go out three times, this far apart.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Cool-off before restarting after losing a simultaneous probe tiebreak.
const TIEBREAK_BACKOFF: Duration = Duration::from_secs(1);

const PROBE_COUNT: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    /// The names are ours. `early` means somebody else already proved them
    /// for us and the announcement burst can be skipped.
    Complete { early: bool },
    /// Another host owns conflicting records; the caller has to rename.
    Conflict,
}

/// The pre-advertisement uniqueness check of RFC 6762 §8.1: ask for our own
/// names with the proposed records in the authority section, three times,
/// and watch for contradiction.
pub struct Probe {
    transport: Arc<dyn Transport>,
    records: Vec<Record>,
    /// Our own records as they appear on sibling interfaces; packets
    /// bridged back to us must not read as conflicts.
    bridgeable: RecordCollection,
    offswitch: Offswitch,
    events: broadcast::Sender<ProbeEvent>,
}

impl Probe {
    pub fn new(
        transport: Arc<dyn Transport>,
        records: Vec<Record>,
        bridgeable: RecordCollection,
        offswitch: Offswitch,
    ) -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            transport,
            records,
            bridgeable,
            offswitch,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.events.subscribe()
    }

    pub fn start(&self) {
        let transport = Arc::clone(&self.transport);
        let records = self.records.clone();
        let bridgeable = self.bridgeable.clone();
        let offswitch = self.offswitch.clone();
        let events = self.events.clone();
        tokio::spawn(run(transport, records, bridgeable, offswitch, events));
    }
}

fn probe_packet(records: &[Record]) -> Packet {
    let mut packet = Packet::query();
    let mut asked: Vec<String> = Vec::new();
    for record in records {
        if asked.iter().any(|name| name.eq_ignore_ascii_case(&record.name)) {
            continue;
        }
        asked.push(record.name.clone());
        packet.questions.push(
            Question::new(record.name.clone(), QueryType::ANY).with_unicast_response(true),
        );
    }
    packet.authorities = records.to_vec();
    packet
}

/// RFC 6762 §8.2: group each side's authorities by name, order groups and
/// records deterministically, and compare record by record. The
/// lexicographically later side wins; the side that still has records when
/// the other ran out wins. Returns whether we lost.
fn lost_tiebreak(ours: &[Record], theirs: &[Record]) -> bool {
    fn grouped(records: &[Record]) -> BTreeMap<String, Vec<&Record>> {
        let mut groups: BTreeMap<String, Vec<&Record>> = BTreeMap::new();
        for record in records {
            groups
                .entry(record.name.to_uppercase())
                .or_default()
                .push(record);
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| a.compare(b));
        }
        groups
    }

    let our_groups = grouped(ours);
    let their_groups = grouped(theirs);

    for (name, our_group) in &our_groups {
        let Some(their_group) = their_groups.get(name) else {
            continue;
        };
        let longest = std::cmp::max(our_group.len(), their_group.len());
        for index in 0..longest {
            match (our_group.get(index), their_group.get(index)) {
                (Some(ours), Some(theirs)) => match ours.compare(theirs) {
                    // they are later: they win
                    Ordering::Less => return true,
                    Ordering::Greater => return false,
                    Ordering::Equal => continue,
                },
                // they ran out of records first: we win
                (Some(_), None) => return false,
                (None, Some(_)) => return true,
                (None, None) => unreachable!(),
            }
        }
    }
    false
}

async fn run(
    transport: Arc<dyn Transport>,
    records: Vec<Record>,
    bridgeable: RecordCollection,
    offswitch: Offswitch,
    events: broadcast::Sender<ProbeEvent>,
) {
    let mut answer_rx = transport.answers();
    let mut probe_rx = transport.probes();
    let candidates: RecordCollection = records.iter().cloned().collect();

    'restart: loop {
        let mut sends = 0u8;
        let mut delay = Duration::from_millis(rand::thread_rng().gen_range(0..250));

        loop {
            tokio::select! {
                _ = offswitch.stopped() => return,
                _ = tokio::time::sleep(delay) => {
                    if sends == PROBE_COUNT {
                        let _ = events.send(ProbeEvent::Complete { early: false });
                        return;
                    }
                    if let Err(error) = transport.send(probe_packet(&records), None).await {
                        tracing::warn!("probe send failed: {error}");
                        return;
                    }
                    sends += 1;
                    delay = PROBE_INTERVAL;
                }
                result = answer_rx.recv() => {
                    let incoming = match result {
                        Ok(incoming) => incoming,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    };
                    let observed: RecordCollection =
                        incoming.packet.records().cloned().collect();

                    // every candidate is already out there, verbatim:
                    // somebody proved the names for us
                    if records.iter().all(|candidate| observed.has(candidate)) {
                        let _ = events.send(ProbeEvent::Complete { early: true });
                        return;
                    }

                    let conflicts = candidates.get_conflicts(&observed);
                    if conflicts.is_empty() {
                        continue;
                    }
                    if conflicts.iter().all(|record| bridgeable.has(record)) {
                        tracing::debug!("ignoring bridged copies of our own records");
                        continue;
                    }
                    let _ = events.send(ProbeEvent::Conflict);
                    return;
                }
                result = probe_rx.recv() => {
                    let incoming = match result {
                        Ok(incoming) => incoming,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    };
                    if incoming.local {
                        continue;
                    }
                    if lost_tiebreak(&records, &incoming.packet.authorities) {
                        tracing::debug!("lost simultaneous probe tiebreak, backing off");
                        tokio::select! {
                            _ = offswitch.stopped() => return,
                            _ = tokio::time::sleep(TIEBREAK_BACKOFF) => {}
                        }
                        continue 'restart;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{lost_tiebreak, Probe, ProbeEvent};
    use crate::collections::RecordCollection;
    use crate::offswitch::Offswitch;
    use crate::transport::mock::MockTransport;
    use lancast_proto::packet::record::Record;
    use lancast_proto::packet::Packet;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn candidate() -> Record {
        Record::srv("Test._test._tcp.local.", "host.local.", 4444)
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([169, 254, 9, 9], 5353))
    }

    async fn next_event(events: &mut broadcast::Receiver<ProbeEvent>) -> ProbeEvent {
        tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("no probe event")
            .expect("events closed")
    }

    fn start_probe(
        transport: &std::sync::Arc<MockTransport>,
        records: Vec<Record>,
        bridgeable: RecordCollection,
    ) -> (Probe, broadcast::Receiver<ProbeEvent>) {
        let probe = Probe::new(transport.clone(), records, bridgeable, Offswitch::new());
        let events = probe.subscribe();
        probe.start();
        (probe, events)
    }

    #[tokio::test(start_paused = true)]
    async fn should_probe_three_times_then_complete() {
        let transport = MockTransport::new();
        let (_probe, mut events) =
            start_probe(&transport, vec![candidate()], RecordCollection::new());

        let event = next_event(&mut events).await;
        assert_eq!(event, ProbeEvent::Complete { early: false });

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        for (packet, _) in sent {
            assert!(packet.is_probe());
            assert_eq!(packet.authorities.len(), 1);
            assert_eq!(packet.questions.len(), 1);
            assert!(packet.questions[0].unicast_response);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_complete_early_when_records_already_proven() {
        let transport = MockTransport::new();
        let (_probe, mut events) =
            start_probe(&transport, vec![candidate()], RecordCollection::new());
        transport.wait_for_sends(1).await;

        transport.receive_multicast(Packet::response().with_answer(candidate()));
        let event = next_event(&mut events).await;
        assert_eq!(event, ProbeEvent::Complete { early: true });
    }

    #[tokio::test(start_paused = true)]
    async fn should_conflict_on_contradicting_answer() {
        let transport = MockTransport::new();
        let (_probe, mut events) =
            start_probe(&transport, vec![candidate()], RecordCollection::new());
        transport.wait_for_sends(1).await;

        let theirs = Record::srv("Test._test._tcp.local.", "other.local.", 9999);
        transport.receive_multicast(Packet::response().with_answer(theirs));
        let event = next_event(&mut events).await;
        assert_eq!(event, ProbeEvent::Conflict);
    }

    #[tokio::test(start_paused = true)]
    async fn should_ignore_bridged_conflicts() {
        let transport = MockTransport::new();
        let bridged = Record::srv("Test._test._tcp.local.", "other.local.", 9999);
        let bridgeable: RecordCollection = [bridged.clone()].into_iter().collect();
        let (_probe, mut events) = start_probe(&transport, vec![candidate()], bridgeable);
        transport.wait_for_sends(1).await;

        transport.receive_multicast(Packet::response().with_answer(bridged));
        // the bridged copy is not a conflict; probing completes normally
        let event = next_event(&mut events).await;
        assert_eq!(event, ProbeEvent::Complete { early: false });
    }

    #[tokio::test(start_paused = true)]
    async fn should_restart_after_losing_tiebreak() {
        let transport = MockTransport::new();
        let mine = Record::a("host.local.", Ipv4Addr::new(1, 1, 1, 1));
        let theirs = Record::a("host.local.", Ipv4Addr::new(2, 2, 2, 2));
        let (_probe, mut events) =
            start_probe(&transport, vec![mine], RecordCollection::new());
        transport.wait_for_sends(1).await;
        transport.clear_sent();

        transport.receive(
            Packet::query().with_authority(theirs),
            peer(),
            false,
        );

        // loses, backs off one second, probes three more times, completes
        let event = next_event(&mut events).await;
        assert_eq!(event, ProbeEvent::Complete { early: false });
        assert!(transport.sent_count() >= 3);
    }

    #[test]
    fn tiebreak_should_prefer_later_rdata() {
        let low = Record::a("host.local.", Ipv4Addr::new(1, 1, 1, 1));
        let high = Record::a("host.local.", Ipv4Addr::new(2, 2, 2, 2));

        assert!(lost_tiebreak(&[low.clone()], &[high.clone()]));
        assert!(!lost_tiebreak(&[high.clone()], &[low.clone()]));
        // exactly one side loses
        assert_ne!(
            lost_tiebreak(&[low.clone()], &[high.clone()]),
            lost_tiebreak(&[high], &[low])
        );
    }

    #[test]
    fn tiebreak_should_treat_identical_sets_as_tie() {
        let record = Record::a("host.local.", Ipv4Addr::new(1, 1, 1, 1));
        assert!(!lost_tiebreak(&[record.clone()], &[record]));
    }

    #[test]
    fn tiebreak_should_favor_the_longer_set_on_ties() {
        let shared = Record::a("host.local.", Ipv4Addr::new(1, 1, 1, 1));
        let extra = Record::aaaa("host.local.", "fe80::1".parse().unwrap());

        assert!(lost_tiebreak(
            &[shared.clone()],
            &[shared.clone(), extra.clone()]
        ));
        assert!(!lost_tiebreak(&[shared.clone(), extra], &[shared]));
    }

    #[test]
    fn tiebreak_should_ignore_unrelated_names() {
        let mine = Record::a("host.local.", Ipv4Addr::new(1, 1, 1, 1));
        let theirs = Record::a("other.local.", Ipv4Addr::new(2, 2, 2, 2));
        assert!(!lost_tiebreak(&[mine], &[theirs]));
    }
}
