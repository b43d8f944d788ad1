use lancast_proto::packet::question::Question;
use lancast_proto::packet::record::Record;
use lancast_proto::packet::Packet;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::collections::CacheEvent;
use crate::offswitch::Offswitch;
use crate::timer;
use crate::transport::{Incoming, Transport};

/// First retransmit delay; doubles per send.
const INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Retransmit interval ceiling.
const MAX_INTERVAL: Duration = Duration::from_secs(3600);

/// Known answers below half their original TTL are no longer worth
/// repeating to the network.
const KNOWN_ANSWER_CUTOFF: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Keep querying on a backoff schedule; one-shots stop at the first
    /// answer packet.
    pub continuous: bool,
    /// Skip the cache short-circuit on start.
    pub ignore_cache: bool,
    pub timeout: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            continuous: true,
            ignore_cache: false,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// A record answering one of the questions, along with the other
    /// records that travelled in the same packet.
    Answer {
        record: Record,
        related: Vec<Record>,
    },
    Timeout,
}

/// A continuous mDNS question set.
///
/// Consults the cache first, then retransmits on an exponential schedule
/// with known-answer suppression both ways: cached shared answers ride
/// along in our queries, and questions other hosts just asked are elided
/// from ours.
pub struct Query {
    transport: Arc<dyn Transport>,
    questions: Vec<Question>,
    options: QueryOptions,
    offswitch: Offswitch,
    events: broadcast::Sender<QueryEvent>,
}

impl Query {
    pub fn new(
        transport: Arc<dyn Transport>,
        questions: Vec<Question>,
        options: QueryOptions,
        offswitch: Offswitch,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            transport,
            questions,
            options,
            offswitch,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.events.subscribe()
    }

    pub fn start(&self) {
        let machine = Machine {
            transport: Arc::clone(&self.transport),
            questions: self.questions.clone(),
            options: self.options.clone(),
            offswitch: self.offswitch.clone(),
            events: self.events.clone(),
            known_answers: HashMap::new(),
        };
        tokio::spawn(machine.run());
    }
}

struct KnownAnswer {
    record: Record,
    received_at: Instant,
}

impl KnownAnswer {
    fn remaining_above(&self, fraction: f64) -> bool {
        let elapsed = self.received_at.elapsed().as_secs_f64();
        f64::from(self.record.ttl) - elapsed >= f64::from(self.record.ttl) * fraction
    }

    fn aged(&self) -> Record {
        self.record
            .clone_with_elapsed(self.received_at.elapsed().as_secs() as u32)
    }
}

struct Machine {
    transport: Arc<dyn Transport>,
    questions: Vec<Question>,
    options: QueryOptions,
    offswitch: Offswitch,
    events: broadcast::Sender<QueryEvent>,
    known_answers: HashMap<u32, KnownAnswer>,
}

impl Machine {
    fn initial_delay() -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(20..120))
    }

    fn prepare(&self) -> Packet {
        let mut packet = Packet::query();
        packet.questions = self.questions.clone();
        packet
    }

    /// Answer questions straight from the cache; unique answers retire
    /// their question, shared ones join the known-answer list.
    fn check_cache(&mut self) {
        let cache = self.transport.cache().clone();
        let mut remaining = Vec::with_capacity(self.questions.len());
        for question in self.questions.drain(..) {
            let found = cache.find(&question, None);
            let mut keep = true;
            for record in &found {
                let related = found
                    .iter()
                    .filter(|other| other.hash() != record.hash())
                    .cloned()
                    .collect();
                let _ = self.events.send(QueryEvent::Answer {
                    record: record.clone(),
                    related,
                });
                if record.cache_flush {
                    keep = false;
                } else {
                    self.known_answers.insert(
                        record.hash(),
                        KnownAnswer {
                            record: record.clone(),
                            received_at: Instant::now(),
                        },
                    );
                }
            }
            if keep {
                remaining.push(question);
            }
        }
        self.questions = remaining;
    }

    /// Fold an inbound answer packet into the question set. Returns how
    /// many questions got answered.
    fn handle_answer(&mut self, incoming: &Incoming) -> usize {
        let records: Vec<Record> = incoming.packet.records().cloned().collect();
        let mut answered = 0;
        for record in &records {
            let matching = self
                .questions
                .iter()
                .filter(|question| record.can_answer(question))
                .count();
            if matching == 0 {
                continue;
            }
            answered += matching;
            let related: Vec<Record> = records
                .iter()
                .filter(|other| other.hash() != record.hash())
                .cloned()
                .collect();
            for _ in 0..matching {
                let _ = self.events.send(QueryEvent::Answer {
                    record: record.clone(),
                    related: related.clone(),
                });
            }
            if record.cache_flush {
                self.questions.retain(|question| !record.can_answer(question));
            } else {
                self.known_answers.insert(
                    record.hash(),
                    KnownAnswer {
                        record: record.clone(),
                        received_at: Instant::now(),
                    },
                );
            }
        }
        answered
    }

    /// Somebody else just multicast the same question; no point in both of
    /// us asking. Only QM questions suppress and only from packets with an
    /// empty known-answer section.
    fn suppress_duplicates(&self, queued: &mut Packet, incoming: &Incoming) {
        if incoming.local || !incoming.packet.answers.is_empty() {
            return;
        }
        let inbound: Vec<u32> = incoming
            .packet
            .questions
            .iter()
            .filter(|question| !question.unicast_response)
            .map(Question::hash)
            .collect();
        queued.questions.retain(|question| {
            question.unicast_response || !inbound.contains(&question.hash())
        });
    }

    /// Known answers still above half their original TTL ride along, with
    /// the cache-flush bit cleared.
    fn fold_known_answers(&self, packet: &mut Packet) {
        for known in self.known_answers.values() {
            if known.remaining_above(KNOWN_ANSWER_CUTOFF) {
                packet.answers.push(known.aged().with_cache_flush(false));
            }
        }
    }

    async fn run(mut self) {
        if !self.options.ignore_cache {
            self.check_cache();
        }
        if self.questions.is_empty() {
            tracing::debug!("every question answered from cache, not querying");
            return;
        }

        let offswitch = self.offswitch.clone();
        let mut answer_rx = self.transport.answers();
        let mut query_rx = self.transport.queries();
        let mut cache_rx = self.transport.cache().subscribe();
        let mut wake_rx = timer::wake_events();

        let mut queued = self.prepare();
        let mut interval = INITIAL_INTERVAL;
        let mut next_send = Instant::now() + Self::initial_delay();
        let timeout = self.options.timeout;
        let mut timeout_at = timeout.map(|t| Instant::now() + t);

        loop {
            let deadline_at = timeout_at;
            let deadline = async move {
                match deadline_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = offswitch.stopped() => break,
                _ = tokio::time::sleep_until(next_send) => {
                    let mut packet = queued;
                    self.fold_known_answers(&mut packet);
                    if packet.questions.is_empty() && packet.answers.is_empty() {
                        tracing::debug!("suppressing empty query packet");
                    } else if let Err(error) = self.transport.send(packet, None).await {
                        tracing::warn!("query send failed: {error}");
                        break;
                    }
                    next_send = Instant::now() + interval;
                    interval = std::cmp::min(interval * 2, MAX_INTERVAL);
                    // prepared right away so inbound queries can suppress
                    // questions before the next transmission
                    queued = self.prepare();
                }
                result = answer_rx.recv() => match result {
                    Ok(incoming) => {
                        self.handle_answer(&incoming);
                        if !self.options.continuous {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("query lagging, skipped {skipped} answer packet(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                result = query_rx.recv() => if let Ok(incoming) = result {
                    self.suppress_duplicates(&mut queued, &incoming);
                },
                result = cache_rx.recv() => if let Ok(event) = result {
                    match event {
                        CacheEvent::Reissue(record) | CacheEvent::Expired(record) => {
                            self.known_answers.remove(&record.hash());
                        }
                    }
                },
                _ = deadline => {
                    let _ = self.events.send(QueryEvent::Timeout);
                    break;
                }
                result = wake_rx.recv() => if result.is_ok() {
                    tracing::debug!("wake from sleep, restarting query schedule");
                    self.known_answers.clear();
                    interval = INITIAL_INTERVAL;
                    next_send = Instant::now() + Self::initial_delay();
                    timeout_at = timeout.map(|t| Instant::now() + t);
                    queued = self.prepare();
                },
            }
        }
    }
}
