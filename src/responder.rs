use lancast_proto::packet::record::{RData, Record, RecordType};
use lancast_proto::packet::Packet;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::collections::RecordCollection;
use crate::error::{Error, TransportError};
use crate::offswitch::Offswitch;
use crate::probe::{Probe, ProbeEvent};
use crate::timer;
use crate::transport::{Incoming, Transport};

/// Announcement burst after a successful probe.
const ANNOUNCE_COUNT: u8 = 3;

/// Hard ceiling on one probing attempt, rename loops included.
const PROBE_LIMIT: Duration = Duration::from_secs(60);

/// Rename throttling: this many conflicts inside the window force a
/// cooldown before the next probe, so a pathological peer cannot make us
/// flood the network with rename attempts.
const CONFLICT_WINDOW: Duration = Duration::from_secs(15);
const CONFLICT_LIMIT: usize = 15;
const CONFLICT_COOLDOWN: Duration = Duration::from_secs(5);

/// A QU question gets a unicast reply only if we multicast the record this
/// recently (as a fraction of its TTL); otherwise the group needs to hear
/// it anyway.
const UNICAST_RECENCY: f32 = 0.25;

/// Known-answer suppression: a record the querier still holds above half
/// its original TTL does not need repeating.
const KNOWN_ANSWER_CUTOFF: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderEvent {
    Probing,
    Responding,
    /// The record set was renamed to resolve a conflict; carries the new
    /// instance label.
    Rename(String),
    Stopped,
    Error(String),
}

enum Command {
    UpdateEach {
        rtype: RecordType,
        mutator: Box<dyn FnMut(&mut Record) + Send>,
    },
    Goodbye,
}

enum State {
    Probing,
    Responding { early: bool },
    Goodbying,
    Stopped { error: Option<Error> },
}

/// Owns one unique-named record set and walks it through probe, announce,
/// defend and goodbye.
///
/// The responder probes its records for uniqueness, announces them once
/// proven, answers queries and probes for them while responding, renames
/// and re-probes on conflict, and multicasts a goodbye when gracefully
/// stopped.
pub struct Responder {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ResponderEvent>,
    offswitch: Offswitch,
    machine: Mutex<Option<Machine>>,
}

impl Responder {
    pub fn new(
        transport: Arc<dyn Transport>,
        records: Vec<Record>,
        bridgeable: Vec<Record>,
    ) -> Result<Self, Error> {
        let unique_names: HashSet<String> = records
            .iter()
            .filter(|record| record.cache_flush)
            .map(|record| record.name.to_lowercase())
            .collect();
        let name = match (unique_names.len(), unique_names.into_iter().next()) {
            (1, Some(name)) => records
                .iter()
                .find(|record| record.matches_name(&name))
                .map(|record| record.name.clone())
                .unwrap_or(name),
            (0, _) => {
                return Err(Error::Validation(
                    "responder needs at least one unique record".into(),
                ))
            }
            _ => {
                return Err(Error::Validation(
                    "responder record set must have exactly one unique name".into(),
                ))
            }
        };
        let base_label = name.split('.').next().unwrap_or_default().to_string();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let offswitch = Offswitch::new();

        let machine = Machine {
            transport,
            records,
            bridgeable,
            name,
            base_label,
            rename_count: 0,
            conflicts: VecDeque::new(),
            announced: false,
            command_rx: Some(command_rx),
            events: events.clone(),
            offswitch: offswitch.clone(),
        };

        Ok(Self {
            commands,
            events,
            offswitch,
            machine: Mutex::new(Some(machine)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResponderEvent> {
        self.events.subscribe()
    }

    pub fn start(&self) {
        if let Some(machine) = self
            .machine
            .lock()
            .expect("responder mutex poisoned")
            .take()
        {
            tokio::spawn(machine.run());
        }
    }

    /// Run `mutator` over every owned record of the given type, rehash, and
    /// either re-announce (responding) or re-probe (probing).
    pub fn update_each<F>(&self, rtype: RecordType, mutator: F)
    where
        F: FnMut(&mut Record) + Send + 'static,
    {
        let _ = self.commands.send(Command::UpdateEach {
            rtype,
            mutator: Box::new(mutator),
        });
    }

    /// Graceful stop: say goodbye, then stop.
    pub fn goodbye(&self) {
        let _ = self.commands.send(Command::Goodbye);
    }

    /// Force stop, no goodbye.
    pub fn stop(&self) {
        self.offswitch.stop();
    }
}

struct Machine {
    transport: Arc<dyn Transport>,
    records: Vec<Record>,
    bridgeable: Vec<Record>,
    /// Current unique name, original casing.
    name: String,
    /// First label of the name as constructed, before any rename suffix.
    base_label: String,
    rename_count: u32,
    conflicts: VecDeque<Instant>,
    announced: bool,
    command_rx: Option<mpsc::UnboundedReceiver<Command>>,
    events: broadcast::Sender<ResponderEvent>,
    offswitch: Offswitch,
}

impl Machine {
    async fn run(mut self) {
        self.transport.acquire();
        let mut commands = self.command_rx.take().expect("responder started twice");

        let mut state = State::Probing;
        loop {
            state = match state {
                State::Probing => self.probing(&mut commands).await,
                State::Responding { early } => self.responding(early, &mut commands).await,
                State::Goodbying => self.goodbying().await,
                State::Stopped { error } => {
                    if let Some(error) = error {
                        let _ = self.events.send(ResponderEvent::Error(error.to_string()));
                    }
                    break;
                }
            };
        }
        let _ = self.events.send(ResponderEvent::Stopped);
        self.transport.release().await;
    }

    async fn probing(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> State {
        let _ = self.events.send(ResponderEvent::Probing);
        let offswitch = self.offswitch.clone();

        self.prune_conflicts();
        if self.conflicts.len() >= CONFLICT_LIMIT {
            tracing::warn!(
                "{} conflicts within {:?}, cooling down",
                self.conflicts.len(),
                CONFLICT_WINDOW
            );
            tokio::select! {
                _ = offswitch.stopped() => return State::Stopped { error: None },
                _ = tokio::time::sleep(CONFLICT_COOLDOWN) => {}
            }
        }

        // Short-circuit on what this interface already knows: everything
        // present means the names are proven, a cached contradiction means
        // probing would be pointless.
        let cache = self.transport.cache();
        if self
            .records
            .iter()
            .all(|record| cache.has(record))
        {
            tracing::debug!("all records already cached, skipping probe");
            return State::Responding { early: true };
        }
        let cached_conflict = self.records.iter().any(|record| {
            cache
                .find_conflict(record)
                .is_some_and(|conflict| !self.is_bridged(&conflict))
        });
        if cached_conflict {
            self.register_conflict();
            self.rename();
            return State::Probing;
        }

        // only unique records get probed; shared pointers cannot conflict
        let candidates: Vec<Record> = self
            .records
            .iter()
            .filter(|record| record.cache_flush)
            .cloned()
            .collect();
        let child = self.offswitch.child();
        let probe = Probe::new(
            Arc::clone(&self.transport),
            candidates,
            self.bridgeable.iter().cloned().collect(),
            child.clone(),
        );
        let mut probe_events = probe.subscribe();
        probe.start();

        let mut error_rx = self.transport.errors();
        let deadline = tokio::time::sleep(PROBE_LIMIT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = offswitch.stopped() => {
                    child.stop();
                    return State::Stopped { error: None };
                }
                _ = &mut deadline => {
                    child.stop();
                    return State::Stopped { error: Some(Error::ProbeTimeout) };
                }
                result = probe_events.recv() => match result {
                    Ok(ProbeEvent::Complete { early }) => return State::Responding { early },
                    Ok(ProbeEvent::Conflict) => {
                        child.stop();
                        self.register_conflict();
                        self.rename();
                        return State::Probing;
                    }
                    Err(_) => {
                        child.stop();
                        return State::Stopped { error: None };
                    }
                },
                result = error_rx.recv() => if let Ok(error) = result {
                    child.stop();
                    return State::Stopped { error: Some(error.into()) };
                },
                command = commands.recv() => match command {
                    Some(Command::UpdateEach { rtype, mutator }) => {
                        child.stop();
                        self.apply_update(rtype, mutator);
                        return State::Probing;
                    }
                    Some(Command::Goodbye) | None => {
                        child.stop();
                        return State::Goodbying;
                    }
                },
            }
        }
    }

    async fn responding(
        &mut self,
        early: bool,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> State {
        let _ = self.events.send(ResponderEvent::Responding);
        let offswitch = self.offswitch.clone();

        let mut query_rx = self.transport.queries();
        let mut probe_rx = self.transport.probes();
        let mut answer_rx = self.transport.answers();
        let mut error_rx = self.transport.errors();
        let mut wake_rx = timer::wake_events();

        let mut announcements_left = if early { 0 } else { ANNOUNCE_COUNT };
        let mut announce_at = Instant::now();
        let mut announce_gap = Duration::from_secs(1);

        loop {
            let announce_pending = announcements_left > 0;
            let next_announce = announce_at;
            let announce = async move {
                if announce_pending {
                    tokio::time::sleep_until(next_announce).await
                } else {
                    std::future::pending().await
                }
            };

            tokio::select! {
                _ = offswitch.stopped() => return State::Stopped { error: None },
                _ = announce => {
                    if let Err(error) = self.announce().await {
                        return State::Stopped { error: Some(error.into()) };
                    }
                    announcements_left -= 1;
                    announce_at = Instant::now() + announce_gap;
                    announce_gap *= 2;
                }
                result = probe_rx.recv() => if let Ok(incoming) = result {
                    if let Err(error) = self.answer_packet(&incoming, false).await {
                        return State::Stopped { error: Some(error.into()) };
                    }
                },
                result = query_rx.recv() => if let Ok(incoming) = result {
                    if let Err(error) = self.answer_packet(&incoming, true).await {
                        return State::Stopped { error: Some(error.into()) };
                    }
                },
                result = answer_rx.recv() => if let Ok(incoming) = result {
                    match self.handle_answer(&incoming).await {
                        Ok(true) => return State::Probing,
                        Ok(false) => {}
                        Err(error) => return State::Stopped { error: Some(error.into()) },
                    }
                },
                result = error_rx.recv() => if let Ok(error) = result {
                    return State::Stopped { error: Some(error.into()) };
                },
                command = commands.recv() => match command {
                    Some(Command::UpdateEach { rtype, mutator }) => {
                        self.apply_update(rtype, mutator);
                        if let Err(error) = self.announce().await {
                            return State::Stopped { error: Some(error.into()) };
                        }
                    }
                    Some(Command::Goodbye) | None => return State::Goodbying,
                },
                result = wake_rx.recv() => if result.is_ok() {
                    tracing::info!("wake from sleep, re-probing {}", self.name);
                    return State::Probing;
                },
            }
        }
    }

    async fn goodbying(&mut self) -> State {
        if !self.announced {
            return State::Stopped { error: None };
        }
        let mut packet = Packet::response();
        packet.answers = self
            .records
            .iter()
            .map(|record| record.clone().with_ttl(0))
            .collect();
        if let Err(error) = self.transport.send(packet, None).await {
            tracing::warn!("goodbye send failed: {error}");
        }
        State::Stopped { error: None }
    }

    /// Multicast the whole record set.
    async fn announce(&mut self) -> Result<(), TransportError> {
        let packet = Packet::response()
            .with_answers(self.records.iter().cloned())
            .with_suggested_additionals();
        self.transport.send(packet, None).await?;
        self.announced = true;
        Ok(())
    }

    /// Answer the questions of an inbound probe or query with our records.
    ///
    /// Queries additionally get known-answer suppression and the legacy
    /// treatment: resolvers on an ephemeral port always receive unicast,
    /// with their id and question echoed.
    async fn answer_packet(
        &mut self,
        incoming: &Incoming,
        is_query: bool,
    ) -> Result<(), TransportError> {
        let legacy = is_query && incoming.is_legacy();
        let mut multicast: Vec<Record> = Vec::new();
        let mut unicast: Vec<Record> = Vec::new();

        for question in &incoming.packet.questions {
            let matching: Vec<Record> = self
                .records
                .iter()
                .filter(|record| record.can_answer(question))
                .cloned()
                .collect();

            if matching.is_empty() {
                // We own the name but have nothing of this type: prove the
                // absence instead of staying silent.
                if self.owns(&question.name) {
                    let nsec = self.nsec_record();
                    if legacy {
                        unicast.push(nsec);
                    } else {
                        multicast.push(nsec);
                    }
                }
                continue;
            }

            for record in matching {
                if is_query
                    && incoming.packet.answers.iter().any(|known| {
                        *known == record
                            && f64::from(known.ttl) > f64::from(record.ttl) * KNOWN_ANSWER_CUTOFF
                    })
                {
                    continue;
                }
                if legacy {
                    unicast.push(record);
                } else if question.unicast_response
                    && self.transport.has_recently_sent(&record, UNICAST_RECENCY)
                {
                    unicast.push(record);
                } else {
                    multicast.push(record);
                }
            }
        }

        dedupe(&mut multicast);
        dedupe(&mut unicast);

        if !multicast.is_empty() {
            let packet = Packet::response()
                .with_answers(multicast)
                .with_suggested_additionals();
            self.send_answer(packet, None).await?;
        }
        if !unicast.is_empty() {
            let mut packet = Packet::response()
                .with_answers(unicast)
                .with_suggested_additionals();
            if legacy {
                packet.header.id = incoming.packet.header.id;
                packet.questions = incoming.packet.questions.clone();
            }
            self.send_answer(packet, Some(incoming.origin)).await?;
        }
        Ok(())
    }

    /// Send a defensive answer; a refused destination is the peer's
    /// problem, not a reason to stop responding.
    async fn send_answer(
        &mut self,
        packet: Packet,
        destination: Option<std::net::SocketAddr>,
    ) -> Result<(), TransportError> {
        match self.transport.send(packet, destination).await {
            Ok(()) => {
                self.announced = true;
                Ok(())
            }
            Err(TransportError::BadDestination(address)) => {
                tracing::debug!("not answering off-link querier {address}");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// React to somebody else's answers. Returns `Ok(true)` when a real
    /// conflict demands re-probing.
    async fn handle_answer(&mut self, incoming: &Incoming) -> Result<bool, TransportError> {
        let observed: Vec<&Record> = incoming.packet.records().collect();

        let ours: RecordCollection = self.records.iter().cloned().collect();
        let observed_set: RecordCollection = observed.iter().map(|r| (*r).clone()).collect();
        let conflicts = ours.get_conflicts(&observed_set);
        if !conflicts.is_empty()
            && !conflicts.iter().all(|conflict| self.is_bridged(conflict))
        {
            tracing::info!("live conflict on {}, re-probing", self.name);
            return Ok(true);
        }

        // A goodbye for a record we own, or one of our records bridged in
        // from a sibling interface: both mean caches out there need a
        // refresher.
        let goodbyed = observed
            .iter()
            .any(|record| record.is_goodbye() && self.records.iter().any(|own| own == *record));
        let bridged = observed
            .iter()
            .any(|record| !record.is_goodbye() && self.is_bridged(record));
        if goodbyed || bridged {
            tracing::debug!("re-announcing {} defensively", self.name);
            self.announce().await?;
        }
        Ok(false)
    }

    fn apply_update(
        &mut self,
        rtype: RecordType,
        mut mutator: Box<dyn FnMut(&mut Record) + Send>,
    ) {
        fn visit(records: &mut [Record], rtype: RecordType, f: &mut dyn FnMut(&mut Record)) {
            for record in records {
                if record.rtype() == rtype {
                    f(record);
                    record.rehash();
                }
                visit(&mut record.additionals, rtype, f);
            }
        }
        visit(&mut self.records, rtype, &mut *mutator);
        visit(&mut self.bridgeable, rtype, &mut *mutator);
    }

    fn owns(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn is_bridged(&self, record: &Record) -> bool {
        self.bridgeable.iter().any(|bridged| bridged == record)
    }

    /// Negative answer for our name: the types that do exist at it.
    fn nsec_record(&self) -> Record {
        let types: Vec<RecordType> = self
            .records
            .iter()
            .filter(|record| record.matches_name(&self.name))
            .map(Record::rtype)
            .collect();
        Record::nsec(self.name.clone(), types)
    }

    fn register_conflict(&mut self) {
        self.conflicts.push_back(Instant::now());
    }

    fn prune_conflicts(&mut self) {
        while let Some(oldest) = self.conflicts.front() {
            if oldest.elapsed() > CONFLICT_WINDOW {
                self.conflicts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Resolve a name conflict by suffixing the instance label: `L`,
    /// `L (2)`, `L (3)`, ... Every owned and bridgeable record whose name
    /// or PTR target is the old name is rewritten and rehashed.
    fn rename(&mut self) {
        let old = self.name.clone();
        self.rename_count += 1;
        let label = format!("{} ({})", self.base_label, self.rename_count + 1);
        let new = match old.split_once('.') {
            Some((_, rest)) => format!("{label}.{rest}"),
            None => label.clone(),
        };

        fn visit(records: &mut [Record], old: &str, new: &str) {
            for record in records {
                let mut changed = false;
                if record.matches_name(old) {
                    record.name = new.to_string();
                    changed = true;
                }
                if let RData::PTR { target } = &mut record.rdata {
                    if target.eq_ignore_ascii_case(old) {
                        *target = new.to_string();
                        changed = true;
                    }
                }
                visit(&mut record.additionals, old, new);
                if changed {
                    record.rehash();
                }
            }
        }
        visit(&mut self.records, &old, &new);
        visit(&mut self.bridgeable, &old, &new);

        tracing::info!("renamed {old:?} to {new:?}");
        self.name = new;
        let _ = self.events.send(ResponderEvent::Rename(label));
    }
}

fn dedupe(records: &mut Vec<Record>) {
    let mut seen = HashSet::new();
    records.retain(|record| seen.insert(record.hash()));
}
