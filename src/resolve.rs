use lancast_proto::packet::question::Question;
use lancast_proto::packet::record::{RData, Record, RecordType, TxtData};
use lancast_proto::packet::QueryType;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::collections::CacheEvent;
use crate::error::Error;
use crate::offswitch::Offswitch;
use crate::query::{Query, QueryOptions};
use crate::service::{parse_fullname, Service, ServiceType};
use crate::transport::Transport;

/// A resolver that cannot assemble its service in time gives up.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reissue triggered re-queries are batched this long to coalesce bursts.
const REQUERY_BATCH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverEvent {
    /// The service is complete: SRV and TXT known, at least one address.
    Resolved(Service),
    /// A fact of an already resolved service changed.
    Updated(Service),
    /// The resolver stopped and the service is gone.
    Down,
    Error(String),
}

/// Assembles a live service description out of streaming records.
///
/// Watches the answer stream and the cache for the SRV, TXT and address
/// records of one service instance, keeps the assembled `Service` current,
/// and follows cache expiry back down: losing an address demotes, losing
/// the SRV kills the resolver.
pub struct ServiceResolver {
    events: broadcast::Sender<ResolverEvent>,
    offswitch: Offswitch,
    machine: Mutex<Option<Machine>>,
}

impl ServiceResolver {
    pub fn new(transport: Arc<dyn Transport>, fullname: impl Into<String>) -> Result<Self, Error> {
        let fullname = fullname.into();
        let (instance, stype, domain) = parse_fullname(&fullname)?;
        let (events, _) = broadcast::channel(16);
        let offswitch = Offswitch::new();

        let machine = Machine {
            transport,
            fullname,
            instance,
            stype,
            domain,
            host: None,
            port: None,
            txt: None,
            addresses: Vec::new(),
            resolved: false,
            query_switch: None,
            events: events.clone(),
            offswitch: offswitch.clone(),
        };
        Ok(Self {
            events,
            offswitch,
            machine: Mutex::new(Some(machine)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResolverEvent> {
        self.events.subscribe()
    }

    pub fn start(&self) {
        if let Some(machine) = self
            .machine
            .lock()
            .expect("resolver mutex poisoned")
            .take()
        {
            tokio::spawn(machine.run());
        }
    }

    pub fn stop(&self) {
        self.offswitch.stop();
    }
}

struct Machine {
    transport: Arc<dyn Transport>,
    fullname: String,
    instance: String,
    stype: ServiceType,
    domain: String,
    host: Option<String>,
    port: Option<u16>,
    txt: Option<TxtData>,
    addresses: Vec<IpAddr>,
    resolved: bool,
    /// Stops the currently running piece queries.
    query_switch: Option<Offswitch>,
    events: broadcast::Sender<ResolverEvent>,
    offswitch: Offswitch,
}

impl Machine {
    async fn run(mut self) {
        let offswitch = self.offswitch.clone();
        let mut answer_rx = self.transport.answers();
        let mut cache_rx = self.transport.cache().subscribe();

        self.check_cache();
        let mut deadline = if self.is_complete() {
            self.promote();
            None
        } else {
            self.start_queries();
            Some(Instant::now() + RESOLVE_TIMEOUT)
        };

        let mut requery: Vec<Question> = Vec::new();
        let mut requery_at: Option<Instant> = None;

        loop {
            let deadline_at = deadline;
            let timeout = async move {
                match deadline_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            let batch_at = requery_at;
            let batch = async move {
                match batch_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = offswitch.stopped() => break,
                _ = timeout => {
                    let _ = self
                        .events
                        .send(ResolverEvent::Error(Error::ResolveTimeout.to_string()));
                    break;
                }
                result = answer_rx.recv() => match result {
                    Ok(incoming) => {
                        let changed = self.apply_packet_records(
                            incoming.packet.records().cloned().collect(),
                        );
                        if self.is_complete() {
                            if !self.resolved {
                                self.promote();
                                deadline = None;
                            } else if changed {
                                let _ = self.events.send(ResolverEvent::Updated(self.service()));
                            }
                        } else if self.resolved {
                            self.demote();
                            deadline = Some(Instant::now() + RESOLVE_TIMEOUT);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                result = cache_rx.recv() => if let Ok(event) = result {
                    match event {
                        CacheEvent::Reissue(record) => {
                            if let Some(question) = self.requery_question(&record) {
                                if !requery.contains(&question) {
                                    requery.push(question);
                                }
                                requery_at.get_or_insert(Instant::now() + REQUERY_BATCH);
                            }
                        }
                        CacheEvent::Expired(record) => {
                            if self.handle_expiry(&record) {
                                break;
                            }
                            if !self.is_complete() {
                                if self.resolved {
                                    self.demote();
                                }
                                deadline = Some(Instant::now() + RESOLVE_TIMEOUT);
                            }
                        }
                    }
                },
                _ = batch => {
                    let questions = std::mem::take(&mut requery);
                    requery_at = None;
                    if !questions.is_empty() {
                        tracing::debug!("re-querying {} stale record(s)", questions.len());
                        let query = Query::new(
                            Arc::clone(&self.transport),
                            questions,
                            QueryOptions {
                                continuous: false,
                                ignore_cache: true,
                                timeout: None,
                            },
                            self.offswitch.child(),
                        );
                        query.start();
                    }
                },
            }
        }

        if let Some(switch) = self.query_switch.take() {
            switch.stop();
        }
        let _ = self.events.send(ResolverEvent::Down);
    }

    /// Pull whatever the cache already holds.
    fn check_cache(&mut self) {
        let cache = self.transport.cache().clone();
        let mut found = cache.find(&Question::new(self.fullname.clone(), QueryType::ANY), None);
        if let Some(host) = self.host_after(&found) {
            found.extend(cache.find(&Question::new(host.clone(), RecordType::A), None));
            found.extend(cache.find(&Question::new(host, RecordType::AAAA), None));
        }
        self.apply_packet_records(found);
    }

    /// The SRV target, considering records about to be applied.
    fn host_after(&self, records: &[Record]) -> Option<String> {
        for record in records {
            if let RData::SRV { target, .. } = &record.rdata {
                if record.matches_name(&self.fullname) {
                    return Some(target.clone());
                }
            }
        }
        self.host.clone()
    }

    /// Apply the records of one packet: live records only, SRV and TXT
    /// first since the target gates which addresses are relevant.
    fn apply_packet_records(&mut self, mut records: Vec<Record>) -> bool {
        records.retain(|record| record.ttl > 0);
        records.sort_by_key(|record| match record.rtype() {
            RecordType::SRV => 0,
            RecordType::TXT => 1,
            _ => 2,
        });

        let mut changed = false;
        for record in records {
            match &record.rdata {
                RData::SRV { port, target, .. } if record.matches_name(&self.fullname) => {
                    if self
                        .host
                        .as_deref()
                        .map_or(true, |host| !host.eq_ignore_ascii_case(target))
                    {
                        self.host = Some(target.clone());
                        self.addresses.clear();
                        changed = true;
                    }
                    if self.port != Some(*port) {
                        self.port = Some(*port);
                        changed = true;
                    }
                }
                RData::TXT { data } if record.matches_name(&self.fullname) => {
                    if self.txt.as_ref() != Some(data) {
                        self.txt = Some(data.clone());
                        changed = true;
                    }
                }
                RData::A { addr } => {
                    changed |= self.add_address(&record, IpAddr::V4(*addr));
                }
                RData::AAAA { addr } => {
                    changed |= self.add_address(&record, IpAddr::V6(*addr));
                }
                _ => {}
            }
        }
        changed
    }

    fn add_address(&mut self, record: &Record, address: IpAddr) -> bool {
        let relevant = self
            .host
            .as_deref()
            .is_some_and(|host| record.matches_name(host));
        if relevant && !self.addresses.contains(&address) {
            self.addresses.push(address);
            return true;
        }
        false
    }

    fn is_complete(&self) -> bool {
        self.host.is_some() && self.port.is_some() && self.txt.is_some()
            && !self.addresses.is_empty()
    }

    fn promote(&mut self) {
        self.resolved = true;
        if let Some(switch) = self.query_switch.take() {
            switch.stop();
        }
        let _ = self.events.send(ResolverEvent::Resolved(self.service()));
    }

    fn demote(&mut self) {
        self.resolved = false;
        self.start_queries();
    }

    /// One continuous cache-ignoring query for every missing piece.
    fn start_queries(&mut self) {
        if let Some(switch) = self.query_switch.take() {
            switch.stop();
        }
        let mut questions = Vec::new();
        if self.port.is_none() {
            questions.push(Question::new(self.fullname.clone(), RecordType::SRV));
        }
        if self.txt.is_none() {
            questions.push(Question::new(self.fullname.clone(), RecordType::TXT));
        }
        if self.addresses.is_empty() {
            if let Some(host) = &self.host {
                questions.push(Question::new(host.clone(), RecordType::A));
                questions.push(Question::new(host.clone(), RecordType::AAAA));
            }
        }
        if questions.is_empty() {
            return;
        }
        let switch = self.offswitch.child();
        let query = Query::new(
            Arc::clone(&self.transport),
            questions,
            QueryOptions {
                continuous: true,
                ignore_cache: true,
                timeout: None,
            },
            switch.clone(),
        );
        query.start();
        self.query_switch = Some(switch);
    }

    /// A stale record worth re-asking about?
    fn requery_question(&self, record: &Record) -> Option<Question> {
        let about_service = record.matches_name(&self.fullname);
        let about_host = self
            .host
            .as_deref()
            .is_some_and(|host| record.matches_name(host));
        if about_service || about_host {
            Some(Question::new(record.name.clone(), record.rtype()))
        } else {
            None
        }
    }

    /// React to a cache expiry. Returns true when the resolver is done for:
    /// the SRV or a PTR to this instance went away.
    fn handle_expiry(&mut self, record: &Record) -> bool {
        match &record.rdata {
            RData::SRV { .. } if record.matches_name(&self.fullname) => {
                tracing::debug!("SRV expired, {} is down", self.fullname);
                true
            }
            RData::PTR { target } if target.eq_ignore_ascii_case(&self.fullname) => {
                tracing::debug!("PTR expired, {} is down", self.fullname);
                true
            }
            RData::TXT { .. } if record.matches_name(&self.fullname) => {
                self.txt = None;
                false
            }
            RData::A { addr } => {
                self.remove_address(record, IpAddr::V4(*addr));
                false
            }
            RData::AAAA { addr } => {
                self.remove_address(record, IpAddr::V6(*addr));
                false
            }
            _ => false,
        }
    }

    fn remove_address(&mut self, record: &Record, address: IpAddr) {
        let relevant = self
            .host
            .as_deref()
            .is_some_and(|host| record.matches_name(host));
        if relevant {
            self.addresses.retain(|known| *known != address);
        }
    }

    fn service(&self) -> Service {
        Service {
            fullname: self.fullname.clone(),
            instance: self.instance.clone(),
            stype: self.stype.clone(),
            domain: self.domain.clone(),
            host: self.host.clone().unwrap_or_default(),
            port: self.port.unwrap_or_default(),
            addresses: self.addresses.clone(),
            txt: self
                .txt
                .as_ref()
                .map(TxtData::decoded)
                .unwrap_or_default(),
            txt_raw: self.txt.as_ref().map(TxtData::raw).unwrap_or_default(),
        }
    }
}
