use clap::Args;
use lancast_proto::packet::question::Question;
use lancast_proto::packet::record::{RData, RecordType};
use std::collections::HashMap;
use std::sync::Arc;

use crate::offswitch::Offswitch;
use crate::query::{Query, QueryEvent, QueryOptions};
use crate::resolve::{ResolverEvent, ServiceResolver};
use crate::service::ServiceType;
use crate::transport::Transport;

/// Browse for service instances until interrupted
#[derive(Args, Debug)]
pub struct Command {
    /// Service type, e.g. "_http._tcp"
    service: String,
}

impl Command {
    pub async fn run(&self, config: crate::config::Config) {
        let stype = ServiceType::parse(&self.service).expect("invalid service type");
        let hostenv = config.host.build();
        let transport: Arc<dyn Transport> = Arc::new(config.transport.build(hostenv));
        transport.bind().await.expect("unable to bind transport");

        let registration = stype.fqdn("local");
        tracing::info!("browsing for {registration}");

        let offswitch = Offswitch::new();
        let query = Query::new(
            Arc::clone(&transport),
            vec![Question::new(registration, RecordType::PTR)],
            QueryOptions::default(),
            offswitch.clone(),
        );
        let mut answers = query.subscribe();
        query.start();

        let browser = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                // one resolver per live instance; a goodbye frees the slot
                // so the instance can come back later
                let active: Arc<std::sync::Mutex<HashMap<String, ServiceResolver>>> =
                    Arc::default();
                while let Ok(event) = answers.recv().await {
                    let QueryEvent::Answer { record, .. } = event else {
                        continue;
                    };
                    if record.rtype() != RecordType::PTR || record.is_goodbye() {
                        continue;
                    }
                    let RData::PTR { target } = &record.rdata else {
                        continue;
                    };
                    if active.lock().expect("browser mutex poisoned").contains_key(target) {
                        continue;
                    }
                    let Ok(resolver) = ServiceResolver::new(Arc::clone(&transport), target.clone())
                    else {
                        continue;
                    };
                    let fullname = target.clone();
                    let mut events = resolver.subscribe();
                    let slots = Arc::clone(&active);
                    tokio::spawn(async move {
                        while let Ok(event) = events.recv().await {
                            match event {
                                ResolverEvent::Resolved(service) => tracing::info!(
                                    "up: {:?} at {}:{} {:?}",
                                    service.instance,
                                    service.host,
                                    service.port,
                                    service.txt,
                                ),
                                ResolverEvent::Updated(service) => {
                                    tracing::info!("changed: {:?} {:?}", service.instance, service.txt)
                                }
                                ResolverEvent::Down => {
                                    tracing::info!("down: {fullname:?}");
                                    slots.lock().expect("browser mutex poisoned").remove(&fullname);
                                    break;
                                }
                                ResolverEvent::Error(message) => tracing::debug!("{message}"),
                            }
                        }
                    });
                    resolver.start();
                    active
                        .lock()
                        .expect("browser mutex poisoned")
                        .insert(target.clone(), resolver);
                }
            })
        };

        tokio::signal::ctrl_c().await.expect("unable to listen for ctrl-c");
        offswitch.stop();
        browser.abort();
    }
}
