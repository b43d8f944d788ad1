use clap::Args;
use lancast_proto::packet::record::{TxtData, TxtEntry};
use std::sync::Arc;

use crate::responder::{Responder, ResponderEvent};
use crate::service::{host_records, service_records, ServiceType};
use crate::transport::Transport;

/// Advertise one service instance until interrupted
#[derive(Args, Debug)]
pub struct Command {
    /// Service type, e.g. "_http._tcp"
    service: String,
    /// Port the service listens on
    port: u16,
    /// Instance name; the hostname is used when omitted
    #[arg(short, long)]
    name: Option<String>,
    /// TXT entries as key or key=value, repeatable
    #[arg(short, long = "txt")]
    txt: Vec<String>,
    /// Service subtypes, repeatable
    #[arg(short, long = "subtype")]
    subtypes: Vec<String>,
}

impl Command {
    pub async fn run(&self, config: crate::config::Config) {
        let stype = ServiceType::parse(&self.service).expect("invalid service type");
        let hostenv = config.host.build();
        let transport = Arc::new(config.transport.build(Arc::clone(&hostenv)));
        transport.bind().await.expect("unable to bind transport");

        let hostname = hostenv.hostname();
        let instance = self.name.clone().unwrap_or_else(|| hostname.clone());
        let txt = TxtData {
            entries: self
                .txt
                .iter()
                .map(|entry| match entry.split_once('=') {
                    Some((key, value)) => TxtEntry::pair(key, value),
                    None => TxtEntry::flag(entry),
                })
                .collect(),
        };
        let records = service_records(
            &instance,
            &stype,
            "local",
            &hostname,
            self.port,
            txt,
            &self.subtypes,
            &hostenv.addresses(),
        );

        // the host name is its own responder: one unique name per record set
        let host = Responder::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            host_records(&hostname, "local", &hostenv.addresses()),
            Vec::new(),
        )
        .expect("unable to build host responder");
        host.start();

        let responder = Responder::new(transport, records, Vec::new())
            .expect("unable to build responder");
        let mut events = responder.subscribe();
        responder.start();

        let watcher = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ResponderEvent::Responding => tracing::info!("advertising {instance:?}"),
                    ResponderEvent::Rename(label) => {
                        tracing::warn!("name taken, continuing as {label:?}")
                    }
                    ResponderEvent::Error(message) => tracing::error!("{message}"),
                    ResponderEvent::Stopped => break,
                    ResponderEvent::Probing => {}
                }
            }
        });

        tokio::signal::ctrl_c().await.expect("unable to listen for ctrl-c");
        tracing::info!("saying goodbye");
        responder.goodbye();
        host.goodbye();
        let _ = watcher.await;
    }
}
