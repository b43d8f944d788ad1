//! End to end flows over a loopback transport: advertise and browse on the
//! same link, conflict renames, live TXT updates, one-shot resolves.

use crate::offswitch::Offswitch;
use crate::query::{Query, QueryEvent, QueryOptions};
use crate::resolve::{ResolverEvent, ServiceResolver};
use crate::responder::{Responder, ResponderEvent};
use crate::service::{service_records, ServiceType};
use crate::transport::mock::MockTransport;
use lancast_proto::packet::question::Question;
use lancast_proto::packet::record::{RData, RecordType, TxtData, TxtEntry};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::broadcast;

fn test_records(instance: &str, host: &str, port: u16) -> Vec<lancast_proto::packet::record::Record> {
    service_records(
        instance,
        &ServiceType::new("test", "tcp"),
        "local",
        host,
        port,
        TxtData::default(),
        &[],
        &[IpAddr::V4([169, 254, 20, 4].into())],
    )
}

async fn wait_responder(events: &mut broadcast::Receiver<ResponderEvent>, wanted: ResponderEvent) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .unwrap_or_else(|_| panic!("never saw {wanted:?}"))
            .expect("responder events closed");
        if event == wanted {
            return;
        }
    }
}

// Advertise & browse: a responder brings the service up, a browser query
// finds the registration pointer, a resolver assembles the full service.
#[tokio::test(start_paused = true)]
async fn advertised_service_should_be_browsable() {
    let transport = MockTransport::new_loopback();

    let responder = Responder::new(
        transport.clone(),
        test_records("Test", "host", 4444),
        Vec::new(),
    )
    .unwrap();
    let mut responder_events = responder.subscribe();
    responder.start();
    wait_responder(&mut responder_events, ResponderEvent::Responding).await;

    let browser = Query::new(
        transport.clone(),
        vec![Question::new("_test._tcp.local.", RecordType::PTR)],
        QueryOptions::default(),
        Offswitch::new(),
    );
    let mut answers = browser.subscribe();
    browser.start();

    let fullname = loop {
        match tokio::time::timeout(Duration::from_secs(60), answers.recv())
            .await
            .expect("browser saw no answer")
            .expect("browser events closed")
        {
            QueryEvent::Answer { record, .. } if record.rtype() == RecordType::PTR => {
                let RData::PTR { target } = &record.rdata else {
                    unreachable!()
                };
                break target.clone();
            }
            _ => {}
        }
    };
    assert_eq!(fullname, "Test._test._tcp.local.");

    let resolver = ServiceResolver::new(transport.clone(), fullname).unwrap();
    let mut resolver_events = resolver.subscribe();
    resolver.start();

    loop {
        match tokio::time::timeout(Duration::from_secs(60), resolver_events.recv())
            .await
            .expect("service never resolved")
            .expect("resolver events closed")
        {
            ResolverEvent::Resolved(service) => {
                assert_eq!(service.instance, "Test");
                assert_eq!(service.stype, ServiceType::new("test", "tcp"));
                assert_eq!(service.host, "host.local.");
                assert_eq!(service.port, 4444);
                assert!(service.txt.is_empty());
                assert_eq!(
                    service.addresses,
                    vec![IpAddr::V4([169, 254, 20, 4].into())]
                );
                break;
            }
            other => panic!("expected Resolved, got {other:?}"),
        }
    }
}

// Rename on conflict: a second responder claiming the same instance with a
// different port has to become "Test (2)"; the first keeps its name.
#[tokio::test(start_paused = true)]
async fn second_responder_should_rename_on_conflict() {
    let transport = MockTransport::new_loopback();

    let first = Responder::new(
        transport.clone(),
        test_records("Test", "host", 4444),
        Vec::new(),
    )
    .unwrap();
    let mut first_events = first.subscribe();
    first.start();
    wait_responder(&mut first_events, ResponderEvent::Responding).await;

    let second = Responder::new(
        transport.clone(),
        test_records("Test", "other", 5555),
        Vec::new(),
    )
    .unwrap();
    let mut second_events = second.subscribe();
    second.start();

    wait_responder(
        &mut second_events,
        ResponderEvent::Rename("Test (2)".into()),
    )
    .await;
    wait_responder(&mut second_events, ResponderEvent::Responding).await;

    // the first responder never renamed
    assert!(matches!(
        first_events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

// No-op rename: identical record sets coexist, neither renames.
#[tokio::test(start_paused = true)]
async fn identical_responders_should_coexist() {
    let transport = MockTransport::new_loopback();

    let first = Responder::new(
        transport.clone(),
        test_records("Test", "host", 4444),
        Vec::new(),
    )
    .unwrap();
    let mut first_events = first.subscribe();
    first.start();
    wait_responder(&mut first_events, ResponderEvent::Responding).await;

    let second = Responder::new(
        transport.clone(),
        test_records("Test", "host", 4444),
        Vec::new(),
    )
    .unwrap();
    let mut second_events = second.subscribe();
    second.start();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), second_events.recv())
            .await
            .expect("second responder stalled")
            .expect("responder events closed");
        match event {
            ResponderEvent::Responding => break,
            ResponderEvent::Rename(label) => panic!("unexpected rename to {label:?}"),
            _ => {}
        }
    }
}

// TXT update: a running advertisement changes its TXT, a watching resolver
// reports the change.
#[tokio::test(start_paused = true)]
async fn txt_update_should_reach_resolvers() {
    let transport = MockTransport::new_loopback();

    let responder = Responder::new(
        transport.clone(),
        test_records("Test", "host", 4444),
        Vec::new(),
    )
    .unwrap();
    let mut responder_events = responder.subscribe();
    responder.start();
    wait_responder(&mut responder_events, ResponderEvent::Responding).await;

    let resolver = ServiceResolver::new(transport.clone(), "Test._test._tcp.local.").unwrap();
    let mut resolver_events = resolver.subscribe();
    resolver.start();
    loop {
        match tokio::time::timeout(Duration::from_secs(60), resolver_events.recv())
            .await
            .expect("service never resolved")
            .expect("resolver events closed")
        {
            ResolverEvent::Resolved(_) => break,
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    responder.update_each(RecordType::TXT, |record| {
        if let RData::TXT { data } = &mut record.rdata {
            data.entries = vec![TxtEntry::pair("key", "value")];
        }
    });

    loop {
        match tokio::time::timeout(Duration::from_secs(60), resolver_events.recv())
            .await
            .expect("resolver never saw the update")
            .expect("resolver events closed")
        {
            ResolverEvent::Updated(service) => {
                assert_eq!(service.txt.get("key"), Some(&"value".to_string()));
                break;
            }
            other => panic!("expected Updated, got {other:?}"),
        }
    }
}

// One-shot SRV resolve against a live advertisement.
#[tokio::test(start_paused = true)]
async fn one_shot_srv_query_should_return_target_and_port() {
    let transport = MockTransport::new_loopback();

    let responder = Responder::new(
        transport.clone(),
        test_records("Test", "host", 4444),
        Vec::new(),
    )
    .unwrap();
    let mut responder_events = responder.subscribe();
    responder.start();
    wait_responder(&mut responder_events, ResponderEvent::Responding).await;

    let query = Query::new(
        transport.clone(),
        vec![Question::new("Test._test._tcp.local.", RecordType::SRV)],
        QueryOptions {
            continuous: false,
            ignore_cache: false,
            timeout: Some(Duration::from_millis(2000)),
        },
        Offswitch::new(),
    );
    let mut events = query.subscribe();
    query.start();

    match tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("no answer before the timeout")
        .expect("query events closed")
    {
        QueryEvent::Answer { record, .. } => match &record.rdata {
            RData::SRV { port, target, .. } => {
                assert_eq!(target, "host.local.");
                assert_eq!(*port, 4444);
            }
            other => panic!("expected SRV, got {other:?}"),
        },
        QueryEvent::Timeout => panic!("query timed out"),
    }
}

// A goodbye from the advertiser takes the service down at the browser.
#[tokio::test(start_paused = true)]
async fn goodbye_should_take_the_service_down() {
    let transport = MockTransport::new_loopback();

    let responder = Responder::new(
        transport.clone(),
        test_records("Test", "host", 4444),
        Vec::new(),
    )
    .unwrap();
    let mut responder_events = responder.subscribe();
    responder.start();
    wait_responder(&mut responder_events, ResponderEvent::Responding).await;

    let resolver = ServiceResolver::new(transport.clone(), "Test._test._tcp.local.").unwrap();
    let mut resolver_events = resolver.subscribe();
    resolver.start();
    loop {
        match tokio::time::timeout(Duration::from_secs(60), resolver_events.recv())
            .await
            .expect("service never resolved")
            .expect("resolver events closed")
        {
            ResolverEvent::Resolved(_) => break,
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    responder.goodbye();
    wait_responder(&mut responder_events, ResponderEvent::Stopped).await;

    loop {
        match tokio::time::timeout(Duration::from_secs(60), resolver_events.recv())
            .await
            .expect("resolver never went down")
            .expect("resolver events closed")
        {
            ResolverEvent::Down => break,
            _ => {}
        }
    }
}
