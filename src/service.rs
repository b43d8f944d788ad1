use lancast_proto::packet::record::{Record, TxtData};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::error::Error;

/// The DNS-SD service type enumerator name.
pub const ENUMERATOR: &str = "_services._dns-sd._udp";

/// A service type, e.g. `{name: "http", protocol: "tcp"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceType {
    pub name: String,
    pub protocol: String,
}

impl ServiceType {
    pub fn new(name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            name: strip_underscore(name.into()),
            protocol: strip_underscore(protocol.into()),
        }
    }

    /// Parse `_http._tcp` style input.
    pub fn parse(value: &str) -> Result<Self, Error> {
        let mut labels = value.trim_end_matches('.').split('.');
        match (labels.next(), labels.next(), labels.next()) {
            (Some(name), Some(protocol), None) if !name.is_empty() && !protocol.is_empty() => {
                Ok(Self::new(name, protocol))
            }
            _ => Err(Error::Validation(format!(
                "{value:?} is not a service type like \"_http._tcp\""
            ))),
        }
    }

    /// The registration name, `_http._tcp.local.`.
    pub fn fqdn(&self, domain: &str) -> String {
        format!("_{}._{}.{}", self.name, self.protocol, dotted(domain))
    }
}

fn strip_underscore(value: String) -> String {
    value.strip_prefix('_').map(str::to_string).unwrap_or(value)
}

fn dotted(domain: &str) -> String {
    let domain = domain.trim_start_matches('.');
    if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{domain}.")
    }
}

/// The instance name, `Web Server._http._tcp.local.`.
pub fn instance_fqdn(instance: &str, stype: &ServiceType, domain: &str) -> String {
    format!("{instance}.{}", stype.fqdn(domain))
}

/// The enumerator name, `_services._dns-sd._udp.local.`.
pub fn enumerator_fqdn(domain: &str) -> String {
    format!("{ENUMERATOR}.{}", dotted(domain))
}

/// A subtype name, `_printer._sub._http._tcp.local.`.
pub fn subtype_fqdn(subtype: &str, stype: &ServiceType, domain: &str) -> String {
    format!("_{}._sub.{}", subtype.trim_start_matches('_'), stype.fqdn(domain))
}

/// Split `Instance._service._proto.domain.` back into its parts. The
/// instance label may itself contain anything but the service labels are
/// recognized by their leading underscores.
pub fn parse_fullname(fullname: &str) -> Result<(String, ServiceType, String), Error> {
    let labels: Vec<&str> = fullname
        .trim_end_matches('.')
        .split('.')
        .collect();
    let position = labels
        .windows(2)
        .position(|pair| pair[0].starts_with('_') && pair[1].starts_with('_'));
    match position {
        Some(index) if index > 0 && index + 2 <= labels.len() => {
            let instance = labels[..index].join(".");
            let stype = ServiceType::new(labels[index], labels[index + 1]);
            let domain = dotted(&labels[index + 2..].join("."));
            Ok((instance, stype, domain))
        }
        _ => Err(Error::Validation(format!(
            "{fullname:?} is not an instance name like \"Web._http._tcp.local.\""
        ))),
    }
}

/// A fully assembled service description, the resolver's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub fullname: String,
    pub instance: String,
    pub stype: ServiceType,
    pub domain: String,
    /// The SRV target.
    pub host: String,
    pub port: u16,
    /// Ordered, deduplicated.
    pub addresses: Vec<IpAddr>,
    pub txt: BTreeMap<String, String>,
    pub txt_raw: BTreeMap<String, Option<Vec<u8>>>,
}

/// The A/AAAA records of one interface; only link-local IPv6 addresses
/// are advertised.
fn address_records(target: &str, addresses: &[IpAddr]) -> Vec<Record> {
    let mut records = Vec::new();
    for address in addresses {
        match address {
            IpAddr::V4(v4) => records.push(Record::a(target.to_string(), *v4)),
            IpAddr::V6(v6) => {
                if v6.segments()[0] & 0xFFC0 == 0xFE80 {
                    records.push(Record::aaaa(target.to_string(), *v6));
                }
            }
        }
    }
    records
}

/// The records advertising one service instance, additionals pre-wired:
/// the registration PTR suggests SRV and TXT, the SRV suggests the host
/// addresses. Address records themselves belong to the host record set
/// (`host_records`), a responder owns exactly one unique name.
pub fn service_records(
    instance: &str,
    stype: &ServiceType,
    domain: &str,
    hostname: &str,
    port: u16,
    txt: TxtData,
    subtypes: &[String],
    addresses: &[IpAddr],
) -> Vec<Record> {
    let registration = stype.fqdn(domain);
    let fullname = instance_fqdn(instance, stype, domain);
    let target = format!("{}.{}", hostname, dotted(domain));
    let suggested = address_records(&target, addresses);

    let srv = Record::srv(fullname.clone(), target, port).with_additionals(suggested);
    let txt = Record::txt(fullname.clone(), txt);
    let ptr = Record::ptr(registration.clone(), fullname.clone())
        .with_additionals(vec![srv.clone(), txt.clone()]);
    let enumerator = Record::ptr(enumerator_fqdn(domain), registration);

    let mut records = vec![srv, txt, ptr, enumerator];
    for subtype in subtypes {
        records.push(Record::ptr(
            subtype_fqdn(subtype, stype, domain),
            fullname.clone(),
        ));
    }
    records
}

/// The record set of the host itself: its addresses plus the NSEC used as
/// a negative answer for address types it does not have.
pub fn host_records(hostname: &str, domain: &str, addresses: &[IpAddr]) -> Vec<Record> {
    let target = format!("{}.{}", hostname, dotted(domain));
    let mut records = address_records(&target, addresses);
    let types = records.iter().map(Record::rtype).collect();
    records.push(Record::nsec(target, types));
    records
}

#[cfg(test)]
mod tests {
    use super::{parse_fullname, service_records, ServiceType};
    use lancast_proto::packet::record::{RData, RecordType, TxtData};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn should_build_fqdns() {
        let stype = ServiceType::new("http", "tcp");
        assert_eq!(stype.fqdn("local"), "_http._tcp.local.");
        assert_eq!(
            super::instance_fqdn("Web Server", &stype, "local."),
            "Web Server._http._tcp.local."
        );
        assert_eq!(
            super::enumerator_fqdn("local"),
            "_services._dns-sd._udp.local."
        );
        assert_eq!(
            super::subtype_fqdn("printer", &stype, "local"),
            "_printer._sub._http._tcp.local."
        );
    }

    #[test]
    fn should_parse_service_types() {
        let stype = ServiceType::parse("_test._tcp").unwrap();
        assert_eq!(stype.name, "test");
        assert_eq!(stype.protocol, "tcp");

        assert!(ServiceType::parse("_test").is_err());
        assert!(ServiceType::parse("_a._b._c").is_err());
    }

    #[test]
    fn should_parse_fullnames() {
        let (instance, stype, domain) =
            parse_fullname("Test._test._tcp.local.").unwrap();
        assert_eq!(instance, "Test");
        assert_eq!(stype, ServiceType::new("test", "tcp"));
        assert_eq!(domain, "local.");

        // instance labels may contain dots
        let (instance, _, _) = parse_fullname("Dr. Pepper._http._tcp.local.").unwrap();
        assert_eq!(instance, "Dr. Pepper");

        assert!(parse_fullname("local.").is_err());
    }

    #[test]
    fn should_build_service_records_with_additionals() {
        let stype = ServiceType::new("test", "tcp");
        let records = service_records(
            "Test",
            &stype,
            "local",
            "host",
            4444,
            TxtData::default(),
            &["printer".into()],
            &[
                IpAddr::V4(Ipv4Addr::new(169, 254, 20, 4)),
                // routable v6 addresses are not advertised
                "2001:db8::1".parse().unwrap(),
                "fe80::1".parse().unwrap(),
            ],
        );

        let srv = records
            .iter()
            .find(|record| record.rtype() == RecordType::SRV)
            .unwrap();
        assert_eq!(srv.name, "Test._test._tcp.local.");
        match &srv.rdata {
            RData::SRV { port, target, .. } => {
                assert_eq!(*port, 4444);
                assert_eq!(target, "host.local.");
            }
            other => panic!("expected SRV, got {other:?}"),
        }
        // the v4 and the link-local v6 ride along, the routable v6 does not
        assert_eq!(srv.additionals.len(), 2);

        let ptrs: Vec<_> = records
            .iter()
            .filter(|record| record.rtype() == RecordType::PTR)
            .collect();
        // registration + enumerator + subtype
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs.iter().all(|ptr| !ptr.cache_flush));

        // the set owns exactly one unique name: the instance
        let unique: std::collections::HashSet<String> = records
            .iter()
            .filter(|record| record.cache_flush)
            .map(|record| record.name.clone())
            .collect();
        assert_eq!(unique.len(), 1);
    }

    #[test]
    fn should_build_host_records_with_nsec() {
        let records = super::host_records(
            "host",
            "local",
            &[IpAddr::V4(Ipv4Addr::new(169, 254, 20, 4))],
        );
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.name == "host.local."));

        let nsec = records
            .iter()
            .find(|record| record.rtype() == RecordType::NSEC)
            .unwrap();
        match &nsec.rdata {
            RData::NSEC { next_domain, types } => {
                assert_eq!(next_domain, "host.local.");
                assert_eq!(types, &[RecordType::A.into_num()]);
            }
            other => panic!("expected NSEC, got {other:?}"),
        }
    }
}
