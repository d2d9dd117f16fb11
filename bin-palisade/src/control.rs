//! The control-plane capabilities consumed by an external admin surface.
//!
//! The transport (gRPC, HTTP, whatever the operator wires up) lives outside
//! this process; these are the operations it calls.  Everything here goes
//! through the same dispatcher, cache, and zone table the serve path uses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use dns_resolver::cache::{CacheEntry, CacheStats, FlushOutcome, FlushScope};
use dns_resolver::dispatcher::{DispatchOutcome, Dispatcher};
use dns_resolver::rrl::RrlStats;
use dns_types::protocol::types::*;
use dns_types::zones::types::*;

/// A handle for the admin surface.
#[derive(Clone)]
pub struct Control {
    dispatcher: Dispatcher,
}

/// The result of a control-plane resolution.
#[derive(Debug, Clone)]
pub struct ResolveOutput {
    pub rcode: Rcode,
    pub authoritative: bool,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub wire_bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ZoneSummary {
    pub origin: DomainName,
    pub serial: u32,
    pub record_count: usize,
    pub dnssec_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ZoneDetail {
    pub summary: ZoneSummary,
    pub records: Vec<ResourceRecord>,
    /// The zone in master-file format; export is always this format.
    pub master_file: String,
}

#[derive(Debug)]
pub struct UpdateReport {
    /// One result per requested update, in order.  A failed update does not
    /// stop the rest of the batch.
    pub results: Vec<Result<UpdateOutcome, UpdateError>>,
    pub new_serial: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("'{name}' is not a valid domain name")]
    BadName { name: String },

    #[error("no zone with origin '{origin}'")]
    UnknownZone { origin: DomainName },

    #[error("the query produced no response (rate limited or unanswerable)")]
    NoResponse,

    #[error("the response could not be decoded")]
    BadResponse,
}

impl Control {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Resolve a name through the full pipeline, returning the records and
    /// the exact bytes a client would have received.
    pub async fn resolve(
        &self,
        name: &str,
        qtype: QueryType,
        qclass: QueryClass,
        recursion_desired: bool,
    ) -> Result<ResolveOutput, ControlError> {
        let name = parse_name(name)?;
        let mut query = Message::from_question(
            rand::random(),
            Question {
                name,
                qtype,
                qclass,
            },
        );
        query.header.recursion_desired = recursion_desired;

        let wire = query
            .into_octets()
            .map_err(|_| ControlError::BadResponse)?;
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

        match self.dispatcher.handle(&wire, peer).await {
            DispatchOutcome::Respond { bytes, .. } => {
                let response =
                    Message::from_octets(&bytes).map_err(|_| ControlError::BadResponse)?;
                Ok(ResolveOutput {
                    rcode: response.header.rcode,
                    authoritative: response.header.is_authoritative,
                    answers: response.answers,
                    authority: response.authority,
                    wire_bytes: bytes,
                })
            }
            DispatchOutcome::NoResponse => Err(ControlError::NoResponse),
        }
    }

    /// Zone metadata, optionally filtered by a substring of the origin.
    pub async fn list_zones(&self, name_pattern: Option<&str>) -> Vec<ZoneSummary> {
        let zones = self.dispatcher.zones().read().await;
        let mut summaries = zones
            .iter()
            .filter(|zone| {
                name_pattern.map_or(true, |pattern| {
                    zone.origin().to_dotted_string().contains(pattern)
                })
            })
            .map(summarise)
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| a.origin.cmp(&b.origin));
        summaries
    }

    /// A single zone, with its records and master-file export.
    pub async fn get_zone(
        &self,
        origin: &str,
        type_filter: Option<RecordType>,
    ) -> Result<ZoneDetail, ControlError> {
        let origin = parse_name(origin)?;
        let zones = self.dispatcher.zones().read().await;
        let zone = zones
            .get_exact(&origin)
            .ok_or(ControlError::UnknownZone { origin })?;

        let mut records = zone.all_rrs();
        if let Some(rtype) = type_filter {
            records.retain(|rr| rr.rtype_with_data.rtype() == rtype);
        }

        Ok(ZoneDetail {
            summary: summarise(zone),
            records,
            master_file: zone.serialise(),
        })
    }

    /// Apply a batch of record updates to a zone.  Each update succeeds or
    /// fails on its own; the serial is bumped once if anything changed and
    /// the caller asked for it.
    pub async fn update_records(
        &self,
        origin: &str,
        updates: &[RecordUpdate],
        increment_serial: bool,
    ) -> Result<UpdateReport, ControlError> {
        let origin = parse_name(origin)?;
        let mut zones = self.dispatcher.zones().write().await;
        let zone = zones
            .get_exact_mut(&origin)
            .ok_or(ControlError::UnknownZone { origin })?;

        let results = updates
            .iter()
            .map(|update| zone.apply_update(update))
            .collect::<Vec<_>>();

        let changed = results.iter().any(Result::is_ok);
        if changed && increment_serial {
            zone.increment_serial();
        }

        Ok(UpdateReport {
            results,
            new_serial: zone.soa().serial,
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.dispatcher.cache().stats()
    }

    /// Cache entries for a name, optionally narrowed to one query type.
    pub fn cache_lookup(&self, name: &str, qtype: Option<QueryType>) -> Result<Vec<CacheEntry>, ControlError> {
        let name = parse_name(name)?;
        Ok(self.dispatcher.cache().entries_matching(&name, qtype))
    }

    /// Flush the cache: everything, a domain (with or without its
    /// subdomains), or one record type.
    pub fn cache_flush(&self, scope: &FlushScope) -> FlushOutcome {
        self.dispatcher.cache().flush(scope)
    }

    pub fn rrl_stats(&self) -> RrlStats {
        self.dispatcher.rrl().stats()
    }
}

fn summarise(zone: &Zone) -> ZoneSummary {
    ZoneSummary {
        origin: zone.origin().clone(),
        serial: zone.soa().serial,
        record_count: zone.all_rrs().len(),
        dnssec_enabled: zone.dnssec().is_some_and(|dnssec| dnssec.enabled),
    }
}

fn parse_name(name: &str) -> Result<DomainName, ControlError> {
    let normalised = if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    };
    DomainName::from_dotted_string(&normalised).ok_or_else(|| ControlError::BadName {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::RwLock;

    use dns_resolver::cache::{CacheConfig, SharedCache};
    use dns_resolver::cookies::CookieManager;
    use dns_resolver::dispatcher::DispatcherConfig;
    use dns_resolver::enrich::ThreatIntel;
    use dns_resolver::events::Broadcaster;
    use dns_resolver::recursive::{IterativeResolver, ResolverConfig};
    use dns_resolver::rrl::{RateLimiter, RrlConfig};
    use dns_resolver::util::ports::PortPool;
    use dns_types::protocol::types::test_util::*;
    use dns_types::zones::types::test_util::*;

    use super::*;

    fn control() -> Control {
        let mut z = zone("example.com.");
        z.insert(
            &domain("www.example.com."),
            RecordTypeWithData::A {
                address: Ipv4Addr::new(192, 0, 2, 1),
            },
            300,
        )
        .unwrap();
        let mut zones = Zones::new();
        zones.insert(z);

        let resolver = IterativeResolver::new(
            ResolverConfig {
                root_hints: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                upstream_port: 9,
                upstream_timeout: Duration::from_millis(10),
                iteration_budget: 2,
                ..ResolverConfig::default()
            },
            PortPool::new(),
        );

        Control::new(Dispatcher::new(
            Arc::new(RwLock::new(zones)),
            SharedCache::new(CacheConfig::default(), Broadcaster::default()),
            Arc::new(RateLimiter::new(RrlConfig::default())),
            CookieManager::new(false),
            Arc::new(ThreatIntel::Disabled),
            Arc::new(resolver),
            DispatcherConfig::default(),
        ))
    }

    #[tokio::test]
    async fn resolve_returns_records_and_wire_bytes() {
        let control = control();
        let output = control
            .resolve(
                "www.example.com",
                QueryType::Record(RecordType::A),
                QueryClass::Record(RecordClass::IN),
                false,
            )
            .await
            .unwrap();

        assert_eq!(Rcode::NoError, output.rcode);
        assert!(output.authoritative);
        assert_eq!(
            vec![a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            output.answers
        );
        assert!(Message::from_octets(&output.wire_bytes).is_ok());
    }

    #[tokio::test]
    async fn list_and_get_zones() {
        let control = control();

        let all = control.list_zones(None).await;
        assert_eq!(1, all.len());
        assert_eq!(domain("example.com."), all[0].origin);

        let filtered = control.list_zones(Some("nomatch")).await;
        assert!(filtered.is_empty());

        let detail = control.get_zone("example.com", None).await.unwrap();
        assert!(detail.records.len() >= 3); // SOA, NS, www A
        assert!(detail.master_file.contains("$ORIGIN example.com."));

        let only_a = control
            .get_zone("example.com", Some(RecordType::A))
            .await
            .unwrap();
        assert!(only_a
            .records
            .iter()
            .all(|rr| rr.rtype_with_data.rtype() == RecordType::A));

        assert!(matches!(
            control.get_zone("example.net", None).await,
            Err(ControlError::UnknownZone { .. })
        ));
    }

    #[tokio::test]
    async fn update_records_bumps_the_serial_once() {
        let control = control();
        let serial_before = control.list_zones(None).await[0].serial;

        let updates = vec![
            RecordUpdate {
                op: UpdateOp::Add,
                name: domain("new.example.com."),
                rtype: RecordType::A,
                ttl: 300,
                data: Some(RecordTypeWithData::A {
                    address: Ipv4Addr::new(192, 0, 2, 50),
                }),
                old_data: None,
            },
            RecordUpdate {
                op: UpdateOp::Delete,
                name: domain("absent.example.com."),
                rtype: RecordType::A,
                ttl: 0,
                data: None,
                old_data: None,
            },
        ];

        let report = control
            .update_records("example.com", &updates, true)
            .await
            .unwrap();

        assert!(report.results[0].is_ok());
        assert!(report.results[1].is_err());
        assert_eq!(serial_before + 1, report.new_serial);

        // the new record resolves
        let output = control
            .resolve(
                "new.example.com",
                QueryType::Record(RecordType::A),
                QueryClass::Record(RecordClass::IN),
                false,
            )
            .await
            .unwrap();
        assert_eq!(1, output.answers.len());
    }

    #[tokio::test]
    async fn cache_capabilities() {
        let control = control();

        // a resolve through the authoritative path does not populate the
        // cache, so seed it directly
        let question = Question {
            name: domain("seeded.example.net."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let entry = CacheEntry::new(
            dns_resolver::fingerprint::fingerprint_question(&question),
            &question,
            vec![0; 32],
            300,
        );
        control.dispatcher.cache().set(entry);

        let found = control
            .cache_lookup("seeded.example.net", None)
            .unwrap();
        assert_eq!(1, found.len());

        let stats = control.cache_stats();
        assert_eq!(1, stats.entries);

        let outcome = control.cache_flush(&FlushScope::All);
        assert_eq!(1, outcome.removed);
        assert_eq!(0, control.cache_stats().entries);

        let rrl = control.rrl_stats();
        assert_eq!(0, rrl.dropped);
    }
}
