//! Authoritative resolution against the local zones.
//!
//! This is the first stop for every query: find the zone whose origin is
//! the longest suffix of the qname, then walk it.  CNAMEs are chased within
//! the zone, up to a bounded number of hops; a chain that leaves the zone is
//! returned as a partial answer for the recursive engine to finish.
//!
//! See section 4.3.2 of RFC 1034.

use tracing;

use dns_types::protocol::types::*;
use dns_types::zones::types::*;

/// How many in-zone CNAME hops a single lookup will follow.
pub const MAX_CNAME_CHAIN: usize = 8;

/// The authoritative verdict for a question.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LocalOutcome {
    /// Records matching the question (possibly preceded by a CNAME chain).
    Answer { rrs: Vec<ResourceRecord> },

    /// A CNAME chain that left the zone: the answer so far, plus the name
    /// resolution should continue from.
    PartialAnswer {
        rrs: Vec<ResourceRecord>,
        next_name: DomainName,
    },

    /// The name is delegated to child nameservers.
    Delegation {
        ns_rrs: Vec<ResourceRecord>,
        glue_rrs: Vec<ResourceRecord>,
    },

    /// The owner exists but has no records of this type.  The zone's SOA
    /// goes in the authority section.
    NoData {
        rrs: Vec<ResourceRecord>,
        soa_rr: ResourceRecord,
    },

    /// The owner does not exist at all.
    NameError {
        rrs: Vec<ResourceRecord>,
        soa_rr: ResourceRecord,
    },

    /// A CNAME chain longer than the hop budget; almost certainly a zone
    /// configuration loop.
    ChainTooLong,

    /// No configured zone covers the name.
    NotAuthoritative,
}

/// Resolve a question against the local zones.
pub fn resolve_local(zones: &Zones, question: &Question) -> LocalOutcome {
    let Some(zone) = zones.get(&question.name) else {
        return LocalOutcome::NotAuthoritative;
    };

    let _span =
        tracing::debug_span!("resolve_local", origin = %zone.origin(), %question).entered();

    let mut rrs = Vec::new();
    let mut current = question.name.clone();

    for _ in 0..=MAX_CNAME_CHAIN {
        match zone.resolve(&current, question.qtype) {
            // the CNAME target is outside this zone
            None => {
                return if rrs.is_empty() {
                    LocalOutcome::NotAuthoritative
                } else {
                    LocalOutcome::PartialAnswer {
                        rrs,
                        next_name: current,
                    }
                };
            }
            Some(ZoneResult::Answer { rrs: mut found }) => {
                tracing::trace!("got answer");
                rrs.append(&mut found);
                return LocalOutcome::Answer { rrs };
            }
            Some(ZoneResult::CNAME { cname, rr }) => {
                tracing::trace!(%cname, "got cname");
                rrs.push(rr);
                current = cname;
            }
            Some(ZoneResult::Delegation { ns_rrs }) => {
                tracing::trace!("got delegation");
                let mut glue_rrs = Vec::new();
                for rr in &ns_rrs {
                    if let RecordTypeWithData::NS { nsdname } = &rr.rtype_with_data {
                        if nsdname.is_subdomain_of(zone.origin()) {
                            glue_rrs.append(&mut zone.glue_rrs(nsdname));
                        }
                    }
                }
                return LocalOutcome::Delegation { ns_rrs, glue_rrs };
            }
            Some(ZoneResult::NoData) => {
                tracing::trace!("got nodata");
                return LocalOutcome::NoData {
                    rrs,
                    soa_rr: zone.soa_rr(),
                };
            }
            Some(ZoneResult::NameError) => {
                tracing::trace!("got name error");
                return LocalOutcome::NameError {
                    rrs,
                    soa_rr: zone.soa_rr(),
                };
            }
        }
    }

    tracing::warn!("CNAME chain exceeded hop budget");
    LocalOutcome::ChainTooLong
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_types::protocol::types::test_util::*;
    use dns_types::zones::types::test_util::*;

    use super::*;

    fn question(name: &str, rtype: RecordType) -> Question {
        Question {
            name: domain(name),
            qtype: QueryType::Record(rtype),
            qclass: QueryClass::Record(RecordClass::IN),
        }
    }

    fn zones_with(records: &[(&str, RecordTypeWithData)]) -> Zones {
        let mut z = zone("example.com.");
        for (owner, rtype_with_data) in records {
            z.insert(&domain(owner), rtype_with_data.clone(), 300).unwrap();
        }
        let mut zones = Zones::new();
        zones.insert(z);
        zones
    }

    #[test]
    fn direct_answer() {
        let zones = zones_with(&[(
            "www.example.com.",
            RecordTypeWithData::A {
                address: Ipv4Addr::new(192, 0, 2, 1),
            },
        )]);

        assert_eq!(
            LocalOutcome::Answer {
                rrs: vec![a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            },
            resolve_local(&zones, &question("www.example.com.", RecordType::A))
        );
    }

    #[test]
    fn cname_chain_is_chased_in_zone() {
        let zones = zones_with(&[
            (
                "alias.example.com.",
                RecordTypeWithData::CNAME {
                    cname: domain("alias2.example.com."),
                },
            ),
            (
                "alias2.example.com.",
                RecordTypeWithData::CNAME {
                    cname: domain("www.example.com."),
                },
            ),
            (
                "www.example.com.",
                RecordTypeWithData::A {
                    address: Ipv4Addr::new(192, 0, 2, 1),
                },
            ),
        ]);

        assert_eq!(
            LocalOutcome::Answer {
                rrs: vec![
                    cname_record("alias.example.com.", "alias2.example.com."),
                    cname_record("alias2.example.com.", "www.example.com."),
                    a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1)),
                ],
            },
            resolve_local(&zones, &question("alias.example.com.", RecordType::A))
        );
    }

    #[test]
    fn cname_leaving_the_zone_is_a_partial_answer() {
        let zones = zones_with(&[(
            "alias.example.com.",
            RecordTypeWithData::CNAME {
                cname: domain("www.example.net."),
            },
        )]);

        assert_eq!(
            LocalOutcome::PartialAnswer {
                rrs: vec![cname_record("alias.example.com.", "www.example.net.")],
                next_name: domain("www.example.net."),
            },
            resolve_local(&zones, &question("alias.example.com.", RecordType::A))
        );
    }

    #[test]
    fn cname_loop_exhausts_the_hop_budget() {
        let zones = zones_with(&[
            (
                "a.example.com.",
                RecordTypeWithData::CNAME {
                    cname: domain("b.example.com."),
                },
            ),
            (
                "b.example.com.",
                RecordTypeWithData::CNAME {
                    cname: domain("a.example.com."),
                },
            ),
        ]);

        assert_eq!(
            LocalOutcome::ChainTooLong,
            resolve_local(&zones, &question("a.example.com.", RecordType::A))
        );
    }

    #[test]
    fn delegation_carries_glue() {
        let zones = zones_with(&[
            (
                "child.example.com.",
                RecordTypeWithData::NS {
                    nsdname: domain("ns1.child.example.com."),
                },
            ),
            (
                "ns1.child.example.com.",
                RecordTypeWithData::A {
                    address: Ipv4Addr::new(192, 0, 2, 53),
                },
            ),
        ]);

        assert_eq!(
            LocalOutcome::Delegation {
                ns_rrs: vec![ns_record("child.example.com.", "ns1.child.example.com.")],
                glue_rrs: vec![a_record(
                    "ns1.child.example.com.",
                    Ipv4Addr::new(192, 0, 2, 53)
                )],
            },
            resolve_local(&zones, &question("www.child.example.com.", RecordType::A))
        );
    }

    #[test]
    fn negative_answers_carry_the_soa() {
        let zones = zones_with(&[(
            "www.example.com.",
            RecordTypeWithData::A {
                address: Ipv4Addr::new(192, 0, 2, 1),
            },
        )]);

        match resolve_local(&zones, &question("www.example.com.", RecordType::MX)) {
            LocalOutcome::NoData { rrs, soa_rr } => {
                assert!(rrs.is_empty());
                assert_eq!(RecordType::SOA, soa_rr.rtype_with_data.rtype());
                assert_eq!(domain("example.com."), soa_rr.name);
            }
            other => panic!("expected NoData, got {other:?}"),
        }

        match resolve_local(&zones, &question("missing.example.com.", RecordType::A)) {
            LocalOutcome::NameError { rrs, soa_rr } => {
                assert!(rrs.is_empty());
                assert_eq!(domain("example.com."), soa_rr.name);
            }
            other => panic!("expected NameError, got {other:?}"),
        }
    }

    #[test]
    fn unconfigured_names_are_not_authoritative() {
        let zones = zones_with(&[]);
        assert_eq!(
            LocalOutcome::NotAuthoritative,
            resolve_local(&zones, &question("www.example.net.", RecordType::A))
        );
    }
}
