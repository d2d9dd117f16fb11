//! The iterative resolver: a referral walk from the root hints down to an
//! authoritative answer.
//!
//! Spoofing resistance comes from three places: a cryptographically random
//! 16-bit transaction ID, a cryptographically random single-use source port
//! from the 28,232-port ephemeral range (together about 30.78 bits per
//! query), and optional 0x20 encoding - the qname is sent with randomised
//! letter case, and the echoed question must match byte for byte.
//!
//! Query-name minimisation (RFC 7816) limits what each zone in the chain
//! learns: a zone is asked about the name one label deeper than itself, and
//! only the final authoritative step sees the full qname.  Authority and
//! additional sections are scrubbed of records outside the zone that sent
//! them before anything else looks at the response.

use async_recursion::async_recursion;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_types::protocol::types::*;

use crate::util::net::{read_tcp_bytes, send_tcp_bytes};
use crate::util::ports::PortPool;
use crate::util::types::{prioritising_merge, ResolutionError, ResolvedAnswer};

pub const DEFAULT_ITERATION_BUDGET: usize = 20;
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// How many times a nameserver may fail within one walk before round-robin
/// selection stops coming back to it.
const FAILURE_BACKOFF_LIMIT: u32 = 2;

/// The IANA root nameservers, a through m.
pub const ROOT_HINTS: [IpAddr; 13] = [
    IpAddr::V4(Ipv4Addr::new(198, 41, 0, 4)),
    IpAddr::V4(Ipv4Addr::new(170, 247, 170, 2)),
    IpAddr::V4(Ipv4Addr::new(192, 33, 4, 12)),
    IpAddr::V4(Ipv4Addr::new(199, 7, 91, 13)),
    IpAddr::V4(Ipv4Addr::new(192, 203, 230, 10)),
    IpAddr::V4(Ipv4Addr::new(192, 5, 5, 241)),
    IpAddr::V4(Ipv4Addr::new(192, 112, 36, 4)),
    IpAddr::V4(Ipv4Addr::new(198, 97, 190, 53)),
    IpAddr::V4(Ipv4Addr::new(192, 36, 148, 17)),
    IpAddr::V4(Ipv4Addr::new(192, 58, 128, 30)),
    IpAddr::V4(Ipv4Addr::new(193, 0, 14, 129)),
    IpAddr::V4(Ipv4Addr::new(199, 7, 83, 42)),
    IpAddr::V4(Ipv4Addr::new(202, 12, 27, 33)),
];

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub root_hints: Vec<IpAddr>,
    pub iteration_budget: usize,
    pub use_0x20_encoding: bool,
    pub qname_minimisation: bool,
    pub upstream_timeout: Duration,
    /// The port queried on upstream nameservers.  53 outside of tests.
    pub upstream_port: u16,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            root_hints: ROOT_HINTS.to_vec(),
            iteration_budget: DEFAULT_ITERATION_BUDGET,
            use_0x20_encoding: true,
            qname_minimisation: true,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            upstream_port: 53,
        }
    }
}

pub struct IterativeResolver {
    config: ResolverConfig,
    ports: PortPool,
}

impl IterativeResolver {
    pub fn new(config: ResolverConfig, ports: PortPool) -> Self {
        Self { config, ports }
    }

    /// Resolve a question by walking referrals from the root hints.
    pub async fn resolve(&self, question: &Question) -> Result<ResolvedAnswer, ResolutionError> {
        self.resolve_with_budget(question, self.config.iteration_budget)
            .await
    }

    #[async_recursion]
    async fn resolve_with_budget(
        &self,
        question: &Question,
        mut budget: usize,
    ) -> Result<ResolvedAnswer, ResolutionError> {
        tracing::debug!(%question, %budget, "starting iterative walk");

        let mut zone = DomainName::root_domain();
        let mut candidates = CandidateSet::new(&self.config.root_hints);

        loop {
            if budget == 0 {
                tracing::debug!("iteration budget exhausted");
                return Err(ResolutionError::MaxIterations);
            }

            let reveal = if self.config.qname_minimisation {
                minimised_name(&question.name, &zone)
            } else {
                question.name.clone()
            };
            let final_step = reveal == question.name;
            let step_question = Question {
                name: reveal.clone(),
                qtype: if final_step {
                    question.qtype
                } else {
                    QueryType::Record(RecordType::NS)
                },
                qclass: question.qclass,
            };

            let Some(address) = candidates.next_address() else {
                // no addresses left: resolve a glue-less NS name, spending
                // from the same budget
                let Some(ns_name) = candidates.take_unresolved() else {
                    return Err(ResolutionError::DeadEnd {
                        question: question.clone(),
                    });
                };
                budget = budget.saturating_sub(1);
                let ns_question = Question {
                    name: ns_name,
                    qtype: QueryType::Record(RecordType::A),
                    qclass: question.qclass,
                };
                if let Ok(answer) = self
                    .resolve_with_budget(&ns_question, budget.min(4))
                    .await
                {
                    for rr in &answer.answers {
                        if let RecordTypeWithData::A { address } = rr.rtype_with_data {
                            candidates.add_address(IpAddr::V4(address));
                        }
                    }
                }
                continue;
            };

            budget -= 1;

            let Some(mut response) = self.query_nameserver(address, &step_question).await? else {
                tracing::debug!(%address, "nameserver failed");
                candidates.record_failure(address);
                continue;
            };

            scrub_out_of_bailiwick(&mut response, &zone);

            // an answer (or authoritative name error) at the final step
            // ends the walk, even if the response also advertises deeper
            // delegations
            if final_step
                && (!response.answers.is_empty() || response.header.rcode == Rcode::NameError)
            {
                return finish(question, &response, self, budget).await;
            }

            // a referral moves the walk down to the child zone
            if let Some(referral) = extract_referral(&response, &zone) {
                tracing::trace!(zone = %referral.zone, "got referral");
                zone = referral.zone.clone();
                candidates = CandidateSet::from_referral(referral);
                continue;
            }

            if final_step {
                // no answer and no referral: NODATA (or nothing useful)
                return finish(question, &response, self, budget).await;
            }

            // no referral for the minimised name: an empty non-terminal or
            // a zone serving the whole subtree - descend a label and ask
            // the same servers
            if response.header.rcode == Rcode::NoError
                || response.header.rcode == Rcode::NameError
            {
                zone = reveal;
                continue;
            }

            candidates.record_failure(address);
        }
    }

    /// Send one query, preferring UDP and retrying over TCP on truncation.
    /// Returns `Ok(None)` for timeouts, network errors, and responses that
    /// fail validation; those count against the nameserver, not the walk.
    async fn query_nameserver(
        &self,
        address: IpAddr,
        question: &Question,
    ) -> Result<Option<Message>, ResolutionError> {
        let sent_question = Question {
            name: if self.config.use_0x20_encoding {
                randomize_case(&question.name)
            } else {
                question.name.clone()
            },
            qtype: question.qtype,
            qclass: question.qclass,
        };

        let id: u16 = rand::thread_rng().gen();
        let request = Message::from_question(id, sent_question.clone());

        let Ok(serialised) = request.into_octets() else {
            return Ok(None);
        };

        let target = SocketAddr::new(address, self.config.upstream_port);

        let udp_response = match timeout(
            self.config.upstream_timeout,
            self.query_udp(target, &serialised),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::trace!(%target, "upstream UDP timeout");
                None
            }
        };

        let response = match udp_response {
            Some(response) if response.header.is_truncated => {
                match timeout(
                    self.config.upstream_timeout,
                    query_tcp(target, serialised.clone()),
                )
                .await
                {
                    Ok(response) => response,
                    Err(_) => {
                        tracing::trace!(%target, "upstream TCP timeout");
                        None
                    }
                }
            }
            other => other,
        };

        Ok(response.filter(|response| validate_response(id, &sent_question, response)))
    }

    async fn query_udp(
        &self,
        target: SocketAddr,
        serialised: &[u8],
    ) -> Result<Option<Message>, ResolutionError> {
        // single-use source port; the lease returns to the pool when this
        // function finishes with it
        let Some(lease) = self.ports.acquire() else {
            tracing::warn!("source port pool exhausted");
            return Err(ResolutionError::PoolExhausted);
        };

        let bind_result = UdpSocket::bind(("0.0.0.0", lease.port())).await;
        let Ok(socket) = bind_result else {
            return Ok(None);
        };
        if socket.connect(target).await.is_err() {
            return Ok(None);
        }
        if socket.send(serialised).await.is_err() {
            return Ok(None);
        }

        let mut buffer = vec![0_u8; 4096];
        let Ok(received) = socket.recv(&mut buffer).await else {
            return Ok(None);
        };

        Ok(Message::from_octets(&buffer[..received]).ok())
    }
}

async fn query_tcp(target: SocketAddr, mut serialised: Vec<u8>) -> Option<Message> {
    let mut stream = TcpStream::connect(target).await.ok()?;
    send_tcp_bytes(&mut stream, &mut serialised).await.ok()?;
    let bytes = read_tcp_bytes(&mut stream).await.ok()?;
    Message::from_octets(bytes.as_ref()).ok()
}

/// Turn a validated final-step response into an answer, restarting the walk
/// with the remaining budget if the response ends on a dangling CNAME.
async fn finish(
    question: &Question,
    response: &Message,
    resolver: &IterativeResolver,
    budget: usize,
) -> Result<ResolvedAnswer, ResolutionError> {
    if response.header.rcode == Rcode::NameError {
        return Ok(ResolvedAnswer {
            rcode: Rcode::NameError,
            answers: response.answers.clone(),
            authority: response.authority.clone(),
            additional: Vec::new(),
        });
    }

    match chase_answer_chain(question, &response.answers) {
        // NODATA: the section says nothing about the name at this type
        None => Ok(ResolvedAnswer {
            rcode: Rcode::NoError,
            answers: Vec::new(),
            authority: response.authority.clone(),
            additional: Vec::new(),
        }),
        Some(AnswerChain::Complete { rrs }) => Ok(ResolvedAnswer {
            rcode: Rcode::NoError,
            answers: rrs,
            authority: Vec::new(),
            additional: Vec::new(),
        }),
        Some(AnswerChain::Dangling { rrs, next_name }) => {
            tracing::trace!(%next_name, "following cname out of zone");
            let continuation = Question {
                name: next_name,
                qtype: question.qtype,
                qclass: question.qclass,
            };
            let tail = resolver
                .resolve_with_budget(&continuation, budget)
                .await?;

            let mut combined = rrs;
            prioritising_merge(&mut combined, tail.answers);
            Ok(ResolvedAnswer {
                rcode: tail.rcode,
                answers: combined,
                authority: tail.authority,
                additional: Vec::new(),
            })
        }
    }
}

/// How an answer section's CNAME chain ends.  The counterpart of
/// `LocalOutcome::PartialAnswer` for upstream data: a `Dangling` chain is
/// handed back to the walk to continue from `next_name`.
#[derive(Debug, Clone, Eq, PartialEq)]
enum AnswerChain {
    /// The chain (possibly empty) ends on records of the requested type.
    Complete { rrs: Vec<ResourceRecord> },
    /// The chain ends on a CNAME whose target the response does not cover.
    Dangling {
        rrs: Vec<ResourceRecord>,
        next_name: DomainName,
    },
}

/// Walk the answer section forwards from the query name, collecting the
/// CNAME chain as it goes.  Unrelated records are never collected.
///
/// Every legitimate hop consumes one CNAME record from the section, so a
/// walk that takes more hops than the section has records can only be going
/// in circles; that, like a section with nothing at the query name, is
/// `None`.
fn chase_answer_chain(question: &Question, answers: &[ResourceRecord]) -> Option<AnswerChain> {
    let mut rrs = Vec::new();
    let mut current = question.name.clone();

    for _ in 0..=answers.len() {
        let mut found = answers
            .iter()
            .filter(|rr| rr.name == current && rr.rtype_with_data.matches(question.qtype))
            .cloned()
            .collect::<Vec<_>>();
        if !found.is_empty() {
            rrs.append(&mut found);
            return Some(AnswerChain::Complete { rrs });
        }

        let cname = answers.iter().find_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::CNAME { cname } if rr.name == current => {
                Some((rr.clone(), cname.clone()))
            }
            _ => None,
        });

        match cname {
            Some((rr, target)) => {
                rrs.push(rr);
                current = target;
            }
            None if rrs.is_empty() => return None,
            None => {
                return Some(AnswerChain::Dangling {
                    rrs,
                    next_name: current,
                })
            }
        }
    }

    // more hops than records: the chain bites its own tail
    None
}

/// The name revealed to the zone being asked: one label deeper than the
/// zone itself, per RFC 7816.  Once the zone is within one label of the
/// target (or is not an ancestor at all) the full name is used.
fn minimised_name(target: &DomainName, zone: &DomainName) -> DomainName {
    if !target.is_subdomain_of(zone) {
        return target.clone();
    }

    let reveal_labels = zone.labels.len() + 1;
    if target.labels.len() <= reveal_labels {
        return target.clone();
    }

    let start = target.labels.len() - reveal_labels;
    DomainName::from_labels(target.labels[start..].to_vec())
        .unwrap_or_else(|| target.clone())
}

/// Randomise the ASCII letter case of a name.  The lowercase labels (and so
/// equality and hashing) are unchanged; only the wire octets vary.
fn randomize_case(name: &DomainName) -> DomainName {
    let mut rng = rand::thread_rng();
    let mixed = name
        .labels
        .iter()
        .map(|label| {
            label
                .iter()
                .map(|octet| {
                    if octet.is_ascii_alphabetic() && rng.gen::<bool>() {
                        octet.to_ascii_uppercase()
                    } else {
                        *octet
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    DomainName::from_labels(mixed).unwrap_or_else(|| name.clone())
}

/// Basic response validation: the transaction ID, opcode, and question must
/// match what was sent, the question echo must preserve our 0x20 casing
/// byte for byte, and it must actually be a response.
fn validate_response(id: u16, sent_question: &Question, response: &Message) -> bool {
    if response.header.id != id {
        return false;
    }
    if !response.header.is_response {
        return false;
    }
    if response.header.opcode != Opcode::Standard {
        return false;
    }
    if !(response.header.rcode == Rcode::NoError || response.header.rcode == Rcode::NameError) {
        return false;
    }
    let [echoed] = response.questions.as_slice() else {
        return false;
    };
    if echoed.qtype != sent_question.qtype || echoed.qclass != sent_question.qclass {
        return false;
    }
    // the echoed name must match the exact case we sent
    echoed.name.case_matches(&sent_question.name)
}

/// Remove records outside the zone that sent the response from the
/// authority and additional sections.  OPT pseudo-records always survive.
fn scrub_out_of_bailiwick(response: &mut Message, zone: &DomainName) {
    let keep = |rr: &ResourceRecord| {
        rr.rtype_with_data.rtype() == RecordType::OPT || rr.name.is_subdomain_of(zone)
    };
    response.authority.retain(keep);
    response.additional.retain(keep);
}

struct Referral {
    zone: DomainName,
    ns_names: Vec<DomainName>,
    glue: Vec<IpAddr>,
}

/// Find a referral in a response: NS records (in the authority section, or
/// the answer section for explicit NS queries) naming a zone strictly
/// deeper than the current one, plus any glue addresses for those servers.
fn extract_referral(response: &Message, current_zone: &DomainName) -> Option<Referral> {
    let mut by_owner: HashMap<DomainName, HashSet<DomainName>> = HashMap::new();

    for rr in response.authority.iter().chain(&response.answers) {
        if let RecordTypeWithData::NS { nsdname } = &rr.rtype_with_data {
            if rr.name.is_subdomain_of(current_zone)
                && rr.name.labels.len() > current_zone.labels.len()
            {
                by_owner
                    .entry(rr.name.clone())
                    .or_default()
                    .insert(nsdname.clone());
            }
        }
    }

    // take the deepest delegation on offer
    let (zone, ns_names) = by_owner
        .into_iter()
        .max_by_key(|(owner, _)| owner.labels.len())?;

    let mut glue = Vec::new();
    for rr in response.additional.iter().chain(&response.answers) {
        if ns_names.contains(&rr.name) {
            match rr.rtype_with_data {
                RecordTypeWithData::A { address } => glue.push(IpAddr::V4(address)),
                RecordTypeWithData::AAAA { address } => glue.push(IpAddr::V6(address)),
                _ => (),
            }
        }
    }

    Some(Referral {
        zone,
        ns_names: ns_names.into_iter().collect(),
        glue,
    })
}

/// The nameservers currently being walked, with round-robin selection and
/// failure backoff.
struct CandidateSet {
    addresses: Vec<IpAddr>,
    unresolved: Vec<DomainName>,
    cursor: usize,
    failures: HashMap<IpAddr, u32>,
}

impl CandidateSet {
    fn new(addresses: &[IpAddr]) -> Self {
        Self {
            addresses: addresses.to_vec(),
            unresolved: Vec::new(),
            cursor: 0,
            failures: HashMap::new(),
        }
    }

    fn from_referral(referral: Referral) -> Self {
        let mut set = Self::new(&referral.glue);
        // NS names without glue are resolved lazily, only if the glued
        // servers all fail
        set.unresolved = referral.ns_names;
        set
    }

    /// The next usable address, round-robin, skipping servers that have
    /// failed too often this walk.
    fn next_address(&mut self) -> Option<IpAddr> {
        for _ in 0..self.addresses.len() {
            let address = self.addresses[self.cursor % self.addresses.len()];
            self.cursor = self.cursor.wrapping_add(1);
            if self
                .failures
                .get(&address)
                .map_or(true, |count| *count < FAILURE_BACKOFF_LIMIT)
            {
                return Some(address);
            }
        }
        None
    }

    fn add_address(&mut self, address: IpAddr) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    fn take_unresolved(&mut self) -> Option<DomainName> {
        self.unresolved.pop()
    }

    fn record_failure(&mut self, address: IpAddr) {
        *self.failures.entry(address).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;

    #[test]
    fn minimised_name_reveals_one_label_past_the_zone() {
        let target = domain("x.y.example.com.");

        assert_eq!(
            domain("com."),
            minimised_name(&target, &DomainName::root_domain())
        );
        assert_eq!(
            domain("example.com."),
            minimised_name(&target, &domain("com."))
        );
        assert_eq!(
            domain("y.example.com."),
            minimised_name(&target, &domain("example.com."))
        );
        // within one label of the target: reveal everything
        assert_eq!(target, minimised_name(&target, &domain("y.example.com.")));
        assert_eq!(target, minimised_name(&target, &target));
        // not an ancestor: reveal everything
        assert_eq!(target, minimised_name(&target, &domain("example.net.")));
    }

    #[test]
    fn randomize_case_changes_only_case() {
        let name = domain("www.example.com.");
        for _ in 0..20 {
            let randomized = randomize_case(&name);
            assert_eq!(name, randomized);
            assert_eq!(name.octets.len(), randomized.octets.len());
        }
    }

    #[test]
    fn validate_response_checks_the_echo() {
        let sent = Question {
            name: DomainName::from_dotted_string("wWw.EXample.com.").unwrap(),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let request = Message::from_question(1234, sent.clone());
        let mut response = request.make_response();

        assert!(validate_response(1234, &sent, &response));

        // wrong id
        assert!(!validate_response(1235, &sent, &response));

        // the same name in different case fails the 0x20 check
        response.questions[0].name = domain("www.example.com.");
        assert_eq!(sent.name, response.questions[0].name);
        assert!(!validate_response(1234, &sent, &response));
    }

    #[test]
    fn validate_response_rejects_queries_and_errors() {
        let sent = Question {
            name: domain("www.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let request = Message::from_question(1, sent.clone());

        assert!(!validate_response(1, &sent, &request));

        let mut servfail = request.make_response();
        servfail.header.rcode = Rcode::ServerFailure;
        assert!(!validate_response(1, &sent, &servfail));
    }

    #[test]
    fn scrub_keeps_in_bailiwick_and_opt() {
        let question = Question {
            name: domain("www.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let mut response = Message::from_question(1, question).make_response();
        response.authority = vec![
            ns_record("example.com.", "ns1.example.net."),
            ns_record("example.net.", "ns1.attacker.example."),
        ];
        response.additional = vec![
            a_record("ns1.example.com.", Ipv4Addr::new(192, 0, 2, 1)),
            a_record("www.victim.example.", Ipv4Addr::new(192, 0, 2, 66)),
            dns_types::protocol::edns::Edns::default().to_rr(),
        ];

        scrub_out_of_bailiwick(&mut response, &domain("com."));

        assert_eq!(
            vec![ns_record("example.com.", "ns1.example.net.")],
            response.authority
        );
        assert_eq!(2, response.additional.len());
        assert_eq!(
            domain("ns1.example.com."),
            response.additional[0].name
        );
        assert_eq!(
            RecordType::OPT,
            response.additional[1].rtype_with_data.rtype()
        );
    }

    #[test]
    fn extract_referral_takes_the_deepest_cut_and_its_glue() {
        let question = Question {
            name: domain("www.sub.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let mut response = Message::from_question(1, question).make_response();
        response.authority = vec![
            ns_record("example.com.", "ns1.example.com."),
            ns_record("sub.example.com.", "ns1.sub.example.com."),
        ];
        response.additional = vec![
            a_record("ns1.sub.example.com.", Ipv4Addr::new(192, 0, 2, 53)),
            a_record("ns1.example.com.", Ipv4Addr::new(192, 0, 2, 54)),
        ];

        let referral = extract_referral(&response, &domain("com.")).unwrap();
        assert_eq!(domain("sub.example.com."), referral.zone);
        assert_eq!(vec![domain("ns1.sub.example.com.")], referral.ns_names);
        assert_eq!(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 53))], referral.glue);
    }

    #[test]
    fn extract_referral_ignores_sideways_delegations() {
        let question = Question {
            name: domain("www.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let mut response = Message::from_question(1, question).make_response();
        // an upward/sideways NS is not a referral from "example.com."
        response.authority = vec![ns_record("com.", "a.gtld-servers.net.")];

        assert!(extract_referral(&response, &domain("example.com.")).is_none());
    }

    fn a_question(name: &str) -> Question {
        Question {
            name: domain(name),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        }
    }

    #[test]
    fn chase_answer_chain_collects_the_chain_in_hop_order() {
        let question = a_question("promo.example.org.");
        // section deliberately out of order, with a record the chain never
        // touches
        let answers = [
            a_record("unrelated.example.org.", Ipv4Addr::new(192, 0, 2, 250)),
            a_record("edge-3.example.net.", Ipv4Addr::new(192, 0, 2, 30)),
            cname_record("cdn.example.org.", "edge-3.example.net."),
            cname_record("promo.example.org.", "cdn.example.org."),
        ];

        assert_eq!(
            Some(AnswerChain::Complete {
                rrs: vec![
                    cname_record("promo.example.org.", "cdn.example.org."),
                    cname_record("cdn.example.org.", "edge-3.example.net."),
                    a_record("edge-3.example.net.", Ipv4Addr::new(192, 0, 2, 30)),
                ]
            }),
            chase_answer_chain(&question, &answers)
        );
    }

    #[test]
    fn chase_answer_chain_without_hops_is_just_the_records() {
        let question = a_question("static.example.org.");
        let answers = [
            a_record("static.example.org.", Ipv4Addr::new(192, 0, 2, 40)),
            a_record("static.example.org.", Ipv4Addr::new(192, 0, 2, 41)),
        ];

        assert_eq!(
            Some(AnswerChain::Complete {
                rrs: answers.to_vec()
            }),
            chase_answer_chain(&question, &answers)
        );
    }

    #[test]
    fn chase_answer_chain_hands_back_dangling_tails() {
        // the chain leaves for a name this response says nothing about, so
        // the walk has to restart from there
        let question = a_question("promo.example.org.");
        let answers = [cname_record("promo.example.org.", "offsite.example.net.")];

        assert_eq!(
            Some(AnswerChain::Dangling {
                rrs: answers.to_vec(),
                next_name: domain("offsite.example.net."),
            }),
            chase_answer_chain(&question, &answers)
        );
    }

    #[test]
    fn chase_answer_chain_gives_up_on_cycles() {
        let question = a_question("promo.example.org.");
        let answers = [
            cname_record("promo.example.org.", "cdn.example.org."),
            cname_record("cdn.example.org.", "promo.example.org."),
        ];

        assert_eq!(None, chase_answer_chain(&question, &answers));
    }

    #[test]
    fn chase_answer_chain_is_none_for_an_unmentioned_name() {
        let question = a_question("promo.example.org.");
        let answers = [a_record("other.example.org.", Ipv4Addr::new(192, 0, 2, 99))];

        assert_eq!(None, chase_answer_chain(&question, &answers));
    }

    #[test]
    fn chase_answer_chain_answers_cname_queries_without_chasing() {
        let question = Question {
            name: domain("promo.example.org."),
            qtype: QueryType::Record(RecordType::CNAME),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let answers = [
            cname_record("promo.example.org.", "cdn.example.org."),
            cname_record("cdn.example.org.", "edge-3.example.net."),
        ];

        // the first record answers the question itself; the rest of the
        // chain is someone else's business
        assert_eq!(
            Some(AnswerChain::Complete {
                rrs: vec![cname_record("promo.example.org.", "cdn.example.org.")]
            }),
            chase_answer_chain(&question, &answers)
        );
    }

    #[test]
    fn candidate_set_round_robins_with_backoff() {
        let a = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let b = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));
        let mut set = CandidateSet::new(&[a, b]);

        assert_eq!(Some(a), set.next_address());
        assert_eq!(Some(b), set.next_address());
        assert_eq!(Some(a), set.next_address());

        set.record_failure(a);
        set.record_failure(a);
        // a is now backed off; only b comes around
        assert_eq!(Some(b), set.next_address());
        assert_eq!(Some(b), set.next_address());

        set.record_failure(b);
        set.record_failure(b);
        assert_eq!(None, set.next_address());
    }

    mod end_to_end {
        use super::*;

        /// A fake in-process nameserver: referrals for NS questions above
        /// the target, an authoritative answer at the target, echoing the
        /// question (and its 0x20 casing) faithfully.
        async fn spawn_fake_hierarchy() -> u16 {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = socket.local_addr().unwrap().port();

            tokio::spawn(async move {
                let mut buffer = vec![0_u8; 4096];
                loop {
                    let Ok((received, peer)) = socket.recv_from(&mut buffer).await else {
                        return;
                    };
                    let Ok(request) = Message::from_octets(&buffer[..received]) else {
                        continue;
                    };

                    let question = request.questions[0].clone();
                    let mut response = request.make_response();

                    match question.qtype {
                        QueryType::Record(RecordType::NS) => {
                            // delegate the asked-about zone to ourselves
                            let ns_name = DomainName::from_relative_dotted_string(
                                &question.name,
                                "ns",
                            )
                            .unwrap();
                            response.authority.push(ResourceRecord {
                                name: question.name.clone(),
                                rtype_with_data: RecordTypeWithData::NS {
                                    nsdname: ns_name.clone(),
                                },
                                rclass: RecordClass::IN,
                                ttl: 300,
                            });
                            response.additional.push(ResourceRecord {
                                name: ns_name,
                                rtype_with_data: RecordTypeWithData::A {
                                    address: Ipv4Addr::new(127, 0, 0, 1),
                                },
                                rclass: RecordClass::IN,
                                ttl: 300,
                            });
                        }
                        _ => {
                            response.header.is_authoritative = true;
                            response.answers.push(ResourceRecord {
                                name: question.name.clone(),
                                rtype_with_data: RecordTypeWithData::A {
                                    address: Ipv4Addr::new(192, 0, 2, 99),
                                },
                                rclass: RecordClass::IN,
                                ttl: 60,
                            });
                        }
                    }

                    let serialised = response.into_octets().unwrap();
                    let _ = socket.send_to(&serialised, peer).await;
                }
            });

            port
        }

        #[tokio::test]
        async fn walks_referrals_to_an_answer() {
            let port = spawn_fake_hierarchy().await;
            let resolver = IterativeResolver::new(
                ResolverConfig {
                    root_hints: vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))],
                    upstream_timeout: Duration::from_millis(500),
                    upstream_port: port,
                    ..ResolverConfig::default()
                },
                PortPool::new(),
            );

            let question = Question {
                name: domain("www.example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            };

            let answer = resolver.resolve(&question).await.unwrap();
            assert_eq!(Rcode::NoError, answer.rcode);
            assert_eq!(
                vec![ResourceRecord {
                    name: domain("www.example.com."),
                    rtype_with_data: RecordTypeWithData::A {
                        address: Ipv4Addr::new(192, 0, 2, 99),
                    },
                    rclass: RecordClass::IN,
                    ttl: 60,
                }],
                answer.answers
            );
            assert_eq!(60, answer.cache_ttl());
        }

        #[tokio::test]
        async fn unreachable_hierarchy_is_a_dead_end() {
            // nothing listens here, and the only candidate backs off after
            // repeated failures
            let resolver = IterativeResolver::new(
                ResolverConfig {
                    root_hints: vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))],
                    upstream_timeout: Duration::from_millis(50),
                    upstream_port: 9,
                    iteration_budget: 6,
                    ..ResolverConfig::default()
                },
                PortPool::new(),
            );

            let question = Question {
                name: domain("www.example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            };

            let error = resolver.resolve(&question).await.unwrap_err();
            assert!(
                matches!(
                    error,
                    ResolutionError::DeadEnd { .. } | ResolutionError::MaxIterations
                ),
                "got {error:?}"
            );
        }
    }
}
