//! The query dispatcher: the pipeline behind every inbound message.
//!
//! For a query: validate the shape (exactly one question), check any DNS
//! cookie, try the authoritative zones, then the response cache, then the
//! iterative resolver; rate-limit the outbound response; attach a cookie if
//! the client sent one; hand the bytes back to the listener.
//!
//! Parse failures are answered with FORMERR when an ID could be read.
//! Failures of the parser's security bounds are different: those messages
//! are dropped outright, since answering an attacker-shaped message is
//! exactly what an amplifier does.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::timeout;

use dns_types::protocol::deserialise::Error as ParseError;
use dns_types::protocol::edns::{CookieOption, Edns, ExtendedRcode};
use dns_types::protocol::types::*;
use dns_types::zones::types::Zones;

use crate::cache::{CacheEntry, SharedCache};
use crate::cookies::{CookieCheck, CookieManager};
use crate::enrich::ThreatIntel;
use crate::fingerprint::fingerprint_question;
use crate::local::{resolve_local, LocalOutcome};
use crate::recursive::IterativeResolver;
use crate::rrl::{RateLimiter, ResponseCategory, RrlVerdict};
use crate::util::types::{prioritising_merge, ResolvedAnswer};

pub const DEFAULT_QUERY_DEADLINE: Duration = Duration::from_secs(5);

/// The payload ceiling for clients which do not advertise one.
const PLAIN_DNS_PAYLOAD: usize = 512;
/// The most we will send over UDP regardless of what the client advertises.
const MAX_UDP_PAYLOAD: usize = 4096;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub recursion_enabled: bool,
    pub query_deadline: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            recursion_enabled: true,
            query_deadline: DEFAULT_QUERY_DEADLINE,
        }
    }
}

/// What the listener should do with the result.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// Send these bytes.  `max_udp_payload` is the truncation point for UDP
    /// transports; TCP listeners ignore it.
    Respond {
        bytes: Vec<u8>,
        max_udp_payload: usize,
    },
    /// Send nothing at all.
    NoResponse,
}

/// Cloning gives another handle to the same pipeline.
#[derive(Clone)]
pub struct Dispatcher {
    zones: Arc<RwLock<Zones>>,
    cache: SharedCache,
    rrl: Arc<RateLimiter>,
    cookies: CookieManager,
    threat_intel: Arc<ThreatIntel>,
    resolver: Arc<IterativeResolver>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        zones: Arc<RwLock<Zones>>,
        cache: SharedCache,
        rrl: Arc<RateLimiter>,
        cookies: CookieManager,
        threat_intel: Arc<ThreatIntel>,
        resolver: Arc<IterativeResolver>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            zones,
            cache,
            rrl,
            cookies,
            threat_intel,
            resolver,
            config,
        }
    }

    pub fn zones(&self) -> &Arc<RwLock<Zones>> {
        &self.zones
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn rrl(&self) -> &Arc<RateLimiter> {
        &self.rrl
    }

    /// Handle one raw inbound message.
    pub async fn handle(&self, wire: &[u8], peer: SocketAddr) -> DispatchOutcome {
        let query = match Message::from_octets_with_stats(wire) {
            Ok((query, stats)) => {
                tracing::trace!(
                    bytes_consumed = %stats.bytes_consumed,
                    pointer_ops = %stats.pointer_ops,
                    "parsed query"
                );
                query
            }
            Err(error) => return self.handle_parse_error(&error),
        };

        match timeout(
            self.config.query_deadline,
            self.handle_query(&query, peer),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(id = %query.header.id, ?peer, "query deadline elapsed");
                let mut response = query.make_response();
                response.header.rcode = Rcode::ServerFailure;
                self.finish(&query, response, peer, None)
            }
        }
    }

    fn handle_parse_error(&self, error: &ParseError) -> DispatchOutcome {
        match error {
            // security bounds: drop, do not reflect
            ParseError::CompressionBomb { .. }
            | ParseError::SectionOverflow { .. }
            | ParseError::RRsetTooLarge { .. }
            | ParseError::MessageTooLong { .. } => {
                tracing::warn!(%error, "dropping message that tripped a security bound");
                DispatchOutcome::NoResponse
            }
            // plain malformation: FORMERR if we can address the sender's
            // transaction at all
            other => match other.id() {
                Some(id) => {
                    tracing::debug!(%error, "malformed query");
                    serialise_or_drop(Message::make_format_error_response(id), PLAIN_DNS_PAYLOAD)
                }
                None => DispatchOutcome::NoResponse,
            },
        }
    }

    async fn handle_query(&self, query: &Message, peer: SocketAddr) -> DispatchOutcome {
        if query.header.is_response {
            return serialise_or_drop(
                Message::make_format_error_response(query.header.id),
                PLAIN_DNS_PAYLOAD,
            );
        }

        if query.header.opcode != Opcode::Standard {
            let mut response = query.make_response();
            response.header.rcode = Rcode::NotImplemented;
            return self.finish(query, response, peer, None);
        }

        // exactly one question
        let [question] = query.questions.as_slice() else {
            let mut response = query.make_response();
            response.header.rcode = Rcode::FormatError;
            return self.finish(query, response, peer, None);
        };
        let question = question.clone();

        let client_cookie = query.edns().and_then(|edns| edns.cookie().cloned());

        // cookie enforcement comes before any real work
        if let Some(cookie) = &client_cookie {
            match self.cookies.verify(cookie, peer.ip()) {
                CookieCheck::Valid | CookieCheck::ClientOnly => (),
                CookieCheck::Invalid => {
                    tracing::debug!(?peer, %question, "invalid server cookie");
                    if self.cookies.require_valid() {
                        let mut response = query.make_response();
                        response.set_extended_rcode(ExtendedRcode::BadCookie);
                        return self.finish(query, response, peer, client_cookie);
                    }
                }
            }
        }

        if question.is_unknown() {
            let mut response = query.make_response();
            response.header.rcode = Rcode::Refused;
            return self.finish(query, response, peer, client_cookie);
        }

        let mut response = query.make_response();
        response.header.recursion_available = self.config.recursion_enabled;

        let recursion_wanted = query.header.recursion_desired && self.config.recursion_enabled;

        let local_outcome = {
            let zones = self.zones.read().await;
            resolve_local(&zones, &question)
        };

        match local_outcome {
            LocalOutcome::Answer { rrs } => {
                response.header.is_authoritative = true;
                response.answers = rrs;
            }
            LocalOutcome::PartialAnswer { rrs, next_name } => {
                response.answers = rrs;
                if recursion_wanted {
                    let continuation = Question {
                        name: next_name,
                        qtype: question.qtype,
                        qclass: question.qclass,
                    };
                    match self.resolve_recursively(&continuation).await {
                        Ok((answer, _)) => {
                            prioritising_merge(&mut response.answers, answer.answers);
                            response.authority = answer.authority;
                            response.header.rcode = answer.rcode;
                        }
                        Err(error) => {
                            tracing::debug!(%error, %question, "cname continuation failed");
                            response.header.rcode = Rcode::ServerFailure;
                            response.answers = Vec::new();
                        }
                    }
                }
            }
            LocalOutcome::Delegation { ns_rrs, glue_rrs } => {
                response.authority = ns_rrs;
                response.additional = glue_rrs;
            }
            LocalOutcome::NoData { rrs, soa_rr } => {
                response.header.is_authoritative = true;
                response.answers = rrs;
                response.authority = vec![soa_rr];
            }
            LocalOutcome::NameError { rrs, soa_rr } => {
                response.header.is_authoritative = true;
                response.header.rcode = Rcode::NameError;
                response.answers = rrs;
                response.authority = vec![soa_rr];
            }
            LocalOutcome::ChainTooLong => {
                response.header.rcode = Rcode::ServerFailure;
            }
            LocalOutcome::NotAuthoritative => {
                if recursion_wanted {
                    match self.resolve_recursively(&question).await {
                        Ok((answer, reused_wire)) => {
                            if let Some(mut bytes) = reused_wire {
                                // a cache hit with nothing to re-encode:
                                // restore the stored response, rewrite the
                                // transaction id, and send it as-is
                                if client_cookie.is_none() {
                                    bytes[0..2].copy_from_slice(&query.header.id.to_be_bytes());
                                    return self.finish_prebuilt(
                                        query, &answer, bytes, peer,
                                    );
                                }
                            }
                            response.header.rcode = answer.rcode;
                            response.answers = answer.answers;
                            response.authority = answer.authority;
                        }
                        Err(error) => {
                            tracing::debug!(%error, %question, "recursive resolution failed");
                            response.header.rcode = Rcode::ServerFailure;
                        }
                    }
                } else {
                    response.header.rcode = Rcode::Refused;
                }
            }
        }

        self.finish(query, response, peer, client_cookie)
    }

    /// Cache-then-resolver.  Returns the answer and, for cache hits, the
    /// stored wire bytes for the fast path.
    async fn resolve_recursively(
        &self,
        question: &Question,
    ) -> Result<(ResolvedAnswer, Option<Vec<u8>>), crate::util::types::ResolutionError> {
        let fingerprint = fingerprint_question(question);

        if let Some(lookup) = self.cache.get(fingerprint) {
            let stale = lookup.is_stale();
            let entry = lookup.entry();

            match Message::from_octets(&entry.wire_bytes) {
                Ok(cached) => {
                    if stale {
                        // serve the stale data now, refresh it off-path
                        let this = self.clone();
                        let refresh_question = question.clone();
                        tokio::spawn(async move {
                            this.refresh(&refresh_question, fingerprint).await;
                        });
                    }

                    let answer = ResolvedAnswer {
                        rcode: cached.header.rcode,
                        answers: cached.answers,
                        authority: cached.authority,
                        additional: Vec::new(),
                    };
                    return Ok((answer, Some(entry.wire_bytes)));
                }
                Err(error) => {
                    // an entry whose bytes no longer parse is an internal
                    // invariant violation: evict it and fall through to a
                    // fresh resolution
                    tracing::warn!(
                        %error,
                        qname = %entry.qname,
                        "evicting cache entry that fails self-parse"
                    );
                    self.cache.delete(fingerprint);
                }
            }
        }

        let answer = self.resolver.resolve(question).await?;
        self.store(fingerprint, question, &answer).await;
        Ok((answer, None))
    }

    async fn refresh(&self, question: &Question, fingerprint: u64) {
        match self.resolver.resolve(question).await {
            Ok(answer) => self.store(fingerprint, question, &answer).await,
            Err(error) => {
                tracing::debug!(%error, %question, "stale refresh failed");
            }
        }
    }

    /// Encode and cache a resolved answer, enriched before it becomes
    /// visible.
    async fn store(&self, fingerprint: u64, question: &Question, answer: &ResolvedAnswer) {
        let mut message = Message::from_question(0, question.clone());
        message.header.is_response = true;
        message.header.recursion_desired = true;
        message.header.recursion_available = true;
        message.header.rcode = answer.rcode;
        message.answers = answer.answers.clone();
        message.authority = answer.authority.clone();

        let Ok(wire_bytes) = message.into_octets() else {
            return;
        };

        let mut entry = CacheEntry::new(fingerprint, question, wire_bytes, answer.cache_ttl());
        let signal = self.threat_intel.check_domain(&question.name).await;
        entry.apply_threat(&signal);
        if entry.threat_score > 50 {
            tracing::info!(
                qname = %question.name,
                score = %entry.threat_score,
                categories = ?entry.categories,
                "threat intelligence flagged domain"
            );
        }
        self.cache.set(entry);
    }

    /// The outbound half of the pipeline: rate-limit, attach a cookie,
    /// serialise.
    fn finish(
        &self,
        query: &Message,
        mut response: Message,
        peer: SocketAddr,
        client_cookie: Option<CookieOption>,
    ) -> DispatchOutcome {
        match self.rrl_verdict(query, &response, peer) {
            RrlVerdict::Drop => {
                tracing::debug!(?peer, "response rate limited: dropped");
                return DispatchOutcome::NoResponse;
            }
            RrlVerdict::Slip => {
                tracing::debug!(?peer, "response rate limited: slipped");
                response = query.make_slip_response();
                return serialise_or_drop(response, udp_payload_limit(query));
            }
            RrlVerdict::Allow => (),
        }

        if let Some(cookie) = client_cookie {
            let mut edns = response.edns().unwrap_or_default();
            edns.set_cookie(self.cookies.respond(cookie.client, peer.ip()));
            response.set_edns(&edns);
        }

        serialise_or_drop(response, udp_payload_limit(query))
    }

    /// The fast path for cached responses: the bytes are already built, so
    /// only the rate limiter stands between them and the wire.
    fn finish_prebuilt(
        &self,
        query: &Message,
        answer: &ResolvedAnswer,
        bytes: Vec<u8>,
        peer: SocketAddr,
    ) -> DispatchOutcome {
        let category = category_of(answer);
        let question = &query.questions[0];
        match self
            .rrl
            .check(peer.ip(), &question.name, question.qtype, category)
        {
            RrlVerdict::Drop => DispatchOutcome::NoResponse,
            RrlVerdict::Slip => {
                serialise_or_drop(query.make_slip_response(), udp_payload_limit(query))
            }
            RrlVerdict::Allow => DispatchOutcome::Respond {
                bytes,
                max_udp_payload: udp_payload_limit(query),
            },
        }
    }

    fn rrl_verdict(&self, query: &Message, response: &Message, peer: SocketAddr) -> RrlVerdict {
        let category = ResponseCategory::classify(response);
        let (qname, qtype) = match query.questions.first() {
            Some(question) => (question.name.clone(), question.qtype),
            None => (DomainName::root_domain(), QueryType::Wildcard),
        };
        self.rrl.check(peer.ip(), &qname, qtype, category)
    }
}

fn category_of(answer: &ResolvedAnswer) -> ResponseCategory {
    match answer.rcode {
        Rcode::NoError => {
            if !answer.answers.is_empty() {
                ResponseCategory::Response
            } else if !answer.authority.is_empty() {
                ResponseCategory::Referral
            } else {
                ResponseCategory::NoData
            }
        }
        Rcode::NameError => ResponseCategory::NxDomain,
        _ => ResponseCategory::Error,
    }
}

fn udp_payload_limit(query: &Message) -> usize {
    query.edns().map_or(PLAIN_DNS_PAYLOAD, |edns| {
        usize::from(edns.udp_payload_size).clamp(PLAIN_DNS_PAYLOAD, MAX_UDP_PAYLOAD)
    })
}

fn serialise_or_drop(response: Message, max_udp_payload: usize) -> DispatchOutcome {
    match response.into_octets() {
        Ok(bytes) => DispatchOutcome::Respond {
            bytes,
            max_udp_payload,
        },
        Err(error) => {
            tracing::warn!(%error, "could not serialise response");
            DispatchOutcome::NoResponse
        }
    }
}
