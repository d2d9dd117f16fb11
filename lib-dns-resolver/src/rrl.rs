//! Response Rate Limiting: token buckets per (client prefix, qname, qtype,
//! response category), mitigating the use of this server as a reflection
//! amplifier.
//!
//! Buckets live in a concurrent map so insertion races resolve by
//! load-or-store; each bucket is two atomics (millitokens and a refill
//! stamp), updated by compare-and-swap, so the check path takes no
//! shard-level lock.  A depleted bucket either drops the response outright
//! or, for one in `slip` depleted queries, substitutes a truncated empty
//! response - the client that retries over TCP thereby proves its source
//! address.
//!
//! The bucket key is SipHash under a per-process random key, deliberately
//! separate from the cache fingerprint and from the resolver's port/ID
//! randomness.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

use dns_types::protocol::types::*;

use crate::util::types::TaskHandle;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_IPV4_PREFIX_LEN: u8 = 24;
pub const DEFAULT_IPV6_PREFIX_LEN: u8 = 56;

#[derive(Debug, Clone)]
pub struct RrlConfig {
    pub enabled: bool,
    /// The interval over which bucket capacity is denominated:
    /// capacity = rate × window.
    pub window: Duration,
    /// Per-category rates in responses per second; 0 means unlimited.
    pub responses_per_second: u32,
    pub referrals_per_second: u32,
    pub nodata_per_second: u32,
    pub nxdomains_per_second: u32,
    pub errors_per_second: u32,
    /// A catch-all bucket applied on top of the per-category ones; 0
    /// disables it.
    pub all_per_second: u32,
    /// 0 drops every rate-limited response; `n` > 0 turns every n-th
    /// depleted bucket's responses into truncated empty ones.
    pub slip: u32,
    pub ipv4_prefix_len: u8,
    pub ipv6_prefix_len: u8,
    /// Client prefixes that bypass rate limiting entirely.
    pub exempt: Vec<(IpAddr, u8)>,
    pub sweep_interval: Duration,
}

impl Default for RrlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: DEFAULT_WINDOW,
            responses_per_second: 0,
            referrals_per_second: 0,
            nodata_per_second: 0,
            nxdomains_per_second: 0,
            errors_per_second: 0,
            all_per_second: 0,
            slip: 2,
            ipv4_prefix_len: DEFAULT_IPV4_PREFIX_LEN,
            ipv6_prefix_len: DEFAULT_IPV6_PREFIX_LEN,
            exempt: Vec::new(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// The RRL classification of an outbound response.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResponseCategory {
    Response,
    Referral,
    NoData,
    NxDomain,
    Error,
    All,
}

impl ResponseCategory {
    /// Classify from the rcode and section counts.
    pub fn classify(response: &Message) -> Self {
        match response.header.rcode {
            Rcode::NoError => {
                if !response.answers.is_empty() {
                    ResponseCategory::Response
                } else if !response.authority.is_empty() {
                    ResponseCategory::Referral
                } else {
                    ResponseCategory::NoData
                }
            }
            Rcode::NameError => ResponseCategory::NxDomain,
            _ => ResponseCategory::Error,
        }
    }

    fn byte(self) -> u8 {
        match self {
            ResponseCategory::Response => 0,
            ResponseCategory::Referral => 1,
            ResponseCategory::NoData => 2,
            ResponseCategory::NxDomain => 3,
            ResponseCategory::Error => 4,
            ResponseCategory::All => 5,
        }
    }
}

impl std::fmt::Display for ResponseCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResponseCategory::Response => write!(f, "response"),
            ResponseCategory::Referral => write!(f, "referral"),
            ResponseCategory::NoData => write!(f, "nodata"),
            ResponseCategory::NxDomain => write!(f, "nxdomain"),
            ResponseCategory::Error => write!(f, "error"),
            ResponseCategory::All => write!(f, "all"),
        }
    }
}

/// What to do with an outbound response.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RrlVerdict {
    /// Send it.
    Allow,
    /// Send nothing at all.
    Drop,
    /// Send a truncated empty response, forcing a TCP retry.
    Slip,
}

struct Bucket {
    millitokens: AtomicI64,
    last_refill_ms: AtomicU64,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct RrlStats {
    pub allowed: u64,
    pub dropped: u64,
    pub slipped: u64,
    pub buckets: usize,
}

pub struct RateLimiter {
    config: RrlConfig,
    hash_key: [u8; 16],
    buckets: DashMap<u64, Bucket>,
    epoch: Instant,
    allowed: AtomicU64,
    dropped: AtomicU64,
    slipped: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RrlConfig) -> Self {
        Self {
            config,
            hash_key: rand::thread_rng().gen(),
            buckets: DashMap::new(),
            epoch: Instant::now(),
            allowed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slipped: AtomicU64::new(0),
        }
    }

    /// Decide the fate of one outbound response.
    pub fn check(
        &self,
        client: IpAddr,
        qname: &DomainName,
        qtype: QueryType,
        category: ResponseCategory,
    ) -> RrlVerdict {
        if !self.config.enabled || self.is_exempt(client) {
            return RrlVerdict::Allow;
        }

        let mut verdict = self.check_bucket(client, qname, qtype, category);
        if verdict == RrlVerdict::Allow && self.config.all_per_second > 0 {
            verdict = self.check_bucket(client, qname, qtype, ResponseCategory::All);
        }

        match verdict {
            RrlVerdict::Allow => self.allowed.fetch_add(1, Ordering::Relaxed),
            RrlVerdict::Drop => self.dropped.fetch_add(1, Ordering::Relaxed),
            RrlVerdict::Slip => self.slipped.fetch_add(1, Ordering::Relaxed),
        };

        verdict
    }

    fn check_bucket(
        &self,
        client: IpAddr,
        qname: &DomainName,
        qtype: QueryType,
        category: ResponseCategory,
    ) -> RrlVerdict {
        let rate = self.rate_for(category);
        if rate == 0 {
            return RrlVerdict::Allow;
        }

        let capacity = i64::from(rate) * self.config.window.as_millis() as i64;
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let key = self.bucket_key(client, qname, qtype, category);

        let bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            millitokens: AtomicI64::new(capacity),
            last_refill_ms: AtomicU64::new(now_ms),
        });

        // refill for the elapsed time; whoever wins the stamp CAS applies
        // the whole credit
        loop {
            let last = bucket.last_refill_ms.load(Ordering::Acquire);
            let elapsed = now_ms.saturating_sub(last);
            if elapsed == 0 {
                break;
            }
            if bucket
                .last_refill_ms
                .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let credit = elapsed as i64 * i64::from(rate);
                let _ = bucket
                    .millitokens
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                        Some(tokens.saturating_add(credit).min(capacity))
                    });
                break;
            }
        }

        // deduct-then-restore: the balance may transiently read one token
        // low, but never goes visibly negative
        let before = bucket.millitokens.fetch_sub(1000, Ordering::AcqRel);
        if before >= 1000 {
            RrlVerdict::Allow
        } else {
            bucket.millitokens.fetch_add(1000, Ordering::AcqRel);
            if self.config.slip > 0 && key % u64::from(self.config.slip) == 0 {
                RrlVerdict::Slip
            } else {
                RrlVerdict::Drop
            }
        }
    }

    fn rate_for(&self, category: ResponseCategory) -> u32 {
        match category {
            ResponseCategory::Response => self.config.responses_per_second,
            ResponseCategory::Referral => self.config.referrals_per_second,
            ResponseCategory::NoData => self.config.nodata_per_second,
            ResponseCategory::NxDomain => self.config.nxdomains_per_second,
            ResponseCategory::Error => self.config.errors_per_second,
            ResponseCategory::All => self.config.all_per_second,
        }
    }

    fn is_exempt(&self, client: IpAddr) -> bool {
        self.config
            .exempt
            .iter()
            .any(|(prefix, len)| prefix_contains(*prefix, *len, client))
    }

    fn bucket_key(
        &self,
        client: IpAddr,
        qname: &DomainName,
        qtype: QueryType,
        category: ResponseCategory,
    ) -> u64 {
        let mut hasher = SipHasher24::new_with_key(&self.hash_key);
        match client {
            IpAddr::V4(ip) => {
                hasher.write(&mask_octets(&ip.octets(), self.config.ipv4_prefix_len));
            }
            IpAddr::V6(ip) => {
                hasher.write(&mask_octets(&ip.octets(), self.config.ipv6_prefix_len));
            }
        }
        hasher.write(&qname.lowercased_octets());
        hasher.write(&u16::from(qtype).to_be_bytes());
        hasher.write(&[category.byte()]);
        hasher.finish()
    }

    /// Drop buckets idle for more than two windows.  Returns how many were
    /// collected.
    pub fn sweep(&self) -> usize {
        let cutoff = self
            .epoch
            .elapsed()
            .saturating_sub(self.config.window * 2)
            .as_millis() as u64;

        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_refill_ms.load(Ordering::Acquire) >= cutoff);
        before - self.buckets.len()
    }

    /// Launch the periodic bucket sweep.
    pub fn spawn_sweep(self: &std::sync::Arc<Self>) -> TaskHandle {
        let limiter = std::sync::Arc::clone(self);
        let interval = self.config.sweep_interval;

        TaskHandle::spawn(move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    () = tokio::time::sleep(interval) => {
                        let collected = limiter.sweep();
                        if collected > 0 {
                            tracing::debug!(%collected, "swept idle RRL buckets");
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> RrlStats {
        RrlStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            slipped: self.slipped.load(Ordering::Relaxed),
            buckets: self.buckets.len(),
        }
    }
}

/// Zero the address bits past the prefix length.
fn mask_octets(octets: &[u8], prefix_len: u8) -> Vec<u8> {
    let mut masked = octets.to_vec();
    let full_octets = usize::from(prefix_len / 8);
    let spare_bits = prefix_len % 8;

    for (i, octet) in masked.iter_mut().enumerate() {
        if i < full_octets {
            continue;
        }
        if i == full_octets && spare_bits > 0 {
            *octet &= 0xFF_u8 << (8 - spare_bits);
        } else {
            *octet = 0;
        }
    }
    masked
}

fn prefix_contains(prefix: IpAddr, len: u8, client: IpAddr) -> bool {
    match (prefix, client) {
        (IpAddr::V4(p), IpAddr::V4(c)) => {
            mask_octets(&p.octets(), len) == mask_octets(&c.octets(), len)
        }
        (IpAddr::V6(p), IpAddr::V6(c)) => {
            mask_octets(&p.octets(), len) == mask_octets(&c.octets(), len)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn client(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    fn a_in() -> (QueryType, QueryClass) {
        (
            QueryType::Record(RecordType::A),
            QueryClass::Record(RecordClass::IN),
        )
    }

    fn limiter(responses_per_second: u32, window_secs: u64, slip: u32) -> RateLimiter {
        RateLimiter::new(RrlConfig {
            responses_per_second,
            window: Duration::from_secs(window_secs),
            slip,
            ..RrlConfig::default()
        })
    }

    #[test]
    fn depleted_bucket_drops_with_slip_zero() {
        let limiter = limiter(2, 1, 0);
        let (qtype, _) = a_in();
        let qname = domain("www.example.com.");

        let verdicts = (0..3)
            .map(|_| limiter.check(client(1), &qname, qtype, ResponseCategory::Response))
            .collect::<Vec<_>>();

        assert_eq!(
            vec![RrlVerdict::Allow, RrlVerdict::Allow, RrlVerdict::Drop],
            verdicts
        );

        let stats = limiter.stats();
        assert_eq!(2, stats.allowed);
        assert_eq!(1, stats.dropped);
        assert_eq!(0, stats.slipped);
    }

    #[test]
    fn depleted_bucket_slips_with_slip_one() {
        let limiter = limiter(2, 1, 1);
        let (qtype, _) = a_in();
        let qname = domain("www.example.com.");

        let verdicts = (0..3)
            .map(|_| limiter.check(client(1), &qname, qtype, ResponseCategory::Response))
            .collect::<Vec<_>>();

        assert_eq!(
            vec![RrlVerdict::Allow, RrlVerdict::Allow, RrlVerdict::Slip],
            verdicts
        );
        assert_eq!(1, limiter.stats().slipped);
    }

    #[test]
    fn clients_in_same_prefix_share_a_bucket() {
        let limiter = limiter(1, 1, 0);
        let (qtype, _) = a_in();
        let qname = domain("www.example.com.");

        assert_eq!(
            RrlVerdict::Allow,
            limiter.check(client(1), &qname, qtype, ResponseCategory::Response)
        );
        // a different host in the same /24 hits the same bucket
        assert_eq!(
            RrlVerdict::Drop,
            limiter.check(client(2), &qname, qtype, ResponseCategory::Response)
        );
        // a different /24 does not
        assert_eq!(
            RrlVerdict::Allow,
            limiter.check(
                IpAddr::V4(Ipv4Addr::new(203, 0, 112, 1)),
                &qname,
                qtype,
                ResponseCategory::Response
            )
        );
    }

    #[test]
    fn categories_have_independent_buckets() {
        let limiter = RateLimiter::new(RrlConfig {
            responses_per_second: 1,
            nxdomains_per_second: 1,
            window: Duration::from_secs(1),
            slip: 0,
            ..RrlConfig::default()
        });
        let (qtype, _) = a_in();
        let qname = domain("www.example.com.");

        assert_eq!(
            RrlVerdict::Allow,
            limiter.check(client(1), &qname, qtype, ResponseCategory::Response)
        );
        assert_eq!(
            RrlVerdict::Allow,
            limiter.check(client(1), &qname, qtype, ResponseCategory::NxDomain)
        );
        assert_eq!(
            RrlVerdict::Drop,
            limiter.check(client(1), &qname, qtype, ResponseCategory::Response)
        );
    }

    #[test]
    fn unlimited_categories_always_allow() {
        let limiter = limiter(0, 1, 0);
        let (qtype, _) = a_in();
        let qname = domain("www.example.com.");

        for _ in 0..100 {
            assert_eq!(
                RrlVerdict::Allow,
                limiter.check(client(1), &qname, qtype, ResponseCategory::Response)
            );
        }
        assert_eq!(0, limiter.stats().buckets);
    }

    #[test]
    fn exempt_prefixes_bypass() {
        let limiter = RateLimiter::new(RrlConfig {
            responses_per_second: 1,
            window: Duration::from_secs(1),
            slip: 0,
            exempt: vec![(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 0)), 24)],
            ..RrlConfig::default()
        });
        let (qtype, _) = a_in();
        let qname = domain("www.example.com.");

        for _ in 0..10 {
            assert_eq!(
                RrlVerdict::Allow,
                limiter.check(client(9), &qname, qtype, ResponseCategory::Response)
            );
        }
    }

    #[test]
    fn ipv6_clients_are_keyed_by_prefix() {
        let limiter = limiter(1, 1, 0);
        let (qtype, _) = a_in();
        let qname = domain("www.example.com.");

        let a = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 1, 0, 0, 0, 1));
        let b = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 1, 0xffff, 0, 0, 2));

        assert_eq!(
            RrlVerdict::Allow,
            limiter.check(a, &qname, qtype, ResponseCategory::Response)
        );
        // same /56
        assert_eq!(
            RrlVerdict::Drop,
            limiter.check(b, &qname, qtype, ResponseCategory::Response)
        );
    }

    #[test]
    fn classify_follows_the_contract() {
        let question = Question {
            name: domain("www.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };
        let base = Message::from_question(1, question).make_response();

        let mut with_answer = base.clone();
        with_answer
            .answers
            .push(a_record("www.example.com.", Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(
            ResponseCategory::Response,
            ResponseCategory::classify(&with_answer)
        );

        let mut referral = base.clone();
        referral
            .authority
            .push(ns_record("example.com.", "ns1.example.net."));
        assert_eq!(
            ResponseCategory::Referral,
            ResponseCategory::classify(&referral)
        );

        assert_eq!(ResponseCategory::NoData, ResponseCategory::classify(&base));

        let mut nxdomain = base.clone();
        nxdomain.header.rcode = Rcode::NameError;
        assert_eq!(
            ResponseCategory::NxDomain,
            ResponseCategory::classify(&nxdomain)
        );

        let mut error = base.clone();
        error.header.rcode = Rcode::ServerFailure;
        assert_eq!(ResponseCategory::Error, ResponseCategory::classify(&error));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = limiter(5, 1, 0);
        let (qtype, _) = a_in();
        let qname = domain("www.example.com.");

        // drain the 5-token bucket
        for _ in 0..5 {
            assert_eq!(
                RrlVerdict::Allow,
                limiter.check(client(1), &qname, qtype, ResponseCategory::Response)
            );
        }
        assert_eq!(
            RrlVerdict::Drop,
            limiter.check(client(1), &qname, qtype, ResponseCategory::Response)
        );

        // 5/s is a token every 200ms
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(
            RrlVerdict::Allow,
            limiter.check(client(1), &qname, qtype, ResponseCategory::Response)
        );
    }

    #[test]
    fn sweep_collects_idle_buckets() {
        let limiter = RateLimiter::new(RrlConfig {
            responses_per_second: 1,
            window: Duration::from_millis(10),
            slip: 0,
            ..RrlConfig::default()
        });
        let (qtype, _) = a_in();
        let qname = domain("www.example.com.");

        limiter.check(client(1), &qname, qtype, ResponseCategory::Response);
        assert_eq!(1, limiter.stats().buckets);

        // fresh buckets survive
        assert_eq!(0, limiter.sweep());

        // two windows later, the idle bucket is collected
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(1, limiter.sweep());
        assert_eq!(0, limiter.stats().buckets);
    }
}
