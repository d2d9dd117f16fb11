//! DNS cookie issue and validation, per RFC 7873 with the RFC 9018
//! interoperable server-cookie layout.
//!
//! The server cookie is `version(1) ‖ reserved(3) ‖ timestamp(4) ‖ hash(8)`,
//! where the hash is SipHash-2-4 over the client cookie, the client IP, the
//! version byte, the zero padding, and the big-endian mint timestamp.
//! Carrying the timestamp in the cookie is what lets validation recompute
//! the hash at all; age is still only bounded indirectly, by secret
//! rotation retiring old secrets.
//!
//! Secrets live in an atomically swapped snapshot: validation reads the
//! snapshot once and tries the current secret, then the previous one, so
//! rotation never invalidates an in-flight validation.  In cluster-shared
//! mode every node is configured with the same static secret and rotation
//! is disabled, so any member can validate a cookie minted by any other.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rand::Rng;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

use dns_types::protocol::edns::CookieOption;

use crate::util::types::TaskHandle;

pub const SERVER_COOKIE_VERSION: u8 = 1;
pub const SERVER_COOKIE_LEN: usize = 16;
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// The outcome of checking a request's cookie option.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CookieCheck {
    /// Only a client cookie: a first contact, never an error.
    ClientOnly,
    /// The server cookie was minted by this server (or this cluster) for
    /// this client.
    Valid,
    /// The server cookie is malformed or fails the hash.
    Invalid,
}

#[derive(Debug, Copy, Clone)]
struct Secret {
    key: [u8; 16],
    acquired_at: SystemTime,
}

impl Secret {
    fn fresh() -> Self {
        Self {
            key: rand::thread_rng().gen(),
            acquired_at: SystemTime::now(),
        }
    }
}

struct Secrets {
    current: Secret,
    previous: Option<Secret>,
}

/// Cloning gives another handle to the same manager.
#[derive(Clone)]
pub struct CookieManager {
    inner: Arc<Inner>,
}

struct Inner {
    secrets: RwLock<Arc<Secrets>>,
    cluster_shared: bool,
    require_valid: bool,
    rotation_interval: Duration,
}

impl CookieManager {
    /// A manager with a freshly generated random secret, rotated on the
    /// default interval.
    pub fn new(require_valid: bool) -> Self {
        Self::build(Secret::fresh(), false, require_valid)
    }

    /// A manager using an operator-provided cluster secret.  Rotation is
    /// disabled: all cluster members share this static secret.
    pub fn with_cluster_secret(secret: [u8; 16], require_valid: bool) -> Self {
        Self::build(
            Secret {
                key: secret,
                acquired_at: SystemTime::now(),
            },
            true,
            require_valid,
        )
    }

    fn build(current: Secret, cluster_shared: bool, require_valid: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                secrets: RwLock::new(Arc::new(Secrets {
                    current,
                    previous: None,
                })),
                cluster_shared,
                require_valid,
                rotation_interval: DEFAULT_ROTATION_INTERVAL,
            }),
        }
    }

    /// Whether invalid cookies get a `BadCookie` response rather than just a
    /// log line.
    pub fn require_valid(&self) -> bool {
        self.inner.require_valid
    }

    /// Mint a server cookie for this client cookie and address.
    pub fn mint(&self, client: [u8; 8], client_ip: IpAddr) -> Vec<u8> {
        let timestamp = unix_seconds(SystemTime::now());
        let secrets = Arc::clone(&self.inner.secrets.read());
        server_cookie(&secrets.current.key, client, client_ip, timestamp).to_vec()
    }

    /// Mint a full cookie option echoing the client cookie.
    pub fn respond(&self, client: [u8; 8], client_ip: IpAddr) -> CookieOption {
        CookieOption {
            client,
            server: Some(self.mint(client, client_ip)),
        }
    }

    /// Check a request's cookie.  Tries the current secret, then the
    /// previous one, so a cookie minted just before a rotation stays valid
    /// for a full rotation interval.
    pub fn verify(&self, cookie: &CookieOption, client_ip: IpAddr) -> CookieCheck {
        let Some(server) = &cookie.server else {
            return CookieCheck::ClientOnly;
        };

        if server.len() != SERVER_COOKIE_LEN || server[0] != SERVER_COOKIE_VERSION {
            return CookieCheck::Invalid;
        }
        let timestamp = u32::from_be_bytes([server[4], server[5], server[6], server[7]]);

        let secrets = Arc::clone(&self.inner.secrets.read());
        let expected = server_cookie(&secrets.current.key, cookie.client, client_ip, timestamp);
        if constant_time_eq(server, &expected) {
            return CookieCheck::Valid;
        }

        if let Some(previous) = &secrets.previous {
            let expected = server_cookie(&previous.key, cookie.client, client_ip, timestamp);
            if constant_time_eq(server, &expected) {
                return CookieCheck::Valid;
            }
        }

        CookieCheck::Invalid
    }

    /// Retire the current secret to `previous` and generate a new one.
    /// No-op in cluster-shared mode.
    pub fn rotate(&self) {
        if self.inner.cluster_shared {
            tracing::debug!("cookie secret rotation skipped: cluster-shared secret");
            return;
        }

        let mut secrets = self.inner.secrets.write();
        let retiring = secrets.current;
        *secrets = Arc::new(Secrets {
            current: Secret::fresh(),
            previous: Some(retiring),
        });
        tracing::info!(
            retired_age_seconds =
                %retiring.acquired_at.elapsed().map_or(0, |age| age.as_secs()),
            "rotated cookie secret"
        );
    }

    /// Launch the periodic rotation task.  In cluster-shared mode this
    /// still spawns, but each tick is a no-op.
    pub fn spawn_rotation(&self) -> TaskHandle {
        let manager = self.clone();
        let interval = self.inner.rotation_interval;

        TaskHandle::spawn(move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    () = tokio::time::sleep(interval) => manager.rotate(),
                }
            }
        })
    }
}

/// `version ‖ reserved ‖ timestamp ‖ SipHash-2-4(secret, client ‖ ip ‖
/// version ‖ pad ‖ timestamp)`.
fn server_cookie(
    key: &[u8; 16],
    client: [u8; 8],
    client_ip: IpAddr,
    timestamp: u32,
) -> [u8; SERVER_COOKIE_LEN] {
    let mut hasher = SipHasher24::new_with_key(key);
    hasher.write(&client);
    match client_ip {
        IpAddr::V4(ip) => hasher.write(&ip.octets()),
        IpAddr::V6(ip) => hasher.write(&ip.octets()),
    }
    hasher.write(&[SERVER_COOKIE_VERSION, 0, 0, 0]);
    hasher.write(&timestamp.to_be_bytes());
    let hash = hasher.finish().to_be_bytes();

    let mut cookie = [0; SERVER_COOKIE_LEN];
    cookie[0] = SERVER_COOKIE_VERSION;
    cookie[4..8].copy_from_slice(&timestamp.to_be_bytes());
    cookie[8..].copy_from_slice(&hash);
    cookie
}

fn unix_seconds(now: SystemTime) -> u32 {
    now.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as u32)
}

/// Compare without an early exit, so the comparison time does not leak how
/// much of the cookie matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut difference = 0_u8;
    for (x, y) in a.iter().zip(b) {
        difference |= x ^ y;
    }
    difference == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const CLIENT: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    fn other_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 8))
    }

    #[test]
    fn minted_cookie_validates() {
        let manager = CookieManager::new(true);
        let cookie = manager.respond(CLIENT, ip());

        assert_eq!(SERVER_COOKIE_LEN, cookie.server.as_ref().unwrap().len());
        assert_eq!(CookieCheck::Valid, manager.verify(&cookie, ip()));
    }

    #[test]
    fn client_only_cookie_is_first_contact() {
        let manager = CookieManager::new(true);
        let cookie = CookieOption {
            client: CLIENT,
            server: None,
        };

        assert_eq!(CookieCheck::ClientOnly, manager.verify(&cookie, ip()));
    }

    #[test]
    fn tampered_cookie_is_invalid() {
        let manager = CookieManager::new(true);
        let mut cookie = manager.respond(CLIENT, ip());

        // flip the last octet of the server cookie
        if let Some(server) = &mut cookie.server {
            *server.last_mut().unwrap() ^= 0xFF;
        }

        assert_eq!(CookieCheck::Invalid, manager.verify(&cookie, ip()));
    }

    #[test]
    fn cookie_is_bound_to_client_address() {
        let manager = CookieManager::new(true);
        let cookie = manager.respond(CLIENT, ip());

        assert_eq!(CookieCheck::Invalid, manager.verify(&cookie, other_ip()));
    }

    #[test]
    fn wrong_length_or_version_is_invalid() {
        let manager = CookieManager::new(true);

        let short = CookieOption {
            client: CLIENT,
            server: Some(vec![0; 8]),
        };
        assert_eq!(CookieCheck::Invalid, manager.verify(&short, ip()));

        let mut cookie = manager.respond(CLIENT, ip());
        if let Some(server) = &mut cookie.server {
            server[0] = 2;
        }
        assert_eq!(CookieCheck::Invalid, manager.verify(&cookie, ip()));
    }

    #[test]
    fn rotation_keeps_previous_secret_valid() {
        let manager = CookieManager::new(true);
        let cookie = manager.respond(CLIENT, ip());

        manager.rotate();
        assert_eq!(CookieCheck::Valid, manager.verify(&cookie, ip()));

        // a second rotation retires the minting secret entirely
        manager.rotate();
        assert_eq!(CookieCheck::Invalid, manager.verify(&cookie, ip()));
    }

    #[test]
    fn cluster_members_validate_each_others_cookies() {
        let secret = [0x42; 16];
        let node_a = CookieManager::with_cluster_secret(secret, true);
        let node_b = CookieManager::with_cluster_secret(secret, true);

        let cookie = node_a.respond(CLIENT, ip());
        assert_eq!(CookieCheck::Valid, node_b.verify(&cookie, ip()));

        // rotation is disabled in cluster mode
        node_b.rotate();
        assert_eq!(CookieCheck::Valid, node_b.verify(&cookie, ip()));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"", b""));
    }
}
