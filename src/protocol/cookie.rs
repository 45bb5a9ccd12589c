//! Cookie-based denial-of-service mitigation
//!
//! Under load a responder answers handshake messages with a cookie reply
//! instead of doing any DH work. The sender proves its source address by
//! echoing the cookie as mac2 on subsequent handshake messages.
//!
//! [`CookieJar`] is the sender side (cache a received cookie, emit mac2);
//! [`CookieChecker`] is the responder side (rotate the signing secret,
//! verify mac1/mac2, mint replies); [`RateLimiter`] sheds excess handshake
//! attempts per source IP before any decryption.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Instant;

use rand::RngCore;

use crate::crypto::{aead, blake2s, noise};
use crate::error::CryptoError;
use crate::protocol::messages::CookieReply;
use crate::protocol::COOKIE_REFRESH_TIME;

/// Token bucket capacity per source IP
pub const HANDSHAKE_BURST: u32 = 10;

/// One token refills per this interval
pub const HANDSHAKE_REFILL_MILLIS: u64 = 100;

/// Drop remembered source IPs beyond this many
const RATE_LIMITER_MAX_ENTRIES: usize = 4096;

/// Sender-side cookie state for one peer
#[derive(Default)]
pub struct CookieJar {
    cookie: Option<[u8; 16]>,
    received_at: Option<Instant>,
    /// mac1 of the last handshake message we sent; the reply's AEAD binds
    /// to it
    last_mac1: Option<[u8; 16]>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the mac1 of an outgoing handshake message
    pub fn note_mac1(&mut self, mac1: [u8; 16]) {
        self.last_mac1 = Some(mac1);
    }

    fn valid_cookie(&self) -> Option<&[u8; 16]> {
        match (&self.cookie, self.received_at) {
            (Some(cookie), Some(at)) if at.elapsed() < COOKIE_REFRESH_TIME => Some(cookie),
            _ => None,
        }
    }

    /// mac2 over a message prefix: keyed by the live cookie, or zeros
    /// when no cookie is held
    pub fn mac2(&self, message: &[u8]) -> [u8; 16] {
        match self.valid_cookie() {
            Some(cookie) => blake2s::mac_keyed16(cookie, message),
            None => [0u8; 16],
        }
    }

    /// Decrypt and store the cookie from a reply. `peer_public` is the
    /// static key of the peer that sent the reply.
    pub fn consume_reply(
        &mut self,
        reply: &CookieReply,
        peer_public: &[u8; 32],
    ) -> Result<(), CryptoError> {
        let last_mac1 = self.last_mac1.ok_or(CryptoError::Decryption)?;

        let key = noise::cookie_key(peer_public);
        let decrypted = aead::xdecrypt(&key, &reply.nonce, &reply.encrypted_cookie, &last_mac1)?;

        if decrypted.len() != 16 {
            return Err(CryptoError::Decryption);
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&decrypted);
        self.cookie = Some(cookie);
        self.received_at = Some(Instant::now());

        tracing::debug!("stored cookie, valid for {:?}", COOKIE_REFRESH_TIME);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cookie = None;
        self.received_at = None;
        self.last_mac1 = None;
    }
}

struct CookieSecret {
    secret: [u8; 32],
    birth: Instant,
}

/// Responder-side cookie state for a device identity
pub struct CookieChecker {
    mac1_key: [u8; 32],
    cookie_encryption_key: [u8; 32],
    secret: Mutex<CookieSecret>,
}

impl CookieChecker {
    /// Build a checker for our static public key
    pub fn new(our_public: &[u8; 32]) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            mac1_key: noise::mac1_key(our_public),
            cookie_encryption_key: noise::cookie_key(our_public),
            secret: Mutex::new(CookieSecret {
                secret,
                birth: Instant::now(),
            }),
        }
    }

    /// Verify the mac1 trailer of a handshake message. Cheap; runs before
    /// any DH.
    pub fn verify_mac1(&self, message: &[u8]) -> bool {
        if message.len() < 32 {
            return false;
        }
        let (covered, macs) = message.split_at(message.len() - 32);
        let expected = blake2s::mac(&self.mac1_key, covered);
        constant_time_eq(&expected, &macs[..16])
    }

    /// The cookie currently owed to `src`: a keyed MAC of the source
    /// endpoint under the rotating secret
    fn current_cookie(&self, src: SocketAddr) -> [u8; 16] {
        let mut guard = self.secret.lock().unwrap();
        if guard.birth.elapsed() >= COOKIE_REFRESH_TIME {
            rand::thread_rng().fill_bytes(&mut guard.secret);
            guard.birth = Instant::now();
        }

        let mut material = Vec::with_capacity(18);
        match src.ip() {
            IpAddr::V4(ip) => material.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => material.extend_from_slice(&ip.octets()),
        }
        material.extend_from_slice(&src.port().to_le_bytes());

        blake2s::mac(&guard.secret, &material)
    }

    /// Verify the mac2 trailer of a handshake message against the cookie
    /// owed to `src`
    pub fn verify_mac2(&self, message: &[u8], src: SocketAddr) -> bool {
        if message.len() < 32 {
            return false;
        }
        let cookie = self.current_cookie(src);
        let covered = &message[..message.len() - 16];
        let expected = blake2s::mac_keyed16(&cookie, covered);
        constant_time_eq(&expected, &message[message.len() - 16..])
    }

    /// Mint a cookie reply for a handshake message we refused under load.
    /// `mac1` is the mac1 of the refused message; the reply's AEAD uses it
    /// as associated data.
    pub fn create_reply(
        &self,
        receiver_index: u32,
        mac1: &[u8; 16],
        src: SocketAddr,
    ) -> Result<CookieReply, CryptoError> {
        let cookie = self.current_cookie(src);

        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = aead::xencrypt(&self.cookie_encryption_key, &nonce, &cookie, mac1)?;
        let mut encrypted_cookie = [0u8; 32];
        encrypted_cookie.copy_from_slice(&sealed);

        Ok(CookieReply {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Per-source-IP token bucket shedding handshake floods
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a handshake attempt from `ip` may proceed
    pub fn allow(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().unwrap();

        if buckets.len() > RATE_LIMITER_MAX_ENTRIES {
            buckets.retain(|_, b| b.tokens < HANDSHAKE_BURST);
        }

        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: HANDSHAKE_BURST,
            last_refill: Instant::now(),
        });

        let refill = (bucket.last_refill.elapsed().as_millis() as u64) / HANDSHAKE_REFILL_MILLIS;
        if refill > 0 {
            bucket.tokens = bucket.tokens.saturating_add(refill as u32).min(HANDSHAKE_BURST);
            bucket.last_refill = Instant::now();
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    #[test]
    fn test_jar_empty() {
        let jar = CookieJar::new();
        assert_eq!(jar.mac2(b"message"), [0u8; 16]);
    }

    #[test]
    fn test_mac1_verification() {
        let our_public = [7u8; 32];
        let checker = CookieChecker::new(&our_public);

        let mut message = vec![0u8; 148];
        message[0] = 1;
        let mac1 = noise::compute_mac1(&our_public, &message[..116]);
        message[116..132].copy_from_slice(&mac1);

        assert!(checker.verify_mac1(&message));

        message[20] ^= 0xFF;
        assert!(!checker.verify_mac1(&message));
    }

    #[test]
    fn test_cookie_reply_roundtrip() {
        let our_public = [9u8; 32];
        let checker = CookieChecker::new(&our_public);
        let src = endpoint(51820);

        let mac1 = [3u8; 16];
        let reply = checker.create_reply(77, &mac1, src).unwrap();
        assert_eq!(reply.receiver_index, 77);

        // The peer decrypts the cookie and can then produce a mac2 the
        // checker accepts
        let mut jar = CookieJar::new();
        jar.note_mac1(mac1);
        jar.consume_reply(&reply, &our_public).unwrap();

        let mut message = vec![0u8; 148];
        let mac2 = jar.mac2(&message[..132]);
        message[132..148].copy_from_slice(&mac2);

        assert!(checker.verify_mac2(&message, src));
        // A different source endpoint is owed a different cookie
        assert!(!checker.verify_mac2(&message, endpoint(51821)));
    }

    #[test]
    fn test_reply_requires_matching_mac1() {
        let our_public = [9u8; 32];
        let checker = CookieChecker::new(&our_public);

        let reply = checker.create_reply(1, &[3u8; 16], endpoint(1000)).unwrap();

        let mut jar = CookieJar::new();
        jar.note_mac1([4u8; 16]); // wrong mac1
        assert!(jar.consume_reply(&reply, &our_public).is_err());
    }

    #[test]
    fn test_rate_limiter_burst_then_drop() {
        let limiter = RateLimiter::new();
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

        for _ in 0..HANDSHAKE_BURST {
            assert!(limiter.allow(ip));
        }
        assert!(!limiter.allow(ip));

        // Other sources are unaffected
        assert!(limiter.allow(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2))));
    }
}
