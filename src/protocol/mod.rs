//! Tunnel protocol implementation
//!
//! Core protocol components:
//! - Message wire formats
//! - Handshake state machines (Noise IKpsk2)
//! - Cookie / denial-of-service mitigation
//! - Replay protection
//! - Session (keypair) lifecycle

use std::time::Duration;

pub mod cookie;
pub mod handshake;
pub mod messages;
pub mod replay;
pub mod session;

pub use cookie::{CookieChecker, CookieJar, RateLimiter};
pub use handshake::{
    consume_initiation, create_response, timestamp_after, HandshakeResult, IncomingInitiation,
    InitiatorHandshake,
};
pub use messages::{
    CookieReply, HandshakeInitiation, HandshakeResponse, MessageType, TransportHeader,
};
pub use replay::ReplayWindow;
pub use session::{Keypair, KeypairBank};

/// Schedule a new handshake after this many messages on a session
pub const REKEY_AFTER_MESSAGES: u64 = (1 << 60) - (1 << 16) - 1;

/// Receivers reject counters at or above this value
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 16);

/// Senders stop using a session at this counter value
pub const SEND_REJECT_AFTER_MESSAGES: u64 = 1 << 60;

/// An initiator schedules a new handshake once a session is this old
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// A session is invalid for both directions past this age
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Retransmit an unanswered initiation after this long
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Give up retransmitting an initiation after this long
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// Send a keepalive if data was received but nothing sent for this long
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cookie secret rotation period; also how long a received cookie stays valid
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);

/// Width of the per-session replay window in packets
pub const REPLAY_WINDOW: usize = 2048;
