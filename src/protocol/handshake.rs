//! Handshake state machines
//!
//! Implements the Noise IKpsk2 exchange: the initiator-side
//! [`InitiatorHandshake`] and the responder-side pair
//! [`consume_initiation`] / [`create_response`].

use tai64::Tai64N;
use zeroize::Zeroize;

use crate::crypto::{noise, x25519};
use crate::error::{CryptoError, NoisetunError, ProtocolError};
use crate::protocol::cookie::CookieJar;
use crate::protocol::messages::{HandshakeInitiation, HandshakeResponse};

/// The symmetric outcome of a completed handshake
#[derive(Clone)]
pub struct HandshakeResult {
    /// Our session index
    pub local_index: u32,
    /// The peer's session index
    pub remote_index: u32,
    /// Key for sending
    pub sending_key: [u8; 32],
    /// Key for receiving
    pub receiving_key: [u8; 32],
    /// Which role we played
    pub is_initiator: bool,
}

impl Drop for HandshakeResult {
    fn drop(&mut self) {
        self.sending_key.zeroize();
        self.receiving_key.zeroize();
    }
}

/// State for an in-progress handshake, initiator side
pub struct InitiatorHandshake {
    static_private: [u8; 32],
    static_public: [u8; 32],
    peer_static: [u8; 32],
    /// DH(our static, peer static), precomputed once per peer
    precomputed_ss: [u8; 32],
    psk: [u8; 32],
    /// Our session index for the session under negotiation
    pub local_index: u32,
    ephemeral_private: [u8; 32],
    noise_state: noise::HandshakeState,
}

impl InitiatorHandshake {
    pub fn new(
        static_private: [u8; 32],
        static_public: [u8; 32],
        peer_static: [u8; 32],
        psk: Option<[u8; 32]>,
        local_index: u32,
    ) -> Self {
        let precomputed_ss = x25519::dh(&static_private, &peer_static);
        Self {
            static_private,
            static_public,
            peer_static,
            precomputed_ss,
            psk: psk.unwrap_or([0u8; 32]),
            local_index,
            ephemeral_private: [0u8; 32],
            noise_state: noise::HandshakeState::new_initiator(&peer_static),
        }
    }

    /// Build an initiation message, signing its MACs through the cookie
    /// jar. Each call generates a fresh ephemeral and restarts the
    /// transcript, so retransmission resends an equally valid message.
    pub fn create_initiation(
        &mut self,
        jar: &mut CookieJar,
    ) -> Result<HandshakeInitiation, NoisetunError> {
        self.noise_state = noise::HandshakeState::new_initiator(&self.peer_static);

        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
        self.ephemeral_private = ephemeral_private;

        // e
        self.noise_state.mix_hash(&ephemeral_public);
        self.noise_state.mix_chain(&ephemeral_public);

        // es
        let shared_es = x25519::dh(&ephemeral_private, &self.peer_static);
        let key = self.noise_state.mix_key(&shared_es);

        // s
        let encrypted_static = self
            .noise_state
            .encrypt_and_hash(&key, &self.static_public)?;
        let encrypted_static: [u8; 48] = encrypted_static
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        // ss
        let key = self.noise_state.mix_key(&self.precomputed_ss);

        // timestamp
        let timestamp = Tai64N::now();
        let encrypted_timestamp = self
            .noise_state
            .encrypt_and_hash(&key, &timestamp.to_bytes())?;
        let encrypted_timestamp: [u8; 28] = encrypted_timestamp
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        let mut msg = HandshakeInitiation::new(
            self.local_index,
            ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
        );

        msg.mac1 = noise::compute_mac1(&self.peer_static, &msg.bytes_for_mac1());
        jar.note_mac1(msg.mac1);
        msg.mac2 = jar.mac2(&msg.bytes_for_mac2());

        Ok(msg)
    }

    /// Process the response and derive the transport keys
    pub fn process_response(
        &mut self,
        response: &HandshakeResponse,
    ) -> Result<HandshakeResult, NoisetunError> {
        if response.receiver_index != self.local_index {
            return Err(ProtocolError::UnknownIndex {
                index: response.receiver_index,
            }
            .into());
        }

        // Work on a copy so a forged response cannot corrupt the
        // transcript awaited by the genuine one.
        let mut state = self.noise_state.clone();

        // e
        state.mix_hash(&response.ephemeral_public);
        state.mix_chain(&response.ephemeral_public);

        // ee
        let shared_ee = x25519::dh(&self.ephemeral_private, &response.ephemeral_public);
        state.mix_key(&shared_ee);

        // se
        let shared_se = x25519::dh(&self.static_private, &response.ephemeral_public);
        state.mix_key(&shared_se);

        // psk
        let key = state.mix_key_and_hash(&self.psk);

        // empty payload carries the authentication tag
        state.decrypt_and_hash(&key, &response.encrypted_nothing)?;

        let keys = noise::TransportKeys::derive_initiator(&state.chaining_key);
        let result = HandshakeResult {
            local_index: self.local_index,
            remote_index: response.sender_index,
            sending_key: keys.sending_key,
            receiving_key: keys.receiving_key,
            is_initiator: true,
        };

        self.ephemeral_private.zeroize();
        Ok(result)
    }
}

impl Drop for InitiatorHandshake {
    fn drop(&mut self) {
        self.static_private.zeroize();
        self.ephemeral_private.zeroize();
        self.precomputed_ss.zeroize();
        self.psk.zeroize();
    }
}

/// A validated, decrypted initiation awaiting a response
pub struct IncomingInitiation {
    /// The initiator's static public key, decrypted from the message
    pub peer_static: [u8; 32],
    /// The initiator's TAI64N timestamp, for cross-handshake replay
    /// defence
    pub timestamp: [u8; 12],
    /// The initiator's session index
    pub initiator_index: u32,
    ephemeral_public: [u8; 32],
    noise_state: noise::HandshakeState,
}

/// Responder side, step one: decrypt and validate an initiation.
///
/// mac1 (and mac2 under load) must already have been checked; this does
/// the DH work. Timestamp monotonicity is the caller's job, since only
/// the caller knows the peer.
pub fn consume_initiation(
    msg: &HandshakeInitiation,
    our_static_private: &[u8; 32],
    our_static_public: &[u8; 32],
) -> Result<IncomingInitiation, NoisetunError> {
    let mut state = noise::HandshakeState::new_responder(our_static_public);

    // e
    state.mix_hash(&msg.ephemeral_public);
    state.mix_chain(&msg.ephemeral_public);

    // es
    let shared_es = x25519::dh(our_static_private, &msg.ephemeral_public);
    let key = state.mix_key(&shared_es);

    // s
    let decrypted_static = state.decrypt_and_hash(&key, &msg.encrypted_static)?;
    let peer_static: [u8; 32] = decrypted_static
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;

    // ss
    let shared_ss = x25519::dh(our_static_private, &peer_static);
    let key = state.mix_key(&shared_ss);

    // timestamp
    let decrypted_timestamp = state.decrypt_and_hash(&key, &msg.encrypted_timestamp)?;
    let timestamp: [u8; 12] = decrypted_timestamp
        .try_into()
        .map_err(|_| CryptoError::Decryption)?;

    Ok(IncomingInitiation {
        peer_static,
        timestamp,
        initiator_index: msg.sender_index,
        ephemeral_public: msg.ephemeral_public,
        noise_state: state,
    })
}

/// Responder side, step two: build the response and derive the transport
/// keys. `local_index` is our freshly assigned session index; MACs are
/// signed through the peer's cookie jar.
pub fn create_response(
    incoming: IncomingInitiation,
    local_index: u32,
    psk: Option<[u8; 32]>,
    jar: &mut CookieJar,
) -> Result<(HandshakeResponse, HandshakeResult), NoisetunError> {
    let mut state = incoming.noise_state;
    let psk = psk.unwrap_or([0u8; 32]);

    let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();

    // e
    state.mix_hash(&ephemeral_public);
    state.mix_chain(&ephemeral_public);

    // ee
    let shared_ee = x25519::dh(&ephemeral_private, &incoming.ephemeral_public);
    state.mix_key(&shared_ee);

    // se
    let shared_se = x25519::dh(&ephemeral_private, &incoming.peer_static);
    state.mix_key(&shared_se);

    // psk
    let key = state.mix_key_and_hash(&psk);

    let encrypted_nothing = state.encrypt_and_hash(&key, &[])?;
    let encrypted_nothing: [u8; 16] = encrypted_nothing
        .try_into()
        .map_err(|_| CryptoError::Encryption)?;

    let mut msg = HandshakeResponse::new(
        local_index,
        incoming.initiator_index,
        ephemeral_public,
        encrypted_nothing,
    );

    msg.mac1 = noise::compute_mac1(&incoming.peer_static, &msg.bytes_for_mac1());
    jar.note_mac1(msg.mac1);
    msg.mac2 = jar.mac2(&msg.bytes_for_mac2());

    let keys = noise::TransportKeys::derive_responder(&state.chaining_key);
    let result = HandshakeResult {
        local_index,
        remote_index: incoming.initiator_index,
        sending_key: keys.sending_key,
        receiving_key: keys.receiving_key,
        is_initiator: false,
    };

    Ok((msg, result))
}

/// Lexicographic comparison of TAI64N timestamps; they sort
/// chronologically byte-for-byte
pub fn timestamp_after(candidate: &[u8; 12], reference: &[u8; 12]) -> bool {
    candidate > reference
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::CookieReply;

    struct Party {
        private: [u8; 32],
        public: [u8; 32],
    }

    fn party() -> Party {
        let (private, public) = x25519::generate_keypair();
        Party { private, public }
    }

    fn run_handshake(psk: Option<[u8; 32]>) -> (HandshakeResult, HandshakeResult) {
        let initiator = party();
        let responder = party();

        let mut jar_i = CookieJar::new();
        let mut jar_r = CookieJar::new();

        let mut hs = InitiatorHandshake::new(
            initiator.private,
            initiator.public,
            responder.public,
            psk,
            101,
        );
        let init = hs.create_initiation(&mut jar_i).unwrap();

        let incoming =
            consume_initiation(&init, &responder.private, &responder.public).unwrap();
        assert_eq!(incoming.peer_static, initiator.public);
        assert_eq!(incoming.initiator_index, 101);

        let (response, responder_result) =
            create_response(incoming, 202, psk, &mut jar_r).unwrap();
        assert_eq!(response.receiver_index, 101);

        let initiator_result = hs.process_response(&response).unwrap();

        (initiator_result, responder_result)
    }

    #[test]
    fn test_full_handshake_key_agreement() {
        let (i, r) = run_handshake(None);

        assert_eq!(i.sending_key, r.receiving_key);
        assert_eq!(i.receiving_key, r.sending_key);
        assert_ne!(i.sending_key, i.receiving_key);
        assert_eq!(i.remote_index, 202);
        assert_eq!(r.remote_index, 101);
        assert!(i.is_initiator);
        assert!(!r.is_initiator);
    }

    #[test]
    fn test_full_handshake_with_psk() {
        let (i, r) = run_handshake(Some([13u8; 32]));
        assert_eq!(i.sending_key, r.receiving_key);
        assert_eq!(i.receiving_key, r.sending_key);
    }

    #[test]
    fn test_psk_mismatch_fails() {
        let initiator = party();
        let responder = party();

        let mut jar_i = CookieJar::new();
        let mut jar_r = CookieJar::new();

        let mut hs = InitiatorHandshake::new(
            initiator.private,
            initiator.public,
            responder.public,
            Some([1u8; 32]),
            1,
        );
        let init = hs.create_initiation(&mut jar_i).unwrap();

        let incoming =
            consume_initiation(&init, &responder.private, &responder.public).unwrap();
        let (response, _) =
            create_response(incoming, 2, Some([2u8; 32]), &mut jar_r).unwrap();

        assert!(hs.process_response(&response).is_err());
    }

    #[test]
    fn test_initiation_mac1_verifies() {
        let initiator = party();
        let responder = party();

        let mut jar = CookieJar::new();
        let mut hs = InitiatorHandshake::new(
            initiator.private,
            initiator.public,
            responder.public,
            None,
            1,
        );
        let init = hs.create_initiation(&mut jar).unwrap();

        let expected = noise::compute_mac1(&responder.public, &init.bytes_for_mac1());
        assert_eq!(init.mac1, expected);
        // No cookie cached, so mac2 is zeros
        assert_eq!(init.mac2, [0u8; 16]);
    }

    #[test]
    fn test_wrong_responder_key_fails() {
        let initiator = party();
        let responder = party();
        let impostor = party();

        let mut jar = CookieJar::new();
        let mut hs = InitiatorHandshake::new(
            initiator.private,
            initiator.public,
            responder.public,
            None,
            1,
        );
        let init = hs.create_initiation(&mut jar).unwrap();

        // The impostor cannot decrypt the static key
        assert!(consume_initiation(&init, &impostor.private, &impostor.public).is_err());
    }

    #[test]
    fn test_response_index_mismatch_rejected() {
        let initiator = party();
        let responder = party();

        let mut jar_i = CookieJar::new();
        let mut jar_r = CookieJar::new();

        let mut hs = InitiatorHandshake::new(
            initiator.private,
            initiator.public,
            responder.public,
            None,
            42,
        );
        let init = hs.create_initiation(&mut jar_i).unwrap();
        let incoming =
            consume_initiation(&init, &responder.private, &responder.public).unwrap();
        let (mut response, _) = create_response(incoming, 7, None, &mut jar_r).unwrap();

        response.receiver_index = 43;
        assert!(hs.process_response(&response).is_err());
    }

    #[test]
    fn test_retransmitted_initiation_still_completes() {
        let initiator = party();
        let responder = party();

        let mut jar_i = CookieJar::new();
        let mut jar_r = CookieJar::new();

        let mut hs = InitiatorHandshake::new(
            initiator.private,
            initiator.public,
            responder.public,
            None,
            9,
        );
        let _first = hs.create_initiation(&mut jar_i).unwrap();
        // Retransmit: a fresh message from the same state machine
        let second = hs.create_initiation(&mut jar_i).unwrap();

        let incoming =
            consume_initiation(&second, &responder.private, &responder.public).unwrap();
        let (response, responder_result) =
            create_response(incoming, 10, None, &mut jar_r).unwrap();
        let initiator_result = hs.process_response(&response).unwrap();

        assert_eq!(initiator_result.sending_key, responder_result.receiving_key);
    }

    #[test]
    fn test_timestamp_ordering() {
        let older = Tai64N::now().to_bytes();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let newer = Tai64N::now().to_bytes();

        assert!(timestamp_after(&newer, &older));
        assert!(!timestamp_after(&older, &newer));
        assert!(!timestamp_after(&older, &older));
    }

    #[test]
    fn test_cookie_reply_feeds_mac2() {
        let initiator = party();
        let responder = party();

        let mut jar = CookieJar::new();
        let mut hs = InitiatorHandshake::new(
            initiator.private,
            initiator.public,
            responder.public,
            None,
            5,
        );
        let init = hs.create_initiation(&mut jar).unwrap();

        // Responder refuses under load and answers with a cookie bound to
        // the initiation's mac1
        let checker = crate::protocol::cookie::CookieChecker::new(&responder.public);
        let src = "127.0.0.1:51820".parse().unwrap();
        let reply: CookieReply = checker.create_reply(5, &init.mac1, src).unwrap();

        jar.consume_reply(&reply, &responder.public).unwrap();

        // The retry now carries a non-zero mac2 the checker accepts
        let retry = hs.create_initiation(&mut jar).unwrap();
        assert_ne!(retry.mac2, [0u8; 16]);
        assert!(checker.verify_mac2(&retry.to_bytes(), src));
    }
}
