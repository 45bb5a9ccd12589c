//! Noise IKpsk2 state machine
//!
//! The rolling chaining-key / hash pair maintained during a handshake,
//! plus the derivations keyed off a party's static public key (mac1 key,
//! cookie key).

use zeroize::Zeroize;

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// Protocol identifier mixed into the initial hash
pub const IDENTIFIER: &[u8] = b"noisetun v1";

/// Label for mac1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Hash length (also chaining key length)
pub const HASH_LEN: usize = 32;

/// Rolling handshake state: chaining key for derivation, hash accumulator
/// for transcript binding
#[derive(Clone)]
pub struct HandshakeState {
    pub chaining_key: [u8; HASH_LEN],
    pub hash: [u8; HASH_LEN],
}

impl HandshakeState {
    /// Initial chaining key: HASH(CONSTRUCTION)
    pub fn initial_chain_key() -> [u8; HASH_LEN] {
        blake2s::hash(CONSTRUCTION)
    }

    /// Initial hash: HASH(HASH(HASH(CONSTRUCTION) || IDENTIFIER) || responder_static)
    pub fn initial_hash(responder_static: &[u8; 32]) -> [u8; HASH_LEN] {
        let ck = Self::initial_chain_key();
        let h1 = blake2s::hash_two(&ck, IDENTIFIER);
        blake2s::hash_two(&h1, responder_static)
    }

    /// New state for the initiator, seeded with the responder's static key
    pub fn new_initiator(responder_static: &[u8; 32]) -> Self {
        Self {
            chaining_key: Self::initial_chain_key(),
            hash: Self::initial_hash(responder_static),
        }
    }

    /// New state for the responder. Both parties seed the hash with the
    /// responder's static public key.
    pub fn new_responder(our_static_public: &[u8; 32]) -> Self {
        Self {
            chaining_key: Self::initial_chain_key(),
            hash: Self::initial_hash(our_static_public),
        }
    }

    /// MixHash: h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// MixChain: ck = KDF1(ck, data), no key output
    pub fn mix_chain(&mut self, data: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, data);
    }

    /// MixKey: (ck, k) = KDF2(ck, input), returns k
    pub fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let (new_ck, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = new_ck;
        key
    }

    /// MixKeyAndHash: (ck, t, k) = KDF3(ck, input); t is mixed into the
    /// hash. Used for the preshared-key slot.
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (new_ck, temp_h, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = new_ck;
        self.mix_hash(&temp_h);
        key
    }

    /// EncryptAndHash: seal under (k, nonce 0, aad h), then mix the
    /// ciphertext into the hash
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::encrypt(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// DecryptAndHash: open under (k, nonce 0, aad h), then mix the
    /// ciphertext into the hash
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::decrypt(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }
}

impl Drop for HandshakeState {
    fn drop(&mut self) {
        self.chaining_key.zeroize();
        self.hash.zeroize();
    }
}

/// Transport keys derived from a completed handshake
pub struct TransportKeys {
    pub sending_key: [u8; 32],
    pub receiving_key: [u8; 32],
}

impl TransportKeys {
    /// (send, recv) = KDF2(ck, "") for the initiator
    pub fn derive_initiator(chaining_key: &[u8; 32]) -> Self {
        let (t_send, t_recv) = blake2s::kdf2(chaining_key, &[]);
        Self {
            sending_key: t_send,
            receiving_key: t_recv,
        }
    }

    /// Responder keys are the initiator's, swapped
    pub fn derive_responder(chaining_key: &[u8; 32]) -> Self {
        let (t_recv, t_send) = blake2s::kdf2(chaining_key, &[]);
        Self {
            sending_key: t_send,
            receiving_key: t_recv,
        }
    }
}

impl Drop for TransportKeys {
    fn drop(&mut self) {
        self.sending_key.zeroize();
        self.receiving_key.zeroize();
    }
}

/// mac1_key = HASH(LABEL_MAC1 || peer_static)
pub fn mac1_key(peer_public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_MAC1, peer_public)
}

/// mac1 over a message prefix
pub fn compute_mac1(peer_public: &[u8; 32], message: &[u8]) -> [u8; 16] {
    let key = mac1_key(peer_public);
    blake2s::mac(&key, message)
}

/// cookie_key = HASH(LABEL_COOKIE || peer_static)
pub fn cookie_key(peer_public: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_COOKIE, peer_public)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_deterministic() {
        let peer_public = [0u8; 32];

        assert_eq!(
            HandshakeState::initial_chain_key(),
            HandshakeState::initial_chain_key()
        );
        assert_eq!(
            HandshakeState::initial_hash(&peer_public),
            HandshakeState::initial_hash(&peer_public)
        );
        assert_ne!(
            HandshakeState::initial_hash(&peer_public),
            HandshakeState::initial_hash(&[1u8; 32])
        );
    }

    #[test]
    fn test_both_roles_agree_on_initial_state() {
        let responder_public = [42u8; 32];

        let initiator = HandshakeState::new_initiator(&responder_public);
        let responder = HandshakeState::new_responder(&responder_public);

        assert_eq!(initiator.chaining_key, responder.chaining_key);
        assert_eq!(initiator.hash, responder.hash);
    }

    #[test]
    fn test_mix_operations_change_state() {
        let mut state = HandshakeState::new_initiator(&[0u8; 32]);

        let original_hash = state.hash;
        state.mix_hash(b"data");
        assert_ne!(state.hash, original_hash);

        let original_ck = state.chaining_key;
        let key = state.mix_key(b"input key material");
        assert_ne!(state.chaining_key, original_ck);
        assert_ne!(key, [0u8; 32]);
    }

    #[test]
    fn test_encrypt_decrypt_and_hash() {
        let mut state1 = HandshakeState::new_initiator(&[0u8; 32]);
        let mut state2 = state1.clone();

        let key = [42u8; 32];
        let ciphertext = state1.encrypt_and_hash(&key, b"secret").unwrap();
        let decrypted = state2.decrypt_and_hash(&key, &ciphertext).unwrap();

        assert_eq!(decrypted, b"secret");
        assert_eq!(state1.hash, state2.hash);
    }

    #[test]
    fn test_transport_keys_mirror() {
        let ck = [5u8; 32];

        let initiator = TransportKeys::derive_initiator(&ck);
        let responder = TransportKeys::derive_responder(&ck);

        assert_eq!(initiator.sending_key, responder.receiving_key);
        assert_eq!(initiator.receiving_key, responder.sending_key);
    }

    #[test]
    fn test_mac1_computation() {
        let peer_public = [0u8; 32];

        let mac = compute_mac1(&peer_public, b"message");
        assert_eq!(mac, compute_mac1(&peer_public, b"message"));
        assert_ne!(mac, compute_mac1(&peer_public, b"other message"));
    }
}
