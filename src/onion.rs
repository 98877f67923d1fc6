// Copyright 2020, The Tari Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! ed25519 key generation and the v3 onion-service-identifier derivation.

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use sha3::Sha3_256;

/// An ed25519 keypair in Tor's "ED25519-V3" onion-service representation.
pub struct OnionKey {
    signing_key: SigningKey,
}

impl OnionKey {
    /// Generate a fresh random key.
    pub fn random() -> Self {
        let mut rng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Build a key from a 32-byte ed25519 seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Encode the expanded secret scalar in Tor's "ED25519-V3" format: the
    /// clamped SHA-512 of the 32-byte seed, base64-encoded with padding.
    pub fn to_tor_format(&self) -> String {
        expanded_secret_base64(self.signing_key.to_bytes())
    }

    /// The 56-character lowercase base32 v3 onion identifier for this key's
    /// public component.
    pub fn onion_id(&self) -> String {
        onion_id_from_public_key(&self.public_key_bytes())
    }
}

/// Encode a 32-byte ed25519 seed into Tor's expanded-secret-key format.
fn expanded_secret_base64(seed: [u8; 32]) -> String {
    let mut h = Sha512::new();
    h.update(seed);
    let mut expanded: [u8; 64] = h.finalize().into();
    expanded[0] &= 0xF8;
    expanded[31] &= 0x7F;
    expanded[31] |= 0x40;
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, expanded)
}

/// Derive the 56-character lowercase base32 v3 onion identifier from an
/// ed25519 public key: `base32(pubkey || sha3_256(".onion checksum" || pubkey || 0x03)[:2] || 0x03)`.
pub fn onion_id_from_public_key(public_key: &[u8; 32]) -> String {
    let mut h = Sha3_256::new();
    h.update(b".onion checksum");
    h.update(public_key);
    h.update([0x03]);
    let digest = h.finalize();

    let mut combined = Vec::with_capacity(32 + 2 + 1);
    combined.extend_from_slice(public_key);
    combined.extend_from_slice(&digest[..2]);
    combined.push(0x03);

    BASE32_NOPAD.encode(&combined).to_lowercase()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn all_zero_seed_produces_known_onion_id() {
        let key = OnionKey::from_seed([0u8; 32]);
        let public_key = key.public_key_bytes();
        assert_eq!(
            hex::encode(public_key),
            "3b6a27bcceb6a42d62a3a8d02a6f0d73653215771de243a63ac048a18b59da29"
        );
        assert_eq!(key.onion_id(), "hnvcppgow2sc2yvdvdicu3ynonsteflxdxrehjr2ybekdc2z3iu63yid");
    }

    // The id must decode back to the exact public key plus a checksum that
    // matches the v3 addressing scheme's own derivation (SHA3-256(".onion
    // checksum" || pubkey || version)[:2], version byte 0x03).
    #[test]
    fn onion_id_round_trips_through_base32_with_matching_checksum() {
        let mut public_key = [0u8; 32];
        hex::decode_to_slice(
            "79bcc625184b05194975c28b66b66b0469f7cba22907d599afc2a93344ef7a54",
            &mut public_key,
        )
        .unwrap();
        let id = onion_id_from_public_key(&public_key);

        let decoded = data_encoding::BASE32_NOPAD.decode(id.to_uppercase().as_bytes()).unwrap();
        assert_eq!(decoded.len(), 35);
        assert_eq!(&decoded[..32], &public_key[..]);
        assert_eq!(decoded[34], 0x03);

        let mut hasher = Sha3_256::new();
        hasher.update(b".onion checksum");
        hasher.update(public_key);
        hasher.update([0x03]);
        assert_eq!(&decoded[32..34], &hasher.finalize()[..2]);
    }

    #[test]
    fn onion_id_is_56_chars_lowercase() {
        let key = OnionKey::random();
        let id = key.onion_id();
        assert_eq!(id.len(), 56);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn tor_format_is_64_bytes_base64() {
        let key = OnionKey::from_seed([0u8; 32]);
        let encoded = key.to_tor_format();
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded).unwrap();
        assert_eq!(decoded.len(), 64);
        assert_eq!(decoded[0] & 0x07, 0);
        assert_eq!(decoded[31] & 0x80, 0);
        assert_eq!(decoded[31] & 0x40, 0x40);
    }
}
