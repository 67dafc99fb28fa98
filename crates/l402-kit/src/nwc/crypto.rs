//! Session key derivation and envelope encryption.
//!
//! The session key is the SHA-256 of the ECDH shared x-coordinate between the
//! session secret key and the counterparty's x-only public key. Envelope
//! payloads are sealed with AES-256-GCM; the wire form is
//! `base64(nonce || ciphertext)`. Opening authenticates — a forged or
//! tampered envelope fails rather than decrypting to garbage.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine, prelude::BASE64_STANDARD};
use secp256k1::{
    All, Keypair, Message, Parity, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey, schnorr,
};
use sha2::{Digest, Sha256};

use super::NwcError;

const NONCE_LEN: usize = 12;

/// Keys for one wallet session: our signing keypair, the counterparty key,
/// and the derived envelope cipher.
pub struct SessionKeys {
    secp: Secp256k1<All>,
    keypair: Keypair,
    own_pubkey_hex: String,
    peer_pubkey: XOnlyPublicKey,
    peer_pubkey_hex: String,
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("own_pubkey", &self.own_pubkey_hex)
            .field("peer_pubkey", &self.peer_pubkey_hex)
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    pub fn derive(secret_hex: &str, peer_pubkey_hex: &str) -> Result<Self, NwcError> {
        let secp = Secp256k1::new();
        let secret_key = parse_secret(secret_hex)?;
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let (own_pubkey, _) = keypair.x_only_public_key();

        let peer_pubkey = parse_xonly(peer_pubkey_hex)?;
        // x-only keys name a point up to parity; even parity is the Nostr
        // convention for the ECDH lift.
        let peer_point = PublicKey::from_x_only_public_key(peer_pubkey, Parity::Even);
        let shared_point = secp256k1::ecdh::shared_secret_point(&peer_point, &secret_key);
        let session_key = Sha256::digest(&shared_point[..32]);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&session_key));

        Ok(SessionKeys {
            secp,
            keypair,
            own_pubkey_hex: hex::encode(own_pubkey.serialize()),
            peer_pubkey,
            peer_pubkey_hex: peer_pubkey_hex.to_string(),
            cipher,
        })
    }

    /// Our x-only public key, hex.
    pub fn own_pubkey_hex(&self) -> &str {
        &self.own_pubkey_hex
    }

    /// The counterparty's x-only public key, hex.
    pub fn peer_pubkey_hex(&self) -> &str {
        &self.peer_pubkey_hex
    }

    /// Encrypts a payload for the counterparty.
    pub fn seal(&self, plaintext: &str) -> Result<String, NwcError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| NwcError::Envelope("encryption failed".to_string()))?;
        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(raw))
    }

    /// Decrypts and authenticates an inbound payload.
    pub fn open(&self, content: &str) -> Result<String, NwcError> {
        let raw = BASE64_STANDARD
            .decode(content)
            .map_err(|err| NwcError::Envelope(format!("bad base64: {err}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(NwcError::Envelope("envelope too short".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| NwcError::Envelope("authentication failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|err| NwcError::Envelope(format!("invalid utf-8: {err}")))
    }

    /// BIP-340 signature over a 32-byte event id.
    pub fn sign_id(&self, id: &[u8; 32]) -> schnorr::Signature {
        self.secp.sign_schnorr(&Message::from_digest(*id), &self.keypair)
    }

    /// Verifies a counterparty signature over an event id.
    pub fn verify_peer_signature(&self, id: &[u8; 32], signature_hex: &str) -> bool {
        let Ok(bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(signature) = schnorr::Signature::from_slice(&bytes) else {
            return false;
        };
        self.secp
            .verify_schnorr(&signature, &Message::from_digest(*id), &self.peer_pubkey)
            .is_ok()
    }
}

/// Derives the x-only public key (hex) from a secret key (hex).
pub fn derive_pubkey_hex(secret_hex: &str) -> Result<String, NwcError> {
    let secp = Secp256k1::new();
    let secret_key = parse_secret(secret_hex)?;
    let keypair = Keypair::from_secret_key(&secp, &secret_key);
    let (pubkey, _) = keypair.x_only_public_key();
    Ok(hex::encode(pubkey.serialize()))
}

fn parse_secret(secret_hex: &str) -> Result<SecretKey, NwcError> {
    let bytes = hex::decode(secret_hex)
        .map_err(|err| NwcError::InvalidUrl(format!("secret is not hex: {err}")))?;
    SecretKey::from_slice(&bytes)
        .map_err(|err| NwcError::InvalidUrl(format!("invalid secret key: {err}")))
}

fn parse_xonly(pubkey_hex: &str) -> Result<XOnlyPublicKey, NwcError> {
    let bytes = hex::decode(pubkey_hex)
        .map_err(|err| NwcError::InvalidUrl(format!("pubkey is not hex: {err}")))?;
    XOnlyPublicKey::from_slice(&bytes)
        .map_err(|err| NwcError::InvalidUrl(format!("invalid pubkey: {err}")))
}
