use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use crate::api::TargetSpec;
use crate::error::{Result, SdkError};

const TARGETS_KEY_DOMAIN: &[u8] = b"mixer_targets_v1:";

#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
}

pub fn encrypt_payload(plaintext: &[u8], key: &[u8; 32]) -> Result<EncryptedPayload> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| SdkError::Crypto(format!("Invalid key: {}", e)))?;

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SdkError::Crypto("Encryption failed".into()))?;

    Ok(EncryptedPayload {
        ciphertext,
        nonce: nonce_bytes,
    })
}

pub fn decrypt_payload(encrypted: &EncryptedPayload, key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| SdkError::Crypto(format!("Invalid key: {}", e)))?;
    let nonce = Nonce::from_slice(&encrypted.nonce);

    cipher
        .decrypt(nonce, encrypted.ciphertext.as_ref())
        .map_err(|_| SdkError::Crypto("Decryption failed".into()))
}

/// Target list sealed to the service's X25519 key (ECDH + AES-256-GCM).
/// All fields are hex.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedTargets {
    pub client_pubkey: String,
    pub nonce: String,
    pub ciphertext: String,
}

fn targets_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TARGETS_KEY_DOMAIN);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

pub fn seal_targets(targets: &[TargetSpec], service_pubkey: &[u8; 32]) -> Result<EncryptedTargets> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let client_pubkey = X25519PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(*service_pubkey));

    let plaintext =
        serde_json::to_vec(targets).map_err(|e| SdkError::Serialization(e.to_string()))?;
    let encrypted = encrypt_payload(&plaintext, &targets_key(shared.as_bytes()))?;

    Ok(EncryptedTargets {
        client_pubkey: hex::encode(client_pubkey.as_bytes()),
        nonce: hex::encode(encrypted.nonce),
        ciphertext: hex::encode(encrypted.ciphertext),
    })
}

pub fn open_targets(sealed: &EncryptedTargets, secret: &StaticSecret) -> Result<Vec<TargetSpec>> {
    let client_pubkey: [u8; 32] = hex::decode(&sealed.client_pubkey)
        .map_err(|_| SdkError::Crypto("Invalid client pubkey hex".into()))?
        .try_into()
        .map_err(|_| SdkError::Crypto("Client pubkey must be 32 bytes".into()))?;
    let nonce: [u8; 12] = hex::decode(&sealed.nonce)
        .map_err(|_| SdkError::Crypto("Invalid nonce hex".into()))?
        .try_into()
        .map_err(|_| SdkError::Crypto("Nonce must be 12 bytes".into()))?;
    let ciphertext = hex::decode(&sealed.ciphertext)
        .map_err(|_| SdkError::Crypto("Invalid ciphertext hex".into()))?;

    let shared = secret.diffie_hellman(&X25519PublicKey::from(client_pubkey));
    let plaintext = decrypt_payload(
        &EncryptedPayload { ciphertext, nonce },
        &targets_key(shared.as_bytes()),
    )?;

    serde_json::from_slice(&plaintext).map_err(|e| SdkError::Serialization(e.to_string()))
}

/// Random 16-byte hex nonce, blinding a target's Merkle leaf.
pub fn random_nonce_hex() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
