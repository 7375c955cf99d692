use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use shared::protocol::ChallengeResponse;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::ChallengeError;

const CHALLENGE_KEY_INFO: &[u8] = b"public-chat/challenge-token/v1";
const NONCE_LEN: usize = 12;
/// Prefix byte identifying an X25519 key in the textual public key form.
const PUBLIC_KEY_PREFIX: &str = "05";

/// Local side of the token challenge: exposes the public key the server keys
/// challenges by and recovers the token from a challenge.
pub trait ChallengeDecryptor: Send + Sync {
    fn public_key_hex(&self) -> String;
    fn decrypt_challenge(&self, challenge: &ChallengeResponse) -> Result<String, ChallengeError>;
}

/// X25519 identity used to answer token challenges.
///
/// Challenges are opened with X25519 agreement, an HKDF-SHA256 derived key and
/// ChaCha20-Poly1305. Only challenges sealed by [`seal_challenge`] decrypt; a
/// server using another cipher needs its own [`ChallengeDecryptor`].
pub struct LocalIdentity {
    secret: StaticSecret,
    public: PublicKey,
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(mut bytes: [u8; 32]) -> Self {
        let identity = Self::from_secret(StaticSecret::from(bytes));
        bytes.zeroize();
        identity
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }
}

impl ChallengeDecryptor for LocalIdentity {
    fn public_key_hex(&self) -> String {
        format!("{PUBLIC_KEY_PREFIX}{}", hex::encode(self.public.as_bytes()))
    }

    fn decrypt_challenge(&self, challenge: &ChallengeResponse) -> Result<String, ChallengeError> {
        let server_key = STANDARD
            .decode(&challenge.server_pub_key_b64)
            .map_err(|source| ChallengeError::Base64 {
                field: "serverPubKey64",
                source,
            })?;
        let server_public = parse_public_key(&server_key)?;
        let blob = STANDARD
            .decode(&challenge.cipher_text_b64)
            .map_err(|source| ChallengeError::Base64 {
                field: "cipherText64",
                source,
            })?;
        if blob.len() <= NONCE_LEN {
            return Err(ChallengeError::CiphertextTooShort(blob.len()));
        }

        let cipher = challenge_cipher(&self.secret, &server_public)?;
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| ChallengeError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| ChallengeError::TokenEncoding)
    }
}

/// Server half of the challenge: seals `token` so that only the holder of
/// `client_public`'s secret can read it.
pub fn seal_challenge(
    server_secret: &StaticSecret,
    client_public: &PublicKey,
    token: &str,
) -> Result<ChallengeResponse, ChallengeError> {
    let cipher = challenge_cipher(server_secret, client_public)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), token.as_bytes())
        .map_err(|_| ChallengeError::Decrypt)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(ChallengeResponse {
        cipher_text_b64: STANDARD.encode(blob),
        server_pub_key_b64: STANDARD.encode(PublicKey::from(server_secret).as_bytes()),
    })
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, ChallengeError> {
    // keys are sometimes sent with the 0x05 type prefix still attached
    let raw = match bytes.len() {
        33 if bytes[0] == 0x05 => &bytes[1..],
        _ => bytes,
    };
    let key: [u8; 32] = raw
        .try_into()
        .map_err(|_| ChallengeError::ServerKeyLength(bytes.len()))?;
    Ok(PublicKey::from(key))
}

fn challenge_cipher(
    secret: &StaticSecret,
    peer: &PublicKey,
) -> Result<ChaCha20Poly1305, ChallengeError> {
    let shared = secret.diffie_hellman(peer);
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(CHALLENGE_KEY_INFO, &mut key)
        .map_err(|_| ChallengeError::Decrypt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();
    Ok(cipher)
}
