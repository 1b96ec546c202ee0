use crate::crypto;
use crate::encoding::base64;
use serde::{de, Deserialize, Deserializer};
use serde_derive::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// A long-term Curve25519 secret key. The backing bytes are wiped when the
/// value is dropped.
#[derive(Clone)]
pub struct SecretKey([u8; crypto::KEY_SIZE]);

impl SecretKey {
    pub const SIZE: usize = crypto::KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> SecretKey {
        SecretKey(key)
    }

    /// Generates a fresh random secret key.
    #[inline]
    pub fn generate() -> SecretKey {
        let mut key = [0u8; Self::SIZE];
        crypto::random_bytes(&mut key);
        SecretKey(key)
    }

    /// Derives the matching public key.
    #[inline]
    pub fn public_key(&self) -> [u8; Self::SIZE] {
        crypto::scalarmult_base(&self.0)
    }
}

impl Deref for SecretKey {
    type Target = [u8; SecretKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; SecretKey::SIZE] {
        &self.0
    }
}

impl DerefMut for SecretKey {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8; SecretKey::SIZE] {
        &mut self.0
    }
}

impl Drop for SecretKey {
    #[inline]
    fn drop(&mut self) {
        crypto::memzero(&mut self.0);
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Never leak key material through Debug output
        write!(f, "SecretKey(..)")
    }
}

/// The process-wide long-term keypair shared by all connections.
#[derive(Clone)]
pub struct ClientKeys {
    pub public: [u8; SecretKey::SIZE],
    pub secret: SecretKey,
}

impl ClientKeys {
    #[inline]
    pub fn from_secret(secret: SecretKey) -> ClientKeys {
        ClientKeys {
            public: secret.public_key(),
            secret,
        }
    }

    #[inline]
    pub fn generate() -> ClientKeys {
        Self::from_secret(SecretKey::generate())
    }
}

/// Creates a fresh long-term private key.
#[inline]
pub fn create_private_key() -> SecretKey {
    SecretKey::generate()
}

/// Derives the public key matching a private key.
#[inline]
pub fn derive_public_key(secret: &SecretKey) -> [u8; SecretKey::SIZE] {
    secret.public_key()
}

/// Client identity as persisted in configuration files. The secret key is
/// carried as base64 text.
#[derive(Serialize, Deserialize, Clone)]
pub struct ClientIdentity {
    #[serde(
        serialize_with = "base64::serialize",
        deserialize_with = "deserialize_b64_key"
    )]
    secret: [u8; SecretKey::SIZE],
}

#[inline]
fn deserialize_b64_key<'de, D>(deserializer: D) -> Result<[u8; SecretKey::SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let decoded_raw = base64::decode(&s).map_err(de::Error::custom)?;

    if decoded_raw.len() != SecretKey::SIZE {
        return Err(de::Error::custom("secret key must be 32 bytes"));
    }

    let mut decoded = [0u8; SecretKey::SIZE];
    decoded.copy_from_slice(&decoded_raw);

    Ok(decoded)
}

impl ClientIdentity {
    #[inline]
    pub fn new(secret: &SecretKey) -> ClientIdentity {
        ClientIdentity { secret: **secret }
    }

    /// Expands the stored secret into the full keypair.
    #[inline]
    pub fn keys(&self) -> ClientKeys {
        ClientKeys::from_secret(SecretKey::new(self.secret))
    }
}
