use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use ed25519_dalek::{SigningKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::did::Did;

/// Problems with keypair material itself, independent of where it is stored.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("seed must be 32 or 64 bytes, found {0}")]
    InvalidSeedLength(usize),
    #[error("stored public key does not match the seed")]
    PublicKeyMismatch,
}

/// The node's durable Ed25519 identity as it lives on disk.
///
/// Field names and encodings follow the `device-keypair.json` format: byte
/// fields are base64 strings and timestamps are RFC3339. `seed` is either a
/// bare 32-byte seed or the 64-byte seed‖public-key form.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keypair {
    #[serde(with = "base64_bytes")]
    pub seed: Vec<u8>,
    #[serde(with = "rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "rfc3339")]
    pub last_used: DateTime<Utc>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub public_key: Vec<u8>,
}

impl Keypair {
    /// Generates a fresh keypair from the OS CSPRNG, stamped with `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let now = now.trunc_subsecs(0);
        Self {
            seed: signing_key.to_bytes().to_vec(),
            created_at: now,
            last_used: now,
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
        }
    }

    /// The 32-byte Ed25519 secret, whichever seed form is stored.
    pub fn secret_bytes(&self) -> Result<[u8; SECRET_KEY_LENGTH], KeyError> {
        match self.seed.len() {
            32 | 64 => {
                let mut secret = [0u8; SECRET_KEY_LENGTH];
                secret.copy_from_slice(&self.seed[..SECRET_KEY_LENGTH]);
                Ok(secret)
            }
            other => Err(KeyError::InvalidSeedLength(other)),
        }
    }

    pub fn signing_key(&self) -> Result<SigningKey, KeyError> {
        Ok(SigningKey::from_bytes(&self.secret_bytes()?))
    }

    /// Checks the stored public key against the seed, filling it in when the
    /// file omitted it. A disagreement is an error, never a silent repair.
    pub fn verify(&mut self) -> Result<(), KeyError> {
        let derived = self.signing_key()?.verifying_key().to_bytes();
        if self.seed.len() == 64 && self.seed[SECRET_KEY_LENGTH..] != derived {
            return Err(KeyError::PublicKeyMismatch);
        }
        if self.public_key.is_empty() {
            self.public_key = derived.to_vec();
        } else if self.public_key != derived {
            return Err(KeyError::PublicKeyMismatch);
        }
        Ok(())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used = now.trunc_subsecs(0);
    }

    pub fn did(&self, is_gateway: bool) -> Did {
        Did::derive(&self.public_key, is_gateway)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("seed", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used)
            .field("public_key", &self.public_key)
            .finish()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}
