//! Supported signing algorithms.
//!
//! The algorithm is a closed set resolved once (from configuration or from a
//! stored key record) and carried alongside the key material, so no code path
//! has to guess at key types per request.

use std::fmt;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use rcgen::{KeyPair, PublicKeyData};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::KeyError;

/// Asymmetric algorithms a key can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum KeyAlgorithm {
    /// ECDSA over P-256 with SHA-256
    #[default]
    #[serde(rename = "ES256", alias = "es256")]
    Es256,
    /// Ed25519
    #[serde(rename = "EdDSA", alias = "eddsa")]
    EdDsa,
    /// RSA PKCS#1 v1.5 with SHA-256. Verification only: accepted for static or
    /// fetched public keys, never generated here.
    #[serde(rename = "RS256", alias = "rs256")]
    Rs256,
}

/// Freshly generated key material. Only [`super::KeyManager`] holds one of these.
pub(crate) struct GeneratedKeyPair {
    pub kid: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

impl KeyAlgorithm {
    /// The JOSE algorithm written into token headers.
    #[must_use]
    pub fn jwt_algorithm(self) -> Algorithm {
        match self {
            Self::Es256 => Algorithm::ES256,
            Self::EdDsa => Algorithm::EdDSA,
            Self::Rs256 => Algorithm::RS256,
        }
    }

    /// Whether this service can generate and sign with keys of this type.
    #[must_use]
    pub fn can_sign(self) -> bool {
        !matches!(self, Self::Rs256)
    }

    /// Generate a new key pair. The key id is derived from the public key.
    pub(crate) fn generate(self) -> Result<GeneratedKeyPair, KeyError> {
        let signature_alg = match self {
            Self::Es256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EdDsa => &rcgen::PKCS_ED25519,
            Self::Rs256 => return Err(KeyError::SigningUnsupported(self)),
        };

        let pair = KeyPair::generate_for(signature_alg)
            .map_err(|e| KeyError::Generation(e.to_string()))?;

        Ok(GeneratedKeyPair {
            kid: key_id_for(&pair.subject_public_key_info()),
            public_key_pem: pair.public_key_pem(),
            private_key_pem: pair.serialize_pem(),
        })
    }

    /// Parse a PKCS#8 private key PEM into a signing key.
    pub(crate) fn encoding_key(self, private_key_pem: &str) -> Result<EncodingKey, KeyError> {
        let pem = private_key_pem.as_bytes();
        let key = match self {
            Self::Es256 => EncodingKey::from_ec_pem(pem)?,
            Self::EdDsa => EncodingKey::from_ed_pem(pem)?,
            Self::Rs256 => return Err(KeyError::SigningUnsupported(self)),
        };
        Ok(key)
    }

    /// Parse an SPKI public key PEM into a verification key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKeyMaterial`] if the PEM does not hold a key
    /// of this algorithm.
    pub fn decoding_key(self, public_key_pem: &str) -> Result<DecodingKey, KeyError> {
        let pem = public_key_pem.as_bytes();
        let key = match self {
            Self::Es256 => DecodingKey::from_ec_pem(pem)?,
            Self::EdDsa => DecodingKey::from_ed_pem(pem)?,
            Self::Rs256 => DecodingKey::from_rsa_pem(pem)?,
        };
        Ok(key)
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Es256 => "ES256",
            Self::EdDsa => "EdDSA",
            Self::Rs256 => "RS256",
        };
        f.write_str(name)
    }
}

/// Stable key id: first 8 bytes of SHA-256 over the SPKI DER, hex encoded.
fn key_id_for(spki_der: &[u8]) -> String {
    let digest = Sha256::digest(spki_der);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kid_is_derived_from_the_public_key_info() {
        let pair = KeyAlgorithm::EdDsa.generate().unwrap();
        let reloaded = KeyPair::from_pem(&pair.private_key_pem).unwrap();

        assert_eq!(pair.kid.len(), 16);
        assert!(pair.kid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(pair.kid, key_id_for(&reloaded.subject_public_key_info()));
        assert_ne!(pair.kid, KeyAlgorithm::EdDsa.generate().unwrap().kid);
    }

    #[test]
    fn generated_es256_pair_round_trips_through_pem() {
        // GIVEN: a generated P-256 key pair
        let pair = KeyAlgorithm::Es256.generate().unwrap();

        // THEN: both halves parse back into jsonwebtoken keys
        assert!(KeyAlgorithm::Es256.encoding_key(&pair.private_key_pem).is_ok());
        assert!(KeyAlgorithm::Es256.decoding_key(&pair.public_key_pem).is_ok());
        assert!(pair.public_key_pem.contains("BEGIN PUBLIC KEY"));
        assert_eq!(pair.kid.len(), 16);
    }

    #[test]
    fn generated_eddsa_pair_round_trips_through_pem() {
        let pair = KeyAlgorithm::EdDsa.generate().unwrap();

        assert!(KeyAlgorithm::EdDsa.encoding_key(&pair.private_key_pem).is_ok());
        assert!(KeyAlgorithm::EdDsa.decoding_key(&pair.public_key_pem).is_ok());
    }

    #[test]
    fn each_generation_gets_a_fresh_kid() {
        let a = KeyAlgorithm::Es256.generate().unwrap();
        let b = KeyAlgorithm::Es256.generate().unwrap();

        assert_ne!(a.kid, b.kid);
    }

    #[test]
    fn rs256_is_verification_only() {
        assert!(!KeyAlgorithm::Rs256.can_sign());
        assert!(matches!(
            KeyAlgorithm::Rs256.generate(),
            Err(KeyError::SigningUnsupported(KeyAlgorithm::Rs256))
        ));
    }

    #[test]
    fn algorithm_serializes_with_jose_names() {
        assert_eq!(serde_json::to_string(&KeyAlgorithm::EdDsa).unwrap(), "\"EdDSA\"");
        let parsed: KeyAlgorithm = serde_json::from_str("\"es256\"").unwrap();
        assert_eq!(parsed, KeyAlgorithm::Es256);
    }
}
