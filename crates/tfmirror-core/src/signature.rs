//! Detached signatures over checksum manifests.
//!
//! The sync engine only depends on [`SignatureVerifier`]; the trusted key is
//! configured per mirror by the operator and never taken from the upstream.
//! [`verifier_from_key`] picks the implementation from the key format:
//! an ASCII-armored OpenPGP public key block (HashiCorp's `SHA256SUMS.sig`)
//! or a base64 Ed25519 key (`tfmirror keygen`).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use pgp::composed::{Deserializable, SignedPublicKey, StandaloneSignature};
use thiserror::Error;

const PGP_KEY_MARKER: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";
const PGP_SIGNATURE_MARKER: &[u8] = b"-----BEGIN PGP SIGNATURE-----";

/// Why a manifest signature was rejected.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The configured key is not a valid public key.
    #[error("invalid trusted key: {0}")]
    InvalidKey(String),
    /// The signature file could not be decoded.
    #[error("malformed signature: {0}")]
    Malformed(String),
    /// The signature does not match the manifest under the trusted key.
    #[error("signature does not match manifest")]
    Mismatch,
}

/// Verification contract for manifest signatures.
pub trait SignatureVerifier: Send + Sync + std::fmt::Debug {
    /// Check `signature` over the exact `manifest` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError`] when the signature is unusable or invalid.
    fn verify(&self, manifest: &[u8], signature: &[u8]) -> Result<(), SignatureError>;
}

/// Ed25519 verifier bound to one trusted public key.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    /// Build from a base64-encoded 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::InvalidKey`] for bad base64, length, or curve point.
    pub fn from_base64(public_key: &str) -> Result<Self, SignatureError> {
        let bytes = STANDARD
            .decode(public_key.trim())
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidKey("expected 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, manifest: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let sig_bytes = decode_signature(signature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        self.key
            .verify(manifest, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

/// OpenPGP detached-signature verifier bound to one armored public key.
///
/// Signatures made by the primary key or any of its subkeys are accepted.
#[derive(Debug, Clone)]
pub struct OpenPgpVerifier {
    key: SignedPublicKey,
}

impl OpenPgpVerifier {
    /// Parse an ASCII-armored public key block and check its self-signatures.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::InvalidKey`] when the block is missing or unparseable.
    pub fn from_armored(armored: &str) -> Result<Self, SignatureError> {
        if !armored.contains(PGP_KEY_MARKER) {
            return Err(SignatureError::InvalidKey(
                "missing PGP public key block".into(),
            ));
        }
        let (key, _headers) = SignedPublicKey::from_string(armored.trim())
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        key.verify()
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }
}

impl SignatureVerifier for OpenPgpVerifier {
    fn verify(&self, manifest: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Malformed("empty signature".into()));
        }
        let signature = if signature.trim_ascii_start().starts_with(PGP_SIGNATURE_MARKER) {
            let text = std::str::from_utf8(signature)
                .map_err(|_| SignatureError::Malformed("armored signature is not UTF-8".into()))?;
            StandaloneSignature::from_string(text.trim())
                .map(|(sig, _headers)| sig)
                .map_err(|e| SignatureError::Malformed(e.to_string()))?
        } else {
            StandaloneSignature::from_bytes(signature)
                .map_err(|e| SignatureError::Malformed(e.to_string()))?
        };

        if signature.verify(&self.key, manifest).is_ok() {
            return Ok(());
        }
        if self
            .key
            .public_subkeys
            .iter()
            .any(|sub| signature.verify(sub, manifest).is_ok())
        {
            return Ok(());
        }
        Err(SignatureError::Mismatch)
    }
}

/// Build the verifier matching the configured trusted key.
///
/// # Errors
///
/// Returns [`SignatureError::InvalidKey`] when the key is neither a valid
/// armored OpenPGP key nor a valid base64 Ed25519 key.
pub fn verifier_from_key(trusted_key: &str) -> Result<Box<dyn SignatureVerifier>, SignatureError> {
    if trusted_key.contains(PGP_KEY_MARKER) {
        Ok(Box::new(OpenPgpVerifier::from_armored(trusted_key)?))
    } else {
        Ok(Box::new(Ed25519Verifier::from_base64(trusted_key)?))
    }
}

// Signature files are either raw 64 bytes or base64 text.
fn decode_signature(raw: &[u8]) -> Result<[u8; 64], SignatureError> {
    if let Ok(bytes) = <[u8; 64]>::try_from(raw) {
        return Ok(bytes);
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| SignatureError::Malformed("not base64 text".into()))?;
    let decoded = STANDARD
        .decode(text.trim())
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    <[u8; 64]>::try_from(decoded.as_slice())
        .map_err(|_| SignatureError::Malformed(format!("expected 64 bytes, got {}", decoded.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair() -> (SigningKey, String) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public = STANDARD.encode(signing.verifying_key().to_bytes());
        (signing, public)
    }

    #[test]
    fn accepts_base64_and_raw_signatures() {
        let (signing, public) = keypair();
        let verifier = Ed25519Verifier::from_base64(&public).unwrap();
        let manifest = b"abc  terraform_1.9.0_linux_amd64.zip\n";
        let sig = signing.sign(manifest).to_bytes();

        verifier.verify(manifest, &sig).unwrap();
        verifier
            .verify(manifest, STANDARD.encode(sig).as_bytes())
            .unwrap();
    }

    #[test]
    fn rejects_tampered_manifest() {
        let (signing, public) = keypair();
        let verifier = Ed25519Verifier::from_base64(&public).unwrap();
        let sig = signing.sign(b"original").to_bytes();
        assert!(matches!(
            verifier.verify(b"tampered", &sig),
            Err(SignatureError::Mismatch)
        ));
    }

    const SUMS: &[u8] = include_bytes!("../tests/fixtures/openpgp/SHA256SUMS");
    const PGP_KEY: &str = include_str!("../tests/fixtures/openpgp/key.asc");
    const PGP_SIG: &[u8] = include_bytes!("../tests/fixtures/openpgp/SHA256SUMS.sig");
    const PGP_SIG_ARMORED: &[u8] = include_bytes!("../tests/fixtures/openpgp/SHA256SUMS.asc");
    const SUBKEY_KEY: &str = include_str!("../tests/fixtures/openpgp/subkey_key.asc");
    const SUBKEY_SIG: &[u8] = include_bytes!("../tests/fixtures/openpgp/SHA256SUMS.subkey.sig");
    const OTHER_KEY: &str = include_str!("../tests/fixtures/openpgp/other_key.asc");

    #[test]
    fn openpgp_accepts_binary_and_armored_signatures() {
        let verifier = OpenPgpVerifier::from_armored(PGP_KEY).unwrap();
        verifier.verify(SUMS, PGP_SIG).unwrap();
        verifier.verify(SUMS, PGP_SIG_ARMORED).unwrap();
    }

    #[test]
    fn openpgp_accepts_signing_subkey() {
        let verifier = OpenPgpVerifier::from_armored(SUBKEY_KEY).unwrap();
        verifier.verify(SUMS, SUBKEY_SIG).unwrap();
    }

    #[test]
    fn openpgp_rejects_tampered_manifest_and_wrong_key() {
        let verifier = OpenPgpVerifier::from_armored(PGP_KEY).unwrap();
        let mut tampered = SUMS.to_vec();
        tampered[0] = b'c';
        assert!(matches!(
            verifier.verify(&tampered, PGP_SIG),
            Err(SignatureError::Mismatch)
        ));

        let other = OpenPgpVerifier::from_armored(OTHER_KEY).unwrap();
        assert!(matches!(
            other.verify(SUMS, PGP_SIG),
            Err(SignatureError::Mismatch)
        ));
        assert!(matches!(
            verifier.verify(SUMS, b""),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn openpgp_rejects_broken_key_block() {
        assert!(matches!(
            OpenPgpVerifier::from_armored("not a key"),
            Err(SignatureError::InvalidKey(_))
        ));
        let truncated = format!("{PGP_KEY_MARKER}\n\nAAAA\n-----END PGP PUBLIC KEY BLOCK-----\n");
        assert!(matches!(
            OpenPgpVerifier::from_armored(&truncated),
            Err(SignatureError::InvalidKey(_))
        ));
    }

    #[test]
    fn key_format_selects_verifier() {
        let pgp = verifier_from_key(PGP_KEY).unwrap();
        pgp.verify(SUMS, PGP_SIG).unwrap();

        let (signing, public) = keypair();
        let ed = verifier_from_key(&public).unwrap();
        ed.verify(SUMS, &signing.sign(SUMS).to_bytes()).unwrap();

        assert!(verifier_from_key("bm90LWEta2V5").is_err());
    }

    #[test]
    fn rejects_garbage() {
        let (_, public) = keypair();
        let verifier = Ed25519Verifier::from_base64(&public).unwrap();
        assert!(matches!(
            verifier.verify(b"m", b"not a signature"),
            Err(SignatureError::Malformed(_))
        ));
        assert!(matches!(
            Ed25519Verifier::from_base64("AAAA"),
            Err(SignatureError::InvalidKey(_))
        ));
    }
}
