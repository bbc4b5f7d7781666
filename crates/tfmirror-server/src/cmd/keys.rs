//! `tfmirror keygen` and `tfmirror sign`
//!
//! For operators who run their own release upstream: `keygen` produces the
//! key pair (the public half goes into a mirror's `trusted_key`), `sign`
//! writes the detached signature next to a `SHA256SUMS` file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;

/// Environment variable holding the base64 secret key for `sign`.
pub const MANIFEST_KEY_ENV: &str = "TFMIRROR_MANIFEST_KEY";

/// A freshly generated key pair, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub secret: String,
    pub public: String,
}

pub fn generate_key_pair() -> KeyPair {
    let mut secret_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut secret_bytes);
    let signing_key = SigningKey::from_bytes(&secret_bytes);
    KeyPair {
        secret: STANDARD.encode(signing_key.to_bytes()),
        public: STANDARD.encode(signing_key.verifying_key().to_bytes()),
    }
}

pub fn keygen(out: Option<&Path>) -> Result<()> {
    let pair = generate_key_pair();

    println!("{:=^60}", " SECRET KEY (keep this safe) ");
    println!("{}", pair.secret);
    println!("{:=^60}\n", "");
    println!("{:=^60}", " PUBLIC KEY (mirror trusted_key) ");
    println!("{}", pair.public);
    println!("{:=^60}", "");

    if let Some(path) = out {
        if path.exists() {
            bail!("Refusing to overwrite existing key file {}", path.display());
        }
        fs::write(path, &pair.secret)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("\nSecret key saved to {}", path.display());
    }
    Ok(())
}

/// Decode a base64 32-byte Ed25519 secret key.
pub fn signing_key_from_base64(secret: &str) -> Result<SigningKey> {
    let bytes = STANDARD
        .decode(secret.trim())
        .context("Invalid base64 signing key")?;
    let Ok(bytes) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        bail!("{MANIFEST_KEY_ENV} must be a 32-byte Ed25519 secret key");
    };
    Ok(SigningKey::from_bytes(&bytes))
}

/// Base64 signature over the exact bytes of `manifest`.
pub fn sign_bytes(key: &SigningKey, manifest: &[u8]) -> String {
    STANDARD.encode(key.sign(manifest).to_bytes())
}

pub fn sign(input: &Path, output: Option<&Path>) -> Result<()> {
    let secret = std::env::var(MANIFEST_KEY_ENV)
        .with_context(|| format!("{MANIFEST_KEY_ENV} not set"))?;
    let key = signing_key_from_base64(&secret)?;

    let manifest = fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let output = output.map_or_else(
        || {
            let mut name = input.as_os_str().to_owned();
            name.push(".sig");
            PathBuf::from(name)
        },
        Path::to_path_buf,
    );
    fs::write(&output, sign_bytes(&key, &manifest))
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Signed {} -> {}", input.display(), output.display());
    Ok(())
}
