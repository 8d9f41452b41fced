//! Body transforms shared by the agent and the collector: gzip, HMAC-SHA256
//! signing and chunked RSA encryption.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// PKCS#1 v1.5 padding overhead per encrypted block.
const PKCS1_PADDING: usize = 11;

/// Header carrying the hex HMAC-SHA256 of the uncompressed body.
pub const HASH_HEADER: &str = "HashSHA256";

/// Header marking an RSA-encrypted body.
pub const ENCRYPTED_HEADER: &str = "X-Encrypted";

/// Header carrying the agent's outbound address.
pub const REAL_IP_HEADER: &str = "X-Real-IP";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("gzip: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("hmac key rejected")]
    HmacKey,

    #[error("signature is not valid hex")]
    MalformedSignature,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("ciphertext length {len} is not a multiple of the key size {block}")]
    CiphertextLength { len: usize, block: usize },

    #[error("reading key {}: {source}", .path.display())]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key is neither PKCS#1 nor PKCS#8 PEM")]
    KeyFormat,
}

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(CodecError::Gzip)?;
    encoder.finish().map_err(CodecError::Gzip)
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(CodecError::Gzip)?;
    Ok(out)
}

/// Returns the lowercase hex HMAC-SHA256 of `body` under `key`.
pub fn sign(key: &str, body: &[u8]) -> Result<String, CodecError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| CodecError::HmacKey)?;
    mac.update(body);
    let digest = mac.finalize().into_bytes();

    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

/// Checks a hex signature in constant time.
pub fn verify(key: &str, body: &[u8], signature: &str) -> Result<(), CodecError> {
    let expected = decode_hex(signature).ok_or(CodecError::MalformedSignature)?;
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| CodecError::HmacKey)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| CodecError::SignatureMismatch)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

fn read_pem(path: &Path) -> Result<String, CodecError> {
    std::fs::read_to_string(path).map_err(|source| CodecError::KeyFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Encrypts bodies with the collector's public key.
#[derive(Debug, Clone)]
pub struct Encryptor {
    key: RsaPublicKey,
}

impl Encryptor {
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Accepts PKCS#1 (`RSA PUBLIC KEY`) or SPKI (`PUBLIC KEY`) PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CodecError> {
        RsaPublicKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPublicKey::from_public_key_pem(pem))
            .map(Self::new)
            .map_err(|_| CodecError::KeyFormat)
    }

    pub fn load(path: &Path) -> Result<Self, CodecError> {
        Self::from_pem(&read_pem(path)?)
    }

    /// Encrypts `data` block by block; output length is a multiple of the key size.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let block = self.key.size();
        let chunk = block.saturating_sub(PKCS1_PADDING).max(1);
        let mut rng = rand::thread_rng();

        let mut out = Vec::with_capacity(data.len().div_ceil(chunk) * block);
        for part in data.chunks(chunk) {
            out.extend(self.key.encrypt(&mut rng, Pkcs1v15Encrypt, part)?);
        }
        Ok(out)
    }
}

/// Decrypts bodies with the collector's private key.
#[derive(Debug, Clone)]
pub struct Decryptor {
    key: RsaPrivateKey,
}

impl Decryptor {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Accepts PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CodecError> {
        RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map(Self::new)
            .map_err(|_| CodecError::KeyFormat)
    }

    pub fn load(path: &Path) -> Result<Self, CodecError> {
        Self::from_pem(&read_pem(path)?)
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let block = self.key.size();
        if block == 0 || data.len() % block != 0 {
            return Err(CodecError::CiphertextLength {
                len: data.len(),
                block,
            });
        }

        let mut out = Vec::with_capacity(data.len());
        for part in data.chunks(block) {
            out.extend(self.key.decrypt(Pkcs1v15Encrypt, part)?);
        }
        Ok(out)
    }
}
