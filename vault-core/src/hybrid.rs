// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Hybrid key wrapping (ML-KEM-768 + RSA-OAEP)
//
// Features:
// - Secret wrapping for one recipient holding both a KEM and an RSA key
// - Both shared secrets required to rebuild the payload key
// - Header (version, recipient fingerprint, encapsulations) bound as AAD
// - Legacy RSA-only decoder retained alongside the hybrid format
// - Format sniffing without decryption

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::debug;
use zeroize::Zeroizing;

use crate::codec::{self, ByteReader, EncryptedBlob};
use crate::crypto::{Blake3Hasher, KeyCombiner, MlKem768, RsaOaep};
use crate::error::{VaultError, VaultResult};
use crate::{FINGERPRINT_SIZE, RSA_MIN_BITS, RSA_WRAPPED_SECRET_SIZE};

const HYBRID_MAGIC: &[u8; 2] = b"HW";
const COMBINER_SALT: &[u8] = b"vault-core/hybrid-wrap/v2";

/// ML-KEM-768 public key bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KemPublicKey(pub Vec<u8>);

/// ML-KEM-768 secret key bytes
pub struct KemSecretKey(Zeroizing<Vec<u8>>);

impl KemSecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KemSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KemSecretKey([REDACTED])")
    }
}

/// Post-quantum keypair
#[derive(Debug)]
pub struct KemKeypair {
    pub public: KemPublicKey,
    pub secret: KemSecretKey,
}

/// Generate a fresh ML-KEM-768 keypair.
pub fn generate_kem_keypair() -> KemKeypair {
    let (public, secret) = MlKem768::generate_keypair();
    KemKeypair {
        public: KemPublicKey(public),
        secret: KemSecretKey(secret),
    }
}

/// Classical keypair
pub struct RsaKeypair {
    pub public: RsaPublicKey,
    pub private: RsaPrivateKey,
}

impl RsaKeypair {
    pub fn from_private(private: RsaPrivateKey) -> Self {
        Self {
            public: private.to_public_key(),
            private,
        }
    }

    /// SubjectPublicKeyInfo DER
    pub fn public_key_der(&self) -> VaultResult<Vec<u8>> {
        encode_rsa_public_key(&self.public)
    }

    /// PKCS#8 DER of the private key
    pub fn private_key_der(&self) -> VaultResult<Zeroizing<Vec<u8>>> {
        let doc = self
            .private
            .to_pkcs8_der()
            .map_err(|e| VaultError::SerializationFailed(format!("rsa private key: {e}")))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    pub fn from_private_key_der(der: &[u8]) -> VaultResult<Self> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|_| VaultError::DeserializationFailed("rsa private key".to_string()))?;
        Ok(Self::from_private(private))
    }
}

impl fmt::Debug for RsaKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

pub fn encode_rsa_public_key(public: &RsaPublicKey) -> VaultResult<Vec<u8>> {
    public
        .to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| VaultError::SerializationFailed(format!("rsa public key: {e}")))
}

pub fn decode_rsa_public_key(der: &[u8]) -> VaultResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|_| VaultError::DeserializationFailed("rsa public key".to_string()))
}

/// Generate an RSA keypair of `bits` modulus size.
pub fn generate_rsa_keypair(bits: usize) -> VaultResult<RsaKeypair> {
    if bits < RSA_MIN_BITS {
        return Err(VaultError::InvalidConfiguration(format!(
            "rsa modulus must be at least {RSA_MIN_BITS} bits"
        )));
    }
    RsaOaep::generate(bits).map(RsaKeypair::from_private)
}

/// BLAKE3 fingerprint identifying one recipient's key pair.
pub fn recipient_fingerprint(
    kem_public: &KemPublicKey,
    rsa_public: &RsaPublicKey,
) -> VaultResult<[u8; FINGERPRINT_SIZE]> {
    let rsa_der = encode_rsa_public_key(rsa_public)?;
    Ok(Blake3Hasher::fingerprint(&[&kem_public.0, &rsa_der]))
}

/// Wrapping scheme version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HybridVersion {
    /// RSA-OAEP only, no header
    LegacyRsa = 1,
    /// ML-KEM-768 + RSA-OAEP, HKDF-combined, AES-256-GCM payload
    V2 = 2,
}

/// Secret wrapped for exactly one hybrid recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridCiphertext {
    pub version: HybridVersion,
    pub recipient: [u8; FINGERPRINT_SIZE],
    pub kem_ciphertext: Vec<u8>,
    pub rsa_ciphertext: Vec<u8>,
    pub payload: EncryptedBlob,
}

// magic | version | recipient | u32 kem_len | kem_ct | u32 rsa_len | rsa_ct
fn encode_header(
    version: HybridVersion,
    recipient: &[u8; FINGERPRINT_SIZE],
    kem_ciphertext: &[u8],
    rsa_ciphertext: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        HYBRID_MAGIC.len() + 1 + FINGERPRINT_SIZE + 8 + kem_ciphertext.len() + rsa_ciphertext.len(),
    );
    out.extend_from_slice(HYBRID_MAGIC);
    out.push(version as u8);
    out.extend_from_slice(recipient);
    out.extend_from_slice(&(kem_ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(kem_ciphertext);
    out.extend_from_slice(&(rsa_ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(rsa_ciphertext);
    out
}

impl HybridCiphertext {
    fn header_bytes(&self) -> Vec<u8> {
        encode_header(
            self.version,
            &self.recipient,
            &self.kem_ciphertext,
            &self.rsa_ciphertext,
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        out.extend_from_slice(&self.payload.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        let mut reader = ByteReader::new(bytes);
        if reader.take(HYBRID_MAGIC.len())? != HYBRID_MAGIC {
            return Err(VaultError::MalformedCiphertext("not a hybrid ciphertext"));
        }
        let version = match reader.u8()? {
            2 => HybridVersion::V2,
            other => return Err(VaultError::UnknownHybridVersion(other)),
        };
        let recipient = reader.array::<FINGERPRINT_SIZE>()?;
        let kem_len = reader.u32()? as usize;
        let kem_ciphertext = reader.take(kem_len)?.to_vec();
        let rsa_len = reader.u32()? as usize;
        let rsa_ciphertext = reader.take(rsa_len)?.to_vec();
        let payload = EncryptedBlob::from_bytes(reader.rest())?;

        Ok(Self {
            version,
            recipient,
            kem_ciphertext,
            rsa_ciphertext,
            payload,
        })
    }

    pub fn to_encoded(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_encoded(encoded: &str) -> VaultResult<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| VaultError::MalformedCiphertext("invalid base64"))?;
        Self::from_bytes(&bytes)
    }
}

fn payload_key(
    kem_secret: &[u8],
    rsa_secret: &[u8],
    header: &[u8],
) -> VaultResult<Zeroizing<[u8; 32]>> {
    let transcript = Blake3Hasher::hash(header);
    KeyCombiner::combine(&[kem_secret, rsa_secret], COMBINER_SALT, &transcript)
}

/// Wrap `secret` so that only the holder of both matching private keys can recover it.
pub fn hybrid_wrap(
    secret: &[u8],
    kem_public: &KemPublicKey,
    rsa_public: &RsaPublicKey,
) -> VaultResult<HybridCiphertext> {
    let (kem_secret, kem_ciphertext) = MlKem768::encapsulate(&kem_public.0)?;

    let mut rsa_secret = Zeroizing::new([0u8; RSA_WRAPPED_SECRET_SIZE]);
    rand::rngs::OsRng.fill_bytes(&mut rsa_secret[..]);
    let rsa_ciphertext = RsaOaep::encrypt(rsa_public, &rsa_secret[..])?;

    let recipient = recipient_fingerprint(kem_public, rsa_public)?;
    let header = encode_header(HybridVersion::V2, &recipient, &kem_ciphertext, &rsa_ciphertext);
    let key = payload_key(&kem_secret, &rsa_secret[..], &header)?;
    let payload = codec::seal(&key, secret, &header, None)?;

    let wrapped = HybridCiphertext {
        version: HybridVersion::V2,
        recipient,
        kem_ciphertext,
        rsa_ciphertext,
        payload,
    };

    debug!(
        recipient = %hex::encode(wrapped.recipient),
        "wrapped secret for hybrid recipient"
    );
    Ok(wrapped)
}

/// Recover a secret from a [`HybridCiphertext`]. Fails closed if either private key is wrong.
pub fn hybrid_unwrap(
    wrapped: &HybridCiphertext,
    kem_secret: &KemSecretKey,
    rsa_private: &RsaPrivateKey,
) -> VaultResult<Zeroizing<Vec<u8>>> {
    if wrapped.version != HybridVersion::V2 {
        return Err(VaultError::UnknownHybridVersion(wrapped.version as u8));
    }

    let shared = MlKem768::decapsulate(kem_secret.as_bytes(), &wrapped.kem_ciphertext)?;
    let rsa_secret = RsaOaep::decrypt(rsa_private, &wrapped.rsa_ciphertext)?;
    if rsa_secret.len() != RSA_WRAPPED_SECRET_SIZE {
        return Err(VaultError::RsaUnwrapFailed);
    }

    let header = wrapped.header_bytes();
    let key = payload_key(&shared, &rsa_secret, &header)?;
    codec::open(&key, &wrapped.payload, &header)
}

/// Single-primitive RSA-OAEP wrapping, base64 encoded.
///
/// Produced only for recipients that have no post-quantum key yet.
pub fn legacy_wrap(secret: &[u8], rsa_public: &RsaPublicKey) -> VaultResult<String> {
    RsaOaep::encrypt(rsa_public, secret).map(|ct| BASE64.encode(ct))
}

pub fn legacy_unwrap(encoded: &str, rsa_private: &RsaPrivateKey) -> VaultResult<Zeroizing<Vec<u8>>> {
    let ciphertext = BASE64
        .decode(encoded)
        .map_err(|_| VaultError::MalformedCiphertext("invalid base64"))?;
    RsaOaep::decrypt(rsa_private, &ciphertext)
}

/// A stored wrapped secret of either generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrappedSecret {
    Legacy(String),
    Hybrid(HybridCiphertext),
}

impl WrappedSecret {
    /// Classify a stored value by its magic bytes.
    ///
    /// Anything starting with the hybrid magic is hybrid; a header that then
    /// fails to parse is an error, never a legacy fallback.
    pub fn parse(encoded: &str) -> VaultResult<Self> {
        match BASE64.decode(encoded) {
            Ok(bytes) if bytes.starts_with(HYBRID_MAGIC) => {
                HybridCiphertext::from_bytes(&bytes).map(Self::Hybrid)
            }
            _ => Ok(Self::Legacy(encoded.to_string())),
        }
    }

    pub fn version(&self) -> HybridVersion {
        match self {
            Self::Legacy(_) => HybridVersion::LegacyRsa,
            Self::Hybrid(h) => h.version,
        }
    }

    pub fn to_encoded(&self) -> String {
        match self {
            Self::Legacy(encoded) => encoded.clone(),
            Self::Hybrid(h) => h.to_encoded(),
        }
    }
}

/// Unwrap a stored secret of either generation.
///
/// Hybrid values need the KEM secret key; without one the caller gets
/// `PrerequisiteMissing` rather than a silent RSA-only attempt.
pub fn unwrap_any(
    encoded: &str,
    kem_secret: Option<&KemSecretKey>,
    rsa_private: &RsaPrivateKey,
) -> VaultResult<Zeroizing<Vec<u8>>> {
    match WrappedSecret::parse(encoded)? {
        WrappedSecret::Hybrid(wrapped) => {
            let kem_secret = kem_secret.ok_or(VaultError::PrerequisiteMissing("kem secret key"))?;
            hybrid_unwrap(&wrapped, kem_secret, rsa_private)
        }
        WrappedSecret::Legacy(encoded) => legacy_unwrap(&encoded, rsa_private),
    }
}

/// Whether `encoded` is a hybrid ciphertext. Never attempts decryption.
pub fn is_hybrid_format(encoded: &str) -> bool {
    BASE64
        .decode(encoded)
        .is_ok_and(|bytes| bytes.starts_with(HYBRID_MAGIC))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::sync::OnceLock;

    fn rsa_fixture() -> &'static RsaKeypair {
        static KEYS: OnceLock<RsaKeypair> = OnceLock::new();
        KEYS.get_or_init(|| generate_rsa_keypair(RSA_MIN_BITS).unwrap())
    }

    fn other_rsa_fixture() -> &'static RsaKeypair {
        static KEYS: OnceLock<RsaKeypair> = OnceLock::new();
        KEYS.get_or_init(|| generate_rsa_keypair(RSA_MIN_BITS).unwrap())
    }

    #[test]
    fn test_hybrid_roundtrip() {
        let rsa = rsa_fixture();
        let kem = generate_kem_keypair();
        let secret = b"collection key material";

        let wrapped = hybrid_wrap(secret, &kem.public, &rsa.public).unwrap();
        assert_eq!(wrapped.version, HybridVersion::V2);

        let unwrapped = hybrid_unwrap(&wrapped, &kem.secret, &rsa.private).unwrap();
        assert_eq!(*unwrapped, secret.to_vec());
    }

    #[test]
    fn test_wrong_kem_key_fails_closed() {
        let rsa = rsa_fixture();
        let kem = generate_kem_keypair();
        let other = generate_kem_keypair();

        let wrapped = hybrid_wrap(b"secret", &kem.public, &rsa.public).unwrap();
        assert!(matches!(
            hybrid_unwrap(&wrapped, &other.secret, &rsa.private),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_rsa_key_fails_closed() {
        let kem = generate_kem_keypair();
        let wrapped = hybrid_wrap(b"secret", &kem.public, &rsa_fixture().public).unwrap();
        assert!(matches!(
            hybrid_unwrap(&wrapped, &kem.secret, &other_rsa_fixture().private),
            Err(VaultError::RsaUnwrapFailed)
        ));
    }

    #[test]
    fn test_tampered_header_fails_closed() {
        let rsa = rsa_fixture();
        let kem = generate_kem_keypair();
        let mut wrapped = hybrid_wrap(b"secret", &kem.public, &rsa.public).unwrap();
        wrapped.recipient[0] ^= 0xff;
        assert!(hybrid_unwrap(&wrapped, &kem.secret, &rsa.private).is_err());
    }

    #[test]
    fn test_encoding_and_sniffing() {
        let rsa = rsa_fixture();
        let kem = generate_kem_keypair();

        let hybrid = hybrid_wrap(b"secret", &kem.public, &rsa.public).unwrap();
        let encoded = hybrid.to_encoded();
        assert_eq!(HybridCiphertext::from_encoded(&encoded).unwrap(), hybrid);
        assert!(is_hybrid_format(&encoded));

        let legacy = legacy_wrap(b"secret", &rsa.public).unwrap();
        assert!(!is_hybrid_format(&legacy));
        assert!(!is_hybrid_format("not base64 at all"));
    }

    #[test]
    fn test_unwrap_any_handles_both_generations() {
        let rsa = rsa_fixture();
        let kem = generate_kem_keypair();

        let legacy = legacy_wrap(b"old secret", &rsa.public).unwrap();
        assert_eq!(*unwrap_any(&legacy, None, &rsa.private).unwrap(), b"old secret".to_vec());

        let hybrid = hybrid_wrap(b"new secret", &kem.public, &rsa.public)
            .unwrap()
            .to_encoded();
        assert_eq!(
            *unwrap_any(&hybrid, Some(&kem.secret), &rsa.private).unwrap(),
            b"new secret".to_vec()
        );
        assert!(matches!(
            unwrap_any(&hybrid, None, &rsa.private),
            Err(VaultError::PrerequisiteMissing(_))
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let rsa = rsa_fixture();
        let kem = generate_kem_keypair();
        let mut bytes = hybrid_wrap(b"s", &kem.public, &rsa.public).unwrap().to_bytes();
        bytes[2] = 9;
        assert!(matches!(
            HybridCiphertext::from_bytes(&bytes),
            Err(VaultError::UnknownHybridVersion(9))
        ));
    }

    #[test]
    fn test_unknown_version_never_falls_back_to_legacy() {
        let rsa = rsa_fixture();
        let kem = generate_kem_keypair();
        let mut bytes = hybrid_wrap(b"s", &kem.public, &rsa.public).unwrap().to_bytes();
        bytes[2] = 3;
        let encoded = BASE64.encode(&bytes);

        assert!(is_hybrid_format(&encoded));
        assert!(matches!(
            WrappedSecret::parse(&encoded),
            Err(VaultError::UnknownHybridVersion(3))
        ));
        let err = unwrap_any(&encoded, Some(&kem.secret), &rsa.private).unwrap_err();
        assert!(matches!(err, VaultError::UnknownHybridVersion(3)));
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_truncated_hybrid_is_malformed() {
        let rsa = rsa_fixture();
        let kem = generate_kem_keypair();
        let bytes = hybrid_wrap(b"s", &kem.public, &rsa.public).unwrap().to_bytes();
        let encoded = BASE64.encode(&bytes[..40]);

        assert!(is_hybrid_format(&encoded));
        assert!(matches!(
            unwrap_any(&encoded, Some(&kem.secret), &rsa.private),
            Err(VaultError::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn test_small_rsa_modulus_rejected() {
        assert!(matches!(
            generate_rsa_keypair(1024),
            Err(VaultError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_rsa_der_roundtrip() {
        let rsa = rsa_fixture();
        let der = rsa.private_key_der().unwrap();
        let restored = RsaKeypair::from_private_key_der(&der).unwrap();
        assert_eq!(restored.public, rsa.public);

        let public = decode_rsa_public_key(&rsa.public_key_der().unwrap()).unwrap();
        assert_eq!(public, rsa.public);
    }
}
