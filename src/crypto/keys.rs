//! ECDSA keys and the transaction signature string
//!
//! Transactions carry `hex(DER(signature)) "." hex(DER(public-key))` in every
//! input. The public key travels inside the signature string, so validation
//! can both verify the signature and re-derive the spending address from it.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;
use thiserror::Error;

use super::address_from_public_key;

/// Signature and key errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Malformed signature string")]
    MalformedSignature,
}

/// An ECDSA secp256k1 keypair
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair([REDACTED])")
    }
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        KeyPair {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    /// Load from PKCS#8 DER bytes
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        SigningKey::from_pkcs8_der(der)
            .map(|signing| KeyPair { signing })
            .map_err(|_| CryptoError::InvalidPrivateKey)
    }

    /// Export as PKCS#8 DER bytes
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.signing
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|_| CryptoError::InvalidPrivateKey)
    }

    /// The verifying half of this keypair
    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing.verifying_key()
    }

    /// The address controlled by this keypair
    pub fn address(&self) -> String {
        address_from_public_key(&self.verifying_key())
    }

    /// Sign a transaction id, producing the full signature string
    ///
    /// The ASCII bytes of the lowercase hex id are signed (SHA-256 prehash
    /// inside the ECDSA primitive).
    pub fn sign_id(&self, id: &str) -> Result<String, CryptoError> {
        let signature: Signature = self.signing.sign(id.as_bytes());
        let public_der = self
            .verifying_key()
            .to_public_key_der()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(format!(
            "{}.{}",
            hex::encode(signature.to_der().as_bytes()),
            hex::encode(public_der.as_bytes())
        ))
    }
}

/// Split a signature string into its signature and public key
pub fn decode_signature(sig: &str) -> Result<(Signature, VerifyingKey), CryptoError> {
    let (sig_hex, key_hex) = sig.split_once('.').ok_or(CryptoError::MalformedSignature)?;
    let sig_der = hex::decode(sig_hex).map_err(|_| CryptoError::MalformedSignature)?;
    let key_der = hex::decode(key_hex).map_err(|_| CryptoError::MalformedSignature)?;
    let signature = Signature::from_der(&sig_der).map_err(|_| CryptoError::InvalidSignature)?;
    let verifying = VerifyingKey::from_public_key_der(&key_der)
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok((signature, verifying))
}

/// Derive the address of whoever produced a signature string
pub fn signer_address(sig: &str) -> Result<String, CryptoError> {
    let (_, verifying) = decode_signature(sig)?;
    Ok(address_from_public_key(&verifying))
}

/// Verify a signature string against a transaction id
pub fn verify_id(id: &str, sig: &str) -> bool {
    match decode_signature(sig) {
        Ok((signature, verifying)) => verifying.verify(id.as_bytes(), &signature).is_ok(),
        Err(_) => false,
    }
}
