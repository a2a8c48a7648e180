use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};

use crate::errors::{AppError, AppResult};

const EIP191_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `keccak256("\x19Ethereum Signed Message:\n32" || digest)`.
pub fn eth_signed_message_hash(digest: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(EIP191_PREFIX);
    hasher.update(digest);
    hasher.finalize().into()
}

/// The digest a permit signs: `keccak256(abi.encodePacked(address))`.
pub fn permit_digest(address: &[u8; 20]) -> [u8; 32] {
    keccak256(address)
}

pub fn address_of(key: &VerifyingKey) -> [u8; 20] {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// EIP-55 mixed-case hex.
pub fn to_checksum_address(address: &[u8; 20]) -> String {
    let lower = hex::encode(address);
    let hash = keccak256(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (idx, ch) in lower.chars().enumerate() {
        let nibble = (hash[idx / 2] >> (if idx % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if ch.is_ascii_alphabetic() && nibble >= 8 {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Recovers the signer address from a `0x`-prefixed `r || s || v` signature
/// over `keccak256(address)`.
pub fn recover_permit_signer(address: &[u8; 20], signature_hex: &str) -> AppResult<[u8; 20]> {
    let raw = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|err| AppError::Token(format!("invalid signature hex: {err}")))?;
    if raw.len() != 65 {
        return Err(AppError::Token(format!(
            "signature must be 65 bytes, found {}",
            raw.len()
        )));
    }
    let signature = Signature::from_slice(&raw[..64])
        .map_err(|err| AppError::Token(format!("invalid signature: {err}")))?;
    let recovery = raw[64]
        .checked_sub(27)
        .and_then(RecoveryId::from_byte)
        .ok_or_else(|| AppError::Token("invalid recovery byte".into()))?;
    let prehash = eth_signed_message_hash(&permit_digest(address));
    let key = VerifyingKey::recover_from_prehash(&prehash, &signature, recovery)
        .map_err(|err| AppError::Token(format!("signature recovery failed: {err}")))?;
    Ok(address_of(&key))
}

/// secp256k1 key that signs voting permits.
pub struct PermitSigner {
    key: SigningKey,
    address: [u8; 20],
}

impl std::fmt::Debug for PermitSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermitSigner")
            .field("address", &to_checksum_address(&self.address))
            .finish_non_exhaustive()
    }
}

impl PermitSigner {
    pub fn from_hex(secret: &str) -> AppResult<Self> {
        let bytes = hex::decode(secret.trim().trim_start_matches("0x")).map_err(|err| {
            AppError::InvalidSecret {
                name: "signer key",
                message: format!("not valid hex: {err}"),
            }
        })?;
        let key = SigningKey::from_slice(&bytes).map_err(|_| AppError::InvalidSecret {
            name: "signer key",
            message: "not a valid secp256k1 private key".into(),
        })?;
        Ok(Self::from_signing_key(key))
    }

    pub fn random() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    fn from_signing_key(key: SigningKey) -> Self {
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    pub fn address(&self) -> [u8; 20] {
        self.address
    }

    pub fn checksum_address(&self) -> String {
        to_checksum_address(&self.address)
    }

    /// Signs `address` so that `ECDSA.recover(keccak256(abi.encodePacked(address))
    /// .toEthSignedMessageHash(), sig)` yields this signer.
    pub fn sign_address(&self, address: &[u8; 20]) -> AppResult<String> {
        let prehash = eth_signed_message_hash(&permit_digest(address));
        let (signature, recovery) = self
            .key
            .sign_prehash_recoverable(&prehash)
            .map_err(|err| AppError::Token(format!("signing failed: {err}")))?;

        let mut raw = Vec::with_capacity(65);
        raw.extend_from_slice(&signature.to_bytes());
        raw.push(27 + recovery.to_byte());
        Ok(format!("0x{}", hex::encode(raw)))
    }
}
