//! Cryptographic utilities for packet authentication in the shuffle protocol
//!
//! Every packet a player sends is signed with its round verification key
//! using the Bitcoin signed-message scheme: the base64 text of the serialized
//! packet is hashed as `dSHA256(varint || "Bitcoin Signed Message:\n" ||
//! varint || text)` and signed with a recoverable ECDSA signature. The raw
//! 65-byte compact form travels on the wire.
//!
//! Verification recovers the signer's public key and requires that its P2PKH
//! address matches the address of the key the packet claims to come from.

use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::RecoverableSignature, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sign_message::{signed_msg_hash, MessageSignature};
use bitcoin::{Address, Network};

/// Error types for signature operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid signature format")]
    InvalidFormat,

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("signer address mismatch")]
    AddressMismatch,
}

/// Sign a text message with the Bitcoin message scheme
///
/// # Returns
/// Compact recoverable signature (65 bytes, compressed-key header)
pub fn sign_message(key: &SecretKey, message: &str) -> [u8; 65] {
    let secp = Secp256k1::signing_only();
    let digest = Message::from_digest(signed_msg_hash(message).to_byte_array());
    let signature: RecoverableSignature = secp.sign_ecdsa_recoverable(&digest, key);
    MessageSignature::new(signature, true).serialize()
}

/// Verify a message signature against the address of `claimed`
///
/// # Returns
/// `Ok(())` if the recovered signer has the same P2PKH address as `claimed`
/// and the ECDSA signature checks out, otherwise an error
pub fn verify_message(
    message: &str,
    signature: &[u8],
    claimed: &PublicKey,
    network: Network,
) -> Result<(), SignatureError> {
    let secp = Secp256k1::verification_only();
    let signature = MessageSignature::from_slice(signature).map_err(|_| SignatureError::InvalidFormat)?;
    let msg_hash = signed_msg_hash(message);

    let recovered = signature
        .recover_pubkey(&secp, msg_hash)
        .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;

    let expected = Address::p2pkh(bitcoin::PublicKey::new(*claimed), network);
    if Address::p2pkh(recovered, network) != expected {
        return Err(SignatureError::AddressMismatch);
    }

    let digest = Message::from_digest(msg_hash.to_byte_array());
    secp.verify_ecdsa(&digest, &signature.signature.to_standard(), &recovered.inner)
        .map_err(|e| SignatureError::VerificationFailed(e.to_string()))
}

/// Parse a compressed SEC1 hex public key as carried in packets
pub fn parse_public_key(key: &str) -> Result<PublicKey, SignatureError> {
    PublicKey::from_str(key).map_err(|e| SignatureError::InvalidKey(e.to_string()))
}
