//! Frame codec and packet construction
//!
//! Frame layout on the wire:
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────────────┐
//! │ MAGIC (8)    │ LENGTH (4 BE) │ protobuf Packets payload │
//! └──────────────┴───────────────┴──────────────────────────┘
//! ```
//!
//! Every packet a player emits is signed over the base64 text of its own
//! protobuf encoding. Packets without a sender key (relay notices and our own
//! registration) travel unsigned.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bitcoin::secp256k1::SecretKey;
use bitcoin::Network;
use prost::Message as _;

use super::crypto_utils::{parse_public_key, sign_message, verify_message, SignatureError};
use super::messages::{
    Address, Blame, Coins, EncryptionKey, Hash, Invalid, Message, Packet, Packets, Phase, Reason,
    Registration, ShuffleType, Signature, Signatures, Signed, Transaction, VerificationKey,
};

/// Frame magic bytes
pub const MAGIC: [u8; 8] = [0x42, 0xbc, 0xc3, 0x26, 0x69, 0x46, 0x78, 0x73];

/// Magic plus big-endian payload length
pub const HEADER_LEN: usize = 12;

/// Maximum payload size (10MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("bad frame magic")]
    BadMagic,

    #[error("length mismatch: header declares {declared} bytes, payload has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("frame carries no packet")]
    MissingPacket,
}

/// Frame an already-signed packet batch
pub fn encode_frame(packets: &Packets) -> Vec<u8> {
    let payload = packets.encode_to_vec();
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Validate a frame header, returning the declared payload length
pub fn decode_header(header: &[u8]) -> Result<usize, CodecError> {
    if header.len() < HEADER_LEN {
        return Err(CodecError::TooShort(header.len()));
    }
    if header[..8] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let declared = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if declared > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(declared));
    }
    Ok(declared)
}

/// Decode a complete frame into its packet batch
pub fn decode_frame(frame: &[u8]) -> Result<Packets, CodecError> {
    let declared = decode_header(frame)?;
    let payload = &frame[HEADER_LEN..];
    if payload.len() != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    decode_payload(payload)
}

/// Decode a frame payload, requiring at least one packet
pub fn decode_payload(payload: &[u8]) -> Result<Packets, CodecError> {
    let packets = Packets::decode(payload).map_err(|e| CodecError::Malformed(e.to_string()))?;
    match packets.packet.first() {
        Some(Signed {
            packet: Some(_), ..
        }) => Ok(packets),
        _ => Err(CodecError::MissingPacket),
    }
}

/// Sign a packet with the round's verification key
pub fn sign_packet(packet: Packet, key: &SecretKey) -> Signed {
    let text = STANDARD.encode(packet.encode_to_vec());
    let signature = sign_message(key, &text);
    Signed {
        packet: Some(packet),
        signature: Some(Signature {
            signature: signature.to_vec(),
        }),
    }
}

/// Verify a signed packet against the key it claims to come from
///
/// Packets without a sender key must also be unsigned; they are relay
/// notices and carry no player authority.
pub fn verify_signed(signed: &Signed, network: Network) -> Result<(), SignatureError> {
    let packet = signed.packet.as_ref().ok_or(SignatureError::InvalidFormat)?;
    let signature = signed
        .signature
        .as_ref()
        .map(|s| s.signature.as_slice())
        .filter(|s| !s.is_empty());

    match (packet.from_key_str(), signature) {
        (None, None) => Ok(()),
        (None, Some(_)) | (Some(_), None) => Err(SignatureError::InvalidFormat),
        (Some(from_key), Some(signature)) => {
            let claimed = parse_public_key(from_key)?;
            let text = STANDARD.encode(packet.encode_to_vec());
            verify_message(&text, signature, &claimed, network)
        }
    }
}

/// Sender fields stamped on every packet a round emits.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub session: Vec<u8>,
    pub number: u32,
    pub from_key: String,
}

impl PacketHeader {
    /// Multicast packet
    pub fn packet(&self, phase: Phase, message: Message) -> Packet {
        Packet {
            session: self.session.clone(),
            number: self.number,
            from_key: Some(VerificationKey {
                key: self.from_key.clone(),
            }),
            to_key: None,
            phase: phase as i32,
            message: Some(message),
            registration: None,
        }
    }

    /// Unicast packet addressed to `to_key`
    pub fn unicast(&self, to_key: &str, phase: Phase, message: Message) -> Packet {
        Packet {
            to_key: Some(VerificationKey {
                key: to_key.to_string(),
            }),
            ..self.packet(phase, message)
        }
    }
}

/// Sign and wrap packets into one batch
pub fn seal(packets: Vec<Packet>, key: &SecretKey) -> Packets {
    Packets {
        packet: packets.into_iter().map(|p| sign_packet(p, key)).collect(),
    }
}

/// Pool registration, the only packet sent before the relay assigns a session
pub fn registration(verification_key: &str, amount: u64, version: u64) -> Packets {
    let packet = Packet {
        from_key: Some(VerificationKey {
            key: verification_key.to_string(),
        }),
        registration: Some(Registration {
            amount,
            r#type: ShuffleType::Default as i32,
            version,
        }),
        ..Default::default()
    };
    Packets {
        packet: vec![Signed {
            packet: Some(packet),
            signature: None,
        }],
    }
}

/// Announcement of the coin entering the round
pub fn inputs_message(coin_public_key: &str, utxo: &str) -> Message {
    let mut message = Message::default();
    message.inputs.insert(
        coin_public_key.to_string(),
        Coins {
            coins: vec![utxo.to_string()],
        },
    );
    message
}

/// Change address plus the round encryption key
pub fn change_and_key_message(change_address: &str, encryption_key: &str) -> Message {
    Message {
        address: Some(Address {
            address: change_address.to_string(),
        }),
        key: Some(EncryptionKey {
            key: encryption_key.to_string(),
        }),
        ..Default::default()
    }
}

/// One packet per shuffle entry, in the given order
pub fn entry_messages(entries: &[String]) -> Vec<Message> {
    entries
        .iter()
        .map(|entry| Message {
            str: entry.clone(),
            ..Default::default()
        })
        .collect()
}

pub fn hash_message(hash: &[u8]) -> Message {
    Message {
        hash: Some(Hash {
            hash: hash.to_vec(),
        }),
        ..Default::default()
    }
}

/// Transaction input signatures keyed by `txid:vout`
pub fn signatures_message(signatures: &[(String, Vec<u8>)]) -> Message {
    Message {
        signatures: signatures
            .iter()
            .map(|(utxo, signature)| Signatures {
                utxo: utxo.clone(),
                signature: Some(Signature {
                    signature: signature.clone(),
                }),
            })
            .collect(),
        ..Default::default()
    }
}

/// Evidence attached to an outgoing accusation
#[derive(Debug, Clone, Default)]
pub struct BlameEvidence {
    pub invalid: Option<Vec<u8>>,
    pub transaction: Option<Vec<u8>>,
    pub packets: Option<Packets>,
}

pub fn blame_message(reason: Reason, accused: &str, evidence: BlameEvidence) -> Message {
    Message {
        blame: Some(Blame {
            reason: reason as i32,
            accused: Some(VerificationKey {
                key: accused.to_string(),
            }),
            key: None,
            transaction: evidence
                .transaction
                .map(|transaction| Transaction { transaction }),
            invalid: evidence.invalid.map(|invalid| Invalid { invalid }),
            packets: evidence.packets,
        }),
        ..Default::default()
    }
}
