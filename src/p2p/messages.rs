//! Wire message types exchanged with the relay
//!
//! The schema is protobuf. Field tags are part of the wire contract and must
//! not change; the structs are declared directly with `prost` derives.

use std::collections::BTreeMap;

/// Signed envelope around a single packet
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Signed {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<Packet>,
    #[prost(message, optional, tag = "2")]
    pub signature: Option<Signature>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
    #[prost(bytes = "vec", tag = "1")]
    pub session: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub number: u32,
    #[prost(message, optional, tag = "3")]
    pub from_key: Option<VerificationKey>,
    #[prost(message, optional, tag = "4")]
    pub to_key: Option<VerificationKey>,
    #[prost(enumeration = "Phase", tag = "5")]
    pub phase: i32,
    #[prost(message, optional, tag = "6")]
    pub message: Option<Message>,
    #[prost(message, optional, tag = "7")]
    pub registration: Option<Registration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Phase {
    None = 0,
    Announcement = 1,
    Shuffle = 2,
    Broadcast = 3,
    EquivocationCheck = 4,
    Signing = 5,
    VerificationAndSubmission = 6,
    Blame = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ShuffleType {
    Default = 0,
    Dust = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Coins {
    #[prost(string, repeated, tag = "1")]
    pub coins: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Signatures {
    #[prost(string, tag = "1")]
    pub utxo: String,
    #[prost(message, optional, tag = "2")]
    pub signature: Option<Signature>,
}

/// Protocol payload. Which fields are set determines the message type, see
/// [`classify`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(message, optional, tag = "1")]
    pub address: Option<Address>,
    #[prost(message, optional, tag = "2")]
    pub key: Option<EncryptionKey>,
    #[prost(message, optional, tag = "3")]
    pub hash: Option<Hash>,
    #[prost(message, repeated, tag = "4")]
    pub signatures: Vec<Signatures>,
    #[prost(string, tag = "5")]
    pub str: String,
    #[prost(message, optional, tag = "6")]
    pub blame: Option<Blame>,
    #[prost(btree_map = "string, message", tag = "7")]
    pub inputs: BTreeMap<String, Coins>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Address {
    #[prost(string, tag = "1")]
    pub address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Registration {
    #[prost(uint64, tag = "1")]
    pub amount: u64,
    #[prost(enumeration = "ShuffleType", tag = "2")]
    pub r#type: i32,
    #[prost(uint64, tag = "3")]
    pub version: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerificationKey {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptionKey {
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DecryptionKey {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub public: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hash {
    #[prost(bytes = "vec", tag = "1")]
    pub hash: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Signature {
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Transaction {
    #[prost(bytes = "vec", tag = "1")]
    pub transaction: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Invalid {
    #[prost(bytes = "vec", tag = "1")]
    pub invalid: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Blame {
    #[prost(enumeration = "Reason", tag = "1")]
    pub reason: i32,
    #[prost(message, optional, tag = "2")]
    pub accused: Option<VerificationKey>,
    #[prost(message, optional, tag = "3")]
    pub key: Option<DecryptionKey>,
    #[prost(message, optional, tag = "4")]
    pub transaction: Option<Transaction>,
    #[prost(message, optional, tag = "5")]
    pub invalid: Option<Invalid>,
    #[prost(message, optional, tag = "6")]
    pub packets: Option<Packets>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    ::prost::Enumeration,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(i32)]
pub enum Reason {
    InsufficientFunds = 0,
    DoubleSpend = 1,
    EquivocationFailure = 2,
    ShuffleFailure = 3,
    ShuffleAndEquivocationFailure = 4,
    InvalidSignature = 5,
    MissingOutput = 6,
    Liar = 7,
    InvalidFormat = 8,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Inputs {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(string, repeated, tag = "2")]
    pub coins: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packets {
    #[prost(message, repeated, tag = "1")]
    pub packet: Vec<Signed>,
}

impl Packet {
    /// Sender's verification key, if present and non-empty
    pub fn from_key_str(&self) -> Option<&str> {
        self.from_key
            .as_ref()
            .map(|k| k.key.as_str())
            .filter(|k| !k.is_empty())
    }

    /// Addressee's verification key, if this is a unicast packet
    pub fn to_key_str(&self) -> Option<&str> {
        self.to_key
            .as_ref()
            .map(|k| k.key.as_str())
            .filter(|k| !k.is_empty())
    }
}

/// Canonical classification of an inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PlayerCount,
    ServerGreeting,
    AnnouncementPhase,
    IncomingVerificationKeys,
    IncomingChangeAddress,
    IncomingEncryptedOutputs,
    FinalTransactionOutputs,
    IncomingEquivCheck,
    IncomingSignatures,
    Blame,
    Unknown,
}

/// Field paths that decide a packet's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Session,
    Number,
    FromKey,
    ToKey,
    Phase,
    Inputs,
    Address,
    EncryptionKey,
    Str,
    Hash,
    Signatures,
    Blame,
}

/// Ordered most-specific-first; the first complete match wins.
const CLASSIFICATION: &[(MessageType, &[Field])] = &[
    (
        MessageType::IncomingChangeAddress,
        &[
            Field::Session,
            Field::Number,
            Field::FromKey,
            Field::Address,
            Field::EncryptionKey,
            Field::Phase,
        ],
    ),
    (
        MessageType::IncomingEncryptedOutputs,
        &[
            Field::Session,
            Field::Number,
            Field::FromKey,
            Field::ToKey,
            Field::Str,
            Field::Phase,
        ],
    ),
    (
        MessageType::Blame,
        &[Field::Session, Field::Number, Field::FromKey, Field::Blame, Field::Phase],
    ),
    (
        MessageType::IncomingEquivCheck,
        &[Field::Session, Field::Number, Field::FromKey, Field::Hash, Field::Phase],
    ),
    (
        MessageType::IncomingSignatures,
        &[
            Field::Session,
            Field::Number,
            Field::FromKey,
            Field::Signatures,
            Field::Phase,
        ],
    ),
    (
        MessageType::FinalTransactionOutputs,
        &[Field::Session, Field::Number, Field::FromKey, Field::Str, Field::Phase],
    ),
    (
        MessageType::IncomingVerificationKeys,
        &[Field::Session, Field::Number, Field::FromKey, Field::Inputs],
    ),
    (MessageType::AnnouncementPhase, &[Field::Number, Field::Phase]),
    (MessageType::ServerGreeting, &[Field::Session, Field::Number]),
    (MessageType::PlayerCount, &[Field::Number]),
];

fn is_present(packet: &Packet, field: Field) -> bool {
    let message = packet.message.as_ref();
    match field {
        Field::Session => !packet.session.is_empty(),
        Field::Number => packet.number != 0,
        Field::FromKey => packet.from_key_str().is_some(),
        Field::ToKey => packet.to_key_str().is_some(),
        Field::Phase => packet.phase != 0,
        Field::Inputs => message.is_some_and(|m| !m.inputs.is_empty()),
        Field::Address => message
            .and_then(|m| m.address.as_ref())
            .is_some_and(|a| !a.address.is_empty()),
        Field::EncryptionKey => message
            .and_then(|m| m.key.as_ref())
            .is_some_and(|k| !k.key.is_empty()),
        Field::Str => message.is_some_and(|m| !m.str.is_empty()),
        Field::Hash => message
            .and_then(|m| m.hash.as_ref())
            .is_some_and(|h| !h.hash.is_empty()),
        Field::Signatures => message.is_some_and(|m| !m.signatures.is_empty()),
        Field::Blame => message.is_some_and(|m| m.blame.is_some()),
    }
}

/// Classify a packet by the set of fields it carries
pub fn classify(packet: &Packet) -> MessageType {
    CLASSIFICATION
        .iter()
        .find(|(_, fields)| fields.iter().all(|f| is_present(packet, *f)))
        .map(|(kind, _)| *kind)
        .unwrap_or(MessageType::Unknown)
}

/// Typed content of an inbound batch, one variant per message type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PlayerCount(u32),
    ServerGreeting { session: Vec<u8>, number: u32 },
    AnnouncementPhase { players: u32, phase: Phase },
    Inputs(BTreeMap<String, Coins>),
    ChangeAddress { address: String, encryption_key: String },
    /// Onion layers addressed to us, one per packet
    EncryptedOutputs(Vec<String>),
    /// Plaintext output addresses in broadcast order
    FinalOutputs(Vec<String>),
    EquivocationHash(Vec<u8>),
    Signatures(Vec<Signatures>),
    Blame(Blame),
    Unknown,
}

impl Payload {
    /// Classify a batch by its first packet and extract the typed content
    pub fn from_packets(packets: &Packets) -> Self {
        let Some(packet) = packets.packet.first().and_then(|s| s.packet.as_ref()) else {
            return Payload::Unknown;
        };
        let message = packet.message.clone().unwrap_or_default();
        let strings = || {
            packets
                .packet
                .iter()
                .map(|s| {
                    s.packet
                        .as_ref()
                        .and_then(|p| p.message.as_ref())
                        .map(|m| m.str.clone())
                        .unwrap_or_default()
                })
                .collect::<Vec<String>>()
        };

        match classify(packet) {
            MessageType::PlayerCount => Payload::PlayerCount(packet.number),
            MessageType::ServerGreeting => Payload::ServerGreeting {
                session: packet.session.clone(),
                number: packet.number,
            },
            MessageType::AnnouncementPhase => Payload::AnnouncementPhase {
                players: packet.number,
                phase: packet.phase(),
            },
            MessageType::IncomingVerificationKeys => Payload::Inputs(message.inputs),
            MessageType::IncomingChangeAddress => Payload::ChangeAddress {
                address: message.address.map(|a| a.address).unwrap_or_default(),
                encryption_key: message.key.map(|k| k.key).unwrap_or_default(),
            },
            MessageType::IncomingEncryptedOutputs => Payload::EncryptedOutputs(strings()),
            MessageType::FinalTransactionOutputs => Payload::FinalOutputs(strings()),
            MessageType::IncomingEquivCheck => {
                Payload::EquivocationHash(message.hash.map(|h| h.hash).unwrap_or_default())
            }
            MessageType::IncomingSignatures => Payload::Signatures(message.signatures),
            MessageType::Blame => message.blame.map_or(Payload::Unknown, Payload::Blame),
            MessageType::Unknown => Payload::Unknown,
        }
    }

    /// Notices generated by the relay itself rather than a player
    pub fn is_relay_notice(&self) -> bool {
        matches!(
            self,
            Payload::PlayerCount(_) | Payload::ServerGreeting { .. } | Payload::AnnouncementPhase { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_packet() -> Packet {
        Packet {
            session: b"session".to_vec(),
            number: 2,
            from_key: Some(VerificationKey { key: "02ab".into() }),
            phase: Phase::Announcement as i32,
            ..Default::default()
        }
    }

    #[test]
    fn test_relay_messages() {
        let count = Packet {
            number: 3,
            ..Default::default()
        };
        assert_eq!(classify(&count), MessageType::PlayerCount);

        let greeting = Packet {
            session: b"abc".to_vec(),
            number: 1,
            ..Default::default()
        };
        assert_eq!(classify(&greeting), MessageType::ServerGreeting);

        let announcement = Packet {
            number: 3,
            phase: Phase::Announcement as i32,
            ..Default::default()
        };
        assert_eq!(classify(&announcement), MessageType::AnnouncementPhase);
    }

    #[test]
    fn test_zero_number_counts_as_absent() {
        let packet = Packet {
            session: b"abc".to_vec(),
            ..Default::default()
        };
        assert_eq!(classify(&packet), MessageType::Unknown);
    }

    #[test]
    fn test_protocol_messages() {
        let mut inputs = base_packet();
        let mut message = Message::default();
        message.inputs.insert(
            "02ab".into(),
            Coins {
                coins: vec!["00:0".into()],
            },
        );
        inputs.message = Some(message);
        assert_eq!(classify(&inputs), MessageType::IncomingVerificationKeys);

        let mut change = base_packet();
        change.message = Some(Message {
            address: Some(Address {
                address: "1abc".into(),
            }),
            key: Some(EncryptionKey { key: "03cd".into() }),
            ..Default::default()
        });
        assert_eq!(classify(&change), MessageType::IncomingChangeAddress);

        let mut encrypted = base_packet();
        encrypted.phase = Phase::Shuffle as i32;
        encrypted.to_key = Some(VerificationKey { key: "03ef".into() });
        encrypted.message = Some(Message {
            str: "QklFMQ==".into(),
            ..Default::default()
        });
        assert_eq!(classify(&encrypted), MessageType::IncomingEncryptedOutputs);

        encrypted.to_key = None;
        encrypted.phase = Phase::Broadcast as i32;
        assert_eq!(classify(&encrypted), MessageType::FinalTransactionOutputs);

        let mut hash = base_packet();
        hash.message = Some(Message {
            hash: Some(Hash {
                hash: vec![1, 2, 3],
            }),
            ..Default::default()
        });
        assert_eq!(classify(&hash), MessageType::IncomingEquivCheck);

        let mut signatures = base_packet();
        signatures.message = Some(Message {
            signatures: vec![Signatures {
                utxo: "00:0".into(),
                signature: None,
            }],
            ..Default::default()
        });
        assert_eq!(classify(&signatures), MessageType::IncomingSignatures);

        let mut blame = base_packet();
        blame.phase = Phase::Blame as i32;
        blame.message = Some(Message {
            blame: Some(Blame {
                reason: Reason::Liar as i32,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(classify(&blame), MessageType::Blame);
    }

    #[test]
    fn test_payload_extraction() {
        let wrap = |packets: Vec<Packet>| Packets {
            packet: packets
                .into_iter()
                .map(|p| Signed {
                    packet: Some(p),
                    signature: None,
                })
                .collect(),
        };

        let outputs: Vec<Packet> = ["1first", "1second"]
            .iter()
            .map(|s| {
                let mut packet = base_packet();
                packet.phase = Phase::Broadcast as i32;
                packet.message = Some(Message {
                    str: s.to_string(),
                    ..Default::default()
                });
                packet
            })
            .collect();
        assert_eq!(
            Payload::from_packets(&wrap(outputs)),
            Payload::FinalOutputs(vec!["1first".into(), "1second".into()])
        );

        let greeting = Packet {
            session: b"abc".to_vec(),
            number: 4,
            ..Default::default()
        };
        let payload = Payload::from_packets(&wrap(vec![greeting]));
        assert!(payload.is_relay_notice());
        assert_eq!(
            payload,
            Payload::ServerGreeting {
                session: b"abc".to_vec(),
                number: 4
            }
        );

        assert_eq!(Payload::from_packets(&Packets::default()), Payload::Unknown);
    }

    #[test]
    fn test_phase_and_reason_tags() {
        assert_eq!(Phase::VerificationAndSubmission as i32, 6);
        assert_eq!(Phase::try_from(7), Ok(Phase::Blame));
        assert_eq!(Reason::InvalidFormat as i32, 8);
        assert_eq!(Reason::try_from(2), Ok(Reason::EquivocationFailure));
    }
}
