//! Round engine that drives one coin through a shuffle.
//!
//! A [`Round`] consumes [`ChannelEvent`]s one at a time and answers each with
//! a [`Step`]: the signed packet batches to send and, at most once per round,
//! the terminal [`RoundOutcome`]. The engine never touches sockets, so it can
//! be driven by the TCP channel or directly by tests.
//!
//! # Protocol Phases
//!
//! 1. **Registration**: register with the pool; the relay answers with our
//!    player number and session
//! 2. **Announcement**: every player broadcasts its input coin, then its change
//!    address and one-time encryption key
//! 3. **Shuffle**: in player order, each player strips one encryption layer
//!    from the set it receives, adds its own layered output, shuffles and
//!    forwards; the last player broadcasts the plaintext set
//! 4. **Equivocation check**: everyone broadcasts a hash over the final set and
//!    the encryption keys; any divergence is blamed
//! 5. **Verification and submission**: the shared transaction is signed input
//!    by input and submitted once complete
//!
//! Any violation ends in a blame packet naming the culprit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::consensus::encode::{serialize, serialize_hex};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{Address, Amount, Network, OutPoint, Txid};
use prost::Message as _;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::coin::{
    legacy_address, parse_address, parse_outpoint, Coin, CoinLookup, RoundHooks, ServiceError,
    TransactionBroadcaster,
};
use crate::encryption::{self, EncryptionError};
use crate::error::ShuffleError;
use crate::security::{constant_time_eq, RoundKeys};
use crate::transaction::{Participant, ShuffleTransaction, TransactionError, DUST_THRESHOLD};

use super::codec::{self, BlameEvidence, PacketHeader};
use super::crypto_utils::parse_public_key;
use super::messages::{
    classify, Blame, Coins, Packet, Packets, Payload, Phase, Reason, Signatures, Signed,
};
use super::transport::ChannelEvent;

/// Protocol version announced at registration
pub const PROTOCOL_VERSION: u64 = 300;

/// Per-player fee deducted from every input
pub const DEFAULT_SHUFFLE_FEE: Amount = Amount::from_sat(270);

/// Upper bound on building the shared transaction
pub const TX_BUILD_WAIT: Duration = Duration::from_secs(15);

/// Where failed-round reports land unless the caller picks a directory
pub fn default_diagnostics_dir() -> PathBuf {
    std::env::temp_dir().join("coinshuffle-round")
}

/// Runtime configuration for a round.
///
/// `diagnostics_dir` defaults to [`default_diagnostics_dir`]; set it to `None`
/// to skip failure reports.
#[derive(Debug, Clone)]
pub struct RoundConfig {
    pub relay_addr: String,
    pub pool_amount: Amount,
    pub protocol_version: u64,
    pub fee: Amount,
    pub fixed_shuffle_amount: Option<Amount>,
    pub network: Network,
    pub diagnostics_dir: Option<PathBuf>,
}

impl RoundConfig {
    pub fn new(relay_addr: impl Into<String>, pool_amount: Amount) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            pool_amount,
            protocol_version: PROTOCOL_VERSION,
            fee: DEFAULT_SHUFFLE_FEE,
            fixed_shuffle_amount: None,
            network: Network::Bitcoin,
            diagnostics_dir: Some(default_diagnostics_dir()),
        }
    }

    /// Smallest input value a player may bring
    pub fn required_input(&self) -> Amount {
        self.pool_amount + self.fee
    }
}

pub fn validate_config(config: &RoundConfig) -> Result<(), ShuffleError> {
    if config.relay_addr.trim().is_empty() {
        return Err(ShuffleError::InvalidParameter(
            "relay address is required".to_string(),
        ));
    }
    if config.pool_amount == Amount::ZERO {
        return Err(ShuffleError::InvalidParameter(
            "pool amount must be positive".to_string(),
        ));
    }
    if config.protocol_version == 0 {
        return Err(ShuffleError::InvalidParameter(
            "protocol version must be set".to_string(),
        ));
    }
    if let Some(amount) = config.fixed_shuffle_amount {
        if amount < DUST_THRESHOLD {
            return Err(ShuffleError::InvalidParameter(format!(
                "fixed shuffle amount {} is below dust",
                amount
            )));
        }
    }
    Ok(())
}

/// External services a round calls out to.
#[derive(Clone)]
pub struct RoundServices {
    pub lookup: Arc<dyn CoinLookup>,
    pub broadcaster: Arc<dyn TransactionBroadcaster>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoundPhase {
    Registration,
    Announcement,
    Shuffle,
    Broadcast,
    EquivocationCheck,
    VerificationAndSubmission,
    Blame,
    Succeeded,
    Failed,
}

/// A participant as learned from its verified announcements.
#[derive(Debug, Clone)]
pub struct Player {
    pub number: u32,
    pub session: Vec<u8>,
    pub verification_key: String,
    pub encryption_key: Option<PublicKey>,
    pub coin_key: PublicKey,
    pub outpoint: OutPoint,
    pub value: Amount,
    pub change_address: Option<Address>,
    pub is_me: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// We accused another player
    Blame(Reason),
    /// Another player accused us
    BlamedByPeer(Reason),
    CommsDisconnect,
    CommsError,
    Exception,
    Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundFailure {
    pub kind: FailureKind,
    pub accused: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Success { txid: Txid },
    Failure(RoundFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlameRecord {
    pub from: String,
    pub reason: Reason,
    pub accused: String,
}

/// Errors that abort a round outright.
#[derive(thiserror::Error, Debug)]
pub enum RoundError {
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("setup error: {0}")]
    Setup(#[from] ShuffleError),
    #[error("own coin rejected: {0}")]
    OwnCoin(String),
    #[error("transaction construction timed out")]
    Timeout,
    #[error("inconsistent round state: {0}")]
    State(String),
}

/// Result of handling one event.
#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<Packets>,
    pub outcome: Option<RoundOutcome>,
}

enum BuildOutcome {
    Ready(ShuffleTransaction),
    Spent(String),
}

pub struct Round {
    config: RoundConfig,
    coin: Coin,
    keys: RoundKeys,
    services: RoundServices,
    verification_key: String,
    encryption_key: PublicKey,
    change_address: Address,
    shuffled_address: Address,

    phase: RoundPhase,
    session: Vec<u8>,
    number: u32,
    pool_size: u32,
    expected_players: Option<u32>,
    players: BTreeMap<u32, Player>,
    sessions: HashMap<Vec<u8>, u32>,
    announced: bool,
    final_outputs: Option<Vec<String>>,
    equivocation_hash: Option<Vec<u8>>,
    hashes: BTreeMap<u32, Vec<u8>>,
    equivocation_reported: BTreeSet<u32>,
    transaction: Option<ShuffleTransaction>,
    pending_signatures: Vec<(u32, Vec<Signatures>)>,
    blames: Vec<BlameRecord>,
    outcome: Option<RoundOutcome>,
}

impl Round {
    /// Create a round with freshly generated one-time keys
    pub fn new(
        config: RoundConfig,
        coin: Coin,
        hooks: &RoundHooks,
        services: RoundServices,
    ) -> Result<Self, ShuffleError> {
        Self::with_keys(config, coin, hooks, services, RoundKeys::generate())
    }

    /// Create a round with caller-supplied one-time keys
    pub fn with_keys(
        config: RoundConfig,
        coin: Coin,
        hooks: &RoundHooks,
        services: RoundServices,
        keys: RoundKeys,
    ) -> Result<Self, ShuffleError> {
        validate_config(&config)?;

        let change_address = parse_address(&hooks.next_change_address()?, config.network)?;
        let shuffled_address = parse_address(&hooks.next_shuffled_address()?, config.network)?;

        let secp = Secp256k1::signing_only();
        let verification_key = keys.verification.public_key(&secp).to_string();
        let encryption_key = keys.encryption.public_key(&secp);

        Ok(Self {
            config,
            coin,
            keys,
            services,
            verification_key,
            encryption_key,
            change_address,
            shuffled_address,
            phase: RoundPhase::Registration,
            session: Vec::new(),
            number: 0,
            pool_size: 0,
            expected_players: None,
            players: BTreeMap::new(),
            sessions: HashMap::new(),
            announced: false,
            final_outputs: None,
            equivocation_hash: None,
            hashes: BTreeMap::new(),
            equivocation_reported: BTreeSet::new(),
            transaction: None,
            pending_signatures: Vec::new(),
            blames: Vec::new(),
            outcome: None,
        })
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn session(&self) -> &[u8] {
        &self.session
    }

    pub fn verification_key(&self) -> &str {
        &self.verification_key
    }

    pub fn encryption_key(&self) -> &PublicKey {
        &self.encryption_key
    }

    pub fn shuffled_address(&self) -> &Address {
        &self.shuffled_address
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn final_outputs(&self) -> Option<&[String]> {
        self.final_outputs.as_deref()
    }

    pub fn equivocation_hash(&self) -> Option<&[u8]> {
        self.equivocation_hash.as_deref()
    }

    pub fn blames(&self) -> &[BlameRecord] {
        &self.blames
    }

    pub fn outcome(&self) -> Option<&RoundOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Process one channel event.
    ///
    /// Events after the terminal outcome are ignored.
    pub async fn handle(&mut self, event: ChannelEvent) -> Step {
        let mut step = Step::default();
        if self.is_finished() {
            return step;
        }
        if let Err(e) = self.dispatch(event, &mut step).await {
            error!(player = self.number, "round aborted: {e}");
            self.fail(&mut step, FailureKind::Exception, None, e.to_string());
        }
        step
    }

    async fn dispatch(&mut self, event: ChannelEvent, step: &mut Step) -> Result<(), RoundError> {
        match event {
            ChannelEvent::Connected => {
                info!(
                    amount = self.config.pool_amount.to_sat(),
                    "connected to relay, registering"
                );
                step.outbound.push(codec::registration(
                    &self.verification_key,
                    self.config.pool_amount.to_sat(),
                    self.config.protocol_version,
                ));
                Ok(())
            }
            ChannelEvent::Message(packets) => self.on_packets(packets, step).await,
            ChannelEvent::ProtocolViolation {
                reason,
                accused,
                invalid,
            } => self.on_violation(reason, accused, invalid, step),
            ChannelEvent::Disconnected => {
                self.fail(
                    step,
                    FailureKind::CommsDisconnect,
                    None,
                    "relay closed the connection".to_string(),
                );
                Ok(())
            }
            ChannelEvent::ConnectError(reason) => {
                self.fail(step, FailureKind::CommsError, None, reason);
                Ok(())
            }
        }
    }

    async fn on_packets(&mut self, packets: Packets, step: &mut Step) -> Result<(), RoundError> {
        let Some(packet) = packets.packet.first().and_then(|s| s.packet.clone()) else {
            warn!("message without packet ignored");
            return Ok(());
        };
        debug!(
            kind = ?classify(&packet),
            number = packet.number,
            phase = packet.phase,
            "inbound message"
        );

        let payload = Payload::from_packets(&packets);
        if payload.is_relay_notice() {
            if packet.from_key_str().is_some() {
                warn!(number = packet.number, "relay notice carrying a sender key, ignoring");
                return Ok(());
            }
        } else if payload != Payload::Unknown && self.session.is_empty() {
            warn!("player message before registration completed, ignoring");
            return Ok(());
        }

        match payload {
            Payload::PlayerCount(count) => {
                self.pool_size = count;
                debug!(pool_size = count, "player count updated");
                Ok(())
            }
            Payload::ServerGreeting { session, number } => {
                self.on_greeting(session, number, step).await
            }
            Payload::AnnouncementPhase { players, phase } => {
                self.on_announcement_phase(players, phase, step).await
            }
            Payload::Inputs(inputs) => self.on_inputs(&packet, &inputs, step).await,
            Payload::ChangeAddress {
                address,
                encryption_key,
            } => {
                self.on_change_address(&packet, &address, &encryption_key, step)
                    .await
            }
            Payload::EncryptedOutputs(layers) => {
                self.on_encrypted_outputs(&packets, layers, step).await
            }
            Payload::FinalOutputs(entries) => self.on_final_outputs(&packets, entries, step).await,
            Payload::EquivocationHash(hash) => self.on_equivocation_hash(&packet, hash, step).await,
            Payload::Signatures(entries) => self.on_signatures(&packet, entries, step).await,
            Payload::Blame(blame) => {
                self.on_blame(&packet, &blame, step);
                Ok(())
            }
            Payload::Unknown => {
                debug!("unclassified message ignored");
                Ok(())
            }
        }
    }

    async fn on_greeting(
        &mut self,
        session: Vec<u8>,
        number: u32,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        if !self.session.is_empty() {
            debug!("duplicate greeting ignored");
            return Ok(());
        }
        self.session = session;
        self.number = number;
        info!(
            player = self.number,
            session = %hex::encode(&self.session),
            "joined pool"
        );

        let details = self
            .services
            .lookup
            .coin(&self.coin.outpoint)
            .await?
            .ok_or_else(|| RoundError::OwnCoin(format!("{} not found", self.coin.outpoint)))?;
        if details.spent {
            return Err(RoundError::OwnCoin(format!("{} already spent", self.coin.outpoint)));
        }
        if details.value < self.config.required_input() {
            return Err(RoundError::OwnCoin(format!(
                "{} holds {}, need {}",
                self.coin.outpoint,
                details.value,
                self.config.required_input()
            )));
        }

        let coin_key = self.coin.public_key();
        self.insert_player(Player {
            number: self.number,
            session: self.session.clone(),
            verification_key: self.verification_key.clone(),
            encryption_key: Some(self.encryption_key),
            coin_key,
            outpoint: self.coin.outpoint,
            value: details.value,
            change_address: Some(self.change_address.clone()),
            is_me: true,
        });
        self.phase = RoundPhase::Announcement;

        let message = codec::inputs_message(&coin_key.to_string(), &self.coin.outpoint.to_string());
        let packet = self.header().packet(Phase::Announcement, message);
        self.send(step, vec![packet]);

        self.maybe_announce(step, false);
        self.maybe_start_shuffle(step).await
    }

    async fn on_announcement_phase(
        &mut self,
        players: u32,
        phase: Phase,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        if phase != Phase::Announcement {
            warn!(?phase, "unsupported relay phase notice");
            return Ok(());
        }
        self.expected_players = Some(players);
        info!(players, "announcement phase started");

        self.maybe_announce(step, false);
        self.maybe_start_shuffle(step).await
    }

    async fn on_inputs(
        &mut self,
        packet: &Packet,
        inputs: &BTreeMap<String, Coins>,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        let from_key = packet.from_key_str().unwrap_or_default().to_string();

        if let Some(existing) = self.sessions.get(&packet.session) {
            if self.players[existing].verification_key != from_key {
                warn!(player = packet.number, "session reused by another key, ignoring");
            }
            return Ok(());
        }
        if self.players.contains_key(&packet.number) {
            warn!(player = packet.number, "player number already taken, ignoring");
            return Ok(());
        }
        if self.players.values().any(|p| p.verification_key == from_key) {
            warn!(player = packet.number, "verification key already registered, ignoring");
            return Ok(());
        }
        if let Some(expected) = self.expected_players {
            if self.players.len() as u32 >= expected {
                warn!(player = packet.number, "pool already complete, ignoring");
                return Ok(());
            }
        }

        let Some((coin_key, outpoint)) = parse_inputs(inputs) else {
            return self.blame(step, Reason::InvalidFormat, &from_key, BlameEvidence::default(), false);
        };

        let details = match self.services.lookup.coin(&outpoint).await? {
            Some(details) => details,
            None => {
                return self.blame(
                    step,
                    Reason::InsufficientFunds,
                    &from_key,
                    BlameEvidence::default(),
                    false,
                )
            }
        };
        if details.spent {
            return self.blame(step, Reason::DoubleSpend, &from_key, BlameEvidence::default(), false);
        }
        if details.script_pubkey != legacy_address(&coin_key, self.config.network).script_pubkey() {
            return self.blame(step, Reason::Liar, &from_key, BlameEvidence::default(), false);
        }
        if details.value < self.config.required_input() {
            return self.blame(
                step,
                Reason::InsufficientFunds,
                &from_key,
                BlameEvidence::default(),
                false,
            );
        }

        info!(player = packet.number, utxo = %outpoint, "player registered");
        self.insert_player(Player {
            number: packet.number,
            session: packet.session.clone(),
            verification_key: from_key,
            encryption_key: None,
            coin_key,
            outpoint,
            value: details.value,
            change_address: None,
            is_me: false,
        });

        self.maybe_announce(step, false);
        self.maybe_start_shuffle(step).await
    }

    async fn on_change_address(
        &mut self,
        packet: &Packet,
        address: &str,
        key: &str,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        let Some(sender) = self.sender(packet) else {
            return Ok(());
        };
        if self.players[&sender].is_me {
            return Ok(());
        }
        let sender_key = self.players[&sender].verification_key.clone();

        let (change, encryption_key) =
            match (parse_address(address, self.config.network), parse_public_key(key)) {
                (Ok(change), Ok(encryption_key)) => (change, encryption_key),
                _ => {
                    return self.blame(
                        step,
                        Reason::InvalidFormat,
                        &sender_key,
                        BlameEvidence::default(),
                        false,
                    )
                }
            };

        let player = self
            .players
            .get_mut(&sender)
            .ok_or_else(|| RoundError::State("sender vanished".to_string()))?;
        let conflicting = player.encryption_key.is_some_and(|k| k != encryption_key)
            || player.change_address.as_ref().is_some_and(|a| *a != change);
        if conflicting {
            return self.blame(step, Reason::Liar, &sender_key, BlameEvidence::default(), false);
        }
        player.encryption_key = Some(encryption_key);
        player.change_address = Some(change);
        debug!(player = sender, "change address and encryption key received");

        self.maybe_announce(step, true);
        self.maybe_start_shuffle(step).await
    }

    async fn on_encrypted_outputs(
        &mut self,
        packets: &Packets,
        layers: Vec<String>,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        let Some(first) = packets.packet.first().and_then(|s| s.packet.as_ref()) else {
            return Ok(());
        };
        if first.to_key_str() != Some(self.verification_key.as_str()) {
            debug!("encrypted outputs addressed to another player");
            return Ok(());
        }
        let Some(sender) = self.sender(first) else {
            return Ok(());
        };
        let sender_key = self.players[&sender].verification_key.clone();

        if self.phase == RoundPhase::Announcement {
            self.maybe_start_shuffle(step).await?;
        }
        if self.phase != RoundPhase::Shuffle {
            warn!(player = sender, phase = ?self.phase, "encrypted outputs out of phase");
            return Ok(());
        }
        if Some(sender) != self.predecessor() {
            return self.blame(step, Reason::Liar, &sender_key, BlameEvidence::default(), false);
        }

        let mut entries = Vec::with_capacity(layers.len());
        for (signed, layer) in packets.packet.iter().zip(&layers) {
            let addressed = signed.packet.as_ref().is_some_and(|p| {
                p.from_key_str() == Some(sender_key.as_str())
                    && p.to_key_str() == Some(self.verification_key.as_str())
            });
            if !addressed {
                return self.blame(step, Reason::Liar, &sender_key, evidence_of(signed), false);
            }
            let stripped = encryption::decrypt(layer, self.keys.encryption.expose_secret())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match stripped {
                Some(entry) => entries.push(entry),
                None => {
                    return self.blame(
                        step,
                        Reason::InvalidFormat,
                        &sender_key,
                        evidence_of(signed),
                        false,
                    )
                }
            }
        }

        let expected = self.players.range(..self.number).count();
        if entries.len() != expected {
            return self.blame(
                step,
                Reason::MissingOutput,
                &sender_key,
                BlameEvidence::default(),
                false,
            );
        }
        debug!(entries = entries.len(), "stripped one layer from shuffle set");
        self.shuffle_and_forward(entries, step).await
    }

    async fn shuffle_and_forward(
        &mut self,
        mut entries: Vec<String>,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        let later = self
            .players
            .range((Excluded(self.number), Unbounded))
            .map(|(_, p)| {
                p.encryption_key
                    .map(|key| (p.verification_key.clone(), key))
                    .ok_or_else(|| RoundError::State(format!("player {} has no key", p.number)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Innermost layer belongs to the last player, outermost to our successor.
        let mut layered = self.shuffled_address.to_string();
        for (_, key) in later.iter().rev() {
            layered = encryption::encrypt(layered.as_bytes(), key)?;
        }
        entries.push(layered);
        entries.shuffle(&mut rand::thread_rng());

        let distinct: HashSet<&String> = entries.iter().collect();
        if distinct.len() != entries.len() {
            return match self.predecessor_key() {
                Some(key) => {
                    self.blame(step, Reason::MissingOutput, &key, BlameEvidence::default(), false)
                }
                None => Err(RoundError::State("duplicate shuffle entries".to_string())),
            };
        }

        let header = self.header();
        match later.first() {
            Some((next, _)) => {
                let packets = codec::entry_messages(&entries)
                    .into_iter()
                    .map(|m| header.unicast(next, Phase::Shuffle, m))
                    .collect();
                self.send(step, packets);
                self.phase = RoundPhase::Broadcast;
                info!(entries = entries.len(), "forwarded shuffle set");
                Ok(())
            }
            None => {
                if entries
                    .iter()
                    .any(|e| parse_address(e, self.config.network).is_err())
                {
                    return match self.predecessor_key() {
                        Some(key) => self.blame(
                            step,
                            Reason::InvalidFormat,
                            &key,
                            BlameEvidence::default(),
                            false,
                        ),
                        None => Err(RoundError::State("own address failed to parse".to_string())),
                    };
                }
                let packets = codec::entry_messages(&entries)
                    .into_iter()
                    .map(|m| header.packet(Phase::Broadcast, m))
                    .collect();
                self.send(step, packets);
                info!(outputs = entries.len(), "broadcast final outputs");
                self.accept_final_outputs(entries, step).await
            }
        }
    }

    async fn on_final_outputs(
        &mut self,
        packets: &Packets,
        entries: Vec<String>,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        let Some(first) = packets.packet.first().and_then(|s| s.packet.as_ref()) else {
            return Ok(());
        };
        let Some(sender) = self.sender(first) else {
            return Ok(());
        };
        if self.final_outputs.is_some() {
            debug!(player = sender, "final outputs already known");
            return Ok(());
        }
        let sender_key = self.players[&sender].verification_key.clone();
        if Some(sender) != self.last_player() {
            return self.blame(step, Reason::Liar, &sender_key, BlameEvidence::default(), false);
        }
        if self.phase != RoundPhase::Broadcast {
            warn!(player = sender, phase = ?self.phase, "final outputs out of phase");
            return Ok(());
        }

        for signed in &packets.packet {
            let from = signed.packet.as_ref().and_then(|p| p.from_key_str());
            if from != Some(sender_key.as_str()) {
                return self.blame(step, Reason::Liar, &sender_key, evidence_of(signed), false);
            }
        }
        self.accept_final_outputs(entries, step).await
    }

    async fn accept_final_outputs(
        &mut self,
        entries: Vec<String>,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        let broadcaster = self
            .last_player()
            .and_then(|n| self.players.get(&n))
            .map(|p| (p.is_me, p.verification_key.clone()))
            .ok_or_else(|| RoundError::State("no players".to_string()))?;

        let parsed: Result<Vec<Address>, _> = entries
            .iter()
            .map(|e| parse_address(e, self.config.network))
            .collect();
        let reason = match parsed {
            Err(_) => Some(Reason::InvalidFormat),
            Ok(_) if entries.len() != self.players.len() => Some(Reason::MissingOutput),
            Ok(addresses) if !addresses.contains(&self.shuffled_address) => {
                Some(Reason::MissingOutput)
            }
            Ok(_) => None,
        };
        if let Some(reason) = reason {
            if broadcaster.0 {
                return Err(RoundError::State("own broadcast is inconsistent".to_string()));
            }
            return self.blame(step, reason, &broadcaster.1, BlameEvidence::default(), false);
        }

        let keys: Vec<String> = self
            .players
            .values()
            .filter_map(|p| p.encryption_key.map(|k| k.to_string()))
            .collect();
        let hash = equivocation_hash(&entries, &keys);
        info!(hash = %hex::encode(&hash), "final outputs accepted, checking for equivocation");

        self.final_outputs = Some(entries);
        self.equivocation_hash = Some(hash.clone());
        self.hashes.insert(self.number, hash.clone());
        self.phase = RoundPhase::EquivocationCheck;

        let packet = self
            .header()
            .packet(Phase::EquivocationCheck, codec::hash_message(&hash));
        self.send(step, vec![packet]);

        self.check_equivocation(step).await
    }

    async fn on_equivocation_hash(
        &mut self,
        packet: &Packet,
        hash: Vec<u8>,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        let Some(sender) = self.sender(packet) else {
            return Ok(());
        };

        match self.hashes.get(&sender) {
            Some(existing) if *existing == hash => return Ok(()),
            Some(_) => {
                let key = self.players[&sender].verification_key.clone();
                return self.blame(step, Reason::Liar, &key, BlameEvidence::default(), false);
            }
            None => {
                self.hashes.insert(sender, hash);
            }
        }
        self.check_equivocation(step).await
    }

    async fn check_equivocation(&mut self, step: &mut Step) -> Result<(), RoundError> {
        if self.phase != RoundPhase::EquivocationCheck {
            return Ok(());
        }
        let Some(mine) = self.equivocation_hash.clone() else {
            return Ok(());
        };

        let divergent: Vec<(u32, String)> = self
            .players
            .iter()
            .filter(|(number, _)| !self.equivocation_reported.contains(*number))
            .filter(|(number, _)| {
                self.hashes
                    .get(*number)
                    .is_some_and(|theirs| !constant_time_eq(theirs, &mine))
            })
            .map(|(number, p)| (*number, p.verification_key.clone()))
            .collect();
        for (number, key) in divergent {
            warn!(player = number, "equivocation hash mismatch");
            self.equivocation_reported.insert(number);
            self.blame(
                step,
                Reason::EquivocationFailure,
                &key,
                BlameEvidence::default(),
                true,
            )?;
        }

        if !self.players.keys().all(|n| self.hashes.contains_key(n)) {
            return Ok(());
        }
        if let Some(first) = self.equivocation_reported.iter().next() {
            let accused = self.players.get(first).map(|p| p.verification_key.clone());
            self.fail(
                step,
                FailureKind::Blame(Reason::EquivocationFailure),
                accused,
                format!(
                    "{} players disagree on the final outputs",
                    self.equivocation_reported.len()
                ),
            );
            return Ok(());
        }

        self.phase = RoundPhase::VerificationAndSubmission;
        info!("equivocation check passed");

        if self.first_player() == Some(self.number) {
            self.ensure_transaction(step).await?;
            if self.is_finished() {
                return Ok(());
            }
            self.sign_own_input(step)?;
        }

        for (sender, entries) in std::mem::take(&mut self.pending_signatures) {
            if self.is_finished() {
                return Ok(());
            }
            self.apply_signatures(sender, entries, step).await?;
        }
        self.try_submit(step).await
    }

    async fn on_signatures(
        &mut self,
        packet: &Packet,
        entries: Vec<Signatures>,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        let Some(sender) = self.sender(packet) else {
            return Ok(());
        };
        if self.players[&sender].is_me {
            return Ok(());
        }

        match self.phase {
            RoundPhase::VerificationAndSubmission => {
                self.apply_signatures(sender, entries, step).await
            }
            RoundPhase::Broadcast | RoundPhase::EquivocationCheck => {
                debug!(player = sender, "signatures arrived early, holding");
                self.pending_signatures.push((sender, entries));
                Ok(())
            }
            phase => {
                warn!(player = sender, ?phase, "signatures out of phase");
                Ok(())
            }
        }
    }

    async fn apply_signatures(
        &mut self,
        sender: u32,
        entries: Vec<Signatures>,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        self.ensure_transaction(step).await?;
        if self.is_finished() {
            return Ok(());
        }
        let (sender_key, sender_outpoint) = {
            let player = &self.players[&sender];
            (player.verification_key.clone(), player.outpoint)
        };

        for entry in entries {
            let Ok(outpoint) = parse_outpoint(&entry.utxo) else {
                return self.blame(step, Reason::InvalidFormat, &sender_key, BlameEvidence::default(), false);
            };
            if outpoint != sender_outpoint {
                return self.blame(step, Reason::Liar, &sender_key, BlameEvidence::default(), false);
            }
            let signature = entry.signature.map(|s| s.signature).unwrap_or_default();
            let transaction = self
                .transaction
                .as_mut()
                .ok_or_else(|| RoundError::State("transaction missing".to_string()))?;
            match transaction.apply_signature(&outpoint, &signature) {
                Ok(()) => debug!(player = sender, utxo = %outpoint, "input signature accepted"),
                Err(TransactionError::InvalidSignature(_)) => {
                    let evidence = BlameEvidence {
                        transaction: Some(serialize(transaction.transaction())),
                        ..Default::default()
                    };
                    return self.blame(step, Reason::InvalidSignature, &sender_key, evidence, false);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.sign_own_input(step)?;
        self.try_submit(step).await
    }

    async fn ensure_transaction(&mut self, step: &mut Step) -> Result<(), RoundError> {
        if self.transaction.is_some() {
            return Ok(());
        }
        let built = tokio::time::timeout(TX_BUILD_WAIT, self.build_transaction())
            .await
            .map_err(|_| RoundError::Timeout)??;
        match built {
            BuildOutcome::Ready(transaction) => {
                info!(
                    amount = transaction.shuffle_amount().to_sat(),
                    outputs = transaction.transaction().output.len(),
                    "shuffle transaction built"
                );
                self.transaction = Some(transaction);
                Ok(())
            }
            BuildOutcome::Spent(key) => {
                self.blame(step, Reason::DoubleSpend, &key, BlameEvidence::default(), false)
            }
        }
    }

    async fn build_transaction(&self) -> Result<BuildOutcome, RoundError> {
        let outputs = self
            .final_outputs
            .as_ref()
            .ok_or_else(|| RoundError::State("final outputs missing".to_string()))?
            .iter()
            .map(|e| parse_address(e, self.config.network))
            .collect::<Result<Vec<_>, _>>()?;

        let mut participants = Vec::with_capacity(self.players.len());
        for player in self.players.values() {
            let unspent = self
                .services
                .lookup
                .coin(&player.outpoint)
                .await?
                .is_some_and(|d| !d.spent);
            if !unspent {
                return Ok(BuildOutcome::Spent(player.verification_key.clone()));
            }
            participants.push(Participant {
                verification_key: player.verification_key.clone(),
                outpoint: player.outpoint,
                public_key: player.coin_key,
                value: player.value,
                change_address: player.change_address.clone().ok_or_else(|| {
                    RoundError::State(format!("player {} has no change address", player.number))
                })?,
            });
        }

        Ok(BuildOutcome::Ready(ShuffleTransaction::build(
            &participants,
            &outputs,
            self.config.fee,
            self.config.fixed_shuffle_amount,
        )?))
    }

    fn sign_own_input(&mut self, step: &mut Step) -> Result<(), RoundError> {
        let transaction = self
            .transaction
            .as_mut()
            .ok_or_else(|| RoundError::State("transaction missing".to_string()))?;
        if transaction.is_signed(&self.coin.outpoint) {
            return Ok(());
        }
        let signature =
            transaction.sign_input(&self.coin.outpoint, self.coin.key().expose_secret())?;
        let message = codec::signatures_message(&[(self.coin.outpoint.to_string(), signature)]);
        let packet = self
            .header()
            .packet(Phase::VerificationAndSubmission, message);
        self.send(step, vec![packet]);
        debug!(utxo = %self.coin.outpoint, "signed own input");
        Ok(())
    }

    async fn try_submit(&mut self, step: &mut Step) -> Result<(), RoundError> {
        let Some(transaction) = self.transaction.as_ref() else {
            return Ok(());
        };
        if !transaction.is_complete() {
            return Ok(());
        }
        let signed = transaction.finalize()?;
        let txid = signed.compute_txid();
        match self.services.broadcaster.broadcast(&signed).await {
            Ok(reported) => {
                if reported != txid {
                    warn!(%reported, %txid, "broadcaster reported a different txid");
                }
                info!(%txid, "shuffle transaction submitted");
                self.finish(step, RoundOutcome::Success { txid });
            }
            Err(e) => {
                self.fail(step, FailureKind::Transaction, None, e.to_string());
            }
        }
        Ok(())
    }

    fn on_blame(&mut self, packet: &Packet, blame: &Blame, step: &mut Step) {
        let Some(sender) = self.sender(packet) else {
            debug!(number = packet.number, "blame from outside the pool ignored");
            return;
        };
        let player = &self.players[&sender];
        if player.is_me {
            return;
        }
        let from = player.verification_key.clone();
        let reason = blame.reason();
        let accused = blame
            .accused
            .as_ref()
            .map(|k| k.key.clone())
            .unwrap_or_default();
        warn!(%from, ?reason, %accused, "peer assigned blame");
        self.blames.push(BlameRecord {
            from: from.clone(),
            reason,
            accused: accused.clone(),
        });

        if accused == self.verification_key {
            self.fail(
                step,
                FailureKind::BlamedByPeer(reason),
                Some(from),
                format!("accused of {:?}", reason),
            );
        }
    }

    fn on_violation(
        &mut self,
        reason: Reason,
        accused: Option<String>,
        invalid: Vec<Signed>,
        step: &mut Step,
    ) -> Result<(), RoundError> {
        let known = accused.filter(|key| {
            *key != self.verification_key
                && self.players.values().any(|p| p.verification_key == *key)
        });
        match known {
            Some(key) if !self.session.is_empty() => {
                let evidence = BlameEvidence {
                    invalid: Some(Packets { packet: invalid }.encode_to_vec()),
                    ..Default::default()
                };
                self.blame(step, reason, &key, evidence, false)
            }
            _ => {
                warn!(?reason, "protocol violation from unknown sender ignored");
                Ok(())
            }
        }
    }

    fn maybe_announce(&mut self, step: &mut Step, force: bool) {
        if self.announced || !self.players.contains_key(&self.number) || self.session.is_empty() {
            return;
        }
        let complete = self
            .expected_players
            .is_some_and(|expected| self.players.len() as u32 >= expected);
        if !complete && !force {
            return;
        }
        let message = codec::change_and_key_message(
            &self.change_address.to_string(),
            &self.encryption_key.to_string(),
        );
        let packet = self.header().packet(Phase::Announcement, message);
        self.send(step, vec![packet]);
        self.announced = true;
        debug!("announced change address and encryption key");
    }

    async fn maybe_start_shuffle(&mut self, step: &mut Step) -> Result<(), RoundError> {
        if self.phase != RoundPhase::Announcement || !self.announced {
            return Ok(());
        }
        let Some(expected) = self.expected_players else {
            return Ok(());
        };
        let ready = self.players.len() as u32 == expected
            && self
                .players
                .values()
                .all(|p| p.encryption_key.is_some() && p.change_address.is_some());
        if !ready {
            return Ok(());
        }

        self.phase = RoundPhase::Shuffle;
        info!(players = expected, "all keys announced, shuffle phase");
        if self.first_player() == Some(self.number) {
            self.shuffle_and_forward(Vec::new(), step).await?;
        }
        Ok(())
    }

    /// Accuse `accused` and, unless told to keep listening, end the round.
    fn blame(
        &mut self,
        step: &mut Step,
        reason: Reason,
        accused: &str,
        evidence: BlameEvidence,
        continue_listening: bool,
    ) -> Result<(), RoundError> {
        warn!(?reason, %accused, continue_listening, "assigning blame");
        let packet = self
            .header()
            .packet(Phase::Blame, codec::blame_message(reason, accused, evidence));
        self.send(step, vec![packet]);
        self.blames.push(BlameRecord {
            from: self.verification_key.clone(),
            reason,
            accused: accused.to_string(),
        });
        if !continue_listening {
            self.fail(
                step,
                FailureKind::Blame(reason),
                Some(accused.to_string()),
                format!("blamed {} for {:?}", accused, reason),
            );
        }
        Ok(())
    }

    fn fail(&mut self, step: &mut Step, kind: FailureKind, accused: Option<String>, detail: String) {
        self.finish(
            step,
            RoundOutcome::Failure(RoundFailure {
                kind,
                accused,
                detail,
            }),
        );
    }

    fn finish(&mut self, step: &mut Step, outcome: RoundOutcome) {
        if self.outcome.is_some() {
            return;
        }
        self.phase = match &outcome {
            RoundOutcome::Success { .. } => RoundPhase::Succeeded,
            RoundOutcome::Failure(RoundFailure {
                kind: FailureKind::Blame(_) | FailureKind::BlamedByPeer(_),
                ..
            }) => RoundPhase::Blame,
            RoundOutcome::Failure(_) => RoundPhase::Failed,
        };
        self.keys.verification.zeroize();
        self.keys.encryption.zeroize();
        step.outcome = Some(outcome.clone());
        self.outcome = Some(outcome);
    }

    fn send(&self, step: &mut Step, packets: Vec<Packet>) {
        step.outbound
            .push(codec::seal(packets, self.keys.verification.expose_secret()));
    }

    fn header(&self) -> PacketHeader {
        PacketHeader {
            session: self.session.clone(),
            number: self.number,
            from_key: self.verification_key.clone(),
        }
    }

    fn insert_player(&mut self, player: Player) {
        self.sessions.insert(player.session.clone(), player.number);
        self.players.insert(player.number, player);
    }

    /// Registered player that sent `packet`, matched on session and key
    fn sender(&self, packet: &Packet) -> Option<u32> {
        let number = self.sessions.get(&packet.session).copied();
        let matched = number
            .and_then(|n| self.players.get(&n))
            .filter(|p| Some(p.verification_key.as_str()) == packet.from_key_str())
            .map(|p| p.number);
        if matched.is_none() {
            warn!(number = packet.number, "message from unregistered sender ignored");
        }
        matched
    }

    fn first_player(&self) -> Option<u32> {
        self.players.keys().next().copied()
    }

    fn last_player(&self) -> Option<u32> {
        self.players.keys().next_back().copied()
    }

    fn predecessor(&self) -> Option<u32> {
        self.players.range(..self.number).next_back().map(|(n, _)| *n)
    }

    fn predecessor_key(&self) -> Option<String> {
        self.predecessor()
            .and_then(|n| self.players.get(&n))
            .map(|p| p.verification_key.clone())
    }

    /// Serializable view of the round for failure diagnostics. Holds no keys.
    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            session: hex::encode(&self.session),
            number: self.number,
            phase: self.phase,
            pool_amount: self.config.pool_amount.to_sat(),
            pool_size: self.pool_size,
            expected_players: self.expected_players,
            verification_key: self.verification_key.clone(),
            players: self
                .players
                .values()
                .map(|p| PlayerSnapshot {
                    number: p.number,
                    session: hex::encode(&p.session),
                    verification_key: p.verification_key.clone(),
                    encryption_key: p.encryption_key.map(|k| k.to_string()),
                    coin_key: p.coin_key.to_string(),
                    utxo: p.outpoint.to_string(),
                    value: p.value.to_sat(),
                    change_address: p.change_address.as_ref().map(|a| a.to_string()),
                    is_me: p.is_me,
                })
                .collect(),
            final_outputs: self.final_outputs.clone(),
            equivocation_hash: self.equivocation_hash.as_ref().map(hex::encode),
            hashes: self
                .hashes
                .iter()
                .map(|(n, h)| (*n, hex::encode(h)))
                .collect(),
            transaction: self
                .transaction
                .as_ref()
                .map(|t| serialize_hex(t.transaction())),
            blames: self.blames.clone(),
            failure: match &self.outcome {
                Some(RoundOutcome::Failure(failure)) => Some(failure.clone()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerSnapshot {
    pub number: u32,
    pub session: String,
    pub verification_key: String,
    pub encryption_key: Option<String>,
    pub coin_key: String,
    pub utxo: String,
    pub value: u64,
    pub change_address: Option<String>,
    pub is_me: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundSnapshot {
    pub session: String,
    pub number: u32,
    pub phase: RoundPhase,
    pub pool_amount: u64,
    pub pool_size: u32,
    pub expected_players: Option<u32>,
    pub verification_key: String,
    pub players: Vec<PlayerSnapshot>,
    pub final_outputs: Option<Vec<String>>,
    pub equivocation_hash: Option<String>,
    pub hashes: BTreeMap<u32, String>,
    pub transaction: Option<String>,
    pub blames: Vec<BlameRecord>,
    pub failure: Option<RoundFailure>,
}

/// Commitment over the final output set and every player's encryption key
///
/// `dSHA256(addresses in broadcast order || encryption keys in player order)`
pub fn equivocation_hash(addresses: &[String], encryption_keys: &[String]) -> Vec<u8> {
    let mut preimage = String::new();
    for address in addresses {
        preimage.push_str(address);
    }
    for key in encryption_keys {
        preimage.push_str(key);
    }
    sha256d::Hash::hash(preimage.as_bytes()).to_byte_array().to_vec()
}

fn parse_inputs(inputs: &BTreeMap<String, Coins>) -> Option<(PublicKey, OutPoint)> {
    if inputs.len() != 1 {
        return None;
    }
    let (key, coins) = inputs.iter().next()?;
    match coins.coins.as_slice() {
        [utxo] => Some((parse_public_key(key).ok()?, parse_outpoint(utxo).ok()?)),
        _ => None,
    }
}

fn evidence_of(signed: &Signed) -> BlameEvidence {
    BlameEvidence {
        invalid: Some(signed.encode_to_vec()),
        ..Default::default()
    }
}
