#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Amount, Network, OutPoint, Transaction, Txid};

use coinshuffle_round::coin::{
    legacy_address, Coin, CoinDetails, CoinLookup, RoundHooks, ServiceError, TransactionBroadcaster,
};
use coinshuffle_round::p2p::codec;
use coinshuffle_round::p2p::crypto_utils::SignatureError;
use coinshuffle_round::p2p::messages::{Packet, Packets, Phase, Reason, Signed};
use coinshuffle_round::p2p::{ChannelEvent, Round, RoundConfig, RoundOutcome, RoundServices};
use coinshuffle_round::security::{RoundKeys, SensitiveKey};

pub const POOL_AMOUNT: u64 = 50_000;

pub struct MemoryLookup {
    coins: Mutex<HashMap<OutPoint, CoinDetails>>,
}

impl MemoryLookup {
    pub fn new(coins: HashMap<OutPoint, CoinDetails>) -> Self {
        Self {
            coins: Mutex::new(coins),
        }
    }

    pub fn mark_spent(&self, outpoint: &OutPoint) {
        if let Some(coin) = self.coins.lock().unwrap().get_mut(outpoint) {
            coin.spent = true;
        }
    }
}

#[async_trait]
impl CoinLookup for MemoryLookup {
    async fn coin(&self, outpoint: &OutPoint) -> Result<Option<CoinDetails>, ServiceError> {
        Ok(self.coins.lock().unwrap().get(outpoint).cloned())
    }
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    pub submitted: Mutex<Vec<Transaction>>,
}

#[async_trait]
impl TransactionBroadcaster for RecordingBroadcaster {
    async fn broadcast(&self, transaction: &Transaction) -> Result<Txid, ServiceError> {
        self.submitted.lock().unwrap().push(transaction.clone());
        Ok(transaction.compute_txid())
    }
}

pub fn fresh_address() -> String {
    let secp = Secp256k1::new();
    let key = SecretKey::new(&mut rand::thread_rng());
    legacy_address(&PublicKey::from_secret_key(&secp, &key), Network::Bitcoin).to_string()
}

/// A player's coin: what the chain says, and optionally what the player believes
#[derive(Debug, Clone, Copy)]
pub struct CoinSetup {
    pub value: u64,
    pub claimed_value: Option<u64>,
}

impl CoinSetup {
    pub fn worth(value: u64) -> Self {
        Self {
            value,
            claimed_value: None,
        }
    }
}

pub type Tamper = Box<dyn FnMut(usize, Packets) -> Packets + Send>;

/// Runs several rounds against an in-memory relay.
///
/// The relay assigns player numbers in registration order, echoes multicast
/// packets to every player including the sender, and routes unicast packets
/// by their addressee key. Deliveries are strictly FIFO.
pub struct Harness {
    pub rounds: Vec<Round>,
    pub keys: Vec<RoundKeys>,
    pub outpoints: Vec<OutPoint>,
    pub lookup: Arc<MemoryLookup>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub outcomes: Vec<Option<RoundOutcome>>,
    registered: Vec<usize>,
    tamper: Option<Tamper>,
}

impl Harness {
    pub fn new(coins: &[CoinSetup]) -> Self {
        coinshuffle_round::init_tracing();

        let secp = Secp256k1::new();
        let owned: Vec<Coin> = coins
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let txid = Txid::from_byte_array([i as u8 + 1; 32]);
                Coin::new(OutPoint::new(txid, i as u32), SensitiveKey::generate())
            })
            .collect();

        let details = |coin: &Coin, value: u64| CoinDetails {
            outpoint: coin.outpoint,
            value: Amount::from_sat(value),
            script_pubkey: legacy_address(&coin.key().public_key(&secp), Network::Bitcoin)
                .script_pubkey(),
            spent: false,
            confirmations: 6,
        };
        let chain: HashMap<OutPoint, CoinDetails> = owned
            .iter()
            .zip(coins)
            .map(|(coin, setup)| (coin.outpoint, details(coin, setup.value)))
            .collect();
        let lookup = Arc::new(MemoryLookup::new(chain.clone()));
        let broadcaster = Arc::new(RecordingBroadcaster::default());

        let mut rounds = Vec::new();
        let mut keys = Vec::new();
        for (coin, setup) in owned.iter().zip(coins) {
            let player_lookup: Arc<dyn CoinLookup> = match setup.claimed_value {
                Some(claimed) => {
                    let mut view = chain.clone();
                    view.insert(coin.outpoint, details(coin, claimed));
                    Arc::new(MemoryLookup::new(view))
                }
                None => lookup.clone(),
            };
            let change = fresh_address();
            let shuffled = fresh_address();
            let hooks = RoundHooks::builder()
                .change_address(move || Ok(change.clone()))
                .shuffled_address(move || Ok(shuffled.clone()))
                .build()
                .unwrap();
            let round_keys = RoundKeys::generate();
            let round = Round::with_keys(
                RoundConfig::new("in-memory", Amount::from_sat(POOL_AMOUNT)),
                coin.clone(),
                &hooks,
                RoundServices {
                    lookup: player_lookup,
                    broadcaster: broadcaster.clone(),
                },
                round_keys.clone(),
            )
            .unwrap();
            rounds.push(round);
            keys.push(round_keys);
        }

        Self {
            outcomes: vec![None; rounds.len()],
            outpoints: owned.iter().map(|c| c.outpoint).collect(),
            rounds,
            keys,
            lookup,
            broadcaster,
            registered: Vec::new(),
            tamper: None,
        }
    }

    /// Rewrite packets on their way to a recipient
    pub fn set_tamper(&mut self, tamper: Tamper) {
        self.tamper = Some(tamper);
    }

    pub fn verification_key(&self, index: usize) -> String {
        self.rounds[index].verification_key().to_string()
    }

    pub fn signing_key(&self, index: usize) -> SecretKey {
        *self.keys[index].verification.expose_secret()
    }

    /// Deliver events until the queue drains
    pub async fn run(&mut self) -> Vec<Option<RoundOutcome>> {
        let mut queue: VecDeque<(usize, ChannelEvent)> = (0..self.rounds.len())
            .map(|i| (i, ChannelEvent::Connected))
            .collect();

        let mut deliveries = 0;
        while let Some((to, event)) = queue.pop_front() {
            deliveries += 1;
            assert!(deliveries < 10_000, "relay did not settle");

            let step = self.rounds[to].handle(event).await;
            if let Some(outcome) = step.outcome {
                assert!(self.outcomes[to].is_none(), "second outcome for player {to}");
                self.outcomes[to] = Some(outcome);
            }
            for packets in step.outbound {
                self.route(to, packets, &mut queue);
            }
        }
        self.outcomes.clone()
    }

    fn route(&mut self, from: usize, packets: Packets, queue: &mut VecDeque<(usize, ChannelEvent)>) {
        let Some(first) = packets.packet.first().and_then(|s| s.packet.as_ref()) else {
            return;
        };

        if first.registration.is_some() {
            self.registered.push(from);
            let count = self.registered.len() as u32;
            for &i in &self.registered {
                queue.push_back((
                    i,
                    notice(Packet {
                        number: count,
                        ..Default::default()
                    }),
                ));
            }
            if self.registered.len() == self.rounds.len() {
                for (position, &i) in self.registered.iter().enumerate() {
                    let number = position as u32 + 1;
                    queue.push_back((
                        i,
                        notice(Packet {
                            session: format!("session-{number}").into_bytes(),
                            number,
                            ..Default::default()
                        }),
                    ));
                }
                for &i in &self.registered {
                    queue.push_back((
                        i,
                        notice(Packet {
                            number: count,
                            phase: Phase::Announcement as i32,
                            ..Default::default()
                        }),
                    ));
                }
            }
            return;
        }

        let recipients: Vec<usize> = match first.to_key_str() {
            Some(key) => self
                .rounds
                .iter()
                .position(|r| r.verification_key() == key)
                .into_iter()
                .collect(),
            None => self.registered.clone(),
        };
        for to in recipients {
            let delivered = match self.tamper.as_mut() {
                Some(tamper) => tamper(to, packets.clone()),
                None => packets.clone(),
            };
            queue.push_back((to, verified(delivered)));
        }
    }
}

fn notice(packet: Packet) -> ChannelEvent {
    ChannelEvent::Message(Packets {
        packet: vec![Signed {
            packet: Some(packet),
            signature: None,
        }],
    })
}

/// Same admission rule the TCP channel applies
fn verified(packets: Packets) -> ChannelEvent {
    for signed in &packets.packet {
        if let Err(e) = codec::verify_signed(signed, Network::Bitcoin) {
            return ChannelEvent::ProtocolViolation {
                reason: match e {
                    SignatureError::InvalidFormat => Reason::InvalidFormat,
                    _ => Reason::InvalidSignature,
                },
                accused: signed
                    .packet
                    .as_ref()
                    .and_then(|p| p.from_key_str())
                    .map(str::to_string),
                invalid: vec![signed.clone()],
            };
        }
    }
    ChannelEvent::Message(packets)
}

/// Strip signatures and sign again with `key`
pub fn resign(packets: Packets, key: &SecretKey) -> Packets {
    codec::seal(
        packets.packet.into_iter().filter_map(|s| s.packet).collect(),
        key,
    )
}
