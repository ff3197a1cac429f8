//! Coins, addresses and the services a round depends on.
//!
//! The round never talks to the blockchain itself. Coin lookups and final
//! submission go through [`CoinLookup`] and [`TransactionBroadcaster`], and
//! fresh wallet addresses come from the [`RoundHooks`] supplied by the caller.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Transaction, Txid};

use crate::error::ShuffleError;
use crate::security::SensitiveKey;

/// Errors reported by external services
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("coin lookup failed: {0}")]
    Lookup(String),
    #[error("transaction broadcast failed: {0}")]
    Broadcast(String),
}

/// What the chain knows about an unspent (or spent) output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinDetails {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub spent: bool,
    pub confirmations: u32,
}

/// Blockchain view used to check declared inputs.
#[async_trait]
pub trait CoinLookup: Send + Sync {
    /// `Ok(None)` when the output does not exist.
    async fn coin(&self, outpoint: &OutPoint) -> Result<Option<CoinDetails>, ServiceError>;
}

/// Submits the fully signed shuffle transaction.
#[async_trait]
pub trait TransactionBroadcaster: Send + Sync {
    async fn broadcast(&self, transaction: &Transaction) -> Result<Txid, ServiceError>;
}

/// The coin a round is mixing, with the key that spends it.
#[derive(Clone)]
pub struct Coin {
    pub outpoint: OutPoint,
    key: SensitiveKey,
}

impl Coin {
    pub fn new(outpoint: OutPoint, key: SensitiveKey) -> Self {
        Self { outpoint, key }
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key(&Secp256k1::signing_only())
    }

    pub fn key(&self) -> &SensitiveKey {
        &self.key
    }
}

impl fmt::Debug for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coin")
            .field("outpoint", &self.outpoint)
            .field("key", &self.key)
            .finish()
    }
}

/// Produces a fresh wallet address.
pub type AddressHook = Arc<dyn Fn() -> Result<String, ShuffleError> + Send + Sync>;

/// Wallet callbacks for the addresses a round pays to.
#[derive(Clone)]
pub struct RoundHooks {
    change_address: AddressHook,
    shuffled_address: AddressHook,
}

impl RoundHooks {
    pub fn builder() -> RoundHooksBuilder {
        RoundHooksBuilder::default()
    }

    pub fn next_change_address(&self) -> Result<String, ShuffleError> {
        (self.change_address)()
    }

    pub fn next_shuffled_address(&self) -> Result<String, ShuffleError> {
        (self.shuffled_address)()
    }
}

impl fmt::Debug for RoundHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoundHooks")
    }
}

#[derive(Default)]
pub struct RoundHooksBuilder {
    change_address: Option<AddressHook>,
    shuffled_address: Option<AddressHook>,
}

impl RoundHooksBuilder {
    pub fn change_address<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<String, ShuffleError> + Send + Sync + 'static,
    {
        self.change_address = Some(Arc::new(hook));
        self
    }

    pub fn shuffled_address<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<String, ShuffleError> + Send + Sync + 'static,
    {
        self.shuffled_address = Some(Arc::new(hook));
        self
    }

    /// Both hooks are required.
    pub fn build(self) -> Result<RoundHooks, ShuffleError> {
        let change_address = self
            .change_address
            .ok_or_else(|| ShuffleError::Hook("missing change address hook".to_string()))?;
        let shuffled_address = self
            .shuffled_address
            .ok_or_else(|| ShuffleError::Hook("missing shuffled address hook".to_string()))?;
        Ok(RoundHooks {
            change_address,
            shuffled_address,
        })
    }
}

/// Legacy P2PKH address of a compressed public key
pub fn legacy_address(public_key: &PublicKey, network: Network) -> Address {
    Address::p2pkh(bitcoin::PublicKey::new(*public_key), network)
}

/// Parse an address and require that it belongs to `network`
pub fn parse_address(text: &str, network: Network) -> Result<Address, ShuffleError> {
    Address::from_str(text.trim())
        .map_err(|e| ShuffleError::Address(format!("{}: {}", text, e)))?
        .require_network(network)
        .map_err(|e| ShuffleError::Address(format!("{}: {}", text, e)))
}

/// Parse a `txid:vout` reference
pub fn parse_outpoint(text: &str) -> Result<OutPoint, ShuffleError> {
    OutPoint::from_str(text).map_err(|e| ShuffleError::InvalidParameter(format!("{}: {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    #[test]
    fn test_hooks_builder_requires_both() {
        let missing = RoundHooks::builder()
            .change_address(|| Ok("1BoatSLRHtKNngkdXEeobR76b53LETtpyT".to_string()))
            .build();
        assert!(matches!(missing, Err(ShuffleError::Hook(_))));

        let hooks = RoundHooks::builder()
            .change_address(|| Ok("change".to_string()))
            .shuffled_address(|| Ok("shuffled".to_string()))
            .build()
            .unwrap();
        assert_eq!(hooks.next_change_address().unwrap(), "change");
        assert_eq!(hooks.next_shuffled_address().unwrap(), "shuffled");
    }

    #[test]
    fn test_legacy_address_round_trip() {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        let pk = PublicKey::from_secret_key(&secp, &sk);

        let address = legacy_address(&pk, Network::Bitcoin);
        assert!(address.to_string().starts_with('1'));
        assert_eq!(
            parse_address(&address.to_string(), Network::Bitcoin).unwrap(),
            address
        );
        assert!(parse_address(&address.to_string(), Network::Testnet).is_err());
    }

    #[test]
    fn test_parse_outpoint() {
        let text = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b:1";
        let outpoint = parse_outpoint(text).unwrap();
        assert_eq!(outpoint.vout, 1);
        assert_eq!(outpoint.to_string(), text);
        assert!(parse_outpoint("nope").is_err());
    }

    #[test]
    fn test_coin_debug_redacts_key() {
        let coin = Coin::new(OutPoint::null(), SensitiveKey::generate());
        assert!(format!("{:?}", coin).contains("REDACTED"));
    }
}
