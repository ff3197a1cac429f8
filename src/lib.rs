//! CoinShuffle Round
//!
//! One participant's side of a relay-coordinated CoinShuffle round: several
//! players pool equal-sized coins into a single transaction whose outputs
//! cannot be linked back to their inputs.
//!
//! ## Overview
//!
//! Each player announces a coin, shuffles a set of onion-encrypted output
//! addresses, cross-checks that everyone saw the same final set and then
//! signs its own input of the shared transaction. Misbehaving players are
//! named in signed blame packets and the round is abandoned.
//!
//! ## Key Components
//!
//! - **Encryption**: BIE1 ECIES for the onion layers around output addresses
//! - **Transaction**: deterministic construction and signing of the shuffle transaction
//! - **Protocol**: wire codec, relay channel and the round state machine
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bitcoin::{Amount, OutPoint};
//! use coinshuffle_round::{
//!     coin::{Coin, CoinLookup, RoundHooks, TransactionBroadcaster},
//!     p2p::{run_round, RoundConfig, RoundServices},
//!     security::SensitiveKey,
//! };
//!
//! # async fn example(
//! #     lookup: Arc<dyn CoinLookup>,
//! #     broadcaster: Arc<dyn TransactionBroadcaster>,
//! #     outpoint: OutPoint,
//! #     key: SensitiveKey,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = RoundConfig::new("relay.example.org:1337", Amount::from_sat(100_000));
//! let hooks = RoundHooks::builder()
//!     .change_address(|| Ok("1BoatSLRHtKNngkdXEeobR76b53LETtpyT".to_string()))
//!     .shuffled_address(|| Ok("1JryTePceSiWVpoNBU8SbwiT7J4ghzijzW".to_string()))
//!     .build()?;
//!
//! let completion = run_round(
//!     config,
//!     Coin::new(outpoint, key),
//!     &hooks,
//!     RoundServices { lookup, broadcaster },
//! )
//! .await?;
//! println!("success: {}, txid: {:?}", completion.success, completion.txid);
//! # Ok(())
//! # }
//! ```

pub mod coin;
pub mod encryption;
pub mod error;
pub mod p2p;
pub mod security;
pub mod transaction;

pub use error::ShuffleError;

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call repeatedly; only the first call has any effect.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
