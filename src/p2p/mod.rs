//! Relay-coordinated shuffle protocol
//!
//! Players never talk to each other directly. A relay assigns sessions and
//! player numbers, then fans every signed packet out to the pool (or to a
//! single addressee for onion-encrypted shuffle sets).
//!
//! ```text
//!  ┌────────┐        ┌────────┐        ┌────────┐
//!  │Player 1│        │Player 2│        │Player 3│
//!  └───┬────┘        └───┬────┘        └───┬────┘
//!      │                 │                 │
//!      └────────────┬────┴────────────┬────┘
//!                   │     Relay       │
//!                   └─────────────────┘
//! ```
//!
//! - [`messages`]: protobuf schema and message classification
//! - [`codec`]: framing, packet signing and message builders
//! - [`transport`]: TCP channel to the relay
//! - [`protocol`]: the round state machine
//! - [`runner`]: connects a round to the relay and reports its completion

pub mod codec;
pub mod crypto_utils;
pub mod messages;
pub mod protocol;
pub mod runner;
pub mod transport;

pub use messages::{MessageType, Payload, Phase, Reason};
pub use protocol::{
    FailureKind, Round, RoundConfig, RoundFailure, RoundOutcome, RoundPhase, RoundServices, Step,
};
pub use runner::{run_round, run_round_with_keys, RoundCompletion};
pub use transport::{ChannelEvent, RelayChannel};
