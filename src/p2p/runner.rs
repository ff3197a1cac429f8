//! Drives a [`Round`] over a live relay connection.

use std::path::{Path, PathBuf};

use bitcoin::Txid;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::coin::{Coin, RoundHooks};
use crate::error::ShuffleError;
use crate::security::RoundKeys;

use super::protocol::{
    FailureKind, Round, RoundConfig, RoundFailure, RoundOutcome, RoundServices, RoundSnapshot,
};
use super::transport::{ChannelEvent, FrameRecord, RelayChannel};

/// The single result every round produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundCompletion {
    pub success: bool,
    pub txid: Option<Txid>,
    pub error: Option<RoundFailure>,
}

impl From<RoundOutcome> for RoundCompletion {
    fn from(outcome: RoundOutcome) -> Self {
        match outcome {
            RoundOutcome::Success { txid } => Self {
                success: true,
                txid: Some(txid),
                error: None,
            },
            RoundOutcome::Failure(failure) => Self {
                success: false,
                txid: None,
                error: Some(failure),
            },
        }
    }
}

#[derive(Serialize)]
struct DiagnosticReport<'a> {
    round: RoundSnapshot,
    inbox: &'a [FrameRecord],
    outbox: &'a [FrameRecord],
}

/// Run one round to completion with fresh one-time keys
///
/// Setup problems (bad config, failing hooks) are returned as errors before
/// any connection is made. Once connected, every outcome is reported through
/// the returned [`RoundCompletion`].
pub async fn run_round(
    config: RoundConfig,
    coin: Coin,
    hooks: &RoundHooks,
    services: RoundServices,
) -> Result<RoundCompletion, ShuffleError> {
    run_round_with_keys(config, coin, hooks, services, RoundKeys::generate()).await
}

pub async fn run_round_with_keys(
    config: RoundConfig,
    coin: Coin,
    hooks: &RoundHooks,
    services: RoundServices,
    keys: RoundKeys,
) -> Result<RoundCompletion, ShuffleError> {
    let mut round = Round::with_keys(config.clone(), coin, hooks, services, keys)?;

    let connected = RelayChannel::connect(&config.relay_addr, config.network).await;
    let (outcome, inbox, outbox) = match connected {
        Ok(channel) => {
            let outcome = drive(&mut round, &channel).await;
            channel.close().await;
            (outcome, channel.inbox().await, channel.outbox().await)
        }
        Err(e) => {
            error!(relay = %config.relay_addr, "{e}");
            let outcome = round
                .handle(ChannelEvent::ConnectError(e.to_string()))
                .await
                .outcome;
            (outcome, Vec::new(), Vec::new())
        }
    };

    let outcome = outcome.or_else(|| round.outcome().cloned()).unwrap_or_else(|| {
        RoundOutcome::Failure(RoundFailure {
            kind: FailureKind::Exception,
            accused: None,
            detail: "round ended without an outcome".to_string(),
        })
    });

    match &outcome {
        RoundOutcome::Success { txid } => {
            info!(%txid, player = round.number(), "round succeeded");
        }
        RoundOutcome::Failure(failure) => {
            warn!(
                kind = ?failure.kind,
                accused = ?failure.accused,
                "round failed: {}",
                failure.detail
            );
            if let Some(dir) = &config.diagnostics_dir {
                let report = DiagnosticReport {
                    round: round.snapshot(),
                    inbox: &inbox,
                    outbox: &outbox,
                };
                match write_report(dir, &report).await {
                    Ok(path) => info!(path = %path.display(), "wrote round diagnostics"),
                    Err(e) => warn!("failed to write round diagnostics: {e}"),
                }
            }
        }
    }

    Ok(outcome.into())
}

async fn drive(round: &mut Round, channel: &RelayChannel) -> Option<RoundOutcome> {
    loop {
        let event = channel.recv().await.unwrap_or(ChannelEvent::Disconnected);
        let step = round.handle(event).await;

        let mut outcome = step.outcome;
        for packets in &step.outbound {
            if let Err(e) = channel.send(packets).await {
                warn!("send failed: {e}");
                if outcome.is_none() {
                    outcome = round
                        .handle(ChannelEvent::ConnectError(e.to_string()))
                        .await
                        .outcome;
                }
                break;
            }
        }
        if outcome.is_some() || round.is_finished() {
            return outcome;
        }
    }
}

async fn write_report(dir: &Path, report: &DiagnosticReport<'_>) -> Result<PathBuf, ShuffleError> {
    let session = if report.round.session.is_empty() {
        "unassigned".to_string()
    } else {
        report.round.session.clone()
    };
    let path = dir.join(format!("failed-round-{}.json", session));
    let json = serde_json::to_vec_pretty(report)?;

    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, json).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::{legacy_address, CoinDetails, CoinLookup, ServiceError, TransactionBroadcaster};
    use crate::security::SensitiveKey;
    use async_trait::async_trait;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use bitcoin::{Amount, Network, OutPoint, Transaction};
    use std::sync::Arc;

    struct NoCoins;

    #[async_trait]
    impl CoinLookup for NoCoins {
        async fn coin(&self, _: &OutPoint) -> Result<Option<CoinDetails>, ServiceError> {
            Ok(None)
        }
    }

    #[async_trait]
    impl TransactionBroadcaster for NoCoins {
        async fn broadcast(&self, _: &Transaction) -> Result<Txid, ServiceError> {
            Err(ServiceError::Broadcast("offline".to_string()))
        }
    }

    fn fresh_address() -> String {
        let secp = Secp256k1::new();
        let key = SecretKey::new(&mut rand::thread_rng());
        legacy_address(&PublicKey::from_secret_key(&secp, &key), Network::Bitcoin).to_string()
    }

    #[tokio::test]
    async fn test_unreachable_relay_writes_diagnostics() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let mut config = RoundConfig::new(addr, Amount::from_sat(10_000));
        config.diagnostics_dir = Some(dir.path().to_path_buf());

        let hooks = RoundHooks::builder()
            .change_address(|| Ok(fresh_address()))
            .shuffled_address(|| Ok(fresh_address()))
            .build()
            .unwrap();
        let services = RoundServices {
            lookup: Arc::new(NoCoins),
            broadcaster: Arc::new(NoCoins),
        };
        let coin = Coin::new(OutPoint::null(), SensitiveKey::generate());

        let completion = run_round(config, coin, &hooks, services).await.unwrap();
        assert!(!completion.success);
        assert_eq!(completion.txid, None);
        assert_eq!(completion.error.unwrap().kind, FailureKind::CommsError);

        let report = dir.path().join("failed-round-unassigned.json");
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(report).unwrap()).unwrap();
        assert_eq!(json["round"]["failure"]["kind"], "CommsError");
        assert!(json["inbox"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_hook_is_a_setup_error() {
        let hooks = RoundHooks::builder()
            .change_address(|| Err(ShuffleError::Hook("wallet locked".to_string())))
            .shuffled_address(|| Ok(fresh_address()))
            .build()
            .unwrap();
        let services = RoundServices {
            lookup: Arc::new(NoCoins),
            broadcaster: Arc::new(NoCoins),
        };
        let coin = Coin::new(OutPoint::null(), SensitiveKey::generate());
        let config = RoundConfig::new("127.0.0.1:1", Amount::from_sat(10_000));

        assert!(matches!(
            run_round(config, coin, &hooks, services).await,
            Err(ShuffleError::Hook(_))
        ));
    }
}
