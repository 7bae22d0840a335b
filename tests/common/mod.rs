//! Wallet aggregate shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use eventstream::{
    Aggregate, DomainEvent, EventApplicator, EventLog, PoliciesConfig, ProjectionRouter,
    STREAM_INITIALIZED, SnapshotStore, StreamRegistry,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub owner: Option<String>,
    pub balance: i64,
    pub history: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WalletEvent {
    StreamInitialized,
    Opened { owner: String },
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
}

impl DomainEvent for WalletEvent {
    const EVENT_TYPES: &'static [&'static str] =
        &[STREAM_INITIALIZED, "Opened", "Deposited", "Withdrawn"];

    fn event_type(&self) -> &'static str {
        match self {
            WalletEvent::StreamInitialized => STREAM_INITIALIZED,
            WalletEvent::Opened { .. } => "Opened",
            WalletEvent::Deposited { .. } => "Deposited",
            WalletEvent::Withdrawn { .. } => "Withdrawn",
        }
    }

    fn stream_initialized() -> Self {
        WalletEvent::StreamInitialized
    }
}

impl Aggregate for Wallet {
    const AGGREGATE_TYPE: &'static str = "wallet";
    type DomainEvent = WalletEvent;

    fn new(id: &str) -> Self {
        Wallet {
            id: id.to_owned(),
            ..Wallet::default()
        }
    }

    fn id(&self) -> &str {
        &self.id
    }
}

fn opened(mut w: Wallet, e: &WalletEvent) -> Wallet {
    if let WalletEvent::Opened { owner } = e {
        w.owner = Some(owner.clone());
    }
    w
}

fn deposited(mut w: Wallet, e: &WalletEvent) -> Wallet {
    if let WalletEvent::Deposited { amount } = e {
        w.balance += amount;
        w.history.push(*amount);
    }
    w
}

fn withdrawn(mut w: Wallet, e: &WalletEvent) -> Wallet {
    if let WalletEvent::Withdrawn { amount } = e {
        w.balance -= amount;
        w.history.push(-amount);
    }
    w
}

pub fn wallet_applicator() -> EventApplicator<Wallet> {
    EventApplicator::builder()
        .ignore(STREAM_INITIALIZED)
        .on("Opened", opened)
        .on("Deposited", deposited)
        .on("Withdrawn", withdrawn)
        .build()
        .expect("wallet applicator should be complete")
}

pub fn wallet_registry(
    events: Arc<dyn EventLog>,
    snapshots: Arc<dyn SnapshotStore>,
    policies: PoliciesConfig,
    projections: ProjectionRouter<Wallet>,
) -> Arc<StreamRegistry<Wallet>> {
    let registry = StreamRegistry::builder()
        .event_log(events)
        .snapshot_store(snapshots)
        .applicator(wallet_applicator())
        .projections(projections)
        .policies(policies)
        .build()
        .expect("registry should build");
    Arc::new(registry)
}

pub fn deposit(amount: i64) -> WalletEvent {
    WalletEvent::Deposited { amount }
}
