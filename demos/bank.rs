//! A bank customer stream with accounts, a spouse, and addresses, backed by
//! the file stores in a temporary directory.
//!
//! Run with: `RUST_LOG=eventstream=debug cargo run --example bank`

use std::sync::{Arc, Mutex};

use eventstream::{
    Aggregate, DomainEvent, EngineConfig, EventApplicator, PostOptions, ProjectionError,
    ProjectionRouter, STREAM_INITIALIZED, StreamCache, StreamError, StreamRegistryBuilder,
    Triggers,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Customer aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Customer {
    id: String,
    name: String,
    accounts: Vec<Account>,
    spouse: Option<String>,
    addresses: Vec<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    number: String,
    balance: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Address {
    street: String,
    city: String,
}

/// Events recorded against a [`Customer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum CustomerEvent {
    StreamInitialized,
    CustomerNamed { name: String },
    AccountAdded { number: String },
    TransactionPosted { number: String, amount: i64 },
    SpouseChanged { name: String },
    SpouseRemoved,
    AddressAdded { address: Address },
}

impl DomainEvent for CustomerEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        STREAM_INITIALIZED,
        "CustomerNamed",
        "AccountAdded",
        "TransactionPosted",
        "SpouseChanged",
        "SpouseRemoved",
        "AddressAdded",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            CustomerEvent::StreamInitialized => STREAM_INITIALIZED,
            CustomerEvent::CustomerNamed { .. } => "CustomerNamed",
            CustomerEvent::AccountAdded { .. } => "AccountAdded",
            CustomerEvent::TransactionPosted { .. } => "TransactionPosted",
            CustomerEvent::SpouseChanged { .. } => "SpouseChanged",
            CustomerEvent::SpouseRemoved => "SpouseRemoved",
            CustomerEvent::AddressAdded { .. } => "AddressAdded",
        }
    }

    fn stream_initialized() -> Self {
        CustomerEvent::StreamInitialized
    }
}

impl Aggregate for Customer {
    const AGGREGATE_TYPE: &'static str = "customer";
    type DomainEvent = CustomerEvent;

    fn new(id: &str) -> Self {
        Customer {
            id: id.to_owned(),
            ..Customer::default()
        }
    }

    fn id(&self) -> &str {
        &self.id
    }
}

impl Customer {
    fn balance(&self, number: &str) -> Option<i64> {
        self.accounts
            .iter()
            .find(|a| a.number == number)
            .map(|a| a.balance)
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

fn named(mut c: Customer, e: &CustomerEvent) -> Customer {
    if let CustomerEvent::CustomerNamed { name } = e {
        c.name = name.clone();
    }
    c
}

fn account_added(mut c: Customer, e: &CustomerEvent) -> Customer {
    if let CustomerEvent::AccountAdded { number } = e {
        c.accounts.push(Account {
            number: number.clone(),
            balance: 0,
        });
    }
    c
}

fn transaction_posted(mut c: Customer, e: &CustomerEvent) -> Customer {
    if let CustomerEvent::TransactionPosted { number, amount } = e
        && let Some(account) = c.accounts.iter_mut().find(|a| &a.number == number)
    {
        account.balance += amount;
    }
    c
}

fn spouse_changed(mut c: Customer, e: &CustomerEvent) -> Customer {
    if let CustomerEvent::SpouseChanged { name } = e {
        c.spouse = Some(name.clone());
    }
    c
}

fn spouse_removed(mut c: Customer, _: &CustomerEvent) -> Customer {
    c.spouse = None;
    c
}

fn address_added(mut c: Customer, e: &CustomerEvent) -> Customer {
    if let CustomerEvent::AddressAdded { address } = e {
        c.addresses.push(address.clone());
    }
    c
}

fn customer_applicator() -> Result<EventApplicator<Customer>, StreamError> {
    EventApplicator::builder()
        .ignore(STREAM_INITIALIZED)
        .on("CustomerNamed", named)
        .on("AccountAdded", account_added)
        .on("TransactionPosted", transaction_posted)
        .on("SpouseChanged", spouse_changed)
        .on("SpouseRemoved", spouse_removed)
        .on("AddressAdded", address_added)
        .build()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum BankError {
    #[error("account {0} not found")]
    NoSuchAccount(String),
    #[error("insufficient funds in {number}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        number: String,
        balance: i64,
        requested: i64,
    },
    #[error("state changed underneath the withdrawal; retry")]
    Stale,
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Withdraw only if the current balance covers it. The post requires the
/// state it was decided on to still be current.
async fn withdraw(
    cache: &mut StreamCache<Customer>,
    customer_id: &str,
    number: &str,
    amount: i64,
) -> Result<Customer, BankError> {
    let current = cache.get_copy_of_state(customer_id, Some(true)).await?;
    let balance = current
        .balance(number)
        .ok_or_else(|| BankError::NoSuchAccount(number.to_owned()))?;
    if balance < amount {
        return Err(BankError::InsufficientFunds {
            number: number.to_owned(),
            balance,
            requested: amount,
        });
    }

    let outcome = cache
        .post_event(
            customer_id,
            CustomerEvent::TransactionPosted {
                number: number.to_owned(),
                amount: -amount,
            },
            PostOptions::only_when_current(),
        )
        .await?;
    if !outcome.success {
        return Err(BankError::Stale);
    }
    outcome.state.ok_or(BankError::Stale)
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReadModels {
    residency: Vec<(String, usize)>,
    marital: Vec<(String, Option<String>)>,
}

fn projections(models: &Arc<Mutex<ReadModels>>) -> Result<ProjectionRouter<Customer>, StreamError> {
    let residency = Arc::clone(models);
    let marital = Arc::clone(models);
    ProjectionRouter::new()
        .register("residency", Triggers::snapshot(), move |customer: Customer| {
            let models = Arc::clone(&residency);
            async move {
                let mut models = models.lock().map_err(|e| e.to_string())?;
                models
                    .residency
                    .push((customer.id.clone(), customer.addresses.len()));
                Ok::<(), ProjectionError>(())
            }
        })?
        .register(
            "marital-status",
            Triggers::events(["SpouseChanged", "SpouseRemoved"]),
            move |customer: Customer| {
                let models = Arc::clone(&marital);
                async move {
                    let mut models = models.lock().map_err(|e| e.to_string())?;
                    models.marital.push((customer.id.clone(), customer.spouse.clone()));
                    Ok::<(), ProjectionError>(())
                }
            },
        )
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let tmp = tempfile::tempdir()?;
    let mut config = EngineConfig::default();
    config.database.connection = tmp.path().display().to_string();
    config.database.event_table = "customer_events".into();
    config.database.snapshot_table = "customer_snapshots".into();
    config.policies.default_queue_size = 100;

    let models = Arc::new(Mutex::new(ReadModels::default()));
    let registry = StreamRegistryBuilder::from_config(&config)?
        .applicator(customer_applicator()?)
        .projections(projections(&models)?)
        .build()?;
    let mut cache = StreamCache::new(Arc::new(registry));

    cache
        .post_events(
            "c1",
            vec![
                CustomerEvent::CustomerNamed {
                    name: "Ada Lovelace".into(),
                }
                .into(),
                CustomerEvent::AccountAdded {
                    number: "CHK-1".into(),
                }
                .into(),
                CustomerEvent::TransactionPosted {
                    number: "CHK-1".into(),
                    amount: 500,
                }
                .into(),
                CustomerEvent::AddressAdded {
                    address: Address {
                        street: "12 St James's Square".into(),
                        city: "London".into(),
                    },
                }
                .into(),
            ],
            PostOptions::default(),
        )
        .await?;
    cache
        .post_event(
            "c1",
            CustomerEvent::SpouseChanged {
                name: "William King".into(),
            },
            PostOptions::default(),
        )
        .await?;

    let after = withdraw(&mut cache, "c1", "CHK-1", 200).await?;
    println!("withdrew 200, balance now {:?}", after.balance("CHK-1"));

    match withdraw(&mut cache, "c1", "CHK-1", 1_000).await {
        Err(BankError::InsufficientFunds { balance, .. }) => {
            println!("refused 1000 withdrawal, balance is {balance}");
        }
        other => return Err(format!("expected a refusal, got {other:?}").into()),
    }

    let customer = cache.get_copy_of_state("c1", None).await?;
    assert_eq!(customer.balance("CHK-1"), Some(300));
    assert_eq!(customer.spouse.as_deref(), Some("William King"));

    let models = models.lock().map_err(|e| e.to_string())?;
    println!("residency updates: {:?}", models.residency);
    println!("marital updates:   {:?}", models.marital);
    assert_eq!(models.marital.len(), 1);
    assert!(!models.residency.is_empty());

    println!("all assertions passed");
    Ok(())
}
