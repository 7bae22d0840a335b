//! Actor loop that owns a stream handle and serializes access to it.
//!
//! [`spawn_stream_actor`] moves an initialized [`StreamHandle`] into a tokio
//! task. Callers talk to it through a cloneable [`StreamActorHandle`]; the
//! task processes one message at a time, so concurrent posters never race
//! each other inside one process.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::aggregate::Aggregate;
use crate::error::StreamError;
use crate::event::EventEnvelope;
use crate::handle::{PostOptions, PostOutcome, StreamHandle};

/// Messages waiting in an actor's mailbox before senders block.
const MAILBOX_CAPACITY: usize = 32;

/// Configuration for the actor loop.
#[derive(Debug, Clone, Copy)]
pub struct ActorConfig {
    /// How long the actor waits for a message before shutting down.
    pub idle_timeout: Duration,
}

impl Default for ActorConfig {
    /// Effectively never idles out.
    fn default() -> Self {
        // `u64::MAX / 2` avoids overflow when tokio adds the timeout to the
        // current `Instant`.
        Self {
            idle_timeout: Duration::from_secs(u64::MAX / 2),
        }
    }
}

type PostResult<A> = Result<PostOutcome<A>, StreamError>;

enum ActorMessage<A: Aggregate> {
    GetState {
        force_refresh: Option<bool>,
        reply: oneshot::Sender<Result<A, StreamError>>,
    },
    Post {
        events: Vec<EventEnvelope<A::DomainEvent>>,
        options: PostOptions,
        reply: oneshot::Sender<PostResult<A>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Shutdown,
}

async fn run_actor<A: Aggregate>(
    mut handle: StreamHandle<A>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
    config: ActorConfig,
) {
    let stream_id = handle.id().unwrap_or_default().to_owned();
    loop {
        let msg = tokio::time::timeout(config.idle_timeout, rx.recv()).await;
        match msg {
            Ok(Some(ActorMessage::GetState {
                force_refresh,
                reply,
            })) => {
                let result = handle.get_copy_of_state(force_refresh).await;
                // The caller may have given up waiting.
                let _ = reply.send(result);
            }
            Ok(Some(ActorMessage::Post {
                events,
                options,
                reply,
            })) => {
                let result = handle.post_events(events, options).await;
                let _ = reply.send(result);
            }
            Ok(Some(ActorMessage::Snapshot { reply })) => {
                let _ = reply.send(handle.write_snapshot().await);
            }
            Ok(Some(ActorMessage::Shutdown)) | Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    stream_id = %stream_id,
                    "actor idle, shutting down"
                );
                break;
            }
        }
    }
    tracing::debug!(
        aggregate_type = A::AGGREGATE_TYPE,
        stream_id = %stream_id,
        "actor stopped"
    );
}

/// Move `handle` into a new actor task on the current tokio runtime.
///
/// The handle should already be initialized; otherwise every request
/// fails with [`StreamError::NotInitialized`].
pub fn spawn_stream_actor<A: Aggregate>(
    handle: StreamHandle<A>,
    config: ActorConfig,
) -> StreamActorHandle<A> {
    let (sender, rx) = mpsc::channel(MAILBOX_CAPACITY);
    tokio::spawn(run_actor(handle, rx, config));
    StreamActorHandle { sender }
}

/// Async handle to a running stream actor.
///
/// Cheap to clone; every clone feeds the same mailbox.
#[derive(Debug, Clone)]
pub struct StreamActorHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
}

impl<A: Aggregate> StreamActorHandle<A> {
    /// A copy of the actor's state. See [`StreamHandle::get_copy_of_state`].
    ///
    /// # Errors
    ///
    /// [`StreamError::ActorGone`] if the actor has stopped, otherwise any
    /// error from the handle.
    pub async fn get_state(&self, force_refresh: Option<bool>) -> Result<A, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorMessage::GetState {
            force_refresh,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StreamError::ActorGone)?
    }

    /// Post one event through the actor.
    ///
    /// # Errors
    ///
    /// See [`post_events`](Self::post_events).
    pub async fn post_event(
        &self,
        event: impl Into<EventEnvelope<A::DomainEvent>>,
        options: PostOptions,
    ) -> PostResult<A> {
        self.post_events(vec![event.into()], options).await
    }

    /// Post a batch through the actor. See [`StreamHandle::post_events`].
    ///
    /// # Errors
    ///
    /// [`StreamError::ActorGone`] if the actor has stopped, otherwise any
    /// error from the handle.
    pub async fn post_events(
        &self,
        events: Vec<EventEnvelope<A::DomainEvent>>,
        options: PostOptions,
    ) -> PostResult<A> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorMessage::Post {
            events,
            options,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StreamError::ActorGone)?
    }

    /// Force a snapshot through the actor.
    ///
    /// # Errors
    ///
    /// [`StreamError::ActorGone`] if the actor has stopped, otherwise any
    /// error from [`StreamHandle::write_snapshot`].
    pub async fn write_snapshot(&self) -> Result<(), StreamError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorMessage::Snapshot { reply }).await?;
        rx.await.map_err(|_| StreamError::ActorGone)?
    }

    /// Ask the actor to stop after the messages already queued.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }

    /// Whether the actor task is still receiving messages.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, msg: ActorMessage<A>) -> Result<(), StreamError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| StreamError::ActorGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{
        Customer, CustomerEvent, MemoryStores, customer_registry,
    };
    use crate::config::PoliciesConfig;
    use crate::projection::ProjectionRouter;
    use crate::storage::SnapshotStore;

    async fn spawn(stores: &MemoryStores, config: ActorConfig) -> StreamActorHandle<Customer> {
        let registry = customer_registry(stores, PoliciesConfig::default(), ProjectionRouter::new());
        let handle = StreamHandle::open(registry, "c1")
            .await
            .expect("open should succeed");
        spawn_stream_actor(handle, config)
    }

    fn deposit(amount: i64) -> CustomerEvent {
        CustomerEvent::TransactionPosted {
            account_number: "ACC-1".into(),
            amount,
        }
    }

    #[tokio::test]
    async fn concurrent_posters_are_serialized() {
        let stores = MemoryStores::default();
        let actor = spawn(&stores, ActorConfig::default()).await;
        actor
            .post_event(
                CustomerEvent::AccountAdded {
                    account_number: "ACC-1".into(),
                },
                PostOptions::default(),
            )
            .await
            .expect("post");

        let mut posters = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let actor = actor.clone();
            posters.spawn(async move {
                actor
                    .post_event(deposit(10), PostOptions::only_when_current())
                    .await
                    .expect("post should succeed")
            });
        }
        while let Some(outcome) = posters.join_next().await {
            assert!(outcome.expect("task").success, "actor keeps its view current");
        }

        let state = actor.get_state(None).await.expect("state");
        assert_eq!(state.accounts[0].balance, 100);

        let seqs: Vec<i64> = stores.events.records("c1").await.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (0..=11).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn shutdown_makes_the_actor_gone() {
        let stores = MemoryStores::default();
        let actor = spawn(&stores, ActorConfig::default()).await;
        assert!(actor.is_alive());

        actor.shutdown().await;
        let result = actor.get_state(None).await;
        assert!(matches!(result, Err(StreamError::ActorGone)));
        assert!(!actor.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_actor_stops() {
        let stores = MemoryStores::default();
        let actor = spawn(
            &stores,
            ActorConfig {
                idle_timeout: Duration::from_secs(5),
            },
        )
        .await;
        actor.get_state(None).await.expect("state while alive");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!actor.is_alive());
        let result = actor
            .post_event(deposit(1), PostOptions::default())
            .await;
        assert!(matches!(result, Err(StreamError::ActorGone)));
    }

    #[tokio::test(start_paused = true)]
    async fn default_actor_outlives_a_long_quiet_spell() {
        assert_eq!(
            ActorConfig::default().idle_timeout,
            Duration::from_secs(u64::MAX / 2)
        );
        let stores = MemoryStores::default();
        let actor = spawn(&stores, ActorConfig::default()).await;
        actor.get_state(None).await.expect("state while alive");

        tokio::time::sleep(Duration::from_secs(60 * 60 * 24 * 365)).await;
        assert!(actor.is_alive());
        actor.get_state(None).await.expect("state after a year");
    }

    #[tokio::test]
    async fn snapshot_goes_through_the_actor() {
        let stores = MemoryStores::default();
        let actor = spawn(&stores, ActorConfig::default()).await;
        actor
            .post_event(
                CustomerEvent::CustomerCreated { name: "Ada".into() },
                PostOptions::default(),
            )
            .await
            .expect("post");
        actor.write_snapshot().await.expect("snapshot");

        let snapshot = stores
            .snapshots
            .read("c1")
            .await
            .expect("read")
            .expect("snapshot");
        assert_eq!(snapshot.seq, 1);
    }
}
