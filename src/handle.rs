//! Caller-facing facade over a [`StreamEngine`].
//!
//! A [`StreamHandle`] adds policy defaults and state copies on top of the
//! engine: reads can refresh from the stores first, and posts hand back the
//! state they produced.

use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::engine::StreamEngine;
use crate::error::StreamError;
use crate::event::EventEnvelope;
use crate::registry::StreamRegistry;

/// Per-call options for [`StreamHandle::post_events`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostOptions {
    /// Refuse the post if another writer has advanced the stream. `None`
    /// falls back to `default_only_when_current`.
    pub only_when_current: Option<bool>,
    /// Do not copy the resulting state into [`PostOutcome::state`].
    pub skip_state_copy: bool,
}

impl PostOptions {
    /// Options that require the caller's view of the stream to be current.
    pub fn only_when_current() -> Self {
        Self {
            only_when_current: Some(true),
            skip_state_copy: false,
        }
    }

    /// Skip the state copy on the way out.
    pub fn skip_state_copy(mut self) -> Self {
        self.skip_state_copy = true;
        self
    }
}

/// What a post did.
#[derive(Debug, Clone, PartialEq)]
pub struct PostOutcome<A> {
    /// `false` when the post was refused because the state was stale.
    pub success: bool,
    /// The state after the post, unless the copy was skipped.
    ///
    /// On a refused post this is the engine's (stale) state.
    pub state: Option<A>,
}

/// A single stream, bound to one aggregate id.
#[derive(Debug)]
pub struct StreamHandle<A: Aggregate> {
    engine: StreamEngine<A>,
}

impl<A: Aggregate> StreamHandle<A> {
    /// An uninitialized handle over `registry`.
    pub fn new(registry: Arc<StreamRegistry<A>>) -> Self {
        Self {
            engine: StreamEngine::new(registry),
        }
    }

    /// Create a handle and initialize it for `id`.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::initialize`].
    pub async fn open(registry: Arc<StreamRegistry<A>>, id: &str) -> Result<Self, StreamError> {
        let mut handle = Self::new(registry);
        handle.initialize(id).await?;
        Ok(handle)
    }

    /// Load or create the stream `id`.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::initialize`].
    pub async fn initialize(&mut self, id: &str) -> Result<(), StreamError> {
        self.engine.initialize(id).await
    }

    /// The stream id, once initialized.
    pub fn id(&self) -> Option<&str> {
        self.engine.id()
    }

    /// The version of the state this handle holds.
    ///
    /// # Errors
    ///
    /// [`StreamError::NotInitialized`] before initialization.
    pub fn seq(&self) -> Result<i64, StreamError> {
        self.engine.seq()
    }

    /// The engine behind this handle.
    pub fn engine(&self) -> &StreamEngine<A> {
        &self.engine
    }

    /// A deep copy of the current state.
    ///
    /// With `force_refresh` (or `default_force_refresh` when `None`), the
    /// state is reloaded from the stores first.
    ///
    /// # Errors
    ///
    /// [`StreamError::NotInitialized`] before initialization, or any error
    /// from [`StreamEngine::read_all`] when refreshing.
    pub async fn get_copy_of_state(&mut self, force_refresh: Option<bool>) -> Result<A, StreamError> {
        // Checked up front so a refresh never masks the real error.
        self.engine.seq()?;
        let refresh = force_refresh
            .unwrap_or(self.engine.registry().policies().default_force_refresh);
        if refresh {
            self.engine.read_all().await?;
        }
        self.engine.copy_state()
    }

    /// Post one event. See [`post_events`](Self::post_events).
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::write_events`].
    pub async fn post_event(
        &mut self,
        event: impl Into<EventEnvelope<A::DomainEvent>>,
        options: PostOptions,
    ) -> Result<PostOutcome<A>, StreamError> {
        self.post_events(vec![event.into()], options).await
    }

    /// Post a batch of events, appended atomically.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::write_events`].
    pub async fn post_events(
        &mut self,
        events: Vec<EventEnvelope<A::DomainEvent>>,
        options: PostOptions,
    ) -> Result<PostOutcome<A>, StreamError> {
        let only_when_current = options
            .only_when_current
            .unwrap_or(self.engine.registry().policies().default_only_when_current);
        let success = self.engine.write_events(events, only_when_current).await?;
        let state = if options.skip_state_copy {
            None
        } else {
            Some(self.engine.copy_state()?)
        };
        Ok(PostOutcome { success, state })
    }

    /// Force a snapshot of the current state.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::write_snapshot`].
    pub async fn write_snapshot(&mut self) -> Result<(), StreamError> {
        self.engine.write_snapshot().await
    }
}
