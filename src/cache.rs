//! Bounded cache of initialized stream handles.
//!
//! The cache keeps at most `queue_size` handles in memory and evicts the
//! oldest by insertion order. Eviction only drops in-memory state; the next
//! access re-initializes the stream from the stores.
//!
//! The cache is not synchronized. Share it across tasks behind a
//! `tokio::sync::Mutex<StreamCache<A>>`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::error::StreamError;
use crate::event::EventEnvelope;
use crate::handle::{PostOptions, PostOutcome, StreamHandle};
use crate::registry::StreamRegistry;

/// Map from aggregate id to [`StreamHandle`], oldest first.
#[derive(Debug)]
pub struct StreamCache<A: Aggregate> {
    registry: Arc<StreamRegistry<A>>,
    handles: HashMap<String, StreamHandle<A>>,
    order: VecDeque<String>,
    queue_size: usize,
}

impl<A: Aggregate> StreamCache<A> {
    /// An empty cache whose capacity starts at `default_queue_size`.
    pub fn new(registry: Arc<StreamRegistry<A>>) -> Self {
        let queue_size = registry.policies().default_queue_size;
        Self {
            registry,
            handles: HashMap::new(),
            order: VecDeque::new(),
            queue_size,
        }
    }

    /// The handle for `id`, initializing and caching it on a miss.
    ///
    /// A miss may evict the oldest cached handles to stay within
    /// [`queue_size`](Self::queue_size). The new handle itself is never
    /// evicted by the call that created it.
    ///
    /// # Errors
    ///
    /// Any error from [`StreamHandle::initialize`]. Nothing is cached when
    /// initialization fails.
    pub async fn get(&mut self, id: &str) -> Result<&mut StreamHandle<A>, StreamError> {
        if !self.handles.contains_key(id) {
            let handle = StreamHandle::open(Arc::clone(&self.registry), id).await?;
            self.handles.insert(id.to_owned(), handle);
            self.order.push_back(id.to_owned());
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                stream_id = %id,
                cached = self.order.len(),
                "stream handle cached"
            );
            self.trim();
        } else {
            tracing::debug!(aggregate_type = A::AGGREGATE_TYPE, stream_id = %id, "cache hit");
        }

        self.handles
            .get_mut(id)
            .ok_or_else(|| StreamError::Configuration(format!("stream '{id}' evicted on insert")))
    }

    /// Maximum number of cached handles; `0` means unbounded.
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Change the capacity, evicting the oldest handles that no longer fit.
    pub fn set_queue_size(&mut self, queue_size: usize) {
        self.queue_size = queue_size;
        self.trim();
    }

    /// Drop the handle for `id`. Returns whether one was cached.
    pub fn release(&mut self, id: &str) -> bool {
        let removed = self.handles.remove(id).is_some();
        if removed {
            self.order.retain(|cached| cached != id);
            tracing::debug!(aggregate_type = A::AGGREGATE_TYPE, stream_id = %id, "stream handle released");
        }
        removed
    }

    /// Whether a handle for `id` is cached.
    pub fn contains(&self, id: &str) -> bool {
        self.handles.contains_key(id)
    }

    /// Cached ids, oldest first.
    pub fn list_ids(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the cache holds no handles.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// [`StreamHandle::get_copy_of_state`] on the handle for `id`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get) and [`StreamHandle::get_copy_of_state`].
    pub async fn get_copy_of_state(
        &mut self,
        id: &str,
        force_refresh: Option<bool>,
    ) -> Result<A, StreamError> {
        self.get(id).await?.get_copy_of_state(force_refresh).await
    }

    /// [`StreamHandle::post_event`] on the handle for `id`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get) and [`StreamHandle::post_event`].
    pub async fn post_event(
        &mut self,
        id: &str,
        event: impl Into<EventEnvelope<A::DomainEvent>>,
        options: PostOptions,
    ) -> Result<PostOutcome<A>, StreamError> {
        self.get(id).await?.post_event(event, options).await
    }

    /// [`StreamHandle::post_events`] on the handle for `id`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get) and [`StreamHandle::post_events`].
    pub async fn post_events(
        &mut self,
        id: &str,
        events: Vec<EventEnvelope<A::DomainEvent>>,
        options: PostOptions,
    ) -> Result<PostOutcome<A>, StreamError> {
        self.get(id).await?.post_events(events, options).await
    }

    fn trim(&mut self) {
        if self.queue_size == 0 {
            return;
        }
        while self.order.len() > self.queue_size {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.handles.remove(&oldest);
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                stream_id = %oldest,
                "stream handle evicted"
            );
        }
    }
}
