//! Cross-instance invalidation of the local tier
//!
//! Every put and evict publishes an [`Invalidation`] on a bus. Each engine runs a
//! listener that drops the named key (or namespace) from its own local tier,
//! skipping messages it published itself. The listener resubscribes with capped
//! exponential backoff whenever its subscription ends or fails.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::{CacheError, LocalTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationScope {
    /// `target` is a full cache key.
    Key,
    /// `target` is a key prefix covering a whole namespace.
    Namespace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    /// Instance id of the publishing engine
    pub origin: String,
    pub scope: InvalidationScope,
    pub target: String,
}

/// Transport for invalidation messages.
#[async_trait]
pub trait InvalidationBus: Send + Sync + 'static {
    async fn publish(&self, message: &Invalidation) -> Result<(), CacheError>;

    /// Subscribe to all messages published from now on.
    async fn subscribe(&self) -> Result<BoxStream<'static, Invalidation>, CacheError>;
}

/// In-process bus on a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Invalidation>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl InvalidationBus for LocalBus {
    async fn publish(&self, message: &Invalidation) -> Result<(), CacheError> {
        // No receivers is fine: nobody holds a local tier that needs clearing.
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Invalidation>, CacheError> {
        let rx = self.tx.subscribe();
        Ok(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Invalidation listener lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

/// Publishes invalidations on behalf of one engine instance.
#[derive(Clone)]
pub(crate) struct Publisher {
    bus: Arc<dyn InvalidationBus>,
    origin: String,
}

impl Publisher {
    pub(crate) fn new(bus: Arc<dyn InvalidationBus>, origin: String) -> Self {
        Self { bus, origin }
    }

    /// Best effort: a failed publish leaves other instances stale until their
    /// local TTL runs out, which is logged but not surfaced.
    pub(crate) async fn publish(&self, scope: InvalidationScope, target: &str) {
        let message = Invalidation {
            origin: self.origin.clone(),
            scope,
            target: target.to_owned(),
        };
        match self.bus.publish(&message).await {
            Ok(()) => debug!("Invalidation published for {}", target),
            Err(e) => warn!(
                "Failed to publish invalidation for {}: {}. Continuing.",
                target, e
            ),
        }
    }
}

async fn apply(local: &LocalTier, message: &Invalidation) {
    match message.scope {
        InvalidationScope::Key => {
            local.invalidate(&message.target).await;
            debug!("Local tier invalidated for key: {}", message.target);
        }
        InvalidationScope::Namespace => {
            local.invalidate_prefix(&message.target).await;
        }
    }
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Run the invalidation listener for one engine, starting from an already
/// established subscription so no message published after construction is missed.
pub(crate) fn spawn_listener(
    bus: Arc<dyn InvalidationBus>,
    local: LocalTier,
    origin: String,
    initial: BoxStream<'static, Invalidation>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut current = Some(initial);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let subscription = match current.take() {
                Some(s) => Ok(s),
                None => bus.subscribe().await,
            };

            match subscription {
                Ok(mut messages) => {
                    backoff = INITIAL_BACKOFF;
                    while let Some(message) = messages.next().await {
                        if message.origin != origin {
                            apply(&local, &message).await;
                        }
                    }
                    warn!("Invalidation subscription ended; resubscribing");
                }
                Err(e) => {
                    error!(
                        "Invalidation subscribe failed: {}; retrying in {:?}",
                        e, backoff
                    );
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
        }
    })
}
