//! The recovery state machine: retries placement for a batch of displaced
//! registrations (an "affected set") until they're all rebound, dropped for
//! stream deletion, or the backoff policy times out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::backoff::BackoffPolicy;
use crate::broker::BrokerKey;
use crate::coordinator::CoordinatorInner;
use crate::manager::ClientFactory;
use crate::metadata::{Locator, ResponseCode, StreamMetadata};
use crate::registration::RegistrationId;

/// The producers and committing consumers displaced by a single failure event
/// (or coalesced together from several metadata-change events for the same
/// stream), still waiting for a successful rebind.
#[derive(Debug, Default)]
pub(crate) struct AffectedIds {
    pub(crate) producers: HashSet<RegistrationId>,
    pub(crate) consumers: HashSet<RegistrationId>,
}

impl AffectedIds {
    pub(crate) fn is_empty(&self) -> bool {
        self.producers.is_empty() && self.consumers.is_empty()
    }
}

enum Classification {
    Bind(BrokerKey),
    Pending,
    Deleted,
}

fn classify(meta: Option<StreamMetadata>) -> Classification {
    match meta {
        None => Classification::Deleted,
        Some(m) => match m.response_code() {
            ResponseCode::StreamDoesNotExist => Classification::Deleted,
            ResponseCode::Ok => match m.leader() {
                Some(broker) => Classification::Bind(broker.clone()),
                None => Classification::Pending,
            },
            ResponseCode::StreamNotAvailable
            | ResponseCode::AccessRefused
            | ResponseCode::Other(_) => Classification::Pending,
        },
    }
}

/// Spawns a recovery job owning `affected`. When `coalesce_key` is `Some`, the
/// job is registered under that key so a later metadata event for the same
/// stream can be merged into this job's affected set instead of starting a
/// second, concurrent job for the same stream.
pub(crate) fn spawn<L, F>(
    inner: Arc<CoordinatorInner<L, F>>,
    policy: BackoffPolicy,
    affected: Arc<AsyncMutex<AffectedIds>>,
    coalesce_key: Option<String>,
) where
    L: Locator,
    F: ClientFactory,
{
    tokio::spawn(async move {
        run(inner, policy, affected, coalesce_key).await;
    });
}

async fn run<L, F>(
    inner: Arc<CoordinatorInner<L, F>>,
    policy: BackoffPolicy,
    affected: Arc<AsyncMutex<AffectedIds>>,
    coalesce_key: Option<String>,
) where
    L: Locator,
    F: ClientFactory,
{
    let mut attempt: u32 = 1;
    loop {
        let delay = policy.delay(attempt);
        if BackoffPolicy::is_timeout(delay) {
            if inner.is_closed().await {
                return;
            }
            finish_timeout(&inner, &affected, &coalesce_key).await;
            return;
        }
        tokio::time::delay_for(delay).await;

        if inner.is_closed().await {
            return;
        }

        let (pending_producers, pending_consumers) = {
            let guard = affected.lock().await;
            (guard.producers.clone(), guard.consumers.clone())
        };

        let mut streams: HashSet<String> = HashSet::new();
        {
            let state = inner.state.lock().await;
            for id in &pending_producers {
                if let Some(e) = state.producers.get(id) {
                    streams.insert(e.stream.clone());
                }
            }
            for id in &pending_consumers {
                if let Some(e) = state.consumers.get(id) {
                    streams.insert(e.stream.clone());
                }
            }
        }

        let mut lookups: FuturesUnordered<_> = streams
            .iter()
            .map(|stream| {
                let inner = inner.clone();
                async move { (stream.clone(), inner.locator.metadata(stream).await) }
            })
            .collect();

        let mut metadata_by_stream: HashMap<String, Option<StreamMetadata>> = HashMap::new();
        let mut transient_error = false;
        while let Some((stream, result)) = lookups.next().await {
            match result {
                Ok(meta) => {
                    metadata_by_stream.insert(stream, meta);
                }
                Err(error) => {
                    tracing::warn!(%stream, %error, attempt, "metadata lookup failed during recovery attempt");
                    transient_error = true;
                }
            }
        }
        drop(lookups);

        if transient_error {
            attempt += 1;
            continue;
        }

        for id in pending_producers {
            let stream = {
                let state = inner.state.lock().await;
                state.producers.get(&id).map(|e| e.stream.clone())
            };
            let stream = match stream {
                Some(s) => s,
                None => {
                    // Released or already torn down by the user concurrently.
                    affected.lock().await.producers.remove(&id);
                    continue;
                }
            };
            match classify(metadata_by_stream.get(&stream).cloned().unwrap_or(None)) {
                Classification::Deleted => {
                    let removed = {
                        let mut state = inner.state.lock().await;
                        state.producers.remove(&id)
                    };
                    if let Some(entry) = removed {
                        tracing::info!(%stream, "producer stream deleted during recovery, closing");
                        entry.hooks.close_after_stream_deletion();
                    }
                    affected.lock().await.producers.remove(&id);
                }
                Classification::Pending => {}
                Classification::Bind(broker) => match inner.rebind_producer(id, &broker).await {
                    Ok(()) => {
                        affected.lock().await.producers.remove(&id);
                    }
                    Err(error) => {
                        tracing::warn!(%stream, %error, "rebind failed during recovery attempt, will retry");
                    }
                },
            }
        }

        for id in pending_consumers {
            let stream = {
                let state = inner.state.lock().await;
                state.consumers.get(&id).map(|e| e.stream.clone())
            };
            let stream = match stream {
                Some(s) => s,
                None => {
                    affected.lock().await.consumers.remove(&id);
                    continue;
                }
            };
            match classify(metadata_by_stream.get(&stream).cloned().unwrap_or(None)) {
                Classification::Deleted => {
                    let mut state = inner.state.lock().await;
                    state.consumers.remove(&id);
                    drop(state);
                    tracing::info!(%stream, "committing consumer's stream deleted during recovery, detaching");
                    affected.lock().await.consumers.remove(&id);
                }
                Classification::Pending => {}
                Classification::Bind(broker) => match inner.rebind_consumer(id, &broker).await {
                    Ok(()) => {
                        affected.lock().await.consumers.remove(&id);
                    }
                    Err(error) => {
                        tracing::warn!(%stream, %error, "rebind failed during recovery attempt, will retry");
                    }
                },
            }
        }

        if let Some(key) = &coalesce_key {
            let mut state = inner.state.lock().await;
            if affected.lock().await.is_empty() {
                state.topology_jobs.remove(key);
                return;
            }
        } else if affected.lock().await.is_empty() {
            return;
        }

        attempt += 1;
    }
}

async fn finish_timeout<L, F>(
    inner: &Arc<CoordinatorInner<L, F>>,
    affected: &Arc<AsyncMutex<AffectedIds>>,
    coalesce_key: &Option<String>,
) where
    L: Locator,
    F: ClientFactory,
{
    let (producer_ids, consumer_ids) = {
        let guard = affected.lock().await;
        (guard.producers.clone(), guard.consumers.clone())
    };

    let removed_producers = {
        let mut state = inner.state.lock().await;
        let removed: Vec<_> = producer_ids
            .into_iter()
            .filter_map(|id| state.producers.remove(&id))
            .collect();
        for id in consumer_ids {
            state.consumers.remove(&id);
        }
        if let Some(key) = coalesce_key {
            state.topology_jobs.remove(key);
        }
        removed
    };

    for entry in removed_producers {
        tracing::warn!("recovery timed out, closing producer after stream deletion/unavailability");
        entry.hooks.close_after_stream_deletion();
    }
}
