//! Background TTL sweep: periodic eviction of expired envelopes across every
//! available backend.
//!
//! Lazy expiration (treating an expired entry as a miss at read time) lives in
//! the orchestrator's read path; this module owns the periodic sweep. Each
//! cycle inspects at most `batch_size` candidates per backend and invokes the
//! expiration callback once with the full list of evicted keys.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use polystore_backend::EnvelopeFilter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use polystore_codec::now_millis;

use crate::registry::AdapterRegistry;

/// Sweep scheduling parameters.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Interval between sweep cycles.
    pub interval: Duration,
    /// Maximum candidate keys inspected per backend per cycle.
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Invoked once per sweep cycle with every key evicted that cycle.
pub type ExpirationCallback = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Handle to the running sweep task; shut down via [`SweeperHandle::shutdown`].
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweep task and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Spawns the background sweep task.
pub fn spawn_sweeper(
    registry: Arc<AdapterRegistry>,
    config: SweepConfig,
    callback: Option<ExpirationCallback>,
) -> SweeperHandle {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a cycle never races
        // store construction.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = sweep_cycle(&registry, config.batch_size).await;
                    if !evicted.is_empty() {
                        debug!(count = evicted.len(), "ttl sweep evicted keys");
                        if let Some(cb) = &callback {
                            cb(&evicted);
                        }
                    }
                }
                _ = stopped.changed() => break,
            }
        }
    });
    SweeperHandle { stop, task }
}

/// One sweep over every available backend. Returns the evicted keys.
pub async fn sweep_cycle(registry: &AdapterRegistry, batch_size: usize) -> Vec<String> {
    let now = now_millis();
    let mut evicted = BTreeSet::new();

    for name in registry.available_names() {
        let Some(backend) = registry.backend(&name) else {
            continue;
        };
        let filter = EnvelopeFilter {
            expires_before: Some(now + 1), // expires <= now
            ..Default::default()
        };
        // Queryable backends prefilter natively; the rest get a full scan.
        let candidates = match backend.query(&filter).await {
            Ok(Some(hits)) => hits,
            Ok(None) => match backend.scan().await {
                Ok(all) => all
                    .into_iter()
                    .filter(|(_, env)| env.is_expired_at(now))
                    .collect(),
                Err(e) => {
                    warn!(backend = %name, error = %e, "ttl sweep scan failed");
                    continue;
                }
            },
            Err(e) => {
                warn!(backend = %name, error = %e, "ttl sweep query failed");
                continue;
            }
        };

        for (key, _) in candidates.into_iter().take(batch_size) {
            match backend.remove(&key).await {
                Ok(()) => {
                    evicted.insert(key);
                }
                Err(e) => warn!(backend = %name, key = %key, error = %e,
                    "ttl sweep eviction failed"),
            }
        }
    }
    evicted.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use polystore_backend::{MemoryBackend, StorageBackend};
    use polystore_codec::Envelope;
    use std::sync::Mutex;

    async fn registry_with_memory() -> (Arc<AdapterRegistry>, Arc<MemoryBackend>) {
        let registry = Arc::new(AdapterRegistry::new(vec![]));
        let backend = Arc::new(MemoryBackend::new("memory"));
        registry.register(backend.clone()).await.unwrap();
        (registry, backend)
    }

    fn expired_env() -> Envelope {
        let mut env = Envelope::new(b"x".to_vec(), false, false);
        env.created = env.created.saturating_sub(1_000);
        env.updated = env.created;
        env.expires = Some(env.created + 1);
        env
    }

    fn live_env(ttl_ms: u64) -> Envelope {
        let mut env = Envelope::new(b"x".to_vec(), false, false);
        env.expires = Some(env.created + ttl_ms);
        env
    }

    #[tokio::test]
    async fn test_cycle_removes_only_expired() {
        let (registry, backend) = registry_with_memory().await;
        backend.set("dead", expired_env()).await.unwrap();
        backend.set("alive", live_env(60_000)).await.unwrap();
        backend
            .set("forever", Envelope::new(b"x".to_vec(), false, false))
            .await
            .unwrap();

        let evicted = sweep_cycle(&registry, 100).await;
        assert_eq!(evicted, vec!["dead".to_string()]);
        assert!(!backend.has("dead").await.unwrap());
        assert!(backend.has("alive").await.unwrap());
        assert!(backend.has("forever").await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_size_caps_a_cycle() {
        let (registry, backend) = registry_with_memory().await;
        for i in 0..10 {
            backend.set(&format!("k{i}"), expired_env()).await.unwrap();
        }

        let evicted = sweep_cycle(&registry, 3).await;
        assert_eq!(evicted.len(), 3);
        // The next cycle picks up the remainder.
        let evicted = sweep_cycle(&registry, 100).await;
        assert_eq!(evicted.len(), 7);
    }

    #[tokio::test]
    async fn test_callback_invoked_once_per_cycle() {
        let (registry, backend) = registry_with_memory().await;
        backend.set("a", expired_env()).await.unwrap();
        backend.set("b", expired_env()).await.unwrap();

        let batches: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let callback: ExpirationCallback = Arc::new(move |keys: &[String]| {
            sink.lock().unwrap().push(keys.to_vec());
        });

        let handle = spawn_sweeper(
            registry,
            SweepConfig {
                interval: Duration::from_millis(20),
                batch_size: 100,
            },
            Some(callback),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.shutdown().await;

        let batches = batches.lock().unwrap();
        // One cycle caught both keys in a single callback invocation.
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec!["a".to_string(), "b".to_string()]);
        assert!(backend.has("a").await.is_ok_and(|h| !h));
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeping() {
        let (registry, backend) = registry_with_memory().await;
        let handle = spawn_sweeper(
            registry,
            SweepConfig {
                interval: Duration::from_millis(10),
                batch_size: 100,
            },
            None,
        );
        handle.shutdown().await;

        backend.set("dead", expired_env()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        // No sweeper left to evict it.
        assert!(backend.has("dead").await.unwrap());
    }
}
