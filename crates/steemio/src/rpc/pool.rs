//! Multi-endpoint client pool with failover and a short-lived height
//! cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::*;

use crate::errors::ClientError;
use crate::rpc::traits::SteemClient;
use crate::rpc::types::{DynamicGlobalProps, SteemBlock};

/// How long a fetched head height stays fresh.
const HEIGHT_CACHE_TTL: Duration = Duration::from_secs(10);

/// How long a recorded per-endpoint height is trusted when picking the
/// next endpoint.
const ENDPOINT_HEIGHT_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy)]
struct SeenHeight {
    height: u64,
    at: Instant,
}

pub struct SteemClientPool<C> {
    clients: Vec<C>,
    current: AtomicUsize,
    seen: Mutex<Vec<Option<SeenHeight>>>,
    cached_head: Mutex<Option<SeenHeight>>,
}

impl<C: SteemClient> SteemClientPool<C> {
    pub fn new(clients: Vec<C>) -> Self {
        assert!(!clients.is_empty(), "steemio: need at least one endpoint");
        let n = clients.len();
        Self {
            clients,
            current: AtomicUsize::new(0),
            seen: Mutex::new(vec![None; n]),
            cached_head: Mutex::new(None),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.clients.len()
    }

    fn current_idx(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Rotates away from the current endpoint: to the one with the highest
    /// recently-seen height, or round-robin when nothing is known.
    pub fn switch_to_next_endpoint(&self) {
        let cur = self.current_idx();
        if self.clients.len() < 2 {
            return;
        }

        let seen = self.seen.lock();
        let best = seen
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != cur)
            .filter_map(|(i, s)| s.map(|s| (i, s)))
            .filter(|(_, s)| s.at.elapsed() < ENDPOINT_HEIGHT_TTL)
            .max_by_key(|(_, s)| s.height)
            .map(|(i, _)| i);

        let next = best.unwrap_or((cur + 1) % self.clients.len());
        self.current.store(next, Ordering::Relaxed);
        debug!(from = %cur, to = %next, "switched upstream endpoint");
    }

    fn record_height(&self, idx: usize, height: u64) {
        self.seen.lock()[idx] = Some(SeenHeight {
            height,
            at: Instant::now(),
        });
        *self.cached_head.lock() = Some(SeenHeight {
            height,
            at: Instant::now(),
        });
    }

    /// Latest upstream head, served from cache when fresh and positive.
    pub async fn get_latest_height(&self) -> Result<u64, ClientError> {
        if let Some(cached) = *self.cached_head.lock() {
            if cached.height > 0 && cached.at.elapsed() < HEIGHT_CACHE_TTL {
                return Ok(cached.height);
            }
        }

        for attempt in 0..2 {
            let idx = self.current_idx();
            match self.clients[idx].get_dynamic_global_properties().await {
                Ok(props) => {
                    self.record_height(idx, props.head_block_number);
                    return Ok(props.head_block_number);
                }
                Err(e) => {
                    warn!(endpoint = %idx, attempt = %attempt, err = %e, "head height query failed");
                    self.switch_to_next_endpoint();
                }
            }
        }
        Err(ClientError::AllEndpointsFailed)
    }

    /// Fetches a block, retrying once on the next endpoint on failure or
    /// empty response.
    pub async fn get_block(&self, height: u64) -> Result<Option<SteemBlock>, ClientError> {
        for attempt in 0..2 {
            let idx = self.current_idx();
            match self.clients[idx].get_block(height).await {
                Ok(Some(block)) => return Ok(Some(block)),
                Ok(None) => {
                    // Either the block doesn't exist yet or this endpoint
                    // lags; rotate and try once more.
                    if attempt == 0 {
                        self.switch_to_next_endpoint();
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) => {
                    warn!(%height, endpoint = %idx, err = %e, "block fetch failed");
                    self.switch_to_next_endpoint();
                }
            }
        }
        Err(ClientError::AllEndpointsFailed)
    }
}

#[async_trait]
impl<C: SteemClient> SteemClient for SteemClientPool<C> {
    async fn get_dynamic_global_properties(&self) -> Result<DynamicGlobalProps, ClientError> {
        let head_block_number = self.get_latest_height().await?;
        Ok(DynamicGlobalProps { head_block_number })
    }

    async fn get_block(&self, height: u64) -> Result<Option<SteemBlock>, ClientError> {
        SteemClientPool::get_block(self, height).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    #[derive(Default)]
    struct MockClient {
        height: u64,
        fail: bool,
        calls: AtomicU64,
    }

    #[async_trait]
    impl SteemClient for MockClient {
        async fn get_dynamic_global_properties(&self) -> Result<DynamicGlobalProps, ClientError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(ClientError::EmptyResponse);
            }
            Ok(DynamicGlobalProps {
                head_block_number: self.height,
            })
        }

        async fn get_block(&self, _height: u64) -> Result<Option<SteemBlock>, ClientError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(ClientError::EmptyResponse);
            }
            Ok(Some(SteemBlock {
                timestamp: "2024-05-01T12:00:00".to_owned(),
                transactions: vec![],
            }))
        }
    }

    #[tokio::test]
    async fn test_height_cache_serves_second_call() {
        let pool = SteemClientPool::new(vec![MockClient {
            height: 500,
            ..Default::default()
        }]);
        assert_eq!(pool.get_latest_height().await.unwrap(), 500);
        assert_eq!(pool.get_latest_height().await.unwrap(), 500);
        assert_eq!(pool.clients[0].calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failover_to_next_endpoint() {
        let pool = SteemClientPool::new(vec![
            MockClient {
                fail: true,
                ..Default::default()
            },
            MockClient {
                height: 777,
                ..Default::default()
            },
        ]);
        assert_eq!(pool.get_latest_height().await.unwrap(), 777);
        assert_eq!(pool.current_idx(), 1);
    }

    #[tokio::test]
    async fn test_all_endpoints_failing_errors() {
        let pool = SteemClientPool::new(vec![
            MockClient {
                fail: true,
                ..Default::default()
            },
            MockClient {
                fail: true,
                ..Default::default()
            },
        ]);
        assert!(matches!(
            pool.get_latest_height().await,
            Err(ClientError::AllEndpointsFailed)
        ));
    }

    #[tokio::test]
    async fn test_switch_prefers_highest_seen() {
        let pool = SteemClientPool::new(vec![
            MockClient {
                height: 10,
                ..Default::default()
            },
            MockClient {
                height: 5,
                ..Default::default()
            },
            MockClient {
                height: 99,
                ..Default::default()
            },
        ]);
        // Record heights for endpoints 1 and 2.
        pool.record_height(1, 5);
        pool.record_height(2, 99);
        pool.switch_to_next_endpoint();
        assert_eq!(pool.current_idx(), 2);
    }
}
