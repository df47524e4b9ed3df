use std::sync::Arc;
use std::time::Duration;

use crate::kv::{KvError, KvStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Suppressed,
}

/// Key-based suppression of repeated actions inside a window.
///
/// The first caller inside a window reserves the key and proceeds; everyone
/// else is suppressed until the key expires. A caller whose side effect
/// fails must [`release`](Throttle::release) the key.
#[derive(Clone)]
pub struct Throttle {
    kv: Arc<dyn KvStore>,
}

impl Throttle {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn try_fire(&self, key: &str, window_secs: u64) -> Result<Decision, KvError> {
        let reserved = self
            .kv
            .set_if_absent(key, "1", Some(Duration::from_secs(window_secs)))
            .await?;
        if reserved {
            Ok(Decision::Allowed)
        } else {
            metrics::counter!(crate::observability::THROTTLE_SUPPRESSED_TOTAL).increment(1);
            tracing::debug!("throttled {key}");
            Ok(Decision::Suppressed)
        }
    }

    pub async fn release(&self, key: &str) -> Result<(), KvError> {
        self.kv.delete(key).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::kv::tests::manual_clock;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn suppresses_inside_window_and_reopens_after() {
        let (clock, now) = manual_clock(0);
        let throttle = Throttle::new(Arc::new(InMemoryKv::with_clock(clock)));

        assert_eq!(throttle.try_fire("urge_1", 1800).await.unwrap(), Decision::Allowed);
        now.store(1_000_000, Ordering::SeqCst);
        assert_eq!(throttle.try_fire("urge_1", 1800).await.unwrap(), Decision::Suppressed);
        // Other keys are independent.
        assert_eq!(throttle.try_fire("urge_2", 1800).await.unwrap(), Decision::Allowed);

        now.store(1_800_000, Ordering::SeqCst);
        assert_eq!(throttle.try_fire("urge_1", 1800).await.unwrap(), Decision::Allowed);
    }

    #[tokio::test]
    async fn release_reopens_immediately() {
        let throttle = Throttle::new(Arc::new(InMemoryKv::new()));
        assert_eq!(throttle.try_fire("k", 1800).await.unwrap(), Decision::Allowed);
        throttle.release("k").await.unwrap();
        assert_eq!(throttle.try_fire("k", 1800).await.unwrap(), Decision::Allowed);
    }

    #[tokio::test]
    async fn concurrent_callers_fire_once() {
        let throttle = Throttle::new(Arc::new(InMemoryKv::new()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let throttle = throttle.clone();
            handles.push(tokio::spawn(async move { throttle.try_fire("urge_x", 60).await.unwrap() }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() == Decision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
    }
}
