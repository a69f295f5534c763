use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Token bucket backed by a semaphore. A background task drips one token per
/// interval up to `burst`; callers consume one token per request.
pub struct RateLimiter {
    sem: Arc<Semaphore>,
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self { RateLimiter { sem: self.sem.clone() } }
}

impl RateLimiter {
    /// Must be called inside a tokio runtime.
    pub fn new(tokens_per_minute: u32, burst: u32) -> Self {
        let burst = burst.max(1) as usize;
        let sem = Arc::new(Semaphore::new(burst));
        let sem_bg = Arc::downgrade(&sem);
        let interval_ms = (60_000u64 / tokens_per_minute.max(1) as u64).max(1);
        tokio::spawn(async move {
            let mut t = tokio::time::interval(Duration::from_millis(interval_ms));
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t.tick().await;
            loop {
                t.tick().await;
                let Some(sem) = sem_bg.upgrade() else { break };
                if sem.available_permits() < burst {
                    sem.add_permits(1);
                }
            }
        });
        RateLimiter { sem }
    }

    pub async fn acquire(&self) {
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }

    /// Wait at most `wait` for a token.
    pub async fn acquire_within(&self, wait: Duration) -> bool {
        match tokio::time::timeout(wait, self.sem.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => false,
        }
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}
