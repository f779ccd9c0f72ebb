use std::sync::Arc;

use parking_lot::Mutex;

use super::LocalRateLimiter;

/// Limiters created by the application, stopped together at shutdown.
#[derive(Default)]
pub struct LimiterRegistry {
    limiters: Mutex<Vec<Arc<LocalRateLimiter>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `limiter` and start its sweeper.
    pub fn register(&self, limiter: Arc<LocalRateLimiter>) -> Arc<LocalRateLimiter> {
        limiter.start_sweeper();
        self.limiters.lock().push(Arc::clone(&limiter));
        limiter
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every registered limiter's sweeper.
    pub async fn stop_all(&self) {
        let limiters: Vec<_> = self.limiters.lock().drain(..).collect();
        for limiter in &limiters {
            limiter.stop().await;
        }
        tracing::info!(count = limiters.len(), "rate limiters stopped");
    }
}
