use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use rampart_core::{Clock, CoreError};

use super::{BreakerSettings, BreakerState, CircuitBreaker};

/// Named breakers, created on first use with shared settings.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                name,
                self.settings.clone(),
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Run `fut` under the breaker called `name`.
    pub async fn execute<T, Fut>(&self, name: &str, fut: Fut) -> Result<T, CoreError>
    where
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.get(name).execute(fut).await
    }

    /// Every breaker's current state, sorted by name.
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
