//! Request coalescing.
//!
//! Concurrent callers asking for the same key share one execution of the
//! work. The first caller (the leader) runs it; everyone arriving while it
//! is in flight waits and receives a clone of the leader's result.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Clone)]
enum Outcome<T> {
    Value(T),
    Panicked(String),
}

type Slot<T> = watch::Receiver<Option<Outcome<T>>>;

/// Result of [`SingleFlight::work`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flight<T> {
    pub value: T,
    /// `true` when this caller received another caller's result.
    pub shared: bool,
}

/// Per-key coalescing of concurrent work.
///
/// A wave ends when the leader finishes; the key is then free and the next
/// caller starts a new wave. If the work panics, the leader and every
/// waiter observe the panic. If the leader is cancelled before finishing,
/// waiters retry and one of them becomes the new leader.
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Slot<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<T> {
    Leader(watch::Sender<Option<Outcome<T>>>),
    Waiter(Slot<T>),
}

/// Frees the key if the leader's future is dropped mid-flight.
struct LeaderGuard<'a, T> {
    calls: &'a Mutex<HashMap<String, Slot<T>>>,
    key: &'a str,
    armed: bool,
}

impl<T> LeaderGuard<'_, T> {
    fn release(mut self) {
        self.calls.lock().remove(self.key);
        self.armed = false;
    }
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.calls.lock().remove(self.key);
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    pub async fn work<F, Fut>(&self, key: &str, make: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut make = Some(make);
        loop {
            let role = {
                let mut calls = self.calls.lock();
                match calls.get(key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        calls.insert(key.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Waiter(mut rx) => {
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(done) => done.clone(),
                        // Leader dropped without finishing; compete again.
                        Err(_) => continue,
                    };
                    match outcome {
                        Some(Outcome::Value(value)) => {
                            return Flight {
                                value,
                                shared: true,
                            };
                        }
                        Some(Outcome::Panicked(message)) => std::panic::resume_unwind(Box::new(message)),
                        None => continue,
                    }
                }
                Role::Leader(tx) => {
                    let Some(make) = make.take() else {
                        unreachable!("a caller leads at most once");
                    };
                    let guard = LeaderGuard {
                        calls: &self.calls,
                        key,
                        armed: true,
                    };
                    let result = AssertUnwindSafe(make()).catch_unwind().await;
                    guard.release();

                    return match result {
                        Ok(value) => {
                            tx.send_replace(Some(Outcome::Value(value.clone())));
                            Flight {
                                value,
                                shared: false,
                            }
                        }
                        Err(payload) => {
                            tx.send_replace(Some(Outcome::Panicked(panic_message(&*payload))));
                            std::panic::resume_unwind(payload)
                        }
                    };
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "work panicked".to_string()
    }
}
