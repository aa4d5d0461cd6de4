//! Settle-once deferred results.
//!
//! A [`Deferred`] is settled at most once, by whichever of [`Deferred::resolve`]
//! or [`Deferred::reject`] runs first. Later attempts are ignored and report
//! `false`, which is how aggregate operations implement "first failure wins".

use crate::{error::Result, Error};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

type Continuation<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct Inner<T> {
    outcome: Option<Result<T>>,
    continuations: Vec<Continuation<T>>,
}

/// A result that is settled exactly once.
///
/// Cloning yields another handle to the same cell.
pub struct Deferred<T> {
    inner: Arc<Mutex<Inner<T>>>,
    settled: Arc<watch::Sender<bool>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            settled: Arc::clone(&self.settled),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Create a pending cell.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                outcome: None,
                continuations: Vec::new(),
            })),
            settled: Arc::new(tx),
        }
    }

    /// Fulfil the cell. Returns `false` if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Reject the cell. Returns `false` if it was already settled.
    pub fn reject(&self, error: Error) -> bool {
        self.settle(Err(error))
    }

    /// True once the cell has been settled either way.
    pub fn resolved(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    /// The outcome, if settled.
    pub fn peek(&self) -> Option<Result<T>> {
        self.inner.lock().outcome.clone()
    }

    /// Register a continuation that runs on settlement.
    ///
    /// Runs immediately, on the calling thread, if the cell is already settled.
    pub fn then<F>(&self, f: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        match &inner.outcome {
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(inner);
                f(&outcome);
            }
            None => inner.continuations.push(Box::new(f)),
        }
    }

    /// Wait for settlement.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.settled.subscribe();
        loop {
            if let Some(outcome) = self.peek() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return self.peek().unwrap_or(Err(Error::Timeout));
            }
        }
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let continuations = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.continuations)
        };

        for f in continuations {
            f(&outcome);
        }
        self.settled.send_replace(true);
        true
    }
}
