// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight: concurrent callers with the same key share one execution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

/// The flight's task ended without a value (panicked or aborted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("in-flight task ended without a result")]
pub struct FlightAborted;

type Flight<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;
type Flights<T> = Arc<Mutex<HashMap<String, Flight<T>>>>;

pub struct FlightGroup<T: Clone> {
    flights: Flights<T>,
}

impl<T: Clone> Default for FlightGroup<T> {
    fn default() -> Self {
        Self { flights: Arc::new(Mutex::new(HashMap::new())) }
    }
}

/// Removes the flight's entry when its task finishes, panics included.
struct Landing<T: Clone> {
    flights: Flights<T>,
    key: String,
}

impl<T: Clone> Drop for Landing<T> {
    fn drop(&mut self) {
        self.flights.lock().remove(&self.key);
    }
}

impl<T> FlightGroup<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start one with `start`. Returns the shared
    /// future and whether this caller started it.
    ///
    /// The work runs on its own task, so it completes and leaves the group
    /// even when every waiter is dropped. A later call then starts fresh.
    pub fn join_or_start<F, Fut>(&self, key: &str, start: F) -> (Flight<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut flights = self.flights.lock();
        if let Some(existing) = flights.get(key) {
            return (existing.clone(), false);
        }

        // The landing blocks on the group lock, so it cannot remove the
        // entry before it is inserted below.
        let landing = Landing { flights: Arc::clone(&self.flights), key: key.to_owned() };
        let work = start();
        let handle = tokio::spawn(async move {
            let _landing = landing;
            work.await
        });
        let flight = async move {
            handle.await.map_err(|e| {
                tracing::error!(err = %e, "in-flight task failed");
                FlightAborted
            })
        }
        .boxed()
        .shared();
        flights.insert(key.to_owned(), flight.clone());
        (flight, true)
    }

    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.flights.lock().contains_key(key)
    }
}

#[cfg(test)]
#[path = "flight_tests.rs"]
mod tests;
