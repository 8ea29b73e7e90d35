//! Owner records buffered by a running task until a stripe is full.

use std::sync::Arc;

use preload_core::{LoadError, Record, Result};

use crate::dependent::DependentFeed;
use crate::engine::EngineShared;

/// Every buffered record counts once per feed against the outstanding work
/// until its stripe has been handed to the key indices. Records still
/// buffered when the buffer is dropped are discounted again.
pub(crate) struct StripeBuffer {
    shared: Arc<EngineShared>,
    capacity: usize,
    feeds: Vec<DependentFeed>,
    records: Vec<Arc<Record>>,
}

impl StripeBuffer {
    pub fn new(shared: Arc<EngineShared>, capacity: usize, feeds: Vec<DependentFeed>) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: if feeds.is_empty() {
                Vec::new()
            } else {
                Vec::with_capacity(capacity)
            },
            shared,
            capacity,
            feeds,
        }
    }

    pub fn push(&mut self, record: &Arc<Record>) -> Result<()> {
        if self.feeds.is_empty() {
            return Ok(());
        }
        self.shared.change_count(self.feeds.len() as i64);
        self.records.push(Arc::clone(record));
        if self.records.len() >= self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    /// Hand the buffered records to every feed's key index.
    pub fn flush(&mut self) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        let stripe = Arc::new(std::mem::take(&mut self.records));
        let mut result = Ok(());
        for feed in &self.feeds {
            let submitted = match self.shared.spawner(feed.spawner) {
                Some(spawner) => spawner.submit_stripe(&self.shared, feed, Arc::clone(&stripe)),
                None => Err(LoadError::Config(format!(
                    "dependent spawner {} is not registered",
                    feed.spawner
                ))),
            };
            if let Err(e) = submitted {
                self.shared.change_count(-(stripe.len() as i64));
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for StripeBuffer {
    fn drop(&mut self) {
        if !self.records.is_empty() {
            self.shared
                .change_count(-((self.records.len() * self.feeds.len()) as i64));
        }
    }
}
