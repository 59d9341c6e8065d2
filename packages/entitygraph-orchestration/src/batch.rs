//! Adaptive batch-size controller
//!
//! Rolling average of seconds per item over the last `window` batches:
//! below the fast threshold the batch grows by one step, above the slow
//! threshold it shrinks by one step, always inside `[min_size, max_size]`.
//! Repeated backpressure failures reset the size to the minimum.

use entitygraph_storage::{KeyValueStore, KvExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::BatchSettings;
use crate::error::Result;
use crate::phase::Phase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchControllerState {
    pub size: usize,
    /// Seconds per item of the most recent batches, oldest first
    pub samples: VecDeque<f64>,
    pub consecutive_failures: u32,
}

pub struct AdaptiveBatchController {
    settings: BatchSettings,
    state: BatchControllerState,
}

impl AdaptiveBatchController {
    pub fn new(settings: BatchSettings) -> Self {
        let size = settings
            .default_size
            .clamp(settings.min_size, settings.max_size);
        Self::from_state(
            settings,
            BatchControllerState {
                size,
                samples: VecDeque::new(),
                consecutive_failures: 0,
            },
        )
    }

    pub fn from_state(settings: BatchSettings, mut state: BatchControllerState) -> Self {
        state.size = state.size.clamp(settings.min_size, settings.max_size);
        while state.samples.len() > settings.window {
            state.samples.pop_front();
        }
        Self { settings, state }
    }

    /// Restore the persisted controller for `phase`, or start fresh
    pub async fn load(kv: &dyn KeyValueStore, phase: Phase, settings: BatchSettings) -> Result<Self> {
        let saved: Option<BatchControllerState> = kv.get_typed(&Self::key(phase)).await?;
        Ok(match saved {
            Some(state) => Self::from_state(settings, state),
            None => Self::new(settings),
        })
    }

    pub async fn save(&self, kv: &dyn KeyValueStore, phase: Phase) -> Result<()> {
        kv.set_typed(&Self::key(phase), &self.state).await?;
        Ok(())
    }

    fn key(phase: Phase) -> String {
        format!("entitygraph:job:{}:batch_controller", phase.as_str())
    }

    pub fn current(&self) -> usize {
        self.state.size
    }

    pub fn state(&self) -> &BatchControllerState {
        &self.state
    }

    /// Rolling average seconds per item, if any sample exists
    pub fn average_secs_per_item(&self) -> Option<f64> {
        if self.state.samples.is_empty() {
            return None;
        }
        Some(self.state.samples.iter().sum::<f64>() / self.state.samples.len() as f64)
    }

    /// Record a finished batch and return the next batch size
    pub fn record(&mut self, elapsed: Duration, items: usize) -> usize {
        self.state.consecutive_failures = 0;
        if items == 0 {
            return self.state.size;
        }

        self.state
            .samples
            .push_back(elapsed.as_secs_f64() / items as f64);
        while self.state.samples.len() > self.settings.window {
            self.state.samples.pop_front();
        }

        let average = self.average_secs_per_item().unwrap_or_default();
        let previous = self.state.size;
        if average < self.settings.fast_threshold_secs {
            self.state.size = (previous + self.settings.step).min(self.settings.max_size);
        } else if average > self.settings.slow_threshold_secs {
            self.state.size = previous
                .saturating_sub(self.settings.step)
                .max(self.settings.min_size);
        }

        if self.state.size != previous {
            debug!(
                "Batch size {} -> {} (avg {:.3}s/item)",
                previous, self.state.size, average
            );
        }
        self.state.size
    }

    /// Record a backpressure failure; resets after too many in a row
    pub fn record_failure(&mut self) -> usize {
        self.state.consecutive_failures += 1;
        if self.state.consecutive_failures >= self.settings.reset_after_failures {
            info!(
                "{} consecutive failures, resetting batch size to {}",
                self.state.consecutive_failures, self.settings.min_size
            );
            self.reset();
        }
        self.state.size
    }

    /// Drop history and fall back to the minimum size
    pub fn reset(&mut self) {
        self.state.size = self.settings.min_size;
        self.state.samples.clear();
        self.state.consecutive_failures = 0;
    }
}
