//! Learning rate schedules
//!
//! A schedule is a comma-separated list of `rate:end_step` pairs, optionally
//! closed by a bare rate that runs until the last step:
//!
//! ```text
//! 0.005:100, 1e-3:1000, 1e-5
//! ```
//!
//! Rates apply up to and including their end step. An end step of `-1`
//! means "until the last step".

use std::collections::VecDeque;

use candle_nn::Optimizer;
use tracing::debug;

use crate::{Result, TrainError};

/// Steps through a learning rate schedule as training advances
#[derive(Debug, Clone)]
pub struct LearnRateScheduler {
    pending: VecDeque<(f64, u64)>,
    learn_rate: f64,
    end_step: u64,
    finished: bool,
}

impl LearnRateScheduler {
    /// Parse `schedule` for a run ending at `max_steps`, resuming at `current_step`
    pub fn new(schedule: &str, max_steps: u64, current_step: u64) -> Result<Self> {
        let mut pending = parse_schedule(schedule, max_steps, current_step)?;
        let (learn_rate, end_step) = pending.pop_front().ok_or_else(|| TrainError::InvalidSchedule {
            schedule: schedule.to_string(),
            reason: format!("no rate applies after step {current_step}"),
        })?;

        Ok(Self {
            pending,
            learn_rate,
            end_step,
            finished: false,
        })
    }

    /// Current learning rate
    pub fn learn_rate(&self) -> f64 {
        self.learn_rate
    }

    /// Last step the current rate applies to
    pub fn end_step(&self) -> u64 {
        self.end_step
    }

    /// Whether the schedule has run out
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Advance to `step`, updating the optimizer when the rate changes
    pub fn apply<O: Optimizer>(&mut self, optimizer: &mut O, step: u64) {
        if step <= self.end_step {
            return;
        }

        match self.pending.pop_front() {
            Some((learn_rate, end_step)) => {
                debug!(step, learn_rate, end_step, "Learning rate changed");
                self.learn_rate = learn_rate;
                self.end_step = end_step;
                optimizer.set_learning_rate(learn_rate);
            }
            None => self.finished = true,
        }
    }
}

fn parse_schedule(
    schedule: &str,
    max_steps: u64,
    current_step: u64,
) -> Result<VecDeque<(f64, u64)>> {
    let invalid = |reason: String| TrainError::InvalidSchedule {
        schedule: schedule.to_string(),
        reason,
    };

    let mut rates = VecDeque::new();

    for entry in schedule.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (rate, end) = match entry.split_once(':') {
            Some((rate, end)) => (rate.trim(), Some(end.trim())),
            None => (entry, None),
        };

        let rate: f64 = rate
            .parse()
            .map_err(|_| invalid(format!("'{rate}' is not a learning rate")))?;

        let Some(end) = end else {
            rates.push_back((rate, max_steps));
            break;
        };

        let end: i64 = end
            .parse()
            .map_err(|_| invalid(format!("'{end}' is not a step number")))?;

        if end == -1 {
            rates.push_back((rate, max_steps));
            break;
        }
        if end > current_step as i64 {
            let end = end as u64;
            rates.push_back((rate, end.min(max_steps)));
            if end > max_steps {
                break;
            }
        }
    }

    Ok(rates)
}
