//! Loss smoothing and the CSV loss log

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::Result;

/// Number of recent losses averaged for reporting
pub const LOSS_WINDOW: usize = 32;

/// File name of the loss log inside a run directory
pub const LOSS_LOG_FILE: &str = "hypernetwork_loss.csv";

const LOSS_LOG_HEADER: &str = "step,epoch,epoch_step,loss,learn_rate";

/// Ring buffer of the most recent per-step losses
///
/// Slots are indexed by `step % LOSS_WINDOW`, so a resumed run overwrites
/// the slots its steps map to.
#[derive(Debug, Clone)]
pub struct LossWindow {
    losses: [f64; LOSS_WINDOW],
    recorded: usize,
}

impl LossWindow {
    pub fn new() -> Self {
        Self {
            losses: [0.0; LOSS_WINDOW],
            recorded: 0,
        }
    }

    /// Store the loss of `step`
    pub fn record(&mut self, step: u64, loss: f64) {
        self.losses[(step % LOSS_WINDOW as u64) as usize] = loss;
        self.recorded += 1;
    }

    /// Mean over the filled slots, 0 when nothing was recorded
    pub fn mean(&self) -> f64 {
        let filled = self.recorded.min(LOSS_WINDOW);
        if filled == 0 {
            return 0.0;
        }
        self.losses.iter().sum::<f64>() / filled as f64
    }

    /// Number of losses recorded so far
    pub fn recorded(&self) -> usize {
        self.recorded
    }
}

impl Default for LossWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// One row of the loss log
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossRecord {
    pub step: u64,
    pub epoch: u64,
    pub epoch_step: u64,
    pub loss: f64,
    pub learn_rate: f64,
}

impl LossRecord {
    /// Row for zero-based `step` over a dataset of `dataset_len` samples
    ///
    /// Step, epoch and epoch step are reported one-based.
    pub fn new(step: u64, dataset_len: usize, loss: f64, learn_rate: f64) -> Self {
        let len = dataset_len.max(1) as u64;
        let epoch = step / len;
        Self {
            step: step + 1,
            epoch: epoch + 1,
            epoch_step: step - epoch * len + 1,
            loss,
            learn_rate,
        }
    }

    fn to_csv_line(self) -> String {
        format!(
            "{},{},{},{:.7},{}",
            self.step, self.epoch, self.epoch_step, self.loss, self.learn_rate
        )
    }
}

/// Append-only CSV loss log
#[derive(Debug, Clone)]
pub struct LossLog {
    path: PathBuf,
}

impl LossLog {
    /// Log stored as [`LOSS_LOG_FILE`] inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(LOSS_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a row, writing the header first if the file is new
    pub fn append(&self, record: &LossRecord) -> Result<()> {
        let write_header = !self.path.exists();

        let mut file = File::options().create(true).append(true).open(&self.path)?;
        if write_header {
            writeln!(file, "{LOSS_LOG_HEADER}")?;
        }
        writeln!(file, "{}", record.to_csv_line())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_window() {
        let window = LossWindow::new();
        assert_eq!(window.mean(), 0.0);
    }

    #[test]
    fn test_partial_window_averages_filled_slots() {
        let mut window = LossWindow::new();
        window.record(0, 1.0);
        window.record(1, 3.0);
        assert_eq!(window.mean(), 2.0);
    }

    #[test]
    fn test_window_keeps_last_32() {
        let mut window = LossWindow::new();
        for step in 0..40u64 {
            window.record(step, step as f64);
        }

        // Losses 8..=39
        let expected = (8..40).map(|l| l as f64).sum::<f64>() / 32.0;
        assert!((window.mean() - expected).abs() < 1e-12);
        assert_eq!(window.mean(), 23.5);
        assert_eq!(window.recorded(), 40);
    }

    #[test]
    fn test_record_numbering() {
        let record = LossRecord::new(0, 10, 0.5, 1e-5);
        assert_eq!((record.step, record.epoch, record.epoch_step), (1, 1, 1));

        let record = LossRecord::new(25, 10, 0.5, 1e-5);
        assert_eq!((record.step, record.epoch, record.epoch_step), (26, 3, 6));
    }

    #[test]
    fn test_log_append() {
        let temp_dir = TempDir::new().unwrap();
        let log = LossLog::in_dir(temp_dir.path());

        log.append(&LossRecord::new(0, 4, 0.25, 0.005)).unwrap();
        log.append(&LossRecord::new(5, 4, 0.125, 0.005)).unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "step,epoch,epoch_step,loss,learn_rate",
                "1,1,1,0.2500000,0.005",
                "6,2,2,0.1250000,0.005",
            ]
        );
    }
}
