//! Transfer speed display.
//!
//! Workers report one integer per block moved. A background task folds
//! those into one-second samples and shows the rolling average of the
//! last 30 on an indicatif line. Pure observer: nothing in the transfer
//! path ever reads back from here.

use std::collections::VecDeque;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Samples kept in the rolling window, at one sample per second.
const WINDOW: usize = 30;

/// Owns the display task and the sending side of the byte-count channel.
pub struct SpeedReporter {
    tx: mpsc::UnboundedSender<u64>,
    task: JoinHandle<()>,
}

impl SpeedReporter {
    /// Spawns the display task. With a known total the line is a byte
    /// bar (collector: every payload byte arrives exactly once); without
    /// one it is a spinner (supplier: retried blocks re-serve bytes).
    pub fn spawn(role: &'static str, total_bytes: Option<u64>) -> Self {
        let bar = match total_bytes {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{prefix:>4} {bar:30.cyan/blue} {bytes}/{total_bytes} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("{prefix:>4} {spinner} {bytes} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar
            }
        };
        bar.set_prefix(role);
        bar.enable_steady_tick(Duration::from_millis(100));

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(bar, rx));
        SpeedReporter { tx, task }
    }

    /// A channel end to hand to a worker.
    pub fn sender(&self) -> mpsc::UnboundedSender<u64> {
        self.tx.clone()
    }

    /// Clears the line once every worker-held sender is gone.
    pub async fn finish(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

async fn run(bar: ProgressBar, mut rx: mpsc::UnboundedReceiver<u64>) {
    let mut window: VecDeque<u64> = VecDeque::with_capacity(WINDOW);
    let mut this_second = 0u64;
    let period = Duration::from_secs(1);
    let mut ticker = interval_at(Instant::now() + period, period);
    // A stalled task must not burst several window samples at once.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(bytes) => {
                    this_second += bytes;
                    bar.inc(bytes);
                }
                None => break,
            },
            _ = ticker.tick() => {
                record_sample(&mut window, this_second);
                this_second = 0;
                bar.set_message(speed_message(&window));
            }
        }
    }
    bar.finish_and_clear();
}

fn record_sample(window: &mut VecDeque<u64>, bytes: u64) {
    if window.len() == WINDOW {
        window.pop_front();
    }
    window.push_back(bytes);
}

fn speed_message(window: &VecDeque<u64>) -> String {
    let total: u64 = window.iter().sum();
    let avg = total as f64 / window.len().max(1) as f64 / 1_048_576.0;
    format!("{avg:.2} MB/s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_drops_oldest_sample() {
        let mut window = VecDeque::new();
        for i in 0..WINDOW as u64 + 5 {
            record_sample(&mut window, i);
        }
        assert_eq!(window.len(), WINDOW);
        assert_eq!(*window.front().unwrap(), 5);
    }

    #[test]
    fn average_over_partial_window() {
        let mut window = VecDeque::new();
        record_sample(&mut window, 2 * 1_048_576);
        record_sample(&mut window, 4 * 1_048_576);
        assert_eq!(speed_message(&window), "3.00 MB/s");
    }

    #[tokio::test]
    async fn reporter_drains_and_finishes() {
        let reporter = SpeedReporter::spawn("test", Some(1024));
        let tx = reporter.sender();
        tx.send(512).unwrap();
        tx.send(512).unwrap();
        drop(tx);
        reporter.finish().await;
    }
}
