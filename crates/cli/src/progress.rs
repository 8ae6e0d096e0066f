// crates/cli/src/progress.rs
use std::collections::HashMap;

use darkhorses_jobs::{JobId, JobProgress};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {spinner} {prefix:<20} [{bar:30}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Draw one bar per job from the registry's progress feed until `expected`
/// jobs have stopped.
pub fn render(mut rx: broadcast::Receiver<JobProgress>, expected: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let mut bars: HashMap<JobId, ProgressBar> = HashMap::new();
        let mut stopped = 0usize;

        while stopped < expected {
            let progress = match rx.recv().await {
                Ok(p) => p,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let bar = bars.entry(progress.job_id).or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(progress.total));
                bar.set_style(bar_style());
                bar.set_prefix(progress.job_type.clone());
                bar
            });
            if bar.is_finished() {
                continue;
            }
            if progress.total > 0 {
                bar.set_length(progress.total);
            }
            bar.set_position(progress.current);
            if let Some(msg) = &progress.message {
                bar.set_message(msg.clone());
            }
            if progress.status.is_stopped() {
                bar.finish_with_message(progress.status.to_string());
                stopped += 1;
            }
        }
    })
}
