//! Progress bar driven by the run's progress counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use folio_core::download::ProgressState;
use indicatif::{ProgressBar, ProgressStyle};

/// Spawns the progress bar when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    progress: Arc<ProgressState>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_bar(progress, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_bar(progress: Arc<ProgressState>, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        while !stop.load(Ordering::SeqCst) {
            let snapshot = progress.snapshot();
            bar.set_length(snapshot.total as u64);
            bar.set_position(snapshot.finished() as u64);
            bar.set_message(format!(
                "{} skipped, {} failed, {:.1} MiB",
                snapshot.skipped,
                snapshot.failed,
                snapshot.bytes as f64 / (1024.0 * 1024.0)
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        bar.finish_and_clear();
    })
}

/// Whether to draw the bar: stderr is a terminal and output is not quieted.
pub(crate) fn should_draw(stderr_is_terminal: bool, quiet: bool) -> bool {
    stderr_is_terminal && !quiet && std::env::var("TERM").map_or(true, |term| term != "dumb")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_progress_returns_stopped_signal() {
        let (handle, stop) = spawn_progress_ui(false, Arc::new(ProgressState::new()));
        assert!(handle.is_none());
        assert!(stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_enabled_progress_ends_on_stop() {
        let (handle, stop) = spawn_progress_ui(true, Arc::new(ProgressState::new()));
        assert!(!stop.load(Ordering::SeqCst));
        stop.store(true, Ordering::SeqCst);
        handle.unwrap().await.unwrap();
    }

    #[test]
    fn test_quiet_disables_bar() {
        assert!(!should_draw(true, true));
        assert!(!should_draw(false, false));
    }
}
