use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ldata_core::{ProgressMode, ProgressTracker};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(100);

/// Live terminal rendering of a [`ProgressTracker`]: one total bar, plus a
/// bar per occupied display slot in tasks mode.
pub struct ProgressRenderer {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressRenderer {
    pub fn spawn(tracker: Arc<ProgressTracker>) -> Option<Self> {
        if tracker.mode() == ProgressMode::None {
            return None;
        }

        let stop = CancellationToken::new();
        let loop_stop = stop.clone();
        let handle = tokio::spawn(render_loop(tracker, loop_stop));
        Some(Self { stop, handle })
    }

    pub async fn finish(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}

fn total_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
    )
    .expect("total bar template")
    .progress_chars("=> ")
}

fn slot_style() -> ProgressStyle {
    ProgressStyle::with_template("  {msg:<24!} [{bar:30.cyan/blue}] {bytes}/{total_bytes}")
        .expect("slot bar template")
        .progress_chars("=> ")
}

async fn render_loop(tracker: Arc<ProgressTracker>, stop: CancellationToken) {
    let multi = MultiProgress::new();
    let total = multi.add(ProgressBar::new(0));
    total.set_style(total_style());

    let slot_count = tracker.snapshot().slots.len();
    let mut slot_bars: Vec<Option<ProgressBar>> = (0..slot_count).map(|_| None).collect();

    let mut ticker = tokio::time::interval(TICK);
    loop {
        let finished = tokio::select! {
            _ = ticker.tick() => false,
            _ = stop.cancelled() => true,
        };

        let snapshot = tracker.snapshot();
        total.set_length(snapshot.bytes_total.max(snapshot.bytes_done));
        total.set_position(snapshot.bytes_done);
        total.set_message(format!(
            "{}/{} files",
            snapshot.files_done, snapshot.files_total
        ));

        for (index, state) in snapshot.slots.iter().enumerate() {
            match (state, &mut slot_bars[index]) {
                (Some(state), Some(bar)) => {
                    bar.set_length(state.bytes_total.max(state.bytes_done));
                    bar.set_position(state.bytes_done);
                    bar.set_message(state.label.clone());
                }
                (Some(state), bar @ None) => {
                    let new_bar = multi.add(ProgressBar::new(state.bytes_total));
                    new_bar.set_style(slot_style());
                    new_bar.set_message(state.label.clone());
                    new_bar.set_position(state.bytes_done);
                    *bar = Some(new_bar);
                }
                (None, bar @ Some(_)) => {
                    if let Some(bar) = bar.take() {
                        bar.finish_and_clear();
                        multi.remove(&bar);
                    }
                }
                (None, None) => {}
            }
        }

        if finished {
            break;
        }
    }

    for bar in slot_bars.into_iter().flatten() {
        bar.finish_and_clear();
    }
    total.finish_and_clear();
}
