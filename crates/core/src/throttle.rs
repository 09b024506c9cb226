use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Smoothing factor for the latency moving average.
pub const EMA_ALPHA: f64 = 0.6;
/// Average start-call latency above which the throttle engages.
pub const LATENCY_THRESHOLD_SECS: f64 = 15.0;
/// Delay injected per second of average latency once engaged.
pub const DELAY_FACTOR: f64 = 1.0 / 60.0;

/// Delay to apply before the next start-of-transfer call. Written only by
/// the feedback loop; read by every worker. A single scalar, so no lock.
#[derive(Debug, Default)]
pub struct Throttle {
    delay_micros: AtomicU64,
}

impl Throttle {
    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_micros.load(Ordering::Relaxed))
    }

    fn set_delay(&self, delay: Duration) {
        self.delay_micros
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Producer side of the latency sample stream. Dropping every clone (or
/// calling [`LatencyFeed::close`]) terminates the feedback loop.
#[derive(Debug, Clone)]
pub struct LatencyFeed {
    tx: mpsc::UnboundedSender<Option<Duration>>,
}

impl LatencyFeed {
    pub fn record(&self, sample: Duration) {
        let _ = self.tx.send(Some(sample));
    }

    pub fn close(&self) {
        let _ = self.tx.send(None);
    }
}

pub fn ema_update(ema_secs: f64, sample: Duration) -> f64 {
    (1.0 - EMA_ALPHA) * ema_secs + EMA_ALPHA * sample.as_secs_f64()
}

pub fn delay_for(ema_secs: f64) -> Duration {
    if ema_secs > LATENCY_THRESHOLD_SECS {
        Duration::from_secs_f64(ema_secs * DELAY_FACTOR)
    } else {
        Duration::ZERO
    }
}

/// Start the feedback loop that folds latency samples into the shared delay.
/// The loop runs until it sees the `None` sentinel or the feed is dropped.
pub fn spawn_feedback() -> (Arc<Throttle>, LatencyFeed, JoinHandle<()>) {
    let throttle = Arc::new(Throttle::default());
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<Duration>>();

    let shared = Arc::clone(&throttle);
    let handle = tokio::spawn(async move {
        let mut ema_secs = 0.0;
        while let Some(message) = rx.recv().await {
            let Some(sample) = message else {
                break;
            };
            ema_secs = ema_update(ema_secs, sample);
            let delay = delay_for(ema_secs);
            if !delay.is_zero() {
                debug!(
                    event = "throttle.engaged",
                    ema_ms = (ema_secs * 1000.0) as u64,
                    delay_ms = delay.as_millis() as u64,
                    "throttle.engaged"
                );
            }
            shared.set_delay(delay);
        }
    });

    (throttle, LatencyFeed { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_zero_below_threshold() {
        let mut ema = 0.0;
        for _ in 0..50 {
            ema = ema_update(ema, Duration::from_secs(10));
            assert_eq!(delay_for(ema), Duration::ZERO);
        }
    }

    #[test]
    fn delay_tracks_ema_above_threshold() {
        let mut ema = 0.0;
        for _ in 0..50 {
            ema = ema_update(ema, Duration::from_secs(30));
        }
        // The EMA converges on the sample value.
        assert!((ema - 30.0).abs() < 1e-6);
        let delay = delay_for(ema);
        assert!((delay.as_secs_f64() - 30.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn first_slow_sample_does_not_engage() {
        // One cold call at 20s: ema = 0.6 * 20 = 12, under the threshold.
        let ema = ema_update(0.0, Duration::from_secs(20));
        assert_eq!(delay_for(ema), Duration::ZERO);
    }

    #[tokio::test]
    async fn feedback_loop_updates_shared_delay() {
        let (throttle, feed, handle) = spawn_feedback();
        assert_eq!(throttle.delay(), Duration::ZERO);

        for _ in 0..20 {
            feed.record(Duration::from_secs(30));
        }
        feed.close();
        handle.await.unwrap();

        let delay = throttle.delay();
        assert!(delay > Duration::ZERO);
        assert!((delay.as_secs_f64() - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn feedback_loop_stops_when_feed_is_dropped() {
        let (throttle, feed, handle) = spawn_feedback();
        feed.record(Duration::from_millis(5));
        drop(feed);
        handle.await.unwrap();
        assert_eq!(throttle.delay(), Duration::ZERO);
    }
}
