//! Fixed-interval probe ticker for a single host.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;

use crate::db::Sample;
use crate::probe::{probe, ProbeSettings};

/// Probe `host` every `interval` and stream the samples.
///
/// The stream never ends on its own; dropping the receiver stops the ticker.
pub fn schedule(
    host: String,
    interval: Duration,
    settings: ProbeSettings,
) -> mpsc::Receiver<Sample> {
    let (tx, rx) = mpsc::channel(16);

    let target = host.clone();
    let probe_fn = move || {
        let target = target.clone();
        let settings = settings.clone();
        async move { probe(&target, &settings).await }
    };

    tokio::spawn(run_ticker(host, interval, probe_fn, tx));
    rx
}

/// Drive `probe_fn` on each tick, allowing one cycle in flight at a time.
pub(crate) async fn run_ticker<F, Fut>(
    host: String,
    period: Duration,
    probe_fn: F,
    tx: mpsc::Sender<Sample>,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Sample> + Send + 'static,
{
    let period = if period.is_zero() {
        Duration::from_secs(1)
    } else {
        period
    };

    let semaphore = Arc::new(Semaphore::new(1));

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Scheduler: receiver for {} dropped, stopping", host);
                break;
            }
            _ = interval.tick() => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!(
                            "Skipping probe cycle for {}: previous cycle still running",
                            host
                        );
                        continue;
                    }
                };

                let cycle = probe_fn();
                let tx = tx.clone();
                let host = host.clone();

                tokio::spawn(async move {
                    // Held until the sample is delivered, which keeps tick order.
                    let _permit = permit;
                    let sample = cycle.await;
                    if tx.send(sample).await.is_err() {
                        tracing::debug!("Scheduler: dropped sample for {}", host);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_samples_arrive_in_tick_order() {
        let counter = Arc::new(AtomicI64::new(0));
        let (tx, mut rx) = mpsc::channel(16);

        let c = counter.clone();
        let probe_fn = move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                let mut sample = Sample::empty(Utc::now());
                sample.latency = Some(n);
                sample
            }
        };
        tokio::spawn(run_ticker("test".to_string(), Duration::from_millis(20), probe_fn, tx));

        let mut previous = None;
        for expected in 0..4 {
            let sample = rx.recv().await.unwrap();
            assert_eq!(sample.latency, Some(expected));
            if let Some(prev) = previous {
                assert!(sample.time >= prev);
            }
            previous = Some(sample.time);
        }
    }

    #[tokio::test]
    async fn test_slow_cycles_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(16);

        let (cur, max) = (in_flight.clone(), max_in_flight.clone());
        let probe_fn = move || {
            let (cur, max) = (cur.clone(), max.clone());
            async move {
                let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                cur.fetch_sub(1, Ordering::SeqCst);
                Sample::empty(Utc::now())
            }
        };
        tokio::spawn(run_ticker("slow".to_string(), Duration::from_millis(10), probe_fn, tx));

        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_receiver_stops_ticker() {
        let (tx, rx) = mpsc::channel(16);
        let probe_fn = || async { Sample::empty(Utc::now()) };
        let period = Duration::from_millis(10);
        let handle = tokio::spawn(run_ticker("gone".to_string(), period, probe_fn, tx));

        drop(rx);
        let finished = tokio::time::timeout(Duration::from_secs(2), handle).await;
        tokio_test::assert_ok!(finished);
    }

    #[tokio::test]
    async fn test_schedule_emits_samples_for_unprobeable_host() {
        let period = Duration::from_millis(20);
        let mut rx = schedule("https://".to_string(), period, ProbeSettings::default());
        let sample = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(sample.is_empty());
    }
}
