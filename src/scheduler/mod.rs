//! Scheduler module: per-host probe tickers and the pipelines that persist
//! their samples.

mod ticker;

pub use ticker::*;

use crate::db::{Host, Sample, Store, StoreError};
use crate::probe::ProbeSettings;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Starts one probe pipeline per registered host.
pub struct Scheduler {
    store: Arc<Store>,
    interval: Duration,
    settings: ProbeSettings,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, interval: Duration, settings: ProbeSettings) -> Self {
        Self {
            store,
            interval,
            settings,
        }
    }

    /// Start monitoring every host currently in the store.
    ///
    /// Hosts added later are not picked up until the next start.
    pub fn start(&self) -> Result<usize, StoreError> {
        let hosts = self.store.list_hosts()?;

        tracing::info!(
            "Starting scheduler with {} hosts, probing every {:?}",
            hosts.len(),
            self.interval
        );

        let count = hosts.len();
        for host in hosts {
            self.spawn_pipeline(host);
        }

        Ok(count)
    }

    fn spawn_pipeline(&self, host: Host) {
        tracing::info!("Scheduler: adding host {}", host.hostname);

        let rx = schedule(host.hostname.clone(), self.interval, self.settings.clone());
        tokio::spawn(run_pipeline(self.store.clone(), host, rx));
    }
}

/// Persist each sample of one host: online flag first, then the sample.
///
/// Write failures are logged and the pipeline moves on to the next sample.
/// Samples of a host that is no longer in the store are dropped unwritten.
pub async fn run_pipeline(store: Arc<Store>, host: Host, mut rx: mpsc::Receiver<Sample>) {
    while let Some(sample) = rx.recv().await {
        match store.get_host(&host.id) {
            Ok(_) => {}
            Err(StoreError::NotFound) => {
                tracing::debug!("Host {} was removed, dropping its sample", host.hostname);
                continue;
            }
            Err(e) => tracing::error!("Failed to look up host {}: {}", host.hostname, e),
        }

        let online = sample.is_reachable();
        if sample.is_empty() {
            tracing::debug!("Nothing measured for {} this cycle", host.hostname);
        } else {
            tracing::debug!("Sample for {}: online={} {:?}", host.hostname, online, sample);
        }

        if let Err(e) = store.record_online_status(&host.id, online) {
            tracing::error!("Failed to record online status for {}: {}", host.hostname, e);
        }

        if let Err(e) = store.record_sample(&host.id, &sample) {
            tracing::error!("Failed to record sample for {}: {}", host.hostname, e);
        }
    }

    tracing::debug!("Pipeline for {} finished", host.hostname);
}
