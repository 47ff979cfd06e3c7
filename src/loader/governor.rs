use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{GovernorConfig, HostProfile};
use crate::index::TemplateStore;
use crate::metrics::MEMORY_PRESSURE_LEVEL;

/// Memory pressure as seen by the loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    #[default]
    Normal,
    /// Above the slow threshold: the loader halves its batch and pauses briefly.
    Slow,
    /// Above the critical threshold: longer pauses, and the store reclaims
    /// spare capacity.
    Critical,
}

impl Pressure {
    fn level(self) -> i64 {
        match self {
            Pressure::Normal => 0,
            Pressure::Slow => 1,
            Pressure::Critical => 2,
        }
    }
}

/// Source of resident memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Bytes currently in use, or `None` if unknown on this platform.
    fn used_bytes(&self) -> Option<u64>;
}

/// Resident set size from `/proc/self/statm`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

/// statm reports pages; 4 KiB matches every target we deploy on.
const PAGE_SIZE: u64 = 4096;

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident * PAGE_SIZE)
    }
}

/// Samples memory use on its own schedule and publishes [`Pressure`].
///
/// Advisory only: the loader reads the latest level between batches and
/// throttles itself. Nothing here blocks or aborts a load.
pub struct MemoryGovernor {
    probe: Arc<dyn MemoryProbe>,
    limit_bytes: u64,
    slow_pct: f64,
    critical_pct: f64,
    interval: Duration,
    store: Option<Arc<TemplateStore>>,
    tx: watch::Sender<Pressure>,
}

impl MemoryGovernor {
    pub fn new(
        config: &GovernorConfig,
        profile: &HostProfile,
        probe: Arc<dyn MemoryProbe>,
        store: Option<Arc<TemplateStore>>,
    ) -> Self {
        let (tx, _) = watch::channel(Pressure::Normal);
        Self {
            probe,
            limit_bytes: profile.memory_limit_bytes.max(1),
            slow_pct: config.slow_threshold_pct,
            critical_pct: config.critical_threshold_pct,
            interval: Duration::from_millis(config.sample_interval_ms.max(10)),
            store,
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Pressure> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Pressure {
        *self.tx.borrow()
    }

    pub fn usage_pct(&self, used_bytes: u64) -> f64 {
        used_bytes as f64 * 100.0 / self.limit_bytes as f64
    }

    /// Strictly above a threshold moves to its level; exactly at it does not.
    pub fn classify(&self, used_bytes: u64) -> Pressure {
        let pct = self.usage_pct(used_bytes);
        if pct > self.critical_pct {
            Pressure::Critical
        } else if pct > self.slow_pct {
            Pressure::Slow
        } else {
            Pressure::Normal
        }
    }

    /// Take one reading and publish it. An unreadable probe reports `Normal`.
    pub fn sample(&self) -> Pressure {
        let used = self.probe.used_bytes();
        let pressure = used.map_or(Pressure::Normal, |u| self.classify(u));
        let previous = self.tx.send_replace(pressure);
        MEMORY_PRESSURE_LEVEL.set(pressure.level());

        if pressure != previous {
            let usage_pct = used.map(|u| self.usage_pct(u)).unwrap_or(0.0);
            match pressure {
                Pressure::Normal => info!(usage_pct, "memory pressure back to normal"),
                Pressure::Slow => warn!(usage_pct, "memory pressure high, slowing loader"),
                Pressure::Critical => {
                    warn!(usage_pct, "memory pressure critical, reclaiming store capacity");
                    if let Some(store) = &self.store {
                        store.reclaim();
                    }
                }
            }
        }
        pressure
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            limit_mb = self.limit_bytes / (1024 * 1024),
            slow_pct = self.slow_pct,
            critical_pct = self.critical_pct,
            "memory governor started"
        );
        loop {
            self.sample();
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.changed() => {
                    info!("memory governor shutting down");
                    break;
                }
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedProbe(AtomicU64);

    impl MemoryProbe for FixedProbe {
        fn used_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::Relaxed))
        }
    }

    fn governor(probe: Arc<FixedProbe>) -> MemoryGovernor {
        let profile = HostProfile::derive(4, 1000);
        MemoryGovernor::new(&GovernorConfig::default(), &profile, probe, None)
    }

    #[test]
    fn test_classify_thresholds() {
        let g = governor(Arc::new(FixedProbe(AtomicU64::new(0))));
        assert_eq!(g.classify(799), Pressure::Normal);
        assert_eq!(g.classify(800), Pressure::Normal);
        assert_eq!(g.classify(801), Pressure::Slow);
        assert_eq!(g.classify(850), Pressure::Slow);
        assert_eq!(g.classify(851), Pressure::Critical);
        assert_eq!(g.classify(5000), Pressure::Critical);
    }

    #[test]
    fn test_sample_publishes_transitions() {
        let probe = Arc::new(FixedProbe(AtomicU64::new(100)));
        let g = governor(Arc::clone(&probe));
        let rx = g.subscribe();

        assert_eq!(g.sample(), Pressure::Normal);
        probe.0.store(820, Ordering::Relaxed);
        assert_eq!(g.sample(), Pressure::Slow);
        assert_eq!(*rx.borrow(), Pressure::Slow);
        probe.0.store(900, Ordering::Relaxed);
        assert_eq!(g.sample(), Pressure::Critical);
        probe.0.store(10, Ordering::Relaxed);
        assert_eq!(g.sample(), Pressure::Normal);
        assert_eq!(g.current(), Pressure::Normal);
    }

    #[test]
    fn test_process_probe_reads_something_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(ProcessMemoryProbe.used_bytes().unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let g = Arc::new(governor(Arc::new(FixedProbe(AtomicU64::new(0)))));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&g).run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
