//! Concurrency and memory limits for protected operations.

use cadence_core::{
    CadenceError, CadenceResult, HealthCheck, ResourceGuardConfig, SystemError,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Resident page size assumed when reading `/proc/self/statm`.
const PAGE_SIZE_BYTES: u64 = 4096;

// ============================================================================
// MEMORY PROBE
// ============================================================================

/// Source of the process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes, or `None` when the platform offers no reading.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads resident pages from `/proc/self/statm`. Linux only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStatmProbe;

impl MemoryProbe for ProcStatmProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * PAGE_SIZE_BYTES)
    }
}

/// Open file descriptors of this process, from `/proc/self/fd`.
pub fn open_handle_count() -> Option<usize> {
    std::fs::read_dir("/proc/self/fd").ok().map(|dir| dir.count())
}

type CleanupHook = Box<dyn Fn() + Send + Sync>;

/// Outcome of a memory check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCheck {
    WithinLimit { bytes: u64 },
    /// Over the ceiling, back under it after cleanup hooks ran.
    Recovered { before: u64, after: u64 },
    Unavailable,
}

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGuardStats {
    pub max_concurrent_operations: usize,
    pub active_operations: usize,
    pub completed_operations: u64,
    pub failed_operations: u64,
    pub rejected_operations: u64,
    pub average_latency_ms: f64,
    pub open_handles: Option<usize>,
    pub resident_bytes: Option<u64>,
    pub memory_ceiling_bytes: u64,
    pub cleanups_run: u64,
}

#[derive(Debug, Default)]
struct GuardMetrics {
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    total_latency_us: AtomicU64,
    cleanups: AtomicU64,
}

// ============================================================================
// GUARD
// ============================================================================

/// Counting semaphore over protected operations plus a memory ceiling.
pub struct ResourceGuard {
    semaphore: Arc<Semaphore>,
    config: ResourceGuardConfig,
    probe: Box<dyn MemoryProbe>,
    cleanup_hooks: Mutex<Vec<(String, CleanupHook)>>,
    metrics: GuardMetrics,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("config", &self.config)
            .field("available", &self.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}

/// Held while a protected operation runs.
#[derive(Debug)]
pub struct GuardPermit {
    _permit: OwnedSemaphorePermit,
}

impl ResourceGuard {
    pub fn new(config: ResourceGuardConfig) -> Self {
        Self::with_probe(config, Box::new(ProcStatmProbe))
    }

    pub fn with_probe(config: ResourceGuardConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_operations)),
            config,
            probe,
            cleanup_hooks: Mutex::new(Vec::new()),
            metrics: GuardMetrics::default(),
        }
    }

    pub fn active_operations(&self) -> usize {
        self.config
            .max_concurrent_operations
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> CadenceResult<GuardPermit> {
        let permit = self.semaphore.clone().acquire_owned().await.map_err(|_| {
            CadenceError::System(SystemError::ResourceExhausted {
                resource: "operation slots".into(),
                reason: "guard closed".into(),
            })
        })?;
        Ok(GuardPermit { _permit: permit })
    }

    /// Take a slot without waiting, or fail with `ResourceExhausted`.
    pub fn try_acquire(&self) -> CadenceResult<GuardPermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(GuardPermit { _permit: permit }),
            Err(_) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                Err(SystemError::ResourceExhausted {
                    resource: "operation slots".into(),
                    reason: format!(
                        "all {} slots in use",
                        self.config.max_concurrent_operations
                    ),
                }
                .into())
            }
        }
    }

    /// Run `operation` inside a slot, recording latency and outcome.
    pub async fn run<F, Fut, T>(&self, operation: F) -> CadenceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CadenceResult<T>>,
    {
        let _permit = self.acquire().await?;
        let started = Instant::now();
        let result = operation().await;
        let latency_us = started.elapsed().as_micros().min(u64::MAX as u128) as u64;
        self.metrics
            .total_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
        match &result {
            Ok(_) => self.metrics.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.metrics.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Register a hook run when memory goes over the ceiling.
    pub fn register_cleanup<F>(&self, name: impl Into<String>, hook: F) -> CadenceResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.cleanup_hooks
            .lock()
            .map_err(|_| CadenceError::lock_poisoned("resource guard cleanup hooks"))?
            .push((name.into(), Box::new(hook)));
        Ok(())
    }

    fn run_cleanup(&self) -> CadenceResult<()> {
        let hooks = self
            .cleanup_hooks
            .lock()
            .map_err(|_| CadenceError::lock_poisoned("resource guard cleanup hooks"))?;
        for (name, hook) in hooks.iter() {
            tracing::debug!(hook = %name, "running memory cleanup hook");
            hook();
        }
        self.metrics.cleanups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Compare resident memory with the ceiling. Over the ceiling, cleanup
    /// hooks run and memory is read again; still over it is fatal and
    /// returned as `ResourceExhausted`.
    pub fn check_memory(&self) -> CadenceResult<MemoryCheck> {
        let ceiling = self.config.memory_ceiling_bytes;
        let Some(before) = self.probe.resident_bytes() else {
            return Ok(MemoryCheck::Unavailable);
        };
        if before <= ceiling {
            return Ok(MemoryCheck::WithinLimit { bytes: before });
        }

        tracing::warn!(resident_bytes = before, ceiling_bytes = ceiling, "memory ceiling exceeded, running cleanup");
        self.run_cleanup()?;

        match self.probe.resident_bytes() {
            Some(after) if after > ceiling => {
                tracing::error!(resident_bytes = after, ceiling_bytes = ceiling, "memory still over ceiling after cleanup");
                Err(SystemError::ResourceExhausted {
                    resource: "memory".into(),
                    reason: format!("{after} bytes resident, ceiling {ceiling}"),
                }
                .into())
            }
            Some(after) => Ok(MemoryCheck::Recovered { before, after }),
            None => Ok(MemoryCheck::Unavailable),
        }
    }

    /// Poll memory every `memory_check_interval` until shutdown. The task
    /// ends with the fatal error if memory cannot be brought back under the
    /// ceiling.
    pub fn spawn_memory_monitor(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<CadenceResult<()>> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.memory_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                interval_ms = self.config.memory_check_interval.as_millis() as u64,
                ceiling_bytes = self.config.memory_ceiling_bytes,
                "memory monitor started"
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("memory monitor shutting down");
                            return Ok(());
                        }
                    }
                    _ = ticker.tick() => {
                        self.check_memory()?;
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> ResourceGuardStats {
        let completed = self.metrics.completed.load(Ordering::Relaxed);
        let failed = self.metrics.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let average_latency_ms = if finished == 0 {
            0.0
        } else {
            self.metrics.total_latency_us.load(Ordering::Relaxed) as f64 / finished as f64 / 1000.0
        };
        ResourceGuardStats {
            max_concurrent_operations: self.config.max_concurrent_operations,
            active_operations: self.active_operations(),
            completed_operations: completed,
            failed_operations: failed,
            rejected_operations: self.metrics.rejected.load(Ordering::Relaxed),
            average_latency_ms,
            open_handles: open_handle_count(),
            resident_bytes: self.probe.resident_bytes(),
            memory_ceiling_bytes: self.config.memory_ceiling_bytes,
            cleanups_run: self.metrics.cleanups.load(Ordering::Relaxed),
        }
    }

    pub fn health_check(&self) -> HealthCheck {
        let stats = self.stats();
        let check = if stats.active_operations >= stats.max_concurrent_operations {
            HealthCheck::degraded("resource_guard", "all operation slots in use")
        } else if stats
            .resident_bytes
            .is_some_and(|bytes| bytes > stats.memory_ceiling_bytes)
        {
            HealthCheck::unhealthy("resource_guard", "memory over ceiling")
        } else {
            HealthCheck::healthy("resource_guard")
        };
        check
            .with_metadata("active_operations", stats.active_operations.into())
            .with_metadata("completed_operations", stats.completed_operations.into())
            .with_metadata("average_latency_ms", stats.average_latency_ms.into())
    }
}
