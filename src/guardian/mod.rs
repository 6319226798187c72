//! Memory Guardian
//!
//! A background observer that samples the process RSS on a fixed period,
//! classifies it against a configured cap, and drives coordinated
//! eviction across the bounded caches. Replaces unbounded memoization
//! with explicit pressure handling.
//!
//! # Pressure levels
//!
//! Measured as `used / cap`:
//!
//! | Level    | Range                         | Action |
//! |----------|-------------------------------|--------|
//! | Low      | `< 60%`                       | re-enable metric emission |
//! | Medium   | `60% ..` high threshold       | log only |
//! | High     | high `..` critical threshold  | invoke eviction callbacks |
//! | Critical | `≥` critical threshold        | evict aggressively, damp metrics, reject writes for a short window |
//!
//! The high / critical thresholds default to 80% / 90% and come from
//! configuration.
//!
//! # Recursion breakers
//!
//! A metrics emitter that writes entities can feed back into itself: the
//! write updates caches, which changes memory, which emits metrics, which
//! writes… Two breakers prevent the loop:
//!
//! - a process-local **write depth counter** ([`MemoryGuardian::write_depth_guard`]):
//!   metric emission initiated while already inside a write is dropped;
//! - a **metrics damper** ([`MemoryGuardian::metrics_enabled`]): at
//!   Critical pressure metric emission is disabled entirely until the
//!   level falls back to Low.
//!
//! The guardian itself never panics and never blocks a foreground
//! operation; every failure path logs and continues.


use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, bounded};
use sysinfo::System;
use tracing::{debug, info, warn};

// ------------------------------------------------------------------------------------------------
// Pressure levels
// ------------------------------------------------------------------------------------------------

/// Classified memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    /// Below 60% of the cap.
    Low,
    /// 60% up to the high threshold.
    Medium,
    /// High threshold up to the critical threshold: coordinated eviction.
    High,
    /// At or beyond the critical threshold: aggressive eviction, damped
    /// metrics, and a short write-rejection window.
    Critical,
}

impl PressureLevel {
    fn as_u8(self) -> u8 {
        match self {
            PressureLevel::Low => 0,
            PressureLevel::Medium => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PressureLevel::Low,
            1 => PressureLevel::Medium,
            2 => PressureLevel::High,
            _ => PressureLevel::Critical,
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Classify `used` bytes against `cap` with the configured thresholds.
pub fn classify(used: u64, cap: u64, high_pct: f64, critical_pct: f64) -> PressureLevel {
    if cap == 0 {
        return PressureLevel::Low;
    }
    let ratio = used as f64 / cap as f64;
    if ratio >= critical_pct {
        PressureLevel::Critical
    } else if ratio >= high_pct {
        PressureLevel::High
    } else if ratio >= 0.60 {
        PressureLevel::Medium
    } else {
        PressureLevel::Low
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Guardian tuning, extracted from the store configuration.
#[derive(Debug, Clone)]
pub struct GuardianConfig {
    /// Memory cap in bytes. Zero disables the background thread.
    pub cap_bytes: u64,

    /// High-pressure threshold as a fraction of the cap.
    pub high_pct: f64,

    /// Critical-pressure threshold as a fraction of the cap.
    pub critical_pct: f64,

    /// Sampling period.
    pub period: Duration,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            cap_bytes: 0,
            high_pct: 0.80,
            critical_pct: 0.90,
            period: Duration::from_secs(30),
        }
    }
}

/// How long Critical pressure rejects new writes.
const REJECT_WINDOW: Duration = Duration::from_secs(2);

// ------------------------------------------------------------------------------------------------
// Guardian
// ------------------------------------------------------------------------------------------------

type PressureCallback = Box<dyn Fn(PressureLevel) + Send + Sync>;

struct GuardianShared {
    config: GuardianConfig,
    level: AtomicU8,
    callbacks: Mutex<Vec<(u8, PressureCallback)>>,
    metrics_enabled: AtomicBool,
    reject_until: Mutex<Option<Instant>>,
    write_depth: AtomicU32,
    ticks: AtomicU64,
}

/// The memory-pressure observer. One per open store.
pub struct MemoryGuardian {
    shared: Arc<GuardianShared>,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryGuardian {
    /// Build a guardian and, when a cap is configured, start its
    /// background sampling thread.
    pub fn start(config: GuardianConfig) -> Self {
        let shared = Arc::new(GuardianShared {
            config: config.clone(),
            level: AtomicU8::new(PressureLevel::Low.as_u8()),
            callbacks: Mutex::new(Vec::new()),
            metrics_enabled: AtomicBool::new(true),
            reject_until: Mutex::new(None),
            write_depth: AtomicU32::new(0),
            ticks: AtomicU64::new(0),
        });

        if config.cap_bytes == 0 {
            debug!("memory guardian disabled (no cap configured)");
            return Self {
                shared,
                shutdown: None,
                handle: None,
            };
        }

        let (tx, rx) = bounded::<()>(1);
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("entitydb-guardian".into())
            .spawn(move || {
                let mut system = System::new();
                loop {
                    match rx.recv_timeout(thread_shared.config.period) {
                        Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                            Self::sample_and_act(&thread_shared, &mut system);
                        }
                    }
                }
            })
            .ok();
        if handle.is_none() {
            warn!("memory guardian thread failed to spawn; pressure handling is inert");
        }

        info!(
            cap_bytes = config.cap_bytes,
            period_secs = config.period.as_secs(),
            "memory guardian started"
        );

        Self {
            shared,
            shutdown: Some(tx),
            handle,
        }
    }

    /// Register an eviction callback. Lower `priority` runs first.
    pub fn register_callback(
        &self,
        priority: u8,
        callback: impl Fn(PressureLevel) + Send + Sync + 'static,
    ) {
        if let Ok(mut cbs) = self.shared.callbacks.lock() {
            cbs.push((priority, Box::new(callback)));
            cbs.sort_by_key(|(p, _)| *p);
        }
    }

    /// Feed an explicit usage figure through one guardian cycle —
    /// the deterministic entry point the tests (and the sampler) use.
    pub fn observe(&self, used_bytes: u64) -> PressureLevel {
        Self::act_on(&self.shared, used_bytes)
    }

    /// Current pressure level as of the last cycle.
    pub fn current_level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.shared.level.load(Ordering::Relaxed))
    }

    /// Whether internal metric emission is currently allowed.
    pub fn metrics_enabled(&self) -> bool {
        self.shared.metrics_enabled.load(Ordering::Relaxed)
    }

    /// Whether new writes should currently be rejected (Critical window).
    pub fn writes_rejected(&self) -> bool {
        match self.shared.reject_until.lock() {
            Ok(guard) => guard.map(|until| Instant::now() < until).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// RAII guard marking "inside a write" for recursion breaking.
    pub fn write_depth_guard(&self) -> WriteDepthGuard {
        self.shared.write_depth.fetch_add(1, Ordering::SeqCst);
        WriteDepthGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether the current thread of control is inside a write — metric
    /// emission must be dropped when this is set.
    pub fn in_write(&self) -> bool {
        self.shared.write_depth.load(Ordering::SeqCst) > 0
    }

    /// Completed sampling cycles.
    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    /// Stop the background thread. Idempotent; also run by `Drop`.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn sample_and_act(shared: &Arc<GuardianShared>, system: &mut System) {
        let Ok(pid) = sysinfo::get_current_pid() else {
            warn!("guardian could not resolve own pid");
            return;
        };
        system.refresh_process(pid);
        let used = system.process(pid).map(|p| p.memory()).unwrap_or(0);
        Self::act_on(shared, used);
    }

    fn act_on(shared: &Arc<GuardianShared>, used: u64) -> PressureLevel {
        let level = classify(
            used,
            shared.config.cap_bytes,
            shared.config.high_pct,
            shared.config.critical_pct,
        );
        let previous = PressureLevel::from_u8(shared.level.swap(level.as_u8(), Ordering::Relaxed));
        shared.ticks.fetch_add(1, Ordering::Relaxed);

        if level != previous {
            info!(used, cap = shared.config.cap_bytes, %level, "memory pressure level changed");
        }

        match level {
            PressureLevel::Low => {
                if !shared.metrics_enabled.swap(true, Ordering::Relaxed) {
                    debug!("metric emission re-enabled");
                }
            }
            PressureLevel::Medium => {
                debug!(used, "memory pressure medium");
            }
            PressureLevel::High => {
                Self::run_callbacks(shared, level);
            }
            PressureLevel::Critical => {
                warn!(used, cap = shared.config.cap_bytes, "critical memory pressure");
                Self::run_callbacks(shared, level);
                shared.metrics_enabled.store(false, Ordering::Relaxed);
                if let Ok(mut reject) = shared.reject_until.lock() {
                    *reject = Some(Instant::now() + REJECT_WINDOW);
                }
            }
        }

        level
    }

    fn run_callbacks(shared: &Arc<GuardianShared>, level: PressureLevel) {
        let Ok(cbs) = shared.callbacks.lock() else {
            return;
        };
        for (_, cb) in cbs.iter() {
            cb(level);
        }
    }
}

impl Drop for MemoryGuardian {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ------------------------------------------------------------------------------------------------
// Write depth guard
// ------------------------------------------------------------------------------------------------

/// RAII token for the write-recursion counter.
pub struct WriteDepthGuard {
    shared: Arc<GuardianShared>,
}

impl Drop for WriteDepthGuard {
    fn drop(&mut self) {
        self.shared.write_depth.fetch_sub(1, Ordering::SeqCst);
    }
}
