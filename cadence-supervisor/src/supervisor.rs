//! Worker lifecycle supervision.
//!
//! Per worker: Starting -> Running -> {Unhealthy | Crashed} -> Starting on
//! restart, or Stopped. A worker that stays silent past the stale threshold
//! is marked Unhealthy and force-restarted. Restarts are bounded; once the
//! budget is spent the worker is permanently Stopped and an escalation is
//! raised. Launches go through the resource guard, a circuit breaker and a
//! bounded retry so a pathological worker cannot starve the supervisor.
//!
//! The worker table lock is only held for bookkeeping. Launches, kills,
//! instruction writes and exit polls run outside it, each instance behind
//! its own handle lock, so one stuck worker never blocks the others. Every
//! launch or stop bumps the slot generation; a result that comes back for
//! an older generation is discarded.

use crate::breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::guard::ResourceGuard;
use crate::process::{
    ExitInfo, OutputStream, WorkerHandle, WorkerLauncher, WorkerLine, WorkerOutput,
    WorkerOutputStream, WorkerSpec,
};
use crate::retry::retry_with_backoff;
use cadence_core::constants::{SUPERVISOR_EVENT_CHANNEL_CAPACITY, WORKER_OUTPUT_CHANNEL_CAPACITY};
use cadence_core::{
    AgentId, CadenceConfig, CadenceError, CadenceResult, CircuitBreakerConfig, CircuitState,
    EntityType, EscalationEvent, EscalationSeverity, HealthCheck, RetryConfig, SystemError,
    WorkerState,
};
use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
    pub max_restart_attempts: u32,
    pub restart_cooldown: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retries of a single launch before it counts as a failed start.
    pub launch_retry: RetryConfig,
}

impl From<&CadenceConfig> for SupervisorConfig {
    fn from(config: &CadenceConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            stale_threshold: config.stale_agent_threshold,
            max_restart_attempts: config.max_restart_attempts,
            restart_cooldown: config.restart_cooldown,
            circuit_breaker: config.circuit_breaker.clone(),
            launch_retry: config.retry.clone(),
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Started {
        agent_id: AgentId,
        pid: Option<u32>,
    },
    Unhealthy {
        agent_id: AgentId,
        silent_for_ms: u64,
    },
    Crashed {
        agent_id: AgentId,
        exit: ExitInfo,
    },
    Restarted {
        agent_id: AgentId,
        attempt: u32,
        pid: Option<u32>,
    },
    Stopped {
        agent_id: AgentId,
        reason: String,
    },
    Escalation(EscalationEvent),
}

/// Snapshot of one supervised worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub agent_id: AgentId,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub restart_attempts: u32,
    pub last_exit: Option<ExitInfo>,
}

type SharedHandle = Arc<tokio::sync::Mutex<Box<dyn WorkerHandle>>>;

/// An instance taken out of its slot, waiting to be killed.
struct Detached {
    agent_id: AgentId,
    handle: Option<SharedHandle>,
    pump: Option<JoinHandle<()>>,
}

impl Detached {
    async fn kill(self) -> (AgentId, Option<ExitInfo>) {
        if let Some(pump) = self.pump {
            pump.abort();
        }
        let Some(handle) = self.handle else {
            return (self.agent_id, None);
        };
        let exit = match handle.lock().await.kill().await {
            Ok(exit) => Some(exit),
            Err(e) => {
                tracing::warn!(agent_id = %self.agent_id, error = %e, "failed to collect worker exit");
                None
            }
        };
        (self.agent_id, exit)
    }
}

/// A launch scheduled under the table lock and run outside it.
struct PendingLaunch {
    agent_id: AgentId,
    spec: WorkerSpec,
    generation: u64,
    attempt: u32,
}

enum Liveness {
    Exited(ExitInfo),
    Alive,
    Busy,
}

struct WorkerSlot {
    spec: WorkerSpec,
    state: WorkerState,
    handle: Option<SharedHandle>,
    pump: Option<JoinHandle<()>>,
    pid: Option<u32>,
    generation: u64,
    restart_attempts: u32,
    last_restart: Option<Instant>,
    last_exit: Option<ExitInfo>,
    exhausted: bool,
}

impl WorkerSlot {
    fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            state: WorkerState::Stopped,
            handle: None,
            pump: None,
            pid: None,
            generation: 0,
            restart_attempts: 0,
            last_restart: None,
            last_exit: None,
            exhausted: false,
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            agent_id: self.spec.agent_id.clone(),
            state: self.state,
            pid: self.pid,
            restart_attempts: self.restart_attempts,
            last_exit: self.last_exit.clone(),
        }
    }

    fn detach(&mut self) -> Detached {
        self.pid = None;
        Detached {
            agent_id: self.spec.agent_id.clone(),
            handle: self.handle.take(),
            pump: self.pump.take(),
        }
    }

    /// Mark the slot Starting for a new launch and return its generation.
    fn begin_launch(&mut self) -> u64 {
        self.generation += 1;
        self.state = WorkerState::Starting;
        self.generation
    }
}

// ============================================================================
// SUPERVISOR
// ============================================================================

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    workers: tokio::sync::Mutex<BTreeMap<AgentId, WorkerSlot>>,
    heartbeats: Arc<Mutex<HashMap<AgentId, Instant>>>,
    restart_breaker: CircuitBreaker,
    guard: Arc<ResourceGuard>,
    events: broadcast::Sender<SupervisorEvent>,
    output: broadcast::Sender<WorkerOutput>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.config)
            .field("restart_breaker", &self.restart_breaker)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
        guard: Arc<ResourceGuard>,
    ) -> Self {
        let (events, _) = broadcast::channel(SUPERVISOR_EVENT_CHANNEL_CAPACITY);
        let (output, _) = broadcast::channel(WORKER_OUTPUT_CHANNEL_CAPACITY);
        Self {
            restart_breaker: CircuitBreaker::new(
                "supervisor.launch",
                config.circuit_breaker.clone(),
            ),
            config,
            launcher,
            workers: tokio::sync::Mutex::new(BTreeMap::new()),
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
            guard,
            events,
            output,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn guard(&self) -> &Arc<ResourceGuard> {
        &self.guard
    }

    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.restart_breaker.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Output lines of every worker instance started from now on.
    pub fn subscribe_output(&self) -> broadcast::Receiver<WorkerOutput> {
        self.output.subscribe()
    }

    fn publish(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit(&self, event: SupervisorEvent, sink: &mut Vec<SupervisorEvent>) {
        self.publish(event.clone());
        sink.push(event);
    }

    fn touch(&self, agent_id: &AgentId) {
        if let Ok(mut heartbeats) = self.heartbeats.lock() {
            heartbeats.insert(agent_id.clone(), Instant::now());
        }
    }

    fn silence(&self, agent_id: &AgentId, now: Instant) -> Duration {
        self.heartbeats
            .lock()
            .ok()
            .and_then(|h| h.get(agent_id).copied())
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last))
    }

    /// Add a worker definition. Replacing a definition is allowed only while
    /// the worker is not running.
    pub async fn register(&self, spec: WorkerSpec) -> CadenceResult<()> {
        spec.validate()?;
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get_mut(&spec.agent_id) {
            if existing.handle.is_some() || existing.state == WorkerState::Starting {
                return Err(CadenceError::invalid_input(
                    "agent_id",
                    format!("worker {} is running", spec.agent_id),
                ));
            }
            existing.spec = spec;
            return Ok(());
        }
        tracing::debug!(agent_id = %spec.agent_id, program = %spec.program, "worker registered");
        workers.insert(spec.agent_id.clone(), WorkerSlot::new(spec));
        Ok(())
    }

    /// Launch one instance. Transient spawn failures are retried with
    /// backoff inside a single breaker call.
    async fn launch(&self, spec: &WorkerSpec) -> CadenceResult<Box<dyn WorkerHandle>> {
        self.guard
            .run(|| {
                self.restart_breaker.execute(|| {
                    retry_with_backoff(&self.config.launch_retry, "worker_launch", || {
                        self.launcher.launch(spec)
                    })
                })
            })
            .await
    }

    /// Put a freshly launched instance into its slot.
    fn install(&self, slot: &mut WorkerSlot, mut handle: Box<dyn WorkerHandle>) -> Option<u32> {
        let pid = handle.pid();
        if let Some(old) = slot.pump.take() {
            old.abort();
        }
        slot.pump = handle
            .take_output()
            .map(|stream| self.spawn_pump(slot.spec.agent_id.clone(), stream));
        self.touch(&slot.spec.agent_id);
        slot.handle = Some(Arc::new(tokio::sync::Mutex::new(handle)));
        slot.pid = pid;
        slot.state = WorkerState::Running;
        pid
    }

    /// Forward an instance's output to subscribers. Marker lines on stdout
    /// count as heartbeats.
    fn spawn_pump(&self, agent_id: AgentId, mut stream: WorkerOutputStream) -> JoinHandle<()> {
        let heartbeats = self.heartbeats.clone();
        let output = self.output.clone();
        tokio::spawn(async move {
            while let Some(line) = stream.next().await {
                if line.stream == OutputStream::Stdout
                    && WorkerLine::parse(&line.line).is_liveness_signal()
                {
                    if let Ok(mut heartbeats) = heartbeats.lock() {
                        heartbeats.insert(agent_id.clone(), Instant::now());
                    }
                }
                let _ = output.send(line);
            }
            tracing::debug!(agent_id = %agent_id, "worker output closed");
        })
    }

    /// Start a registered worker with a fresh restart budget.
    pub async fn start(&self, agent_id: &AgentId) -> CadenceResult<Option<u32>> {
        let (spec, generation) = {
            let mut workers = self.workers.lock().await;
            let slot = workers
                .get_mut(agent_id)
                .ok_or_else(|| CadenceError::not_found(EntityType::Worker, agent_id))?;
            if slot.handle.is_some() {
                return Ok(slot.pid);
            }
            if slot.state == WorkerState::Starting {
                return Err(CadenceError::invalid_input(
                    "agent_id",
                    format!("worker {agent_id} is already starting"),
                ));
            }
            slot.restart_attempts = 0;
            slot.last_restart = None;
            slot.exhausted = false;
            (slot.spec.clone(), slot.begin_launch())
        };

        let launched = self.launch(&spec).await;

        let mut workers = self.workers.lock().await;
        let slot = workers
            .get_mut(agent_id)
            .ok_or_else(|| CadenceError::not_found(EntityType::Worker, agent_id))?;
        if slot.generation != generation {
            drop(workers);
            if let Ok(handle) = launched {
                discard(agent_id, handle).await;
            }
            return Err(CadenceError::invalid_input(
                "agent_id",
                format!("worker {agent_id} was stopped while starting"),
            ));
        }
        match launched {
            Ok(handle) => {
                let pid = self.install(slot, handle);
                tracing::info!(agent_id = %agent_id, pid = ?pid, "worker started");
                self.publish(SupervisorEvent::Started {
                    agent_id: agent_id.clone(),
                    pid,
                });
                Ok(pid)
            }
            Err(e) => {
                slot.state = WorkerState::Crashed;
                Err(e)
            }
        }
    }

    /// Stop a worker on request. It stays Stopped until started again.
    pub async fn stop(&self, agent_id: &AgentId) -> CadenceResult<Option<ExitInfo>> {
        let detached = {
            let mut workers = self.workers.lock().await;
            let slot = workers
                .get_mut(agent_id)
                .ok_or_else(|| CadenceError::not_found(EntityType::Worker, agent_id))?;
            slot.generation += 1;
            slot.state = WorkerState::Stopped;
            slot.detach()
        };
        let (_, exit) = detached.kill().await;
        self.record_exits(vec![(agent_id.clone(), exit.clone())]).await;
        self.publish(SupervisorEvent::Stopped {
            agent_id: agent_id.clone(),
            reason: "stop requested".into(),
        });
        Ok(exit)
    }

    pub async fn stop_all(&self) {
        let detached: Vec<Detached> = {
            let mut workers = self.workers.lock().await;
            workers
                .values_mut()
                .filter(|slot| slot.handle.is_some() || slot.state == WorkerState::Starting)
                .map(|slot| {
                    slot.generation += 1;
                    slot.state = WorkerState::Stopped;
                    slot.detach()
                })
                .collect()
        };
        let exits = join_all(detached.into_iter().map(Detached::kill)).await;
        self.record_exits(exits).await;
    }

    async fn record_exits(&self, exits: Vec<(AgentId, Option<ExitInfo>)>) {
        let mut workers = self.workers.lock().await;
        for (agent_id, exit) in exits {
            if let (Some(slot), Some(exit)) = (workers.get_mut(&agent_id), exit) {
                slot.last_exit = Some(exit);
            }
        }
    }

    pub async fn record_heartbeat(&self, agent_id: &AgentId) -> CadenceResult<()> {
        if !self.workers.lock().await.contains_key(agent_id) {
            return Err(CadenceError::not_found(EntityType::Worker, agent_id));
        }
        self.touch(agent_id);
        Ok(())
    }

    /// Write one instruction line to a running worker's stdin.
    pub async fn send_instruction(&self, agent_id: &AgentId, line: &str) -> CadenceResult<()> {
        let handle = {
            let workers = self.workers.lock().await;
            let slot = workers
                .get(agent_id)
                .ok_or_else(|| CadenceError::not_found(EntityType::Worker, agent_id))?;
            slot.handle.clone().ok_or_else(|| SystemError::ProcessIo {
                agent_id: agent_id.to_string(),
                reason: format!("worker is {}", slot.state),
            })?
        };
        let result = handle.lock().await.send_line(line).await;
        result
    }

    /// One supervision tick: detect exits and silent workers, then restart
    /// or retire them. Returns the events raised.
    ///
    /// Exit polls skip an instance whose handle is busy (an instruction
    /// write in progress); silence still applies to it.
    pub async fn check_workers(&self) -> CadenceResult<Vec<SupervisorEvent>> {
        let mut events = Vec::new();

        let running: Vec<(AgentId, u64, SharedHandle)> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .filter(|(_, slot)| slot.state == WorkerState::Running)
                .filter_map(|(id, slot)| {
                    slot.handle
                        .clone()
                        .map(|handle| (id.clone(), slot.generation, handle))
                })
                .collect()
        };

        let mut observed = Vec::with_capacity(running.len());
        for (agent_id, generation, handle) in running {
            let liveness = match handle.try_lock() {
                Ok(mut handle) => match handle.try_exit().await {
                    Ok(Some(exit)) => Liveness::Exited(exit),
                    Ok(None) => Liveness::Alive,
                    Err(e) => {
                        tracing::warn!(agent_id = %agent_id, error = %e, "failed to poll worker exit");
                        Liveness::Alive
                    }
                },
                Err(_) => Liveness::Busy,
            };
            observed.push((agent_id, generation, liveness));
        }

        let now = Instant::now();
        let (doomed, launches) = {
            let mut workers = self.workers.lock().await;
            let mut doomed = Vec::new();
            for (agent_id, generation, liveness) in observed {
                let Some(slot) = workers.get_mut(&agent_id) else {
                    continue;
                };
                if slot.generation != generation || slot.state != WorkerState::Running {
                    continue;
                }
                if let Some(detached) = self.inspect_running(&agent_id, slot, liveness, now, &mut events)
                {
                    doomed.push(detached);
                }
            }

            let mut launches = Vec::new();
            for (agent_id, slot) in workers.iter_mut() {
                if slot.state == WorkerState::Running && slot.handle.is_none() {
                    slot.state = WorkerState::Crashed;
                }
                if slot.state.needs_restart() {
                    if let Some(launch) = self.schedule_restart(agent_id, slot, now, &mut events) {
                        launches.push(launch);
                    }
                }
            }
            (doomed, launches)
        };

        // Silent instances go down before their replacements come up.
        let exits = join_all(doomed.into_iter().map(Detached::kill)).await;
        self.record_exits(exits).await;

        let results = join_all(launches.into_iter().map(|launch| async move {
            let result = self.launch(&launch.spec).await;
            (launch, result)
        }))
        .await;

        let mut orphans = Vec::new();
        {
            let mut workers = self.workers.lock().await;
            for (launch, result) in results {
                let agent_id = launch.agent_id;
                let current = workers
                    .get_mut(&agent_id)
                    .filter(|slot| slot.generation == launch.generation);
                match (current, result) {
                    (Some(slot), Ok(handle)) => {
                        let pid = self.install(slot, handle);
                        tracing::warn!(agent_id = %agent_id, attempt = launch.attempt, pid = ?pid, "worker restarted");
                        self.emit(
                            SupervisorEvent::Restarted {
                                agent_id,
                                attempt: launch.attempt,
                                pid,
                            },
                            &mut events,
                        );
                    }
                    (Some(slot), Err(e)) => {
                        slot.state = WorkerState::Crashed;
                        tracing::warn!(agent_id = %agent_id, attempt = launch.attempt, error = %e, "worker restart failed");
                    }
                    (None, Ok(handle)) => orphans.push((agent_id, handle)),
                    (None, Err(_)) => {}
                }
            }
        }
        for (agent_id, handle) in orphans {
            discard(&agent_id, handle).await;
        }
        Ok(events)
    }

    fn inspect_running(
        &self,
        agent_id: &AgentId,
        slot: &mut WorkerSlot,
        liveness: Liveness,
        now: Instant,
        events: &mut Vec<SupervisorEvent>,
    ) -> Option<Detached> {
        if let Liveness::Exited(exit) = liveness {
            // The pump drains the remaining output on its own.
            slot.handle = None;
            slot.pid = None;
            slot.last_exit = Some(exit.clone());
            slot.state = WorkerState::Crashed;
            tracing::warn!(agent_id = %agent_id, code = ?exit.code, crash = ?exit.crash, "worker exited unexpectedly");
            self.emit(
                SupervisorEvent::Crashed {
                    agent_id: agent_id.clone(),
                    exit,
                },
                events,
            );
            return None;
        }

        let silent = self.silence(agent_id, now);
        if silent <= self.config.stale_threshold {
            return None;
        }
        slot.state = WorkerState::Unhealthy;
        tracing::warn!(agent_id = %agent_id, silent_ms = silent.as_millis() as u64, "worker missed heartbeats");
        self.emit(
            SupervisorEvent::Unhealthy {
                agent_id: agent_id.clone(),
                silent_for_ms: silent.as_millis() as u64,
            },
            events,
        );
        Some(slot.detach())
    }

    /// Retire the worker if its budget is spent, otherwise mark it Starting
    /// and hand back the launch to run outside the table lock.
    fn schedule_restart(
        &self,
        agent_id: &AgentId,
        slot: &mut WorkerSlot,
        now: Instant,
        events: &mut Vec<SupervisorEvent>,
    ) -> Option<PendingLaunch> {
        if slot.restart_attempts >= self.config.max_restart_attempts {
            slot.state = WorkerState::Stopped;
            slot.exhausted = true;
            let reason = format!(
                "worker {agent_id} stopped after {} restart attempts",
                slot.restart_attempts
            );
            tracing::error!(agent_id = %agent_id, attempts = slot.restart_attempts, "restart budget exhausted");
            self.emit(
                SupervisorEvent::Stopped {
                    agent_id: agent_id.clone(),
                    reason: "restart budget exhausted".into(),
                },
                events,
            );
            self.emit(
                SupervisorEvent::Escalation(EscalationEvent::new(
                    EscalationSeverity::Critical,
                    "supervisor",
                    reason,
                )),
                events,
            );
            return None;
        }
        if slot
            .last_restart
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.restart_cooldown)
        {
            return None;
        }

        slot.restart_attempts += 1;
        slot.last_restart = Some(now);
        Some(PendingLaunch {
            agent_id: agent_id.clone(),
            spec: slot.spec.clone(),
            generation: slot.begin_launch(),
            attempt: slot.restart_attempts,
        })
    }

    /// Tick `check_workers` every heartbeat interval until shutdown, then
    /// stop every worker.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            heartbeat_interval_ms = self.config.heartbeat_interval.as_millis() as u64,
            stale_threshold_ms = self.config.stale_threshold.as_millis() as u64,
            "process supervisor started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("process supervisor shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_workers().await {
                        tracing::warn!(error = %e, "supervision tick failed");
                    }
                }
            }
        }

        self.stop_all().await;
    }

    pub async fn worker_states(&self) -> BTreeMap<AgentId, WorkerState> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.state))
            .collect()
    }

    pub async fn worker_status(&self, agent_id: &AgentId) -> CadenceResult<WorkerStatus> {
        self.workers
            .lock()
            .await
            .get(agent_id)
            .map(WorkerSlot::status)
            .ok_or_else(|| CadenceError::not_found(EntityType::Worker, agent_id))
    }

    pub async fn health_check(&self) -> HealthCheck {
        let workers = self.workers.lock().await;
        let count = |state: WorkerState| workers.values().filter(|s| s.state == state).count();
        let running = count(WorkerState::Running);
        let recovering =
            count(WorkerState::Unhealthy) + count(WorkerState::Crashed) + count(WorkerState::Starting);
        let exhausted = workers.values().filter(|s| s.exhausted).count();
        let breaker = self.restart_breaker.state();

        let check = if exhausted > 0 {
            HealthCheck::unhealthy(
                "process_supervisor",
                format!("{exhausted} worker(s) exhausted their restart budget"),
            )
        } else if recovering > 0 || breaker != CircuitState::Closed {
            HealthCheck::degraded(
                "process_supervisor",
                format!("{recovering} worker(s) recovering, launch breaker {breaker}"),
            )
        } else {
            HealthCheck::healthy("process_supervisor")
        };
        check
            .with_metadata("workers", workers.len().into())
            .with_metadata("running", running.into())
            .with_metadata("recovering", recovering.into())
    }
}

/// Kill an instance whose slot moved on while it was launching.
async fn discard(agent_id: &AgentId, mut handle: Box<dyn WorkerHandle>) {
    if let Err(e) = handle.kill().await {
        tracing::warn!(agent_id = %agent_id, error = %e, "failed to kill discarded worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CrashKind;
    use async_trait::async_trait;
    use cadence_core::ResourceGuardConfig;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    struct FakeHandle {
        pid: u32,
        exit_code: Arc<Mutex<Option<i32>>>,
        sent: Arc<Mutex<Vec<String>>>,
        output: Option<WorkerOutputStream>,
    }

    #[async_trait]
    impl WorkerHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        async fn send_line(&mut self, line: &str) -> CadenceResult<()> {
            self.sent.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn take_output(&mut self) -> Option<WorkerOutputStream> {
            self.output.take()
        }

        async fn try_exit(&mut self) -> CadenceResult<Option<ExitInfo>> {
            Ok(self
                .exit_code
                .lock()
                .unwrap()
                .map(|code| ExitInfo::new(Some(code), Vec::new())))
        }

        async fn wait(&mut self) -> CadenceResult<ExitInfo> {
            Ok(ExitInfo::new(Some(0), Vec::new()))
        }

        async fn kill(&mut self) -> CadenceResult<ExitInfo> {
            Ok(ExitInfo::new(None, Vec::new()))
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launches: AtomicU32,
        exit_code: Arc<Mutex<Option<i32>>>,
        sent: Arc<Mutex<Vec<String>>>,
        feed: Mutex<Option<mpsc::Sender<WorkerOutput>>>,
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(&self, _spec: &WorkerSpec) -> CadenceResult<Box<dyn WorkerHandle>> {
            let pid = 1000 + self.launches.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            *self.feed.lock().unwrap() = Some(tx);
            Ok(Box::new(FakeHandle {
                pid,
                exit_code: self.exit_code.clone(),
                sent: self.sent.clone(),
                output: Some(ReceiverStream::new(rx).boxed()),
            }))
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_interval: Duration::from_secs(1),
            stale_threshold: Duration::from_secs(3),
            max_restart_attempts: 2,
            restart_cooldown: Duration::from_millis(500),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 1,
                call_timeout: Duration::from_secs(5),
                recovery_timeout: Duration::from_secs(5),
            },
            launch_retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                backoff_multiplier: 2.0,
            },
        }
    }

    async fn supervisor_with(launcher: Arc<FakeLauncher>) -> ProcessSupervisor {
        let guard = Arc::new(ResourceGuard::new(ResourceGuardConfig::default()));
        let supervisor = ProcessSupervisor::new(config(), launcher, guard);
        supervisor
            .register(WorkerSpec::new("backend", "fake-worker"))
            .await
            .unwrap();
        supervisor
    }

    fn agent() -> AgentId {
        AgentId::from("backend")
    }

    /// Behaviour by program name: `hang` never finishes launching, `crash`
    /// exits at once, `spawn-fails-twice` fails its first two spawns,
    /// `broken` never spawns, anything else stays up.
    #[derive(Default)]
    struct ScriptedLauncher {
        launches: Mutex<HashMap<String, u32>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedLauncher {
        fn launches(&self, program: &str) -> u32 {
            self.launches.lock().unwrap().get(program).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl WorkerLauncher for ScriptedLauncher {
        async fn launch(&self, spec: &WorkerSpec) -> CadenceResult<Box<dyn WorkerHandle>> {
            let count = {
                let mut launches = self.launches.lock().unwrap();
                let count = launches.entry(spec.program.clone()).or_default();
                *count += 1;
                *count
            };
            let spawn_failure = || -> CadenceResult<Box<dyn WorkerHandle>> {
                Err(SystemError::ProcessSpawn {
                    program: spec.program.clone(),
                    reason: "resource temporarily unavailable".into(),
                }
                .into())
            };
            match spec.program.as_str() {
                "hang" => std::future::pending().await,
                "broken" => spawn_failure(),
                "spawn-fails-twice" if count <= 2 => spawn_failure(),
                program => Ok(Box::new(FakeHandle {
                    pid: 2000 + count,
                    exit_code: Arc::new(Mutex::new((program == "crash").then_some(1))),
                    sent: self.sent.clone(),
                    output: None,
                })),
            }
        }
    }

    async fn scripted_supervisor(
        launcher: Arc<ScriptedLauncher>,
        workers: &[(&str, &str)],
    ) -> ProcessSupervisor {
        let guard = Arc::new(ResourceGuard::new(ResourceGuardConfig::default()));
        let supervisor = ProcessSupervisor::new(config(), launcher, guard);
        for (agent_id, program) in workers {
            supervisor
                .register(WorkerSpec::new(*agent_id, *program))
                .await
                .unwrap();
        }
        supervisor
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_is_retired_after_restart_budget() {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = supervisor_with(launcher.clone()).await;
        let mut events_rx = supervisor.subscribe();
        supervisor.start(&agent()).await.unwrap();

        let mut events = Vec::new();
        for _ in 0..30 {
            tokio::time::advance(Duration::from_secs(1)).await;
            events.extend(supervisor.check_workers().await.unwrap());
            if supervisor.worker_states().await[&agent()] == WorkerState::Stopped {
                break;
            }
        }

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
        let restarts = events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Restarted { .. }))
            .count();
        assert_eq!(restarts, 2);
        let unhealthy = events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Unhealthy { .. }))
            .count();
        assert_eq!(unhealthy, 3);
        assert!(events.iter().any(|e| matches!(
            e,
            SupervisorEvent::Escalation(EscalationEvent {
                severity: EscalationSeverity::Critical,
                ..
            })
        )));

        let status = supervisor.worker_status(&agent()).await.unwrap();
        assert_eq!(status.state, WorkerState::Stopped);
        assert_eq!(status.restart_attempts, 2);
        assert_eq!(
            supervisor.health_check().await.status,
            cadence_core::HealthStatus::Unhealthy
        );

        // Started went out on the broadcast channel as well.
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            SupervisorEvent::Started { .. }
        ));

        // Retired workers stay retired.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(supervisor.check_workers().await.unwrap().is_empty());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_output_counts_as_heartbeat() {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = supervisor_with(launcher.clone()).await;
        let mut output = supervisor.subscribe_output();
        supervisor.start(&agent()).await.unwrap();
        let feed = launcher.feed.lock().unwrap().clone().unwrap();

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            feed.send(WorkerOutput {
                agent_id: agent(),
                stream: OutputStream::Stdout,
                line: "__HEARTBEAT__".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();
            output.recv().await.unwrap();
            assert!(supervisor.check_workers().await.unwrap().is_empty());
        }
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(
            supervisor.worker_states().await[&agent()],
            WorkerState::Running
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_heartbeats_keep_worker_running() {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = supervisor_with(launcher.clone()).await;
        supervisor.start(&agent()).await.unwrap();
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(2)).await;
            supervisor.record_heartbeat(&agent()).await.unwrap();
            supervisor.check_workers().await.unwrap();
        }
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(matches!(
            supervisor.record_heartbeat(&AgentId::from("ghost")).await,
            Err(CadenceError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_is_classified_and_restarted() {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = supervisor_with(launcher.clone()).await;
        supervisor.start(&agent()).await.unwrap();

        *launcher.exit_code.lock().unwrap() = Some(137);
        let events = supervisor.check_workers().await.unwrap();
        *launcher.exit_code.lock().unwrap() = None;

        match &events[0] {
            SupervisorEvent::Crashed { exit, .. } => {
                assert_eq!(exit.crash, CrashKind::OutOfMemory)
            }
            other => panic!("expected crash, got {other:?}"),
        }
        assert!(matches!(
            events[1],
            SupervisorEvent::Restarted { attempt: 1, pid: Some(1001), .. }
        ));
        let status = supervisor.worker_status(&agent()).await.unwrap();
        assert_eq!(status.state, WorkerState::Running);
        assert_eq!(status.last_exit.unwrap().code, Some(137));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_spaces_restarts() {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = supervisor_with(launcher.clone()).await;
        supervisor.start(&agent()).await.unwrap();

        *launcher.exit_code.lock().unwrap() = Some(1);
        supervisor.check_workers().await.unwrap();
        // Second instance dies immediately as well; inside the cooldown it
        // is left Crashed.
        let events = supervisor.check_workers().await.unwrap();
        assert!(matches!(events[0], SupervisorEvent::Crashed { .. }));
        assert_eq!(events.len(), 1);
        assert_eq!(
            supervisor.worker_states().await[&agent()],
            WorkerState::Crashed
        );

        tokio::time::advance(Duration::from_millis(600)).await;
        *launcher.exit_code.lock().unwrap() = None;
        let events = supervisor.check_workers().await.unwrap();
        assert!(matches!(
            events[0],
            SupervisorEvent::Restarted { attempt: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_instructions_and_stop() {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = supervisor_with(launcher.clone()).await;
        supervisor.start(&agent()).await.unwrap();
        supervisor
            .send_instruction(&agent(), "EXECUTE {}")
            .await
            .unwrap();
        assert_eq!(launcher.sent.lock().unwrap().as_slice(), ["EXECUTE {}"]);

        let exit = supervisor.stop(&agent()).await.unwrap().unwrap();
        assert_eq!(exit.crash, CrashKind::Signalled);
        assert!(matches!(
            supervisor.send_instruction(&agent(), "EXECUTE {}").await,
            Err(CadenceError::System(SystemError::ProcessIo { .. }))
        ));
        assert!(matches!(
            supervisor.send_instruction(&AgentId::from("ghost"), "x").await,
            Err(CadenceError::NotFound { .. })
        ));
        assert_eq!(
            supervisor.worker_states().await[&agent()],
            WorkerState::Stopped
        );
    }

    #[tokio::test]
    async fn test_register_rejects_running_replacement() {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = supervisor_with(launcher).await;
        supervisor.start(&agent()).await.unwrap();
        assert!(matches!(
            supervisor
                .register(WorkerSpec::new("backend", "other"))
                .await,
            Err(CadenceError::InvalidInput { .. })
        ));
        supervisor.stop(&agent()).await.unwrap();
        supervisor
            .register(WorkerSpec::new("backend", "other"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hung_launch_does_not_block_other_workers() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let supervisor = Arc::new(
            scripted_supervisor(launcher.clone(), &[("fast", "worker"), ("slow", "hang")]).await,
        );
        let fast = AgentId::from("fast");
        let slow = AgentId::from("slow");
        supervisor.start(&fast).await.unwrap();

        let hung_start = {
            let supervisor = supervisor.clone();
            let slow = slow.clone();
            tokio::spawn(async move { supervisor.start(&slow).await })
        };
        while supervisor.worker_states().await[&slow] != WorkerState::Starting {
            tokio::task::yield_now().await;
        }

        let quick = Duration::from_millis(500);
        tokio::time::timeout(quick, supervisor.send_instruction(&fast, "EXECUTE {}"))
            .await
            .expect("instruction blocked by the hung launch")
            .unwrap();
        tokio::time::timeout(quick, supervisor.record_heartbeat(&fast))
            .await
            .expect("heartbeat blocked by the hung launch")
            .unwrap();
        let status = tokio::time::timeout(quick, supervisor.worker_status(&fast))
            .await
            .expect("status blocked by the hung launch")
            .unwrap();
        assert_eq!(status.state, WorkerState::Running);
        let health = tokio::time::timeout(quick, supervisor.health_check())
            .await
            .expect("health check blocked by the hung launch");
        assert_eq!(health.status, cadence_core::HealthStatus::Degraded);
        let events = tokio::time::timeout(quick, supervisor.check_workers())
            .await
            .expect("supervision tick blocked by the hung launch")
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(launcher.sent.lock().unwrap().as_slice(), ["EXECUTE {}"]);

        // Stopping abandons the launch still in flight.
        supervisor.stop(&slow).await.unwrap();
        assert_eq!(supervisor.worker_states().await[&slow], WorkerState::Stopped);
        hung_start.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashing_worker_does_not_disturb_its_neighbour() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let supervisor =
            scripted_supervisor(launcher.clone(), &[("steady", "worker"), ("flaky", "crash")])
                .await;
        let steady = AgentId::from("steady");
        let flaky = AgentId::from("flaky");
        supervisor.start(&steady).await.unwrap();
        supervisor.start(&flaky).await.unwrap();

        let mut events = Vec::new();
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(1)).await;
            supervisor.record_heartbeat(&steady).await.unwrap();
            events.extend(supervisor.check_workers().await.unwrap());
            supervisor
                .send_instruction(&steady, "EXECUTE {}")
                .await
                .unwrap();
        }

        assert_eq!(launcher.launches("crash"), 3);
        assert_eq!(launcher.launches("worker"), 1);
        assert!(events.iter().all(|event| match event {
            SupervisorEvent::Crashed { agent_id, .. }
            | SupervisorEvent::Restarted { agent_id, .. }
            | SupervisorEvent::Stopped { agent_id, .. } => agent_id == &flaky,
            SupervisorEvent::Escalation(_) => true,
            _ => false,
        }));

        let flaky_status = supervisor.worker_status(&flaky).await.unwrap();
        assert_eq!(flaky_status.state, WorkerState::Stopped);
        assert_eq!(flaky_status.restart_attempts, 2);
        let steady_status = supervisor.worker_status(&steady).await.unwrap();
        assert_eq!(steady_status.state, WorkerState::Running);
        assert_eq!(steady_status.restart_attempts, 0);
        assert_eq!(launcher.sent.lock().unwrap().len(), 6);
        assert_eq!(
            supervisor.health_check().await.status,
            cadence_core::HealthStatus::Unhealthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_spawn_failures_are_retried() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let supervisor =
            scripted_supervisor(launcher.clone(), &[("backend", "spawn-fails-twice")]).await;

        let pid = supervisor.start(&agent()).await.unwrap();
        assert_eq!(pid, Some(2003));
        assert_eq!(launcher.launches("spawn-fails-twice"), 3);
        let stats = supervisor.breaker_stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spent_launch_retries_count_as_one_failed_start() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let supervisor = scripted_supervisor(launcher.clone(), &[("backend", "broken")]).await;

        assert!(matches!(
            supervisor.start(&agent()).await,
            Err(CadenceError::System(SystemError::ProcessSpawn { .. }))
        ));
        assert_eq!(launcher.launches("broken"), 4);
        assert_eq!(supervisor.breaker_stats().total_failures, 1);
        assert_eq!(
            supervisor.worker_states().await[&agent()],
            WorkerState::Crashed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_stops_workers_on_shutdown() {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = Arc::new(supervisor_with(launcher).await);
        supervisor.start(&agent()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let loop_handle = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send(true).unwrap();
        loop_handle.await.unwrap();
        assert_eq!(
            supervisor.worker_states().await[&agent()],
            WorkerState::Stopped
        );
    }
}
