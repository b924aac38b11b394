//! Default values for every configuration knob.
//!
//! `CadenceConfig::default()` and the `CADENCE_*` environment loader both
//! read from here.

// ============================================================================
// AGENTS AND TASKS
// ============================================================================

/// Default cap on agents working at the same time
pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 8;

/// Default wall-clock limit for a single task execution (10 minutes)
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 600_000;

/// Default age after which an agent without updates is considered stale (60 seconds)
pub const DEFAULT_STALE_AGENT_THRESHOLD_MS: u64 = 60_000;

/// Default number of times a conflicting task is deferred before giving up
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default number of history samples kept per agent
pub const DEFAULT_PROGRESS_HISTORY_LIMIT: usize = 500;

/// Default number of most recent samples per agent used for trend analysis
pub const DEFAULT_TREND_WINDOW: usize = 20;

// ============================================================================
// WORKFLOW
// ============================================================================

/// Default quality score at or above which a workflow is approved
pub const DEFAULT_QUALITY_HIGH_THRESHOLD: f64 = 80.0;

/// Default quality score below which a redesign is escalated
pub const DEFAULT_QUALITY_LOW_THRESHOLD: f64 = 50.0;

/// Default sprint length in virtual time units
pub const DEFAULT_SPRINT_DURATION_UNITS: u64 = 60;

/// Default wall-clock length of one virtual time unit (1 second)
pub const DEFAULT_VIRTUAL_TIME_UNIT_MS: u64 = 1_000;

/// Default number of sprints before sub-threshold quality is escalated
pub const DEFAULT_MAX_SPRINT_ITERATIONS: u32 = 5;

// ============================================================================
// PROCESS SUPERVISION
// ============================================================================

/// Default interval between heartbeat checks (5 seconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Default number of restarts before a worker is stopped for good
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;

/// Default pause between two restarts of the same worker (2 seconds)
pub const DEFAULT_RESTART_COOLDOWN_MS: u64 = 2_000;

/// Lines of stderr kept for crash classification
pub const STDERR_TAIL_LINES: usize = 50;

/// Capacity of the per-worker output broadcast channel
pub const WORKER_OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the supervisor event broadcast channel
pub const SUPERVISOR_EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Default consecutive failures before the circuit opens
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// Default consecutive half-open successes before the circuit closes
pub const DEFAULT_CIRCUIT_SUCCESS_THRESHOLD: u32 = 2;

/// Default per-call timeout (30 seconds)
pub const DEFAULT_CIRCUIT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default wait in Open before a probe is allowed (30 seconds)
pub const DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// RESOURCE GUARD
// ============================================================================

/// Default cap on concurrently guarded operations
pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 32;

/// Default resident memory ceiling (2 GiB)
pub const DEFAULT_MEMORY_CEILING_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default interval between memory checks (10 seconds)
pub const DEFAULT_MEMORY_CHECK_INTERVAL_MS: u64 = 10_000;

// ============================================================================
// RETRY
// ============================================================================

/// Default retries after the first attempt
pub const DEFAULT_RETRY_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 100;

/// Default upper bound on the delay between retries
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 10_000;

/// Default backoff growth factor
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

// ============================================================================
// TRANSPORT
// ============================================================================

/// Largest accepted frame body (8 MiB)
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Capacity of the inbound transport queue
pub const TRANSPORT_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// WORKER LINE PROTOCOL
// ============================================================================

/// Prefix of a worker line carrying a JSON `ProgressReport`
pub const PROGRESS_MARKER: &str = "__PROGRESS__:";

/// Prefix of a worker line reporting a finished task id
pub const TASK_DONE_MARKER: &str = "__TASK_DONE__:";

/// Prefix of a worker line reporting a failed task id and reason
pub const TASK_FAILED_MARKER: &str = "__TASK_FAILED__:";

/// Prefix of a worker line carrying a bare heartbeat
pub const HEARTBEAT_MARKER: &str = "__HEARTBEAT__";

/// Instruction verb written to a worker's stdin to start a task
pub const EXECUTE_COMMAND: &str = "EXECUTE";
