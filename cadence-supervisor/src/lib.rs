//! Cadence Supervisor - Fault Tolerance
//!
//! Protection primitives and the worker process lifecycle:
//!
//! - `CircuitBreaker`: failure-threshold gate with timed recovery probes
//! - `ResourceGuard`: concurrency slots plus a memory ceiling with cleanup
//! - `retry_with_backoff`: bounded exponential retry of `System` errors
//! - `WorkerProcess`: OS process with piped stdio and a line output stream
//! - `ProcessSupervisor`: heartbeat checks, crash detection, bounded restart
//! - `TransportServer` / `TransportClient`: length-prefixed JSON frames over
//!   a Unix socket

mod breaker;
mod guard;
mod process;
mod retry;
mod supervisor;
#[cfg(unix)]
mod transport;

pub use breaker::{CircuitBreaker, CircuitBreakerStats};
pub use guard::{
    open_handle_count, GuardPermit, MemoryCheck, MemoryProbe, ProcStatmProbe, ResourceGuard,
    ResourceGuardStats,
};
pub use process::{
    classify_exit, CrashKind, ExitInfo, OutputStream, ProcessLauncher, WorkerHandle,
    WorkerLauncher, WorkerLine, WorkerOutput, WorkerOutputStream, WorkerProcess, WorkerSpec,
};
pub use retry::retry_with_backoff;
pub use supervisor::{ProcessSupervisor, SupervisorConfig, SupervisorEvent, WorkerStatus};
#[cfg(unix)]
pub use transport::{FrameCodec, TransportClient, TransportSender, TransportServer, WireMessage};
