pub mod bits;
pub mod bus;
pub mod cache;
pub mod config;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod helpers;
pub mod ir;
pub mod loader;
pub mod mmu;
pub mod snapshot;
pub mod trace;
pub mod translate;

pub use bus::{Bus, Ram};
pub use config::CoreConfig;
pub use cpu::{CpuState, Exception, ExceptionEvent, HFlags, csr};
pub use error::{CoreError, CoreResult, MemoryError};

// ═══════════════════════════════════════════════════════════════════════════
// Engine Exports
// ═══════════════════════════════════════════════════════════════════════════

pub use engine::{
    AccelExit, AccelVcpu, AcceleratedEngine, ExecutionEngine, RunResult, SoftwareEngine,
    StopReason, select_engine,
};
pub use cache::{CacheStats, TbCache};
pub use snapshot::CoreSnapshot;
pub use trace::{TraceBuffer, TraceEvent, TraceStats};
