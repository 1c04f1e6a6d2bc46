// procmux: a runtime that multiplexes lightweight script processes over a
// bounded pool of worker threads, coordinated through named rendezvous
// channels.

pub mod cache;
mod channel;
pub mod engine;
mod list;
pub mod ops;
mod process;
pub mod runtime;
mod sched;
pub mod types;

pub use cache::ChunkCache;
pub use engine::{Chunk, EngineFactory, LoadError, Resume, ScriptEngine, Syscall};
pub use ops::{OpEngineFactory, OpInterp};
pub use runtime::Runtime;
pub use types::{
    RuntimeError, RuntimeSettings, Status, Value, ValueStack, DEFAULT_STACK_SLOTS,
    MAX_CHANNEL_NAME,
};
