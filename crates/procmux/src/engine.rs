//! The embedded-interpreter contract.
//!
//! The runtime never links a concrete scripting engine; it drives anything
//! that implements [`ScriptEngine`]. An engine owns one isolated interpreter
//! instance and its [`ValueStack`]. Execution is cooperative: `resume` runs
//! the script until it finishes, faults, or suspends by yielding a typed
//! [`Syscall`] for the runtime to service.
//!
//! ## Stack conventions
//!
//! - Before yielding `Send`, the engine leaves `[name, v1..vk]` on its stack
//!   (slot 1 the channel name, slots 2..N the payload).
//! - Before yielding `Receive`, the stack holds at least the channel name.
//! - When an operation completes, the runtime resumes the engine with
//!   `nargs`: the top `nargs` stack slots are the operation's results
//!   (`true` for a completed send, the received values, or the out-of-band
//!   `(nil, message)` pair). The engine consumes them and owns whatever is
//!   left of its stack.
//!
//! ## Lifecycle
//!
//! `load` accepts textual source or the engine's own bytecode form (what
//! `dump` produced earlier); loading an empty source must succeed and yield a
//! program that finishes immediately. `reset` clears all residual program
//! state so the instance can be recycled for an unrelated chunk.

use crate::types::{RuntimeError, ValueStack};

// ── Chunks ────────────────────────────────────────────────────────────────────

/// A unit of loadable code: textual source or precompiled bytecode.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Source(String),
    Bytecode(Vec<u8>),
}

impl Chunk {
    /// Build a source chunk from text.
    pub fn source(text: &str) -> Chunk {
        Chunk::Source(text.to_string())
    }
}

/// Failure to load or compile a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadError {
    pub message: String,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        LoadError { message: message.into() }
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LoadError {}

impl From<LoadError> for RuntimeError {
    fn from(e: LoadError) -> Self {
        RuntimeError::Load { message: e.message }
    }
}

// ── Suspension requests ───────────────────────────────────────────────────────

/// A request yielded by a suspended script for the runtime to service.
///
/// `Send` and `Receive` may park the process; every other request completes
/// inline and the engine is resumed immediately with the reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Syscall {
    /// Rendezvous send; payload is on the stack.
    Send { channel: String },
    /// Rendezvous receive; `nowait` makes an empty channel an error reply
    /// instead of parking.
    Receive { channel: String, nowait: bool },
    /// Spawn a sibling process from a chunk.
    NewProcess { chunk: Chunk },
    /// Register a new channel.
    NewChannel { name: String },
    /// Destroy a channel, unblocking everything parked on it.
    DelChannel { name: String },
    /// Resize the worker pool.
    SetWorkers { count: usize },
    /// Query the live worker count.
    GetWorkers,
    /// Bound the idle-interpreter recycle pool.
    SetRecycleMax { max: usize },
    /// Voluntary reschedule; the process re-enters the ready queue tail.
    Pass,
}

/// Outcome of one `resume` call.
#[derive(Debug)]
pub enum Resume {
    /// The script ran to completion.
    Finished,
    /// The script suspended on a request.
    Yield(Syscall),
    /// The script failed; the message is reported and the interpreter
    /// destroyed.
    Fault(String),
}

// ── Engine traits ─────────────────────────────────────────────────────────────

/// One isolated interpreter instance bound to a process.
///
/// Implementations must be `Send` (a process migrates between workers across
/// suspensions) but are never shared: the runtime guarantees exclusive access
/// for the duration of every call.
pub trait ScriptEngine: Send {
    /// Load a chunk, replacing any previously loaded program.
    fn load(&mut self, chunk: &Chunk) -> Result<(), LoadError>;

    /// Run until completion, fault, or suspension. The top `nargs` slots of
    /// the stack are the results of the previously yielded request.
    fn resume(&mut self, nargs: usize) -> Resume;

    /// The engine's value stack.
    fn stack(&mut self) -> &mut ValueStack;

    /// Bytecode for the currently loaded program, if the engine supports
    /// dumping. Feeds the spawn path's compiled-chunk cache.
    fn dump(&self) -> Option<Vec<u8>> {
        None
    }

    /// Drop all residual program state so the instance can be recycled.
    fn reset(&mut self);
}

/// Manufactures fresh engine instances for the spawn path.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Box<dyn ScriptEngine>;
}
