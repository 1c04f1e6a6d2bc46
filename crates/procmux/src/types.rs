//! Foundational public types for the procmux library.
//!
//! This module defines the core data structures used throughout the library:
//! - [`Value`] — the typed values that cross channels
//! - [`ValueStack`] — a process' bounded value stack
//! - [`Status`] — the lifecycle states of a process descriptor
//! - [`RuntimeSettings`] — configuration for a runtime instance
//! - [`RuntimeError`] — structured error variants

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum accepted length, in bytes, of a channel name.
pub const MAX_CHANNEL_NAME: usize = 255;

/// Default admission limit of a process' value stack, in slots.
pub const DEFAULT_STACK_SLOTS: usize = 256;

// ── Values ────────────────────────────────────────────────────────────────────

/// A typed value as seen by scripts and the host.
///
/// Only `Nil`, `Bool`, `Number` and `Str` may cross a channel; `Table` exists
/// so that a script can hold (and attempt to send) a composite value, which
/// the transfer routine refuses with the unsupported-type error pair.
///
/// Strings are byte strings: content is copied verbatim, embedded NUL bytes
/// included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Str(Vec<u8>),
    Table(Vec<(Value, Value)>),
}

impl Value {
    /// Build a `Str` value from UTF-8 text.
    pub fn str(s: &str) -> Value {
        Value::Str(s.as_bytes().to_vec())
    }

    /// Name of this value's type, as used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
        }
    }

    /// Whether this value may cross a channel.
    pub fn is_transferable(&self) -> bool {
        !matches!(self, Value::Table(_))
    }

    /// Equality with NaN considered equal to NaN.
    ///
    /// `PartialEq` follows IEEE semantics (`NaN != NaN`), which is the wrong
    /// notion when asserting that a value survived a channel round trip.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (a, b) => a == b,
        }
    }
}

// ── Value stack ───────────────────────────────────────────────────────────────

/// A process' value stack.
///
/// Slot numbering follows the channel-operation convention: during a send or
/// receive, slot 1 holds the channel name and slots 2..N hold the payload
/// (slot 1 is index 0 of the underlying vector).
///
/// The limit is an admission bound consulted by
/// [`has_headroom`](ValueStack::has_headroom) before a transfer; pushes
/// themselves are unchecked so the out-of-band error pair always fits.
#[derive(Debug)]
pub struct ValueStack {
    slots: Vec<Value>,
    limit: usize,
}

impl ValueStack {
    pub fn new(limit: usize) -> Self {
        ValueStack {
            slots: Vec::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, v: Value) {
        self.slots.push(v);
    }

    /// Keep the first `n` slots, dropping the rest.
    pub fn truncate(&mut self, n: usize) {
        self.slots.truncate(n);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Whether `extra` more slots fit under the admission limit.
    pub fn has_headroom(&self, extra: usize) -> bool {
        self.slots.len() + extra <= self.limit
    }

    pub fn values(&self) -> &[Value] {
        &self.slots
    }

    /// The last `n` slots (all slots if fewer are present).
    pub fn top(&self, n: usize) -> &[Value] {
        let start = self.slots.len().saturating_sub(n);
        &self.slots[start..]
    }

    /// Remove and return the last `n` slots.
    pub fn take_top(&mut self, n: usize) -> Vec<Value> {
        let start = self.slots.len().saturating_sub(n);
        self.slots.split_off(start)
    }

    /// Push the out-of-band `(nil, message)` error pair.
    pub fn push_error_pair(&mut self, message: &str) {
        self.slots.push(Value::Nil);
        self.slots.push(Value::str(message));
    }
}

// ── Process status ────────────────────────────────────────────────────────────

/// Lifecycle state of a process descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Created or recycled, not yet queued.
    Idle,
    /// On the ready queue or executing on a worker.
    Ready,
    /// Parked on a channel's send queue.
    BlockedSend,
    /// Parked on a channel's receive queue.
    BlockedRecv,
    /// Ran to completion.
    Finished,
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Configuration for one runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Number of worker threads spawned at construction. Default: 4.
    pub workers: usize,

    /// Maximum idle interpreters kept for reuse. Default: 0 (no recycling).
    pub recycle_max: usize,

    /// Maximum entries in the compiled-chunk cache. Default: 256.
    pub chunk_cache_size: usize,

    /// Admission limit of each process' value stack, in slots. Default: 256.
    pub stack_slots: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            recycle_max: 0,
            chunk_cache_size: 256,
            stack_slots: DEFAULT_STACK_SLOTS,
        }
    }
}

impl RuntimeSettings {
    /// Defaults overridden by the `PROCMUX_WORKERS`, `PROCMUX_RECYCLE_MAX`
    /// and `PROCMUX_CHUNK_CACHE_SIZE` environment variables, when set and
    /// parseable.
    pub fn from_env() -> Self {
        fn env_usize(name: &str) -> Option<usize> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        let defaults = Self::default();
        Self {
            workers: env_usize("PROCMUX_WORKERS").unwrap_or(defaults.workers),
            recycle_max: env_usize("PROCMUX_RECYCLE_MAX").unwrap_or(defaults.recycle_max),
            chunk_cache_size: env_usize("PROCMUX_CHUNK_CACHE_SIZE")
                .unwrap_or(defaults.chunk_cache_size),
            ..defaults
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Which side of a transfer an error was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferSide {
    Send,
    Receive,
}

/// The peer a parked process was waiting for when its channel was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Sender,
    Receiver,
}

/// Structured error variants produced by runtime operations.
///
/// Serialized with an internally-tagged `"type"` discriminator field so that
/// JSON consumers can switch on `error.type` without a wrapper object.
/// `Display` yields the canonical message text that scripts see in their
/// `(nil, message)` pairs.
///
/// # Examples (JSON)
/// ```json
/// {"type":"ChannelNotFound","name":"jobs"}
/// {"type":"UnsupportedValue","side":"Send"}
/// {"type":"ChannelDestroyed","name":"jobs","waiting_for":"Sender"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeError {
    /// The named channel is absent from the registry.
    ChannelNotFound { name: String },

    /// A channel with this name is already registered.
    ChannelExists { name: String },

    /// A transfer was refused because a value was not a transferable scalar.
    UnsupportedValue { side: TransferSide },

    /// A transfer was refused because the receiver's stack lacked headroom.
    StackExhausted { side: TransferSide },

    /// The channel was destroyed while this party was parked on it.
    ChannelDestroyed { name: String, waiting_for: PeerRole },

    /// A non-blocking receive found no sender waiting.
    NoSenders { name: String },

    /// The scheduler could not spawn a worker thread.
    WorkerSpawn { message: String },

    /// A chunk failed to load or compile.
    Load { message: String },

    /// An operation argument was rejected.
    InvalidArgument { message: String },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::ChannelNotFound { name } => {
                write!(f, "channel '{name}' does not exist")
            }
            RuntimeError::ChannelExists { name } => {
                write!(f, "channel '{name}' already exists")
            }
            RuntimeError::UnsupportedValue { side: TransferSide::Send } => {
                write!(f, "failed to send unsupported value type")
            }
            RuntimeError::UnsupportedValue { side: TransferSide::Receive } => {
                write!(f, "failed to receive unsupported value type")
            }
            RuntimeError::StackExhausted { side: TransferSide::Send } => {
                write!(f, "not enough space in the receiver's stack")
            }
            RuntimeError::StackExhausted { side: TransferSide::Receive } => {
                write!(f, "not enough space in the stack")
            }
            RuntimeError::ChannelDestroyed { name, waiting_for } => {
                let role = match waiting_for {
                    PeerRole::Sender => "sender",
                    PeerRole::Receiver => "receiver",
                };
                write!(f, "channel '{name}' destroyed while waiting for {role}")
            }
            RuntimeError::NoSenders { name } => {
                write!(f, "no senders waiting on channel '{name}'")
            }
            RuntimeError::WorkerSpawn { message } => {
                write!(f, "failed to create worker: {message}")
            }
            RuntimeError::Load { message } => write!(f, "{message}"),
            RuntimeError::InvalidArgument { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    // ── RuntimeSettings::default() field assertions ───────────────────────────

    #[test]
    fn test_settings_default_workers() {
        assert_eq!(RuntimeSettings::default().workers, 4);
    }

    #[test]
    fn test_settings_default_recycle_max_is_zero() {
        assert_eq!(RuntimeSettings::default().recycle_max, 0);
    }

    #[test]
    fn test_settings_default_chunk_cache_size() {
        assert_eq!(RuntimeSettings::default().chunk_cache_size, 256);
    }

    #[test]
    fn test_settings_from_env_overrides() {
        std::env::set_var("PROCMUX_WORKERS", "9");
        std::env::set_var("PROCMUX_RECYCLE_MAX", "3");
        std::env::set_var("PROCMUX_CHUNK_CACHE_SIZE", "17");
        let settings = RuntimeSettings::from_env();
        std::env::remove_var("PROCMUX_WORKERS");
        std::env::remove_var("PROCMUX_RECYCLE_MAX");
        std::env::remove_var("PROCMUX_CHUNK_CACHE_SIZE");
        assert_eq!(settings.workers, 9);
        assert_eq!(settings.recycle_max, 3);
        assert_eq!(settings.chunk_cache_size, 17);
        assert_eq!(settings.stack_slots, DEFAULT_STACK_SLOTS);
    }

    // ── Value ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_value_str_keeps_nul_bytes() {
        let v = Value::str("a\0b");
        assert_eq!(v, Value::Str(vec![b'a', 0, b'b']));
    }

    #[test]
    fn test_value_transferability() {
        assert!(Value::Nil.is_transferable());
        assert!(Value::Bool(true).is_transferable());
        assert!(Value::Number(1.5).is_transferable());
        assert!(Value::str("x").is_transferable());
        assert!(!Value::Table(vec![]).is_transferable());
    }

    #[test]
    fn test_value_same_as_nan() {
        let nan = Value::Number(f64::NAN);
        assert_ne!(nan, nan.clone(), "PartialEq must keep IEEE semantics");
        assert!(nan.same_as(&nan.clone()), "same_as must equate NaN to NaN");
        assert!(!nan.same_as(&Value::Number(0.0)));
    }

    #[test]
    fn test_value_serde_round_trip() {
        let values = vec![
            Value::Nil,
            Value::Bool(false),
            Value::Number(-3.25),
            Value::Str(vec![0, 255, b'z']),
            Value::Table(vec![(Value::str("k"), Value::Number(1.0))]),
        ];
        for v in values {
            let json = serde_json::to_string(&v).expect("serialize Value");
            let back: Value = serde_json::from_str(&json).expect("deserialize Value");
            assert_eq!(back, v, "round trip changed {json}");
        }
    }

    // ── ValueStack ────────────────────────────────────────────────────────────

    #[test]
    fn test_stack_headroom_accounting() {
        let mut stack = ValueStack::new(3);
        assert!(stack.has_headroom(3));
        stack.push(Value::Nil);
        stack.push(Value::Nil);
        assert!(stack.has_headroom(1));
        assert!(!stack.has_headroom(2));
    }

    #[test]
    fn test_stack_error_pair_bypasses_limit() {
        let mut stack = ValueStack::new(1);
        stack.push(Value::str("name"));
        stack.push_error_pair("boom");
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.top(2), &[Value::Nil, Value::str("boom")]);
    }

    #[test]
    fn test_stack_take_top() {
        let mut stack = ValueStack::new(8);
        stack.push(Value::str("c"));
        stack.push(Value::Number(1.0));
        stack.push(Value::Number(2.0));
        let top = stack.take_top(2);
        assert_eq!(top, vec![Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_stack_take_top_more_than_present() {
        let mut stack = ValueStack::new(8);
        stack.push(Value::Nil);
        let top = stack.take_top(5);
        assert_eq!(top.len(), 1);
        assert!(stack.is_empty());
    }

    // ── RuntimeError display strings ──────────────────────────────────────────

    #[test]
    fn test_error_display_texts() {
        let cases = [
            (
                RuntimeError::ChannelNotFound { name: "c".into() },
                "channel 'c' does not exist",
            ),
            (
                RuntimeError::ChannelExists { name: "c".into() },
                "channel 'c' already exists",
            ),
            (
                RuntimeError::UnsupportedValue { side: TransferSide::Send },
                "failed to send unsupported value type",
            ),
            (
                RuntimeError::UnsupportedValue { side: TransferSide::Receive },
                "failed to receive unsupported value type",
            ),
            (
                RuntimeError::StackExhausted { side: TransferSide::Send },
                "not enough space in the receiver's stack",
            ),
            (
                RuntimeError::StackExhausted { side: TransferSide::Receive },
                "not enough space in the stack",
            ),
            (
                RuntimeError::ChannelDestroyed {
                    name: "x".into(),
                    waiting_for: PeerRole::Sender,
                },
                "channel 'x' destroyed while waiting for sender",
            ),
            (
                RuntimeError::NoSenders { name: "c".into() },
                "no senders waiting on channel 'c'",
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn test_error_serde_tagged() {
        let err = RuntimeError::ChannelNotFound { name: "jobs".into() };
        let json = serde_json::to_string(&err).expect("serialize RuntimeError");
        assert!(
            json.contains(r#""type":"ChannelNotFound""#),
            "JSON should contain type discriminator: {json}"
        );
        let back: RuntimeError = serde_json::from_str(&json).expect("deserialize RuntimeError");
        assert_eq!(back, err);
    }
}
