//! Process descriptors and the value-transfer routine.
//!
//! A [`Process`] binds one script to one isolated interpreter instance. The
//! descriptor is what moves through queues: the scheduler's ready queue, a
//! channel's send/receive wait queue, or the recycle pool; it is a member of
//! at most one of them at any instant, via the embedded `next` link.
//!
//! Three descriptor shapes exist:
//! - script processes, carrying an engine;
//! - the host descriptor, engine-less, whose "resume" is a condition-variable
//!   signal on `resumed` rather than a scheduler enqueue;
//! - worker-shutdown sentinels, engine-less, carrying the destroy-worker
//!   flag.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::channel::Channel;
use crate::engine::ScriptEngine;
use crate::types::{RuntimeError, Status, TransferSide, Value, ValueStack};

// ── Descriptor ────────────────────────────────────────────────────────────────

pub(crate) struct Process {
    state: Mutex<ProcState>,
    /// Host rendezvous signal; unused by script processes and sentinels.
    pub(crate) resumed: Condvar,
    /// Intrusive queue link. Only the lock of the owning queue's structure
    /// touches it.
    pub(crate) next: Mutex<Option<Arc<Process>>>,
}

pub(crate) struct ProcState {
    pub status: Status,
    /// Number of stack values to deliver on the next resume.
    pub args: usize,
    /// Back-pointer to the channel this process is parked on; valid only
    /// while status is BlockedSend or BlockedRecv.
    pub chan: Option<Arc<Channel>>,
    /// The interpreter. Taken by the worker while the script executes; `None`
    /// for the host descriptor and sentinels.
    pub engine: Option<Box<dyn ScriptEngine>>,
    /// Stack for engine-less descriptors (the host party).
    pub stack: ValueStack,
    /// Worker exits after this descriptor completes.
    pub destroy_worker: bool,
    /// This is the host descriptor.
    pub host: bool,
    /// Host wake predicate: a peer finished delivering values.
    pub delivered: bool,
    /// Typed error for the host party (destroyed channel, refused transfer).
    pub fault: Option<RuntimeError>,
}

impl Process {
    /// A script process with a loaded engine, ready to be scheduled.
    pub(crate) fn script(engine: Box<dyn ScriptEngine>) -> Arc<Process> {
        Self::build(Some(engine), false, false, 0)
    }

    /// An engine-less sentinel whose completion shuts down one worker.
    pub(crate) fn sentinel() -> Arc<Process> {
        Self::build(None, true, false, 0)
    }

    /// The host participant descriptor.
    pub(crate) fn host(stack_slots: usize) -> Arc<Process> {
        Self::build(None, false, true, stack_slots)
    }

    fn build(
        engine: Option<Box<dyn ScriptEngine>>,
        destroy_worker: bool,
        host: bool,
        stack_slots: usize,
    ) -> Arc<Process> {
        Arc::new(Process {
            state: Mutex::new(ProcState {
                status: Status::Idle,
                args: 0,
                chan: None,
                engine,
                stack: ValueStack::new(stack_slots),
                destroy_worker,
                host,
                delivered: false,
                fault: None,
            }),
            resumed: Condvar::new(),
            next: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ProcState> {
        self.state.lock().expect("process state poisoned")
    }
}

impl ProcState {
    /// The stack a transfer operates on: the engine's for script processes,
    /// the embedded one for the host.
    pub(crate) fn stack_mut(&mut self) -> &mut ValueStack {
        match self.engine.as_mut() {
            Some(engine) => engine.stack(),
            None => &mut self.stack,
        }
    }

    /// Reinitialize a recycled descriptor for a fresh spawn.
    pub(crate) fn reuse(&mut self) {
        self.status = Status::Idle;
        self.args = 0;
        self.chan = None;
        self.destroy_worker = false;
        self.delivered = false;
        self.fault = None;
    }
}

// ── Value transfer ────────────────────────────────────────────────────────────

/// Why a transfer was refused. The caller maps this to a typed error for a
/// host party via [`TransferFault::into_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferFault {
    Unsupported,
    NoHeadroom,
}

impl TransferFault {
    pub(crate) fn into_error(self, side: TransferSide) -> RuntimeError {
        match self {
            TransferFault::Unsupported => RuntimeError::UnsupportedValue { side },
            TransferFault::NoHeadroom => RuntimeError::StackExhausted { side },
        }
    }
}

/// Copy the payload (slots 2..N; slot 1 is the channel name) from the
/// sender's stack onto the receiver's stack.
///
/// All-or-nothing: refusal leaves descriptive `(nil, message)` pairs on both
/// stacks (the receiver's truncated to slot 1 first in the unsupported-type
/// case) and reports the fault. Success returns the number of values
/// transferred. Strings are copied by content, embedded NUL bytes included.
pub(crate) fn move_values(
    from: &mut ValueStack,
    to: &mut ValueStack,
) -> Result<usize, TransferFault> {
    let total = from.len();

    if !to.has_headroom(total) {
        to.push_error_pair(
            &RuntimeError::StackExhausted { side: TransferSide::Receive }.to_string(),
        );
        from.push_error_pair(
            &RuntimeError::StackExhausted { side: TransferSide::Send }.to_string(),
        );
        return Err(TransferFault::NoHeadroom);
    }

    let payload = from.values().get(1..).unwrap_or(&[]);
    if let Some(bad) = payload.iter().find(|v| !v.is_transferable()) {
        log::debug!("transfer refused: {} value", bad.type_name());
        to.truncate(1);
        to.push_error_pair(
            &RuntimeError::UnsupportedValue { side: TransferSide::Receive }.to_string(),
        );
        from.push_error_pair(
            &RuntimeError::UnsupportedValue { side: TransferSide::Send }.to_string(),
        );
        return Err(TransferFault::Unsupported);
    }

    let copied: Vec<Value> = payload.to_vec();
    let count = copied.len();
    for v in copied {
        to.push(v);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender_stack(payload: &[Value]) -> ValueStack {
        let mut s = ValueStack::new(64);
        s.push(Value::str("chan"));
        for v in payload {
            s.push(v.clone());
        }
        s
    }

    #[test]
    fn test_move_values_copies_scalars() {
        let mut from = sender_stack(&[
            Value::Nil,
            Value::Bool(true),
            Value::Number(4.5),
            Value::Str(vec![b'a', 0, b'b']),
        ]);
        let mut to = ValueStack::new(64);
        to.push(Value::str("chan"));

        let moved = move_values(&mut from, &mut to).expect("transfer should succeed");
        assert_eq!(moved, 4);
        assert_eq!(
            to.values()[1..],
            [
                Value::Nil,
                Value::Bool(true),
                Value::Number(4.5),
                Value::Str(vec![b'a', 0, b'b']),
            ]
        );
        // The sender's stack is untouched on success.
        assert_eq!(from.len(), 5);
    }

    #[test]
    fn test_move_values_zero_payload() {
        let mut from = sender_stack(&[]);
        let mut to = ValueStack::new(4);
        assert_eq!(move_values(&mut from, &mut to), Ok(0));
        assert!(to.is_empty());
    }

    #[test]
    fn test_move_values_refuses_table() {
        let mut from = sender_stack(&[Value::Number(1.0), Value::Table(vec![])]);
        let mut to = ValueStack::new(64);
        to.push(Value::str("chan"));
        to.push(Value::Bool(false)); // residue beyond slot 1 must be dropped

        let fault = move_values(&mut from, &mut to).expect_err("table must be refused");
        assert_eq!(fault, TransferFault::Unsupported);
        assert_eq!(
            to.values(),
            &[
                Value::str("chan"),
                Value::Nil,
                Value::str("failed to receive unsupported value type"),
            ]
        );
        assert_eq!(
            from.top(2),
            &[
                Value::Nil,
                Value::str("failed to send unsupported value type"),
            ]
        );
    }

    #[test]
    fn test_move_values_refuses_without_headroom() {
        let mut from = sender_stack(&[Value::Number(1.0), Value::Number(2.0)]);
        let mut to = ValueStack::new(2);
        to.push(Value::str("chan"));

        let fault = move_values(&mut from, &mut to).expect_err("headroom must be enforced");
        assert_eq!(fault, TransferFault::NoHeadroom);
        assert_eq!(
            to.top(2),
            &[Value::Nil, Value::str("not enough space in the stack")]
        );
        assert_eq!(
            from.top(2),
            &[
                Value::Nil,
                Value::str("not enough space in the receiver's stack"),
            ]
        );
    }

    #[test]
    fn test_transfer_fault_error_mapping() {
        assert_eq!(
            TransferFault::Unsupported.into_error(TransferSide::Send),
            RuntimeError::UnsupportedValue { side: TransferSide::Send }
        );
        assert_eq!(
            TransferFault::NoHeadroom.into_error(TransferSide::Receive),
            RuntimeError::StackExhausted { side: TransferSide::Receive }
        );
    }

    #[test]
    fn test_descriptor_reuse_clears_scheduling_fields() {
        let lp = Process::sentinel();
        {
            let mut st = lp.state();
            st.status = Status::Finished;
            st.args = 3;
            st.delivered = true;
            st.reuse();
            assert_eq!(st.status, Status::Idle);
            assert_eq!(st.args, 0);
            assert!(st.chan.is_none());
            assert!(!st.destroy_worker);
            assert!(!st.delivered);
            assert!(st.fault.is_none());
        }
    }
}
