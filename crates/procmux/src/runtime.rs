//! The runtime object: registry + scheduler + recycle pool + chunk cache
//! behind one handle.
//!
//! Everything a host program does goes through [`Runtime`]: spawning script
//! processes, creating and destroying channels, sending and receiving as a
//! participant, resizing the worker pool, and waiting for quiescence.
//! Instances are fully independent: two runtimes share no channels, workers
//! or caches, so a test (or an embedding) can run several side by side.
//!
//! ## The host as a participant
//!
//! The host thread is not part of the worker pool, but it can send and
//! receive. It is represented by a singleton engine-less descriptor that
//! parks on channel queues like any process; its "resume" is a signal on a
//! dedicated condition variable rather than a scheduler enqueue, because the
//! outer thread cannot yield into the scheduler. Host operations are
//! serialized by a host-op mutex: the host is one logical participant.
//!
//! ## Teardown
//!
//! Hosts are expected to call [`wait`](Runtime::wait) before dropping the
//! runtime. `Drop` is the safety net: it sets the shutdown flag, wakes every
//! idle worker and blocks until the pool has exited.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::{chunk_key, ChunkCache};
use crate::channel::{Channel, Registry};
use crate::engine::{Chunk, EngineFactory, ScriptEngine, Syscall};
use crate::list::ProcList;
use crate::process::{move_values, Process, TransferFault};
use crate::sched::{self, Sched};
use crate::types::{
    PeerRole, RuntimeError, RuntimeSettings, Status, TransferSide, Value, ValueStack,
};

// ── Recycle pool ──────────────────────────────────────────────────────────────

pub(crate) struct RecyclePool {
    pub max: usize,
    pub idle: ProcList,
}

// ── Core ──────────────────────────────────────────────────────────────────────

/// Shared state behind a [`Runtime`]; every worker holds an `Arc` to it.
pub(crate) struct RuntimeCore {
    pub(crate) settings: RuntimeSettings,
    pub(crate) registry: Registry,
    pub(crate) sched: Sched,
    recycle: Mutex<RecyclePool>,
    chunks: ChunkCache,
    factory: Box<dyn EngineFactory>,
    /// The host participant descriptor.
    host: Arc<Process>,
    /// Serializes host send/receive: the host is one participant.
    host_op: Mutex<()>,
}

/// What the worker should do after a syscall was serviced.
pub(crate) enum Serviced {
    /// The operation completed; resume the engine with the top `n` stack
    /// slots as its results.
    Reply(usize),
    /// The process chose to block: the caller appends the descriptor to the
    /// wait queue selected by its status, then releases the channel.
    Park(Arc<Channel>),
    /// Voluntary yield: re-enqueue at the ready-queue tail.
    Pass,
}

impl RuntimeCore {
    fn recycle_pool(&self) -> MutexGuard<'_, RecyclePool> {
        self.recycle.lock().expect("recycle pool poisoned")
    }

    // ── Spawning ─────────────────────────────────────────────────────────────

    /// Create (or recycle) a process, load `chunk` into it, and schedule it.
    fn spawn(&self, chunk: &Chunk) -> Result<(), RuntimeError> {
        let recycled = {
            let mut pool = self.recycle_pool();
            if pool.max > 0 {
                pool.idle.pop()
            } else {
                None
            }
        };
        let lp = match recycled {
            Some(lp) => {
                lp.state().reuse();
                lp
            }
            None => Process::script(self.factory.create()),
        };

        self.load_into(&lp, chunk)?;
        self.sched.inc_active();
        self.sched.queue_ready(lp);
        Ok(())
    }

    /// Load a chunk through the compiled-chunk cache. A cache miss that the
    /// engine can `dump` populates the cache for the next identical spawn.
    fn load_into(&self, lp: &Arc<Process>, chunk: &Chunk) -> Result<(), RuntimeError> {
        let mut st = lp.state();
        let engine = st.engine.as_mut().expect("script process carries an engine");
        match chunk {
            Chunk::Bytecode(_) => engine.load(chunk)?,
            Chunk::Source(src) => {
                let key = chunk_key(src);
                match self.chunks.get(&key) {
                    Some(bytecode) => engine.load(&Chunk::Bytecode(bytecode))?,
                    None => {
                        engine.load(chunk)?;
                        if let Some(bytecode) = engine.dump() {
                            self.chunks.insert(key, bytecode);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Enqueue one worker-shutdown sentinel.
    fn spawn_sentinel(&self) {
        let lp = Process::sentinel();
        self.sched.inc_active();
        self.sched.queue_ready(lp);
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// A script ran to completion: recycle its interpreter if the pool has
    /// room, destroy it otherwise.
    pub(crate) fn finish(&self, lp: &Arc<Process>, mut engine: Box<dyn ScriptEngine>) {
        lp.state().status = Status::Finished;
        let mut pool = self.recycle_pool();
        if pool.idle.len() >= pool.max {
            drop(pool);
            drop(engine);
        } else {
            engine.reset();
            lp.state().engine = Some(engine);
            pool.idle.push(Arc::clone(lp));
        }
    }

    // ── Worker resizing ──────────────────────────────────────────────────────

    fn resize_workers(core: &Arc<RuntimeCore>, count: usize) -> Result<(), RuntimeError> {
        if count == 0 {
            return Err(RuntimeError::InvalidArgument {
                message: "number of workers must be positive".to_string(),
            });
        }
        let current = core.sched.workers();
        if count > current {
            for _ in current..count {
                sched::spawn_worker(core)?;
            }
        } else {
            for _ in count..current {
                core.spawn_sentinel();
            }
        }
        Ok(())
    }

    fn set_recycle_max(&self, max: usize) {
        let mut pool = self.recycle_pool();
        pool.max = max;
        // Excess idle descriptors are destroyed, interpreters included.
        while pool.idle.len() > max {
            pool.idle.pop();
        }
    }

    // ── Channel destruction ──────────────────────────────────────────────────

    fn destroy_channel(&self, name: &str) -> Result<(), RuntimeError> {
        let chan = self
            .registry
            .remove_locked(name)
            .ok_or_else(|| RuntimeError::ChannelNotFound { name: name.to_string() })?;

        // Every parked party resumes with the typed error; at most one of
        // the two queues is non-empty. The channel-state lock is released
        // before each wake-up.
        loop {
            let parked = chan.state().send.pop();
            match parked {
                Some(lp) => self.cancel_parked(lp, chan.name(), PeerRole::Receiver),
                None => break,
            }
        }
        loop {
            let parked = chan.state().recv.pop();
            match parked {
                Some(lp) => self.cancel_parked(lp, chan.name(), PeerRole::Sender),
                None => break,
            }
        }

        {
            let mut cst = chan.state();
            debug_assert!(cst.send.is_empty() && cst.recv.is_empty());
            cst.in_use = false;
        }
        Ok(())
    }

    /// Unblock one process parked on a channel being destroyed.
    fn cancel_parked(&self, lp: Arc<Process>, name: &str, waiting_for: PeerRole) {
        let err = RuntimeError::ChannelDestroyed { name: name.to_string(), waiting_for };
        let message = err.to_string();
        let mut st = lp.state();
        st.chan = None;
        let stack = st.stack_mut();
        stack.clear();
        stack.push_error_pair(&message);
        st.args = 2;
        if st.host {
            st.fault = Some(err);
            st.delivered = true;
            drop(st);
            lp.resumed.notify_one();
        } else {
            drop(st);
            self.sched.queue_ready(lp);
        }
    }

    // ── Rendezvous core ──────────────────────────────────────────────────────

    /// Transfer from `from` into a parked receiver's stack, then wake it
    /// (scheduler enqueue, or host signal). The receiver's argument count is
    /// the number of stack slots above the channel name: the transferred
    /// values, or the error pair.
    fn deliver_to_receiver(
        &self,
        dst: &Arc<Process>,
        from: &mut ValueStack,
    ) -> Result<usize, TransferFault> {
        let mut dst_st = dst.state();
        let result = move_values(from, dst_st.stack_mut());
        let delivered = dst_st.stack_mut().len().saturating_sub(1);
        dst_st.args = delivered;
        dst_st.chan = None;
        if dst_st.host {
            if let Err(fault) = result {
                dst_st.fault = Some(fault.into_error(TransferSide::Receive));
            }
            dst_st.delivered = true;
            drop(dst_st);
            dst.resumed.notify_one();
        } else {
            drop(dst_st);
            self.sched.queue_ready(Arc::clone(dst));
        }
        result
    }

    /// Transfer from a parked sender's stack into `to`, leave the sender its
    /// reply (`true`, or the error pair), then wake it.
    fn collect_from_sender(
        &self,
        src: &Arc<Process>,
        to: &mut ValueStack,
    ) -> Result<usize, TransferFault> {
        let mut src_st = src.state();
        let result = move_values(src_st.stack_mut(), to);
        match result {
            Ok(_) => {
                src_st.stack_mut().push(Value::Bool(true));
                src_st.args = 1;
            }
            Err(fault) => {
                src_st.args = 2;
                if src_st.host {
                    src_st.fault = Some(fault.into_error(TransferSide::Send));
                }
            }
        }
        src_st.chan = None;
        if src_st.host {
            src_st.delivered = true;
            drop(src_st);
            src.resumed.notify_one();
        } else {
            drop(src_st);
            self.sched.queue_ready(Arc::clone(src));
        }
        result
    }

    // ── Syscall servicing (script-side operations) ───────────────────────────

    /// Service a suspended script's request on behalf of its worker.
    pub(crate) fn service(
        core: &Arc<RuntimeCore>,
        lp: &Arc<Process>,
        engine: &mut dyn ScriptEngine,
        request: Syscall,
    ) -> Serviced {
        match request {
            Syscall::Pass => Serviced::Pass,

            Syscall::Send { channel } => {
                let Some(chan) = core.registry.locked_get(&channel) else {
                    return Self::reply_err(
                        engine,
                        &RuntimeError::ChannelNotFound { name: channel },
                    );
                };
                let waiting = { chan.state().recv.pop() };
                match waiting {
                    Some(dst) => {
                        let result = core.deliver_to_receiver(&dst, engine.stack());
                        core.registry.unlock(&chan);
                        match result {
                            Ok(_) => {
                                engine.stack().push(Value::Bool(true));
                                Serviced::Reply(1)
                            }
                            // The error pair is already on the sender's stack.
                            Err(_) => Serviced::Reply(2),
                        }
                    }
                    None => {
                        let mut st = lp.state();
                        st.status = Status::BlockedSend;
                        st.chan = Some(Arc::clone(&chan));
                        drop(st);
                        Serviced::Park(chan)
                    }
                }
            }

            Syscall::Receive { channel, nowait } => {
                let Some(chan) = core.registry.locked_get(&channel) else {
                    return Self::reply_err(
                        engine,
                        &RuntimeError::ChannelNotFound { name: channel },
                    );
                };
                let waiting = { chan.state().send.pop() };
                match waiting {
                    Some(src) => {
                        let result = core.collect_from_sender(&src, engine.stack());
                        core.registry.unlock(&chan);
                        match result {
                            Ok(n) => Serviced::Reply(n),
                            Err(_) => Serviced::Reply(2),
                        }
                    }
                    None if nowait => {
                        core.registry.unlock(&chan);
                        Self::reply_err(engine, &RuntimeError::NoSenders { name: channel })
                    }
                    None => {
                        let mut st = lp.state();
                        st.status = Status::BlockedRecv;
                        st.chan = Some(Arc::clone(&chan));
                        drop(st);
                        Serviced::Park(chan)
                    }
                }
            }

            Syscall::NewProcess { chunk } => {
                Self::reply_unit(engine, core.spawn(&chunk))
            }
            Syscall::NewChannel { name } => {
                Self::reply_unit(engine, core.registry.create(&name))
            }
            Syscall::DelChannel { name } => {
                Self::reply_unit(engine, core.destroy_channel(&name))
            }
            Syscall::SetWorkers { count } => {
                Self::reply_unit(engine, Self::resize_workers(core, count))
            }
            Syscall::GetWorkers => {
                engine.stack().push(Value::Number(core.sched.workers() as f64));
                Serviced::Reply(1)
            }
            Syscall::SetRecycleMax { max } => {
                core.set_recycle_max(max);
                engine.stack().push(Value::Bool(true));
                Serviced::Reply(1)
            }
        }
    }

    fn reply_err(engine: &mut dyn ScriptEngine, err: &RuntimeError) -> Serviced {
        engine.stack().push_error_pair(&err.to_string());
        Serviced::Reply(2)
    }

    fn reply_unit(engine: &mut dyn ScriptEngine, result: Result<(), RuntimeError>) -> Serviced {
        match result {
            Ok(()) => {
                engine.stack().push(Value::Bool(true));
                Serviced::Reply(1)
            }
            Err(err) => Self::reply_err(engine, &err),
        }
    }

    // ── Host-side rendezvous ─────────────────────────────────────────────────

    fn host_send(&self, name: &str, values: Vec<Value>) -> Result<(), RuntimeError> {
        let _op = self.host_op.lock().expect("host op lock poisoned");

        let mut hstack = ValueStack::new(self.settings.stack_slots);
        hstack.push(Value::str(name));
        for v in values {
            hstack.push(v);
        }

        let chan = self
            .registry
            .locked_get(name)
            .ok_or_else(|| RuntimeError::ChannelNotFound { name: name.to_string() })?;

        let waiting = { chan.state().recv.pop() };
        match waiting {
            Some(dst) => {
                let result = self.deliver_to_receiver(&dst, &mut hstack);
                self.registry.unlock(&chan);
                result
                    .map(|_| ())
                    .map_err(|fault| fault.into_error(TransferSide::Send))
            }
            None => {
                // Park the host descriptor, then block on its dedicated
                // condition until the matching receiver signals.
                {
                    let mut st = self.host.state();
                    st.status = Status::BlockedSend;
                    st.chan = Some(Arc::clone(&chan));
                    st.delivered = false;
                    st.fault = None;
                    st.stack = hstack;
                }
                chan.state().send.push(Arc::clone(&self.host));
                self.registry.unlock(&chan);

                let mut st = self.host.state();
                while !st.delivered {
                    st = self.host.resumed.wait(st).expect("host state poisoned");
                }
                st.status = Status::Idle;
                st.delivered = false;
                st.args = 0;
                match st.fault.take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }

    fn host_receive(&self, name: &str, nowait: bool) -> Result<Vec<Value>, RuntimeError> {
        let _op = self.host_op.lock().expect("host op lock poisoned");

        let mut hstack = ValueStack::new(self.settings.stack_slots);
        hstack.push(Value::str(name));

        let chan = self
            .registry
            .locked_get(name)
            .ok_or_else(|| RuntimeError::ChannelNotFound { name: name.to_string() })?;

        let waiting = { chan.state().send.pop() };
        match waiting {
            Some(src) => {
                let result = self.collect_from_sender(&src, &mut hstack);
                self.registry.unlock(&chan);
                match result {
                    Ok(n) => Ok(hstack.take_top(n)),
                    Err(fault) => Err(fault.into_error(TransferSide::Receive)),
                }
            }
            None if nowait => {
                self.registry.unlock(&chan);
                Err(RuntimeError::NoSenders { name: name.to_string() })
            }
            None => {
                {
                    let mut st = self.host.state();
                    st.status = Status::BlockedRecv;
                    st.chan = Some(Arc::clone(&chan));
                    st.delivered = false;
                    st.fault = None;
                    st.stack = hstack;
                }
                chan.state().recv.push(Arc::clone(&self.host));
                self.registry.unlock(&chan);

                let mut st = self.host.state();
                while !st.delivered {
                    st = self.host.resumed.wait(st).expect("host state poisoned");
                }
                st.status = Status::Idle;
                st.delivered = false;
                let args = st.args;
                st.args = 0;
                let fault = st.fault.take();
                let values = st.stack.take_top(args);
                match fault {
                    Some(err) => Err(err),
                    None => Ok(values),
                }
            }
        }
    }
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// A complete, self-contained runtime instance.
pub struct Runtime {
    core: Arc<RuntimeCore>,
}

impl Runtime {
    /// Build a runtime and spawn its initial worker pool.
    pub fn new(
        settings: RuntimeSettings,
        factory: Box<dyn EngineFactory>,
    ) -> Result<Runtime, RuntimeError> {
        let chunk_cache_size = settings.chunk_cache_size;
        let stack_slots = settings.stack_slots;
        let recycle_max = settings.recycle_max;
        let workers = settings.workers;

        let core = Arc::new(RuntimeCore {
            settings,
            registry: Registry::new(),
            sched: Sched::new(),
            recycle: Mutex::new(RecyclePool { max: recycle_max, idle: ProcList::new() }),
            chunks: ChunkCache::new(chunk_cache_size),
            factory,
            host: Process::host(stack_slots),
            host_op: Mutex::new(()),
        });

        for _ in 0..workers {
            if let Err(err) = sched::spawn_worker(&core) {
                core.sched.shutdown();
                core.sched.wait_workers_gone();
                return Err(err);
            }
        }
        Ok(Runtime { core })
    }

    /// Shorthand: default settings.
    pub fn with_factory(factory: Box<dyn EngineFactory>) -> Result<Runtime, RuntimeError> {
        Runtime::new(RuntimeSettings::default(), factory)
    }

    /// Load a chunk into a fresh (or recycled) interpreter and schedule it.
    pub fn new_process(&self, chunk: Chunk) -> Result<(), RuntimeError> {
        self.core.spawn(&chunk)
    }

    /// Block until every process has finished, then release the idle
    /// workers.
    pub fn wait(&self) {
        self.core.sched.wait_quiescent();
    }

    /// Send `values` on the named channel as the host participant. Blocks
    /// until a receiver takes them.
    pub fn send(&self, channel: &str, values: Vec<Value>) -> Result<(), RuntimeError> {
        self.core.host_send(channel, values)
    }

    /// Receive from the named channel as the host participant, blocking
    /// until a sender arrives.
    pub fn receive(&self, channel: &str) -> Result<Vec<Value>, RuntimeError> {
        self.core.host_receive(channel, false)
    }

    /// Non-blocking receive: `Err(NoSenders)` if no sender is parked.
    pub fn try_receive(&self, channel: &str) -> Result<Vec<Value>, RuntimeError> {
        self.core.host_receive(channel, true)
    }

    /// Register a new channel.
    pub fn new_channel(&self, name: &str) -> Result<(), RuntimeError> {
        self.core.registry.create(name)
    }

    /// Destroy a channel, resuming everything parked on it with a typed
    /// error.
    pub fn del_channel(&self, name: &str) -> Result<(), RuntimeError> {
        self.core.destroy_channel(name)
    }

    /// Resize the worker pool: grow by spawning, shrink by sentinel.
    pub fn set_workers(&self, count: usize) -> Result<(), RuntimeError> {
        RuntimeCore::resize_workers(&self.core, count)
    }

    /// Live worker-thread count.
    pub fn workers(&self) -> usize {
        self.core.sched.workers()
    }

    /// Bound the idle-interpreter pool, destroying any excess immediately.
    pub fn set_recycle_max(&self, max: usize) {
        self.core.set_recycle_max(max);
    }

    /// Idle interpreters currently held for reuse.
    pub fn idle_interpreters(&self) -> usize {
        self.core.recycle_pool().idle.len()
    }

    /// Compiled chunks currently cached.
    pub fn cached_chunks(&self) -> usize {
        self.core.chunks.len()
    }

    /// Diagnostic peek at a channel's wait-queue depths
    /// `(senders, receivers)`, via the unlocked lookup path. The snapshot may
    /// be stale by the time it returns.
    pub fn channel_depths(&self, name: &str) -> Option<(usize, usize)> {
        let chan = self.core.registry.unlocked_get(name)?;
        let st = chan.state();
        Some((st.send.len(), st.recv.len()))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.core.sched.shutdown();
        self.core.sched.wait_workers_gone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpEngineFactory;

    fn runtime(workers: usize) -> Runtime {
        let settings = RuntimeSettings { workers, ..RuntimeSettings::default() };
        Runtime::new(settings, Box::new(OpEngineFactory::new())).expect("runtime")
    }

    #[test]
    fn test_spawn_trivial_process_and_wait() {
        let rt = runtime(2);
        rt.new_process(Chunk::source("yield")).expect("spawn");
        rt.wait();
    }

    #[test]
    fn test_new_process_load_error_is_raised() {
        let rt = runtime(1);
        let err = rt.new_process(Chunk::source("frobnicate")).unwrap_err();
        assert!(matches!(err, RuntimeError::Load { .. }), "got {err:?}");
        // Nothing was scheduled, so wait returns immediately.
        rt.wait();
    }

    #[test]
    fn test_host_rendezvous_with_script_receiver() {
        let rt = runtime(2);
        rt.new_channel("c").expect("channel");
        rt.new_channel("done").expect("channel");
        rt.new_process(Chunk::source(
            "recv c\nexpect 41 \"tag\"\nsend done true",
        ))
        .expect("spawn");

        rt.send("c", vec![Value::Number(41.0), Value::str("tag")])
            .expect("host send");
        assert_eq!(rt.receive("done").expect("host receive"), vec![Value::Bool(true)]);
        rt.wait();
    }

    #[test]
    fn test_send_to_missing_channel() {
        let rt = runtime(1);
        assert_eq!(
            rt.send("nope", vec![]),
            Err(RuntimeError::ChannelNotFound { name: "nope".into() })
        );
        assert_eq!(
            rt.try_receive("nope"),
            Err(RuntimeError::ChannelNotFound { name: "nope".into() })
        );
    }

    #[test]
    fn test_try_receive_empty_channel() {
        let rt = runtime(1);
        rt.new_channel("idle").expect("channel");
        assert_eq!(
            rt.try_receive("idle"),
            Err(RuntimeError::NoSenders { name: "idle".into() })
        );
    }

    #[test]
    fn test_chunk_cache_fills_on_repeat_spawn() {
        let rt = runtime(2);
        for _ in 0..10 {
            rt.new_process(Chunk::source("yield")).expect("spawn");
        }
        assert_eq!(rt.cached_chunks(), 1, "identical sources share one entry");
        rt.wait();
    }

    #[test]
    fn test_channel_depths_diagnostic() {
        let rt = runtime(1);
        rt.new_channel("d").expect("channel");
        assert_eq!(rt.channel_depths("d"), Some((0, 0)));
        assert_eq!(rt.channel_depths("absent"), None);
    }
}
