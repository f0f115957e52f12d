//! Lifecycle manager over every guest thread's `ThreadContext` (spec §4.8,
//! C8).
//!
//! Grounded on `src/hypervisor/manager.rs::VmManager` (a `creation_lock`-
//! guarded registry, builder-style construction, `pause_vm`/stats
//! bookkeeping broadcast across every managed entry) — translated from
//! "VMs" to "guest threads" while keeping the registry/lock/broadcast
//! shape and the idle-wait condition variable pattern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{info, warn};

use crate::config::CoreConfig;
use crate::interfaces::HostThreadOps;
use crate::jit::{CpuBackend, IRCaptureCache};
use crate::runtime::thread_context::{SignalReason, ThreadContext};
use crate::types::GuestPC;

/// Default bound for `wait_for_idle_with_timeout` (spec §5: "1.5s as the
/// default bound").
pub const IDLE_WAIT_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Tracks how many threads are currently `Running` ∪ `InSignal` (spec §8
/// P5). Reaches zero iff every thread is `Waiting`, `Paused`, or
/// `Terminated`.
#[derive(Default)]
struct IdleWaitRefCount {
    count: AtomicI64,
    cv: Condvar,
    mutex: Mutex<()>,
}

impl IdleWaitRefCount {
    fn enter_running(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn leave_running(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.mutex.lock().unwrap();
            self.cv.notify_all();
        }
    }

    fn get(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    fn wait_for_zero(&self, timeout: Duration) -> bool {
        let guard = self.mutex.lock().unwrap();
        if self.get() == 0 {
            return true;
        }
        let (_guard, result) = self
            .cv
            .wait_timeout_while(guard, timeout, |_| self.get() != 0)
            .unwrap();
        !result.timed_out()
    }
}

/// Owns every `ThreadContext` for one `Context` (spec §4.8). `create_lock`
/// serializes thread creation so `Tid` allocation never races, matching the
/// teacher's `creation_lock: Mutex<()>` guarding `VmManager`'s registry
/// inserts.
pub struct ThreadManager {
    create_lock: Mutex<()>,
    threads: Mutex<HashMap<u64, Arc<ThreadContext>>>,
    idle_wait: IdleWaitRefCount,
    next_tid: AtomicI64,
    config: CoreConfig,
    capture_cache: Arc<IRCaptureCache>,
    host_ops: Arc<dyn HostThreadOps>,
}

impl ThreadManager {
    pub fn new(config: CoreConfig, host_ops: Arc<dyn HostThreadOps>) -> Self {
        ThreadManager {
            create_lock: Mutex::new(()),
            threads: Mutex::new(HashMap::new()),
            idle_wait: IdleWaitRefCount::default(),
            next_tid: AtomicI64::new(1),
            config,
            capture_cache: Arc::new(IRCaptureCache::new(None)),
            host_ops,
        }
    }

    /// Spec §4.8 `create_thread`: allocates and registers a new
    /// `ThreadContext`, in `Waiting` state until `initialize_thread` starts
    /// its host thread.
    pub fn create_thread(
        &self,
        initial_pc: GuestPC,
        parent_tid: u64,
        backend: Box<dyn CpuBackend>,
    ) -> Arc<ThreadContext> {
        let _guard = self.create_lock.lock().unwrap();
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst) as u64;
        let pid = tid;
        let ctx = ThreadContext::new(pid, tid, parent_tid, &self.config, backend, Arc::clone(&self.capture_cache));
        ctx.set_guest_pc(initial_pc);
        self.threads.lock().unwrap().insert(tid, Arc::clone(&ctx));
        info!("[ThreadManager] created thread tid={tid} parent_tid={parent_tid}");
        ctx
    }

    /// Spawns the host OS thread backing `ctx`. It blocks inside `body`
    /// until `run()` is called (spec §4.8 "it will block until
    /// `start_running` is signalled").
    pub fn initialize_thread(&self, ctx: Arc<ThreadContext>, body: impl FnOnce(Arc<ThreadContext>) + Send + 'static) {
        let handle = self.host_ops.create(Box::new(move || {
            ctx.pause_gate.park();
            body(ctx);
        }));
        let _ = handle;
    }

    /// Broadcasts `start_running` to every managed thread (spec §4.8
    /// `run`).
    pub fn run(&self) {
        let threads = self.threads.lock().unwrap();
        for ctx in threads.values() {
            self.idle_wait.enter_running();
            ctx.pause_gate.resume();
        }
    }

    /// Spec §4.8 `pause`: requests `Pause` on every thread and blocks until
    /// `IdleWaitRefCount` reaches zero or `IDLE_WAIT_TIMEOUT` elapses, at
    /// which point it re-issues the request (spec §5 "on timeout it
    /// re-issues the pause signal and waits again without a deadline").
    pub fn pause(&self) {
        self.broadcast(SignalReason::Pause);
        while !self.wait_for_idle_with_timeout(IDLE_WAIT_TIMEOUT) {
            warn!("[ThreadManager] pause timed out after {IDLE_WAIT_TIMEOUT:?}, re-notifying");
            self.broadcast(SignalReason::Pause);
        }
    }

    /// Spec §4.8 `step`: resumes exactly one suspended block's worth of
    /// execution on `tid`, then lets the dispatcher re-request `Pause` on
    /// its own once that block completes (spec.md line 322: "coroutine-like
    /// pause/step/stop... modelled as a per-thread event + atomic-tag state
    /// machine"). Returns `false` if `tid` isn't registered.
    pub fn step(&self, tid: u64) -> bool {
        let threads = self.threads.lock().unwrap();
        let Some(ctx) = threads.get(&tid) else {
            return false;
        };
        ctx.single_step.store(true, Ordering::SeqCst);
        self.idle_wait.enter_running();
        ctx.pause_gate.resume();
        true
    }

    /// Spec §4.8 `stop`.
    pub fn stop(&self) {
        self.broadcast(SignalReason::Stop);
        let threads = self.threads.lock().unwrap();
        for ctx in threads.values() {
            ctx.pause_gate.resume();
        }
    }

    fn broadcast(&self, reason: SignalReason) {
        let threads = self.threads.lock().unwrap();
        for ctx in threads.values() {
            ctx.signal_reason.request(reason);
        }
    }

    /// Spec §4.8 `wait_for_idle_with_timeout`: bounded wait on
    /// `IdleWaitRefCount`.
    pub fn wait_for_idle_with_timeout(&self, timeout: Duration) -> bool {
        self.idle_wait.wait_for_zero(timeout)
    }

    pub fn idle_wait_refcount(&self) -> i64 {
        self.idle_wait.get()
    }

    pub fn mark_running_entered(&self) {
        self.idle_wait.enter_running();
    }

    pub fn mark_running_left(&self) {
        self.idle_wait.leave_running();
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    /// Spec §4.8 `cleanup_after_fork`: drops every `ThreadContext` except
    /// `live_tid` without signalling them, resets `IdleWaitRefCount`.
    pub fn cleanup_after_fork(&self, live_tid: u64) {
        self.host_ops.cleanup_after_fork();
        let mut threads = self.threads.lock().unwrap();
        threads.retain(|&tid, _| tid == live_tid);
        self.idle_wait.count.store(if threads.is_empty() { 0 } else { 1 }, Ordering::SeqCst);
        info!("[ThreadManager] cleanup_after_fork: retained tid={live_tid}, {} thread(s) left", threads.len());
    }
}
