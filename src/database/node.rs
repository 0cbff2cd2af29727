//! Per-file shared database node: the lock-state machine governing
//! concurrent access to one underlying database file.
//!
//! One [`DatabaseNode`] exists per underlying database file path, shared by
//! every [`super::handle::DatabaseHandle`] that has that path open. All
//! state here is guarded by a single `parking_lot::Mutex`, with three
//! condition variables signaling read, read-write, and transaction
//! availability.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub type BusyHandlerFn = Box<dyn Fn() + Send + Sync>;
pub type ProgressHandlerFn = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct Counters {
    read_count: u32,
    pending_read_count: u32,
    rw_count: u32,
    pending_rw_count: u32,
    rw_holder: Option<ThreadId>,
    tx_count: u32,
    pending_tx_count: u32,
}

/// Process-wide shared state for one database file.
pub struct DatabaseNode {
    pub path: PathBuf,
    pub open_count: AtomicU64,
    counters: Mutex<Counters>,
    read_trigger: Condvar,
    rw_trigger: Condvar,
    tx_trigger: Condvar,
    pub last_checkpoint: Mutex<Instant>,
    busy_handlers: Mutex<Vec<BusyHandlerFn>>,
    progress_handlers: Mutex<Vec<ProgressHandlerFn>>,
}

/// What kind of lock a caller is asking for or releasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    None,
    Read,
    ReadWrite,
}

impl DatabaseNode {
    pub fn new(path: PathBuf) -> Self {
        DatabaseNode {
            path,
            open_count: AtomicU64::new(0),
            counters: Mutex::new(Counters::default()),
            read_trigger: Condvar::new(),
            rw_trigger: Condvar::new(),
            tx_trigger: Condvar::new(),
            last_checkpoint: Mutex::new(Instant::now()),
            busy_handlers: Mutex::new(Vec::new()),
            progress_handlers: Mutex::new(Vec::new()),
        }
    }

    /// Acquire a read lock. Blocks while another thread holds the
    /// read-write lock, unless the calling thread itself is the rw-holder
    /// (owner-reentrancy).
    pub fn lock_read(&self, timeout: Option<Duration>) -> bool {
        let me = std::thread::current().id();
        let mut c = self.counters.lock();
        let deadline = timeout.map(|d| Instant::now() + d);

        while c.rw_count > 0 && c.rw_holder != Some(me) {
            c.pending_read_count += 1;
            let timed_out = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        true
                    } else {
                        self.read_trigger.wait_for(&mut c, d - now).timed_out()
                    }
                }
                None => {
                    self.read_trigger.wait(&mut c);
                    false
                }
            };
            c.pending_read_count -= 1;
            if timed_out && c.rw_count > 0 && c.rw_holder != Some(me) {
                return false;
            }
        }

        c.read_count += 1;
        true
    }

    pub fn unlock_read(&self) {
        let mut c = self.counters.lock();
        debug_assert!(c.read_count > 0, "unlock_read without matching lock_read");
        c.read_count -= 1;

        if c.tx_count == 0 && c.pending_read_count > 0 {
            self.read_trigger.notify_all();
        } else if c.pending_rw_count > 0 {
            self.rw_trigger.notify_all();
        }
    }

    /// Acquire the read-write lock. Re-entrant for the thread that already
    /// holds it.
    pub fn lock_rw(&self, timeout: Option<Duration>) -> bool {
        let me = std::thread::current().id();
        let mut c = self.counters.lock();
        let deadline = timeout.map(|d| Instant::now() + d);

        while c.rw_count > 0 && c.rw_holder != Some(me) {
            c.pending_rw_count += 1;
            let timed_out = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        true
                    } else {
                        self.rw_trigger.wait_for(&mut c, d - now).timed_out()
                    }
                }
                None => {
                    self.rw_trigger.wait(&mut c);
                    false
                }
            };
            c.pending_rw_count -= 1;
            if timed_out && c.rw_count > 0 && c.rw_holder != Some(me) {
                return false;
            }
        }

        if c.rw_count == 0 {
            c.rw_holder = Some(me);
        }
        c.rw_count += 1;
        true
    }

    pub fn unlock_rw(&self) {
        let mut c = self.counters.lock();
        debug_assert!(c.rw_count > 0, "unlock_rw without matching lock_rw");
        c.rw_count -= 1;

        if c.rw_count == 0 {
            c.rw_holder = None;
            // Outside a transaction, prefer unblocking readers; inside one
            // (tx_count > 0, i.e. a nested begin/end around the same rw
            // span) prefer completing the pending rw waiter instead.
            if c.tx_count == 0 {
                if c.pending_read_count > 0 {
                    self.read_trigger.notify_all();
                } else if c.pending_rw_count > 0 {
                    self.rw_trigger.notify_one();
                }
            } else if c.pending_rw_count > 0 {
                self.rw_trigger.notify_one();
            } else if c.pending_read_count > 0 {
                self.read_trigger.notify_all();
            }
        }
    }

    /// Begin a transaction: acquires the rw-lock for its duration after a
    /// brief drain phase letting in-flight readers finish. At most one
    /// transaction is observable by any non-owner thread at a time.
    pub fn begin_transaction(&self, timeout: Option<Duration>) -> bool {
        const DRAIN: Duration = Duration::from_millis(250);

        if !self.lock_rw(timeout) {
            return false;
        }

        let me = std::thread::current().id();
        let mut c = self.counters.lock();
        while c.read_count > 0 {
            c.pending_tx_count += 1;
            let timed_out = self.tx_trigger.wait_for(&mut c, DRAIN).timed_out();
            c.pending_tx_count -= 1;
            if timed_out {
                break;
            }
        }
        c.tx_count = 1;
        debug_assert_eq!(c.rw_holder, Some(me));
        true
    }

    pub fn end_transaction(&self) {
        {
            let mut c = self.counters.lock();
            c.tx_count = 0;
            self.tx_trigger.notify_all();
        }
        self.unlock_rw();
    }

    pub fn is_transaction_active(&self) -> bool {
        self.counters.lock().tx_count > 0
    }

    pub fn add_busy_handler(&self, f: BusyHandlerFn) {
        self.busy_handlers.lock().push(f);
    }

    pub fn run_busy_handlers(&self) {
        for f in self.busy_handlers.lock().iter() {
            f();
        }
    }

    pub fn add_progress_handler(&self, f: ProgressHandlerFn) {
        self.progress_handlers.lock().push(f);
    }

    /// Runs every registered progress handler; returns `true` (meaning
    /// "interrupt") as soon as any one of them does.
    pub fn run_progress_handlers(&self) -> bool {
        for f in self.progress_handlers.lock().iter() {
            if f() {
                return true;
            }
        }
        false
    }

    /// Whether any lock is currently pending on this node (diagnostic use).
    pub fn is_lock_pending(&self, lock_type: LockType) -> bool {
        let c = self.counters.lock();
        match lock_type {
            LockType::None => false,
            LockType::Read => c.pending_read_count > 0,
            LockType::ReadWrite => c.pending_rw_count > 0,
        }
    }
}

/// Process-wide registry mapping database file paths to their shared node.
#[derive(Default)]
pub struct DatabaseRegistry {
    nodes: Mutex<HashMap<PathBuf, std::sync::Arc<DatabaseNode>>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        DatabaseRegistry {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared node for `path`, creating it if this is the first
    /// open. Every handle opening the same path shares the same node.
    pub fn acquire(&self, path: &std::path::Path) -> std::sync::Arc<DatabaseNode> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .entry(path.to_path_buf())
            .or_insert_with(|| std::sync::Arc::new(DatabaseNode::new(path.to_path_buf())))
            .clone();
        node.open_count.fetch_add(1, Ordering::SeqCst);
        node
    }

    /// Drops a reference; removes the node from the registry once the last
    /// handle closes.
    pub fn release(&self, path: &std::path::Path) {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get(path) {
            if node.open_count.fetch_sub(1, Ordering::SeqCst) == 1 {
                nodes.remove(path);
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }
}

lazy_static::lazy_static! {
    pub static ref REGISTRY: DatabaseRegistry = DatabaseRegistry::new();
}
