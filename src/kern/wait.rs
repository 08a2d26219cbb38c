//! Wait objects and wait lists
//!
//! Every task carries a [`WaitObj`] telling what it is blocked on. Blocking
//! primitives own a [`WaitList`]: a FIFO of wait nodes, each naming one
//! sleeping task. Lists and nodes live in arenas inside the scheduler state
//! and are linked by index, so unlinking a node is O(1) and nothing holds a
//! pointer back into a task.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use super::arena::{Arena, ArenaKey};
use super::mobj::MwoRecord;
use super::preempt::{is_preemption_enabled, PreemptGuard};
use super::sched::{get_curr_tid, try_with_sched, with_sched, SchedState};
use super::task::TaskState;
use crate::types::Tid;

/// No extra reason attached to a wait
pub const NO_EXTRA: u16 = 0;
/// Waiter on a task is being told the task stopped
pub const WEXTRA_TASK_STOPPED: u16 = 1;
/// Waiter on a task is being told the task continued
pub const WEXTRA_TASK_CONTINUED: u16 = 2;

/// Wait list handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListKey(pub(crate) ArenaKey);

/// Wait node handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeKey(pub(crate) ArenaKey);

/// Multi-object waiter handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MwoKey(pub(crate) ArenaKey);

// ============================================================================
// Wait Object
// ============================================================================

/// Kind of thing a task waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitObjType {
    None = 0,
    Mutex = 1,
    Cond = 2,
    Task = 3,
    Sem = 4,
    MultiWaiter = 5,
    MultiElem = 6,
}

/// What a task is blocked on, with the identity of the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitOn {
    #[default]
    None,
    Mutex(ListKey),
    Cond(ListKey),
    /// waitpid-style selector (or the tid of a joined thread)
    Task(i32),
    Sem(ListKey),
    MultiWaiter(MwoKey),
    MultiElem(MwoKey, usize),
}

impl WaitOn {
    pub const fn wait_type(&self) -> WaitObjType {
        match self {
            WaitOn::None => WaitObjType::None,
            WaitOn::Mutex(_) => WaitObjType::Mutex,
            WaitOn::Cond(_) => WaitObjType::Cond,
            WaitOn::Task(_) => WaitObjType::Task,
            WaitOn::Sem(_) => WaitObjType::Sem,
            WaitOn::MultiWaiter(_) => WaitObjType::MultiWaiter,
            WaitOn::MultiElem(..) => WaitObjType::MultiElem,
        }
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, WaitOn::None)
    }
}

/// Per-task wait descriptor
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitObj {
    pub(crate) on: WaitOn,
    pub(crate) extra: u16,
    pub(crate) node: Option<NodeKey>,
}

impl WaitObj {
    pub fn on(&self) -> WaitOn {
        self.on
    }

    pub fn extra(&self) -> u16 {
        self.extra
    }
}

// ============================================================================
// Wait Results
// ============================================================================

/// Outcome of a blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitResult {
    /// The awaited condition became true
    Normal = 0,
    /// The wake-up timer expired first
    TimedOut = 1,
    /// A pending signal cut the wait short
    Interrupted = 2,
}

impl WaitResult {
    /// Value returned to user space: 0, -ETIME or -EINTR
    pub const fn errno(self) -> i32 {
        match self {
            WaitResult::Normal => 0,
            WaitResult::TimedOut => -crate::error::errno::ETIME,
            WaitResult::Interrupted => -crate::error::errno::EINTR,
        }
    }
}

// ============================================================================
// Wait Lists
// ============================================================================

#[derive(Debug)]
pub(crate) struct WaitNode {
    pub(crate) task: Tid,
    pub(crate) extra: u16,
    pub(crate) list: ListKey,
    /// Set when the node belongs to a multi-object waiter slot
    pub(crate) elem: Option<(MwoKey, usize)>,
    prev: Option<NodeKey>,
    next: Option<NodeKey>,
}

#[derive(Debug, Default)]
struct ListHead {
    head: Option<NodeKey>,
    tail: Option<NodeKey>,
    len: usize,
}

/// Storage for every wait list, wait node and multi-object waiter
pub(crate) struct WaitTables {
    lists: Arena<ListHead>,
    nodes: Arena<WaitNode>,
    pub(crate) mwaiters: Arena<MwoRecord>,
}

impl WaitTables {
    pub(crate) const fn new() -> Self {
        Self {
            lists: Arena::new(),
            nodes: Arena::new(),
            mwaiters: Arena::new(),
        }
    }

    pub(crate) fn new_list(&mut self) -> ListKey {
        ListKey(self.lists.insert(ListHead::default()))
    }

    pub(crate) fn list_exists(&self, list: ListKey) -> bool {
        self.lists.contains(list.0)
    }

    /// Free an empty list. A list that still has waiters is left alone.
    pub(crate) fn free_list(&mut self, list: ListKey) -> bool {
        match self.lists.get(list.0) {
            Some(head) if head.len == 0 => {
                self.lists.remove(list.0);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn push_back(
        &mut self,
        list: ListKey,
        task: Tid,
        extra: u16,
        elem: Option<(MwoKey, usize)>,
    ) -> NodeKey {
        let tail = match self.lists.get(list.0) {
            Some(head) => head.tail,
            None => crate::kpanic!("wait on a destroyed wait list"),
        };
        let node = NodeKey(self.nodes.insert(WaitNode {
            task,
            extra,
            list,
            elem,
            prev: tail,
            next: None,
        }));
        if let Some(tail) = tail.and_then(|t| self.nodes.get_mut(t.0)) {
            tail.next = Some(node);
        }
        if let Some(head) = self.lists.get_mut(list.0) {
            if head.head.is_none() {
                head.head = Some(node);
            }
            head.tail = Some(node);
            head.len += 1;
        }
        node
    }

    /// Remove a node from its list; None if it was already gone
    pub(crate) fn unlink(&mut self, node: NodeKey) -> Option<WaitNode> {
        let removed = self.nodes.remove(node.0)?;
        match removed.prev.and_then(|p| self.nodes.get_mut(p.0)) {
            Some(prev) => prev.next = removed.next,
            None => {
                if let Some(head) = self.lists.get_mut(removed.list.0) {
                    head.head = removed.next;
                }
            }
        }
        match removed.next.and_then(|n| self.nodes.get_mut(n.0)) {
            Some(next) => next.prev = removed.prev,
            None => {
                if let Some(head) = self.lists.get_mut(removed.list.0) {
                    head.tail = removed.prev;
                }
            }
        }
        if let Some(head) = self.lists.get_mut(removed.list.0) {
            head.len -= 1;
        }
        Some(removed)
    }

    pub(crate) fn first(&self, list: ListKey) -> Option<NodeKey> {
        self.lists.get(list.0)?.head
    }

    pub(crate) fn node(&self, node: NodeKey) -> Option<&WaitNode> {
        self.nodes.get(node.0)
    }

    pub(crate) fn len(&self, list: ListKey) -> usize {
        self.lists.get(list.0).map_or(0, |h| h.len)
    }

    /// Waiting tasks, head first
    pub(crate) fn tasks(&self, list: ListKey) -> Vec<Tid> {
        let mut out = Vec::new();
        let mut cur = self.first(list);
        while let Some(key) = cur {
            match self.nodes.get(key.0) {
                Some(node) => {
                    out.push(node.task);
                    cur = node.next;
                }
                None => break,
            }
        }
        out
    }
}

/// Wait list embedded in a blocking primitive
///
/// Allocated on first use so primitives can be built in `const` context;
/// freed when the primitive is dropped.
pub struct WaitList {
    raw: AtomicU64,
}

impl WaitList {
    pub const fn new() -> Self {
        Self {
            raw: AtomicU64::new(0),
        }
    }

    pub(crate) fn key(&self, s: &mut SchedState) -> ListKey {
        if let Some(key) = ArenaKey::from_raw(self.raw.load(Ordering::Acquire)) {
            let key = ListKey(key);
            if s.waits.list_exists(key) {
                return key;
            }
        }
        let key = s.waits.new_list();
        self.raw.store(key.0.to_raw(), Ordering::Release);
        key
    }

    /// Number of queued waiters
    pub fn len(&self) -> usize {
        with_sched(|s| {
            let key = self.key(s);
            s.waits.len(key)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued tasks, head first
    pub fn waiters(&self) -> Vec<Tid> {
        with_sched(|s| {
            let key = self.key(s);
            s.waits.tasks(key)
        })
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.waiters().contains(&tid)
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitList {
    fn drop(&mut self) {
        let Some(key) = ArenaKey::from_raw(*self.raw.get_mut()) else {
            return;
        };
        let key = ListKey(key);
        // Gone already if the scheduler was rebooted since
        let freed = try_with_sched(|s| !s.waits.list_exists(key) || s.waits.free_list(key));
        if freed == Some(false) {
            log::warn!("wait list dropped with waiters still queued");
        }
    }
}

// ============================================================================
// Sleep / Wake
// ============================================================================

impl SchedState {
    /// Record what `tid` waits on and queue it on `list`
    pub(crate) fn wait_obj_set(&mut self, tid: Tid, on: WaitOn, extra: u16, list: Option<ListKey>) {
        crate::kassert!(
            self.task(tid).wobj.on.is_none(),
            "task {} already waits on {:?}",
            tid,
            self.task(tid).wobj.on
        );
        let node = list.map(|l| self.waits.push_back(l, tid, extra, None));
        let wobj = &mut self.task_mut(tid).wobj;
        wobj.on = on;
        wobj.extra = extra;
        wobj.node = node;
    }

    /// Clear the wait object of `tid`, unlinking it from whatever it is
    /// queued on. Returns what it was waiting on.
    pub(crate) fn wait_obj_reset(&mut self, tid: Tid) -> WaitOn {
        let Some(task) = self.tasks.get_mut(&tid) else {
            return WaitOn::None;
        };
        let prev = core::mem::take(&mut task.wobj);
        if let Some(node) = prev.node {
            self.waits.unlink(node);
        }
        if let WaitOn::MultiWaiter(mwo) = prev.on {
            self.retract_multi_obj(mwo);
        }
        prev.on
    }

    /// Mark the intent to sleep: set the wait object and go SLEEPING
    pub(crate) fn prepare_to_wait_on(&mut self, tid: Tid, on: WaitOn, extra: u16, list: Option<ListKey>) {
        crate::kassert!(!is_preemption_enabled());
        self.wait_obj_set(tid, on, extra, list);
        self.task_change_state(tid, TaskState::Sleeping);
    }

    /// Wake `tid`: drop its wait registration(s) and make it runnable.
    /// A no-op for a task that is not sleeping.
    pub(crate) fn wake_up(&mut self, tid: Tid) -> WaitOn {
        let prev = self.wait_obj_reset(tid);
        if self.tasks.get(&tid).map(|t| t.state()) == Some(TaskState::Sleeping) {
            self.task_change_state(tid, TaskState::Runnable);
            log::trace!("wake_up: task {} (was on {:?})", tid, prev.wait_type());
        }
        prev
    }

    /// Wake the task behind a node found on some wait list
    pub(crate) fn wake_up_node(&mut self, node: NodeKey) -> Option<Tid> {
        let removed = self.waits.unlink(node)?;
        if let Some((mwo, index)) = removed.elem {
            self.note_multi_obj_fired(mwo, index);
        }
        self.wake_up(removed.task);
        Some(removed.task)
    }

    /// Wake everyone queued on `list`, head first
    pub(crate) fn wake_up_all(&mut self, list: ListKey) -> usize {
        let mut woken = 0;
        while let Some(node) = self.waits.first(list) {
            self.wake_up_node(node);
            woken += 1;
        }
        woken
    }
}

/// Put the current task on `list` and mark it SLEEPING. The caller then
/// calls [`super::sched::enter_sleep_wait_state`] with the same guard.
pub fn prepare_to_wait_on(on: WaitOn, extra: u16, list: Option<&WaitList>, _guard: &PreemptGuard) {
    let curr = get_curr_tid();
    with_sched(|s| {
        let list = list.map(|l| l.key(s));
        s.prepare_to_wait_on(curr, on, extra, list)
    });
}

/// Wake a task. Returns what it was waiting on (`WaitOn::None` if it was
/// not waiting at all).
pub fn wake_up(tid: Tid) -> WaitOn {
    with_sched(|s| s.wake_up(tid))
}

/// Clear the current task's wait object
pub fn wait_obj_reset() -> WaitOn {
    let curr = get_curr_tid();
    with_sched(|s| s.wait_obj_reset(curr))
}

// ============================================================================
// Waitable objects
// ============================================================================

/// One watched object, as bound to a multi-object waiter slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTarget {
    pub(crate) on: WaitObjType,
    pub(crate) list: ListKey,
    pub(crate) extra: u16,
}

/// Something a task can block on through a multi-object waiter
pub trait Waitable {
    fn wait_target(&self) -> WaitTarget;
}
