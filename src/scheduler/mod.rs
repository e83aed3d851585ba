pub mod context;
pub mod mlfq;
pub mod sync;
pub mod thread;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use context::Context;
use lazy_static::lazy_static;
use mlfq::Fixed;
use spin::Mutex;
use thread::{Thread, ThreadId, ThreadStatus};

/// Ticks per forced reschedule among equal-priority ready threads.
const TIME_SLICE: u32 = 4;
/// Ticks per second, used to gate the MLFQ load-average/recent-cpu refresh.
const TIMER_FREQ: u64 = 100;
const KERNEL_STACK_SIZE: usize = 16 * 1024;

pub struct Scheduler {
    threads: BTreeMap<ThreadId, Thread>,
    ready: VecDeque<ThreadId>,
    sleeping: Vec<(u64, ThreadId)>,
    current: ThreadId,
    idle: ThreadId,
    next_tid: u64,
    ticks: u64,
    mlfqs: bool,
    load_avg: Fixed,
}

impl Scheduler {
    fn new() -> Self {
        Scheduler {
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            sleeping: Vec::new(),
            current: ThreadId(0),
            idle: ThreadId(0),
            next_tid: 1,
            ticks: 0,
            mlfqs: false,
            load_avg: Fixed::zero(),
        }
    }

    fn alloc_tid(&mut self) -> ThreadId {
        let tid = ThreadId(self.next_tid);
        self.next_tid += 1;
        tid
    }

    /// Insert `tid` into the ready queue, keeping it sorted by effective
    /// priority, descending (FIFO among equal priorities, matching the
    /// reference waiter-queue ordering convention).
    fn ready_insert(&mut self, tid: ThreadId) {
        let prio = self.threads.get(&tid).map(|t| t.priority).unwrap_or(mlfq::PRI_MIN);
        let pos = self
            .ready
            .iter()
            .position(|&other| self.threads.get(&other).map(|t| t.priority).unwrap_or(0) < prio)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, tid);
    }

    fn highest_ready_priority(&self) -> Option<i32> {
        self.ready.front().and_then(|tid| self.threads.get(tid)).map(|t| t.priority)
    }
}

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

pub fn init(config: &crate::config::KernelConfig) {
    let mut sched = SCHEDULER.lock();
    sched.mlfqs = config.mlfqs;

    let idle_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let idle_tid = sched.alloc_tid();
    let mut idle = Thread::new_kernel(idle_tid, String::from("idle"), idle_loop as u64, idle_stack);
    idle.priority = mlfq::PRI_MIN;
    idle.base_priority = mlfq::PRI_MIN;
    idle.status = ThreadStatus::Running;
    sched.idle = idle_tid;
    sched.current = idle_tid;
    sched.threads.insert(idle_tid, idle);

    crate::log_info!("Scheduler initialized (mlfqs={})", sched.mlfqs);
}

extern "C" fn idle_loop() -> ! {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

pub fn mlfq_enabled() -> bool {
    SCHEDULER.lock().mlfqs
}

pub fn current_tid() -> ThreadId {
    SCHEDULER.lock().current
}

pub fn effective_priority(tid: ThreadId) -> i32 {
    SCHEDULER.lock().threads.get(&tid).map(|t| t.priority).unwrap_or(mlfq::PRI_MIN)
}

pub fn set_wait_on_lock(tid: ThreadId, lock_addr: Option<usize>) {
    if let Some(t) = SCHEDULER.lock().threads.get_mut(&tid) {
        t.wait_on_lock = lock_addr;
    }
}

/// Donate `from`'s effective priority up the chain starting at `to`,
/// following each holder's own `wait_on_lock` to the next lock's holder,
/// up to `sync::MAX_DONATION_DEPTH` hops.
pub fn donate_priority(from: ThreadId, to: ThreadId, depth: usize) {
    if depth >= sync::MAX_DONATION_DEPTH {
        return;
    }
    let from_prio = effective_priority(from);

    let next_lock = {
        let mut sched = SCHEDULER.lock();
        let raised = match sched.threads.get_mut(&to) {
            Some(t) => {
                if !t.donors.contains(&from) {
                    t.donors.push(from);
                }
                if from_prio > t.priority {
                    t.priority = from_prio;
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if raised {
            sched.threads.get(&to).and_then(|t| t.wait_on_lock)
        } else {
            None
        }
    };

    if let Some(lock_addr) = next_lock {
        let lock = unsafe { &*(lock_addr as *const sync::Lock) };
        if let Some(next_holder) = lock.holder() {
            donate_priority(from, next_holder, depth + 1);
        }
    }
}

/// Remove every donor of `holder` whose `wait_on_lock` equals `lock_addr`,
/// then recompute `holder`'s effective priority as the max of its base
/// priority and its remaining donors.
pub fn revoke_donations_for_lock(holder: ThreadId, lock_addr: usize) {
    let mut sched = SCHEDULER.lock();
    let remaining_donors: Vec<ThreadId> = {
        match sched.threads.get(&holder) {
            Some(t) => t
                .donors
                .iter()
                .copied()
                .filter(|&d| sched.threads.get(&d).and_then(|dt| dt.wait_on_lock) != Some(lock_addr))
                .collect(),
            None => return,
        }
    };
    let mut new_prio = sched.threads.get(&holder).map(|t| t.base_priority).unwrap_or(mlfq::PRI_MIN);
    for &d in &remaining_donors {
        let p = sched.threads.get(&d).map(|t| t.priority).unwrap_or(mlfq::PRI_MIN);
        if p > new_prio {
            new_prio = p;
        }
    }
    if let Some(t) = sched.threads.get_mut(&holder) {
        t.donors = remaining_donors;
        t.priority = new_prio;
    }
}

/// Set a thread's base priority (no-op under MLFQ). Yields immediately if
/// this drops the thread below the highest-ready priority.
pub fn set_priority(tid: ThreadId, new_base: i32) {
    {
        let mut sched = SCHEDULER.lock();
        if sched.mlfqs {
            return;
        }
        let Some(t) = sched.threads.get_mut(&tid) else { return };
        t.base_priority = new_base;
        if t.donors.is_empty() {
            t.priority = new_base;
        } else {
            t.priority = t.priority.max(new_base);
        }
    }
    try_yield_now();
}

/// Create a new kernel thread, ready to run.
pub fn spawn_kernel(name: &str, entry: u64) -> ThreadId {
    let mut sched = SCHEDULER.lock();
    let tid = sched.alloc_tid();
    let stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let thread = Thread::new_kernel(tid, String::from(name), entry, stack);
    sched.threads.insert(tid, thread);
    sched.ready_insert(tid);
    tid
}

/// Insert an already-constructed thread (used by `process::fork`/`exec`,
/// which build the `Thread` with its `UserContext` attached before handing
/// it to the scheduler).
pub fn insert_thread(thread: Thread) -> ThreadId {
    let tid = thread.tid;
    let mut sched = SCHEDULER.lock();
    sched.threads.insert(tid, thread);
    sched.ready_insert(tid);
    tid
}

pub fn with_thread<R>(tid: ThreadId, f: impl FnOnce(&Thread) -> R) -> Option<R> {
    SCHEDULER.lock().threads.get(&tid).map(f)
}

pub fn with_thread_mut<R>(tid: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    SCHEDULER.lock().threads.get_mut(&tid).map(f)
}

pub fn alloc_tid() -> ThreadId {
    SCHEDULER.lock().alloc_tid()
}

/// Voluntarily give up the CPU. The current thread goes back on the ready
/// queue (unless it is the idle thread) and the highest-priority ready
/// thread runs next.
pub fn yield_now() {
    without_reentrancy(|| {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        if current != sched.idle {
            sched.ready_insert(current);
            if let Some(t) = sched.threads.get_mut(&current) {
                t.status = ThreadStatus::Ready;
            }
        }
        schedule_next(&mut sched);
    });
}

/// Like `yield_now` but only switches if a ready thread actually outranks
/// the current one; otherwise a no-op. Used after events that may or may
/// not have changed the priority ordering.
pub fn try_yield_now() {
    without_reentrancy(|| {
        let mut sched = SCHEDULER.lock();
        let current_prio = sched.threads.get(&sched.current).map(|t| t.priority).unwrap_or(i32::MIN);
        if sched.highest_ready_priority().map(|p| p > current_prio).unwrap_or(false) {
            let current = sched.current;
            if current != sched.idle {
                sched.ready_insert(current);
                if let Some(t) = sched.threads.get_mut(&current) {
                    t.status = ThreadStatus::Ready;
                }
            }
            schedule_next(&mut sched);
        }
    });
}

/// Block the current thread (it must already be off the ready queue, e.g.
/// via `Semaphore::down`) and schedule the next ready thread.
pub fn block_current() {
    without_reentrancy(|| {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        if let Some(t) = sched.threads.get_mut(&current) {
            t.status = ThreadStatus::Blocked;
        }
        schedule_next(&mut sched);
    });
}

/// Move a blocked thread back to ready, preempting the running thread if
/// it now outranks it.
pub fn unblock(tid: ThreadId) {
    {
        let mut sched = SCHEDULER.lock();
        match sched.threads.get_mut(&tid) {
            Some(t) => t.status = ThreadStatus::Ready,
            None => return,
        }
        sched.ready_insert(tid);
    }
    try_yield_now();
}

/// Put the current thread to sleep until `wake_tick`.
pub fn sleep_until(wake_tick: u64) {
    without_reentrancy(|| {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        sched.sleeping.push((wake_tick, current));
        if let Some(t) = sched.threads.get_mut(&current) {
            t.status = ThreadStatus::Blocked;
            t.wake_tick = wake_tick;
        }
        schedule_next(&mut sched);
    });
}

/// Pick the next thread to run (ready queue, falling back to idle) and
/// context-switch into it. Must be called with `sched` locked and the
/// current thread already marked non-running.
fn schedule_next(sched: &mut Scheduler) {
    let next = sched.ready.pop_front().unwrap_or(sched.idle);
    let prev = sched.current;
    sched.current = next;

    if let Some(t) = sched.threads.get_mut(&next) {
        t.status = ThreadStatus::Running;
        t.ticks_this_slice = 0;
        t.check_magic();
    }

    if let Some(user) = sched.threads.get(&next).and_then(|t| t.user.as_ref()) {
        user.address_space.activate();
    }

    if prev == next {
        return;
    }

    let prev_dying = sched.threads.get(&prev).map(|t| t.status == ThreadStatus::Dying).unwrap_or(false);

    let next_ctx: *const Context = sched
        .threads
        .get(&next)
        .map(|t| &t.context as *const Context)
        .expect("scheduled thread vanished");

    if prev_dying {
        unsafe {
            context::restore_context(next_ctx);
        }
        return;
    }

    let prev_ctx: *mut Context = match sched.threads.get_mut(&prev) {
        Some(t) => &mut t.context as *mut Context,
        None => core::ptr::null_mut(),
    };

    if prev_ctx.is_null() {
        unsafe {
            context::restore_context(next_ctx);
        }
    } else {
        unsafe {
            context::switch_context(prev_ctx, next_ctx);
        }
    }
}

/// Disable interrupts for the duration of `f`. Every scheduler mutation
/// that touches the ready/sleep lists runs with interrupts off, matching
/// the reference design's "touched only with interrupts disabled" rule.
fn without_reentrancy<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

/// Timer-tick entry point, called from the PIT interrupt handler.
pub fn tick() {
    without_reentrancy(|| {
        let mut sched = SCHEDULER.lock();
        sched.ticks += 1;
        let now = sched.ticks;

        let mut woke = Vec::new();
        sched.sleeping.retain(|&(wake, tid)| {
            if wake <= now {
                woke.push(tid);
                false
            } else {
                true
            }
        });
        for tid in woke {
            if let Some(t) = sched.threads.get_mut(&tid) {
                t.status = ThreadStatus::Ready;
            }
            sched.ready_insert(tid);
        }

        if sched.mlfqs {
            mlfq_tick(&mut sched, now);
        }

        let current = sched.current;
        let mut need_yield = false;
        if current != sched.idle {
            if let Some(t) = sched.threads.get_mut(&current) {
                t.ticks_this_slice += 1;
                if t.ticks_this_slice >= TIME_SLICE {
                    need_yield = true;
                }
            }
        }
        let current_prio = sched.threads.get(&current).map(|t| t.priority).unwrap_or(0);
        let should_switch = need_yield && sched.highest_ready_priority().map(|p| p >= current_prio).unwrap_or(false);

        if should_switch {
            sched.ready_insert(current);
            if let Some(t) = sched.threads.get_mut(&current) {
                t.status = ThreadStatus::Ready;
            }
            schedule_next(&mut sched);
        }
    });
}

fn mlfq_tick(sched: &mut Scheduler, now: u64) {
    let current = sched.current;
    if current != sched.idle {
        if let Some(t) = sched.threads.get_mut(&current) {
            t.recent_cpu = t.recent_cpu.add_int(1);
        }
    }

    if now % TIMER_FREQ == 0 {
        let ready_count = sched.ready.len() + usize::from(current != sched.idle);
        sched.load_avg = mlfq::update_load_avg(sched.load_avg, ready_count);
        let load_avg = sched.load_avg;
        for t in sched.threads.values_mut() {
            t.recent_cpu = mlfq::update_recent_cpu(t.recent_cpu, load_avg, t.nice);
        }
    }

    if now % 4 == 0 {
        for t in sched.threads.values_mut() {
            t.priority = mlfq::compute_priority(t.recent_cpu, t.nice);
        }
        let ready: Vec<ThreadId> = sched.ready.drain(..).collect();
        for tid in ready {
            sched.ready_insert(tid);
        }
    }
}

/// Remove a thread from the scheduler's table entirely. Safe to call once
/// `wait_sema_down` has returned for it: by then the thread has already run
/// `retire_current`, which never returns to it, so its slot can't still be
/// `sched.current` or sitting on the ready queue.
pub fn reap(tid: ThreadId) -> Option<Thread> {
    SCHEDULER.lock().threads.remove(&tid)
}

/// Permanently retire the calling thread: mark it `Dying` and context-switch
/// away. `schedule_next`'s `prev_dying` path never saves its context, so
/// this thread is never scheduled again; the call never returns.
pub fn retire_current() -> ! {
    without_reentrancy(|| {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        if let Some(t) = sched.threads.get_mut(&current) {
            t.status = ThreadStatus::Dying;
        }
        schedule_next(&mut sched);
    });
    unreachable!("a retired thread's context is never restored");
}

/// Block the calling thread until `wait_sema_up(tid)` is called for it.
/// Used by `process::wait` to block on a specific child's exit.
pub fn wait_sema_down(tid: ThreadId) {
    let ptr: *mut sync::Semaphore = {
        let mut sched = SCHEDULER.lock();
        match sched.threads.get_mut(&tid) {
            Some(t) => &mut *t.wait_sema as *mut sync::Semaphore,
            None => return,
        }
    };
    unsafe { (*ptr).down() }
}

/// Post `tid`'s wait semaphore, waking whoever is blocked on it (normally
/// its parent, inside `process::wait`).
pub fn wait_sema_up(tid: ThreadId) {
    let ptr: *mut sync::Semaphore = {
        let mut sched = SCHEDULER.lock();
        match sched.threads.get_mut(&tid) {
            Some(t) => &mut *t.wait_sema as *mut sync::Semaphore,
            None => return,
        }
    };
    unsafe { (*ptr).up() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_insert_keeps_descending_priority_order() {
        let mut sched = Scheduler::new();
        let mk = |tid, prio| {
            let stack = alloc::vec![0u8; 64].into_boxed_slice();
            let mut t = Thread::new_kernel(ThreadId(tid), String::from("t"), 0, stack);
            t.priority = prio;
            t
        };
        sched.threads.insert(ThreadId(1), mk(1, 10));
        sched.threads.insert(ThreadId(2), mk(2, 30));
        sched.threads.insert(ThreadId(3), mk(3, 20));
        sched.ready_insert(ThreadId(1));
        sched.ready_insert(ThreadId(2));
        sched.ready_insert(ThreadId(3));
        let order: Vec<u64> = sched.ready.iter().map(|t| t.0).collect();
        assert_eq!(order, alloc::vec![2, 3, 1]);
    }

    #[test]
    fn ready_insert_is_fifo_among_equal_priority() {
        let mut sched = Scheduler::new();
        let mk = |tid| {
            let stack = alloc::vec![0u8; 64].into_boxed_slice();
            Thread::new_kernel(ThreadId(tid), String::from("t"), 0, stack)
        };
        sched.threads.insert(ThreadId(1), mk(1));
        sched.threads.insert(ThreadId(2), mk(2));
        sched.ready_insert(ThreadId(1));
        sched.ready_insert(ThreadId(2));
        let order: Vec<u64> = sched.ready.iter().map(|t| t.0).collect();
        assert_eq!(order, alloc::vec![1, 2]);
    }
}
