//! The scheduler: one thread, one poll, every task.
//!
//! The scheduler owns the readiness primitive and a registry of tasks. Its
//! loop waits for readiness (bounded by the earliest tick or task deadline),
//! dispatches each ready task through its per-task state machine, expires
//! overdue tasks in deadline order and finally reaps everything that closed
//! during the batch. Errors raised by task code are caught at exactly one
//! place, the dispatch boundary: [`Error::Shutdown`] unwinds the loop and
//! anything else dumps diagnostics and closes the offending task. The loop
//! ends when the last task is gone.

use std::num::Wrapping;
use std::time::Duration;

use log::{debug, error, info};
use mio::unix::EventedFd;
use mio::{Events, Poll, Token};
use nix::unistd;

use crate::error::{Error, Result};
use crate::slots::Slots;
use crate::task::{Interest, LogLevel, Scope, Task, TaskCore, Tick};
use crate::time::MonoTime;

const EVENT_CAPACITY: usize = 1024;
const TICK_INTERVAL_MS: u32 = 1000;

/// Handle of a task inside a scheduler.
///
/// Slots get reused, so the handle carries a generation; a handle kept past
/// its task's death is detected, never misdelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub(crate) idx: usize,
    pub(crate) generation: u64,
}

pub(crate) struct TaskSlot {
    pub(crate) core: TaskCore,
    /// Taken out for the duration of the task's own callback.
    pub(crate) logic: Option<Box<dyn Task>>,
    pub(crate) generation: u64,
}

#[derive(Clone, Copy)]
pub(crate) enum TimeoutKind {
    Read,
    Write,
}

pub struct Scheduler {
    poll: Poll,
    mio_events: Events,
    /// Scratch for the gathered `(token, readiness)` pairs of one batch.
    ready: Vec<(usize, Interest)>,
    pub(crate) tasks: Slots<TaskSlot>,
    generation: Wrapping<u64>,
    /// Tasks marked closed during dispatch, freed at the reap step.
    close_list: Vec<TaskId>,
    /// Head of the intrusive list of armed tasks, sorted by due time.
    timeouts_head: Option<TaskId>,
    timeouts_enabled: bool,
    now: MonoTime,
    current_task: Option<TaskId>,
    tick: Option<Box<dyn Tick>>,
    next_tick: MonoTime,
    shutting_down: bool,
}

impl Scheduler {
    pub fn new() -> Result<Scheduler> {
        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => return Err(Error::from_io(&err, "Poll::new()", file!(), line!())),
        };
        Ok(Scheduler {
            poll,
            mio_events: Events::with_capacity(EVENT_CAPACITY),
            ready: Vec::new(),
            tasks: Slots::new(),
            generation: Wrapping(0),
            close_list: Vec::new(),
            timeouts_head: None,
            timeouts_enabled: true,
            now: MonoTime::now(),
            current_task: None,
            tick: None,
            next_tick: MonoTime::ZERO,
            shutting_down: false,
        })
    }

    /// The time sampled for the current dispatch batch.
    pub fn now(&self) -> MonoTime {
        self.now
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// The task whose callback is currently running, for diagnostics.
    pub fn current_task(&self) -> Option<TaskId> {
        self.current_task
    }

    pub fn task_alive(&self, id: TaskId) -> bool {
        self.tasks.valid(id.idx) && self.tasks[id.idx].generation == id.generation
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Master switch; when off, arming requests are ignored and nothing
    /// expires.
    pub fn enable_timeouts(&mut self, enabled: bool) {
        self.timeouts_enabled = enabled;
    }

    /// Install the periodic tick hook.
    pub fn set_tick(&mut self, tick: Box<dyn Tick>) {
        self.next_tick = MonoTime::now() + MonoTime::from_millis(TICK_INTERVAL_MS);
        self.tick = Some(tick);
    }

    /// One-line diagnostic prefix: the scheduler plus whatever task is
    /// currently running.
    pub fn dump_context(&self) -> String {
        let mut out = String::from("Scheduler ");
        if let Some(id) = self.current_task {
            out.push_str(&self.task_context(id));
        }
        out
    }

    pub(crate) fn task_context(&self, id: TaskId) -> String {
        let slot = &self.tasks[id.idx];
        if let Some(logic) = slot.logic.as_ref() {
            if let Some(context) = logic.dump_context() {
                return context;
            }
        }
        slot.core.context()
    }

    pub(crate) fn task_log(&self, id: TaskId, level: LogLevel) -> bool {
        if !self.tasks.valid(id.idx) {
            return false;
        }
        self.tasks[id.idx].core.log(level)
    }

    /// Add a task. The construction sequence is: link it in, run
    /// `do_construct`, verify it left an fd and an interest behind, switch
    /// the descriptor to nonblocking close-on-exec, and for edge-triggered
    /// readers run one synchronous `read` to drain input that arrived
    /// before registration.
    pub fn insert(&mut self, logic: Box<dyn Task>) -> Result<TaskId> {
        self.insert_task(logic, None)
    }

    /// Close a task and its whole family; teardown happens at the next
    /// reap. Idempotent.
    pub fn close(&mut self, id: TaskId) {
        self.close_task(id);
    }

    pub(crate) fn insert_task(
        &mut self,
        logic: Box<dyn Task>,
        parent: Option<TaskId>,
    ) -> Result<TaskId> {
        let Wrapping(generation) = self.generation;
        self.generation += Wrapping(1);
        let idx = self.tasks.store(TaskSlot {
            core: TaskCore::new(parent),
            logic: Some(logic),
            generation,
        });
        let id = TaskId { idx, generation };
        if let Some(parent) = parent {
            debug_assert!(self.task_alive(parent));
            self.tasks[parent.idx].core.children.push(id);
        }
        if self.task_log(id, LogLevel::Conn) {
            info!("{}created", self.task_context(id));
        }
        if let Err(err) = self.construct(id) {
            self.close_task(id);
            return Err(err);
        }
        let interest = self.tasks[id.idx].core.interest;
        if interest.contains(Interest::EDGE | Interest::READABLE) {
            // input may have queued up before the registration existed
            self.dispatch(id, Interest::READABLE)?;
        }
        Ok(id)
    }

    fn construct(&mut self, id: TaskId) -> Result<()> {
        self.task_call(id, |logic, scope| logic.do_construct(scope))?;
        let fd = self.tasks[id.idx].core.fd;
        if fd < 0 {
            return Err(Error::internal("expecting to be assigned an fd"));
        }
        if self.tasks[id.idx].core.interest.is_empty() {
            return Err(Error::internal("expecting to be scheduled"));
        }
        crate::task::set_nonblocking(fd)?;
        crate::task::set_cloexec(fd)?;
        Ok(())
    }

    /// Run `f` on a task with its logic taken out of the slot, so the
    /// callback gets the logic and the scheduler as distinct borrows.
    fn task_call<F>(&mut self, id: TaskId, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Task, &mut Scope) -> Result<()>,
    {
        if !self.task_alive(id) {
            return Err(Error::internal("task is gone"));
        }
        let mut logic = match self.tasks[id.idx].logic.take() {
            Some(logic) => logic,
            None => return Err(Error::internal("re-entrant task dispatch")),
        };
        let result = {
            let mut scope = Scope { sched: self, id };
            f(logic.as_mut(), &mut scope)
        };
        if self.task_alive(id) {
            self.tasks[id.idx].logic = Some(logic);
        }
        result
    }

    /// The dispatch boundary: run one readiness (or construct-time) event
    /// through the task and route whatever it raises. Only `Shutdown`
    /// escapes; everything else closes the task here.
    fn dispatch(&mut self, id: TaskId, events: Interest) -> Result<()> {
        let (prev_read, prev_written) = {
            let core = &self.tasks[id.idx].core;
            (core.bytes_read, core.bytes_written)
        };
        let result = self.task_call(id, |logic, scope| scope.run(logic, events));
        self.debug_totals(id, prev_read, prev_written);
        match result {
            Ok(()) => Ok(()),
            Err(err @ Error::Shutdown(_)) => Err(err),
            Err(err) => {
                if self.task_log(id, LogLevel::Critical) {
                    error!("{}{}", self.task_context(id), err);
                }
                self.close_task(id);
                Ok(())
            }
        }
    }

    fn debug_totals(&self, id: TaskId, prev_read: u32, prev_written: u32) {
        if !self.tasks.valid(id.idx) || !self.task_log(id, LogLevel::Debug) {
            return;
        }
        let core = &self.tasks[id.idx].core;
        let read = core.bytes_read.wrapping_sub(prev_read);
        let written = core.bytes_written.wrapping_sub(prev_written);
        if read != 0 || written != 0 {
            debug!(
                "{}DEBUG {} written, {} read",
                self.task_context(id),
                written,
                read
            );
        }
    }

    /// Run until the last task is gone or a `Shutdown` unwinds the loop.
    pub fn run(&mut self) -> Result<()> {
        self.reap();
        while !self.tasks.is_empty() {
            let mut wait_ms = None;
            if self.tick.is_some() || self.timeouts_head.is_some() {
                self.now = MonoTime::now();
                if self.tick.is_some() {
                    wait_ms = Some(self.next_tick.millis_after(self.now));
                }
                if self.timeouts_enabled {
                    if let Some(first) = self.timeouts_head {
                        let due = self.tasks[first.idx].core.timeout.due;
                        let ms = due.millis_after(self.now);
                        wait_ms = Some(match wait_ms {
                            Some(tick_ms) => tick_ms.min(ms),
                            None => ms,
                        });
                    }
                }
            }
            let timeout = wait_ms.map(Duration::from_millis);
            if let Err(err) = self.poll.poll(&mut self.mio_events, timeout) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    info!("shutting down: program interrupted");
                    return Ok(());
                }
                return Err(Error::from_io(&err, "poll()", file!(), line!()));
            }
            self.now = MonoTime::now();

            let mut ready = std::mem::replace(&mut self.ready, Vec::new());
            ready.clear();
            for event in self.mio_events.iter() {
                ready.push((event.token().0, Interest::from_ready(event.readiness())));
            }
            let mut shutdown = None;
            for &(idx, events) in &ready {
                if !self.tasks.valid(idx) {
                    continue;
                }
                let id = TaskId {
                    idx,
                    generation: self.tasks[idx].generation,
                };
                if self.tasks[idx].core.closed {
                    continue;
                }
                self.current_task = Some(id);
                if let Err(err) = self.dispatch(id, events) {
                    shutdown = Some(err);
                    break;
                }
            }
            self.current_task = None;
            self.ready = ready;
            if let Some(err) = shutdown {
                info!("shutting down: {}", err);
                return Ok(());
            }

            if let Some(mut tick) = self.tick.take() {
                if self.now >= self.next_tick {
                    let mut next = tick.tick(self.now);
                    if next <= self.now {
                        next = self.now + MonoTime::from_millis(TICK_INTERVAL_MS);
                    }
                    self.next_tick = next;
                }
                self.tick = Some(tick);
            }
            if self.timeouts_enabled {
                self.expire_timeouts();
            }
            self.reap();
        }
        Ok(())
    }

    fn expire_timeouts(&mut self) {
        while let Some(first) = self.timeouts_head {
            let due = self.tasks[first.idx].core.timeout.due;
            debug_assert!(due.is_set());
            debug_assert!(!self.tasks[first.idx].core.closed);
            if due > self.now {
                break;
            }
            let now = self.now;
            let _ = self.task_call(first, |logic, scope| {
                logic.handle_timeout(scope, now);
                Ok(())
            });
            // expiry always closes; handle_timeout is only an observer
            self.close_task(first);
        }
    }

    fn reap(&mut self) {
        while let Some(id) = self.close_list.pop() {
            debug_assert!(self.tasks[id.idx].core.closed);
            drop(self.tasks.release(id.idx));
        }
    }

    // --- interest plumbing ---

    pub(crate) fn schedule_bits(&mut self, id: TaskId, bits: Interest) -> Result<()> {
        let core = &mut self.tasks[id.idx].core;
        let fd = core.fd;
        let was_registered = !core.interest.is_empty();
        core.interest |= bits;
        let ready = core.interest.to_ready();
        let opt = core.interest.poll_opt();
        let res = if was_registered {
            self.poll.reregister(&EventedFd(&fd), Token(id.idx), ready, opt)
        } else {
            self.poll.register(&EventedFd(&fd), Token(id.idx), ready, opt)
        };
        match res {
            Ok(()) => Ok(()),
            Err(err) => Err(Error::from_io(&err, "epoll_ctl(add/mod)", file!(), line!())),
        }
    }

    pub(crate) fn unschedule_bits(&mut self, id: TaskId, bits: Interest) -> Result<()> {
        let core = &mut self.tasks[id.idx].core;
        if core.interest.is_empty() {
            return Ok(());
        }
        let fd = core.fd;
        core.interest -= bits;
        if !core.interest.watchable() {
            core.interest = Interest::empty();
            if let Err(err) = self.poll.deregister(&EventedFd(&fd)) {
                return Err(Error::from_io(&err, "epoll_ctl(del)", file!(), line!()));
            }
            return Ok(());
        }
        let ready = core.interest.to_ready();
        let opt = core.interest.poll_opt();
        match self.poll.reregister(&EventedFd(&fd), Token(id.idx), ready, opt) {
            Ok(()) => Ok(()),
            Err(err) => Err(Error::from_io(&err, "epoll_ctl(mod)", file!(), line!())),
        }
    }

    // --- lifecycle plumbing ---

    pub(crate) fn close_fd(&mut self, id: TaskId) {
        let fd = self.tasks[id.idx].core.fd;
        if fd == -1 {
            return;
        }
        let _ = self.unschedule_bits(id, Interest::all());
        let _ = unistd::close(fd);
        self.tasks[id.idx].core.fd = -1;
    }

    pub(crate) fn close_task(&mut self, id: TaskId) {
        if !self.task_alive(id) || self.tasks[id.idx].core.closed {
            return;
        }
        self.tasks[id.idx].core.closed = true;
        // queued segments release their backing bytes here
        self.tasks[id.idx].core.out.clear();
        self.close_fd(id);
        let children = self.tasks[id.idx].core.children.clone();
        for child in children {
            self.close_task(child);
        }
        if self.task_log(id, LogLevel::Conn) {
            info!("{}~ closed", self.task_context(id));
        }
        // the whole family goes down together
        if let Some(parent) = self.tasks[id.idx].core.parent {
            if self.task_alive(parent) {
                let mut root = parent;
                while let Some(up) = self.tasks[root.idx].core.parent {
                    root = up;
                }
                self.close_task(root);
            }
        }
        self.close_list.push(id);
        self.unlink_timeout(id);
    }

    // --- the sorted timeout list ---

    fn timeout_linked(&self, id: TaskId) -> bool {
        let t = &self.tasks[id.idx].core.timeout;
        t.prev.is_some() || t.next.is_some() || self.timeouts_head == Some(id)
    }

    pub(crate) fn unlink_timeout(&mut self, id: TaskId) {
        let (prev, next) = {
            let t = &mut self.tasks[id.idx].core.timeout;
            t.due = MonoTime::ZERO;
            (t.prev.take(), t.next.take())
        };
        if self.timeouts_head == Some(id) {
            debug_assert!(prev.is_none());
            self.timeouts_head = next;
        }
        if let Some(prev) = prev {
            self.tasks[prev.idx].core.timeout.next = next;
        }
        if let Some(next) = next {
            self.tasks[next.idx].core.timeout.prev = prev;
        }
    }

    fn link_timeout(&mut self, id: TaskId) {
        debug_assert!(!self.timeout_linked(id));
        let old_head = self.timeouts_head.take();
        if let Some(old) = old_head {
            self.tasks[old.idx].core.timeout.prev = Some(id);
        }
        self.tasks[id.idx].core.timeout.next = old_head;
        self.timeouts_head = Some(id);
    }

    /// Sift a node to its place after its due time changed; local moves
    /// only, O(n) worst case, which is fine for the handful of armed tasks
    /// relative to how often the list is walked.
    fn sort_timeout(&mut self, id: TaskId) {
        loop {
            let due = self.tasks[id.idx].core.timeout.due;
            let next = match self.tasks[id.idx].core.timeout.next {
                Some(next) => next,
                None => break,
            };
            if self.tasks[next.idx].core.timeout.due >= due {
                break;
            }
            self.swap_adjacent(id, next);
        }
        loop {
            let due = self.tasks[id.idx].core.timeout.due;
            let prev = match self.tasks[id.idx].core.timeout.prev {
                Some(prev) => prev,
                None => break,
            };
            if self.tasks[prev.idx].core.timeout.due <= due {
                break;
            }
            self.swap_adjacent(prev, id);
        }
    }

    /// `a` directly precedes `b`; afterwards `b` precedes `a`.
    fn swap_adjacent(&mut self, a: TaskId, b: TaskId) {
        debug_assert_eq!(Some(b), self.tasks[a.idx].core.timeout.next);
        let a_prev = self.tasks[a.idx].core.timeout.prev;
        let b_next = self.tasks[b.idx].core.timeout.next;
        match a_prev {
            Some(prev) => self.tasks[prev.idx].core.timeout.next = Some(b),
            None => self.timeouts_head = Some(b),
        }
        self.tasks[b.idx].core.timeout.prev = a_prev;
        self.tasks[b.idx].core.timeout.next = Some(a);
        self.tasks[a.idx].core.timeout.prev = Some(b);
        self.tasks[a.idx].core.timeout.next = b_next;
        if let Some(next) = b_next {
            self.tasks[next.idx].core.timeout.prev = Some(a);
        }
    }

    pub(crate) fn set_timeout(&mut self, id: TaskId, kind: TimeoutKind, millisecs: u32) {
        if !self.timeouts_enabled {
            return;
        }
        // a closed task is unlinked for good; arming would re-link it
        if self.tasks[id.idx].core.closed {
            return;
        }
        let now = self.now;
        {
            let core = &mut self.tasks[id.idx].core;
            let dir = match kind {
                TimeoutKind::Read => &mut core.timeout.read,
                TimeoutKind::Write => &mut core.timeout.write,
            };
            if millisecs == 0 {
                dir.duration = MonoTime::ZERO;
                dir.due = MonoTime::ZERO;
            } else {
                dir.duration = MonoTime::from_millis(millisecs);
                dir.due = now + dir.duration;
            }
        }
        let t = &self.tasks[id.idx].core.timeout;
        let due = t.read.due.min_set(t.write.due);
        self.apply_due(id, due);
    }

    /// Recompute the aggregate deadline after a dispatch. The write
    /// deadline only counts while something is actually queued.
    pub(crate) fn resched_after_run(&mut self, id: TaskId) {
        let (read_due, write_due, out_empty) = {
            let core = &self.tasks[id.idx].core;
            // a task that closed itself mid-dispatch was unlinked by the
            // close and must stay out of the list until reaped
            if core.closed {
                return;
            }
            (
                core.timeout.read.due,
                core.timeout.write.due,
                core.out.is_empty(),
            )
        };
        if !read_due.is_set() && !write_due.is_set() {
            return;
        }
        let write_due = if out_empty { MonoTime::ZERO } else { write_due };
        self.apply_due(id, read_due.min_set(write_due));
    }

    fn apply_due(&mut self, id: TaskId, due: MonoTime) {
        if !due.is_set() {
            if self.timeout_linked(id) {
                self.unlink_timeout(id);
            } else {
                self.tasks[id.idx].core.timeout.due = MonoTime::ZERO;
            }
            return;
        }
        self.tasks[id.idx].core.timeout.due = due;
        if !self.timeout_linked(id) {
            self.link_timeout(id);
        }
        self.sort_timeout(id);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutting_down = true;
        let ids: Vec<TaskId> = self
            .tasks
            .ids()
            .map(|idx| TaskId {
                idx,
                generation: self.tasks[idx].generation,
            })
            .collect();
        for id in ids {
            self.close_task(id);
        }
        self.reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::out::Out;
    use crate::task::{Interest, Line, Scope, Task};
    use std::cell::{Cell, RefCell};
    use std::io::{Read, Write};
    use std::net::Shutdown as NetShutdown;
    use std::os::unix::io::{IntoRawFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    fn pair() -> (RawFd, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (ours.into_raw_fd(), theirs)
    }

    /// Smallest viable task: takes a descriptor, watches it, drains reads.
    struct Plain {
        fd: RawFd,
        interest: Interest,
    }

    impl Task for Plain {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            task.schedule(self.interest)
        }
        fn read(&mut self, task: &mut Scope) -> Result<()> {
            let mut buf = [0u8; 64];
            loop {
                let (_, complete) = task.async_read_into(&mut buf)?;
                if !complete {
                    return Ok(());
                }
            }
        }
    }

    struct NoFd;

    impl Task for NoFd {
        fn do_construct(&mut self, _task: &mut Scope) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, _task: &mut Scope) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn construct_requires_fd_and_interest() {
        let mut sched = Scheduler::new().unwrap();
        let err = sched.insert(Box::new(NoFd)).unwrap_err();
        assert!(err.to_string().contains("fd"), "{}", err);
        // the failed task is closed and reaped on the next turn
        assert!(sched.run().is_ok());
        assert_eq!(0, sched.task_count());
    }

    #[test]
    fn interest_algebra_matches_registration() {
        let mut sched = Scheduler::new().unwrap();
        let (fd, _peer) = pair();
        let id = sched
            .insert(Box::new(Plain {
                fd,
                interest: Interest::READABLE | Interest::EDGE,
            }))
            .unwrap();
        sched.schedule_bits(id, Interest::WRITABLE).unwrap();
        sched.unschedule_bits(id, Interest::READABLE).unwrap();
        assert_eq!(
            Interest::WRITABLE | Interest::EDGE,
            sched.tasks[id.idx].core.interest
        );
        // dropping the last watchable bit removes the whole registration
        sched.unschedule_bits(id, Interest::WRITABLE).unwrap();
        assert_eq!(Interest::empty(), sched.tasks[id.idx].core.interest);
    }

    /// Echoes whatever arrives, with a deliberately small stack buffer so
    /// one delivery takes several reads.
    struct Echo {
        fd: RawFd,
    }

    impl Task for Echo {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            task.schedule(Interest::READABLE | Interest::EDGE)
        }
        fn read(&mut self, task: &mut Scope) -> Result<()> {
            let mut buf = [0u8; 8];
            loop {
                let (n, complete) = task.async_read_into(&mut buf)?;
                if n > 0 {
                    task.async_write_cpy(&buf[..n])?;
                }
                if !complete {
                    return Ok(());
                }
            }
        }
    }

    #[test]
    fn echo_round_trip_and_end_of_stream() {
        let mut sched = Scheduler::new().unwrap();
        let (fd, mut peer) = pair();
        sched.insert(Box::new(Echo { fd })).unwrap();

        let client = thread::spawn(move || {
            peer.write_all(b"hello world").unwrap();
            let mut echoed = [0u8; 11];
            peer.read_exact(&mut echoed).unwrap();
            peer.shutdown(NetShutdown::Write).unwrap();
            echoed
        });

        sched.run().unwrap();
        assert_eq!(0, sched.task_count());
        assert_eq!(b"hello world", &client.join().unwrap());
    }

    struct LineReader {
        fd: RawFd,
        line: Line<64>,
        got: Rc<RefCell<Vec<String>>>,
        partials: Rc<Cell<u32>>,
    }

    impl Task for LineReader {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            task.set_read_ahead_buffer_size(64)?;
            task.schedule(Interest::READABLE | Interest::EDGE)
        }
        fn read(&mut self, task: &mut Scope) -> Result<()> {
            loop {
                if !task.async_read_in(&mut self.line)? {
                    self.partials.set(self.partials.get() + 1);
                    return Ok(());
                }
                self.got.borrow_mut().push(self.line.as_str().to_string());
                self.line.clear();
            }
        }
    }

    #[test]
    fn line_read_spans_two_deliveries() {
        let mut sched = Scheduler::new().unwrap();
        let (fd, mut peer) = pair();
        let got = Rc::new(RefCell::new(Vec::new()));
        let partials = Rc::new(Cell::new(0));
        sched
            .insert(Box::new(LineReader {
                fd,
                line: Line::new(),
                got: Rc::clone(&got),
                partials: Rc::clone(&partials),
            }))
            .unwrap();

        let client = thread::spawn(move || {
            peer.write_all(b"GET /").unwrap();
            thread::sleep(Duration::from_millis(50));
            peer.write_all(b" HTTP/1.1\r\n").unwrap();
            peer.shutdown(NetShutdown::Write).unwrap();
            // hold our end open until the reader is done with the data
            let mut buf = [0u8; 1];
            let _ = peer.read(&mut buf);
        });

        sched.run().unwrap();
        client.join().unwrap();
        assert_eq!(vec!["GET / HTTP/1.1\r\n".to_string()], *got.borrow());
        assert!(partials.get() >= 1);
    }

    /// Queues more than the kernel will take plus two trailing segments,
    /// then half-closes on its very first readable dispatch.
    struct HalfCloser {
        fd: RawFd,
        payload: Vec<u8>,
    }

    impl Task for HalfCloser {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            // writing before construct finishes, so go nonblocking ourselves
            task.set_nonblocking()?;
            task.schedule(Interest::READABLE | Interest::EDGE)?;
            task.async_write_cpy(&self.payload)?;
            task.async_write_str("tail-one;")?;
            task.async_write_out(Out::from_owned(String::from("tail-two")))
        }
        fn read(&mut self, task: &mut Scope) -> Result<()> {
            let mut byte = [0u8; 1];
            let _ = task.async_read_into(&mut byte)?;
            Err(Error::HalfClose("bye"))
        }
    }

    #[test]
    fn half_close_flushes_queued_output_in_order_then_closes() {
        let payload = vec![0x5au8; 1 << 20];
        let expected = payload.len();
        let mut sched = Scheduler::new().unwrap();
        let (fd, mut peer) = pair();
        sched.insert(Box::new(HalfCloser { fd, payload })).unwrap();

        let client = thread::spawn(move || {
            let mut all = Vec::new();
            peer.read_to_end(&mut all).unwrap();
            all
        });

        sched.run().unwrap();
        assert_eq!(0, sched.task_count());
        let all = client.join().unwrap();
        assert_eq!(expected + 17, all.len());
        assert!(all[..expected].iter().all(|&b| b == 0x5a));
        assert_eq!(&b"tail-one;tail-two"[..], &all[expected..]);
    }

    struct Timed {
        fd: RawFd,
        millisecs: u32,
        fired: Rc<RefCell<Vec<u32>>>,
    }

    impl Task for Timed {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            task.schedule(Interest::READABLE)?;
            task.set_read_timeout(self.millisecs);
            Ok(())
        }
        fn read(&mut self, _task: &mut Scope) -> Result<()> {
            Ok(())
        }
        fn handle_timeout(&mut self, _task: &mut Scope, _now: MonoTime) {
            self.fired.borrow_mut().push(self.millisecs);
        }
    }

    fn chain_durations(sched: &Scheduler) -> Vec<i64> {
        let mut durations = Vec::new();
        let mut cursor = sched.timeouts_head;
        while let Some(id) = cursor {
            let t = &sched.tasks[id.idx].core.timeout;
            durations.push(t.read.duration.as_millis());
            cursor = t.next;
        }
        durations
    }

    #[test]
    fn timeout_list_sorts_and_expires_in_deadline_order() {
        let mut sched = Scheduler::new().unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut peers = Vec::new();
        for millisecs in [100u32, 50, 75] {
            let (fd, peer) = pair();
            peers.push(peer);
            sched
                .insert(Box::new(Timed {
                    fd,
                    millisecs,
                    fired: Rc::clone(&fired),
                }))
                .unwrap();
        }
        assert_eq!(vec![50, 75, 100], chain_durations(&sched));

        sched.run().unwrap();
        assert_eq!(vec![50, 75, 100], *fired.borrow());
        assert_eq!(0, sched.task_count());
    }

    #[test]
    fn clearing_both_timeouts_unlinks() {
        let mut sched = Scheduler::new().unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let (fd, _peer) = pair();
        let id = sched
            .insert(Box::new(Timed {
                fd,
                millisecs: 40,
                fired,
            }))
            .unwrap();
        sched.set_timeout(id, TimeoutKind::Write, 30);
        assert!(sched.timeout_linked(id));
        assert!(sched.tasks[id.idx].core.timeout.due.is_set());

        sched.set_timeout(id, TimeoutKind::Read, 0);
        assert!(sched.timeout_linked(id));
        assert_eq!(
            30,
            sched.tasks[id.idx].core.timeout.due.as_millis() - sched.now().as_millis()
        );

        sched.set_timeout(id, TimeoutKind::Write, 0);
        assert!(!sched.timeout_linked(id));
        assert!(!sched.tasks[id.idx].core.timeout.due.is_set());
        assert_eq!(None, sched.timeouts_head);
    }

    /// Returns from an edge-triggered read without draining: a contract
    /// breach the dispatch turns into closure.
    struct Lazy {
        fd: RawFd,
    }

    impl Task for Lazy {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            task.schedule(Interest::READABLE | Interest::EDGE)
        }
        fn read(&mut self, _task: &mut Scope) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unsated_edge_read_closes_the_task() {
        let mut sched = Scheduler::new().unwrap();
        let (fd, _peer) = pair();
        let id = sched.insert(Box::new(Lazy { fd })).unwrap();
        assert!(sched.tasks[id.idx].core.closed);
        sched.run().unwrap();
        assert_eq!(0, sched.task_count());
    }

    #[test]
    fn closing_one_family_member_closes_them_all() {
        let mut sched = Scheduler::new().unwrap();
        let (fd_a, _pa) = pair();
        let (fd_b, _pb) = pair();
        let (fd_c, _pc) = pair();
        let parent = sched
            .insert(Box::new(Plain {
                fd: fd_a,
                interest: Interest::READABLE,
            }))
            .unwrap();
        let child_a = sched
            .insert_task(
                Box::new(Plain {
                    fd: fd_b,
                    interest: Interest::READABLE,
                }),
                Some(parent),
            )
            .unwrap();
        let child_b = sched
            .insert_task(
                Box::new(Plain {
                    fd: fd_c,
                    interest: Interest::READABLE,
                }),
                Some(parent),
            )
            .unwrap();

        sched.close(child_a);
        for id in [parent, child_a, child_b] {
            assert!(sched.tasks[id.idx].core.closed);
            assert_eq!(-1, sched.tasks[id.idx].core.fd);
            assert!(sched.tasks[id.idx].core.out.is_empty());
            assert!(!sched.timeout_linked(id));
        }
        // closing again is a no-op
        sched.close(child_a);
        sched.run().unwrap();
        assert_eq!(0, sched.task_count());
    }

    struct SelfCloser {
        fd: RawFd,
    }

    impl Task for SelfCloser {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            task.schedule(Interest::READABLE | Interest::EDGE)
        }
        fn read(&mut self, task: &mut Scope) -> Result<()> {
            task.close();
            Ok(())
        }
    }

    #[test]
    fn task_may_close_itself_mid_read() {
        let mut sched = Scheduler::new().unwrap();
        let (fd, _peer) = pair();
        let id = sched.insert(Box::new(SelfCloser { fd })).unwrap();
        assert!(sched.tasks[id.idx].core.closed);
        sched.run().unwrap();
        assert_eq!(0, sched.task_count());
    }

    /// Arms a deadline, then closes itself during its own dispatch.
    struct TimedSelfCloser {
        fd: RawFd,
    }

    impl Task for TimedSelfCloser {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            task.schedule(Interest::READABLE | Interest::EDGE)?;
            task.set_read_timeout(5_000);
            Ok(())
        }
        fn read(&mut self, task: &mut Scope) -> Result<()> {
            task.close();
            Ok(())
        }
    }

    #[test]
    fn self_close_with_armed_timeout_stays_unlinked() {
        let mut sched = Scheduler::new().unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let (keeper_fd, _keeper_peer) = pair();
        sched
            .insert(Box::new(Timed {
                fd: keeper_fd,
                millisecs: 60,
                fired: Rc::clone(&fired),
            }))
            .unwrap();
        let (fd, _peer) = pair();
        // closes during the construct-time drain, with read.due still set
        let id = sched.insert(Box::new(TimedSelfCloser { fd })).unwrap();
        assert!(sched.tasks[id.idx].core.closed);
        assert!(!sched.timeout_linked(id));
        assert_eq!(vec![60], chain_durations(&sched));
        // the loop must survive reaping it while the keeper's deadline runs
        sched.run().unwrap();
        assert_eq!(vec![60], *fired.borrow());
        assert_eq!(0, sched.task_count());
    }

    /// Counts firings and never advances its own due time, leaving the
    /// clamp to push the next one forward.
    struct Metronome {
        ticks: Rc<Cell<u32>>,
    }

    impl Tick for Metronome {
        fn tick(&mut self, now: MonoTime) -> MonoTime {
            self.ticks.set(self.ticks.get() + 1);
            now
        }
    }

    #[test]
    fn tick_fires_on_interval_and_clamps_a_stuck_return() {
        let mut sched = Scheduler::new().unwrap();
        let ticks = Rc::new(Cell::new(0));
        sched.set_tick(Box::new(Metronome {
            ticks: Rc::clone(&ticks),
        }));
        let fired = Rc::new(RefCell::new(Vec::new()));
        let (fd, _peer) = pair();
        sched
            .insert(Box::new(Timed {
                fd,
                millisecs: 1100,
                fired: Rc::clone(&fired),
            }))
            .unwrap();
        let start = MonoTime::now();
        sched.run().unwrap();
        // exactly one firing fits the keeper's 1.1s window; an unclamped
        // tick would spin the loop and fire dozens of times
        assert_eq!(1, ticks.get());
        assert!(sched.next_tick > start + MonoTime::from_millis(1500));
        assert_eq!(vec![1100], *fired.borrow());
    }

    /// Reads a couple of bytes through the read-ahead cache, then resizes
    /// it both ways while bytes are still buffered.
    struct ResizeProbe {
        fd: RawFd,
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl Task for ResizeProbe {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            task.set_read_ahead_buffer_size(16)?;
            task.schedule(Interest::READABLE | Interest::EDGE)
        }
        fn read(&mut self, task: &mut Scope) -> Result<()> {
            let mut two = [0u8; 2];
            if !task.async_read_exact(&mut two)? {
                return Ok(());
            }
            self.seen
                .borrow_mut()
                .push(String::from_utf8_lossy(&two).into_owned());
            // six bytes are still buffered; shrinking below them is refused
            if task.set_read_ahead_buffer_size(4).is_err() {
                self.seen.borrow_mut().push("refused".to_string());
            }
            // growing keeps them
            task.set_read_ahead_buffer_size(32)?;
            let rest = task.async_read_buffered(16)?.to_vec();
            self.seen
                .borrow_mut()
                .push(String::from_utf8_lossy(&rest).into_owned());
            task.close();
            Ok(())
        }
    }

    /// Appends into a resizable buffer, first capped, then unbounded.
    struct BufDrain {
        fd: RawFd,
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl Task for BufDrain {
        fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
            task.set_fd(self.fd);
            task.schedule(Interest::READABLE | Interest::EDGE)
        }
        fn read(&mut self, task: &mut Scope) -> Result<()> {
            let mut buf = crate::out::Buffer::new();
            let (n, dry) = task.async_read_buf(&mut buf, 4)?;
            self.seen.borrow_mut().push(format!("cap:{}:{}", n, dry));
            let (n, dry) = task.async_read_buf(&mut buf, 0)?;
            self.seen.borrow_mut().push(format!("rest:{}:{}", n, dry));
            self.seen.borrow_mut().push(buf.as_str().to_string());
            task.close();
            Ok(())
        }
    }

    #[test]
    fn buffered_read_respects_the_cap() {
        let mut sched = Scheduler::new().unwrap();
        let (fd, mut peer) = pair();
        peer.write_all(b"abcdefgh").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        sched
            .insert(Box::new(BufDrain {
                fd,
                seen: Rc::clone(&seen),
            }))
            .unwrap();
        assert_eq!(
            vec![
                "cap:4:false".to_string(),
                "rest:4:true".to_string(),
                "abcdefgh".to_string()
            ],
            *seen.borrow()
        );
        sched.run().unwrap();
    }

    #[test]
    fn read_ahead_resize_preserves_buffered_bytes() {
        let mut sched = Scheduler::new().unwrap();
        let (fd, mut peer) = pair();
        peer.write_all(b"abcdefgh").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        sched
            .insert(Box::new(ResizeProbe {
                fd,
                seen: Rc::clone(&seen),
            }))
            .unwrap();
        // the construct-time drain did all the work already
        assert_eq!(
            vec!["ab".to_string(), "refused".to_string(), "cdefgh".to_string()],
            *seen.borrow()
        );
        sched.run().unwrap();
        assert_eq!(0, sched.task_count());
    }
}
