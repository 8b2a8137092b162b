//! Per-task state and the operations available to task code.
//!
//! A task is one descriptor plus its read/write state: an optional
//! read-ahead cache, a scratch span for exact-length reads, a FIFO of
//! outbound [`Out`] segments and two deadline slots. Behavior lives in the
//! [`Task`] trait; every hook receives a [`Scope`] carrying the whole base
//! surface: reading, writing, interest changes, timeouts and the close
//! cascade.

use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::info;
use mio::unix::UnixReady;
use mio::{PollOpt, Ready};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{self, sockopt};
use nix::unistd;

use crate::check;
use crate::error::{errno, Error, Result};
use crate::out::{Buffer, Out};
use crate::scheduler::{Scheduler, TaskId, TimeoutKind};
use crate::time::MonoTime;

/// Capacity of the scratch span backing [`Scope::async_read_exact`].
pub const SPAN_MAX: usize = 16;

static NEXT_TID: AtomicU64 = AtomicU64::new(0);

bitflags! {
    /// Readiness interest of a task, mirrored to the poll on every change.
    ///
    /// An empty mask means the task is not registered at all. `EDGE` rides
    /// along in the mask but is delivery style, not a watchable condition:
    /// when nothing watchable remains the registration is removed outright.
    pub struct Interest: u8 {
        const READABLE = 0b0000_0001;
        const WRITABLE = 0b0000_0010;
        /// Edge-triggered delivery.
        const EDGE     = 0b0000_0100;
        /// Peer hung up its write side.
        const HUP      = 0b0000_1000;
        const ERROR    = 0b0001_0000;
    }
}

impl Interest {
    pub(crate) fn to_ready(self) -> Ready {
        let mut ready = Ready::empty();
        if self.contains(Interest::READABLE) {
            ready.insert(Ready::readable());
        }
        if self.contains(Interest::WRITABLE) {
            ready.insert(Ready::writable());
        }
        if self.contains(Interest::HUP) {
            ready.insert(Ready::from(UnixReady::hup()));
        }
        if self.contains(Interest::ERROR) {
            ready.insert(Ready::from(UnixReady::error()));
        }
        ready
    }

    pub(crate) fn poll_opt(self) -> PollOpt {
        if self.contains(Interest::EDGE) {
            PollOpt::edge()
        } else {
            PollOpt::level()
        }
    }

    pub(crate) fn from_ready(ready: Ready) -> Interest {
        let unix = UnixReady::from(ready);
        let mut interest = Interest::empty();
        if ready.is_readable() {
            interest |= Interest::READABLE;
        }
        if ready.is_writable() {
            interest |= Interest::WRITABLE;
        }
        if unix.is_hup() {
            interest |= Interest::HUP;
        }
        if unix.is_error() {
            interest |= Interest::ERROR;
        }
        interest
    }

    /// Anything worth keeping a poll registration for?
    pub(crate) fn watchable(self) -> bool {
        !(self - Interest::EDGE).is_empty()
    }
}

/// Log classes a task can override per-instance; anything not overridden
/// defers to the global `log` facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Dispatch-boundary error dumps.
    Critical,
    /// Connection lifecycle: created, closed, timed out.
    Conn,
    /// Per-dispatch byte totals.
    Debug,
}

impl LogLevel {
    fn bit(self) -> u8 {
        match self {
            LogLevel::Critical => 0b001,
            LogLevel::Conn => 0b010,
            LogLevel::Debug => 0b100,
        }
    }

    fn enabled_globally(self) -> bool {
        match self {
            LogLevel::Critical => log::log_enabled!(log::Level::Error),
            LogLevel::Conn => log::log_enabled!(log::Level::Info),
            LogLevel::Debug => log::log_enabled!(log::Level::Debug),
        }
    }
}

/// Fixed-capacity accumulator for terminator-delimited reads.
///
/// [`Scope::async_read_in`] fills it one byte at a time; the newline is
/// stored and counted, so a complete line ends with `'\n'` unless the
/// buffer filled up first.
pub struct Line<const MAX: usize> {
    buf: [u8; MAX],
    len: usize,
}

impl<const MAX: usize> Line<MAX> {
    pub fn new() -> Line<MAX> {
        Line {
            buf: [0; MAX],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        MAX
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == MAX
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The line as text, empty when it is not valid UTF-8.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.as_bytes().starts_with(prefix.as_bytes())
    }

    pub fn ends_with(&self, suffix: &str) -> bool {
        self.as_bytes().ends_with(suffix.as_bytes())
    }

    pub(crate) fn push(&mut self, byte: u8) {
        debug_assert!(self.len < MAX);
        self.buf[self.len] = byte;
        self.len += 1;
    }
}

impl<const MAX: usize> Default for Line<MAX> {
    fn default() -> Self {
        Line::new()
    }
}

pub(crate) struct ReadAhead {
    pub buf: Box<[u8]>,
    pub ofs: u16,
    pub len: u16,
}

#[derive(Default, Clone, Copy)]
pub(crate) struct TimeoutDir {
    pub due: MonoTime,
    pub duration: MonoTime,
}

#[derive(Default)]
pub(crate) struct TimeoutState {
    /// `min` of the armed directions; indexes the scheduler's sorted list.
    pub due: MonoTime,
    pub prev: Option<TaskId>,
    pub next: Option<TaskId>,
    pub read: TimeoutDir,
    pub write: TimeoutDir,
}

/// The state the scheduler keeps for every task, behavior excluded.
pub(crate) struct TaskCore {
    pub fd: RawFd,
    pub interest: Interest,
    pub out: VecDeque<Out>,
    pub half_close: Option<&'static str>,
    pub read_ahead: Option<ReadAhead>,
    pub scratch: [u8; SPAN_MAX],
    pub scratch_len: usize,
    pub tid: u64,
    pub bytes_read: u32,
    pub bytes_written: u32,
    pub log_flags: u8,
    pub log_mask: u8,
    pub closed: bool,
    pub sated: bool,
    pub end_of_input: bool,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub timeout: TimeoutState,
}

impl TaskCore {
    pub fn new(parent: Option<TaskId>) -> TaskCore {
        TaskCore {
            fd: -1,
            interest: Interest::empty(),
            out: VecDeque::new(),
            half_close: None,
            read_ahead: None,
            scratch: [0; SPAN_MAX],
            scratch_len: 0,
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed) + 1,
            bytes_read: 0,
            bytes_written: 0,
            log_flags: 0,
            log_mask: 0,
            closed: false,
            sated: true,
            end_of_input: false,
            parent,
            children: Vec::new(),
            timeout: TimeoutState::default(),
        }
    }

    pub fn log(&self, level: LogLevel) -> bool {
        if self.log_mask & level.bit() != 0 {
            return self.log_flags & level.bit() != 0;
        }
        level.enabled_globally()
    }

    pub fn context(&self) -> String {
        if self.fd == -1 {
            format!("[{:04}:closed] ", self.tid)
        } else {
            format!("[{:04}] ", self.tid)
        }
    }
}

/// The hooks a task implements. Every callback receives the task's
/// [`Scope`], which carries the whole base surface.
pub trait Task {
    /// Assign the descriptor and the initial interest. Called exactly once,
    /// right after the task is linked into the scheduler. Must leave a
    /// non-negative fd behind via [`Scope::set_fd`] and call
    /// [`Scope::schedule`].
    fn do_construct(&mut self, task: &mut Scope) -> Result<()>;

    /// Drain readable input. Under edge-triggered interest this must keep
    /// consuming until the descriptor runs dry (`sated`), close or
    /// half-close the task before returning; anything else loses events.
    fn read(&mut self, task: &mut Scope) -> Result<()>;

    /// The peer hung up or the descriptor errored.
    fn disconnected(&mut self, _task: &mut Scope) -> Result<()> {
        Err(Error::client("disconnected"))
    }

    /// A read or write deadline expired. Informational; the scheduler
    /// closes the task right after regardless.
    fn handle_timeout(&mut self, task: &mut Scope, _now: MonoTime) {
        if task.log(LogLevel::Conn) {
            info!("{}timeout", task.context());
        }
    }

    /// Replace the diagnostic prefix used in error dumps.
    fn dump_context(&self) -> Option<String> {
        None
    }
}

/// Periodic hook driven by the scheduler between dispatch batches.
pub trait Tick {
    /// Called when due; returns the next due time.
    fn tick(&mut self, now: MonoTime) -> MonoTime;
}

/// The base-task surface handed to every [`Task`] callback.
pub struct Scope<'a> {
    pub(crate) sched: &'a mut Scheduler,
    pub(crate) id: TaskId,
}

impl<'a> Scope<'a> {
    fn core(&self) -> &TaskCore {
        &self.sched.tasks[self.id.idx].core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.sched.tasks[self.id.idx].core
    }

    // --- identity and diagnostics ---

    pub fn task_id(&self) -> TaskId {
        self.id
    }

    pub fn tid(&self) -> u64 {
        self.core().tid
    }

    pub fn fd(&self) -> RawFd {
        self.core().fd
    }

    /// Hand the task its descriptor; meant for `do_construct`.
    pub fn set_fd(&mut self, fd: RawFd) {
        self.core_mut().fd = fd;
    }

    pub fn now(&self) -> MonoTime {
        self.sched.now()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.sched.is_shutting_down()
    }

    pub fn bytes_read(&self) -> u32 {
        self.core().bytes_read
    }

    pub fn bytes_written(&self) -> u32 {
        self.core().bytes_written
    }

    pub fn log(&self, level: LogLevel) -> bool {
        self.core().log(level)
    }

    pub fn set_log(&mut self, level: LogLevel, enable: bool) {
        let core = self.core_mut();
        core.log_mask |= level.bit();
        if enable {
            core.log_flags |= level.bit();
        } else {
            core.log_flags &= !level.bit();
        }
    }

    /// One-line diagnostic prefix.
    pub fn context(&self) -> String {
        self.sched.task_context(self.id)
    }

    // --- lifecycle ---

    /// Closed or half-closed; either way no further reads are accepted.
    pub fn is_closed(&self) -> bool {
        let core = self.core();
        core.closed || core.half_close.is_some()
    }

    pub fn is_end_of_input(&self) -> bool {
        self.core().end_of_input
    }

    /// Close the task and its whole family; actual teardown happens at the
    /// scheduler's reap step.
    pub fn close(&mut self) {
        let id = self.id;
        self.sched.close_task(id);
    }

    /// Close just the descriptor, dropping any registration with it.
    pub fn close_fd(&mut self) {
        let id = self.id;
        self.sched.close_fd(id);
    }

    /// Add another root task to the scheduler.
    pub fn insert(&mut self, logic: Box<dyn Task>) -> Result<TaskId> {
        self.sched.insert_task(logic, None)
    }

    /// Add a task below this one in the task tree; the family closes
    /// together.
    pub fn insert_child(&mut self, logic: Box<dyn Task>) -> Result<TaskId> {
        let id = self.id;
        self.sched.insert_task(logic, Some(id))
    }

    // --- interest ---

    pub fn schedule(&mut self, interest: Interest) -> Result<()> {
        let id = self.id;
        self.sched.schedule_bits(id, interest)
    }

    pub fn unschedule(&mut self, interest: Interest) -> Result<()> {
        let id = self.id;
        self.sched.unschedule_bits(id, interest)
    }

    // --- timeouts ---

    /// Arm (or with `0`, clear) the read deadline.
    pub fn set_read_timeout(&mut self, millisecs: u32) {
        let id = self.id;
        self.sched.set_timeout(id, TimeoutKind::Read, millisecs);
    }

    /// Arm (or with `0`, clear) the write deadline.
    pub fn set_write_timeout(&mut self, millisecs: u32) {
        let id = self.id;
        self.sched.set_timeout(id, TimeoutKind::Write, millisecs);
    }

    // --- descriptor options ---

    pub fn set_nonblocking(&mut self) -> Result<()> {
        set_nonblocking(self.core().fd)
    }

    pub fn set_cloexec(&mut self) -> Result<()> {
        set_cloexec(self.core().fd)
    }

    pub fn set_nodelay(&mut self, enabled: bool) -> Result<()> {
        set_nodelay(self.core().fd, enabled)
    }

    /// Resize (or with `0`, drop) the read-ahead cache, preserving any
    /// buffered bytes. Shrinking below what is buffered is refused.
    pub fn set_read_ahead_buffer_size(&mut self, size: u16) -> Result<()> {
        let core = self.core_mut();
        match core.read_ahead.take() {
            Some(ra) => {
                let live = (ra.len - ra.ofs) as usize;
                if live > size as usize {
                    core.read_ahead = Some(ra);
                    return Err(Error::internal(format!(
                        "truncating the read-ahead buffer would lose {} buffered bytes",
                        live
                    )));
                }
                if size > 0 {
                    let mut fresh = vec![0u8; size as usize].into_boxed_slice();
                    fresh[..live].copy_from_slice(&ra.buf[ra.ofs as usize..ra.len as usize]);
                    core.read_ahead = Some(ReadAhead {
                        buf: fresh,
                        ofs: 0,
                        len: live as u16,
                    });
                }
            }
            None => {
                if size > 0 {
                    core.read_ahead = Some(ReadAhead {
                        buf: vec![0u8; size as usize].into_boxed_slice(),
                        ofs: 0,
                        len: 0,
                    });
                }
            }
        }
        Ok(())
    }

    // --- read path ---

    /// Read as much of `dst` as is available. Returns how many bytes landed
    /// this call and whether `dst` was filled completely; an incomplete
    /// return means the descriptor ran dry and the task is sated.
    ///
    /// With a read-ahead cache installed, buffered bytes are served first
    /// and small remainders refill the cache instead of reading directly.
    pub fn async_read_into(&mut self, dst: &mut [u8]) -> Result<(usize, bool)> {
        if self.is_closed() {
            return Err(Error::internal("cannot read when closed"));
        }
        if self.core().sated {
            return Err(Error::internal("should not read when sated"));
        }
        debug_assert!(!dst.is_empty());
        let mut read = 0;
        while read < dst.len() {
            // serve from the cache first
            {
                let core = self.core_mut();
                if let Some(ra) = core.read_ahead.as_mut() {
                    if ra.ofs < ra.len {
                        let have = (ra.len - ra.ofs) as usize;
                        let take = (dst.len() - read).min(have);
                        let from = ra.ofs as usize;
                        dst[read..read + take].copy_from_slice(&ra.buf[from..from + take]);
                        ra.ofs += take as u16;
                        if ra.ofs == ra.len {
                            ra.ofs = 0;
                            ra.len = 0;
                        }
                        read += take;
                        continue;
                    }
                }
            }
            let refill = match self.core().read_ahead {
                Some(ref ra) => dst.len() - read < ra.buf.len(),
                None => false,
            };
            if refill {
                if !self.fill_read_ahead()? {
                    return Ok((read, false));
                }
            } else {
                let fd = self.core().fd;
                match unistd::read(fd, &mut dst[read..]) {
                    Ok(0) => {
                        let core = self.core_mut();
                        core.end_of_input = true;
                        core.sated = true;
                        return Err(Error::EndOfStream);
                    }
                    Ok(n) => {
                        read += n;
                        let core = self.core_mut();
                        core.bytes_read = core.bytes_read.saturating_add(n as u32);
                    }
                    Err(err) => {
                        let errno = errno(err);
                        if errno == Errno::EAGAIN {
                            self.core_mut().sated = true;
                            return Ok((read, false));
                        }
                        return Err(Error::c("async_read()", errno, file!(), line!()));
                    }
                }
            }
        }
        Ok((read, true))
    }

    /// One read from the OS into the cache tail; `Ok(false)` when the
    /// descriptor ran dry.
    fn fill_read_ahead(&mut self) -> Result<bool> {
        let core = self.core_mut();
        let fd = core.fd;
        let res = {
            let ra = match core.read_ahead.as_mut() {
                Some(ra) => ra,
                None => return Err(Error::internal("no read-ahead buffer")),
            };
            let tail = ra.len as usize;
            debug_assert!(tail < ra.buf.len());
            unistd::read(fd, &mut ra.buf[tail..])
        };
        match res {
            Ok(0) => {
                core.end_of_input = true;
                core.sated = true;
                Err(Error::EndOfStream)
            }
            Ok(n) => {
                core.bytes_read = core.bytes_read.saturating_add(n as u32);
                if let Some(ra) = core.read_ahead.as_mut() {
                    ra.len += n as u16;
                }
                Ok(true)
            }
            Err(err) => {
                let errno = errno(err);
                if errno == Errno::EAGAIN {
                    core.sated = true;
                    return Ok(false);
                }
                Err(Error::c("async_read()", errno, file!(), line!()))
            }
        }
    }

    /// Read exactly `dst.len()` bytes (at most [`SPAN_MAX`]), accumulating
    /// across calls in the scratch span. `Ok(false)` until the span is
    /// complete; `dst` is only written on completion.
    pub fn async_read_exact(&mut self, dst: &mut [u8]) -> Result<bool> {
        let bytes = dst.len();
        if bytes > SPAN_MAX {
            return Err(Error::internal("span read too large"));
        }
        loop {
            {
                let core = self.core_mut();
                if core.scratch_len == bytes {
                    dst.copy_from_slice(&core.scratch[..bytes]);
                    core.scratch_len = 0;
                    return Ok(true);
                }
            }
            let have = self.core().scratch_len;
            if have > bytes {
                return Err(Error::internal("mismatched span read"));
            }
            let mut tmp = [0u8; SPAN_MAX];
            tmp[..have].copy_from_slice(&self.core().scratch[..have]);
            let (n, complete) = self.async_read_into(&mut tmp[have..bytes])?;
            let core = self.core_mut();
            core.scratch[have..have + n].copy_from_slice(&tmp[have..have + n]);
            core.scratch_len = have + n;
            if !complete {
                return Ok(false);
            }
        }
    }

    /// Append up to `max` bytes to `buf` (`0` = unbounded). Returns the
    /// bytes appended this call and whether the source ran dry (`false`
    /// means the `max` cap stopped the read first).
    pub fn async_read_buf(&mut self, buf: &mut Buffer, max: usize) -> Result<(usize, bool)> {
        let mut total = 0;
        loop {
            let chunk = if max > 0 { max - total } else { 512 };
            if chunk == 0 {
                return Ok((total, false));
            }
            let old = buf.len();
            buf.set_length(old + chunk);
            match self.async_read_into(&mut buf.as_mut_slice()[old..old + chunk]) {
                Ok((n, complete)) => {
                    buf.set_length(old + n);
                    total += n;
                    if !complete {
                        return Ok((total, true));
                    }
                }
                Err(err) => {
                    buf.set_length(old);
                    return Err(err);
                }
            }
        }
    }

    /// Accumulate one line into `line`. `Ok(false)` when the source ran dry
    /// before a terminator; `Ok(true)` with a trailing `'\n'` for a
    /// complete line, or without one when the buffer (or `max`) filled up.
    /// A NUL byte terminates a line without being stored.
    pub fn async_read_in<const MAX: usize>(&mut self, line: &mut Line<MAX>) -> Result<bool> {
        self.async_read_in_limit(line, MAX)
    }

    /// [`async_read_in`](Scope::async_read_in) bounded by `max` bytes.
    pub fn async_read_in_limit<const MAX: usize>(
        &mut self,
        line: &mut Line<MAX>,
        max: usize,
    ) -> Result<bool> {
        let max = max.min(MAX);
        loop {
            if line.len() >= max {
                return Ok(true);
            }
            let mut byte = [0u8; 1];
            if !self.async_read_exact(&mut byte)? {
                return Ok(false);
            }
            if byte[0] == 0 {
                return Ok(true);
            }
            line.push(byte[0]);
            if byte[0] == b'\n' {
                return Ok(true);
            }
        }
    }

    /// Borrow up to `max` buffered bytes straight out of the read-ahead
    /// cache, refilling it once from the OS when empty. An empty slice
    /// means the descriptor ran dry.
    pub fn async_read_buffered(&mut self, max: u16) -> Result<&[u8]> {
        if self.core().read_ahead.is_none() {
            return Err(Error::internal("cannot read from buffer"));
        }
        let empty = {
            let ra = self.core().read_ahead.as_ref().unwrap();
            ra.ofs == ra.len
        };
        if empty {
            if self.core().sated {
                return Ok(&[]);
            }
            if !self.fill_read_ahead()? {
                return Ok(&[]);
            }
        }
        let (start, end) = {
            let ra = self.core_mut().read_ahead.as_mut().unwrap();
            let have = ra.len - ra.ofs;
            let take = max.min(have);
            let start = ra.ofs as usize;
            ra.ofs += take;
            if ra.ofs == ra.len {
                ra.ofs = 0;
                ra.len = 0;
            }
            (start, start + take as usize)
        };
        Ok(&self.core().read_ahead.as_ref().unwrap().buf[start..end])
    }

    // --- write path ---

    /// The raw nonblocking write loop: `(written, completed)`.
    fn write_fd(&mut self, bytes: &[u8]) -> Result<(usize, bool)> {
        if self.core().closed {
            return Err(Error::internal("cannot write when closed"));
        }
        let fd = self.core().fd;
        let mut written = 0;
        while written < bytes.len() {
            match unistd::write(fd, &bytes[written..]) {
                Ok(0) => return Err(Error::GracefulClose("end of output stream")),
                Ok(n) => {
                    written += n;
                    let core = self.core_mut();
                    core.bytes_written = core.bytes_written.saturating_add(n as u32);
                }
                Err(err) => {
                    let errno = errno(err);
                    if errno == Errno::EAGAIN {
                        return Ok((written, false));
                    }
                    if errno == Errno::EINTR {
                        continue;
                    }
                    return Err(Error::c("async_write()", errno, file!(), line!()));
                }
            }
        }
        Ok((written, true))
    }

    /// Queue a segment, attempting a synchronous write first when nothing
    /// else is pending. Delivery order is strictly FIFO.
    pub fn async_write_out(&mut self, mut seg: Out) -> Result<()> {
        if seg.is_done() {
            return Ok(());
        }
        if !self.core().out.is_empty() {
            self.core_mut().out.push_back(seg);
            return Ok(());
        }
        let (n, complete) = self.write_fd(seg.pending())?;
        seg.advance(n);
        if !complete {
            self.core_mut().out.push_back(seg);
            self.schedule(Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Queue statically borrowed bytes.
    pub fn async_write(&mut self, bytes: &'static [u8]) -> Result<()> {
        self.async_write_out(Out::from_static(bytes))
    }

    pub fn async_write_str(&mut self, s: &'static str) -> Result<()> {
        self.async_write_out(Out::from_static(s.as_bytes()))
    }

    /// Write `bytes`, copying only whatever the synchronous attempt could
    /// not push out.
    pub fn async_write_cpy(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if !self.core().out.is_empty() {
            self.core_mut().out.push_back(Out::from_vec(bytes.to_vec()));
            return Ok(());
        }
        let (written, complete) = self.write_fd(bytes)?;
        if !complete {
            self.core_mut()
                .out
                .push_back(Out::from_vec(bytes[written..].to_vec()));
            self.schedule(Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Write formatted text: `task.async_printf(format_args!(...))`.
    pub fn async_printf(&mut self, args: fmt::Arguments) -> Result<()> {
        let mut buf = Buffer::new();
        if fmt::Write::write_fmt(&mut buf, args).is_err() {
            return Err(Error::internal("format failed"));
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.async_write_out(Out::from_buffer(buf))
    }

    /// Drain the outbound FIFO as far as the descriptor allows.
    fn drain_out(&mut self) -> Result<()> {
        loop {
            let mut seg = match self.core_mut().out.pop_front() {
                Some(seg) => seg,
                None => break,
            };
            match self.write_fd(seg.pending()) {
                Ok((n, complete)) => {
                    seg.advance(n);
                    if !complete {
                        self.core_mut().out.push_front(seg);
                        return Ok(());
                    }
                    // completed segment drops here, releasing its bytes
                }
                Err(err) => {
                    self.core_mut().out.push_front(seg);
                    return Err(err);
                }
            }
        }
        self.unschedule(Interest::WRITABLE)?;
        if let Some(reason) = self.core().half_close {
            return Err(Error::GracefulClose(reason));
        }
        Ok(())
    }

    // --- dispatch ---

    /// One readiness dispatch: the per-task state machine of the runtime.
    pub(crate) fn run(&mut self, logic: &mut dyn Task, events: Interest) -> Result<()> {
        if events.intersects(Interest::HUP | Interest::ERROR) {
            self.core_mut().end_of_input = true;
            logic.disconnected(self)?;
            self.close_fd();
            return Ok(());
        }
        if events.intersects(!(Interest::READABLE | Interest::WRITABLE)) {
            return Err(Error::internal("unexpected event"));
        }
        if self.core().half_close.is_none() && events.contains(Interest::READABLE) {
            {
                let now = self.sched.now();
                let core = self.core_mut();
                if core.timeout.read.due.is_set() {
                    core.timeout.read.due = now + core.timeout.read.duration;
                }
                core.sated = false;
            }
            match logic.read(self) {
                Ok(()) => {
                    let core = self.core();
                    if !core.sated && core.interest.contains(Interest::EDGE | Interest::READABLE) {
                        return Err(Error::internal("not sated"));
                    }
                }
                Err(Error::HalfClose(reason)) => {
                    self.core_mut().sated = true;
                    if self.core().out.is_empty() {
                        return Err(Error::HalfClose(reason));
                    }
                    info!("{}{}", self.context(), reason);
                    self.unschedule(Interest::READABLE)?;
                    let _ = socket::shutdown(self.core().fd, socket::Shutdown::Read);
                    self.core_mut().half_close = Some(reason);
                }
                Err(err) => return Err(err),
            }
            self.core_mut().sated = true;
        }
        if events.contains(Interest::WRITABLE) {
            {
                let now = self.sched.now();
                let core = self.core_mut();
                if core.timeout.write.due.is_set() {
                    core.timeout.write.due = now + core.timeout.write.duration;
                }
            }
            self.drain_out()?;
        }
        let id = self.id;
        self.sched.resched_after_run(id);
        Ok(())
    }
}

/// Switch a descriptor to nonblocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let old = check!(fcntl(fd, FcntlArg::F_GETFL), "fcntl(F_GETFL)");
    let flags = OFlag::from_bits_truncate(old) | OFlag::O_NONBLOCK;
    check!(fcntl(fd, FcntlArg::F_SETFL(flags)), "fcntl(F_SETFL)");
    Ok(())
}

/// Mark a descriptor close-on-exec. This is a descriptor flag, not a status
/// flag, so it goes through `F_SETFD`.
pub fn set_cloexec(fd: RawFd) -> Result<()> {
    check!(
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)),
        "fcntl(F_SETFD)"
    );
    Ok(())
}

/// Toggle `TCP_NODELAY`.
pub fn set_nodelay(fd: RawFd, enabled: bool) -> Result<()> {
    check!(
        socket::setsockopt(fd, sockopt::TcpNoDelay, &enabled),
        "setsockopt(TCP_NODELAY)"
    );
    Ok(())
}
