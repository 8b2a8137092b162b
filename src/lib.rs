//! Epollo is a small, single-threaded task runtime in the classic epoll
//! style.
//!
//! # Motivation
//!
//! Most asynchronous Rust is written against futures, and the machinery
//! behind a futures executor is considerable. A lot of network services
//! need much less: one thread, one readiness poll, and a set of tasks that
//! each own a file descriptor and get called back when it turns readable or
//! writable. Epollo is exactly that and nothing more.
//!
//! The runtime keeps the chores on its side of the line. A task says what
//! it wants to read and the runtime deals with `EWOULDBLOCK`, short reads,
//! read-ahead caching and orderly end-of-stream. A task queues bytes to
//! send and the runtime attempts the write immediately, buffers whatever
//! did not fit, drains it as the descriptor allows and keeps the writable
//! interest in sync with the queue. Read and write deadlines close idle
//! tasks, and closing is safe from anywhere, including from inside the
//! closing task's own callback.
//!
//! # Interface
//!
//! There is one central object, [`Scheduler`]. You implement [`Task`] for
//! each kind of descriptor you own, insert instances, and call
//! [`Scheduler::run`], which blocks dispatching events until no tasks
//! remain or something raises [`Error::Shutdown`]. Every `Task` hook gets a
//! [`Scope`], which is the whole per-task surface: the `async_read` family,
//! the `async_write` family, interest changes, timeouts and the close
//! cascade.
//!
//! Tasks form a tree: a task inserted with [`Scope::insert_child`] belongs
//! to its parent's family and the whole family closes together, whichever
//! member closes first.
//!
//! # Thread safety
//!
//! There is none, on purpose. The scheduler and every task live on one
//! thread; callbacks run to completion and nothing is locked. Run one
//! scheduler per thread if you need more.
//!
//! # Example
//!
//! A TCP service that greets back every line it receives:
//!
//! ```no_run
//! use std::os::unix::io::RawFd;
//!
//! use epollo::{Interest, Line, Listener, Result, Scheduler, Scope, Task};
//!
//! struct Greeter {
//!     fd: RawFd,
//!     line: Line<256>,
//! }
//!
//! impl Task for Greeter {
//!     fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
//!         task.set_fd(self.fd);
//!         task.set_read_timeout(30_000);
//!         task.schedule(Interest::READABLE | Interest::EDGE)
//!     }
//!
//!     fn read(&mut self, task: &mut Scope) -> Result<()> {
//!         while task.async_read_in(&mut self.line)? {
//!             task.async_printf(format_args!("hello, {}", self.line.as_str()))?;
//!             self.line.clear();
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut sched = Scheduler::new()?;
//!     let factory = Box::new(|scope: &mut Scope, fd: RawFd| {
//!         scope
//!             .insert(Box::new(Greeter {
//!                 fd,
//!                 line: Line::new(),
//!             }))
//!             .map(|_| ())
//!     });
//!     sched.insert(Box::new(Listener::new("greeter", 7000, factory, 128, true)))?;
//!     sched.run()
//! }
//! ```
//!
//! # Status
//!
//! The core loop, the read/write paths and the timeout machinery are
//! stable. Subprocess plumbing and richer protocol helpers live outside
//! this crate.

pub mod error;

mod callback_list;
mod listener;
mod out;
mod scheduler;
mod slots;
mod task;
mod time;

pub use crate::callback_list::{Callback, CallbackList};
pub use crate::error::{Error, Result};
pub use crate::listener::{Factory, Listener};
pub use crate::out::{extract_be, extract_le, Buffer, BufferReader, Out};
pub use crate::scheduler::{Scheduler, TaskId};
pub use crate::task::{
    set_cloexec, set_nodelay, set_nonblocking, Interest, Line, LogLevel, Scope, Task, Tick,
    SPAN_MAX,
};
pub use crate::time::MonoTime;
