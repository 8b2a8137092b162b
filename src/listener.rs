//! The accepting side of a TCP service.
//!
//! A [`Listener`] is an ordinary task watching a listening socket with
//! level-triggered readable interest. Each accepted descriptor is handed to
//! a caller-supplied factory, which normally builds the connection task for
//! it. Trouble on a single accept is contained: the listener logs it and
//! keeps listening.

use std::os::unix::io::RawFd;

use log::{error, info};
use nix::errno::Errno;
use nix::sys::socket::{
    self, sockopt, AddressFamily, InetAddr, IpAddr, SockAddr, SockFlag, SockType,
};
use nix::unistd;

use crate::check;
use crate::error::{errno, Error, Result};
use crate::task::{Interest, Scope, Task};

/// Builds the task owning one accepted descriptor. Runs with the listener's
/// scope, so it can [`Scope::insert`] the new task (connections are roots of
/// their own families, not children of the listener).
pub type Factory = Box<dyn FnMut(&mut Scope, RawFd) -> Result<()>>;

pub struct Listener {
    name: &'static str,
    port: u16,
    factory: Factory,
    backlog: usize,
    reuse_addr: bool,
}

impl Listener {
    pub fn new(
        name: &'static str,
        port: u16,
        factory: Factory,
        backlog: usize,
        reuse_addr: bool,
    ) -> Listener {
        Listener {
            name,
            port,
            factory,
            backlog,
            reuse_addr,
        }
    }
}

impl Task for Listener {
    fn do_construct(&mut self, task: &mut Scope) -> Result<()> {
        let fd = check!(
            socket::socket(
                AddressFamily::Inet,
                SockType::Stream,
                SockFlag::empty(),
                None
            ),
            "socket()"
        );
        task.set_fd(fd);
        if self.reuse_addr {
            check!(
                socket::setsockopt(fd, sockopt::ReuseAddr, &true),
                "setsockopt(SO_REUSEADDR)"
            );
        }
        let addr = SockAddr::new_inet(InetAddr::new(IpAddr::new_v4(0, 0, 0, 0), self.port));
        check!(socket::bind(fd, &addr), "bind()");
        check!(socket::listen(fd, self.backlog), "listen()");
        task.schedule(Interest::READABLE)?; // level-triggered
        info!("{} is listening on port {}...", self.name, self.port);
        Ok(())
    }

    fn read(&mut self, task: &mut Scope) -> Result<()> {
        loop {
            let accepted = match socket::accept(task.fd()) {
                Ok(fd) => fd,
                Err(err) => {
                    let errno = errno(err);
                    if errno == Errno::EAGAIN || errno == Errno::ECONNABORTED {
                        return Ok(());
                    }
                    if errno == Errno::EINTR {
                        continue;
                    }
                    // whatever went wrong, we do not stop listening
                    if errno == Errno::ENFILE || errno == Errno::EMFILE {
                        error!("{}not enough fds to accept", task.context());
                    } else {
                        error!(
                            "{}{}",
                            task.context(),
                            Error::c("accept()", errno, file!(), line!())
                        );
                    }
                    return Ok(());
                }
            };
            if let Err(err) = (self.factory)(task, accepted) {
                if let Error::Shutdown(_) = err {
                    return Err(err);
                }
                error!("{}{}", task.context(), err);
                // nobody took ownership of the descriptor
                let _ = unistd::close(accepted);
                return Ok(());
            }
        }
    }

    fn dump_context(&self) -> Option<String> {
        Some(format!("Listener[{}@{}] ", self.name, self.port))
    }
}
