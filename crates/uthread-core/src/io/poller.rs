//! Kernel readiness collaborator.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::errno;

/// Direction a thread waits on. Each direction has its own descriptor claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }

    const fn poll_events(self) -> libc::c_short {
        match self {
            Self::Read => libc::POLLIN,
            Self::Write => libc::POLLOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRequest {
    pub fd: RawFd,
    pub interest: Interest,
    /// Set by the poller. Error and hangup conditions count as ready so the
    /// retried call reports them.
    pub ready: bool,
}

impl PollRequest {
    #[must_use]
    pub const fn new(fd: RawFd, interest: Interest) -> Self {
        Self {
            fd,
            interest,
            ready: false,
        }
    }
}

/// Waits for descriptor readiness on behalf of every blocked thread at once.
pub trait Poller {
    /// Block until a request is ready or `timeout` elapses (`None` waits
    /// forever; an empty request list just sleeps). Marks ready requests and
    /// returns how many there are, or the errno of the failed wait.
    fn poll(&mut self, requests: &mut [PollRequest], timeout: Option<Duration>) -> Result<usize, i32>;
}

/// `poll(2)`-backed poller.
#[derive(Debug, Default)]
pub struct SysPoller {
    fds: Vec<libc::pollfd>,
}

impl SysPoller {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Round up to whole milliseconds so a short deadline never becomes a spin.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.as_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl Poller for SysPoller {
    fn poll(&mut self, requests: &mut [PollRequest], timeout: Option<Duration>) -> Result<usize, i32> {
        self.fds.clear();
        self.fds.extend(requests.iter().map(|r| libc::pollfd {
            fd: r.fd,
            events: r.interest.poll_events(),
            revents: 0,
        }));
        // SAFETY: `fds` holds exactly `len` initialized pollfd entries.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if rc < 0 {
            return Err(errno::last());
        }
        let mut ready = 0;
        for (req, pfd) in requests.iter_mut().zip(&self.fds) {
            req.ready = pfd.revents != 0;
            ready += usize::from(req.ready);
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_round_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(5))), 5);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
    }

    #[test]
    fn pipe_readiness() {
        let mut fds = [0; 2];
        // SAFETY: fds has room for two descriptors.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut poller = SysPoller::new();
        let mut reqs = [PollRequest::new(fds[0], Interest::Read), PollRequest::new(fds[1], Interest::Write)];
        assert_eq!(poller.poll(&mut reqs, Some(Duration::ZERO)), Ok(1));
        assert!(!reqs[0].ready);
        assert!(reqs[1].ready);

        // SAFETY: writing one byte from a valid buffer.
        assert_eq!(unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) }, 1);
        assert_eq!(poller.poll(&mut reqs, Some(Duration::ZERO)), Ok(2));
        assert!(reqs[0].ready);
        // SAFETY: closing descriptors we own.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn empty_poll_sleeps_for_the_timeout() {
        let start = std::time::Instant::now();
        assert_eq!(SysPoller::new().poll(&mut [], Some(Duration::from_millis(5))), Ok(0));
        assert!(start.elapsed() >= Duration::from_millis(4));
    }
}
