//! Real blocking equivalents of the scheduler hooks
//!
//! These block the calling OS thread. The dispatcher falls back to them when no
//! hook applies, and they are the default bodies of the [`Scheduler`] hooks.
//! Scheduler implementations may also call them directly, e.g. to probe
//! readiness with a zero timeout from their event loop.
//!
//! [`Scheduler`]: crate::scheduler::Scheduler

use crate::error::Result;
use crate::resource::{Interest, Readiness, Resource};
use std::thread;
use std::time::{Duration, Instant};

/// Convert real-valued seconds into a wait duration
///
/// Negative and NaN values clamp to zero ("return immediately").
pub fn seconds(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Block until `resource` is readable
pub fn wait_readable(resource: &Resource) -> Result<()> {
    wait_any(resource, Interest::READABLE, None).map(|_| ())
}

/// Block until `resource` is writable
pub fn wait_writable(resource: &Resource) -> Result<()> {
    wait_any(resource, Interest::WRITABLE, None).map(|_| ())
}

/// Sleep the thread for `duration`, or until unparked when `None`
///
/// Returns the time actually slept.
pub fn sleep(duration: Option<Duration>) -> Result<Duration> {
    let start = Instant::now();
    match duration {
        Some(d) if d.is_zero() => {}
        Some(d) => thread::sleep(d),
        // Woken by `Thread::unpark`, the thread-level external wake signal
        None => thread::park(),
    }
    Ok(start.elapsed())
}

/// Block until one of `interest` occurs on `resource` or `timeout` elapses
///
/// A zero timeout probes readiness without waiting. When the event and the
/// deadline coincide, the event wins. An empty `interest` is satisfied at
/// once with `Readiness::Ready(Interest::empty())`.
#[cfg(unix)]
pub fn wait_any(
    resource: &Resource,
    interest: Interest,
    timeout: Option<Duration>,
) -> Result<Readiness> {
    use crate::error::Error;
    use std::io;

    if interest.is_empty() {
        return Ok(Readiness::Ready(Interest::empty()));
    }

    let mut events: libc::c_short = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::PRIORITY) {
        events |= libc::POLLPRI;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }

    // A deadline past the end of representable time is the same as none
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

    loop {
        let mut pfd = libc::pollfd {
            fd: resource.raw(),
            events,
            revents: 0,
        };
        let timeout_ms = match deadline {
            None => -1,
            Some(deadline) => poll_millis(deadline.saturating_duration_since(Instant::now())),
        };

        // SAFETY: `pfd` is a valid pollfd for the duration of the call
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        if rc == 0 {
            match deadline {
                Some(deadline) if Instant::now() < deadline => continue,
                _ => return Ok(Readiness::TimedOut),
            }
        }

        let revents = pfd.revents;
        if revents & libc::POLLNVAL != 0 {
            return Err(Error::InvalidResource(*resource));
        }

        let mut ready = Interest::empty();
        // Hangup and error wake both directions; the next I/O call reports the condition
        let broken = revents & (libc::POLLHUP | libc::POLLERR) != 0;
        if revents & libc::POLLIN != 0 || broken {
            ready |= Interest::READABLE;
        }
        if revents & libc::POLLPRI != 0 {
            ready |= Interest::PRIORITY;
        }
        if revents & libc::POLLOUT != 0 || broken {
            ready |= Interest::WRITABLE;
        }
        ready &= interest;

        if !ready.is_empty() {
            return Ok(Readiness::Ready(ready));
        }
        if broken {
            return Ok(Readiness::Ready(interest));
        }
    }
}

/// Block until one of `interest` occurs on `resource` or `timeout` elapses
#[cfg(not(unix))]
pub fn wait_any(
    _resource: &Resource,
    _interest: Interest,
    _timeout: Option<Duration>,
) -> Result<Readiness> {
    Err(crate::error::Error::Unsupported("readiness waits require a unix platform"))
}

/// Round a remaining duration up to whole milliseconds for poll(2)
#[cfg(unix)]
fn poll_millis(remaining: Duration) -> libc::c_int {
    let millis = remaining.as_nanos().div_ceil(1_000_000);
    libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
}
