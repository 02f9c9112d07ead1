//! Per-descriptor shadow state.
//!
//! Each descriptor number gets an [`FdEntry`] the first time a wrapper sees
//! it: one claim slot per direction and the id of the open file description
//! it refers to. Descriptions carry the flags the user asked for and the
//! number of claims that currently force `O_NONBLOCK` on them, so the
//! user's mode comes back exactly when the last override ends, no matter
//! how many dup'd descriptors share the description.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Instant;

use super::Interest;
use crate::errno;
use crate::error::{Result, ThreadError};
use crate::sched::{Link, Runtime, SchedState, ThreadId, ThreadState, WaitKey, WakeReason};
use crate::trace::{self, TraceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Claim {
    holder: ThreadId,
    /// Whether this claim counts toward the description's overrides.
    overridden: bool,
}

#[derive(Debug)]
struct FdEntry {
    desc: u64,
    generation: u64,
    claims: [Option<Claim>; 2],
}

#[derive(Debug)]
struct Description {
    refs: usize,
    user_flags: libc::c_int,
    overrides: usize,
}

impl Description {
    fn user_nonblocking(&self) -> bool {
        self.user_flags & libc::O_NONBLOCK != 0
    }
}

pub(crate) enum ClaimAttempt {
    Granted { generation: u64, user_nonblocking: bool },
    Busy,
}

#[derive(Debug, Default)]
pub(crate) struct FdTable {
    runtime: u64,
    entries: HashMap<RawFd, FdEntry>,
    descs: HashMap<u64, Description>,
    next_desc: u64,
    next_generation: u64,
}

fn get_flags(fd: RawFd) -> Result<libc::c_int> {
    // SAFETY: F_GETFL takes no pointer argument.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(ThreadError::last_os_error());
    }
    Ok(flags)
}

fn set_flags(fd: RawFd, flags: libc::c_int) -> Result<()> {
    // SAFETY: F_SETFL takes an integer argument.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(ThreadError::last_os_error());
    }
    Ok(())
}

impl FdTable {
    pub fn for_runtime(runtime: u64) -> Self {
        Self {
            runtime,
            ..Self::default()
        }
    }

    /// Put the user's flags back. A failure leaves `O_NONBLOCK` set behind the
    /// user's back, so it is counted and traced even with tracing off.
    fn restore_flags(&self, fd: RawFd, flags: libc::c_int) -> bool {
        match set_flags(fd, flags) {
            Ok(()) => true,
            Err(err) => {
                trace::count_violation();
                trace::record(
                    self.runtime,
                    0,
                    TraceKind::Violation,
                    format!("fd {fd}: restoring user flags failed: {err}"),
                );
                false
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Look up `fd`, learning its flags from the kernel on first sight.
    fn ensure(&mut self, fd: RawFd) -> Result<&mut FdEntry> {
        if !self.entries.contains_key(&fd) {
            let flags = get_flags(fd)?;
            self.next_desc += 1;
            let desc = self.next_desc;
            self.descs.insert(
                desc,
                Description {
                    refs: 1,
                    user_flags: flags,
                    overrides: 0,
                },
            );
            let generation = self.bump_generation();
            self.entries.insert(
                fd,
                FdEntry {
                    desc,
                    generation,
                    claims: [None, None],
                },
            );
        }
        self.entries
            .get_mut(&fd)
            .ok_or(ThreadError::Os(errno::EBADF))
    }

    fn desc_mut(&mut self, id: u64) -> Result<&mut Description> {
        self.descs.get_mut(&id).ok_or(ThreadError::Os(errno::EBADF))
    }

    pub fn user_nonblocking(&mut self, fd: RawFd) -> Result<bool> {
        let desc = self.ensure(fd)?.desc;
        Ok(self.desc_mut(desc)?.user_nonblocking())
    }

    /// Force `O_NONBLOCK` on `fd`'s description unless the user already set
    /// it. Returns whether an override was counted.
    fn install_override(&mut self, fd: RawFd, desc: u64) -> Result<bool> {
        let d = self.desc_mut(desc)?;
        if d.user_nonblocking() {
            return Ok(false);
        }
        if d.overrides == 0 {
            set_flags(fd, d.user_flags | libc::O_NONBLOCK)?;
        }
        d.overrides += 1;
        Ok(true)
    }

    /// Drop one override; the last one restores the user's flags.
    fn remove_override(&mut self, fd: RawFd, desc: u64) {
        let Some(d) = self.descs.get_mut(&desc) else {
            return;
        };
        d.overrides = d.overrides.saturating_sub(1);
        if d.overrides == 0 {
            let flags = d.user_flags;
            self.restore_flags(fd, flags);
        }
    }

    pub fn try_claim(&mut self, fd: RawFd, interest: Interest, me: ThreadId) -> Result<ClaimAttempt> {
        let (held, desc, generation) = {
            let entry = self.ensure(fd)?;
            (entry.claims[interest.slot()], entry.desc, entry.generation)
        };
        match held {
            Some(c) if c.holder == me => Err(ThreadError::Deadlock),
            Some(_) => Ok(ClaimAttempt::Busy),
            None => {
                let overridden = self.install_override(fd, desc)?;
                if let Some(entry) = self.entries.get_mut(&fd) {
                    entry.claims[interest.slot()] = Some(Claim {
                        holder: me,
                        overridden,
                    });
                }
                let user_nonblocking = self.desc_mut(desc)?.user_nonblocking();
                Ok(ClaimAttempt::Granted {
                    generation,
                    user_nonblocking,
                })
            }
        }
    }

    /// After a hand-off wake: the claim `me` now holds, if it survived.
    pub fn claim_held_by(&mut self, fd: RawFd, interest: Interest, me: ThreadId) -> Option<(u64, bool)> {
        let entry = self.entries.get(&fd)?;
        let held = entry.claims[interest.slot()].is_some_and(|c| c.holder == me);
        let generation = entry.generation;
        let desc = entry.desc;
        if !held {
            return None;
        }
        let nonblocking = self.descs.get(&desc)?.user_nonblocking();
        Some((generation, nonblocking))
    }

    /// Whether `me` still holds the claim it was granted at `generation`.
    /// False once `close` or `dup2` has revoked the number, even if the
    /// number has since been reused.
    pub fn claim_current(&self, fd: RawFd, interest: Interest, generation: u64, me: ThreadId) -> bool {
        self.entries.get(&fd).is_some_and(|e| {
            e.generation == generation && e.claims[interest.slot()].is_some_and(|c| c.holder == me)
        })
    }

    /// Give up a claim: the next queued thread gets it directly, and the
    /// override count follows the claim.
    pub fn release(&mut self, fd: RawFd, interest: Interest, generation: u64, st: &mut SchedState) {
        let Some(entry) = self.entries.get(&fd) else {
            return;
        };
        if entry.generation != generation {
            // Revoked already; its override was settled then.
            return;
        }
        let desc = entry.desc;
        let Some(old) = entry.claims[interest.slot()] else {
            return;
        };
        let next = st.wake_first(WaitKey::FdClaim(fd, interest), WakeReason::Handoff);
        let granted = next.map(|holder| Claim {
            holder,
            overridden: self.install_override(fd, desc).unwrap_or(false),
        });
        if let Some(entry) = self.entries.get_mut(&fd) {
            entry.claims[interest.slot()] = granted;
        }
        if old.overridden {
            self.remove_override(fd, desc);
        }
    }

    /// Tear down `fd`'s shadow state before the descriptor is closed or
    /// replaced. Claim holders and queued claimants wake with `Revoked`.
    pub fn revoke(&mut self, fd: RawFd, st: &mut SchedState) -> usize {
        let Some(entry) = self.entries.remove(&fd) else {
            return 0;
        };
        let mut woken = 0;
        for (slot, claim) in entry.claims.iter().enumerate() {
            let Some(claim) = claim else { continue };
            let interest = if slot == 0 { Interest::Read } else { Interest::Write };
            woken += st.wake_all(WaitKey::FdClaim(fd, interest), WakeReason::Revoked);
            let parked = st.tcb(claim.holder).is_some_and(|t| {
                t.state == ThreadState::BlockedOnIo && t.link == Link::Io(fd, interest)
            });
            if parked {
                st.wake(claim.holder, WakeReason::Revoked);
                woken += 1;
            }
            if claim.overridden {
                self.remove_override(fd, entry.desc);
            }
        }
        if let Some(d) = self.descs.get_mut(&entry.desc) {
            d.refs -= 1;
            if d.refs == 0 {
                self.descs.remove(&entry.desc);
            }
        }
        if woken > 0 {
            let me = st.current;
            st.trace(me, TraceKind::Revoke, || format!("fd {fd}: {woken} woken"));
        }
        woken
    }

    /// `new` now refers to the same open file description as `old`.
    pub fn alias(&mut self, old: RawFd, new: RawFd) -> Result<()> {
        let desc = self.ensure(old)?.desc;
        self.desc_mut(desc)?.refs += 1;
        let generation = self.bump_generation();
        self.entries.insert(
            new,
            FdEntry {
                desc,
                generation,
                claims: [None, None],
            },
        );
        Ok(())
    }

    /// Record the mode the user wants; apply it now unless an override is
    /// active, in which case it is applied when the override ends.
    pub fn set_user_nonblocking(&mut self, fd: RawFd, on: bool) -> Result<()> {
        let desc = self.ensure(fd)?.desc;
        let d = self.desc_mut(desc)?;
        if on {
            d.user_flags |= libc::O_NONBLOCK;
        } else {
            d.user_flags &= !libc::O_NONBLOCK;
        }
        let (flags, overridden) = (d.user_flags, d.overrides > 0);
        if !overridden {
            set_flags(fd, flags)?;
        }
        Ok(())
    }

    /// Runtime teardown: put every overridden description back through the
    /// first descriptor number that still accepts it.
    pub fn restore_all(&mut self) {
        for (id, d) in &self.descs {
            if d.overrides == 0 {
                continue;
            }
            let restored = self
                .entries
                .iter()
                .filter(|(_, e)| e.desc == *id)
                .any(|(fd, _)| set_flags(*fd, d.user_flags).is_ok());
            if !restored {
                trace::count_violation();
                trace::record(
                    self.runtime,
                    0,
                    TraceKind::Violation,
                    format!("description {id}: user flags not restored at teardown"),
                );
            }
        }
        self.entries.clear();
        self.descs.clear();
    }

    #[cfg(test)]
    fn overrides_of(&self, fd: RawFd) -> Option<usize> {
        let entry = self.entries.get(&fd)?;
        Some(self.descs.get(&entry.desc)?.overrides)
    }
}

/// RAII claim on one direction of a descriptor. Dropping it passes the
/// claim on or restores the descriptor's mode, including on early returns
/// and unwinds.
pub(crate) struct FdClaim {
    rt: &'static Runtime,
    fd: RawFd,
    interest: Interest,
    generation: u64,
    pub user_nonblocking: bool,
}

impl FdClaim {
    /// Whether the descriptor number still names the file this claim was
    /// taken on. Checked after every wake, before touching `fd` again.
    pub fn is_current(&self) -> bool {
        let me = self.rt.current_id();
        self.rt
            .fds
            .lock()
            .claim_current(self.fd, self.interest, self.generation, me)
    }
}

impl Drop for FdClaim {
    fn drop(&mut self) {
        let mut fds = self.rt.fds.lock();
        let mut st = self.rt.sched.lock();
        fds.release(self.fd, self.interest, self.generation, &mut st);
    }
}

/// Claim `interest` on `fd` for the running thread, queueing FIFO behind the
/// current holder.
pub(crate) fn claim(
    rt: &'static Runtime,
    fd: RawFd,
    interest: Interest,
    deadline: Option<Instant>,
) -> Result<FdClaim> {
    loop {
        let mut fds = rt.fds.lock();
        let me = rt.current_id();
        match fds.try_claim(fd, interest, me)? {
            ClaimAttempt::Granted {
                generation,
                user_nonblocking,
            } => {
                return Ok(FdClaim {
                    rt,
                    fd,
                    interest,
                    generation,
                    user_nonblocking,
                });
            }
            ClaimAttempt::Busy => {
                let st = rt.sched.lock();
                drop(fds);
                let key = WaitKey::FdClaim(fd, interest);
                match rt.park(st, ThreadState::BlockedOnIo, Link::Wait(key), deadline) {
                    WakeReason::Handoff => {
                        let held = rt.fds.lock().claim_held_by(fd, interest, me);
                        if let Some((generation, user_nonblocking)) = held {
                            return Ok(FdClaim {
                                rt,
                                fd,
                                interest,
                                generation,
                                user_nonblocking,
                            });
                        }
                    }
                    WakeReason::TimedOut => return Err(ThreadError::TimedOut),
                    WakeReason::Revoked => return Err(ThreadError::Os(errno::EBADF)),
                    WakeReason::Canceled => rt.cancel_point(),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SysPoller;
    use crate::signal::SigSet;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        // SAFETY: room for two descriptors.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        // SAFETY: test-owned descriptor.
        unsafe { libc::close(fd) };
    }

    fn nonblocking(fd: RawFd) -> bool {
        get_flags(fd).unwrap() & libc::O_NONBLOCK != 0
    }

    fn sched() -> SchedState {
        SchedState::new(0, false, Box::new(SysPoller::new()), SigSet::empty())
    }

    #[test]
    fn claim_overrides_and_release_restores() {
        let (r, w) = pipe();
        let mut table = FdTable::for_runtime(0);
        let mut st = sched();
        let me = st.current;
        let ClaimAttempt::Granted { generation, user_nonblocking } =
            table.try_claim(r, Interest::Read, me).unwrap()
        else {
            panic!("claim should be free");
        };
        assert!(!user_nonblocking);
        assert!(nonblocking(r));
        assert_eq!(table.overrides_of(r), Some(1));
        table.release(r, Interest::Read, generation, &mut st);
        assert!(!nonblocking(r));
        assert_eq!(table.overrides_of(r), Some(0));
        close(r);
        close(w);
    }

    #[test]
    fn second_claim_same_direction_is_busy() {
        let (r, w) = pipe();
        let mut table = FdTable::for_runtime(0);
        let st = sched();
        let me = st.current;
        assert!(matches!(table.try_claim(r, Interest::Read, me), Ok(ClaimAttempt::Granted { .. })));
        assert!(matches!(table.try_claim(r, Interest::Read, me), Err(ThreadError::Deadlock)));
        assert!(matches!(table.try_claim(r, Interest::Write, me), Ok(ClaimAttempt::Granted { .. })));
        // Both directions share one description: one flag flip, two overrides.
        assert_eq!(table.overrides_of(r), Some(2));
        close(r);
        close(w);
    }

    #[test]
    fn user_nonblocking_mode_is_left_alone() {
        let (r, w) = pipe();
        let mut table = FdTable::for_runtime(0);
        let mut st = sched();
        let me = st.current;
        table.set_user_nonblocking(r, true).unwrap();
        let ClaimAttempt::Granted { generation, user_nonblocking } =
            table.try_claim(r, Interest::Read, me).unwrap()
        else {
            panic!("claim should be free");
        };
        assert!(user_nonblocking);
        assert_eq!(table.overrides_of(r), Some(0));
        table.release(r, Interest::Read, generation, &mut st);
        assert!(nonblocking(r));
        close(r);
        close(w);
    }

    #[test]
    fn mode_change_during_override_applies_afterwards() {
        let (r, w) = pipe();
        let mut table = FdTable::for_runtime(0);
        let mut st = sched();
        let me = st.current;
        let ClaimAttempt::Granted { generation, .. } = table.try_claim(r, Interest::Read, me).unwrap()
        else {
            panic!("claim should be free");
        };
        table.set_user_nonblocking(r, true).unwrap();
        table.release(r, Interest::Read, generation, &mut st);
        assert!(nonblocking(r));
        close(r);
        close(w);
    }

    #[test]
    fn revoke_restores_flags_and_invalidates_claim() {
        let (r, w) = pipe();
        let mut table = FdTable::for_runtime(0);
        let mut st = sched();
        let me = st.current;
        let ClaimAttempt::Granted { generation, .. } = table.try_claim(r, Interest::Read, me).unwrap()
        else {
            panic!("claim should be free");
        };
        table.revoke(r, &mut st);
        assert!(!nonblocking(r));
        // Stale release is a no-op even after the number is reused.
        table.alias(w, r).unwrap();
        table.release(r, Interest::Read, generation, &mut st);
        assert_eq!(table.overrides_of(r), Some(0));
        close(r);
        close(w);
    }

    #[test]
    fn aliases_share_a_description() {
        let (r, w) = pipe();
        let mut table = FdTable::for_runtime(0);
        let st = sched();
        let me = st.current;
        table.alias(r, 100).unwrap();
        assert!(matches!(table.try_claim(r, Interest::Read, me), Ok(ClaimAttempt::Granted { .. })));
        // The alias sees the shared override count.
        assert_eq!(table.overrides_of(100), Some(1));
        table.restore_all();
        assert!(!nonblocking(r));
        close(r);
        close(w);
    }

    #[test]
    fn failed_flag_restore_is_recorded() {
        const RUNTIME: u64 = u64::MAX - 3;
        const HIGH_FD: RawFd = 917;
        let (r, w) = pipe();
        // SAFETY: duplicating a test-owned descriptor onto an unused number.
        assert_eq!(unsafe { libc::dup2(r, HIGH_FD) }, HIGH_FD);
        let mut table = FdTable::for_runtime(RUNTIME);
        let mut st = sched();
        let me = st.current;
        let ClaimAttempt::Granted { generation, .. } =
            table.try_claim(HIGH_FD, Interest::Read, me).unwrap()
        else {
            panic!("claim should be free");
        };
        // Closed behind the table's back, so the restore cannot reach it.
        close(HIGH_FD);
        table.release(HIGH_FD, Interest::Read, generation, &mut st);
        let events = trace::events_for(RUNTIME);
        assert!(
            events
                .iter()
                .any(|e| e.kind == TraceKind::Violation && e.detail.contains("fd 917"))
        );
        close(r);
        close(w);
    }

    #[test]
    fn unknown_descriptor_reports_kernel_error() {
        let mut table = FdTable::for_runtime(0);
        let st = sched();
        assert!(matches!(
            table.try_claim(-1, Interest::Read, st.current),
            Err(ThreadError::Os(e)) if e == errno::EBADF
        ));
    }
}
