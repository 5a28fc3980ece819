//! The cross-process write lock and the optimistic (seqlock) reader.
//!
//! Both operate purely against the buckets file's header slots
//! (`lock_pid`, `version`, `nextVersion`); they know nothing about entries,
//! buckets, or recovery -- those are layered on top in `table`. This keeps
//! the acquisition/escalation state machine testable in isolation, free of
//! entry/bucket-array concerns.

use std::sync::atomic::Ordering;

use slog::{warn, Logger};

use crate::error::{Error, Result};
use crate::header::{OFF_LOCK_PID, OFF_NEXT_VERSION, OFF_VERSION};
use crate::region::MappedRegion;

/// Spin iterations attempted before escalating to orphan detection (lock
/// acquisition) or write-lock recovery (seqlock reader).
const SPIN_THRESHOLD: u32 = 100;

/// The current process's identifier, as stored in `lock_pid`.
pub fn current_pid() -> i32 {
    std::process::id() as i32
}

/// Ask the OS whether `pid` still refers to a live process.
///
/// Uses `kill(pid, 0)`: no signal is sent, but the OS still performs the
/// existence/permission check, which is the standard Unix idiom for "is
/// this PID alive".
fn process_is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        true
    } else {
        // ESRCH: no such process. Anything else (e.g. EPERM, meaning the
        // process exists but we can't signal it) counts as alive.
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
}

/// Run `body(recover)` under the cross-process write lock.
///
/// `recover` is `true` iff this acquisition stole the lock from a dead
/// holder, in which case the caller is expected to run the recovery engine
/// before trusting on-disk state. `fix_versions` selects the release
/// semantics used by the seqlock reader's escalation path (see
/// `read_lock_if`): when true, release repairs `nextVersion := version`
/// instead of bumping `version`.
pub fn write_lock<T>(
    buckets: &MappedRegion,
    logger: &Logger,
    fix_versions: bool,
    body: impl FnOnce(bool) -> Result<T>,
) -> Result<T> {
    let self_pid = current_pid();
    let lock_pid = buckets.atomic_i32(OFF_LOCK_PID);

    let recover = match lock_pid.compare_exchange(0, self_pid, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => false,
        Err(_) => acquire_contended(buckets, logger, self_pid)?,
    };

    if !fix_versions {
        buckets
            .atomic_i64(OFF_NEXT_VERSION)
            .fetch_add(1, Ordering::AcqRel);
    }

    let _guard = ReleaseGuard {
        buckets,
        self_pid,
        fix_versions,
    };
    body(recover)
}

/// Spin, then escalate to orphan detection and lock theft.
fn acquire_contended(buckets: &MappedRegion, logger: &Logger, self_pid: i32) -> Result<bool> {
    let lock_pid = buckets.atomic_i32(OFF_LOCK_PID);
    let mut spins = 0u32;
    loop {
        if spins < SPIN_THRESHOLD {
            spins += 1;
            std::hint::spin_loop();
            if lock_pid
                .compare_exchange(0, self_pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(false);
            }
            continue;
        }

        let holder = lock_pid.load(Ordering::Acquire);
        if holder == 0 {
            spins = 0;
            continue;
        }

        let should_steal = if holder == self_pid {
            // Reentrant orphan: this process previously crashed out of a
            // write lock it held and is now re-acquiring without having
            // released it first. Only reachable via fault injection.
            true
        } else if !process_is_alive(holder) {
            warn!(logger, "stealing write lock from dead process"; "pid" => holder);
            true
        } else {
            false
        };

        if !should_steal {
            return Err(Error::LockHeld { pid: holder });
        }

        if lock_pid
            .compare_exchange(holder, self_pid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(true);
        }
        spins = 0;
    }
}

struct ReleaseGuard<'a> {
    buckets: &'a MappedRegion,
    self_pid: i32,
    fix_versions: bool,
}

impl<'a> Drop for ReleaseGuard<'a> {
    fn drop(&mut self) {
        // This guard is only ever used by `write_lock`, whose body never
        // panics (see its doc comment) -- the mutating table operations
        // that *do* inject panics for crash testing go through
        // `acquire_write_lock`/`release_write_lock` below instead, which
        // have no such guard. `release` here can therefore assume it is
        // always reached on a normal return.
        release(self.buckets, self.self_pid, self.fix_versions)
            .expect("pmap: write lock stolen before release (fatal)");
    }
}

/// Shared release logic: CAS `lock_pid` back to `0`, then repair
/// `nextVersion` (if `fix_versions`) or bump `version`.
///
/// If the release CAS observes a different holder, another process has
/// stolen the lock while the body was running and any further action here
/// is unsafe: the process must fail-fast. Returns `Error::Fatal` rather
/// than panicking directly so the caller decides how to fail-fast (abort,
/// log-and-exit, etc.); this is not a recoverable `Result` in the usual
/// sense.
fn release(buckets: &MappedRegion, self_pid: i32, fix_versions: bool) -> Result<()> {
    let lock_pid = buckets.atomic_i32(OFF_LOCK_PID);
    match lock_pid.compare_exchange(self_pid, 0, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            if fix_versions {
                let version = buckets.atomic_i64(OFF_VERSION).load(Ordering::Acquire);
                buckets
                    .atomic_i64(OFF_NEXT_VERSION)
                    .store(version, Ordering::Release);
            } else {
                buckets.atomic_i64(OFF_VERSION).fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
        }
        Err(other) => Err(Error::Fatal(format!(
            "write lock held by pid {} was stolen by pid {} before release -- process state is \
             no longer trustworthy",
            self_pid, other
        ))),
    }
}

/// Acquire the cross-process write lock with no automatic release.
///
/// Used by mutating table operations instead of `write_lock`, specifically
/// so that a `CrashPoint::hit` panic partway through the caller's body
/// leaves `lock_pid` pointing at this (now-dead) process: release is the
/// caller's explicit job (`release_write_lock`), and simply never runs if
/// the body unwinds first. That is what lets a fault-injection test
/// simulate the writing process being killed mid-operation without
/// actually forking a process for every scenario.
pub fn acquire_write_lock(buckets: &MappedRegion, logger: &Logger, fix_versions: bool) -> Result<bool> {
    let self_pid = current_pid();
    let lock_pid = buckets.atomic_i32(OFF_LOCK_PID);

    let recover = match lock_pid.compare_exchange(0, self_pid, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => false,
        Err(_) => acquire_contended(buckets, logger, self_pid)?,
    };

    if !fix_versions {
        buckets
            .atomic_i64(OFF_NEXT_VERSION)
            .fetch_add(1, Ordering::AcqRel);
    }
    Ok(recover)
}

/// Release a lock acquired by `acquire_write_lock`.
pub fn release_write_lock(buckets: &MappedRegion, fix_versions: bool) -> Result<()> {
    release(buckets, current_pid(), fix_versions)
}

/// Run `f` under the optimistic seqlock protocol, retrying on version
/// drift and escalating to a recovery-only write lock after
/// `SPIN_THRESHOLD` mismatches.
///
/// `recover` is invoked (under the write lock, with `fix_versions = true`)
/// once escalation triggers; it should be `table::recover`, which is a
/// no-op when `recoveryFlags == 0`. This is what lets a reader that merely
/// observed an orphaned writer converge without itself becoming a writer
/// of the map's logical contents.
pub fn read_lock_if<T>(
    buckets: &MappedRegion,
    logger: &Logger,
    mut recover: impl FnMut() -> Result<()>,
    mut f: impl FnMut() -> T,
) -> Result<T> {
    let mut spins = 0u32;
    loop {
        let v1 = buckets.atomic_i64(OFF_VERSION).load(Ordering::Acquire);
        let result = f();
        let v2 = buckets.atomic_i64(OFF_NEXT_VERSION).load(Ordering::Acquire);
        if v1 == v2 {
            return Ok(result);
        }

        spins += 1;
        if spins >= SPIN_THRESHOLD {
            write_lock(buckets, logger, true, |_recovered| recover())?;
            spins = 0;
        } else {
            std::hint::spin_loop();
        }
    }
}
