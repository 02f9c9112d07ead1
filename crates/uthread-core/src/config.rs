//! Runtime configuration.
//!
//! Settings come from [`RuntimeConfig`] values built in code, or from the
//! environment through [`RuntimeConfig::from_env`]:
//! - `UTHREAD_STACK_SIZE`: default stack size in bytes (`k`/`m` suffixes).
//! - `UTHREAD_SPIN`: bounded spin attempts before a mutex waiter parks.
//! - `UTHREAD_VIOLATIONS`: `report` (default) or `abort`.
//! - `UTHREAD_TRACE`: `1` records scheduler events into the trace ring.

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Result, ThreadError};

/// Default green-thread stack: 2 MiB.
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
/// Smallest stack a thread may be created with.
pub const MIN_STACK_SIZE: usize = 16 * 1024;
/// Guard page below each stack.
pub const DEFAULT_GUARD_SIZE: usize = 4096;
/// Default bounded spin before a contended mutex parks.
pub const DEFAULT_SPIN_LIMIT: u32 = 16;

pub const ENV_STACK_SIZE: &str = "UTHREAD_STACK_SIZE";
pub const ENV_SPIN: &str = "UTHREAD_SPIN";
pub const ENV_VIOLATIONS: &str = "UTHREAD_VIOLATIONS";
pub const ENV_TRACE: &str = "UTHREAD_TRACE";

/// What happens when a caller breaks a usage protocol.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationPolicy {
    /// Return the error code to the caller.
    #[default]
    Report,
    /// Record the violation, then abort the process.
    Abort,
}

impl ViolationPolicy {
    /// Parse from string (case-insensitive). Unknown values fall back to `Report`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" | "strict" | "debug" | "panic" => Self::Abort,
            _ => Self::Report,
        }
    }

    #[must_use]
    pub const fn aborts(self) -> bool {
        matches!(self, Self::Abort)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub stack_size: usize,
    pub guard_size: usize,
    pub spin_limit: u32,
    pub violations: ViolationPolicy,
    pub trace: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            guard_size: DEFAULT_GUARD_SIZE,
            spin_limit: DEFAULT_SPIN_LIMIT,
            violations: ViolationPolicy::Report,
            trace: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by whatever `UTHREAD_*` variables are set.
    /// Malformed values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self {
            violations: env_violation_policy(),
            ..Self::default()
        };
        if let Some(size) = std::env::var(ENV_STACK_SIZE).ok().and_then(|v| parse_size(&v)) {
            cfg.stack_size = size;
        }
        if let Some(spin) = std::env::var(ENV_SPIN).ok().and_then(|v| v.trim().parse().ok()) {
            cfg.spin_limit = spin;
        }
        if let Ok(v) = std::env::var(ENV_TRACE) {
            cfg.trace = matches!(v.trim(), "1" | "true" | "on" | "yes");
        }
        cfg
    }

    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    #[must_use]
    pub fn with_guard_size(mut self, bytes: usize) -> Self {
        self.guard_size = bytes;
        self
    }

    #[must_use]
    pub fn with_spin_limit(mut self, spins: u32) -> Self {
        self.spin_limit = spins;
        self
    }

    #[must_use]
    pub fn with_violations(mut self, policy: ViolationPolicy) -> Self {
        self.violations = policy;
        self
    }

    #[must_use]
    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }

    /// Reject settings that would otherwise be clamped silently.
    pub fn validate(&self) -> Result<()> {
        check_stack_size(self.stack_size)?;
        if self.guard_size % crate::stack::page_size() != 0 {
            return Err(ThreadError::InvalidArgument("guard size must be a multiple of the page size"));
        }
        Ok(())
    }
}

pub(crate) fn check_stack_size(bytes: usize) -> Result<()> {
    if bytes < MIN_STACK_SIZE {
        return Err(ThreadError::StackTooSmall {
            requested: bytes,
            minimum: MIN_STACK_SIZE,
        });
    }
    Ok(())
}

/// Parse `"65536"`, `"64k"`, `"2m"` into bytes.
#[must_use]
pub fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let (digits, scale) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], 1024),
        b'm' => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s.as_str(), 1),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}

// Env cache: 0=unresolved, 1=Report, 2=Abort, 255=resolving. A reentrant
// lookup during resolution sees RESOLVING and gets the default.
static CACHED_POLICY: AtomicU8 = AtomicU8::new(0);

const POLICY_UNRESOLVED: u8 = 0;
const POLICY_REPORT: u8 = 1;
const POLICY_ABORT: u8 = 2;
const POLICY_RESOLVING: u8 = 255;

fn policy_to_u8(policy: ViolationPolicy) -> u8 {
    match policy {
        ViolationPolicy::Report => POLICY_REPORT,
        ViolationPolicy::Abort => POLICY_ABORT,
    }
}

fn u8_to_policy(v: u8) -> ViolationPolicy {
    match v {
        POLICY_ABORT => ViolationPolicy::Abort,
        _ => ViolationPolicy::Report,
    }
}

/// Violation policy named by `UTHREAD_VIOLATIONS`, read once and cached.
#[must_use]
pub fn env_violation_policy() -> ViolationPolicy {
    let cached = CACHED_POLICY.load(Ordering::Relaxed);
    if cached == POLICY_RESOLVING {
        return ViolationPolicy::Report;
    }
    if cached != POLICY_UNRESOLVED {
        return u8_to_policy(cached);
    }
    if CACHED_POLICY
        .compare_exchange(
            POLICY_UNRESOLVED,
            POLICY_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return u8_to_policy(CACHED_POLICY.load(Ordering::Relaxed));
    }
    let policy = std::env::var(ENV_VIOLATIONS)
        .map(|v| ViolationPolicy::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_POLICY.store(policy_to_u8(policy), Ordering::Release);
    policy
}

thread_local! {
    static ACTIVE_POLICY: Cell<Option<ViolationPolicy>> = const { Cell::new(None) };
}

/// Pin the policy of the runtime running on this kernel thread.
pub(crate) fn set_active_policy(policy: Option<ViolationPolicy>) {
    ACTIVE_POLICY.with(|p| p.set(policy));
}

/// Policy of the active runtime, or the environment's outside one.
#[must_use]
pub fn current_violation_policy() -> ViolationPolicy {
    ACTIVE_POLICY
        .with(Cell::get)
        .unwrap_or_else(env_violation_policy)
}
