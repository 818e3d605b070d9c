//! Syscall catching: which boundaries to report, and what a reported
//! boundary carries.

use syscalls::Sysno;

/// Which syscall boundary stops are reported to the caller; the rest are
/// transparently resumed by the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SyscallCatchPolicy {
    #[default]
    None,
    Some(Vec<Sysno>),
    All,
}

impl SyscallCatchPolicy {
    pub fn catch_none() -> Self {
        Self::None
    }

    pub fn catch_some(to_catch: Vec<Sysno>) -> Self {
        Self::Some(to_catch)
    }

    pub fn catch_all() -> Self {
        Self::All
    }

    pub(crate) fn wants(&self, sysno: Sysno) -> bool {
        match self {
            Self::None => false,
            Self::Some(to_catch) => to_catch.contains(&sysno),
            Self::All => true,
        }
    }
}

/// Payload of a syscall boundary: the argument registers on entry, the
/// return value on exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallData {
    Args([u64; 6]),
    Ret(i64),
}

/// One reported syscall boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallInfo {
    pub sysno: Sysno,
    pub entry: bool,
    pub data: SyscallData,
}
