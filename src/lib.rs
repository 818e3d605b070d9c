//! Inferior-control engine for a Linux x86-64 source-level debugger.
//!
//! Driving a debuggee with `ptrace(2)` means interpreting a stream of
//! `wait(2)` statuses whose meaning depends on what the debugger itself did
//! last: an `int3` patch moves the PC one byte past the breakpoint, a
//! single-step over a patched instruction must happen with the patch
//! removed, syscall-stops arrive in indistinguishable entry/exit pairs, and
//! debug-register hits have to be attributed back to whichever stoppoint
//! owns the slot. Quarry hides that bookkeeping behind a [`Process`] that
//! reports settled, attributed [stop reasons](StopReason) and nothing else.
//!
//! A [`Process`] is created by [launching](Process::launch) a fresh inferior
//! or [attaching](Process::attach) to a running one. It owns a full shadow
//! of the inferior's [registers](Registers), a collection of
//! [breakpoint sites](BreakpointSite) and [watchpoints](Watchpoint), and a
//! [syscall catch policy](SyscallCatchPolicy). An [`Elf`] reader parses the
//! target image independently and translates between file-relative and
//! run-time addresses once its load bias is known.

#[macro_use]
pub mod error;

pub mod breakpoint;
pub mod elf;
pub mod process;
pub mod registers;
pub mod stoppoint;
pub mod syscall;
pub mod types;
pub mod watchpoint;

mod pipe;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use process::{HardwareStoppoint, Process, ProcessState, StopReason, TrapType};

#[doc(inline)]
pub use registers::{
    register_catalog, register_info_by_dwarf, register_info_by_id, register_info_by_name,
    FromRegisterValue, RegisterFormat, RegisterId, RegisterInfo, RegisterType, RegisterValue,
    Registers,
};

#[doc(inline)]
pub use breakpoint::BreakpointSite;

#[doc(inline)]
pub use watchpoint::Watchpoint;

#[doc(inline)]
pub use stoppoint::{Stoppoint, StoppointCollection, StoppointId};

#[doc(inline)]
pub use syscall::{SyscallCatchPolicy, SyscallData, SyscallInfo};

#[doc(inline)]
pub use types::{FileAddr, FileOffset, StoppointMode, VirtAddr};

#[doc(inline)]
pub use elf::Elf;

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// System call number.
pub use syscalls::Sysno;
