//! The inferior-control engine: launching and attaching, run control,
//! memory and register access, stoppoint installation, and precise stop
//! reporting.
//!
//! `ptrace(2)` hands the engine a stream of `wait(2)` statuses whose meaning
//! depends on context: what was requested, which stoppoints are installed,
//! and whether a syscall boundary was pending. [`Process::wait_on_signal`]
//! owns that interpretation and is the only place the process state
//! changes; resume-time step-overs and policy-filtered syscall stops are
//! hidden inside it so callers only ever observe settled stops.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::uio::{self, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use syscalls::Sysno;
use tracing::{debug, info, trace};

use crate::breakpoint::{BreakpointSite, INT3};
use crate::error::{Error, Result};
use crate::pipe::Pipe;
use crate::registers::{RegisterId, RegisterValue, Registers};
use crate::stoppoint::{Stoppoint, StoppointCollection, StoppointId};
use crate::syscall::{SyscallCatchPolicy, SyscallData, SyscallInfo};
use crate::types::{StoppointMode, VirtAddr};
use crate::watchpoint::Watchpoint;

const PAGE_SIZE: u64 = 0x1000;
const WORD: u64 = 8;

// si_code of a syscall-stop under PTRACE_O_TRACESYSGOOD
const TRAP_SYSCALL: i32 = libc::SIGTRAP | 0x80;

const SYSCALL_ARG_REGISTERS: [RegisterId; 6] = [
    RegisterId::rdi,
    RegisterId::rsi,
    RegisterId::rdx,
    RegisterId::r10,
    RegisterId::r8,
    RegisterId::r9,
];

/// Lifecycle state of the inferior as the engine knows it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running,
    Exited,
    Terminated,
}

/// Why a `SIGTRAP` stop happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapType {
    SingleStep,
    SoftwareBreak,
    HardwareBreak,
    Syscall,
    Unknown,
}

/// Why the inferior halted, as reported by [`Process::wait_on_signal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopReason {
    /// The state the inferior transitioned to.
    pub reason: ProcessState,
    /// Signal number while stopped or terminated, exit code when exited.
    pub info: u8,
    /// Trap attribution, present for `SIGTRAP`-family stops.
    pub trap_reason: Option<TrapType>,
    /// Present when this stop is a syscall boundary.
    pub syscall_info: Option<SyscallInfo>,
}

impl StopReason {
    fn from_wait_status(status: WaitStatus) -> Result<Self> {
        let (reason, info) = match status {
            WaitStatus::Exited(_, code) => (ProcessState::Exited, code as u8),
            WaitStatus::Signaled(_, sig, _) => (ProcessState::Terminated, sig as u8),
            WaitStatus::Stopped(_, sig) => (ProcessState::Stopped, sig as u8),
            WaitStatus::PtraceSyscall(_) => (ProcessState::Stopped, Signal::SIGTRAP as u8),
            other => internal_error!("unexpected wait status {other:?}"),
        };
        Ok(Self {
            reason,
            info,
            trap_reason: None,
            syscall_info: None,
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.reason == ProcessState::Stopped
    }
}

/// Identity of the debug-register stoppoint that caused the current stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HardwareStoppoint {
    Breakpoint(StoppointId),
    Watchpoint(StoppointId),
}

/// A traced inferior and everything the engine knows about it.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    terminate_on_end: bool,
    is_attached: bool,
    state: ProcessState,
    pending_signal: Option<Signal>,
    registers: Registers,
    breakpoint_sites: StoppointCollection<BreakpointSite>,
    watchpoints: StoppointCollection<Watchpoint>,
    syscall_catch_policy: SyscallCatchPolicy,
    expecting_syscall_exit: bool,
    next_stoppoint_id: StoppointId,
}

impl Process {
    fn new(pid: Pid, terminate_on_end: bool, is_attached: bool) -> Self {
        Self {
            pid,
            terminate_on_end,
            is_attached,
            state: ProcessState::Stopped,
            pending_signal: None,
            registers: Registers::new(pid),
            breakpoint_sites: StoppointCollection::new(),
            watchpoints: StoppointCollection::new(),
            syscall_catch_policy: SyscallCatchPolicy::default(),
            expecting_syscall_exit: false,
            next_stoppoint_id: 0,
        }
    }

    /// Fork and exec `path` as a traced inferior.
    ///
    /// The child disables address-space randomization, optionally replaces
    /// its stdout, requests tracing when `debug` is set, and reports any
    /// pre-exec failure back through a CLOEXEC pipe.
    pub fn launch(
        path: impl AsRef<Path>,
        debug: bool,
        stdout_replacement: Option<OwnedFd>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut channel = Pipe::new(true)?;

        // SAFETY: the child branch runs only fork-safe syscalls plus the
        // formatting of one error message before `_exit`; it never returns
        // into the caller's stack.
        match unsafe { unistd::fork() }.map_err(|source| Error::Os {
            context: "fork",
            source,
        })? {
            ForkResult::Child => exec_child(&path, debug, stdout_replacement, channel),
            ForkResult::Parent { child } => {
                channel.close_write();
                let data = channel.read_to_end()?;
                if !data.is_empty() {
                    let _ = waitpid(child, None);
                    let message = String::from_utf8_lossy(&data).into_owned();
                    return Err(Error::Launch { path, message });
                }

                info!(pid = child.as_raw(), path = %path.display(), "launched inferior");

                let mut process = Self::new(child, true, debug);
                if debug {
                    process.wait_on_signal()?;
                    process.set_trace_options()?;
                } else {
                    process.state = ProcessState::Running;
                }
                Ok(process)
            }
        }
    }

    /// Attach to an already-running process.
    pub fn attach(pid: Pid) -> Result<Self> {
        if pid.as_raw() == 0 {
            return Err(Error::InvalidPid { pid: 0 });
        }
        ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;

        info!(pid = pid.as_raw(), "attached to inferior");

        let mut process = Self::new(pid, false, true);
        process.wait_on_signal()?;
        process.set_trace_options()?;
        Ok(process)
    }

    fn set_trace_options(&self) -> Result<()> {
        ptrace::setoptions(self.pid, ptrace::Options::PTRACE_O_TRACESYSGOOD).map_err(|source| {
            Error::Ptrace {
                request: "SETOPTIONS",
                pid: self.pid,
                source,
            }
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn get_registers(&self) -> &Registers {
        &self.registers
    }

    pub fn get_registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn get_pc(&self) -> Result<VirtAddr> {
        Ok(VirtAddr::new(
            self.registers.read_by_id_as::<u64>(RegisterId::rip)?,
        ))
    }

    pub fn set_pc(&mut self, address: VirtAddr) -> Result<()> {
        self.registers
            .write_by_id(RegisterId::rip, RegisterValue::U64(address.addr()))
    }

    pub fn set_syscall_catch_policy(&mut self, policy: SyscallCatchPolicy) {
        self.syscall_catch_policy = policy;
    }

    pub fn breakpoint_sites(&self) -> &StoppointCollection<BreakpointSite> {
        &self.breakpoint_sites
    }

    pub fn watchpoints(&self) -> &StoppointCollection<Watchpoint> {
        &self.watchpoints
    }

    /// Continue the inferior.
    ///
    /// If an enabled stoppoint sits at the current PC, the engine first
    /// steps past it with the stoppoint disabled; that intermediate stop is
    /// consumed internally and never reported.
    pub fn resume(&mut self) -> Result<()> {
        let pc = self.get_pc()?;
        let step_over = self
            .breakpoint_sites
            .get_by_address(pc)
            .filter(|site| site.is_enabled())
            .map(|site| site.id());
        if let Some(id) = step_over {
            self.disable_breakpoint_site(id)?;
            ptrace::step(self.pid, None).map_err(|source| Error::Resume {
                pid: self.pid,
                source,
            })?;
            waitpid(self.pid, None).map_err(|source| Error::Wait {
                pid: self.pid,
                source,
            })?;
            self.enable_breakpoint_site(id)?;
        }

        let pending = self.pending_signal.take();
        let request = match self.syscall_catch_policy {
            SyscallCatchPolicy::None => {
                ptrace::cont(self.pid, pending)
            }
            _ => ptrace::syscall(self.pid, pending),
        };
        request.map_err(|source| Error::Resume {
            pid: self.pid,
            source,
        })?;

        self.state = ProcessState::Running;
        trace!(pid = self.pid.as_raw(), "resumed");
        Ok(())
    }

    /// Block until the inferior changes state and report why.
    ///
    /// This is the sole owner of the engine's state transitions. Stops the
    /// caller should not see (internal breakpoints, filtered syscall
    /// boundaries) are transparently resumed and the wait recurses.
    pub fn wait_on_signal(&mut self) -> Result<StopReason> {
        let status = waitpid(self.pid, None).map_err(|source| Error::Wait {
            pid: self.pid,
            source,
        })?;
        trace!(pid = self.pid.as_raw(), ?status, "wait status");

        let mut reason = StopReason::from_wait_status(status)?;
        self.state = reason.reason;
        debug!(pid = self.pid.as_raw(), state = ?self.state, "state transition");

        self.pending_signal = match status {
            // SIGTRAP belongs to the engine and SIGSTOP to attach/teardown;
            // anything else is redelivered on the next resume.
            WaitStatus::Stopped(_, sig) if sig != Signal::SIGTRAP && sig != Signal::SIGSTOP => {
                Some(sig)
            }
            _ => None,
        };

        if self.is_attached && self.state == ProcessState::Stopped {
            self.registers.read_all()?;

            // A software trap is delivered with the PC one past the int3;
            // rewind so the displaced instruction runs on the next resume.
            if matches!(status, WaitStatus::Stopped(_, Signal::SIGTRAP)) {
                let instruction_begin = self.get_pc()? - 1;
                let rewind = self
                    .breakpoint_sites
                    .get_by_address(instruction_begin)
                    .map(|site| site.is_enabled() && !site.is_hardware())
                    .unwrap_or(false);
                if rewind {
                    self.set_pc(instruction_begin)?;
                }
            }

            self.augment_stop_reason(&mut reason, status)?;

            match reason.trap_reason {
                Some(TrapType::SoftwareBreak) => {
                    let pc = self.get_pc()?;
                    let internal = self
                        .breakpoint_sites
                        .get_by_address(pc)
                        .map(|site| site.is_internal())
                        .unwrap_or(false);
                    if internal {
                        self.resume()?;
                        return self.wait_on_signal();
                    }
                }
                Some(TrapType::Syscall) => {
                    return self.maybe_resume_from_syscall(reason);
                }
                _ => {}
            }
        }

        Ok(reason)
    }

    // Fill in trap attribution and syscall details for a trap stop.
    fn augment_stop_reason(&mut self, reason: &mut StopReason, status: WaitStatus) -> Result<()> {
        let is_trap_stop = matches!(
            status,
            WaitStatus::PtraceSyscall(_) | WaitStatus::Stopped(_, Signal::SIGTRAP)
        );
        if !is_trap_stop {
            self.expecting_syscall_exit = false;
            return Ok(());
        }

        let siginfo = ptrace::getsiginfo(self.pid).map_err(|source| Error::Ptrace {
            request: "GETSIGINFO",
            pid: self.pid,
            source,
        })?;

        if siginfo.si_code == TRAP_SYSCALL {
            reason.trap_reason = Some(TrapType::Syscall);
            let sysno = Sysno::from(self.registers.read_by_id_as::<u64>(RegisterId::orig_rax)? as i32);
            let info = if self.expecting_syscall_exit {
                self.expecting_syscall_exit = false;
                let ret = self.registers.read_by_id_as::<u64>(RegisterId::rax)? as i64;
                SyscallInfo {
                    sysno,
                    entry: false,
                    data: SyscallData::Ret(ret),
                }
            } else {
                self.expecting_syscall_exit = true;
                let mut args = [0u64; 6];
                for (arg, id) in args.iter_mut().zip(SYSCALL_ARG_REGISTERS) {
                    *arg = self.registers.read_by_id_as::<u64>(id)?;
                }
                SyscallInfo {
                    sysno,
                    entry: true,
                    data: SyscallData::Args(args),
                }
            };
            reason.syscall_info = Some(info);
            return Ok(());
        }
        self.expecting_syscall_exit = false;

        if siginfo.si_code == libc::TRAP_TRACE {
            reason.trap_reason = Some(TrapType::SingleStep);
            return Ok(());
        }

        let pc = self.get_pc()?;
        let software_break = self
            .breakpoint_sites
            .get_by_address(pc)
            .map(|site| site.is_enabled() && !site.is_hardware())
            .unwrap_or(false);
        if software_break {
            reason.trap_reason = Some(TrapType::SoftwareBreak);
            return Ok(());
        }

        let dr6 = self.registers.read_by_id_as::<u64>(RegisterId::dr6)?;
        if dr6 & 0b1111 != 0 {
            reason.trap_reason = Some(TrapType::HardwareBreak);
            if let HardwareStoppoint::Watchpoint(id) = self.get_current_hardware_stoppoint()? {
                self.refresh_watchpoint_data(id)?;
            }
            return Ok(());
        }

        reason.trap_reason = Some(TrapType::Unknown);
        Ok(())
    }

    // Resume transparently past syscall boundaries the policy does not want.
    fn maybe_resume_from_syscall(&mut self, reason: StopReason) -> Result<StopReason> {
        if let Some(info) = &reason.syscall_info {
            if !self.syscall_catch_policy.wants(info.sysno) {
                self.resume()?;
                return self.wait_on_signal();
            }
        }
        Ok(reason)
    }

    /// Execute exactly one instruction.
    ///
    /// An enabled stoppoint under the PC is disabled for the duration of
    /// the step and re-enabled afterwards.
    pub fn step_instruction(&mut self) -> Result<StopReason> {
        let pc = self.get_pc()?;
        let to_reenable = self
            .breakpoint_sites
            .get_by_address(pc)
            .filter(|site| site.is_enabled())
            .map(|site| site.id());
        if let Some(id) = to_reenable {
            self.disable_breakpoint_site(id)?;
        }

        ptrace::step(self.pid, None).map_err(|source| Error::Resume {
            pid: self.pid,
            source,
        })?;
        let reason = self.wait_on_signal()?;

        if let Some(id) = to_reenable {
            self.enable_breakpoint_site(id)?;
        }
        Ok(reason)
    }

    /// Read inferior memory with enabled software breakpoints hidden: any
    /// patched `int3` byte comes back as the original saved byte.
    pub fn read_memory(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>> {
        let mut memory = self.read_memory_without_traps(address, amount)?;
        if memory.is_empty() {
            return Ok(memory);
        }

        let high = address + (memory.len() as u64 - 1);
        for site in self.breakpoint_sites.get_in_range(address, high) {
            let (Some(saved), false) = (site.saved_data(), site.is_hardware()) else {
                continue;
            };
            if !site.is_enabled() {
                continue;
            }
            let offset = (site.address().addr() - address.addr()) as usize;
            memory[offset] = saved;
        }
        Ok(memory)
    }

    /// Read inferior memory exactly as mapped, patched trap bytes included.
    pub fn read_memory_without_traps(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>> {
        if amount == 0 {
            return Ok(Vec::new());
        }
        let remote = page_chunks(address.addr(), amount);
        let mut memory = vec![0u8; amount];
        let read = uio::process_vm_readv(
            self.pid,
            &mut [IoSliceMut::new(&mut memory)],
            &remote,
        )
        .map_err(|source| Error::MemoryRead { address, source })?;
        memory.truncate(read);
        Ok(memory)
    }

    /// Read a plain-old-data value out of inferior memory.
    pub fn read_memory_as<T: bytemuck::Pod>(&self, address: VirtAddr) -> Result<T> {
        let size = mem::size_of::<T>();
        let data = self.read_memory(address, size)?;
        if data.len() < size {
            return Err(Error::PartialTransfer {
                address,
                completed: data.len(),
                requested: size,
            });
        }
        Ok(bytemuck::pod_read_unaligned(&data))
    }

    /// Write inferior memory.
    ///
    /// Unaligned head and tail bytes are merged into their containing words
    /// and poked one word at a time (which also works on write-protected
    /// text pages); the aligned middle goes through the cross-memory
    /// interface. Not atomic: a partial failure reports the bytes written.
    pub fn write_memory(&mut self, address: VirtAddr, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let start = address.addr();
        let end = start + data.len() as u64;
        let mid_start = (start + WORD - 1) & !(WORD - 1);
        let mid_end = end & !(WORD - 1);

        if mid_start >= mid_end {
            return self.poke_bytes(start, data);
        }

        let head_len = (mid_start - start) as usize;
        let tail_start = (mid_end - start) as usize;

        self.poke_bytes(start, &data[..head_len])?;
        let middle = &data[head_len..tail_start];
        let written = self.vm_write(mid_start, middle)?;
        if written != middle.len() {
            return Err(Error::PartialTransfer {
                address,
                completed: head_len + written,
                requested: data.len(),
            });
        }
        self.poke_bytes(mid_end, &data[tail_start..])
    }

    // Word-at-a-time writes, merging with existing memory at the edges.
    fn poke_bytes(&self, start: u64, data: &[u8]) -> Result<()> {
        let mut addr = start;
        let mut remaining = data;
        while !remaining.is_empty() {
            let word_addr = addr & !(WORD - 1);
            let offset = (addr - word_addr) as usize;
            let len = remaining.len().min(8 - offset);

            let existing = ptrace::read(self.pid, word_addr as usize as ptrace::AddressType)
                .map_err(|source| Error::MemoryRead {
                    address: VirtAddr::new(word_addr),
                    source,
                })?;
            let mut word = (existing as u64).to_le_bytes();
            word[offset..offset + len].copy_from_slice(&remaining[..len]);

            ptrace::write(
                self.pid,
                word_addr as usize as ptrace::AddressType,
                i64::from_le_bytes(word) as libc::c_long,
            )
            .map_err(|source| Error::MemoryWrite {
                address: VirtAddr::new(word_addr),
                source,
            })?;

            addr += len as u64;
            remaining = &remaining[len..];
        }
        Ok(())
    }

    fn vm_write(&self, start: u64, data: &[u8]) -> Result<usize> {
        let remote = page_chunks(start, data.len());
        uio::process_vm_writev(self.pid, &[IoSlice::new(data)], &remote).map_err(|source| {
            Error::MemoryWrite {
                address: VirtAddr::new(start),
                source,
            }
        })
    }

    /// Peek one word of the kernel `user` area.
    pub fn peek_user_area(&self, offset: usize) -> Result<u64> {
        let word = ptrace::read_user(self.pid, offset as ptrace::AddressType).map_err(
            |source| Error::Ptrace {
                request: "PEEKUSER",
                pid: self.pid,
                source,
            },
        )?;
        Ok(word as u64)
    }

    /// Poke one word of the kernel `user` area.
    pub fn write_user_area(&mut self, offset: usize, data: u64) -> Result<()> {
        ptrace::write_user(
            self.pid,
            offset as ptrace::AddressType,
            data as libc::c_long,
        )
        .map_err(|source| Error::Ptrace {
            request: "POKEUSER",
            pid: self.pid,
            source,
        })
    }

    fn allocate_stoppoint_id(&mut self) -> StoppointId {
        self.next_stoppoint_id += 1;
        self.next_stoppoint_id
    }

    /// Register a breakpoint site. The site starts disabled.
    pub fn create_breakpoint_site(
        &mut self,
        address: VirtAddr,
        hardware: bool,
        internal: bool,
    ) -> Result<&BreakpointSite> {
        let id = self.allocate_stoppoint_id();
        debug!(
            pid = self.pid.as_raw(),
            id, %address, hardware, internal, "creating breakpoint site"
        );
        self.breakpoint_sites
            .push(BreakpointSite::new(id, address, hardware, internal))
            .map(|site| &*site)
    }

    pub fn enable_breakpoint_site(&mut self, id: StoppointId) -> Result<()> {
        let site = self
            .breakpoint_sites
            .get_by_id(id)
            .ok_or(Error::StoppointNotFound { id })?;
        if site.is_enabled() {
            return Ok(());
        }
        let (address, hardware) = (site.address(), site.is_hardware());

        if hardware {
            let slot = self.set_hardware_stoppoint(address, StoppointMode::Execute, 1)?;
            self.site_mut(id)?.mark_enabled_hardware(slot);
        } else {
            let original = self.read_memory_without_traps(address, 1)?;
            let saved = *original.first().ok_or(Error::PartialTransfer {
                address,
                completed: 0,
                requested: 1,
            })?;
            self.write_memory(address, &[INT3])?;
            self.site_mut(id)?.mark_enabled_software(saved);
        }
        trace!(pid = self.pid.as_raw(), id, %address, "enabled breakpoint site");
        Ok(())
    }

    pub fn disable_breakpoint_site(&mut self, id: StoppointId) -> Result<()> {
        let site = self
            .breakpoint_sites
            .get_by_id(id)
            .ok_or(Error::StoppointNotFound { id })?;
        if !site.is_enabled() {
            return Ok(());
        }
        let address = site.address();

        if let Some(slot) = site.hardware_index() {
            self.clear_hardware_stoppoint(slot)?;
        } else if let Some(saved) = site.saved_data() {
            self.write_memory(address, &[saved])?;
        } else {
            internal_error!("enabled breakpoint site {id} has no installation record");
        }
        self.site_mut(id)?.mark_disabled();
        trace!(pid = self.pid.as_raw(), id, %address, "disabled breakpoint site");
        Ok(())
    }

    /// Disable and drop a breakpoint site.
    pub fn remove_breakpoint_site(&mut self, id: StoppointId) -> Result<()> {
        self.disable_breakpoint_site(id)?;
        self.breakpoint_sites.remove_by_id(id)?;
        Ok(())
    }

    fn site_mut(&mut self, id: StoppointId) -> Result<&mut BreakpointSite> {
        self.breakpoint_sites
            .get_by_id_mut(id)
            .ok_or(Error::StoppointNotFound { id })
    }

    /// Register a watchpoint. The watchpoint starts disabled.
    pub fn create_watchpoint(
        &mut self,
        address: VirtAddr,
        mode: StoppointMode,
        size: usize,
    ) -> Result<&Watchpoint> {
        let id = self.allocate_stoppoint_id();
        debug!(
            pid = self.pid.as_raw(),
            id, %address, ?mode, size, "creating watchpoint"
        );
        self.watchpoints
            .push(Watchpoint::new(id, address, mode, size)?)
            .map(|watchpoint| &*watchpoint)
    }

    pub fn enable_watchpoint(&mut self, id: StoppointId) -> Result<()> {
        let watchpoint = self
            .watchpoints
            .get_by_id(id)
            .ok_or(Error::StoppointNotFound { id })?;
        if watchpoint.is_enabled() {
            return Ok(());
        }
        let (address, mode, size) = (watchpoint.address(), watchpoint.mode(), watchpoint.size());

        let slot = self.set_hardware_stoppoint(address, mode, size)?;
        self.watchpoint_mut(id)?.mark_enabled(slot);
        self.refresh_watchpoint_data(id)?;
        trace!(pid = self.pid.as_raw(), id, %address, "enabled watchpoint");
        Ok(())
    }

    pub fn disable_watchpoint(&mut self, id: StoppointId) -> Result<()> {
        let watchpoint = self
            .watchpoints
            .get_by_id(id)
            .ok_or(Error::StoppointNotFound { id })?;
        if !watchpoint.is_enabled() {
            return Ok(());
        }
        let Some(slot) = watchpoint.hardware_index() else {
            internal_error!("enabled watchpoint {id} has no debug register slot");
        };

        self.clear_hardware_stoppoint(slot)?;
        self.watchpoint_mut(id)?.mark_disabled();
        Ok(())
    }

    /// Disable and drop a watchpoint.
    pub fn remove_watchpoint(&mut self, id: StoppointId) -> Result<()> {
        self.disable_watchpoint(id)?;
        self.watchpoints.remove_by_id(id)?;
        Ok(())
    }

    fn watchpoint_mut(&mut self, id: StoppointId) -> Result<&mut Watchpoint> {
        self.watchpoints
            .get_by_id_mut(id)
            .ok_or(Error::StoppointNotFound { id })
    }

    // Re-read the watched value, shifting the old one into previous_data.
    fn refresh_watchpoint_data(&mut self, id: StoppointId) -> Result<()> {
        let (address, size) = {
            let watchpoint = self
                .watchpoints
                .get_by_id(id)
                .ok_or(Error::StoppointNotFound { id })?;
            (watchpoint.address(), watchpoint.size())
        };

        let data = self.read_memory(address, size)?;
        if data.len() < size {
            return Err(Error::PartialTransfer {
                address,
                completed: data.len(),
                requested: size,
            });
        }
        let mut word = [0u8; 8];
        word[..size].copy_from_slice(&data[..size]);
        self.watchpoint_mut(id)?.update_data(u64::from_le_bytes(word));
        Ok(())
    }

    // First-fit allocation of a DR0..DR3 slot: program the address register
    // and patch DR7's enable/mode/size fields for that slot.
    fn set_hardware_stoppoint(
        &mut self,
        address: VirtAddr,
        mode: StoppointMode,
        size: usize,
    ) -> Result<usize> {
        let control = self.registers.read_by_id_as::<u64>(RegisterId::dr7)?;
        let slot = find_free_debug_register(control).ok_or(Error::DebugRegistersExhausted)?;
        let Some(slot_id) = RegisterId::debug(slot) else {
            internal_error!("debug register slot {slot} out of range");
        };

        self.registers
            .write_by_id(slot_id, RegisterValue::U64(address.addr()))?;
        let patched = encode_hardware_stoppoint(control, slot, mode, size)?;
        self.registers
            .write_by_id(RegisterId::dr7, RegisterValue::U64(patched))?;

        debug!(pid = self.pid.as_raw(), slot, %address, ?mode, size, "programmed debug register");
        Ok(slot)
    }

    fn clear_hardware_stoppoint(&mut self, slot: usize) -> Result<()> {
        let control = self.registers.read_by_id_as::<u64>(RegisterId::dr7)?;
        let clear_mask = (0b11u64 << (slot * 2)) | (0b1111u64 << (slot * 4 + 16));
        self.registers
            .write_by_id(RegisterId::dr7, RegisterValue::U64(control & !clear_mask))?;
        debug!(pid = self.pid.as_raw(), slot, "cleared debug register");
        Ok(())
    }

    /// Which hardware stoppoint the debug status register attributes the
    /// current stop to.
    pub fn get_current_hardware_stoppoint(&self) -> Result<HardwareStoppoint> {
        let status = self.registers.read_by_id_as::<u64>(RegisterId::dr6)?;
        let slot = (status & 0b1111).trailing_zeros() as usize;
        if slot >= 4 {
            internal_error!("no debug register condition is set in DR6");
        }

        if let Some(watchpoint) = self
            .watchpoints
            .iter()
            .find(|w| w.hardware_index() == Some(slot))
        {
            return Ok(HardwareStoppoint::Watchpoint(watchpoint.id()));
        }
        if let Some(site) = self
            .breakpoint_sites
            .iter()
            .find(|s| s.hardware_index() == Some(slot))
        {
            return Ok(HardwareStoppoint::Breakpoint(site.id()));
        }
        internal_error!("debug register slot {slot} fired without an owner")
    }

    /// Decode `/proc/<pid>/auxv` into key/value pairs.
    pub fn get_auxv(&self) -> Result<HashMap<u64, u64>> {
        let data = fs::read(format!("/proc/{}/auxv", self.pid))?;
        let mut auxv = HashMap::new();
        for pair in data.chunks_exact(16) {
            let mut key = [0u8; 8];
            let mut value = [0u8; 8];
            key.copy_from_slice(&pair[..8]);
            value.copy_from_slice(&pair[8..]);

            let key = u64::from_ne_bytes(key);
            if key == 0 {
                break;
            }
            auxv.insert(key, u64::from_ne_bytes(value));
        }
        Ok(auxv)
    }
}

impl Drop for Process {
    // Best-effort teardown: stop a running inferior, detach, let it
    // continue, and kill and reap it when this engine launched it.
    fn drop(&mut self) {
        if self.pid.as_raw() == 0 {
            return;
        }
        debug!(pid = self.pid.as_raw(), "tearing down inferior");

        if self.is_attached {
            if self.state == ProcessState::Running {
                let _ = signal::kill(self.pid, Signal::SIGSTOP);
                let _ = waitpid(self.pid, None);
            }
            let _ = ptrace::detach(self.pid, None);
            let _ = signal::kill(self.pid, Signal::SIGCONT);
        }
        if self.terminate_on_end {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

// Child half of launch. Never returns: either execs or reports the failure
// through the pipe and exits.
fn exec_child(path: &Path, debug: bool, stdout_replacement: Option<OwnedFd>, mut channel: Pipe) -> ! {
    fn fail(channel: &mut Pipe, prefix: &str, errno: Errno) -> ! {
        let message = format!("{prefix}: {}", errno.desc());
        let _ = channel.write_all(message.as_bytes());
        // skip atexit handlers inherited from the parent
        unsafe { libc::_exit(1) }
    }

    channel.close_read();

    if let Err(errno) = personality::set(Persona::ADDR_NO_RANDOMIZE) {
        fail(&mut channel, "disabling address randomization failed", errno);
    }
    if let Some(fd) = stdout_replacement {
        if unsafe { libc::dup2(fd.as_raw_fd(), libc::STDOUT_FILENO) } < 0 {
            fail(&mut channel, "stdout replacement failed", Errno::last());
        }
    }
    if debug {
        if let Err(errno) = ptrace::traceme() {
            fail(&mut channel, "tracing failed", errno);
        }
    }

    let Ok(prog) = CString::new(path.as_os_str().as_bytes()) else {
        fail(&mut channel, "exec failed", Errno::EINVAL);
    };
    let errno = match unistd::execvp(&prog, &[prog.clone()]) {
        Err(errno) => errno,
        Ok(infallible) => match infallible {},
    };
    fail(&mut channel, "exec failed", errno)
}

// Split `[start, start + len)` at page boundaries; the cross-memory calls
// treat each iovec as an independent transfer.
fn page_chunks(start: u64, len: usize) -> Vec<RemoteIoVec> {
    let mut chunks = Vec::new();
    let mut addr = start;
    let mut remaining = len;
    while remaining > 0 {
        let next_page = (addr + PAGE_SIZE) & !(PAGE_SIZE - 1);
        let chunk = remaining.min((next_page - addr) as usize);
        chunks.push(RemoteIoVec {
            base: addr as usize,
            len: chunk,
        });
        addr += chunk as u64;
        remaining -= chunk;
    }
    chunks
}

fn find_free_debug_register(control: u64) -> Option<usize> {
    // each DR0..DR3 slot owns a pair of enable bits at the bottom of DR7
    (0..4).find(|slot| control & (0b11 << (slot * 2)) == 0)
}

fn encode_mode(mode: StoppointMode) -> u64 {
    match mode {
        StoppointMode::Execute => 0b00,
        StoppointMode::Write => 0b01,
        StoppointMode::ReadWrite => 0b11,
    }
}

fn encode_size(size: usize) -> Result<u64> {
    Ok(match size {
        1 => 0b00,
        2 => 0b01,
        4 => 0b11,
        8 => 0b10,
        _ => {
            return Err(Error::InvalidStoppoint {
                reason: "hardware stoppoint size must be 1, 2, 4, or 8 bytes",
            })
        }
    })
}

// Patch DR7 for `slot`: local-enable bit pair at the bottom, mode and size
// fields in the per-slot nibble at bits 16+.
fn encode_hardware_stoppoint(
    control: u64,
    slot: usize,
    mode: StoppointMode,
    size: usize,
) -> Result<u64> {
    let enable_bit = 1u64 << (slot * 2);
    let mode_bits = encode_mode(mode) << (slot * 4 + 16);
    let size_bits = encode_size(size)? << (slot * 4 + 18);
    let clear_mask = (0b11u64 << (slot * 2)) | (0b1111u64 << (slot * 4 + 16));
    Ok((control & !clear_mask) | enable_bit | mode_bits | size_bits)
}
