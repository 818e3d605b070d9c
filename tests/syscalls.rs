use std::fs::OpenOptions;
use std::os::fd::OwnedFd;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use quarry::{Process, ProcessState, SyscallCatchPolicy, SyscallData, Sysno, TrapType};

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn catch_some_reports_only_the_requested_syscall() -> Result<()> {
    let target = build_target("syscalls");
    let devnull = OpenOptions::new().write(true).open("/dev/null")?;
    let mut process = Process::launch(&target, true, Some(OwnedFd::from(devnull)))?;
    process.set_syscall_catch_policy(SyscallCatchPolicy::catch_some(vec![Sysno::write]));

    // entry: id and the argument registers
    process.resume()?;
    let reason = process.wait_on_signal()?;
    assert_eq!(reason.reason, ProcessState::Stopped);
    assert_eq!(reason.trap_reason, Some(TrapType::Syscall));

    let info = reason.syscall_info.expect("syscall stop carries info");
    assert_eq!(info.sysno, Sysno::write);
    assert!(info.entry);
    match info.data {
        SyscallData::Args(args) => {
            assert_eq!(args[0], libc::STDOUT_FILENO as u64);
            assert_eq!(args[2], 1);
        }
        SyscallData::Ret(_) => panic!("entry stop carries arguments"),
    }

    // exit: same id, return value
    process.resume()?;
    let reason = process.wait_on_signal()?;
    let info = reason.syscall_info.expect("syscall stop carries info");
    assert_eq!(info.sysno, Sysno::write);
    assert!(!info.entry);
    match info.data {
        SyscallData::Ret(ret) => assert_eq!(ret, 1),
        SyscallData::Args(_) => panic!("exit stop carries the return value"),
    }

    // every other syscall boundary is transparently resumed
    process.resume()?;
    let reason = process.wait_on_signal()?;
    assert_eq!(reason.reason, ProcessState::Exited);
    assert_eq!(reason.info, 0);

    Ok(())
}

#[test]
#[timeout(10000)]
fn catch_all_pairs_entries_with_exits() -> Result<()> {
    let target = build_target("exit42");
    let mut process = Process::launch(&target, true, None)?;
    process.set_syscall_catch_policy(SyscallCatchPolicy::catch_all());

    process.resume()?;
    let first = process.wait_on_signal()?;
    assert_eq!(first.trap_reason, Some(TrapType::Syscall));
    let entry = first.syscall_info.unwrap();
    assert!(entry.entry);
    assert!(matches!(entry.data, SyscallData::Args(_)));

    process.resume()?;
    let second = process.wait_on_signal()?;
    let exit = second.syscall_info.unwrap();
    assert!(!exit.entry);
    assert_eq!(exit.sysno, entry.sysno);
    assert!(matches!(exit.data, SyscallData::Ret(_)));

    Ok(())
}

#[test]
#[timeout(10000)]
fn catch_none_is_transparent() -> Result<()> {
    let target = build_target("syscalls");
    let devnull = OpenOptions::new().write(true).open("/dev/null")?;
    let mut process = Process::launch(&target, true, Some(OwnedFd::from(devnull)))?;
    process.set_syscall_catch_policy(SyscallCatchPolicy::catch_none());

    process.resume()?;
    let reason = process.wait_on_signal()?;
    assert_eq!(reason.reason, ProcessState::Exited);
    assert_eq!(reason.info, 0);

    Ok(())
}
