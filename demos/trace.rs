//! Launch a program, break at its entry point, and report every stop.
//!
//! ```text
//! cargo run --example trace -- /bin/true
//! ```

use anyhow::{Context, Result};
use quarry::{Process, ProcessState, Stoppoint, TrapType, VirtAddr};

fn main() -> Result<()> {
    let path = std::env::args().nth(1).context("usage: trace <program>")?;

    let mut process = Process::launch(&path, true, None)?;
    let auxv = process.get_auxv()?;
    let entry = VirtAddr::new(
        *auxv
            .get(&(libc::AT_ENTRY))
            .context("inferior has no AT_ENTRY")?,
    );
    println!("entry point: {entry}");

    let id = process.create_breakpoint_site(entry, false, false)?.id();
    process.enable_breakpoint_site(id)?;

    loop {
        process.resume()?;
        let reason = process.wait_on_signal()?;

        match reason.reason {
            ProcessState::Stopped => {
                let pc = process.get_pc()?;
                println!(
                    "stopped at {pc} (signal {}, {:?})",
                    reason.info, reason.trap_reason
                );
                if reason.trap_reason == Some(TrapType::SoftwareBreak) {
                    println!("hit the entry breakpoint");
                }
            }
            ProcessState::Exited => {
                println!("exited with code {}", reason.info);
                break;
            }
            ProcessState::Terminated => {
                println!("terminated by signal {}", reason.info);
                break;
            }
            ProcessState::Running => {}
        }
    }

    Ok(())
}
