use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::stoppoint::StoppointId;
use crate::types::VirtAddr;


pub type Result<T> = std::result::Result<T, Error>;

/// Bail out of the current function with [`Error::Internal`].
macro_rules! internal_error {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Internal(format!($($arg)*)))
    };
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The child reported a pre-exec failure through the launch pipe.
    #[error("could not launch {}: {message}", path.display())]
    Launch { path: PathBuf, message: String },

    #[error("invalid pid = {pid}")]
    InvalidPid { pid: i32 },

    #[error("could not attach to tracee = {pid}")]
    Attach { pid: Pid, source: Errno },

    #[error("error waiting on tracee = {pid}")]
    Wait { pid: Pid, source: Errno },

    #[error("could not resume tracee = {pid}")]
    Resume { pid: Pid, source: Errno },

    #[error("ptrace {request} failed for tracee = {pid}")]
    Ptrace {
        request: &'static str,
        pid: Pid,
        source: Errno,
    },

    #[error("could not read inferior memory at {address}")]
    MemoryRead { address: VirtAddr, source: Errno },

    #[error("could not write inferior memory at {address}")]
    MemoryWrite { address: VirtAddr, source: Errno },

    /// A memory transfer moved fewer bytes than requested.
    #[error("short transfer at {address}: {completed} of {requested} bytes")]
    PartialTransfer {
        address: VirtAddr,
        completed: usize,
        requested: usize,
    },

    #[error("all four debug register slots are in use")]
    DebugRegistersExhausted,

    #[error("stoppoint already installed at {address}")]
    StoppointExists { address: VirtAddr },

    #[error("no stoppoint with id = {id}")]
    StoppointNotFound { id: StoppointId },

    #[error("invalid stoppoint: {reason}")]
    InvalidStoppoint { reason: &'static str },

    #[error("no register named {name:?}")]
    UnknownRegister { name: String },

    #[error("value does not fit register {register}")]
    RegisterValue { register: &'static str },

    #[error("malformed ELF {}: {message}", path.display())]
    Elf { path: PathBuf, message: String },

    #[error("string table index {index} out of range")]
    StringIndex { index: usize },

    #[error("{context} failed")]
    Os { context: &'static str, source: Errno },

    #[error("input/output error")]
    InputOutput(#[from] io::Error),

    #[error("unexpected internal error: {0}")]
    Internal(String),
}
