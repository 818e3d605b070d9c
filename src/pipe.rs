//! Anonymous CLOEXEC pipe used for the launch handshake.
//!
//! The child half reports pre-exec failures; the parent half drains the pipe
//! to EOF. On a successful `execve` the close-on-exec flag guarantees the
//! parent reads zero bytes.

use std::fs::File;
use std::io::{Read, Write};

use nix::fcntl::OFlag;
use nix::unistd;

use crate::error::{Error, Result};

pub(crate) struct Pipe {
    read: Option<File>,
    write: Option<File>,
}

impl Pipe {
    pub fn new(close_on_exec: bool) -> Result<Self> {
        let flags = if close_on_exec {
            OFlag::O_CLOEXEC
        } else {
            OFlag::empty()
        };
        let (read, write) = unistd::pipe2(flags).map_err(|source| Error::Os {
            context: "pipe creation",
            source,
        })?;

        Ok(Self {
            read: Some(File::from(read)),
            write: Some(File::from(write)),
        })
    }

    pub fn close_read(&mut self) {
        self.read = None;
    }

    pub fn close_write(&mut self) {
        self.write = None;
    }

    /// Drain the read end to EOF.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        if let Some(read) = self.read.as_mut() {
            read.read_to_end(&mut data)?;
        }
        Ok(data)
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if let Some(write) = self.write.as_mut() {
            write.write_all(data)?;
        }
        Ok(())
    }
}
