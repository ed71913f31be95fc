//! Framing over the control pipes.
//!
//! Commands travel controller → worker as single contiguous writes; replies
//! travel back as one machine-sized integer. The worker never blocks on the
//! controller, while the controller always blocks for the reply, so each
//! call is a strict round trip.

use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::unistd;

use crate::error::Error;
use crate::msg::{MsgBuffer, MsgHeader, MAX_MSG_SIZE};

/// Worker-side pipe ends: reads commands, writes replies.
pub(crate) struct WorkerPipe {
    pub rx: OwnedFd,
    pub tx: OwnedFd,
}

/// Controller-side pipe ends: writes commands, reads replies.
pub(crate) struct ControllerPipe {
    pub tx: OwnedFd,
    pub rx: OwnedFd,
}

pub(crate) fn control_pair() -> Result<(ControllerPipe, WorkerPipe), Error> {
    let (worker_rx, controller_tx) = make_pipe()?;
    let (controller_rx, worker_tx) = make_pipe()?;

    Ok((
        ControllerPipe {
            tx: controller_tx,
            rx: controller_rx,
        },
        WorkerPipe {
            rx: worker_rx,
            tx: worker_tx,
        },
    ))
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let (rx, tx) = unistd::pipe().map_err(|err| {
        log::error!("failed to create control pipe: {err}");
        Error::Pipe
    })?;

    // SAFETY: these are freshly created, uniquely owned fds from pipe().
    Ok(unsafe { (OwnedFd::from_raw_fd(rx), OwnedFd::from_raw_fd(tx)) })
}

fn read_exact(fd: &OwnedFd, buf: &mut [u8]) -> Result<(), Error> {
    let mut off = 0;

    while off < buf.len() {
        match unistd::read(fd.as_raw_fd(), &mut buf[off..]) {
            Ok(0) => {
                log::error!("control pipe has been closed");
                return Err(Error::Pipe);
            }
            Ok(n) => off += n,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                log::error!("control pipe read failed: {err}");
                return Err(Error::Pipe);
            }
        }
    }

    Ok(())
}

fn write_all(fd: &OwnedFd, bytes: &[u8]) -> Result<(), Error> {
    loop {
        match unistd::write(fd.as_raw_fd(), bytes) {
            // messages fit the pipe buffer, so anything partial is fatal
            Ok(n) if n == bytes.len() => return Ok(()),
            Ok(n) => {
                log::error!("short write on control pipe: {n} of {} bytes", bytes.len());
                return Err(Error::Pipe);
            }
            Err(Errno::EINTR) => continue,
            Err(err) => {
                log::error!("control pipe write failed: {err}");
                return Err(Error::Pipe);
            }
        }
    }
}

impl WorkerPipe {
    pub fn rx_fd(&self) -> std::os::fd::RawFd {
        self.rx.as_raw_fd()
    }

    /// Read the next command into `buf`, returning its total length. The
    /// length field arrives first; the rest of the message follows it into
    /// the same buffer.
    pub fn read_command(&self, buf: &mut MsgBuffer) -> Result<usize, Error> {
        let len_size = size_of::<usize>();
        read_exact(&self.rx, &mut buf.0[..len_size])?;

        let mut raw = [0u8; size_of::<usize>()];
        raw.copy_from_slice(&buf.0[..len_size]);
        let length = usize::from_ne_bytes(raw);

        if length > MAX_MSG_SIZE {
            return Err(Error::OutOfMemory);
        }
        if length < size_of::<MsgHeader>() {
            return Err(Error::InvalidArg);
        }

        read_exact(&self.rx, &mut buf.0[len_size..length])?;
        Ok(length)
    }

    pub fn send_response(&self, rc: i32) -> Result<(), Error> {
        write_all(&self.tx, &rc.to_ne_bytes())
    }

    /// Pointer-valued reply, used only by `ConfigGlobalRemix`.
    pub fn send_ptr_response(&self, ptr: usize) -> Result<(), Error> {
        write_all(&self.tx, &ptr.to_ne_bytes())
    }
}

impl ControllerPipe {
    pub fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        write_all(&self.tx, bytes)
    }

    pub fn recv_reply(&self) -> Result<i32, Error> {
        let mut raw = [0u8; size_of::<i32>()];
        read_exact(&self.rx, &mut raw)?;

        let rc = i32::from_ne_bytes(raw);
        if rc < 0 {
            Err(Error::from_rc(rc))
        } else {
            Ok(rc)
        }
    }

    pub fn recv_ptr_reply(&self) -> Result<usize, Error> {
        let mut raw = [0u8; size_of::<usize>()];
        read_exact(&self.rx, &mut raw)?;
        Ok(usize::from_ne_bytes(raw))
    }
}
