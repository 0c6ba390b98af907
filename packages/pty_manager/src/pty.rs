use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::pty::{Winsize, openpty};
use nix::sys::termios::Termios;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::PtyError;

/// Size of a terminal in character cells (and optionally pixels)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminalGeometry {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl Default for TerminalGeometry {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl TerminalGeometry {
    /// Build a geometry from the 32-bit fields of an SSH `pty-req`/`window-change`.
    ///
    /// Zero rows or columns fall back to the 80x24 default; oversized values saturate.
    pub fn from_request(cols: u32, rows: u32, pixel_width: u32, pixel_height: u32) -> Self {
        let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
        let default = Self::default();
        Self {
            rows: if rows == 0 { default.rows } else { clamp(rows) },
            cols: if cols == 0 { default.cols } else { clamp(cols) },
            pixel_width: clamp(pixel_width),
            pixel_height: clamp(pixel_height),
        }
    }

    fn winsize(&self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

/// Something that can hand out terminal pairs.
///
/// Sessions only ever go through this trait, so an allocator can be swapped
/// for one that counts or fails allocations.
pub trait TerminalAllocator: Send + Sync {
    fn allocate(&self, geometry: TerminalGeometry) -> Result<TerminalPair, PtyError>;
}

/// Allocator backed by the host's `openpty`
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeAllocator;

impl TerminalAllocator for NativeAllocator {
    fn allocate(&self, geometry: TerminalGeometry) -> Result<TerminalPair, PtyError> {
        TerminalPair::open(geometry)
    }
}

/// A controlling side and a process side opened together.
///
/// Dropping the pair closes both descriptors.
pub struct TerminalPair {
    controller: PtyController,
    process: ProcessSide,
}

impl TerminalPair {
    /// Open a new pseudo-terminal with the given initial size.
    ///
    /// Must be called from within a tokio runtime: the controlling side is
    /// registered with the reactor.
    pub fn open(geometry: TerminalGeometry) -> Result<Self, PtyError> {
        let winsize = geometry.winsize();
        let pty = openpty(Some(&winsize), None::<&Termios>)?;

        // Neither side may leak into unrelated children.
        set_cloexec(pty.master.as_raw_fd()).map_err(PtyError::Configure)?;
        set_cloexec(pty.slave.as_raw_fd()).map_err(PtyError::Configure)?;
        set_nonblocking(pty.master.as_raw_fd()).map_err(PtyError::Configure)?;

        let controller = AsyncFd::new(File::from(pty.master)).map_err(PtyError::Configure)?;

        info!(
            rows = geometry.rows,
            cols = geometry.cols,
            "opened terminal pair"
        );

        Ok(Self {
            controller: PtyController { fd: controller },
            process: ProcessSide { fd: pty.slave },
        })
    }

    pub fn controller(&self) -> &PtyController {
        &self.controller
    }

    pub fn process(&self) -> &ProcessSide {
        &self.process
    }

    /// Split into the two sides so they can be owned by different tasks.
    pub fn into_parts(self) -> (PtyController, ProcessSide) {
        (self.controller, self.process)
    }
}

/// The controlling side of a terminal, read and written asynchronously.
///
/// Bytes written here show up as terminal input on the process side; output
/// produced on the process side is read here.
pub struct PtyController {
    fd: AsyncFd<File>,
}

impl PtyController {
    /// Read whatever output is available.
    ///
    /// Returns `Ok(0)` once every process-side descriptor has been closed.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf)
            }) {
                // Linux reports a hung-up terminal as EIO rather than EOF.
                Ok(Err(e)) if e.raw_os_error() == Some(nix::libc::EIO) => return Ok(0),
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all of `data` as terminal input.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(data)
            }) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

/// The side of a terminal that interactive programs see as their tty.
pub struct ProcessSide {
    fd: OwnedFd,
}

impl ProcessSide {
    /// A blocking-pool backed reader over a duplicate of the process side.
    pub fn reader(&self) -> Result<tokio::fs::File, PtyError> {
        Ok(tokio::fs::File::from_std(self.duplicate()?))
    }

    /// A blocking-pool backed writer over a duplicate of the process side.
    pub fn writer(&self) -> Result<tokio::fs::File, PtyError> {
        Ok(tokio::fs::File::from_std(self.duplicate()?))
    }

    /// Spawn `program args...` with this terminal as stdin, stdout, stderr
    /// and controlling terminal.
    ///
    /// The child becomes leader of a new session so that job control and
    /// terminal signals reach it rather than this process. The duplicated
    /// descriptors are closed in the parent once the child is running.
    pub fn spawn_attached(&self, program: &str, args: &[String]) -> io::Result<Child> {
        let stdin = Stdio::from(self.duplicate().map_err(into_io)?);
        let stdout = Stdio::from(self.duplicate().map_err(into_io)?);
        let stderr = Stdio::from(self.duplicate().map_err(into_io)?);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .env("TERM", "xterm-256color")
            .kill_on_drop(true);

        unsafe {
            cmd.pre_exec(|| {
                if nix::libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                // stdin is already the terminal; claim it as controlling tty.
                if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        debug!(program, ?args, pid = ?child.id(), "spawned terminal-attached process");
        Ok(child)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn duplicate(&self) -> Result<File, PtyError> {
        // try_clone uses F_DUPFD_CLOEXEC, so the copy stays private to us.
        let fd = self.fd.try_clone().map_err(PtyError::Duplicate)?;
        Ok(File::from(fd))
    }
}

fn into_io(err: PtyError) -> io::Error {
    match err {
        PtyError::Open(e) | PtyError::Configure(e) | PtyError::Duplicate(e) => e,
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = FdFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
