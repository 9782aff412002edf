//! PTY backend
//!
//! Tabs own a live PTY-like handle behind the [`Tty`] capability set;
//! the one backend on Unix spawns the runtime's `exec -it` through a
//! real pseudo-terminal so resize and job control work.

use crate::error::{Result, RouterError};
use bytes::Bytes;
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};

/// Grace between dispose and force-kill of the captured PID.
pub const DISPOSE_KILL_GRACE: Duration = Duration::from_secs(2);

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Capability set of a live terminal handle.
#[async_trait::async_trait]
pub trait Tty: Send + Sync {
    /// Write raw bytes to the terminal.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Resize the terminal.
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Take the output channel; yields chunks in emission order.
    /// Callable once per handle.
    fn take_output(&self) -> Option<mpsc::Receiver<Bytes>>;

    /// Take the close notification channel. Callable once per handle.
    fn take_closed(&self) -> Option<oneshot::Receiver<()>>;

    /// PID of the attached child, when one was captured.
    fn pid(&self) -> Option<u32>;

    /// Tear the terminal down. Idempotent; the child is force-killed
    /// after [`DISPOSE_KILL_GRACE`].
    fn dispose(&self);
}

/// Creates terminals for tabs; injected so tests never spawn processes.
pub trait TtyFactory: Send + Sync {
    fn create(&self, app: &str, session_id: &str, tab_id: &str) -> Result<Box<dyn Tty>>;
}

/// Native PTY running an arbitrary argv.
pub struct NativePty {
    master: Arc<AsyncFd<OwnedFd>>,
    pid: u32,
    output_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    closed_rx: Mutex<Option<oneshot::Receiver<()>>>,
    disposed: Arc<AtomicBool>,
}

impl NativePty {
    /// Spawn `argv` on a fresh PTY.
    pub fn spawn(argv: &[String]) -> Result<Self> {
        if argv.is_empty() {
            return Err(RouterError::Internal("empty tty command".to_string()));
        }

        let winsize = Winsize {
            ws_col: DEFAULT_COLS,
            ws_row: DEFAULT_ROWS,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let OpenptyResult { master, slave } = openpty(Some(&winsize), None)
            .map_err(|e| RouterError::Internal(format!("openpty failed: {e}")))?;

        set_nonblocking(&master).map_err(RouterError::Internal)?;

        let stdin = slave
            .try_clone()
            .map_err(|e| RouterError::Internal(e.to_string()))?;
        let stdout = slave
            .try_clone()
            .map_err(|e| RouterError::Internal(e.to_string()))?;

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env("TERM", "xterm-256color")
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(slave));

        // SAFETY: post-fork we only make async-signal-safe calls: setsid
        // to leave the parent's session, then TIOCSCTTY to adopt the PTY
        // slave (fd 0) as the controlling terminal.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RouterError::Internal(format!("tty spawn failed: {e}")))?;
        let pid = child.id().unwrap_or_default();

        let master = Arc::new(
            AsyncFd::new(master).map_err(|e| RouterError::Internal(e.to_string()))?,
        );

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(256);
        let (closed_tx, closed_rx) = oneshot::channel::<()>();
        let disposed = Arc::new(AtomicBool::new(false));

        // output pump: PTY master -> channel, in emission order
        let reader = Arc::clone(&master);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                let mut guard = match reader.readable().await {
                    Ok(guard) => guard,
                    Err(_) => break,
                };
                match guard.try_io(|inner| read_fd(inner.get_ref().as_raw_fd(), &mut buf)) {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if output_tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    // EIO means the slave side is gone
                    Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => break,
                    Ok(Err(e)) => {
                        tracing::debug!("pty read failed: {e}");
                        break;
                    }
                    Err(_would_block) => continue,
                }
            }
        });

        // reap the child and announce the close
        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = closed_tx.send(());
        });

        Ok(Self {
            master,
            pid,
            output_rx: Mutex::new(Some(output_rx)),
            closed_rx: Mutex::new(Some(closed_rx)),
            disposed,
        })
    }
}

#[async_trait::async_trait]
impl Tty for NativePty {
    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let mut guard = self
                .master
                .writable()
                .await
                .map_err(|e| RouterError::Internal(e.to_string()))?;
            match guard.try_io(|inner| write_fd(inner.get_ref().as_raw_fd(), &data[written..])) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(RouterError::Internal(format!("pty write: {e}"))),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let ws = Winsize {
            ws_col: cols,
            ws_row: rows,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ sets the window size on the PTY master fd;
        // the Winsize struct is fully initialized.
        let ret = unsafe {
            libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws)
        };
        if ret < 0 {
            return Err(RouterError::Internal(format!(
                "TIOCSWINSZ failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.lock().ok()?.take()
    }

    fn take_closed(&self) -> Option<oneshot::Receiver<()>> {
        self.closed_rx.lock().ok()?.take()
    }

    fn pid(&self) -> Option<u32> {
        (self.pid != 0).then_some(self.pid)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pid = self.pid;
        if pid == 0 {
            return;
        }
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGHUP);
        // plain thread: dispose must work even while the runtime is
        // tearing down
        std::thread::spawn(move || {
            std::thread::sleep(DISPOSE_KILL_GRACE);
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        });
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Terminal factory attaching into the app's target container via the
/// runtime CLI.
pub struct ExecTtyFactory {
    runtime_cmd: String,
    store: Arc<ploinky_core::WorkspaceStore>,
    /// `PLOINKY_NO_TTY=1` drops the `-t` on exec
    no_tty: bool,
}

impl ExecTtyFactory {
    pub fn new(
        runtime_cmd: impl Into<String>,
        store: Arc<ploinky_core::WorkspaceStore>,
        no_tty: bool,
    ) -> Self {
        Self {
            runtime_cmd: runtime_cmd.into(),
            store,
            no_tty,
        }
    }

    /// Resolve the container a terminal app attaches to: the static
    /// route's agent, falling back to the only declared agent.
    fn resolve_container(&self) -> Result<String> {
        let routing = self.store.load_routing();

        if let Some(static_route) = routing.static_route {
            if let Some(container) = static_route.container {
                return Ok(container);
            }
            if let Some(entry) = routing.routes.get(&static_route.agent) {
                if let Some(ref container) = entry.container {
                    return Ok(container.clone());
                }
            }
        }

        let agents = self.store.load_agents();
        if agents.len() == 1 {
            if let Some(record) = agents.values().next() {
                return Ok(record.container_name.clone());
            }
        }
        Err(RouterError::AgentNotEnabled)
    }
}

impl TtyFactory for ExecTtyFactory {
    fn create(&self, _app: &str, _session_id: &str, _tab_id: &str) -> Result<Box<dyn Tty>> {
        let container = self.resolve_container()?;
        let mut argv = vec![self.runtime_cmd.clone(), "exec".to_string()];
        argv.push(if self.no_tty { "-i" } else { "-it" }.to_string());
        argv.push(container);
        argv.push("sh".to_string());
        Ok(Box::new(NativePty::spawn(&argv)?))
    }
}

fn set_nonblocking(fd: &OwnedFd) -> std::result::Result<(), String> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(|e| e.to_string())?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(|e| e.to_string())?;
    Ok(())
}

fn read_fd(fd: i32, buf: &mut [u8]) -> std::io::Result<usize> {
    // SAFETY: buf is a valid writable slice for its full length.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: i32, buf: &[u8]) -> std::io::Result<usize> {
    // SAFETY: buf is a valid readable slice for its full length.
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}
