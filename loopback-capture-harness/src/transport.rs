//! Child-process lifecycle: spawn, line readers, exit watcher, graceful stop
//! with kill escalation.

use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::ProcessTransportConfig;
use crate::error::TransportError;
use crate::protocol::{parse_pcm_line, TransportEvent};

/// Receives every event of every run, from the transport's own threads.
pub type EventCallback = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// One spawned child and its exit bookkeeping.
struct Run {
    pid: u32,
    child: Mutex<Child>,
    exited: Mutex<bool>,
    exited_cv: Condvar,
    stop_requested: AtomicBool,
    force_kills: Arc<AtomicUsize>,
}

impl Run {
    fn has_exited(&self) -> bool {
        *self.exited.lock()
    }

    fn mark_exited(&self) {
        *self.exited.lock() = true;
        self.exited_cv.notify_all();
    }

    /// Block until the child has been reaped or `timeout` elapses.
    fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut exited = self.exited.lock();
        while !*exited {
            if self.exited_cv.wait_until(&mut exited, deadline).timed_out() {
                break;
            }
        }
        *exited
    }

    /// Ask the child to stop. `Ok(false)` means it had already exited.
    fn interrupt(&self) -> io::Result<bool> {
        // Holding the lock keeps the exit watcher from reaping the pid under us.
        let mut child = self.child.lock();
        if child.try_wait()?.is_some() {
            return Ok(false);
        }
        send_interrupt(&child)?;
        Ok(true)
    }

    /// Kill the child unless it has already exited. Returns whether a kill was sent.
    ///
    /// Counted under the child lock, so the count is final before `Closed`.
    fn force_kill(&self) -> bool {
        let mut child = self.child.lock();
        match child.try_wait() {
            Ok(Some(_)) => false,
            _ => match child.kill() {
                Ok(()) => {
                    self.force_kills.fetch_add(1, Ordering::SeqCst);
                    true
                }
                Err(e) => {
                    log::error!("Failed to kill capture process {}: {}", self.pid, e);
                    false
                }
            },
        }
    }
}

#[cfg(unix)]
fn send_interrupt(child: &Child) -> io::Result<()> {
    let pid = child.id() as libc::pid_t;
    // SAFETY: plain syscall on a pid we own and have not reaped.
    if unsafe { libc::kill(pid, libc::SIGINT) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_interrupt(_child: &Child) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no graceful stop signal on this platform",
    ))
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Runs the capture executable and reports its output as [`TransportEvent`]s.
pub struct ProcessTransport {
    config: ProcessTransportConfig,
    callback: EventCallback,
    run: Mutex<Option<Arc<Run>>>,
    force_kills: Arc<AtomicUsize>,
}

impl ProcessTransport {
    pub fn new(config: ProcessTransportConfig, callback: EventCallback) -> Self {
        Self {
            config,
            callback,
            run: Mutex::new(None),
            force_kills: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn the child and its reader threads. Returns the child's pid.
    ///
    /// While a child is already running this is a no-op returning its pid.
    pub fn start(&self) -> Result<u32, TransportError> {
        let mut current = self.run.lock();
        if let Some(run) = current.as_ref().filter(|run| !run.has_exited()) {
            log::info!("Capture process is already running (pid {})", run.pid);
            return Ok(run.pid);
        }
        self.config
            .validate()
            .map_err(TransportError::InvalidConfiguration)?;

        log::info!("Starting capture process {:?}...", self.config.executable);
        let spawned = Command::new(&self.config.executable)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to start capture process: {}", e);
                log::error!("{}", message);
                (self.callback)(TransportEvent::Error(message));
                return Err(TransportError::SpawnFailed(e.to_string()));
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = Arc::new(Run {
            pid,
            child: Mutex::new(child),
            exited: Mutex::new(false),
            exited_cv: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            force_kills: Arc::clone(&self.force_kills),
        });

        *current = Some(Arc::clone(&run));
        // Callbacks may call back into the transport.
        drop(current);

        (self.callback)(TransportEvent::Started { pid });

        if let Err(e) = self.spawn_watchers(&run, stdout, stderr) {
            log::error!("{}", e);
            run.force_kill();
            run.mark_exited();
            (self.callback)(TransportEvent::Error(e.to_string()));
            return Err(e);
        }

        log::info!("Capture process started (pid {})", pid);
        Ok(pid)
    }

    /// Send the graceful stop signal; kill the child if it is still alive
    /// after the grace period. Without a graceful signal the kill is immediate.
    pub fn stop(&self) {
        let run = match self.current() {
            Some(run) if !run.has_exited() => run,
            _ => {
                log::info!("Capture process is not running");
                return;
            }
        };
        if run.stop_requested.swap(true, Ordering::SeqCst) {
            log::debug!("Stop already requested for capture process {}", run.pid);
            return;
        }

        log::info!("Stopping capture process {}...", run.pid);
        let grace = match run.interrupt() {
            Ok(true) => self.config.grace_period,
            Ok(false) => return,
            Err(e) => {
                log::warn!("Graceful stop unavailable for capture process {}: {}", run.pid, e);
                Duration::ZERO
            }
        };

        let spawned = thread::Builder::new()
            .name("capture-process-watchdog".into())
            .spawn(move || {
                if run.wait_exited(grace) {
                    return;
                }
                log::warn!("Force killing capture process {}...", run.pid);
                run.force_kill();
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn watchdog thread: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.current().is_some_and(|run| !run.has_exited())
    }

    /// Pid of the current or most recent child.
    pub fn pid(&self) -> Option<u32> {
        self.current().map(|run| run.pid)
    }

    /// Number of forced kills issued over the transport's lifetime.
    pub fn force_kill_count(&self) -> usize {
        self.force_kills.load(Ordering::SeqCst)
    }

    fn current(&self) -> Option<Arc<Run>> {
        self.run.lock().clone()
    }

    fn spawn_watchers(
        &self,
        run: &Arc<Run>,
        stdout: Option<impl Read + Send + 'static>,
        stderr: Option<impl Read + Send + 'static>,
    ) -> Result<(), TransportError> {
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = stdout {
            let callback = Arc::clone(&self.callback);
            readers.push(spawn_named("capture-process-stdout", move || {
                for_each_line(stdout, |line| match parse_pcm_line(&line) {
                    Some(info) => callback(TransportEvent::Pcm(info)),
                    None => {
                        log::debug!("capturer: {}", line);
                        callback(TransportEvent::Log(line));
                    }
                });
            })?);
        }

        if let Some(stderr) = stderr {
            let callback = Arc::clone(&self.callback);
            readers.push(spawn_named("capture-process-stderr", move || {
                for_each_line(stderr, |line| {
                    log::warn!("capturer error: {}", line);
                    callback(TransportEvent::Error(line));
                });
            })?);
        }

        let run = Arc::clone(run);
        let callback = Arc::clone(&self.callback);
        let poll_interval = self.config.poll_interval;
        spawn_named("capture-process-exit", move || {
            watch_exit(&run, readers, poll_interval, &callback)
        })?;
        Ok(())
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Some(run) = self.current().filter(|run| !run.has_exited()) {
            log::warn!("Transport dropped while capture process {} is running", run.pid);
            run.force_kill();
        }
    }
}

fn spawn_named(
    name: &str,
    f: impl FnOnce() + Send + 'static,
) -> Result<thread::JoinHandle<()>, TransportError> {
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|e| TransportError::ThreadSpawnFailed(e.to_string()))
}

/// Call `f` with each newline-terminated line, minus the line ending.
/// Invalid UTF-8 is replaced rather than ending the stream.
fn for_each_line(source: impl Read, mut f: impl FnMut(String)) {
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                f(line.trim_end_matches(['\r', '\n']).to_string());
            }
            Err(e) => {
                log::debug!("Capture process pipe closed: {}", e);
                break;
            }
        }
    }
}

/// Poll until the child is reaped, then report `Closed` once both readers
/// have drained their pipes.
fn watch_exit(
    run: &Run,
    readers: Vec<thread::JoinHandle<()>>,
    poll_interval: Duration,
    callback: &EventCallback,
) {
    let status = loop {
        match run.child.lock().try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(e) => {
                log::error!("Failed to wait for capture process {}: {}", run.pid, e);
                break None;
            }
        }
        thread::sleep(poll_interval);
    };

    for reader in readers {
        if reader.join().is_err() {
            log::error!("Capture process reader panicked");
        }
    }

    let code = status.as_ref().and_then(ExitStatus::code);
    let signal = status.as_ref().and_then(exit_signal);
    log::info!(
        "Capture process {} exited with code {:?}, signal {:?}",
        run.pid,
        code,
        signal
    );
    run.mark_exited();
    callback(TransportEvent::Closed { code, signal });
}
