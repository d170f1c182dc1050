use crate::{
    error::{InstallerError, InstallerResult},
    events::EventBus,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, mpsc::UnboundedReceiver};

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_WAIT: Duration = Duration::from_secs(5);
const STARTUP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Idle => "idle",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Completed => "completed",
            ProcessState::Failed => "failed",
            ProcessState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { command: String },
    Output(String),
    Error(String),
    Finished {
        state: ProcessState,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub command: String,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.state == ProcessState::Completed
    }

    pub fn output_tail(&self, lines: usize) -> String {
        let start = self.output.len().saturating_sub(lines);
        self.output[start..].join("\n")
    }
}

#[derive(Debug)]
struct Inner {
    state: ProcessState,
    input: Option<mpsc::UnboundedSender<String>>,
    kill: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
pub struct ProcessRunner {
    shell: String,
    inner: Mutex<Inner>,
    events: Arc<EventBus<ProcessEvent>>,
}

impl ProcessRunner {
    pub fn new<S: Into<String>>(shell: S) -> Self {
        Self {
            shell: shell.into(),
            inner: Mutex::new(Inner {
                state: ProcessState::Idle,
                input: None,
                kill: None,
            }),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ProcessEvent> {
        self.events.subscribe()
    }

    pub async fn run(&self, command: &str) -> InstallerResult<ProcessOutcome> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ProcessState::Idle {
                return Err(InstallerError::ProcessBusy(format!(
                    "cannot start '{}' while {}",
                    command, inner.state
                )));
            }
            inner.state = ProcessState::Starting;
        }

        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.inner.lock().state = ProcessState::Idle;
                return Err(InstallerError::ProcessSpawn(format!("{}: {}", command, e)));
            }
        };
        let pgid = child.id();

        let output = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(forward_lines(
                stdout,
                false,
                Arc::clone(&self.events),
                Arc::clone(&output),
            ))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(forward_lines(
                stderr,
                true,
                Arc::clone(&self.events),
                Arc::clone(&output),
            ))
        });

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                while let Some(input) = input_rx.recv().await {
                    if stdin.write_all(input.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            })
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.state = ProcessState::Running;
            inner.input = Some(input_tx);
            inner.kill = Some(kill_tx);
        }
        info!("Running: {}", command);
        self.events.emit(ProcessEvent::Started {
            command: command.to_string(),
        });

        let (state, exit_code) = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => (ProcessState::Completed, status.code()),
                Ok(status) => (ProcessState::Failed, status.code()),
                Err(e) => {
                    warn!("Failed waiting for '{}': {}", command, e);
                    (ProcessState::Failed, None)
                }
            },
            Ok(()) = kill_rx => {
                if let Some(pgid) = pgid {
                    unsafe {
                        libc::kill(-(pgid as libc::pid_t), libc::SIGTERM);
                    }
                }
                let _ = child.kill().await;
                warn!("Terminated: {}", command);
                (ProcessState::Terminated, None)
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.input = None;
            inner.kill = None;
        }
        if let Some(task) = writer_task {
            task.abort();
        }
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, task).await.is_err() {
                warn!("Output of '{}' did not close in time", command);
            }
        }

        self.inner.lock().state = state;
        debug!("'{}' finished: {} ({:?})", command, state, exit_code);
        self.events.emit(ProcessEvent::Finished { state, exit_code });
        self.inner.lock().state = ProcessState::Idle;

        let output = std::mem::take(&mut *output.lock());
        Ok(ProcessOutcome {
            command: command.to_string(),
            state,
            exit_code,
            output,
        })
    }

    pub fn write(&self, input: &str) -> InstallerResult<()> {
        let inner = self.inner.lock();
        if inner.state != ProcessState::Running {
            return Err(InstallerError::ProcessNotRunning(format!(
                "cannot write while {}",
                inner.state
            )));
        }
        match &inner.input {
            Some(tx) if tx.send(input.to_string()).is_ok() => Ok(()),
            _ => Err(InstallerError::ProcessNotRunning(
                "process input is closed".into(),
            )),
        }
    }

    /// The only cancellation path. Leaves the package database in an unknown
    /// state; callers must refresh their lists afterwards.
    pub fn terminate(&self) -> InstallerResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ProcessState::Running => match inner.kill.take() {
                Some(kill) => {
                    let _ = kill.send(());
                    Ok(())
                }
                None => Err(InstallerError::NothingToTerminate),
            },
            ProcessState::Starting => Err(InstallerError::ProcessNotRunning(
                "process is still starting".into(),
            )),
            _ => Err(InstallerError::NothingToTerminate),
        }
    }
}

impl ProcessRunner {
    /// `terminate`, but waits out a process that is still being spawned. The
    /// child runs in its own process group and never sees the terminal's
    /// SIGINT, so giving up during startup would leave it running.
    pub async fn interrupt(&self) -> InstallerResult<()> {
        let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
        loop {
            match self.terminate() {
                Err(InstallerError::ProcessNotRunning(_))
                    if tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(STARTUP_POLL).await;
                }
                result => return result,
            }
        }
    }
}

async fn forward_lines<R>(
    reader: R,
    is_stderr: bool,
    events: Arc<EventBus<ProcessEvent>>,
    output: Arc<Mutex<Vec<String>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if is_stderr {
                    warn!("{}", line);
                    events.emit(ProcessEvent::Error(line.clone()));
                } else {
                    debug!("{}", line);
                    events.emit(ProcessEvent::Output(line.clone()));
                }
                output.lock().push(line);
            }
        }
    }
}
