//! `child`
//!
//! A spawned child process and the actor that supervises it. The actor
//! owns the OS handle; callers interact through a command channel (stop /
//! kill) and a watch channel carrying the exit state. This loosely follows
//! the actor model: cloning a `Child` clones the channels, not the
//! process.

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::Command as TokioCommand,
    sync::{mpsc, watch},
};
use tracing::{debug, trace};

use crate::command::Command;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ChildExit {
    Finished(Option<i32>),
    /// The child process was sent an interrupt and shut down on its own
    Interrupted,
    /// The child process was killed, either explicitly or because it did
    /// not respond to the interrupt within the grace period
    Killed,
    /// The child process was killed by someone else
    KilledExternal,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ShutdownStyle {
    /// On posix systems, send a SIGINT to the child's process group and
    /// follow up with a kill if `Duration` elapses. On windows, kill
    /// immediately.
    Graceful(Duration),
    Kill,
}

struct ChildHandle {
    pid: Option<u32>,
    child: tokio::process::Child,
}

impl ChildHandle {
    #[tracing::instrument(skip(command))]
    fn spawn(command: Command) -> io::Result<SpawnResult> {
        let mut command = TokioCommand::from(command);

        // Give the child its own process group on unix so signals reach
        // everything the script spawned, not just the shell.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .expect("child process must be started with piped stdout");
        let stderr = child
            .stderr
            .take()
            .expect("child process must be started with piped stderr");

        Ok(SpawnResult {
            handle: Self { pid, child },
            stdout,
            stderr,
        })
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

struct SpawnResult {
    handle: ChildHandle,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
}

impl ShutdownStyle {
    /// Run the shutdown against the given child handle.
    async fn process(&self, child: &mut ChildHandle) -> ChildExit {
        match self {
            #[allow(unused)]
            ShutdownStyle::Graceful(timeout) => {
                #[cfg(unix)]
                {
                    let fut = async {
                        if let Some(pid) = child.pid() {
                            debug!("sending SIGINT to child {}", pid);
                            // negative pid addresses the process group
                            let pgid = -(pid as i32);
                            if unsafe { libc::kill(pgid, libc::SIGINT) } == -1 {
                                debug!("failed to send SIGINT to {pgid}");
                            }
                            debug!("waiting for child {}", pid);
                            child.wait().await
                        } else {
                            // no pid means nothing to signal
                            Ok(None)
                        }
                    };

                    debug!("starting shutdown");

                    let result = tokio::time::timeout(*timeout, fut).await;
                    match result {
                        // We mark the exit as interrupted regardless of the
                        // exit code the child chose to report for the SIGINT.
                        Ok(Ok(_exit_code)) => ChildExit::Interrupted,
                        Ok(Err(_)) => ChildExit::Failed,
                        Err(_) => {
                            debug!("graceful shutdown timed out, killing child");
                            match child.kill().await {
                                Ok(_) => ChildExit::Killed,
                                Err(_) => ChildExit::Failed,
                            }
                        }
                    }
                }

                #[cfg(windows)]
                {
                    debug!("timeout not supported on windows, killing");
                    match child.kill().await {
                        Ok(_) => ChildExit::Killed,
                        Err(_) => ChildExit::Failed,
                    }
                }
            }
            ShutdownStyle::Kill => match child.kill().await {
                Ok(_) => ChildExit::Killed,
                Err(_) => ChildExit::Failed,
            },
        }
    }
}

#[derive(Debug)]
struct ChildStateManager {
    shutdown_style: ShutdownStyle,
    exit_tx: watch::Sender<Option<ChildExit>>,
    shutdown_initiated: bool,
}

/// A child process that can be interacted with asynchronously.
#[derive(Clone, Debug)]
pub struct Child {
    pid: Option<u32>,
    command_channel: mpsc::Sender<ChildCommand>,
    exit_channel: watch::Receiver<Option<ChildExit>>,
    outputs: Arc<Mutex<Option<ChildOutput>>>,
    label: String,
}

#[derive(Debug)]
struct ChildOutput {
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
}

#[derive(Debug)]
enum ChildCommand {
    Stop,
    Kill,
}

impl Child {
    /// Start a child process. The command is spawned immediately; the
    /// returned handle is the only way to interact with it.
    #[tracing::instrument(skip(command), fields(command = command.label()))]
    pub fn spawn(command: Command, shutdown_style: ShutdownStyle) -> io::Result<Self> {
        let label = command.label();
        let SpawnResult {
            handle: mut child,
            stdout,
            stderr,
        } = ChildHandle::spawn(command)?;

        let pid = child.pid();

        let (command_tx, mut command_rx) = mpsc::channel(1);

        // The watch channel carries the single interesting transition:
        // from running (None) to exited (Some(exit)).
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            debug!("waiting for task: {pid:?}");
            let mut manager = ChildStateManager {
                shutdown_style,
                exit_tx,
                shutdown_initiated: false,
            };
            tokio::select! {
                biased;
                command = command_rx.recv() => {
                    manager.shutdown_initiated = true;
                    manager.handle_child_command(command, &mut child).await;
                }
                status = child.wait() => {
                    manager.handle_child_exit(status).await;
                }
            }

            debug!("child process stopped");
        });

        Ok(Self {
            pid,
            command_channel: command_tx,
            exit_channel: exit_rx,
            outputs: Arc::new(Mutex::new(Some(ChildOutput { stdout, stderr }))),
            label,
        })
    }

    /// Wait for the child to exit, returning its exit state.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        trace!("watching exit channel of {}", self.label);
        match self.exit_channel.changed().await {
            Ok(()) => trace!("exit channel was updated"),
            // sender dropped: fall through to the last observed value
            Err(_) => trace!("exit channel sender was dropped"),
        }
        *self.exit_channel.borrow()
    }

    /// Perform a graceful shutdown of the child process.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        // a send failure means the supervisor already exited
        self.command_channel.send(ChildCommand::Stop).await.ok();
        self.wait().await
    }

    /// Kill the child process immediately.
    pub async fn kill(&mut self) -> Option<ChildExit> {
        self.command_channel.send(ChildCommand::Kill).await.ok();
        self.wait().await
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for the child to exit, piping stdout and stderr line by line
    /// to the provided writer. The full body always reaches the writer,
    /// even on failure, so the log file is complete for caching.
    #[tracing::instrument(skip_all)]
    pub async fn wait_with_piped_outputs<W: std::io::Write>(
        &mut self,
        stdout_pipe: W,
    ) -> Result<Option<ChildExit>, std::io::Error> {
        let outputs = self.outputs.lock().expect("output mutex poisoned").take();
        match outputs {
            Some(ChildOutput { stdout, stderr }) => {
                self.wait_with_piped_async_outputs(
                    stdout_pipe,
                    Some(BufReader::new(stdout)),
                    Some(BufReader::new(stderr)),
                )
                .await
            }
            None => Ok(self.wait().await),
        }
    }

    async fn wait_with_piped_async_outputs<R1: AsyncBufRead + Unpin, R2: AsyncBufRead + Unpin>(
        &mut self,
        mut stdout_pipe: impl std::io::Write,
        mut stdout_lines: Option<R1>,
        mut stderr_lines: Option<R2>,
    ) -> Result<Option<ChildExit>, std::io::Error> {
        async fn next_line<R: AsyncBufRead + Unpin>(
            stream: &mut Option<R>,
            buffer: &mut Vec<u8>,
        ) -> Option<Result<(), io::Error>> {
            match stream {
                Some(stream) => match stream.read_until(b'\n', buffer).await {
                    Ok(0) => {
                        trace!("reached EOF");
                        None
                    }
                    Ok(_) => Some(Ok(())),
                    Err(e) => Some(Err(e)),
                },
                None => None,
            }
        }

        let mut stdout_buffer = Vec::new();
        let mut stderr_buffer = Vec::new();

        let mut is_exited = false;
        loop {
            tokio::select! {
                Some(result) = next_line(&mut stdout_lines, &mut stdout_buffer) => {
                    result?;
                    add_trailing_newline(&mut stdout_buffer);
                    stdout_pipe.write_all(&stdout_buffer)?;
                    stdout_buffer.clear();
                }
                Some(result) = next_line(&mut stderr_lines, &mut stderr_buffer) => {
                    result?;
                    add_trailing_newline(&mut stderr_buffer);
                    stdout_pipe.write_all(&stderr_buffer)?;
                    stderr_buffer.clear();
                }
                status = self.wait(), if !is_exited => {
                    trace!("child process exited: {}", self.label());
                    is_exited = true;
                    // On a zero exit we keep draining: the task may be
                    // cached and the log must contain everything.
                    if status != Some(ChildExit::Finished(Some(0))) {
                        debug!("child process failed, skipping reading stdout/stderr");
                        return Ok(status);
                    }
                }
                else => {
                    // Both streams hit EOF. Flush partial lines so the last
                    // line of output is never dropped.
                    if !stdout_buffer.is_empty() {
                        add_trailing_newline(&mut stdout_buffer);
                        stdout_pipe.write_all(&stdout_buffer)?;
                        stdout_buffer.clear();
                    }
                    if !stderr_buffer.is_empty() {
                        add_trailing_newline(&mut stderr_buffer);
                        stdout_pipe.write_all(&stderr_buffer)?;
                        stderr_buffer.clear();
                    }
                    break;
                }
            }
        }
        debug_assert!(stdout_buffer.is_empty(), "buffer should be empty");
        debug_assert!(stderr_buffer.is_empty(), "buffer should be empty");

        Ok(self.wait().await)
    }
}

// If a line doesn't end with a newline we hit EOF mid-line. Add one so
// output from other tasks doesn't get glued onto the same line.
fn add_trailing_newline(buffer: &mut Vec<u8>) {
    if buffer.last() != Some(&b'\n') {
        buffer.push(b'\n');
    }
}

impl ChildStateManager {
    async fn handle_child_command(&self, command: Option<ChildCommand>, child: &mut ChildHandle) {
        let exit = match command {
            // the sender dropping is treated the same as an explicit stop
            Some(ChildCommand::Stop) | None => {
                debug!("stopping child process");
                self.shutdown_style.process(child).await
            }
            Some(ChildCommand::Kill) => {
                debug!("killing child process");
                ShutdownStyle::Kill.process(child).await
            }
        };
        trace!("sending child exit after shutdown");
        self.exit_tx.send(Some(exit)).ok();
    }

    async fn handle_child_exit(&self, status: io::Result<Option<i32>>) {
        // When a shutdown is in flight the exit reported by
        // `ShutdownStyle::process` wins; the plain `wait` result would
        // misreport the child as externally killed.
        if self.shutdown_initiated {
            return;
        }
        let exit = match status {
            Ok(Some(code)) => ChildExit::Finished(Some(code)),
            // the child was killed by something else on the system
            Ok(None) => ChildExit::KilledExternal,
            Err(_) => ChildExit::Failed,
        };
        self.exit_tx.send(Some(exit)).ok();
    }
}
