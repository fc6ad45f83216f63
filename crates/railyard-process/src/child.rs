//! A single task subprocess.
//!
//! The process is spawned in its own process group so an interrupt reaches
//! the whole tree the script may have forked. A small actor owns the OS
//! handle; callers interact through clonable command/exit channels, so any
//! number of holders can wait on or stop the same child.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    process::Command as TokioCommand,
    sync::{mpsc, watch},
};
use tracing::{debug, trace};

use crate::Command;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChildExit {
    Finished(Option<i32>),
    /// The child shut down on its own after the interrupt.
    Interrupted,
    /// The child ignored the interrupt (or none was sent) and was killed.
    Killed,
    /// A syscall against the child failed.
    Failed,
}

#[derive(Debug, Clone)]
pub enum ShutdownStyle {
    /// Send an interrupt, then kill if the child is still alive after the
    /// grace period. On windows there is no interrupt, so this kills
    /// immediately.
    Graceful(Duration),
    Kill,
}

struct ChildHandle {
    pid: Option<u32>,
    child: tokio::process::Child,
}

struct ChildOutput {
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
}

impl ChildHandle {
    fn spawn(command: Command) -> io::Result<(Self, ChildOutput)> {
        let mut command = TokioCommand::from(command);

        // Place the child in a fresh process group so signals reach every
        // process the script spawns.
        #[cfg(unix)]
        {
            use nix::unistd::setsid;
            unsafe {
                command.pre_exec(|| {
                    setsid()?;
                    Ok(())
                });
            }
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

        Ok((Self { pid, child }, ChildOutput { stdout, stderr }))
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn shutdown(&mut self, style: &ShutdownStyle) -> ChildExit {
        match style {
            ShutdownStyle::Graceful(grace_period) => {
                #[cfg(unix)]
                {
                    let interrupt_and_wait = async {
                        if let Some(pid) = self.pid {
                            debug!("sending SIGINT to process group {pid}");
                            // A negative pid targets the whole group.
                            let pgid = -(pid as i32);
                            if unsafe { libc::kill(pgid, libc::SIGINT) } == -1 {
                                debug!("failed to send SIGINT to {pgid}");
                            }
                            self.wait().await
                        } else {
                            Ok(None)
                        }
                    };

                    match tokio::time::timeout(*grace_period, interrupt_and_wait).await {
                        // We sent the interrupt ourselves, so the exit code
                        // of the interrupted child carries no signal.
                        Ok(Ok(_)) => ChildExit::Interrupted,
                        Ok(Err(_)) => ChildExit::Failed,
                        Err(_) => {
                            debug!("graceful shutdown timed out, killing child");
                            match self.kill().await {
                                Ok(()) => ChildExit::Killed,
                                Err(_) => ChildExit::Failed,
                            }
                        }
                    }
                }

                #[cfg(windows)]
                {
                    debug!("graceful shutdown unsupported on windows, killing");
                    match self.kill().await {
                        Ok(()) => ChildExit::Killed,
                        Err(_) => ChildExit::Failed,
                    }
                }
            }
            ShutdownStyle::Kill => match self.kill().await {
                Ok(()) => ChildExit::Killed,
                Err(_) => ChildExit::Failed,
            },
        }
    }
}

enum ChildCommand {
    Stop,
    Kill,
}

#[derive(Clone)]
pub struct Child {
    pid: Option<u32>,
    command_channel: mpsc::Sender<ChildCommand>,
    exit_channel: watch::Receiver<Option<ChildExit>>,
    output: Arc<Mutex<Option<ChildOutput>>>,
    label: String,
}

impl Child {
    /// Starts the process immediately and hands back the interaction handle.
    pub fn spawn(command: Command, shutdown_style: ShutdownStyle) -> io::Result<Self> {
        let label = command.label();
        let (mut handle, output) = ChildHandle::spawn(command)?;
        let pid = handle.pid;

        let (command_tx, mut command_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            debug!("waiting for process {pid:?}");
            let exit = tokio::select! {
                biased;
                command = command_rx.recv() => {
                    match command {
                        Some(ChildCommand::Stop) => handle.shutdown(&shutdown_style).await,
                        // An explicit kill skips the grace period.
                        Some(ChildCommand::Kill) => handle.shutdown(&ShutdownStyle::Kill).await,
                        // Every Child clone dropped; nothing can observe the
                        // exit, but we still reap the process.
                        None => handle.shutdown(&ShutdownStyle::Kill).await,
                    }
                }
                status = handle.wait() => {
                    match status {
                        Ok(code) => ChildExit::Finished(code),
                        Err(_) => ChildExit::Failed,
                    }
                }
            };
            trace!("process {pid:?} exited: {exit:?}");
            exit_tx.send(Some(exit)).ok();
        });

        Ok(Self {
            pid,
            command_channel: command_tx,
            exit_channel: exit_rx,
            output: Arc::new(Mutex::new(Some(output))),
            label,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the child to reach a terminal state.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        trace!("watching exit channel of {}", self.label);
        // A closed channel means the actor already published the final state.
        self.exit_channel.changed().await.ok();
        *self.exit_channel.borrow()
    }

    /// Graceful shutdown: interrupt, then kill after the grace period.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        // A send failure means the actor is already gone; wait picks up the
        // published exit.
        self.command_channel.send(ChildCommand::Stop).await.ok();
        self.wait().await
    }

    /// Immediate kill.
    pub async fn kill(&mut self) -> Option<ChildExit> {
        self.command_channel.send(ChildCommand::Kill).await.ok();
        self.wait().await
    }

    /// Waits for the child while pumping interleaved stdout/stderr lines into
    /// `writer`. Only the first caller gets the output; later callers just
    /// wait.
    pub async fn wait_with_piped_outputs<W: Write>(
        &mut self,
        mut writer: W,
    ) -> Result<Option<ChildExit>, io::Error> {
        let Some(ChildOutput { stdout, stderr }) =
            self.output.lock().expect("child output lock poisoned").take()
        else {
            return Ok(self.wait().await);
        };

        let pump = pump_output(
            BufReader::new(stdout),
            BufReader::new(stderr),
            &mut writer,
        );
        let (exit, pumped) = tokio::join!(self.wait(), pump);
        pumped?;
        Ok(exit)
    }
}

async fn pump_output<R1, R2, W>(
    mut stdout: R1,
    mut stderr: R2,
    writer: &mut W,
) -> Result<(), io::Error>
where
    R1: AsyncBufRead + Unpin,
    R2: AsyncBufRead + Unpin,
    W: Write,
{
    async fn next_line<R: AsyncBufRead + Unpin>(
        stream: &mut Option<&mut R>,
        buffer: &mut Vec<u8>,
    ) -> Option<Result<(), io::Error>> {
        match stream {
            Some(reader) => match reader.read_until(b'\n', buffer).await {
                Ok(0) => None,
                Ok(_) => Some(Ok(())),
                Err(err) => Some(Err(err)),
            },
            None => None,
        }
    }

    let mut stdout = Some(&mut stdout);
    let mut stderr = Some(&mut stderr);
    let mut stdout_buffer = Vec::new();
    let mut stderr_buffer = Vec::new();

    loop {
        tokio::select! {
            result = next_line(&mut stdout, &mut stdout_buffer), if stdout.is_some() => {
                match result {
                    Some(result) => {
                        result?;
                        flush_line(writer, &mut stdout_buffer)?;
                    }
                    None => stdout = None,
                }
            }
            result = next_line(&mut stderr, &mut stderr_buffer), if stderr.is_some() => {
                match result {
                    Some(result) => {
                        result?;
                        flush_line(writer, &mut stderr_buffer)?;
                    }
                    None => stderr = None,
                }
            }
            else => break,
        }
    }

    // Partial lines without a trailing newline still belong to the output.
    flush_line(writer, &mut stdout_buffer)?;
    flush_line(writer, &mut stderr_buffer)?;
    Ok(())
}

fn flush_line<W: Write>(writer: &mut W, buffer: &mut Vec<u8>) -> Result<(), io::Error> {
    if buffer.is_empty() {
        return Ok(());
    }
    if buffer.last() != Some(&b'\n') {
        buffer.push(b'\n');
    }
    writer.write_all(buffer)?;
    buffer.clear();
    Ok(())
}
