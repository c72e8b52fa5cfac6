// ABOUTME: spawns one interpreter process per execution in its own process group with piped output.
// ABOUTME: exposes wait with an optional deadline plus graceful terminate and forced kill of the group.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use scriptbox_common::ScriptType;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::config::EngineConfig;

/// Program plus arguments; the script content is always the final argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn for_script(config: &EngineConfig, script_type: ScriptType, content: &str) -> Option<Invocation> {
        let (program, rest) = config.interpreter(script_type)?.split_first()?;
        let mut args = rest.to_vec();
        args.push(content.to_string());
        Some(Invocation {
            program: program.clone(),
            args,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    TimedOut,
}

pub struct ScriptProcess {
    child: Child,
    pid: Option<u32>,
}

pub struct SpawnedScript {
    pub process: ScriptProcess,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub fn spawn(invocation: &Invocation, parameters: &BTreeMap<String, String>) -> io::Result<SpawnedScript> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .envs(parameters)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stderr was not captured"))?;
    let pid = child.id();

    Ok(SpawnedScript {
        process: ScriptProcess { child, pid },
        stdout,
        stderr,
    })
}

impl ScriptProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for exit; on an elapsed deadline the process is left running.
    pub async fn wait(&mut self, deadline: Option<Duration>) -> io::Result<ExitOutcome> {
        let status = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => return Ok(ExitOutcome::TimedOut),
            },
            None => self.child.wait().await?,
        };
        Ok(ExitOutcome::Exited(exit_code(status)))
    }

    pub fn terminate(&self) -> io::Result<()> {
        self.signal_group(Signal::SIGTERM)
    }

    pub fn kill(&mut self) -> io::Result<()> {
        let group = self.signal_group(Signal::SIGKILL);
        match self.child.start_kill() {
            // already reaped, nothing left to kill
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => group,
            other => other.and(group),
        }
    }

    fn signal_group(&self, signal: Signal) -> io::Result<()> {
        // a pid is not recycled while a process group with that id still has members
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    status.signal().map_or(-1, |signal| 128 + signal)
}
