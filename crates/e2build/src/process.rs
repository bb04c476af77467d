//! External tool execution.
//!
//! Every external program the core shells out to (git, svn, tar, rsync, scp,
//! ssh, patch, the su helper) goes through [`run_tool`]. Output is captured,
//! never streamed to the terminal; callers decide what to surface. Programs
//! can be overridden through environment variables, which is also the seam
//! the tests use to substitute fake binaries.

use std::env;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// First line of stdout, trimmed. For tools that answer with one token.
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or("").trim()
    }
}

/// Run a tool to completion, capturing its output.
///
/// With a timeout, the child is polled and killed once the deadline passes;
/// whatever output it produced is still returned, with a note appended to
/// stderr.
pub fn run_tool(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    envs: &[(&str, &str)],
    timeout: Option<Duration>,
) -> Result<ToolOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir);
    for (k, v) in envs {
        command.env(k, v);
    }

    let (exit_code, stdout, stderr, timed_out) = if let Some(timeout_dur) = timeout {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let deadline = Instant::now() + timeout_dur;
        loop {
            match child
                .try_wait()
                .with_context(|| format!("failed to poll {program}"))?
            {
                Some(status) => {
                    let (out, err) = drain_pipes(&mut child);
                    break (status.code().unwrap_or(-1), out, err, false);
                }
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let (out, mut err) = drain_pipes(&mut child);
                        err.push_str(&format!(
                            "\n{program} timed out after {}",
                            humantime::format_duration(timeout_dur)
                        ));
                        break (-1, out, err, true);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    } else {
        let output = command
            .output()
            .with_context(|| format!("failed to execute {program}"))?;
        (
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            false,
        )
    };

    Ok(ToolOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn drain_pipes(child: &mut std::process::Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

fn program_from_env(var: &str, default: &str) -> String {
    env::var(var).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

pub fn git_program() -> String {
    program_from_env("E2_GIT_BIN", "git")
}

pub fn svn_program() -> String {
    program_from_env("E2_SVN_BIN", "svn")
}

pub fn tar_program() -> String {
    program_from_env("E2_TAR_BIN", "tar")
}

pub fn patch_program() -> String {
    program_from_env("E2_PATCH_BIN", "patch")
}

pub fn rsync_program() -> String {
    program_from_env("E2_RSYNC_BIN", "rsync")
}

pub fn scp_program() -> String {
    program_from_env("E2_SCP_BIN", "scp")
}

/// The remote shell. `E2_SSH` is part of the documented interface.
pub fn ssh_program() -> String {
    program_from_env("E2_SSH", "ssh")
}

pub fn su_program() -> String {
    program_from_env("E2_SU_BIN", "e2-su-2.2")
}
