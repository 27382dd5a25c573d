use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

/// Outcome of one external build invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub success: bool,
    /// Combined stdout/stderr, kept for diagnostics
    pub output: String,
}

impl BuildOutput {
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }

    /// Last few lines of output, for error messages.
    pub fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.output.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    /// `Err(Build)` reading "<step> failed: <output tail>" when the step failed.
    pub fn into_result(self, step: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(UpdaterError::Build(format!("{step} failed: {}", self.tail(5))))
        }
    }
}

/// The distribution's own build tooling.
pub trait BuildRunner: Send + Sync {
    /// Recompile the distribution's executables.
    fn rebuild(&self) -> BuildOutput;

    /// Resolve and tidy the build manifest.
    fn refresh_dependencies(&self) -> BuildOutput;
}

/// BuildRunner that spawns the configured commands in the distribution root.
pub struct CommandBuildRunner {
    working_dir: PathBuf,
    rebuild_command: Vec<String>,
    dependency_refresh_command: Vec<String>,
}

impl CommandBuildRunner {
    pub fn new(config: &UpdaterConfig) -> Self {
        Self {
            working_dir: config.root.clone(),
            rebuild_command: config.rebuild_command.clone(),
            dependency_refresh_command: config.dependency_refresh_command.clone(),
        }
    }

    /// Run a command, streaming its output to the log and capturing it.
    fn execute(working_dir: &Path, command: &[String]) -> BuildOutput {
        let Some((program, args)) = command.split_first() else {
            return BuildOutput::failed("no command configured");
        };
        tracing::info!(command = %command.join(" "), "executing build command");

        let mut child = match Command::new(program)
            .current_dir(working_dir)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return BuildOutput::failed(format!("Failed to spawn {program}: {e}")),
        };

        // stderr drained on its own thread so a chatty build can't block on a full pipe
        let stderr_reader = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut captured = String::new();
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    tracing::debug!(target: "build", "{line}");
                    captured.push_str(&line);
                    captured.push('\n');
                }
                captured
            })
        });

        let mut output = String::new();
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                tracing::debug!(target: "build", "{line}");
                output.push_str(&line);
                output.push('\n');
            }
        }

        if let Some(handle) = stderr_reader {
            if let Ok(captured) = handle.join() {
                output.push_str(&captured);
            }
        }

        match child.wait() {
            Ok(status) if status.success() => BuildOutput {
                success: true,
                output,
            },
            Ok(status) => {
                output.push_str(&format!(
                    "{} exited with code {}\n",
                    command.join(" "),
                    status.code().unwrap_or(-1)
                ));
                BuildOutput::failed(output)
            }
            Err(e) => {
                output.push_str(&format!("Failed to wait for {program}: {e}\n"));
                BuildOutput::failed(output)
            }
        }
    }
}

impl BuildRunner for CommandBuildRunner {
    fn rebuild(&self) -> BuildOutput {
        Self::execute(&self.working_dir, &self.rebuild_command)
    }

    fn refresh_dependencies(&self) -> BuildOutput {
        Self::execute(&self.working_dir, &self.dependency_refresh_command)
    }
}
