// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, OutputCategory, ParamMap, Tool, ToolResult};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
/// 20 KB keeps command output well inside small context windows; the
/// rendering layer applies its own per-tool cap on top.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Built-in tool that runs a shell command inside the project root.
///
/// Destructive-pattern rejection and the timeout bound live in the
/// executor, not here; this handler only spawns and captures.
pub struct RunCommandTool {
    pub workdir: std::path::PathBuf,
}

#[async_trait]
impl Tool for RunCommandTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "run_command",
            "Execute a shell command and return exit code, stdout and stderr. \
             Prefer non-interactive commands; avoid anything that needs a TTY. \
             Use read_file / list_directory for file inspection instead of \
             cat / ls pipelines.",
            ToolCategory::Command,
            [
                ("command", ParamSpec::required(ParamKind::String, "Bash one-liner to execute")),
                (
                    "timeout_secs",
                    ParamSpec::optional(ParamKind::Integer, "Time limit (clamped 5s-5min)"),
                ),
            ],
        )
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let command = params.get("command").and_then(|v| v.as_str()).unwrap_or_default();
        debug!(cmd = %command, "run_command tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            // Isolate the subprocess from any controlling terminal: with
            // stdin on /dev/null, isatty(0) is false and TTY-manipulating
            // code paths are skipped.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The executor enforces the timeout by dropping this future;
            // the child must die with it.
            .kill_on_drop(true);

        let output = match cmd.output().await {
            Ok(o) => o,
            Err(e) => {
                return ToolResult::err(ErrorKind::ToolExecution, format!("spawn error: {e}"))
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        if combined.len() > OUTPUT_LIMIT_BYTES {
            let cut = combined
                .char_indices()
                .take_while(|(i, _)| *i <= OUTPUT_LIMIT_BYTES)
                .last()
                .map(|(i, _)| i)
                .unwrap_or(0);
            combined.truncate(cut);
            combined.push_str("\n…[output truncated]");
        }

        ToolResult::ok(json!({
            "exit_code": exit_code,
            "output": combined,
        }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tool() -> RunCommandTool {
        RunCommandTool { workdir: std::env::temp_dir() }
    }

    fn params(cmd: &str) -> ParamMap {
        json!({"command": cmd}).as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = tool().execute(&params("echo hello")).await;
        let p = out.payload().unwrap();
        assert_eq!(p["exit_code"], 0);
        assert!(p["output"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn captures_nonzero_exit_code() {
        let out = tool().execute(&params("exit 3")).await;
        assert_eq!(out.payload().unwrap()["exit_code"], 3);
    }

    #[tokio::test]
    async fn captures_stderr() {
        let out = tool().execute(&params("echo oops >&2")).await;
        assert!(out.payload().unwrap()["output"]
            .as_str()
            .unwrap()
            .contains("oops"));
    }

    #[tokio::test]
    async fn runs_in_configured_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let t = RunCommandTool { workdir: dir.path().to_path_buf() };
        let out = t.execute(&params("pwd")).await;
        let printed = out.payload().unwrap()["output"].as_str().unwrap().trim().to_string();
        // macOS tempdirs involve symlinks; compare canonical forms.
        assert_eq!(
            std::fs::canonicalize(&printed).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn oversized_output_is_capped() {
        let out = tool().execute(&params("yes x | head -c 100000")).await;
        let text = out.payload().unwrap()["output"].as_str().unwrap().to_string();
        assert!(text.len() < 30_000);
        assert!(text.contains("[output truncated]"));
    }
}
