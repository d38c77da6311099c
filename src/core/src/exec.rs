//! Subprocess execution helpers.
//!
//! Nearly every operation in this system shells out to an external tool:
//! the container engine, the package manager, mksquashfs. These helpers
//! centralize the two invocation shapes used across the workspace —
//! capture-everything, and line-streamed with a progress callback — and
//! turn non-zero exits into errors that carry the exact command line, the
//! combined transcript, and the exit status.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use crate::error::{ForgeError, Result};

/// Render a program and its arguments as a single loggable command line.
pub fn render_command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Run a command to completion and return its stdout.
///
/// On failure the error carries the rendered command line, the exit code,
/// and both output streams. Trailing whitespace is the caller's problem:
/// identifiers printed by the engine are trimmed at the call site.
pub fn run_captured(program: &str, args: &[String]) -> Result<String> {
    let command_line = render_command_line(program, args);
    tracing::debug!(command = %command_line, "Executing");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ForgeError::Command {
            command: command_line.clone(),
            code: None,
            output: format!("failed to spawn: {}", e),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut transcript = stdout;
        if !stderr.is_empty() {
            if !transcript.is_empty() && !transcript.ends_with('\n') {
                transcript.push('\n');
            }
            transcript.push_str(&stderr);
        }
        return Err(ForgeError::Command {
            command: command_line,
            code: output.status.code(),
            output: transcript,
        });
    }

    Ok(stdout)
}

/// Run a command, feeding every output line to `on_line` as it arrives.
///
/// Both pipes are read line-buffered and fully drained before `wait()`;
/// stderr is consumed on a dedicated thread so neither pipe can fill up
/// and deadlock the child. Returns the full transcript on success; on a
/// non-zero exit the transcript rides in the error instead.
pub fn run_streaming(
    program: &str,
    args: &[String],
    mut on_line: impl FnMut(&str),
) -> Result<String> {
    let command_line = render_command_line(program, args);
    tracing::debug!(command = %command_line, "Executing (streamed)");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ForgeError::Command {
            command: command_line.clone(),
            code: None,
            output: format!("failed to spawn: {}", e),
        })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        ForgeError::Command {
            command: command_line.clone(),
            code: None,
            output: "failed to open stdout pipe".to_string(),
        }
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        ForgeError::Command {
            command: command_line.clone(),
            code: None,
            output: "failed to open stderr pipe".to_string(),
        }
    })?;

    let stderr_reader = std::thread::spawn(move || {
        BufReader::new(stderr)
            .lines()
            .map_while(|line| line.ok())
            .collect::<Vec<String>>()
    });

    let mut transcript = String::new();
    for line in BufReader::new(stdout).lines() {
        let line = line.map_err(ForgeError::Io)?;
        on_line(&line);
        transcript.push_str(&line);
        transcript.push('\n');
    }

    for line in stderr_reader.join().unwrap_or_default() {
        on_line(&line);
        transcript.push_str(&line);
        transcript.push('\n');
    }

    let status = child.wait().map_err(ForgeError::Io)?;
    if !status.success() {
        return Err(ForgeError::Command {
            command: command_line,
            code: status.code(),
            output: transcript,
        });
    }

    Ok(transcript)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_render_command_line() {
        assert_eq!(render_command_line("buildah", &[]), "buildah");
        assert_eq!(
            render_command_line("buildah", &args(&["mount", "worker"])),
            "buildah mount worker"
        );
    }

    #[test]
    fn test_run_captured_returns_stdout() {
        let out = run_captured("sh", &args(&["-c", "echo hello"])).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_run_captured_failure_carries_transcript() {
        let err = run_captured("sh", &args(&["-c", "echo visible; echo oops >&2; exit 3"]))
            .unwrap_err();
        match err {
            ForgeError::Command { command, code, output } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(code, Some(3));
                assert!(output.contains("visible"));
                assert!(output.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_run_captured_missing_program() {
        let err = run_captured("definitely-not-a-real-binary", &[]).unwrap_err();
        assert!(matches!(err, ForgeError::Command { code: None, .. }));
    }

    #[test]
    fn test_run_streaming_sees_both_streams() {
        let mut lines = Vec::new();
        let transcript = run_streaming(
            "sh",
            &args(&["-c", "echo one; echo two >&2"]),
            |line| lines.push(line.to_string()),
        )
        .unwrap();
        assert!(lines.contains(&"one".to_string()));
        assert!(lines.contains(&"two".to_string()));
        assert!(transcript.contains("one"));
        assert!(transcript.contains("two"));
    }

    #[test]
    fn test_run_streaming_failure_keeps_transcript() {
        let err = run_streaming("sh", &args(&["-c", "echo progress; exit 1"]), |_| {})
            .unwrap_err();
        match err {
            ForgeError::Command { code, output, .. } => {
                assert_eq!(code, Some(1));
                assert!(output.contains("progress"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
