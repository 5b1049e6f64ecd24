//! Typed subprocess runner.
//!
//! External builders (mdadm, zpool, dmsetup, mkfs.*, ...) are spawned
//! from a program + argument vector, never through a shell, with stdin
//! redirected to /dev/null. Output is drained line by line into the
//! diagnostic ring so the `diags` verb can replay what a helper said.
use std::process::{Command, Stdio};

use log::debug;

use crate::diag::diag;
use crate::errors::{CoreError, CoreResult};

/// Run to completion, draining output into the diagnostic ring.
/// Non-zero exit is an error.
pub fn drain(cmd: &mut Command) -> CoreResult<()> {
	drain_output(cmd).map(|_| ())
}

/// As [`drain`], but hand the collected stdout back to the caller.
pub fn drain_output(cmd: &mut Command) -> CoreResult<String> {
	debug!("running {:?}", cmd);
	let out = cmd
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.output()
		.map_err(|e| {
			CoreError::SubprocessFailed(format!(
				"{}: {}",
				cmd.get_program().to_string_lossy(),
				e
			))
		})?;
	let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
	for line in stdout.lines().chain(String::from_utf8_lossy(&out.stderr).lines()) {
		if !line.trim().is_empty() {
			diag!("{}: {}", cmd.get_program().to_string_lossy(), line);
		}
	}
	if out.status.success() {
		Ok(stdout)
	} else if let Some(c) = out.status.code() {
		Err(CoreError::SubprocessFailed(format!(
			"{} exited with code {}",
			cmd.get_program().to_string_lossy(),
			c
		)))
	} else {
		Err(CoreError::SubprocessFailed(format!(
			"{} exited abnormally",
			cmd.get_program().to_string_lossy()
		)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_drain_success_and_failure() {
		let out = drain_output(&mut Command::new("true")).unwrap();
		assert!(out.is_empty());
		assert!(matches!(
			drain(&mut Command::new("false")),
			Err(CoreError::SubprocessFailed(_))
		));
		assert!(matches!(
			drain(&mut Command::new("/definitely/not/a/binary")),
			Err(CoreError::SubprocessFailed(_))
		));
	}

	#[test]
	fn test_output_collection() {
		let mut cmd = Command::new("echo");
		cmd.arg("one").arg("(two)").arg("$three");
		// No shell involved, so metacharacters survive untouched.
		let out = drain_output(&mut cmd).unwrap();
		assert_eq!(out.trim(), "one (two) $three");
	}
}
