//! `EXEC` invocation (§4.5, §4.9): runs the configured `cf_run_command`
//! under the caller-proposed class defines, after the dispatcher has
//! already checked `rsa_auth`, `allow_users`, and role authorization.

use std::process::Command;

use crate::error::{Result, ServerError};

/// Run `cf_run_command` with the proposed classes appended as a
/// `--define` argument, capturing combined stdout for the reply.
pub fn run_command(cf_run_command: &str, proposed_classes: &[String]) -> Result<Vec<u8>> {
    if cf_run_command.is_empty() {
        return Err(ServerError::Resource("no cf_run_command configured".to_string()));
    }
    let mut parts = cf_run_command.split_whitespace();
    let program = parts.next().ok_or_else(|| ServerError::Resource("empty cf_run_command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(parts);
    if !proposed_classes.is_empty() {
        cmd.arg("--define").arg(proposed_classes.join(","));
    }

    let output = cmd
        .output()
        .map_err(|e| ServerError::Resource(format!("spawn {}: {}", program, e)))?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_refused() {
        assert!(run_command("", &[]).is_err());
    }

    #[test]
    fn runs_and_captures_stdout() {
        let out = run_command("/bin/echo hello", &["role1".to_string()]).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("hello"));
    }
}
