use crate::error::ExecError;
use crate::model::{truncate_text, MAX_DETAIL_LEN};
use crate::remediation::Credential;
use crate::BoxFuture;
use log::debug;
use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// ssh reserves this exit status for its own connection failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// What the remote command returned; output is a bounded prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Remote-shell-style execution channel
pub trait RemoteExecutor: Send + Sync {
    fn exec<'a>(
        &'a self,
        credential: &'a Credential,
        user: &'a str,
        host: &'a str,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<ExecOutput, ExecError>>;
}

/// Runs commands through the system `ssh` client in batch mode
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: OsString,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            program: OsString::from("ssh"),
            connect_timeout,
        }
    }

    /// Use a different client binary
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    fn build_args(
        &self,
        credential: &Credential,
        user: &str,
        host: &str,
        command: &str,
    ) -> Vec<OsString> {
        let connect_timeout = self.connect_timeout.as_secs().max(1);
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            credential.identity_file.clone().into_os_string(),
        ];
        for option in [
            "BatchMode=yes".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            format!("ConnectTimeout={}", connect_timeout),
        ] {
            args.push("-o".into());
            args.push(option.into());
        }
        args.push("--".into());
        args.push(format!("{}@{}", user, host).into());
        args.push(command.into());
        args
    }
}

impl RemoteExecutor for SshExecutor {
    fn exec<'a>(
        &'a self,
        credential: &'a Credential,
        user: &'a str,
        host: &'a str,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<ExecOutput, ExecError>> {
        Box::pin(async move {
            let args = self.build_args(credential, user, host, command);
            debug!("Running remote command on {}@{}", user, host);

            let child = Command::new(&self.program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output();

            let output = match tokio::time::timeout(timeout, child).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(ExecError::Connection(format!(
                        "failed to spawn {}: {}",
                        self.program.to_string_lossy(),
                        e
                    )))
                }
                Err(_) => return Err(ExecError::Timeout(timeout)),
            };

            let stdout = truncate_text(&String::from_utf8_lossy(&output.stdout), MAX_DETAIL_LEN);
            let stderr = truncate_text(&String::from_utf8_lossy(&output.stderr), MAX_DETAIL_LEN);

            match output.status.code() {
                Some(SSH_CONNECTION_FAILURE) => Err(ExecError::Connection(stderr.trim().to_string())),
                Some(exit_status) => Ok(ExecOutput {
                    exit_status,
                    stdout,
                    stderr,
                }),
                None => Err(ExecError::Connection(
                    "remote session terminated by signal".to_string(),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn credential() -> Credential {
        Credential {
            reference: "server-001-key.pem".to_string(),
            identity_file: PathBuf::from("/keys/server-001-key.pem"),
        }
    }

    #[test]
    fn test_build_args() {
        let executor = SshExecutor::new(Duration::from_secs(30));
        let args = executor.build_args(
            &credential(),
            "bitnami",
            "10.0.0.2",
            "sudo /opt/bitnami/ctlscript.sh restart apache",
        );
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "/keys/server-001-key.pem");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        let dash = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[dash + 1], "bitnami@10.0.0.2");
        assert_eq!(
            args[dash + 2],
            "sudo /opt/bitnami/ctlscript.sh restart apache"
        );
        assert_eq!(args.len(), dash + 3);
    }

    #[cfg(unix)]
    fn fake_ssh(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ssh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_captures_exit_status_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ssh(dir.path(), "echo restarted; echo warn >&2; exit 3");
        let executor = SshExecutor::new(Duration::from_secs(5)).with_program(program);

        let output = executor
            .exec(&credential(), "ubuntu", "10.0.0.3", "sudo systemctl restart apache2", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(output.exit_status, 3);
        assert_eq!(output.stdout.trim(), "restarted");
        assert_eq!(output.stderr.trim(), "warn");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_bounds_output() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ssh(
            dir.path(),
            "i=0; while [ $i -lt 50 ]; do printf 'xxxxxxxxxx'; i=$((i+1)); done",
        );
        let executor = SshExecutor::new(Duration::from_secs(5)).with_program(program);

        let output = executor
            .exec(&credential(), "ubuntu", "10.0.0.3", "true", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.stdout.len() <= MAX_DETAIL_LEN);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_connection_failure() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ssh(
            dir.path(),
            "echo 'ssh: connect to host 10.0.0.3 port 22: Connection refused' >&2; exit 255",
        );
        let executor = SshExecutor::new(Duration::from_secs(5)).with_program(program);

        let err = executor
            .exec(&credential(), "ubuntu", "10.0.0.3", "true", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ExecError::Connection(message) => assert!(message.contains("Connection refused")),
            other => panic!("Expected Connection error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ssh(dir.path(), "sleep 5");
        let executor = SshExecutor::new(Duration::from_secs(5)).with_program(program);

        let err = executor
            .exec(&credential(), "ubuntu", "10.0.0.3", "true", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_exec_missing_program_is_connection_error() {
        let executor = SshExecutor::new(Duration::from_secs(5))
            .with_program("/nonexistent/sentinel-ssh");
        let err = executor
            .exec(&credential(), "ubuntu", "10.0.0.3", "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Connection(_)));
    }
}
