use crate::credentials::Credentials;
use crate::image::{ImageBuilder, ImageReference, TagSource, ToolError};
use crate::image_reference::ImageUrl;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `docker` executable wrapper. Every invocation is killed when it exceeds
/// the timeout or when the cancellation token fires.
pub struct DockerCli {
    executable: String,
    timeout: Duration,
    cancel: CancellationToken,
}

impl DockerCli {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            executable: "docker".to_string(),
            timeout,
            cancel,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// The Dockerfile itself is piped on stdin, see `-f -`.
    fn build_command_args(
        image: &ImageReference,
        build_args: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut args = vec!["build".to_string(), "-f".to_string(), "-".to_string()];
        for tag in image.tags() {
            args.push("-t".to_string());
            args.push(image.image_url().with_tag(tag));
        }
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.dockerfile().context().display().to_string());
        args
    }

    /// Runs the executable and returns stdout.
    async fn run(&self, args: &[String], stdin: Option<String>) -> Result<String, ToolError> {
        let command = format!("{} {}", self.executable, args.join(" "));
        debug!("Running: {}", command);

        let mut child = Command::new(&self.executable)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.executable.clone(),
                source,
            })?;

        let stdin_pipe = child.stdin.take();
        let process = async move {
            if let (Some(mut pipe), Some(input)) = (stdin_pipe, stdin) {
                match pipe.write_all(input.as_bytes()).await {
                    // the process exited without reading, its status tells why
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e),
                    Ok(()) => {}
                }
                // closing stdin ends the input
                drop(pipe);
            }
            child.wait_with_output().await
        };

        let output = tokio::select! {
            result = tokio::time::timeout(self.timeout, process) => match result {
                Ok(output) => output.map_err(|source| ToolError::Spawn {
                    program: self.executable.clone(),
                    source,
                })?,
                Err(_) => {
                    warn!("Killing `{}` after {:?}", command, self.timeout);
                    return Err(ToolError::TimedOut { command, timeout: self.timeout });
                }
            },
            _ = self.cancel.cancelled() => {
                warn!("Killing `{}`, cancellation requested", command);
                return Err(ToolError::Cancelled { command });
            }
        };

        if !output.status.success() {
            return Err(ToolError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build(
        &self,
        image: &ImageReference,
        build_args: &BTreeMap<String, String>,
    ) -> Result<(), ToolError> {
        let args = Self::build_command_args(image, build_args);
        self.run(&args, Some(image.dockerfile().to_string())).await?;
        Ok(())
    }

    async fn push(&self, image_url: &ImageUrl, tag: &str) -> Result<(), ToolError> {
        self.run(&["push".to_string(), image_url.with_tag(tag)], None)
            .await?;
        Ok(())
    }
}

/// Tags of locally available images.
#[async_trait]
impl TagSource for DockerCli {
    async fn tags(
        &self,
        image_url: &ImageUrl,
        _credentials: &Credentials,
    ) -> Result<Vec<String>, ToolError> {
        let args = [
            "image".to_string(),
            "ls".to_string(),
            image_url.to_string(),
            "--format".to_string(),
            "{{.Tag}}".to_string(),
        ];
        let stdout = self.run(&args, None).await?;

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|tag| !tag.is_empty() && *tag != "<none>")
            .map(str::to_owned)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::reference;

    fn cli(executable: &str, timeout: Duration) -> DockerCli {
        DockerCli::new(timeout, CancellationToken::new()).with_executable(executable)
    }

    #[test]
    fn test_build_command_args_include_every_tag_and_sorted_build_args() {
        let image =
            reference("registry.example.com/acme/app").with_tags("v3-assets", ["latest-assets"]);
        let build_args = BTreeMap::from([
            ("RAILS_ENV".to_string(), "production".to_string()),
            ("NODE_ENV".to_string(), "production".to_string()),
        ]);

        let args = DockerCli::build_command_args(&image, &build_args);

        assert_eq!(
            args,
            vec![
                "build",
                "-f",
                "-",
                "-t",
                "registry.example.com/acme/app:v3-assets",
                "-t",
                "registry.example.com/acme/app:latest-assets",
                "--build-arg",
                "NODE_ENV=production",
                "--build-arg",
                "RAILS_ENV=production",
                ".",
            ]
        );
    }

    #[tokio::test]
    async fn test_run_pipes_stdin_and_returns_stdout() {
        let stdout = cli("cat", Duration::from_secs(5))
            .run(&[], Some("FROM alpine\n".to_string()))
            .await
            .unwrap();

        assert_eq!(stdout, "FROM alpine\n");
    }

    #[tokio::test]
    async fn test_run_reports_non_zero_exit() {
        let err = cli("false", Duration::from_secs(5))
            .run(&[], None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ToolError::Failed { ref command, .. } if command.starts_with("false")
        ));
    }

    #[tokio::test]
    async fn test_run_reports_missing_executable() {
        let err = cli("kubeship-no-such-docker", Duration::from_secs(5))
            .run(&[], None)
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let err = cli("sleep", Duration::from_millis(50))
            .run(&["5".to_string()], None)
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_run_is_cancelled() {
        let cancel = CancellationToken::new();
        let docker =
            DockerCli::new(Duration::from_secs(30), cancel.clone()).with_executable("sleep");
        cancel.cancel();

        let err = docker.run(&["5".to_string()], None).await.unwrap_err();

        assert!(matches!(err, ToolError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_build_failure_surfaces_as_tool_error() {
        let image =
            reference("registry.example.com/acme/app").with_tags("v3", Vec::<String>::new());

        let result = cli("false", Duration::from_secs(5))
            .build(&image, &BTreeMap::new())
            .await;

        assert!(matches!(result, Err(ToolError::Failed { .. })));
    }
}
