//! Launching a local Jupyter server.
//!
//! The server is started in a private temp directory and its output is
//! scanned for the URL it listens on. Launch fails if the process exits
//! first, the launch timeout elapses, or the caller cancels.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::command::JupyterCommand;
use crate::config::MercuryConfig;
use crate::connection::ConnectionInfo;
use crate::error::{Error, Result};

/// Run state of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited; `None` when killed by a signal.
    Exited(Option<i32>),
}

/// A running Jupyter server started by this process.
pub struct LaunchedServer {
    connection_info: ConnectionInfo,
    state: watch::Receiver<ProcessState>,
    kill: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    temp_dir: Option<tempfile::TempDir>,
}

impl LaunchedServer {
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }

    /// Exit code, once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        match *self.state.borrow() {
            ProcessState::Running => None,
            ProcessState::Exited(code) => code,
        }
    }

    pub fn has_exited(&self) -> bool {
        matches!(*self.state.borrow(), ProcessState::Exited(_))
    }

    /// Directory the server was started in.
    pub fn notebook_dir(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(|d| d.path())
    }

    /// Kill the process and delete the temp directory. Safe to repeat.
    pub async fn shutdown(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
        }
        if let Some(dir) = self.temp_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for LaunchedServer {
    fn drop(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Find a server URL in one line of Jupyter output.
pub fn find_server_url(line: &str) -> Option<ConnectionInfo> {
    line.split_whitespace()
        .filter(|word| word.starts_with("http://") || word.starts_with("https://"))
        .filter(|word| {
            word.contains("token=")
                || ["localhost", "127.0.0.1", "0.0.0.0", "[::1]"]
                    .iter()
                    .any(|host| word.split("://").nth(1).is_some_and(|rest| rest.starts_with(host)))
        })
        .find_map(|word| ConnectionInfo::from_server_url(word, true))
}

fn spawn_output_reader<R>(
    stream: R,
    label: &'static str,
    found: mpsc::UnboundedSender<ConnectionInfo>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("jupyter {}: {}", label, line);
            if let Some(info) = find_server_url(&line) {
                let _ = found.send(info);
            }
        }
    })
}

fn spawn_monitor(
    mut child: Child,
    state: watch::Sender<ProcessState>,
    kill: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill => {
                if let Err(e) = child.kill().await {
                    tracing::debug!("Killing jupyter failed: {}", e);
                }
                child.wait().await
            }
        };
        let code = status.ok().and_then(|s| s.code());
        tracing::info!("Jupyter server exited (code {:?})", code);
        let _ = state.send(ProcessState::Exited(code));
    })
}

async fn wait_for_exit(mut state: watch::Receiver<ProcessState>) -> Option<i32> {
    match state
        .wait_for(|s| matches!(s, ProcessState::Exited(_)))
        .await
        .map(|s| *s)
    {
        Ok(ProcessState::Exited(code)) => code,
        _ => None,
    }
}

/// Starts Jupyter servers.
pub struct JupyterLauncher {
    jupyter: JupyterCommand,
    config: MercuryConfig,
}

impl JupyterLauncher {
    pub fn new(jupyter: JupyterCommand, config: MercuryConfig) -> Self {
        Self { jupyter, config }
    }

    pub fn from_config(config: &MercuryConfig) -> Result<Self> {
        Ok(Self::new(JupyterCommand::from_config(config)?, config.clone()))
    }

    /// Arguments for `jupyter`.
    pub fn build_args(&self, notebook_dir: &Path, blank_config: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "notebook".to_string(),
            "--no-browser".to_string(),
            format!("--notebook-dir={}", notebook_dir.display()),
        ];
        if let Some(config) = blank_config {
            args.push(format!("--config={}", config.display()));
        }
        args.push(format!(
            "--NotebookApp.iopub_data_rate_limit={:.1}",
            self.config.iopub_data_rate_limit
        ));
        args
    }

    /// Start a server and wait until it reports where it listens.
    pub async fn launch(
        &self,
        use_default_config: bool,
        cancel: &CancelToken,
    ) -> Result<LaunchedServer> {
        cancel.check()?;

        let temp_dir = tempfile::Builder::new().prefix("mercury-").tempdir()?;
        let blank_config: Option<PathBuf> = if use_default_config {
            None
        } else {
            let path = temp_dir.path().join("jupyter_notebook_config.py");
            std::fs::write(&path, "")?;
            Some(path)
        };
        let args = self.build_args(temp_dir.path(), blank_config.as_deref());
        tracing::info!("Starting {} {}", self.jupyter.program.display(), args.join(" "));

        let mut child = self
            .jupyter
            .command(&args)
            .current_dir(temp_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::KernelStartFailure {
                message: format!("failed to spawn {}: {}", self.jupyter.program.display(), e),
                exit_code: None,
            })?;

        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader(stdout, "stdout", found_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader(stderr, "stderr", found_tx.clone());
        }
        drop(found_tx);

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = spawn_monitor(child, state_tx, kill_rx);

        let mut server = LaunchedServer {
            connection_info: ConnectionInfo::local("http://localhost/", ""),
            state: state_rx.clone(),
            kill: Some(kill_tx),
            monitor: Some(monitor),
            temp_dir: Some(temp_dir),
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            Some(info) = found_rx.recv() => Ok(info),
            code = wait_for_exit(state_rx) => Err(Error::KernelStartFailure {
                message: "jupyter exited before reporting its URL".to_string(),
                exit_code: code,
            }),
            _ = tokio::time::sleep(self.config.launch_timeout()) => Err(Error::KernelStartFailure {
                message: format!("no server URL within {:?}", self.config.launch_timeout()),
                exit_code: None,
            }),
        };

        match outcome {
            Ok(info) => {
                tracing::info!("Jupyter server listening at {}", info.base_url);
                server.connection_info = info;
                Ok(server)
            }
            Err(e) => {
                server.shutdown().await;
                Err(e)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_launcher(script: &str) -> JupyterLauncher {
        let mut jupyter = JupyterCommand::new("sh");
        jupyter.args = vec!["-c".to_string(), script.to_string()];
        let config = MercuryConfig {
            launch_timeout_ms: 5_000,
            ..MercuryConfig::default()
        };
        JupyterLauncher::new(jupyter, config)
    }

    #[test]
    fn test_build_args() {
        let launcher = sh_launcher("true");
        let args = launcher.build_args(Path::new("/tmp/nb"), Some(Path::new("/tmp/nb/c.py")));
        assert_eq!(
            args,
            vec![
                "notebook",
                "--no-browser",
                "--notebook-dir=/tmp/nb",
                "--config=/tmp/nb/c.py",
                "--NotebookApp.iopub_data_rate_limit=10000000000.0",
            ]
        );
        let args = launcher.build_args(Path::new("/tmp/nb"), None);
        assert!(!args.iter().any(|a| a.starts_with("--config")));
    }

    #[test]
    fn test_find_server_url() {
        let info = find_server_url("[I 10:00:00.000 NotebookApp] http://localhost:8888/?token=abc123").unwrap();
        assert_eq!(info.base_url, "http://localhost:8888/");
        assert_eq!(info.token, "abc123");
        assert!(info.local_launch);

        assert!(find_server_url("see https://jupyter-notebook.readthedocs.io/en/latest/").is_none());
        assert!(find_server_url("no url here").is_none());
    }

    #[tokio::test]
    async fn test_exit_before_url_is_start_failure() {
        let launcher = sh_launcher("echo starting; exit 3");
        let result = launcher.launch(false, &CancelToken::new()).await;
        match result {
            Err(Error::KernelStartFailure { exit_code, .. }) => assert_eq!(exit_code, Some(3)),
            other => panic!("expected start failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_cancel_wins() {
        let launcher = sh_launcher("sleep 5");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = launcher.launch(false, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_url_found_and_shutdown_is_repeatable() {
        let launcher = sh_launcher("echo '  http://127.0.0.1:9999/?token=tok'; sleep 30");
        let mut server = launcher.launch(false, &CancelToken::new()).await.unwrap();
        assert_eq!(server.connection_info().base_url, "http://127.0.0.1:9999/");
        assert_eq!(server.connection_info().token, "tok");

        let dir = server.notebook_dir().unwrap().to_path_buf();
        assert!(dir.join("jupyter_notebook_config.py").exists());

        server.shutdown().await;
        assert!(server.has_exited());
        assert!(!dir.exists());
        server.shutdown().await;
    }
}
