//! Kernel selection and session startup shared by the commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use mercury_core::{
    CancelToken, ConnectionInfo, GatewayConnector, InterpreterInfo, JupyterLauncher,
    KernelCriteria, KernelSpec, KernelSpecResolver, LaunchInfo, MercuryConfig, SessionManager,
    Version,
};

/// Which kernel to use and where to run it.
#[derive(Args, Debug, Clone, Default)]
pub struct KernelArgs {
    /// Python interpreter the kernel should run
    #[arg(long)]
    pub interpreter: Option<PathBuf>,

    /// Kernel spec name
    #[arg(long, conflicts_with = "interpreter")]
    pub kernel: Option<String>,

    /// URL of a running Jupyter server (one is launched when omitted)
    #[arg(long)]
    pub url: Option<String>,

    /// Token for the server at --url
    #[arg(long, requires = "url")]
    pub token: Option<String>,
}

impl KernelArgs {
    pub fn connection(&self) -> Option<ConnectionInfo> {
        self.url
            .as_ref()
            .map(|url| ConnectionInfo::remote(url.as_str(), self.token.clone().unwrap_or_default()))
    }

    pub async fn criteria(&self) -> Option<KernelCriteria> {
        if let Some(path) = &self.interpreter {
            let mut info = InterpreterInfo::new(path);
            if let Some(version) = probe_version(path).await {
                info = info.with_version(version);
            }
            return Some(KernelCriteria::Interpreter(info));
        }
        self.kernel.as_ref().map(|name| KernelCriteria::Metadata {
            name: name.clone(),
            display_name: None,
            language: None,
        })
    }
}

/// Ask an interpreter for its version (`Python 3.11.4`).
async fn probe_version(path: &Path) -> Option<Version> {
    let output = tokio::process::Command::new(path)
        .arg("--version")
        .output()
        .await
        .ok()?;
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).to_string()
    } else {
        String::from_utf8_lossy(&output.stdout).to_string()
    };
    Version::parse(&text)
}

/// Resolve the kernel spec for `args`.
pub async fn resolve_spec(config: &MercuryConfig, args: &KernelArgs) -> Option<KernelSpec> {
    let resolver = KernelSpecResolver::from_config(config);
    let criteria = args.criteria().await;
    let connection = args.connection();
    resolver
        .get_matching_kernel_spec(criteria.as_ref(), connection.as_ref(), &CancelToken::new())
        .await
}

/// Start a session: connect to `--url`, or launch a local Jupyter server.
///
/// Ctrl+C while starting cancels the launch.
pub async fn open(config: &MercuryConfig, args: &KernelArgs) -> anyhow::Result<Arc<SessionManager>> {
    let spec = resolve_spec(config, args).await;
    match &spec {
        Some(spec) => tracing::info!("Using kernel spec {} ({})", spec.name, spec.display_name),
        None => tracing::warn!("No kernel spec found, using the server default"),
    }

    let cancel = CancelToken::new();
    let on_ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut session = SessionManager::new(config.clone(), Arc::new(GatewayConnector::new()));
    let result = match args.connection() {
        Some(info) => {
            let mut launch = LaunchInfo::new(info);
            launch.kernel_spec = spec;
            session.connect(launch, &cancel).await
        }
        None => {
            if let Some(spec) = spec {
                session = session.with_kernel_spec(spec);
            }
            session = session.with_launcher(JupyterLauncher::from_config(config)?);
            let started = session.start(config.use_default_config, &cancel).await;
            started.map(|info| tracing::info!("Jupyter server running at {}", info.base_url))
        }
    };
    on_ctrl_c.abort();
    result?;
    Ok(Arc::new(session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_from_args() {
        let args = KernelArgs {
            url: Some("http://localhost:8888".to_string()),
            token: Some("abc".to_string()),
            ..KernelArgs::default()
        };
        let info = args.connection().unwrap();
        assert_eq!(info.base_url, "http://localhost:8888/");
        assert_eq!(info.token, "abc");
        assert!(!info.local_launch);

        assert!(KernelArgs::default().connection().is_none());
    }

    #[tokio::test]
    async fn test_criteria_from_kernel_name() {
        let args = KernelArgs {
            kernel: Some("python3".to_string()),
            ..KernelArgs::default()
        };
        match args.criteria().await {
            Some(KernelCriteria::Metadata { name, .. }) => assert_eq!(name, "python3"),
            other => panic!("unexpected criteria {:?}", other),
        }
        assert!(KernelArgs::default().criteria().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_interpreter_has_no_version() {
        let args = KernelArgs {
            interpreter: Some(PathBuf::from("/definitely/not/python")),
            ..KernelArgs::default()
        };
        match args.criteria().await {
            Some(KernelCriteria::Interpreter(info)) => assert!(info.version.is_none()),
            other => panic!("unexpected criteria {:?}", other),
        }
    }
}
