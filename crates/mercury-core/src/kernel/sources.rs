//! Places kernel specs are enumerated from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use crate::command::JupyterCommand;
use crate::connection::ConnectionInfo;
use crate::error::{Error, Result};

use super::gateway::authorize;
use super::spec::{KernelSpec, KernelSpecCache, KernelSpecFile};

/// A source of kernel specs.
pub trait KernelSpecSource: Send + Sync {
    /// Short name used in log messages.
    fn name(&self) -> &str;

    fn list(&self) -> BoxFuture<'_, Result<Vec<KernelSpec>>>;
}

/// Default Jupyter kernel directories, most specific first.
pub fn default_kernel_dirs() -> Vec<PathBuf> {
    let mut dirs_out = Vec::new();
    if let Some(paths) = std::env::var_os("JUPYTER_PATH") {
        dirs_out.extend(std::env::split_paths(&paths).map(|p| p.join("kernels")));
    }
    if let Some(data) = dirs::data_dir() {
        dirs_out.push(data.join("jupyter").join("kernels"));
    }
    if let Some(home) = dirs::home_dir() {
        dirs_out.push(home.join(".local").join("share").join("jupyter").join("kernels"));
    }
    dirs_out.push(PathBuf::from("/usr/local/share/jupyter/kernels"));
    dirs_out.push(PathBuf::from("/usr/share/jupyter/kernels"));

    let mut seen = HashSet::new();
    dirs_out.retain(|d| seen.insert(d.clone()));
    dirs_out
}

/// Scans kernel directories for `<name>/kernel.json`.
pub struct DirectoryKernelSource {
    dirs: Vec<PathBuf>,
    cache: Arc<KernelSpecCache>,
}

impl DirectoryKernelSource {
    pub fn new(dirs: Vec<PathBuf>, cache: Arc<KernelSpecCache>) -> Self {
        Self { dirs, cache }
    }

    fn scan_dir(&self, dir: &Path, specs: &mut Vec<KernelSpec>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut spec_dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.join("kernel.json").is_file())
            .collect();
        spec_dirs.sort();

        for spec_dir in spec_dirs {
            match self.cache.load_dir(&spec_dir) {
                Ok(spec) => specs.push(spec),
                Err(e) => tracing::warn!("Skipping kernel spec {}: {}", spec_dir.display(), e),
            }
        }
    }
}

impl KernelSpecSource for DirectoryKernelSource {
    fn name(&self) -> &str {
        "directories"
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<KernelSpec>>> {
        Box::pin(async move {
            let mut specs = Vec::new();
            for dir in &self.dirs {
                self.scan_dir(dir, &mut specs);
            }
            Ok(specs)
        })
    }
}

#[derive(Debug, Deserialize)]
struct CliSpecList {
    kernelspecs: std::collections::BTreeMap<String, CliSpecEntry>,
}

#[derive(Debug, Deserialize)]
struct CliSpecEntry {
    resource_dir: PathBuf,
    spec: KernelSpecFile,
}

/// Runs `jupyter kernelspec list`.
pub struct CliKernelSource {
    jupyter: JupyterCommand,
    cache: Arc<KernelSpecCache>,
}

impl CliKernelSource {
    pub fn new(jupyter: JupyterCommand, cache: Arc<KernelSpecCache>) -> Self {
        Self { jupyter, cache }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self
            .jupyter
            .command(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Kernel(format!(
                "kernelspec list exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Parse the plain `name  path` listing printed without `--json`.
    fn parse_text(&self, text: &str) -> Vec<KernelSpec> {
        text.lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let _name = parts.next()?;
                let path = parts.collect::<Vec<_>>().join(" ");
                let dir = PathBuf::from(path);
                dir.join("kernel.json").is_file().then_some(dir)
            })
            .filter_map(|dir| match self.cache.load_dir(&dir) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    tracing::warn!("Skipping kernel spec {}: {}", dir.display(), e);
                    None
                }
            })
            .collect()
    }
}

pub(crate) fn parse_cli_json(text: &str) -> Result<Vec<KernelSpec>> {
    let list: CliSpecList = serde_json::from_str(text)?;
    Ok(list
        .kernelspecs
        .into_iter()
        .map(|(name, entry)| {
            let spec_file = entry.resource_dir.join("kernel.json");
            KernelSpec::from_file(name, entry.spec, Some(spec_file))
        })
        .collect())
}

impl KernelSpecSource for CliKernelSource {
    fn name(&self) -> &str {
        "jupyter kernelspec list"
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<KernelSpec>>> {
        Box::pin(async move {
            match self.run(&["kernelspec", "list", "--json"]).await {
                Ok(text) => match parse_cli_json(&text) {
                    Ok(specs) => return Ok(specs),
                    Err(e) => tracing::debug!("kernelspec list --json unparseable: {}", e),
                },
                Err(e) => tracing::debug!("kernelspec list --json failed: {}", e),
            }
            let text = self.run(&["kernelspec", "list"]).await?;
            Ok(self.parse_text(&text))
        })
    }
}

#[derive(Debug, Deserialize)]
struct RemoteSpecList {
    #[serde(default)]
    kernelspecs: std::collections::BTreeMap<String, RemoteSpecEntry>,
}

#[derive(Debug, Deserialize)]
struct RemoteSpecEntry {
    name: Option<String>,
    spec: Value,
}

/// Lists specs on a running Jupyter server (`GET /api/kernelspecs`).
pub struct RemoteKernelSource {
    client: reqwest::Client,
    connection: ConnectionInfo,
}

impl RemoteKernelSource {
    pub fn new(client: reqwest::Client, connection: ConnectionInfo) -> Self {
        Self { client, connection }
    }
}

pub(crate) fn parse_remote_json(body: Value) -> Result<Vec<KernelSpec>> {
    let list: RemoteSpecList = serde_json::from_value(body)?;
    let mut specs = Vec::new();
    for (key, entry) in list.kernelspecs {
        match serde_json::from_value::<KernelSpecFile>(entry.spec) {
            Ok(file) => specs.push(KernelSpec::from_file(entry.name.unwrap_or(key), file, None)),
            Err(e) => tracing::warn!("Skipping remote kernel spec {}: {}", key, e),
        }
    }
    Ok(specs)
}

impl KernelSpecSource for RemoteKernelSource {
    fn name(&self) -> &str {
        "remote server"
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<KernelSpec>>> {
        Box::pin(async move {
            let url = self.connection.api_url("api/kernelspecs");
            let response = authorize(self.client.get(&url), &self.connection)
                .send()
                .await?
                .error_for_status()?;
            parse_remote_json(response.json().await?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_spec(root: &Path, name: &str, argv0: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("kernel.json"),
            json!({"argv": [argv0], "display_name": name, "language": "python"}).to_string(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_directory_scan_is_sorted_and_skips_junk() {
        let temp = TempDir::new().unwrap();
        write_spec(temp.path(), "zeta", "/z");
        write_spec(temp.path(), "alpha", "/a");
        std::fs::create_dir_all(temp.path().join("empty")).unwrap();
        let broken = temp.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("kernel.json"), "{not json").unwrap();

        let source = DirectoryKernelSource::new(
            vec![temp.path().to_path_buf(), temp.path().join("missing")],
            Arc::new(KernelSpecCache::new()),
        );
        let names: Vec<_> = source.list().await.unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_parse_cli_json() {
        let text = json!({
            "kernelspecs": {
                "python3": {
                    "resource_dir": "/usr/share/jupyter/kernels/python3",
                    "spec": {"argv": ["python3", "-m", "ipykernel_launcher"], "display_name": "Python 3", "language": "python"}
                }
            }
        })
        .to_string();
        let specs = parse_cli_json(&text).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "python3");
        assert_eq!(
            specs[0].spec_file_path,
            Some(PathBuf::from("/usr/share/jupyter/kernels/python3/kernel.json"))
        );
    }

    #[test]
    fn test_parse_text_listing() {
        let temp = TempDir::new().unwrap();
        write_spec(temp.path(), "python3", "/usr/bin/python3");
        let text = format!(
            "Available kernels:\n  python3    {}\n  ghost    /nowhere\n",
            temp.path().join("python3").display()
        );
        let source = CliKernelSource::new(JupyterCommand::new("jupyter"), Arc::new(KernelSpecCache::new()));
        let specs = source.parse_text(&text);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].path, "/usr/bin/python3");
    }

    #[test]
    fn test_parse_remote_json() {
        let body = json!({
            "default": "python3",
            "kernelspecs": {
                "python3": {"name": "python3", "spec": {"argv": ["python"], "display_name": "Python 3", "language": "python"}, "resources": {}},
                "bad": {"name": "bad", "spec": {"display_name": "no argv"}}
            }
        });
        let specs = parse_remote_json(body).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].display_name, "Python 3");
        assert!(specs[0].spec_file_path.is_none());
    }
}
