//! Kernel spec resolution against on-disk specs.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use mercury_core::kernel::{
    DirectoryKernelSource, KernelInstaller, KernelSpecCache, KernelSpecSource,
    rewrite_installed_spec,
};
use mercury_core::{
    CancelToken, Error, InterpreterInfo, KernelCriteria, KernelSpec, KernelSpecResolver, Result,
    Version,
};
use serde_json::json;
use tempfile::TempDir;

fn write_spec(root: &Path, name: &str, argv0: &str, language: &str, version: Option<&str>) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let mut spec = json!({
        "argv": [argv0, "-m", "ipykernel_launcher", "-f", "{connection_file}"],
        "display_name": name,
        "language": language,
    });
    if let Some(version) = version.and_then(Version::parse) {
        spec["metadata"] = json!({"interpreter": {"path": argv0, "version": version}});
    }
    std::fs::write(dir.join("kernel.json"), spec.to_string()).unwrap();
}

fn directory_source(root: &Path) -> Box<dyn KernelSpecSource> {
    Box::new(DirectoryKernelSource::new(
        vec![root.to_path_buf()],
        Arc::new(KernelSpecCache::new()),
    ))
}

fn interpreter(path: &str, version: Version) -> KernelCriteria {
    KernelCriteria::Interpreter(InterpreterInfo::new(path).with_version(version))
}

struct FailingSource;

impl KernelSpecSource for FailingSource {
    fn name(&self) -> &str {
        "failing"
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<KernelSpec>>> {
        Box::pin(async { Err(Error::Kernel("jupyter exploded".to_string())) })
    }
}

/// Installs by writing a spec into a directory the resolver scans.
struct DirInstaller {
    root: std::path::PathBuf,
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl KernelInstaller for DirInstaller {
    fn install(&self, interpreter: &InterpreterInfo) -> BoxFuture<'_, Result<()>> {
        let interpreter = interpreter.clone();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Kernel("ipykernel missing".to_string()));
            }
            write_spec(&self.root, "installed", "python", "python", None);
            rewrite_installed_spec(&self.root.join("installed"), &interpreter)
        })
    }
}

#[tokio::test]
async fn test_exact_match_beats_language_only_in_any_order() {
    for order in [["a_generic", "z_exact"], ["z_generic", "a_exact"]] {
        let temp = TempDir::new().unwrap();
        write_spec(temp.path(), order[0], "/usr/bin/python3", "python", None);
        write_spec(temp.path(), order[1], "/envs/ml/bin/python", "python", Some("3.10.4"));

        let resolver = KernelSpecResolver::new(vec![directory_source(temp.path())], None);
        let spec = resolver
            .get_matching_kernel_spec(
                Some(&interpreter("/envs/ml/bin/python", Version::new(3, 10, 4))),
                None,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(spec.name, order[1]);
    }
}

#[tokio::test]
async fn test_version_match_without_path() {
    let temp = TempDir::new().unwrap();
    write_spec(temp.path(), "py38", "/opt/py38/bin/python", "python", Some("3.8.10"));
    write_spec(temp.path(), "py311", "/opt/py311/bin/python", "python", Some("3.11.2"));

    let resolver = KernelSpecResolver::new(vec![directory_source(temp.path())], None);
    let spec = resolver
        .get_matching_kernel_spec(
            Some(&interpreter("/somewhere/else/python", Version::new(3, 11, 0))),
            None,
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(spec.name, "py311");
}

#[tokio::test]
async fn test_falls_back_to_first_when_nothing_scores() {
    let temp = TempDir::new().unwrap();
    write_spec(temp.path(), "a_julia", "/usr/bin/julia", "julia", None);
    write_spec(temp.path(), "b_python", "/usr/bin/python", "python", None);

    let resolver = KernelSpecResolver::new(vec![directory_source(temp.path())], None);
    let spec = resolver
        .get_matching_kernel_spec(
            Some(&KernelCriteria::Metadata {
                name: "r".to_string(),
                display_name: None,
                language: Some("R".to_string()),
            }),
            None,
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(spec.name, "a_julia");
}

#[tokio::test]
async fn test_metadata_name_match() {
    let temp = TempDir::new().unwrap();
    write_spec(temp.path(), "python3", "/usr/bin/python3", "python", None);
    write_spec(temp.path(), "science", "/envs/sci/bin/python", "python", None);

    let resolver = KernelSpecResolver::new(vec![directory_source(temp.path())], None);
    let spec = resolver
        .get_matching_kernel_spec(
            Some(&KernelCriteria::Metadata {
                name: "science".to_string(),
                display_name: None,
                language: None,
            }),
            None,
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(spec.path, "/envs/sci/bin/python");
}

#[tokio::test]
async fn test_no_specs_is_none() {
    let temp = TempDir::new().unwrap();
    let resolver = KernelSpecResolver::new(vec![directory_source(temp.path())], None);
    assert!(
        resolver
            .get_matching_kernel_spec(None, None, &CancelToken::new())
            .await
            .is_none()
    );
}

#[tokio::test]
async fn test_enumeration_failures_are_swallowed() {
    let temp = TempDir::new().unwrap();
    write_spec(temp.path(), "python3", "/usr/bin/python3", "python", None);

    let resolver = KernelSpecResolver::new(
        vec![
            Box::new(FailingSource) as Box<dyn KernelSpecSource>,
            directory_source(temp.path()),
        ],
        None,
    );
    let specs = resolver.enumerate(None).await;
    assert_eq!(specs.len(), 1);
}

#[tokio::test]
async fn test_duplicates_collapse_by_name() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    write_spec(first.path(), "python3", "/first/python", "python", None);
    write_spec(second.path(), "python3", "/second/python", "python", None);

    let resolver = KernelSpecResolver::new(
        vec![directory_source(first.path()), directory_source(second.path())],
        None,
    );
    let specs = resolver.enumerate(None).await;
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].path, "/first/python");
}

#[tokio::test]
async fn test_installs_spec_for_unknown_interpreter() {
    let temp = TempDir::new().unwrap();
    write_spec(temp.path(), "python3", "/usr/bin/python3", "python", Some("3.9.0"));
    let calls = Arc::new(AtomicUsize::new(0));

    let resolver = KernelSpecResolver::new(
        vec![directory_source(temp.path())],
        Some(Box::new(DirInstaller {
            root: temp.path().to_path_buf(),
            calls: calls.clone(),
            fail: false,
        })),
    );
    let criteria = interpreter("/envs/new/bin/python", Version::new(3, 12, 1));
    let spec = resolver
        .get_matching_kernel_spec(Some(&criteria), None, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(spec.name, "installed");
    assert_eq!(spec.path, "/envs/new/bin/python");
    assert_eq!(spec.interpreter_version(), Some(Version::new(3, 12, 1)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Now that a spec runs the interpreter, nothing is installed again.
    resolver
        .get_matching_kernel_spec(Some(&criteria), None, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_install_failure_uses_existing_specs() {
    let temp = TempDir::new().unwrap();
    write_spec(temp.path(), "python3", "/usr/bin/python3", "python", Some("3.12.0"));

    let resolver = KernelSpecResolver::new(
        vec![directory_source(temp.path())],
        Some(Box::new(DirInstaller {
            root: temp.path().to_path_buf(),
            calls: Arc::new(AtomicUsize::new(0)),
            fail: true,
        })),
    );
    let spec = resolver
        .get_matching_kernel_spec(
            Some(&interpreter("/envs/new/bin/python", Version::new(3, 12, 1))),
            None,
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(spec.name, "python3");
}

#[tokio::test]
async fn test_cancelled_resolution() {
    let temp = TempDir::new().unwrap();
    write_spec(temp.path(), "python3", "/usr/bin/python3", "python", None);
    let resolver = KernelSpecResolver::new(vec![directory_source(temp.path())], None);
    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(
        resolver
            .get_matching_kernel_spec(None, None, &cancel)
            .await
            .is_none()
    );
}
