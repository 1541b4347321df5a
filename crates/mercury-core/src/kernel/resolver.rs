//! Kernel spec resolution.
//!
//! Enumerates the kernel specs visible to the target environment, scores
//! each against the request, and returns the best. When nothing local
//! matches an interpreter by path, a spec is installed for it first.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cancel::CancelToken;
use crate::command::JupyterCommand;
use crate::config::MercuryConfig;
use crate::connection::ConnectionInfo;
use crate::error::{Error, Result};

use super::sources::{
    CliKernelSource, DirectoryKernelSource, KernelSpecSource, RemoteKernelSource,
    default_kernel_dirs,
};
use super::spec::{InterpreterInfo, KernelSpec, KernelSpecCache, KernelSpecFile};

/// Language every interpreter-based request targets.
pub const DEFAULT_LANGUAGE: &str = "python";

/// What a kernel spec should match.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelCriteria {
    /// A spec that runs this interpreter.
    Interpreter(InterpreterInfo),
    /// A spec named in notebook metadata.
    Metadata {
        name: String,
        display_name: Option<String>,
        language: Option<String>,
    },
}

impl KernelCriteria {
    pub fn language(&self) -> &str {
        match self {
            KernelCriteria::Interpreter(_) => DEFAULT_LANGUAGE,
            KernelCriteria::Metadata { language, .. } => {
                language.as_deref().unwrap_or(DEFAULT_LANGUAGE)
            }
        }
    }
}

const PATH_WEIGHT: u32 = 10;
const MAJOR_WEIGHT: u32 = 4;
const MINOR_WEIGHT: u32 = 2;
const PATCH_WEIGHT: u32 = 1;
const NAME_DIGIT_WEIGHT: u32 = 1;
const METADATA_NAME_WEIGHT: u32 = 10;
const METADATA_DISPLAY_WEIGHT: u32 = 5;

fn same_path(a: &Path, b: &Path) -> bool {
    a == b
        || match (a.canonicalize(), b.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
}

fn spec_runs_interpreter(spec: &KernelSpec, interpreter: &InterpreterInfo) -> bool {
    same_path(Path::new(&spec.path), &interpreter.path)
        || spec
            .metadata
            .interpreter
            .as_ref()
            .is_some_and(|i| same_path(&i.path, &interpreter.path))
}

fn trailing_digit(name: &str) -> Option<u32> {
    name.chars().last().and_then(|c| c.to_digit(10))
}

/// Score a spec against the request; zero means no match.
pub fn score(spec: &KernelSpec, criteria: &KernelCriteria) -> u32 {
    if !spec.language.eq_ignore_ascii_case(criteria.language()) {
        return 0;
    }

    match criteria {
        KernelCriteria::Interpreter(interpreter) => {
            let mut score = 0;
            if spec_runs_interpreter(spec, interpreter) {
                score += PATH_WEIGHT;
            }
            if let Some(wanted) = interpreter.version {
                match spec.interpreter_version() {
                    Some(have) if have.major == wanted.major => {
                        score += MAJOR_WEIGHT;
                        if have.minor == wanted.minor {
                            score += MINOR_WEIGHT;
                            if have.patch == wanted.patch {
                                score += PATCH_WEIGHT;
                            }
                        }
                    }
                    Some(_) => {}
                    None => {
                        if trailing_digit(&spec.name) == Some(wanted.major) {
                            score += NAME_DIGIT_WEIGHT;
                        }
                    }
                }
            }
            score
        }
        KernelCriteria::Metadata {
            name, display_name, ..
        } => {
            let mut score = 0;
            if spec.name == *name {
                score += METADATA_NAME_WEIGHT;
            }
            if display_name.as_deref() == Some(spec.display_name.as_str()) {
                score += METADATA_DISPLAY_WEIGHT;
            }
            score
        }
    }
}

/// Pick the best spec. Ties keep enumeration order; when nothing scores,
/// the first enumerated spec is returned.
pub fn best_match(specs: &[KernelSpec], criteria: Option<&KernelCriteria>) -> Option<KernelSpec> {
    let first = specs.first()?;
    let Some(criteria) = criteria else {
        return Some(first.clone());
    };

    let mut best: Option<(&KernelSpec, u32)> = None;
    for spec in specs {
        let s = score(spec, criteria);
        if s > 0 && best.is_none_or(|(_, top)| s > top) {
            best = Some((spec, s));
        }
    }

    match best {
        Some((spec, _)) => Some(spec.clone()),
        None => {
            tracing::debug!("No kernel spec scored; falling back to {}", first.name);
            Some(first.clone())
        }
    }
}

/// Creates a kernel spec for an interpreter.
pub trait KernelInstaller: Send + Sync {
    fn install(&self, interpreter: &InterpreterInfo) -> BoxFuture<'_, Result<()>>;
}

/// Installs specs with `<interpreter> -m ipykernel install --user`.
#[derive(Debug, Default, Clone)]
pub struct IpykernelInstaller;

impl IpykernelInstaller {
    /// Deterministic spec name for an interpreter.
    ///
    /// The suffix is the 32-bit FNV-1a hash of the interpreter path, so the
    /// name survives toolchain upgrades.
    pub fn spec_name(interpreter: &InterpreterInfo) -> String {
        let hash = interpreter
            .path
            .to_string_lossy()
            .bytes()
            .fold(0x811c_9dc5_u32, |h, b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193));
        let major = interpreter.version.map(|v| v.major).unwrap_or(3);
        format!("mercury_python{}_{:08x}", major, hash)
    }

    pub fn display_name(interpreter: &InterpreterInfo) -> String {
        match (&interpreter.display_name, interpreter.version) {
            (Some(name), _) => name.clone(),
            (None, Some(v)) => format!("Python {}.{}", v.major, v.minor),
            (None, None) => "Python".to_string(),
        }
    }
}

/// Pull the install directory out of ipykernel's `Installed kernelspec X in DIR`.
fn installed_dir(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Installed kernelspec "))
        .and_then(|rest| rest.split_once(" in "))
        .map(|(_, dir)| PathBuf::from(dir.trim()))
}

/// Point an installed spec at the interpreter and record it in the metadata.
pub fn rewrite_installed_spec(dir: &Path, interpreter: &InterpreterInfo) -> Result<()> {
    let path = dir.join("kernel.json");
    let mut file = KernelSpecFile::read(&path)?;
    let program = interpreter.path.to_string_lossy().to_string();
    match file.argv.first_mut() {
        Some(first) => *first = program,
        None => file.argv.push(program),
    }
    let mut metadata = file.metadata.take().unwrap_or_default();
    metadata.interpreter = Some(interpreter.clone());
    file.metadata = Some(metadata);
    file.write(&path)
}

impl KernelInstaller for IpykernelInstaller {
    fn install(&self, interpreter: &InterpreterInfo) -> BoxFuture<'_, Result<()>> {
        let interpreter = interpreter.clone();
        Box::pin(async move {
            let name = Self::spec_name(&interpreter);
            let display = Self::display_name(&interpreter);
            tracing::info!("Installing kernel spec {} for {}", name, interpreter.path.display());

            let output = tokio::process::Command::new(&interpreter.path)
                .args(["-m", "ipykernel", "install", "--user", "--name"])
                .arg(&name)
                .arg("--display-name")
                .arg(&display)
                .stdin(Stdio::null())
                .output()
                .await?;
            if !output.status.success() {
                return Err(Error::Kernel(format!(
                    "ipykernel install failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }

            let combined = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            let dir = installed_dir(&combined)
                .or_else(|| {
                    dirs::data_dir().map(|d| d.join("jupyter").join("kernels").join(&name))
                })
                .ok_or_else(|| Error::KernelSpecNotFound(name.clone()))?;
            rewrite_installed_spec(&dir, &interpreter)
        })
    }
}

/// Finds (or creates) the kernel spec for a request.
pub struct KernelSpecResolver {
    local_sources: Vec<Box<dyn KernelSpecSource>>,
    installer: Option<Box<dyn KernelInstaller>>,
    client: reqwest::Client,
}

impl KernelSpecResolver {
    pub fn new(
        local_sources: Vec<Box<dyn KernelSpecSource>>,
        installer: Option<Box<dyn KernelInstaller>>,
    ) -> Self {
        Self {
            local_sources,
            installer,
            client: reqwest::Client::new(),
        }
    }

    /// Resolver over configured and default kernel dirs plus the Jupyter CLI.
    pub fn from_config(config: &MercuryConfig) -> Self {
        let cache = Arc::new(KernelSpecCache::new());
        let mut dirs = config.kernel_spec_dirs.clone();
        dirs.extend(default_kernel_dirs());

        let mut sources: Vec<Box<dyn KernelSpecSource>> =
            vec![Box::new(DirectoryKernelSource::new(dirs, cache.clone()))];
        match JupyterCommand::from_config(config) {
            Ok(jupyter) => sources.push(Box::new(CliKernelSource::new(jupyter, cache))),
            Err(e) => tracing::debug!("Not listing kernel specs through jupyter: {}", e),
        }
        Self::new(sources, Some(Box::new(IpykernelInstaller)))
    }

    /// Enumerate every visible spec, collapsing duplicates by name.
    ///
    /// Source failures are logged and count as "no specs".
    pub async fn enumerate(&self, connection: Option<&ConnectionInfo>) -> Vec<KernelSpec> {
        let mut specs: Vec<KernelSpec> = Vec::new();
        let mut push = |found: Vec<KernelSpec>| {
            for spec in found {
                if !specs.iter().any(|s| s.name == spec.name) {
                    specs.push(spec);
                }
            }
        };

        match connection {
            Some(connection) => {
                let remote = RemoteKernelSource::new(self.client.clone(), connection.clone());
                match remote.list().await {
                    Ok(found) => push(found),
                    Err(e) => tracing::warn!("Listing kernel specs from {} failed: {}", remote.name(), e),
                }
            }
            None => {
                for source in &self.local_sources {
                    match source.list().await {
                        Ok(found) => push(found),
                        Err(e) => {
                            tracing::warn!("Listing kernel specs from {} failed: {}", source.name(), e)
                        }
                    }
                }
            }
        }
        specs
    }

    /// Find the spec that best matches `criteria`.
    ///
    /// Returns `None` only when no spec exists at all (or on cancellation).
    pub async fn get_matching_kernel_spec(
        &self,
        criteria: Option<&KernelCriteria>,
        connection: Option<&ConnectionInfo>,
        cancel: &CancelToken,
    ) -> Option<KernelSpec> {
        let mut specs = self.enumerate(connection).await;
        if cancel.is_cancelled() {
            return None;
        }

        if let (None, Some(KernelCriteria::Interpreter(interpreter)), Some(installer)) =
            (connection, criteria, &self.installer)
        {
            if !specs.iter().any(|s| spec_runs_interpreter(s, interpreter)) {
                match installer.install(interpreter).await {
                    Ok(()) => specs = self.enumerate(None).await,
                    Err(e) => tracing::warn!(
                        "Installing a kernel spec for {} failed: {}",
                        interpreter.path.display(),
                        e
                    ),
                }
                if cancel.is_cancelled() {
                    return None;
                }
            }
        }

        best_match(&specs, criteria)
    }
}
