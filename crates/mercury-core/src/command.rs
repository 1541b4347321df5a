//! Locating the `jupyter` executable.

use std::path::PathBuf;

use crate::config::MercuryConfig;
use crate::error::{Error, Result};

/// The program (plus leading arguments) used to run Jupyter subcommands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JupyterCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl JupyterCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Resolve from config, falling back to `jupyter` on PATH.
    pub fn from_config(config: &MercuryConfig) -> Result<Self> {
        let program = match &config.jupyter_command {
            Some(program) => program.clone(),
            None => which::which("jupyter").map_err(|e| Error::KernelStartFailure {
                message: format!("jupyter not found on PATH: {}", e),
                exit_code: None,
            })?,
        };
        Ok(Self {
            program,
            args: config.jupyter_args.clone(),
        })
    }

    /// A command for `jupyter <subcommand args...>`.
    pub fn command<I, S>(&self, args: I) -> tokio::process::Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.args(args);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_command_wins() {
        let config = MercuryConfig {
            jupyter_command: Some(PathBuf::from("/opt/py/bin/python")),
            jupyter_args: vec!["-m".to_string(), "jupyter".to_string()],
            ..MercuryConfig::default()
        };
        let cmd = JupyterCommand::from_config(&config).unwrap();
        assert_eq!(cmd.program, PathBuf::from("/opt/py/bin/python"));
        assert_eq!(cmd.args, vec!["-m", "jupyter"]);
    }
}
