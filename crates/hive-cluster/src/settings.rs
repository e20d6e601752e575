//! Worker spawn settings.

use std::path::PathBuf;

use hive_core::{HiveError, Result};

/// How the supervisor spawns workers.
///
/// Installed once by the first `Supervisor::setup` call and immutable
/// afterwards; `Supervisor::settings` hands out clones of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    /// Program to execute for each worker
    pub exec: PathBuf,
    /// Arguments placed before `args`, for runtime flags
    pub exec_argv: Vec<String>,
    /// Program arguments
    pub args: Vec<String>,
    /// Pipe the child's standard streams instead of inheriting them
    pub silent: bool,
}

impl ClusterSettings {
    /// Settings that re-execute the current program with its own argument
    /// tail. This is the default when `fork` is called without `setup`.
    pub fn from_current_process() -> Result<Self> {
        let exec = std::env::current_exe().map_err(|e| HiveError::ExecResolve {
            message: e.to_string(),
        })?;
        Ok(Self {
            exec,
            exec_argv: Vec::new(),
            args: std::env::args().skip(1).collect(),
            silent: false,
        })
    }

    /// Settings for an explicit worker program.
    pub fn new(exec: impl Into<PathBuf>) -> Self {
        Self {
            exec: exec.into(),
            exec_argv: Vec::new(),
            args: Vec::new(),
            silent: false,
        }
    }

    pub fn with_exec_argv(mut self, exec_argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exec_argv = exec_argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let settings = ClusterSettings::new("/usr/bin/worker")
            .with_exec_argv(["--runtime-flag"])
            .with_args(["serve", "--port", "0"])
            .with_silent(true);

        assert_eq!(settings.exec, PathBuf::from("/usr/bin/worker"));
        assert_eq!(settings.exec_argv, vec!["--runtime-flag"]);
        assert_eq!(settings.args.len(), 3);
        assert!(settings.silent);
    }

    #[test]
    fn test_defaults_point_at_current_process() {
        let settings = ClusterSettings::from_current_process().unwrap();
        assert!(settings.exec.as_os_str().len() > 0);
        assert!(!settings.silent);
        assert!(settings.exec_argv.is_empty());
    }
}
