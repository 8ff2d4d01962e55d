use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde_json::Value;

use crate::core::error::ExperimentError;
use crate::core::remote::{LaunchRequest, RemotePlane};
use crate::instances::common::bounded;

/// How often a script executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// A single execution
    Once,
    /// One execution per loop variable value
    Loop,
}

/// A local script to run on the node
#[derive(Debug, Clone)]
pub struct ScriptSpec {
    /// Name the command output is stored under
    pub name: String,
    pub path: PathBuf,
    pub mode: RunMode,
    pub blocking: bool,
}

impl ScriptSpec {
    pub fn once(name: &str, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            mode: RunMode::Once,
            blocking: true,
        }
    }

    pub fn looped(name: &str, path: &Path) -> Self {
        Self {
            mode: RunMode::Loop,
            ..Self::once(name, path)
        }
    }
}

/// Uploads and executes scripts on the allocated node
pub struct ScriptRunner {
    plane: Arc<dyn RemotePlane>,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(plane: Arc<dyn RemotePlane>, timeout: Duration) -> Self {
        Self { plane, timeout }
    }

    /// Run a script, returning the command output reported by the control plane
    pub async fn run(&self, node: &str, script: &ScriptSpec) -> Result<Value, ExperimentError> {
        if !script.path.is_file() {
            return Err(ExperimentError::MissingLocalFile(script.path.clone()));
        }

        info!("Run {}", script.name);
        let request = LaunchRequest {
            node: node.to_string(),
            script: script.path.clone(),
            blocking: script.blocking,
            name: script.name.clone(),
            loop_mode: script.mode == RunMode::Loop,
        };
        let output = bounded("launch", self.timeout, self.plane.launch(&request)).await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::{MockRemotePlane, RemoteError};
    use std::fs;

    #[tokio::test]
    async fn test_loop_script_launch_request() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("loadgen.sh");
        fs::write(&script, "#!/bin/sh\nstress -c $cores\n").unwrap();

        let expected = script.clone();
        let mut plane = MockRemotePlane::new();
        plane
            .expect_launch()
            .withf(move |req| {
                req.node == "n1"
                    && req.script == expected
                    && req.name == "energy-stress-test"
                    && req.blocking
                    && req.loop_mode
            })
            .times(1)
            .returning(|_| Ok(Value::String("done".into())));

        let runner = ScriptRunner::new(Arc::new(plane), Duration::from_secs(1));
        let output = runner
            .run("n1", &ScriptSpec::looped("energy-stress-test", &script))
            .await
            .unwrap();
        assert_eq!(output, Value::String("done".into()));
    }

    #[tokio::test]
    async fn test_missing_script_is_local_error() {
        let runner = ScriptRunner::new(Arc::new(MockRemotePlane::new()), Duration::from_secs(1));
        let result = runner
            .run("n1", &ScriptSpec::once("setup", Path::new("/nonexistent/setup.sh")))
            .await;
        assert!(matches!(result, Err(ExperimentError::MissingLocalFile(_))));
    }

    #[tokio::test]
    async fn test_remote_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("setup.sh");
        fs::write(&script, "true\n").unwrap();

        let mut plane = MockRemotePlane::new();
        plane
            .expect_launch()
            .returning(|_| Err(RemoteError::Rejected("node unreachable".into())));

        let runner = ScriptRunner::new(Arc::new(plane), Duration::from_secs(1));
        let result = runner.run("n1", &ScriptSpec::once("setup", &script)).await;
        assert!(matches!(result, Err(ExperimentError::Remote(RemoteError::Rejected(_)))));
    }
}
