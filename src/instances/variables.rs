use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::Value;

use crate::core::error::ExperimentError;
use crate::core::remote::{RemoteError, RemotePlane};
use crate::instances::common::{bounded, load_document};
use crate::instances::topology::LoopVariableSet;

/// Where pushed variables apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableScope {
    /// Visible to every command of the allocation
    Global,
    /// One value per loop iteration
    Loop,
}

/// Pushes variable documents to a node's allocation
pub struct VariableInjector {
    plane: Arc<dyn RemotePlane>,
    timeout: Duration,
}

impl VariableInjector {
    pub fn new(plane: Arc<dyn RemotePlane>, timeout: Duration) -> Self {
        Self { plane, timeout }
    }

    /// Push an in-memory payload
    pub async fn push(&self, node: &str, payload: &Value, scope: VariableScope) -> Result<(), RemoteError> {
        let (as_global, as_loop) = match scope {
            VariableScope::Global => (true, false),
            VariableScope::Loop => (false, true),
        };
        bounded(
            "set_variables",
            self.timeout,
            self.plane.set_variables(node, payload, as_global, as_loop),
        )
        .await
    }

    /// Load a YAML/JSON document and push it as global variables
    pub async fn push_globals_from(&self, node: &str, path: &Path) -> Result<(), ExperimentError> {
        let document = load_document(path)?;
        self.push(node, &document, VariableScope::Global).await?;
        debug!("Set variables from {} (global=true loop=false)", path.display());
        Ok(())
    }

    /// Push the loop series
    pub async fn push_loop(&self, node: &str, loop_vars: &LoopVariableSet) -> Result<(), RemoteError> {
        let payload = loop_vars.to_payload();
        self.push(node, &payload, VariableScope::Loop).await?;
        debug!("Loop Vars: {}", payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::MockRemotePlane;
    use crate::instances::topology::LoopDimension;
    use serde_json::json;
    use std::fs;

    #[tokio::test]
    async fn test_globals_pushed_as_global_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global.yml");
        fs::write(&path, "stress_timeout: 60\n").unwrap();

        let mut plane = MockRemotePlane::new();
        plane
            .expect_set_variables()
            .withf(|node, payload, as_global, as_loop| {
                node == "n1" && *payload == json!({"stress_timeout": 60}) && *as_global && !*as_loop
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let injector = VariableInjector::new(Arc::new(plane), Duration::from_secs(1));
        injector.push_globals_from("n1", &path).await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_series_pushed_as_loop() {
        let mut plane = MockRemotePlane::new();
        plane
            .expect_set_variables()
            .withf(|_, payload, as_global, as_loop| {
                *payload == json!({"cores": [1, 2, 3]}) && !*as_global && *as_loop
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let injector = VariableInjector::new(Arc::new(plane), Duration::from_secs(1));
        let loop_vars = LoopVariableSet {
            dimension: LoopDimension::Cores,
            series: vec![1, 2, 3],
        };
        injector.push_loop("n1", &loop_vars).await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_document_never_reaches_remote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global.json");
        fs::write(&path, "{").unwrap();

        let injector = VariableInjector::new(Arc::new(MockRemotePlane::new()), Duration::from_secs(1));
        let result = injector.push_globals_from("n1", &path).await;
        assert!(matches!(result, Err(ExperimentError::Document(_))));
    }
}
