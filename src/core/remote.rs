use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

/// Error type for control-plane operations
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The control plane answered but refused the operation
    #[error("Remote call rejected: {0}")]
    Rejected(String),
    /// No answer within the configured deadline
    #[error("Remote call '{operation}' timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },
    /// The control plane could not be reached
    #[error("Transport error: {0}")]
    Transport(String),
    /// The answer could not be interpreted
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// An exclusive reservation of testbed nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocation identifier assigned by the control plane
    pub id: String,
    /// Reserved nodes
    pub nodes: BTreeSet<String>,
    /// Result folder, relative to the testbed results root
    pub result_folder: PathBuf,
}

/// RO-Crate annotations the control plane can add to a result folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataAction {
    AddTitle,
    AddDescription,
    AddKeywords,
    AddLicense,
}

impl MetadataAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataAction::AddTitle => "add_title",
            MetadataAction::AddDescription => "add_description",
            MetadataAction::AddKeywords => "add_keywords",
            MetadataAction::AddLicense => "add_license",
        }
    }
}

impl Display for MetadataAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Script execution request
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    /// Target node
    pub node: String,
    /// Local script uploaded to the node
    pub script: PathBuf,
    /// Wait for the script to finish
    pub blocking: bool,
    /// Name under which the command output is stored
    pub name: String,
    /// Repeat once per loop variable combination
    pub loop_mode: bool,
}

/// Deposit request for the archival service
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    /// Absolute result folder on the testbed controller
    pub result_folder: PathBuf,
    pub allocation_id: String,
    pub access_token: String,
    /// Publish immediately instead of leaving a draft
    pub publish: bool,
    pub license: String,
    pub access_right: String,
}

/// Operations consumed from the testbed control plane.
///
/// Every method is a single remote call that either succeeds or fails as a
/// whole. Deadlines are applied by the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemotePlane: Send + Sync {
    /// Release any allocation currently holding the node
    async fn free(&self, node: &str) -> Result<(), RemoteError>;

    /// Reserve the given nodes
    async fn allocate(&self, nodes: &[String]) -> Result<Allocation, RemoteError>;

    /// Describe a node, including its processor topology
    async fn show(&self, node: &str) -> Result<Value, RemoteError>;

    /// Upload a variables document to the node's allocation
    async fn set_variables(
        &self,
        node: &str,
        payload: &Value,
        as_global: bool,
        as_loop: bool,
    ) -> Result<(), RemoteError>;

    /// Select the OS image booted on the next reset
    async fn image(&self, node: &str, image: &str) -> Result<(), RemoteError>;

    /// Add (or delete) kernel boot parameters
    async fn bootparameters(&self, node: &str, params: &[String], delete: bool) -> Result<(), RemoteError>;

    /// Reboot the node
    async fn reset(&self, node: &str, blocking: bool) -> Result<(), RemoteError>;

    /// Upload and execute a script on the node
    async fn launch(&self, request: &LaunchRequest) -> Result<Value, RemoteError>;

    /// Render energy plots into the result folder
    async fn visualize(&self, result_dir: &Path, plots: &[String], format: &str) -> Result<(), RemoteError>;

    /// Annotate the result folder's RO-Crate metadata
    async fn modify_metadata(
        &self,
        result_folder: &Path,
        action: MetadataAction,
        data: &Value,
    ) -> Result<(), RemoteError>;

    /// Deposit the result folder, returning the deposition URL
    async fn upload(&self, request: &UploadRequest) -> Result<String, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct AllocateResponse {
    id: Value,
    result_folder: String,
}

/// Control plane reached through the testbed's `pos` command-line client.
///
/// Each operation spawns one `pos` subprocess. Commands that return data are
/// invoked with `--json` and their stdout is parsed.
#[derive(Debug, Clone)]
pub struct PosCommandLine {
    /// Client executable
    binary: String,
}

impl PosCommandLine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn invoke(&self, args: &[String], envs: &[(&str, &str)]) -> Result<String, RemoteError> {
        debug!("{} {}", self.binary, args.join(" "));
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in envs {
            command.env(key, value);
        }

        let output = command.output().await.map_err(|e| {
            RemoteError::Transport(format!("failed to spawn {}: {}", self.binary, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RemoteError::Rejected(format!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn invoke_json(&self, args: &[String]) -> Result<Value, RemoteError> {
        let stdout = self.invoke(args, &[]).await?;
        serde_json::from_str(stdout.trim())
            .map_err(|e| RemoteError::Malformed(format!("expected JSON from {}: {}", args.join(" "), e)))
    }

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }
}

#[async_trait]
impl RemotePlane for PosCommandLine {
    async fn free(&self, node: &str) -> Result<(), RemoteError> {
        self.invoke(&Self::args(&["allocations", "free", node]), &[]).await?;
        Ok(())
    }

    async fn allocate(&self, nodes: &[String]) -> Result<Allocation, RemoteError> {
        let mut args = Self::args(&["allocations", "allocate", "--json"]);
        args.extend(nodes.iter().cloned());
        let value = self.invoke_json(&args).await?;
        let response: AllocateResponse = serde_json::from_value(value)
            .map_err(|e| RemoteError::Malformed(format!("allocation response: {}", e)))?;

        let id = match response.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(Allocation {
            id,
            nodes: nodes.iter().cloned().collect(),
            result_folder: PathBuf::from(response.result_folder),
        })
    }

    async fn show(&self, node: &str) -> Result<Value, RemoteError> {
        self.invoke_json(&Self::args(&["nodes", "show", "--json", node])).await
    }

    async fn set_variables(
        &self,
        node: &str,
        payload: &Value,
        as_global: bool,
        as_loop: bool,
    ) -> Result<(), RemoteError> {
        // The client only accepts variables from a file
        let path = std::env::temp_dir().join(format!("pos-vars-{}.json", Uuid::new_v4()));
        let body = serde_json::to_vec(payload).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| RemoteError::Transport(format!("failed to stage variables: {}", e)))?;

        let mut args = Self::args(&["allocations", "set_variables", node]);
        args.push(path.display().to_string());
        if as_global {
            args.push("--as-global".to_string());
        }
        if as_loop {
            args.push("--as-loop".to_string());
        }
        let result = self.invoke(&args, &[]).await;
        let _ = tokio::fs::remove_file(&path).await;
        result.map(|_| ())
    }

    async fn image(&self, node: &str, image: &str) -> Result<(), RemoteError> {
        self.invoke(&Self::args(&["nodes", "image", node, image]), &[]).await?;
        Ok(())
    }

    async fn bootparameters(&self, node: &str, params: &[String], delete: bool) -> Result<(), RemoteError> {
        let mut args = Self::args(&["nodes", "bootparameter", node]);
        args.extend(params.iter().cloned());
        if delete {
            args.push("--delete".to_string());
        }
        self.invoke(&args, &[]).await?;
        Ok(())
    }

    async fn reset(&self, node: &str, blocking: bool) -> Result<(), RemoteError> {
        let mut args = Self::args(&["nodes", "reset", node]);
        if !blocking {
            args.push("--non-blocking".to_string());
        }
        self.invoke(&args, &[]).await?;
        Ok(())
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<Value, RemoteError> {
        let mut args = Self::args(&["commands", "launch", "--infile"]);
        args.push(request.script.display().to_string());
        args.push("--name".to_string());
        args.push(request.name.clone());
        if request.blocking {
            args.push("--blocking".to_string());
        }
        if request.loop_mode {
            args.push("--loop".to_string());
        }
        args.push(request.node.clone());

        let stdout = self.invoke(&args, &[]).await?;
        Ok(serde_json::from_str(stdout.trim()).unwrap_or(Value::String(stdout)))
    }

    async fn visualize(&self, result_dir: &Path, plots: &[String], format: &str) -> Result<(), RemoteError> {
        let mut args = Self::args(&["energy", "visualize"]);
        args.push(result_dir.display().to_string());
        args.push("--plots".to_string());
        args.push(plots.join(","));
        args.push("--format".to_string());
        args.push(format.to_string());
        self.invoke(&args, &[]).await?;
        Ok(())
    }

    async fn modify_metadata(
        &self,
        result_folder: &Path,
        action: MetadataAction,
        data: &Value,
    ) -> Result<(), RemoteError> {
        let mut args = Self::args(&["results", "modify-metadata"]);
        args.push(result_folder.display().to_string());
        args.push(action.as_str().to_string());
        args.push(data.to_string());
        self.invoke(&args, &[]).await?;
        Ok(())
    }

    async fn upload(&self, request: &UploadRequest) -> Result<String, RemoteError> {
        let mut args = Self::args(&["results", "upload"]);
        args.push(request.result_folder.display().to_string());
        args.push("--allocation-id".to_string());
        args.push(request.allocation_id.clone());
        args.push("--license".to_string());
        args.push(request.license.clone());
        args.push("--access-right".to_string());
        args.push(request.access_right.clone());
        if request.publish {
            args.push("--publish".to_string());
        }

        // Token goes through the environment, never argv
        let stdout = self
            .invoke(&args, &[("ZENODO_ACCESS_TOKEN", request.access_token.as_str())])
            .await?;
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Malformed("upload returned no deposition link".to_string()))
    }
}
