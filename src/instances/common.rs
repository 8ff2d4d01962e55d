use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde_json::Value;
use thiserror::Error;

use crate::core::remote::RemoteError;

/// Error loading a local configuration document
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML in {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load a YAML or JSON document, chosen by file extension.
///
/// `.yaml`/`.yml` files are parsed as YAML and an empty YAML document yields
/// an empty object. Everything else is parsed as JSON.
pub fn load_document(path: &Path) -> Result<Value, DocumentError> {
    let text = std::fs::read_to_string(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "yaml" | "yml"))
        .unwrap_or(false);

    if is_yaml {
        let value: Value = serde_yaml::from_str(&text).map_err(|source| DocumentError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(match value {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        })
    } else {
        serde_json::from_str(&text).map_err(|source| DocumentError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Run one remote call under a deadline. Expiry is reported as a remote failure.
pub async fn bounded<T, F>(operation: &str, deadline: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => {
            debug!("{} exceeded {:?}", operation, deadline);
            Err(RemoteError::Timeout {
                operation: operation.to_string(),
                secs: deadline.as_secs(),
            })
        }
    }
}

/// Helper function to measure execution time
pub async fn measure_execution_time<F, T, E>(f: F) -> (Result<T, E>, f64)
where
    F: Future<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let result = f.await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

    (result, duration_ms)
}
