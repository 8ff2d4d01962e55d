//! Manifest records and their construction from a run's result folder.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::submission::author::extract_author;
use crate::submission::hardware::normalize_processors;
use crate::submission::{CONFIG_DIR, ENERGY_DIR, HARDWARE_FILE, MANIFEST_FILE, PLOT_FILES};

/// RO-Crate metadata file at the top of a result folder
pub const RO_CRATE_FILE: &str = "ro-crate-metadata.json";

/// Metrics file locations, tried in order
pub const METRICS_FILES: [&str; 2] = ["energy/metrics.json", "metrics.json"];

/// Error writing a submission
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Author of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorInfo {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub orcid: String,
    #[serde(default)]
    pub affiliation_name: String,
    #[serde(default)]
    pub affiliation_ror: String,
    /// Only used to derive the username; never persisted
    #[serde(skip)]
    pub handle: String,
}

/// One processor socket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorInfo {
    pub slot: String,
    pub vendor: String,
    pub model: String,
    pub cores: u32,
    pub threads: u32,
    pub architecture: String,
}

/// Energy figures of a run; absent when telemetry produced nothing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_power_w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_power_w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_wh: Option<f64>,
}

impl MetricsInfo {
    /// Pick the known numeric fields; anything else is ignored
    pub fn from_document(document: &Value) -> Self {
        let number = |key: &str| document.get(key).and_then(Value::as_f64);
        Self {
            avg_power_w: number("avg_power_w"),
            peak_power_w: number("peak_power_w"),
            energy_wh: number("energy_wh"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.avg_power_w.is_none() && self.peak_power_w.is_none() && self.energy_wh.is_none()
    }
}

/// Normalized record of one completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub node: String,
    /// ISO-8601 UTC
    pub created: String,
    pub username: String,
    pub author: AuthorInfo,
    pub processor: Vec<ProcessorInfo>,
    pub threading_enabled: bool,
    pub metrics: MetricsInfo,
    /// Deposition link, empty unless publishing succeeded
    pub zenodo_html: String,
}

impl Manifest {
    /// Indented JSON with a trailing newline
    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }
}

/// Reduce a handle or name to the submission directory alphabet
pub fn slugify_username(raw: &str) -> String {
    let slug: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => Some(c),
            c if c.is_whitespace() => Some('-'),
            _ => None,
        })
        .take(40)
        .collect();

    if slug.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        slug
    }
}

fn read_optional_json(path: &Path) -> Option<Value> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Optional artifact absent: {}", path.display());
            return None;
        }
        Err(e) => {
            warn!("Could not read {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}: not valid JSON ({})", path.display(), e);
            None
        }
    }
}

/// Builds the manifest of one run from its result folder
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    result_dir: PathBuf,
    node: String,
    threading_enabled: bool,
    zenodo_html: String,
    created: DateTime<Utc>,
}

impl ManifestBuilder {
    pub fn new(result_dir: impl Into<PathBuf>, node: &str) -> Self {
        Self {
            result_dir: result_dir.into(),
            node: node.to_string(),
            threading_enabled: false,
            zenodo_html: String::new(),
            created: Utc::now(),
        }
    }

    pub fn threading_enabled(mut self, enabled: bool) -> Self {
        self.threading_enabled = enabled;
        self
    }

    /// Record the deposition link of a successful publish
    pub fn zenodo_html(mut self, link: Option<String>) -> Self {
        self.zenodo_html = link.unwrap_or_default();
        self
    }

    pub fn created_at(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    /// Final component of the result folder
    pub fn run_id(&self) -> String {
        self.result_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Hardware descriptor of this node, else of the first node that has one
    pub fn hardware_descriptor(&self) -> Option<(String, PathBuf)> {
        let config = self.result_dir.join(CONFIG_DIR);
        let own = config.join(&self.node).join(HARDWARE_FILE);
        if own.is_file() {
            return Some((self.node.clone(), own));
        }

        let mut candidates: Vec<(String, PathBuf)> = fs::read_dir(&config)
            .ok()?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().join(HARDWARE_FILE).is_file())
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                (name, entry.path().join(HARDWARE_FILE))
            })
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    /// Assemble the manifest. Every artifact is optional.
    pub fn build(&self) -> Manifest {
        let author = read_optional_json(&self.result_dir.join(RO_CRATE_FILE))
            .map(|doc| extract_author(&doc))
            .unwrap_or_default();

        let processor = self
            .hardware_descriptor()
            .and_then(|(_, path)| read_optional_json(&path))
            .map(|doc| normalize_processors(&doc))
            .unwrap_or_default();

        let metrics = METRICS_FILES
            .iter()
            .find_map(|rel| read_optional_json(&self.result_dir.join(rel)))
            .map(|doc| MetricsInfo::from_document(&doc))
            .unwrap_or_default();

        let raw_username = [author.handle.as_str(), author.display_name.as_str()]
            .into_iter()
            .find(|s| !s.trim().is_empty())
            .unwrap_or("unknown");
        let username = match slugify_username(raw_username) {
            slug if slug.is_empty() => "unknown".to_string(),
            slug => slug,
        };

        Manifest {
            run_id: self.run_id(),
            node: self.node.clone(),
            created: self.created.to_rfc3339_opts(SecondsFormat::Secs, true),
            username,
            author,
            processor,
            threading_enabled: self.threading_enabled,
            metrics,
            zenodo_html: self.zenodo_html.clone(),
        }
    }

    /// Materialize `<root>/<username>/<run_id>/`, returning its path
    pub fn write_submission(&self, manifest: &Manifest, submission_root: &Path) -> Result<PathBuf, ManifestError> {
        let run_dir = submission_root.join(&manifest.username).join(&manifest.run_id);
        if run_dir.exists() {
            warn!("Submission {} already exists, overwriting", run_dir.display());
        }

        let energy_dir = run_dir.join(ENERGY_DIR);
        fs::create_dir_all(&energy_dir).map_err(|source| ManifestError::Io {
            path: energy_dir.clone(),
            source,
        })?;

        let manifest_path = run_dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, manifest.to_pretty_json()?).map_err(|source| ManifestError::Io {
            path: manifest_path.clone(),
            source,
        })?;

        let source_energy = self.result_dir.join(ENERGY_DIR);
        for plot in PLOT_FILES {
            let from = source_energy.join(plot);
            if !from.is_file() {
                warn!("Plot missing, not copied: {}", from.display());
                continue;
            }
            let to = energy_dir.join(plot);
            fs::copy(&from, &to).map_err(|source| ManifestError::Io { path: to, source })?;
        }

        if let Some((node, path)) = self.hardware_descriptor() {
            let target_dir = run_dir.join(CONFIG_DIR).join(node);
            fs::create_dir_all(&target_dir).map_err(|source| ManifestError::Io {
                path: target_dir.clone(),
                source,
            })?;
            let to = target_dir.join(HARDWARE_FILE);
            fs::copy(&path, &to).map_err(|source| ManifestError::Io { path: to, source })?;
        }

        info!("Wrote submission {}", run_dir.display());
        Ok(run_dir)
    }
}
