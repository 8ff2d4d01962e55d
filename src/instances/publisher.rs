//! Post-run steps: plots, RO-Crate annotations and the archival deposit.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde_json::{json, Value};

use crate::core::remote::{MetadataAction, RemoteError, RemotePlane, UploadRequest};
use crate::instances::common::bounded;

/// Plot kinds requested from the renderer
pub const PLOT_KINDS: [&str; 4] = ["power_rel", "bar", "current", "voltage"];

pub const PLOT_FORMAT: &str = "png";

pub const RUN_TITLE: &str = "Energy Blueprint Stress Experiment";

pub const RUN_KEYWORDS: [&str; 10] = [
    "energy",
    "power",
    "voltage",
    "current",
    "blueprint",
    "benchmark",
    "experiment",
    "testbed",
    "reproducibility",
    "ro-crate",
];

/// What the metadata describes about a run
#[derive(Debug, Clone)]
pub struct RunDescription {
    pub node: String,
    pub image: String,
    pub hyperthreading: bool,
    pub license: String,
}

impl RunDescription {
    pub fn description(&self) -> String {
        let ht_clause = if self.hyperthreading {
            "When hyperthreading is enabled, logical threads are stressed as well."
        } else {
            "Hyperthreading is disabled; only physical cores are stressed."
        };
        format!(
            "Energy blueprint experiment on node {} using image {}. This run measures the node's \
             energy consumption by running the Linux 'stress' command on each CPU core. {}",
            self.node, self.image, ht_clause
        )
    }

    /// Annotations in the order they are applied
    pub fn annotations(&self) -> Vec<(MetadataAction, Value)> {
        vec![
            (MetadataAction::AddTitle, json!({ "title": RUN_TITLE })),
            (MetadataAction::AddDescription, json!({ "description": self.description() })),
            (MetadataAction::AddKeywords, json!({ "keywords": RUN_KEYWORDS.join(",") })),
            (MetadataAction::AddLicense, json!({ "license": self.license })),
        ]
    }
}

/// Renders plots, annotates metadata and deposits results
pub struct Publisher {
    plane: Arc<dyn RemotePlane>,
    control_timeout: Duration,
    long_running_timeout: Duration,
}

impl Publisher {
    pub fn new(plane: Arc<dyn RemotePlane>, control_timeout: Duration, long_running_timeout: Duration) -> Self {
        Self {
            plane,
            control_timeout,
            long_running_timeout,
        }
    }

    pub async fn render_plots(&self, result_folder: &Path) -> Result<(), RemoteError> {
        info!("Creating Energy Plots");
        let plots: Vec<String> = PLOT_KINDS.iter().map(|p| p.to_string()).collect();
        bounded(
            "visualize",
            self.long_running_timeout,
            self.plane.visualize(result_folder, &plots, PLOT_FORMAT),
        )
        .await
    }

    /// Apply every annotation; the first failure stops the sequence
    pub async fn annotate(&self, result_folder: &Path, run: &RunDescription) -> Result<(), RemoteError> {
        info!("Updating RO-Crate metadata");
        for (action, data) in run.annotations() {
            bounded(
                "modify_metadata",
                self.control_timeout,
                self.plane.modify_metadata(result_folder, action, &data),
            )
            .await?;
        }
        debug!("Metadata updated: title, description, keywords, license.");
        Ok(())
    }

    /// Deposit the result folder and return the deposition link
    pub async fn upload(&self, request: &UploadRequest) -> Result<String, RemoteError> {
        info!("Publishing results to Zenodo");
        let link = bounded("upload", self.long_running_timeout, self.plane.upload(request)).await?;
        info!("Published to Zenodo: {}", link);
        Ok(link)
    }
}
