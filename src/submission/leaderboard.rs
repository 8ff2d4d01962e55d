//! Aggregates every submission into `docs/leaderboard.json`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::submission::hardware::as_count;
use crate::submission::source::{LeaderboardError, ListingEntry, SubmissionSource};
use crate::submission::validator::{is_valid_run_id, is_valid_username};
use crate::submission::{ENERGY_DIR, MANIFEST_FILE, PLOT_FILES};

/// Repository directory holding `<user>/<run>/`
pub const SUBMISSION_ROOT: &str = "submission";

/// A run directory found in the listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRef {
    /// Parent directory name
    pub user: String,
    /// `submission/<user>/<run>`
    pub path: String,
}

impl RunRef {
    pub fn run_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }
}

/// Summary row of one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub id: String,
    pub user: String,
    pub user_display: String,
    pub affiliation_name: String,
    pub affiliation_ror: String,
    pub cpu_label: String,
    pub cores: u32,
    pub threads: u32,
    pub ht_badge: String,
    pub avg_power_w: Option<f64>,
    pub peak_power_w: Option<f64>,
    pub energy_wh: Option<f64>,
    pub created: String,
    pub zenodo: String,
    /// Download URLs of the four plots, `""` where missing
    pub images: Vec<String>,
    pub node: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Leaderboard {
    pub runs: Vec<LeaderboardEntry>,
}

impl Leaderboard {
    pub fn write(&self, path: &Path) -> Result<(), LeaderboardError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LeaderboardError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        std::fs::write(path, text).map_err(|source| LeaderboardError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn first_text<'a>(object: Option<&'a Value>, keys: &[&str]) -> Option<&'a str> {
    let object = object?;
    keys.iter()
        .filter_map(|k| object.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

fn text_or_empty(object: Option<&Value>, key: &str) -> String {
    first_text(object, &[key]).unwrap_or_default().to_string()
}

/// A listing name usable as one path segment
fn is_plain_segment(name: &str, well_formed: fn(&str) -> bool) -> bool {
    name != "." && name != ".." && well_formed(name)
}

/// Summarize one manifest and its `energy/` listing
pub fn summarize(manifest: &Value, run: &RunRef, energy_listing: &[ListingEntry]) -> LeaderboardEntry {
    let author = manifest.get("author").filter(|a| a.is_object());
    let user = first_text(Some(manifest), &["username"]).unwrap_or(&run.user);
    let user_display = first_text(author, &["display_name", "name", "alternateName"]).unwrap_or(user);
    let handle = first_text(author, &["handle", "alternateName"]).unwrap_or(user);

    let processors: &[Value] = manifest
        .get("processor")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let cpu_label = processors
        .first()
        .map(|first| {
            let vendor = first.get("vendor").and_then(Value::as_str).unwrap_or_default();
            let model = first.get("model").and_then(Value::as_str).unwrap_or_default();
            format!("{} {}", vendor, model).trim().to_string()
        })
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let total = |key: &str| {
        processors
            .iter()
            .filter_map(|p| as_count(p.get(key)))
            .fold(0u32, u32::saturating_add)
    };
    let cores = total("cores");
    let threads = total("threads");

    let ht_badge = match manifest.get("threading_enabled") {
        Some(Value::Bool(false)) => " (HT off)",
        _ => "",
    };

    let metrics = manifest.get("metrics");
    let metric = |key: &str| metrics.and_then(|m| m.get(key)).and_then(Value::as_f64);

    let by_lower: HashMap<String, &str> = energy_listing
        .iter()
        .filter(|e| e.is_file() && e.name.to_lowercase().ends_with(".png"))
        .map(|e| (e.name.to_lowercase(), e.download_url.as_deref().unwrap_or_default()))
        .collect();
    let images = PLOT_FILES
        .iter()
        .map(|name| by_lower.get(*name).copied().unwrap_or_default().to_string())
        .collect();

    LeaderboardEntry {
        id: first_text(Some(manifest), &["run_id"])
            .unwrap_or(run.run_name())
            .to_string(),
        user: handle.to_string(),
        user_display: user_display.to_string(),
        affiliation_name: text_or_empty(author, "affiliation_name"),
        affiliation_ror: text_or_empty(author, "affiliation_ror"),
        cpu_label,
        cores,
        threads,
        ht_badge: ht_badge.to_string(),
        avg_power_w: metric("avg_power_w"),
        peak_power_w: metric("peak_power_w"),
        energy_wh: metric("energy_wh"),
        created: text_or_empty(Some(manifest), "created"),
        zenodo: text_or_empty(Some(manifest), "zenodo_html"),
        images,
        node: text_or_empty(Some(manifest), "node"),
    }
}

/// Builds the leaderboard from a submission source
pub struct LeaderboardAggregator {
    source: Arc<dyn SubmissionSource>,
    concurrency: usize,
}

impl LeaderboardAggregator {
    pub fn new(source: Arc<dyn SubmissionSource>, concurrency: usize) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
        }
    }

    /// Every `user/run` directory pair with well-formed names.
    ///
    /// Only the root listing is fatal; a user directory that cannot be
    /// listed is skipped.
    pub async fn list_runs(&self) -> Result<Vec<RunRef>, LeaderboardError> {
        let mut runs = Vec::new();
        for user in self.source.list(SUBMISSION_ROOT).await? {
            if !user.is_dir() {
                continue;
            }
            if !is_plain_segment(&user.name, is_valid_username) {
                warn!("Skipping user directory {:?}: invalid name", user.name);
                continue;
            }
            let user_path = format!("{}/{}", SUBMISSION_ROOT, user.name);
            let listing = match self.source.list(&user_path).await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!("Skipping {}: {}", user_path, e);
                    continue;
                }
            };
            for run in listing.into_iter().filter(ListingEntry::is_dir) {
                if !is_plain_segment(&run.name, is_valid_run_id) {
                    warn!("Skipping run directory {}/{:?}: invalid name", user_path, run.name);
                    continue;
                }
                runs.push(RunRef {
                    user: user.name.clone(),
                    path: format!("{}/{}", user_path, run.name),
                });
            }
        }
        Ok(runs)
    }

    async fn summarize_run(&self, run: &RunRef) -> Result<Option<LeaderboardEntry>, LeaderboardError> {
        let manifest = match self
            .source
            .read_json(&format!("{}/{}", run.path, MANIFEST_FILE))
            .await?
        {
            Some(manifest) if manifest.as_object().is_some_and(|m| !m.is_empty()) => manifest,
            _ => return Ok(None),
        };
        let energy = self.source.list(&format!("{}/{}", run.path, ENERGY_DIR)).await?;
        Ok(Some(summarize(&manifest, run, &energy)))
    }

    /// Fetch and summarize every run; failing runs are skipped
    pub async fn build(&self) -> Result<Leaderboard, LeaderboardError> {
        let runs = self.list_runs().await?;
        info!("Found {} run(s)", runs.len());

        let results: Vec<(RunRef, Result<Option<LeaderboardEntry>, LeaderboardError>)> = stream::iter(runs)
            .map(|run| async move {
                let result = self.summarize_run(&run).await;
                (run, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summarized: Vec<(RunRef, LeaderboardEntry)> = Vec::new();
        for (run, result) in results {
            match result {
                Ok(Some(entry)) => summarized.push((run, entry)),
                Ok(None) => warn!("Skipping {}: manifest missing or empty", run.path),
                Err(e) => warn!("Skipping {}: {}", run.path, e),
            }
        }

        // Completion order is arbitrary; the run path breaks (user, id) ties
        summarized.sort_by(|(run_a, a), (run_b, b)| {
            a.user
                .cmp(&b.user)
                .then_with(|| a.id.cmp(&b.id))
                .then_with(|| run_a.path.cmp(&run_b.path))
        });
        Ok(Leaderboard {
            runs: summarized.into_iter().map(|(_, entry)| entry).collect(),
        })
    }

    /// Build and write to `out`, returning the number of runs
    pub async fn write_leaderboard(&self, out: &Path) -> Result<usize, LeaderboardError> {
        let leaderboard = self.build().await?;
        leaderboard.write(out)?;
        info!("Wrote {} with {} runs.", out.display(), leaderboard.runs.len());
        Ok(leaderboard.runs.len())
    }
}
