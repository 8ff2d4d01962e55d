//! Structural and integrity checks over `submission/<user>/<run>/` trees.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::submission::{CONFIG_DIR, ENERGY_DIR, HARDWARE_FILE, MANIFEST_FILE, PLOT_FILES};

/// Largest plot image accepted
pub const MAX_PLOT_BYTES: u64 = 5 * 1024 * 1024;

lazy_static::lazy_static! {
    static ref USERNAME_PATTERN: Regex = Regex::new(r"^[a-z0-9._-]{1,40}$").expect("username pattern");
    static ref RUN_ID_PATTERN: Regex = Regex::new(r"^[a-zA-Z0-9._:-]{1,80}$").expect("run id pattern");
}

pub fn is_valid_username(value: &str) -> bool {
    USERNAME_PATTERN.is_match(value)
}

pub fn is_valid_run_id(value: &str) -> bool {
    RUN_ID_PATTERN.is_match(value)
}

/// One problem found in a submission
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Violation {
    #[error("{}: manifest.json is missing", .0.display())]
    MissingManifest(PathBuf),
    #[error("{}: manifest.json is not valid JSON ({reason})", .path.display())]
    InvalidJson { path: PathBuf, reason: String },
    #[error("{}: {message}", .path.display())]
    Schema { path: PathBuf, message: String },
    #[error("{}: username '{value}' does not match ^[a-z0-9._-]{{1,40}}$", .path.display())]
    InvalidUsername { path: PathBuf, value: String },
    #[error("{}: run_id '{value}' does not match ^[a-zA-Z0-9._:-]{{1,80}}$", .path.display())]
    InvalidRunId { path: PathBuf, value: String },
    #[error("{}: {field} '{found}' does not match directory name '{expected}'", .path.display())]
    IdentityMismatch {
        path: PathBuf,
        field: &'static str,
        expected: String,
        found: String,
    },
    #[error("{}: required plot is missing", .0.display())]
    MissingPlot(PathBuf),
    #[error("{}: plot is {bytes} bytes, limit is {}", .path.display(), MAX_PLOT_BYTES)]
    PlotTooLarge { path: PathBuf, bytes: u64 },
    #[error("{}: plot is not a decodable image ({reason})", .path.display())]
    UndecodablePlot { path: PathBuf, reason: String },
    #[error("{}: hardware descriptor is not valid JSON ({reason})", .path.display())]
    InvalidHardware { path: PathBuf, reason: String },
}

/// Error returned by the validator
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{} failed validation with {} violation(s)", .run.display(), .violations.len())]
    Invalid { run: PathBuf, violations: Vec<Violation> },
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ValidationError {
    /// Violations in reporting order; empty for I/O failures
    pub fn violations(&self) -> &[Violation] {
        match self {
            ValidationError::Invalid { violations, .. } => violations,
            ValidationError::Io { .. } => &[],
        }
    }
}

/// Schema problems of a parsed manifest, all of them at once
pub fn schema_violations(manifest: &Value) -> Vec<String> {
    let Some(object) = manifest.as_object() else {
        return vec!["manifest must be a JSON object".to_string()];
    };

    let mut problems = Vec::new();
    for field in ["username", "run_id"] {
        match object.get(field) {
            None => problems.push(format!("'{}' is required", field)),
            Some(value) if !value.is_string() => problems.push(format!("'{}' must be a string", field)),
            Some(_) => {}
        }
    }
    for field in ["created", "zenodo_html"] {
        if let Some(value) = object.get(field) {
            if !value.is_string() {
                problems.push(format!("'{}' must be a string", field));
            }
        }
    }
    match object.get("metrics") {
        None => {}
        Some(Value::Object(metrics)) => {
            for field in ["avg_power_w", "peak_power_w", "energy_wh"] {
                if let Some(value) = metrics.get(field) {
                    if !value.is_number() {
                        problems.push(format!("'metrics.{}' must be a number", field));
                    }
                }
            }
        }
        Some(_) => problems.push("'metrics' must be an object".to_string()),
    }
    problems
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>, ValidationError> {
    let entries = fs::read_dir(dir).map_err(|source| ValidationError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Validates every run below a submission root
pub struct SubmissionValidator {
    root: PathBuf,
}

impl SubmissionValidator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Run directories in sorted order; an absent root has none
    pub fn runs(&self) -> Result<Vec<PathBuf>, ValidationError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for user_dir in sorted_subdirs(&self.root)? {
            runs.extend(sorted_subdirs(&user_dir)?);
        }
        Ok(runs)
    }

    /// Validate runs in order, stopping at the first invalid one
    pub fn validate_all(&self) -> Result<usize, ValidationError> {
        let runs = self.runs()?;
        if runs.is_empty() {
            info!("Nothing to validate under {}", self.root.display());
            return Ok(0);
        }
        for run in &runs {
            self.validate_run(run)?;
        }
        info!("Validated {} submission(s)", runs.len());
        Ok(runs.len())
    }

    /// Checks run in order: parse, schema, whitelists, identity, plots, hardware.
    /// The first stage with violations ends the check.
    pub fn validate_run(&self, run_dir: &Path) -> Result<(), ValidationError> {
        debug!("Validating {}", run_dir.display());
        let fail = |violations: Vec<Violation>| ValidationError::Invalid {
            run: run_dir.to_path_buf(),
            violations,
        };

        let manifest_path = run_dir.join(MANIFEST_FILE);
        let text = match fs::read_to_string(&manifest_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(fail(vec![Violation::MissingManifest(manifest_path)]))
            }
            Err(source) => {
                return Err(ValidationError::Io {
                    path: manifest_path,
                    source,
                })
            }
        };
        let manifest: Value = serde_json::from_str(&text).map_err(|e| {
            fail(vec![Violation::InvalidJson {
                path: manifest_path.clone(),
                reason: e.to_string(),
            }])
        })?;

        let schema: Vec<Violation> = schema_violations(&manifest)
            .into_iter()
            .map(|message| Violation::Schema {
                path: manifest_path.clone(),
                message,
            })
            .collect();
        if !schema.is_empty() {
            return Err(fail(schema));
        }

        let username = manifest["username"].as_str().unwrap_or_default();
        let run_id = manifest["run_id"].as_str().unwrap_or_default();

        let mut whitelist = Vec::new();
        if !is_valid_username(username) {
            whitelist.push(Violation::InvalidUsername {
                path: manifest_path.clone(),
                value: username.to_string(),
            });
        }
        if !is_valid_run_id(run_id) {
            whitelist.push(Violation::InvalidRunId {
                path: manifest_path.clone(),
                value: run_id.to_string(),
            });
        }
        if !whitelist.is_empty() {
            return Err(fail(whitelist));
        }

        let identity = self.identity_violations(run_dir, &manifest_path, username, run_id);
        if !identity.is_empty() {
            return Err(fail(identity));
        }

        let plots = plot_violations(&run_dir.join(ENERGY_DIR));
        if !plots.is_empty() {
            return Err(fail(plots));
        }

        let hardware = hardware_violations(&run_dir.join(CONFIG_DIR));
        if !hardware.is_empty() {
            return Err(fail(hardware));
        }

        Ok(())
    }

    fn identity_violations(&self, run_dir: &Path, manifest_path: &Path, username: &str, run_id: &str) -> Vec<Violation> {
        let expected_run = dir_name(run_dir);
        let expected_user = run_dir.parent().map(dir_name).unwrap_or_default();

        let mut violations = Vec::new();
        if run_id != expected_run {
            violations.push(Violation::IdentityMismatch {
                path: manifest_path.to_path_buf(),
                field: "run_id",
                expected: expected_run,
                found: run_id.to_string(),
            });
        }
        if username != expected_user {
            violations.push(Violation::IdentityMismatch {
                path: manifest_path.to_path_buf(),
                field: "username",
                expected: expected_user,
                found: username.to_string(),
            });
        }
        violations
    }
}

fn plot_violations(energy_dir: &Path) -> Vec<Violation> {
    PLOT_FILES
        .iter()
        .filter_map(|plot| check_plot(&energy_dir.join(plot)).err())
        .collect()
}

fn check_plot(path: &Path) -> Result<(), Violation> {
    let size = match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Err(Violation::MissingPlot(path.to_path_buf())),
    };
    if size > MAX_PLOT_BYTES {
        return Err(Violation::PlotTooLarge {
            path: path.to_path_buf(),
            bytes: size,
        });
    }
    let bytes = fs::read(path).map_err(|e| Violation::UndecodablePlot {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    image::load_from_memory(&bytes).map_err(|e| Violation::UndecodablePlot {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(())
}

fn hardware_violations(config_dir: &Path) -> Vec<Violation> {
    let Ok(entries) = fs::read_dir(config_dir) else {
        return Vec::new();
    };
    let mut descriptors: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path().join(HARDWARE_FILE))
        .filter(|path| path.is_file())
        .collect();
    descriptors.sort();

    descriptors
        .into_iter()
        .filter_map(|path| {
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<Value>(&text).map_err(|e| e.to_string()));
            parsed.err().map(|reason| Violation::InvalidHardware { path, reason })
        })
        .collect()
}
