use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::credentials::TokenSource;

/// Environment variable consulted when no token file is readable
pub const TOKEN_ENV_VAR: &str = "ZENODO_ACCESS_TOKEN";

/// Boot parameters every run starts from
pub const DEFAULT_BOOT_PARAMETERS: [&str; 1] = ["iommu=pt"];

/// Configuration for one experiment run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Human-readable experiment name (logging only)
    pub experiment_name: String,
    /// Load generator node
    pub node: String,
    /// Global variables document (YAML or JSON)
    pub global_vars: PathBuf,
    /// OS image applied before the run
    pub image: String,
    /// Kernel boot parameters, duplicates allowed
    pub boot_parameters: Vec<String>,
    /// Loop over hardware threads instead of physical cores
    pub enable_hyperthreading: bool,
    /// Upper bound for the loop series
    pub loop_max: Option<i64>,
    /// Script executed once after reboot
    pub setup_script: PathBuf,
    /// Script executed once per loop iteration
    pub workload_script: PathBuf,
    /// Deposit settings
    pub publish: PublishConfig,
    /// Results root on the testbed controller
    pub results_root: PathBuf,
    /// Local submission tree the manifest is written into
    pub submission_root: PathBuf,
    /// Control-plane settings
    pub remote: RemoteConfig,
}

/// Deposit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Publish results to the archival service
    pub enabled: bool,
    /// Token file tried before the environment
    pub token_file: Option<PathBuf>,
    /// Environment variable tried after the token file
    pub token_env: String,
    pub license: String,
    pub access_right: String,
}

/// Control-plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// `pos` client executable
    pub pos_binary: String,
    /// Deadline for control calls (free, allocate, show, variables, metadata)
    pub timeout_secs: u64,
    /// Deadline for calls that wait on the node (image, reboot, scripts, plots, upload)
    pub long_running_timeout_secs: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            experiment_name: "stress-energy".to_string(),
            node: String::new(),
            global_vars: PathBuf::from("variables/global.yml"),
            image: "debian-bookworm".to_string(),
            boot_parameters: DEFAULT_BOOT_PARAMETERS.iter().map(|p| p.to_string()).collect(),
            enable_hyperthreading: false,
            loop_max: None,
            setup_script: PathBuf::from("loadgen/setup.sh"),
            workload_script: PathBuf::from("loadgen/loadgen.sh"),
            publish: PublishConfig::default(),
            results_root: PathBuf::from("/srv/testbed/results"),
            submission_root: PathBuf::from("submission"),
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_file: Some(expand_home(Path::new("~/.secrets/zenodo_sandbox_token"))),
            token_env: TOKEN_ENV_VAR.to_string(),
            license: "CC-BY-4.0".to_string(),
            access_right: "open".to_string(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            pos_binary: "pos".to_string(),
            timeout_secs: 30,
            long_running_timeout_secs: 4 * 60 * 60,
        }
    }
}

impl RemoteConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn long_running_timeout(&self) -> Duration {
        Duration::from_secs(self.long_running_timeout_secs)
    }
}

impl PublishConfig {
    /// Credential sources in resolution order
    pub fn token_sources(&self) -> Vec<TokenSource> {
        let mut sources = Vec::new();
        if let Some(path) = &self.token_file {
            sources.push(TokenSource::File(path.clone()));
        }
        sources.push(TokenSource::Env(self.token_env.clone()));
        sources
    }
}

/// Leaderboard aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardConfig {
    /// Output document
    pub output: PathBuf,
    /// List a local tree instead of the repository API
    pub local_root: Option<PathBuf>,
    /// Runs fetched at once
    pub concurrency: usize,
    /// Deadline per repository API request
    pub request_timeout_secs: u64,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("docs/leaderboard.json"),
            local_root: None,
            concurrency: 8,
            request_timeout_secs: 30,
        }
    }
}

/// Replace a leading `~` with `$HOME`
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExperimentConfig::default();
        assert_eq!(config.boot_parameters, vec!["iommu=pt".to_string()]);
        assert_eq!(config.remote.control_timeout(), Duration::from_secs(30));
        assert!(!config.publish.enabled);
    }

    #[test]
    fn test_token_sources_order() {
        let publish = PublishConfig {
            token_file: Some(PathBuf::from("/tmp/token")),
            ..PublishConfig::default()
        };
        let sources = publish.token_sources();
        assert_eq!(sources[0], TokenSource::File(PathBuf::from("/tmp/token")));
        assert_eq!(sources[1], TokenSource::Env(TOKEN_ENV_VAR.to_string()));

        let no_file = PublishConfig {
            token_file: None,
            ..PublishConfig::default()
        };
        assert_eq!(no_file.token_sources().len(), 1);
    }

    #[test]
    fn test_expand_home_leaves_plain_paths() {
        assert_eq!(expand_home(Path::new("/etc/token")), PathBuf::from("/etc/token"));
    }
}
