pub mod author;
pub mod hardware;
pub mod leaderboard;
pub mod manifest;
pub mod source;
pub mod validator;

/// Manifest file inside a submission run directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Plot directory, both in result folders and submissions
pub const ENERGY_DIR: &str = "energy";

/// Per-node hardware descriptors live under `config/<node>/`
pub const CONFIG_DIR: &str = "config";

pub const HARDWARE_FILE: &str = "hardware.json";

/// Plot images every submission carries
pub const PLOT_FILES: [&str; 4] = [
    "power-over-time.png",
    "total-energy-per-node.png",
    "current-over-time.png",
    "smoothed-voltage.png",
];
