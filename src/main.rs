use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};

mod core;
mod instances;
mod submission;

use crate::core::config::{expand_home, ExperimentConfig, LeaderboardConfig};
use crate::core::orchestrator::ExperimentOrchestrator;
use crate::core::remote::PosCommandLine;
use crate::submission::leaderboard::LeaderboardAggregator;
use crate::submission::source::{GithubContents, LocalTree, SubmissionSource};
use crate::submission::validator::SubmissionValidator;

#[derive(Parser)]
#[command(name = "energy-testbed")]
#[command(about = "Energy stress experiments on the pos testbed and the submission leaderboard", long_about = None)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stress experiment on one node
    Run {
        /// Load generator node
        node: String,

        #[arg(long, default_value = "stress-energy")]
        experiment_name: String,

        /// Global variables file (YAML or JSON)
        #[arg(long, default_value = "variables/global.yml")]
        global_vars: PathBuf,

        #[arg(long, default_value = "debian-bookworm")]
        image: String,

        /// Extra kernel boot parameter, repeatable
        #[arg(long = "bootparam", value_name = "P")]
        bootparams: Vec<String>,

        /// Loop over hardware threads instead of physical cores
        #[arg(long)]
        enable_hyperthreading: bool,

        /// Upper bound for the loop series
        #[arg(long, value_name = "N")]
        loop_max: Option<i64>,

        #[arg(long, default_value = "loadgen/setup.sh")]
        setup_script: PathBuf,

        #[arg(long, default_value = "loadgen/loadgen.sh")]
        workload_script: PathBuf,

        /// Deposit results on Zenodo
        #[arg(long)]
        publish: bool,

        #[arg(long, default_value = "~/.secrets/zenodo_sandbox_token")]
        zenodo_token_file: PathBuf,

        #[arg(long, default_value = "/srv/testbed/results")]
        results_root: PathBuf,

        #[arg(long, default_value = "submission")]
        submission_root: PathBuf,

        /// Deadline for control-plane calls
        #[arg(long, default_value_t = 30)]
        remote_timeout_secs: u64,

        /// pos client executable
        #[arg(long, default_value = "pos")]
        pos_bin: String,
    },

    /// Validate every submission below a root
    Validate {
        #[arg(long, default_value = "submission")]
        root: PathBuf,
    },

    /// Rebuild the leaderboard index
    Leaderboard {
        #[arg(long, default_value = "docs/leaderboard.json")]
        out: PathBuf,

        /// Read submissions from a local checkout instead of GitHub
        #[arg(long, value_name = "DIR")]
        local: Option<PathBuf>,

        #[arg(long, default_value_t = 8)]
        concurrency: usize,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .filter_module("reqwest", LevelFilter::Warn)
        .filter_module("hyper", LevelFilter::Warn)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            node,
            experiment_name,
            global_vars,
            image,
            bootparams,
            enable_hyperthreading,
            loop_max,
            setup_script,
            workload_script,
            publish,
            zenodo_token_file,
            results_root,
            submission_root,
            remote_timeout_secs,
            pos_bin,
        } => {
            let mut config = ExperimentConfig {
                experiment_name,
                node,
                global_vars,
                image,
                enable_hyperthreading,
                loop_max,
                setup_script,
                workload_script,
                results_root,
                submission_root,
                ..ExperimentConfig::default()
            };
            config.boot_parameters.extend(bootparams);
            config.publish.enabled = publish;
            config.publish.token_file = Some(expand_home(&zenodo_token_file));
            config.remote.timeout_secs = remote_timeout_secs;
            config.remote.pos_binary = pos_bin;

            let plane = Arc::new(PosCommandLine::new(config.remote.pos_binary.clone()));
            let report = ExperimentOrchestrator::new(plane, config).run().await;
            if let Some(e) = &report.error {
                error!("{}", e);
            }
            ExitCode::from(report.status.code())
        }

        Commands::Validate { root } => match SubmissionValidator::new(&root).validate_all() {
            Ok(count) => {
                if count == 0 {
                    println!("Nothing to validate.");
                } else {
                    println!("Validated {} submission(s).", count);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                for violation in e.violations() {
                    println!("::error::{}", violation);
                }
                if e.violations().is_empty() {
                    println!("::error::{}", e);
                }
                ExitCode::FAILURE
            }
        },

        Commands::Leaderboard { out, local, concurrency } => {
            let config = LeaderboardConfig {
                output: out,
                local_root: local,
                concurrency,
                ..LeaderboardConfig::default()
            };
            let source: Arc<dyn SubmissionSource> = match &config.local_root {
                Some(dir) => {
                    info!("Reading submissions from {}", dir.display());
                    Arc::new(LocalTree::new(dir))
                }
                None => match GithubContents::from_env(Duration::from_secs(config.request_timeout_secs)) {
                    Ok(source) => Arc::new(source),
                    Err(e) => {
                        error!("{}", e);
                        return ExitCode::FAILURE;
                    }
                },
            };

            let aggregator = LeaderboardAggregator::new(source, config.concurrency);
            match aggregator.write_leaderboard(&config.output).await {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Leaderboard build failed: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
