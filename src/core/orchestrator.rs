use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::ExperimentConfig;
use crate::core::credentials::resolve_token;
use crate::core::error::ExperimentError;
use crate::core::metrics::{RunReport, RunStatus};
use crate::core::phase::{Phase, PhaseDriver, PhaseFailure, PhaseOutcome};
use crate::core::remote::{Allocation, RemotePlane, UploadRequest};
use crate::instances::common::{bounded, measure_execution_time};
use crate::instances::provisioner::Provisioner;
use crate::instances::publisher::{Publisher, RunDescription};
use crate::instances::script_runner::{ScriptRunner, ScriptSpec};
use crate::instances::topology::{CpuTopology, LoopDimension, LoopVariableSet, TopologyDetector};
use crate::instances::variables::VariableInjector;
use crate::submission::manifest::ManifestBuilder;

/// Command name of the one-off setup script
pub const SETUP_COMMAND: &str = "setup";

/// Command name of the looped workload script
pub const WORKLOAD_COMMAND: &str = "energy-stress-test";

/// State carried from one phase to the next
#[derive(Debug, Default)]
struct RunContext {
    allocation: Option<Allocation>,
    topology: CpuTopology,
    loop_vars: Option<LoopVariableSet>,
    deposition_url: Option<String>,
    submission_dir: Option<PathBuf>,
}

impl RunContext {
    fn allocation(&self) -> Result<&Allocation, ExperimentError> {
        self.allocation
            .as_ref()
            .ok_or_else(|| ExperimentError::InvalidState("no allocation".to_string()))
    }
}

/// Drives one energy experiment from allocation to submission.
///
/// Phases run strictly in [`Phase::SEQUENCE`] order. Each phase issues one
/// control-plane call (or one local write) and its result is settled by the
/// [`PhaseDriver`], which stops the run on the first fatal failure.
pub struct ExperimentOrchestrator {
    plane: Arc<dyn RemotePlane>,
    config: ExperimentConfig,
}

impl ExperimentOrchestrator {
    pub fn new(plane: Arc<dyn RemotePlane>, config: ExperimentConfig) -> Self {
        Self { plane, config }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Required local files, checked before any remote call
    pub fn preflight(&self) -> Result<(), ExperimentError> {
        for path in [
            &self.config.global_vars,
            &self.config.setup_script,
            &self.config.workload_script,
        ] {
            if !path.is_file() {
                return Err(ExperimentError::MissingLocalFile(path.clone()));
            }
        }
        Ok(())
    }

    /// Execute the experiment and report how far it got
    pub async fn run(&self) -> RunReport {
        let run_uuid = Uuid::new_v4();
        let node = self.config.node.clone();
        info!(
            "Starting {} on node {} (run {})",
            self.config.experiment_name, node, run_uuid
        );

        let mut driver = PhaseDriver::new();
        let mut report = RunReport {
            run_uuid,
            node,
            status: RunStatus::Success,
            final_state: driver.state(),
            phases: Vec::new(),
            allocation_id: None,
            result_folder: None,
            submission_dir: None,
            deposition_url: None,
            error: None,
        };

        if let Err(e) = self.preflight() {
            error!("Preflight failed: {}", e);
            report.status = RunStatus::MissingLocalFile;
            report.error = Some(e.to_string());
            return report;
        }

        let mut context = RunContext::default();
        let mut failure: Option<(PhaseFailure, RunStatus)> = None;
        for phase in Phase::SEQUENCE {
            info!("{}", phase);
            let started_at = Utc::now();
            let (result, duration_ms) = measure_execution_time(self.execute(phase, &mut context)).await;
            debug!("{} took {:.1}ms", phase, duration_ms);
            // A script removed after preflight keeps its own exit status
            let status = match &result {
                Err(ExperimentError::MissingLocalFile(_)) => RunStatus::MissingLocalFile,
                _ => RunStatus::FatalFailure,
            };
            if let Err(fatal) = driver.settle(phase, started_at, result, duration_ms) {
                failure = Some((fatal, status));
                break;
            }
        }

        match failure {
            Some((fatal, status)) => {
                report.status = status;
                report.error = Some(fatal.to_string());
            }
            None => driver.finish(),
        }

        report.final_state = driver.state();
        report.phases = driver.into_records();
        report.allocation_id = context.allocation.as_ref().map(|a| a.id.clone());
        report.result_folder = context
            .allocation
            .as_ref()
            .map(|a| self.config.results_root.join(&a.result_folder));
        report.submission_dir = context.submission_dir;
        report.deposition_url = context.deposition_url;
        report.log_summary();
        report
    }

    async fn execute(&self, phase: Phase, context: &mut RunContext) -> Result<PhaseOutcome, ExperimentError> {
        let node = self.config.node.as_str();
        let remote = &self.config.remote;

        match phase {
            Phase::Free => {
                bounded("free", remote.control_timeout(), self.plane.free(node)).await?;
            }
            Phase::Allocate => {
                let nodes = vec![node.to_string()];
                let allocation = bounded("allocate", remote.control_timeout(), self.plane.allocate(&nodes)).await?;
                debug!("Allocation ID: {}", allocation.id);
                debug!("Result folder: {}", allocation.result_folder.display());
                context.allocation = Some(allocation);
            }
            Phase::DetectTopology => {
                let detector = TopologyDetector::new(self.plane.clone(), remote.control_timeout());
                context.topology = detector.detect(node).await?;
            }
            Phase::SetGlobals => {
                info!("Set global variables: {}", self.config.global_vars.display());
                VariableInjector::new(self.plane.clone(), remote.control_timeout())
                    .push_globals_from(node, &self.config.global_vars)
                    .await?;
            }
            Phase::SetLoopVariables => {
                let loop_vars = LoopVariableSet::plan(
                    context.topology,
                    self.config.enable_hyperthreading,
                    self.config.loop_max,
                );
                info!("Looping over {} {}", loop_vars.len(), loop_vars.dimension);
                VariableInjector::new(self.plane.clone(), remote.control_timeout())
                    .push_loop(node, &loop_vars)
                    .await?;
                context.loop_vars = Some(loop_vars);
            }
            Phase::Image => {
                self.provisioner().apply_image(node, &self.config.image).await?;
            }
            Phase::BootParameters => {
                let applied = self
                    .provisioner()
                    .apply_boot_parameters(node, &self.config.boot_parameters)
                    .await?;
                info!("Apply boot params: {}", applied.join(" "));
            }
            Phase::Reboot => {
                self.provisioner().reboot(node).await?;
            }
            Phase::Setup => {
                self.scripts()
                    .run(node, &ScriptSpec::once(SETUP_COMMAND, &self.config.setup_script))
                    .await?;
            }
            Phase::Workload => {
                self.scripts()
                    .run(node, &ScriptSpec::looped(WORKLOAD_COMMAND, &self.config.workload_script))
                    .await?;
            }
            Phase::Collect => {
                let folder = context.allocation()?.result_folder.clone();
                self.publisher().render_plots(&folder).await?;
            }
            Phase::AnnotateMetadata => {
                let folder = context.allocation()?.result_folder.clone();
                let description = RunDescription {
                    node: node.to_string(),
                    image: self.config.image.clone(),
                    hyperthreading: self.threading_enabled(context),
                    license: self.config.publish.license.clone(),
                };
                self.publisher().annotate(&folder, &description).await?;
            }
            Phase::Publish => return self.publish(context).await,
            Phase::WriteManifest => {
                let result_dir = self.config.results_root.join(&context.allocation()?.result_folder);
                let builder = ManifestBuilder::new(result_dir, node)
                    .threading_enabled(self.threading_enabled(context))
                    .zenodo_html(context.deposition_url.clone());
                let manifest = builder.build();
                context.submission_dir = Some(builder.write_submission(&manifest, &self.config.submission_root)?);
            }
        }
        Ok(PhaseOutcome::Completed)
    }

    async fn publish(&self, context: &mut RunContext) -> Result<PhaseOutcome, ExperimentError> {
        let publish = &self.config.publish;
        if !publish.enabled {
            return Ok(PhaseOutcome::Skipped("publishing disabled".to_string()));
        }

        let sources = publish.token_sources();
        let Some((token, source)) = resolve_token(&sources) else {
            warn!("No Zenodo access token found; skipping publish");
            return Ok(PhaseOutcome::Skipped("no access token".to_string()));
        };
        debug!("Using Zenodo token from {}", source);

        let allocation = context.allocation()?;
        let request = UploadRequest {
            result_folder: self.config.results_root.join(&allocation.result_folder),
            allocation_id: allocation.id.clone(),
            access_token: token,
            publish: true,
            license: publish.license.clone(),
            access_right: publish.access_right.clone(),
        };
        context.deposition_url = Some(self.publisher().upload(&request).await?);
        Ok(PhaseOutcome::Completed)
    }

    fn threading_enabled(&self, context: &RunContext) -> bool {
        context
            .loop_vars
            .as_ref()
            .map(|vars| vars.dimension == LoopDimension::Threads)
            .unwrap_or(false)
    }

    fn provisioner(&self) -> Provisioner {
        Provisioner::new(
            self.plane.clone(),
            self.config.remote.control_timeout(),
            self.config.remote.long_running_timeout(),
        )
    }

    fn scripts(&self) -> ScriptRunner {
        ScriptRunner::new(self.plane.clone(), self.config.remote.long_running_timeout())
    }

    fn publisher(&self) -> Publisher {
        Publisher::new(
            self.plane.clone(),
            self.config.remote.control_timeout(),
            self.config.remote.long_running_timeout(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PublishConfig;
    use crate::core::phase::RunState;
    use crate::core::remote::{LaunchRequest, MetadataAction, MockRemotePlane, RemoteError};
    use crate::submission::manifest::Manifest;
    use crate::submission::validator::SubmissionValidator;
    use crate::submission::PLOT_FILES;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    const RESULT_FOLDER: &str = "n1/2025-03-01_10-00-00_1";

    /// Control plane double that records calls and writes the artifacts the
    /// real testbed would leave in the result folder
    struct RecordingPlane {
        results_root: PathBuf,
        calls: Mutex<Vec<String>>,
        loop_payloads: Mutex<Vec<Value>>,
        fail_visualize: bool,
        remove_on_reset: Option<PathBuf>,
    }

    impl RecordingPlane {
        fn new(results_root: &Path) -> Self {
            Self {
                results_root: results_root.to_path_buf(),
                calls: Mutex::new(Vec::new()),
                loop_payloads: Mutex::new(Vec::new()),
                fail_visualize: false,
                remove_on_reset: None,
            }
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemotePlane for RecordingPlane {
        async fn free(&self, _node: &str) -> Result<(), RemoteError> {
            self.record("free");
            Ok(())
        }

        async fn allocate(&self, nodes: &[String]) -> Result<Allocation, RemoteError> {
            self.record("allocate");
            let hw = self.results_root.join(RESULT_FOLDER).join("config/n1");
            fs::create_dir_all(&hw).unwrap();
            fs::write(
                hw.join("hardware.json"),
                json!({"processor": [{"vendor": "Intel", "model": "Xeon E-2136", "cores": 4, "threads": 8}]}).to_string(),
            )
            .unwrap();
            Ok(Allocation {
                id: "42".to_string(),
                nodes: nodes.iter().cloned().collect(),
                result_folder: PathBuf::from(RESULT_FOLDER),
            })
        }

        async fn show(&self, _node: &str) -> Result<Value, RemoteError> {
            self.record("show");
            Ok(json!({"n1": {"cores": 4, "threads": 8}}))
        }

        async fn set_variables(&self, _node: &str, payload: &Value, _as_global: bool, as_loop: bool) -> Result<(), RemoteError> {
            self.record("set_variables");
            if as_loop {
                self.loop_payloads.lock().unwrap().push(payload.clone());
            }
            Ok(())
        }

        async fn image(&self, _node: &str, _image: &str) -> Result<(), RemoteError> {
            self.record("image");
            Ok(())
        }

        async fn bootparameters(&self, _node: &str, _params: &[String], _delete: bool) -> Result<(), RemoteError> {
            self.record("bootparameters");
            Ok(())
        }

        async fn reset(&self, _node: &str, _blocking: bool) -> Result<(), RemoteError> {
            self.record("reset");
            if let Some(path) = &self.remove_on_reset {
                fs::remove_file(path).unwrap();
            }
            Ok(())
        }

        async fn launch(&self, request: &LaunchRequest) -> Result<Value, RemoteError> {
            self.record(&format!("launch:{}", request.name));
            Ok(Value::Null)
        }

        async fn visualize(&self, result_dir: &Path, _plots: &[String], _format: &str) -> Result<(), RemoteError> {
            self.record("visualize");
            if self.fail_visualize {
                return Err(RemoteError::Rejected("no telemetry".into()));
            }
            let energy = self.results_root.join(result_dir).join("energy");
            fs::create_dir_all(&energy).unwrap();
            for plot in PLOT_FILES {
                image::RgbImage::new(8, 8).save(energy.join(plot)).unwrap();
            }
            fs::write(energy.join("metrics.json"), r#"{"avg_power_w": 55.0}"#).unwrap();
            Ok(())
        }

        async fn modify_metadata(&self, _result_folder: &Path, action: MetadataAction, _data: &Value) -> Result<(), RemoteError> {
            self.record(&format!("metadata:{}", action));
            Ok(())
        }

        async fn upload(&self, request: &UploadRequest) -> Result<String, RemoteError> {
            self.record("upload");
            assert!(request.publish);
            assert_eq!(request.access_token, "sandbox-token");
            Ok("https://sandbox.zenodo.org/records/7".to_string())
        }
    }

    fn config_in(dir: &Path) -> ExperimentConfig {
        let vars = dir.join("variables");
        let scripts = dir.join("loadgen");
        fs::create_dir_all(&vars).unwrap();
        fs::create_dir_all(&scripts).unwrap();
        fs::write(vars.join("global.yml"), "stress_timeout: 30\n").unwrap();
        fs::write(scripts.join("setup.sh"), "apt-get install -y stress\n").unwrap();
        fs::write(scripts.join("loadgen.sh"), "stress -c $cores\n").unwrap();

        ExperimentConfig {
            node: "n1".to_string(),
            global_vars: vars.join("global.yml"),
            setup_script: scripts.join("setup.sh"),
            workload_script: scripts.join("loadgen.sh"),
            results_root: dir.join("results"),
            submission_root: dir.join("submission"),
            publish: PublishConfig {
                token_file: None,
                ..PublishConfig::default()
            },
            ..ExperimentConfig::default()
        }
    }

    fn read_manifest(report: &RunReport) -> Manifest {
        let dir = report.submission_dir.as_ref().unwrap();
        serde_json::from_str(&fs::read_to_string(dir.join("manifest.json")).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let plane = Arc::new(RecordingPlane::new(&config.results_root));

        let orchestrator = ExperimentOrchestrator::new(plane.clone(), config.clone());
        let report = orchestrator.run().await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.final_state, RunState::Terminal);
        assert_eq!(report.allocation_id.as_deref(), Some("42"));
        assert_eq!(plane.loop_payloads.lock().unwrap().clone(), vec![json!({"cores": [1, 2, 3, 4]})]);
        assert_eq!(
            plane.calls(),
            vec![
                "free",
                "allocate",
                "show",
                "set_variables",
                "set_variables",
                "image",
                "bootparameters",
                "reset",
                "launch:setup",
                "launch:energy-stress-test",
                "visualize",
                "metadata:add_title",
                "metadata:add_description",
                "metadata:add_keywords",
                "metadata:add_license",
            ]
        );

        let manifest = read_manifest(&report);
        assert!(!manifest.threading_enabled);
        assert_eq!(manifest.zenodo_html, "");
        assert_eq!(manifest.run_id, "2025-03-01_10-00-00_1");
        assert_eq!(manifest.processor[0].cores, 4);
        assert_eq!(manifest.metrics.avg_power_w, Some(55.0));

        let validated = SubmissionValidator::new(&config.submission_root).validate_all().unwrap();
        assert_eq!(validated, 1);
    }

    #[tokio::test]
    async fn test_publish_back_fills_deposition_link() {
        let tmp = tempfile::tempdir().unwrap();
        let token_file = tmp.path().join("token");
        fs::write(&token_file, "sandbox-token\n").unwrap();
        let mut config = config_in(tmp.path());
        config.enable_hyperthreading = true;
        config.publish.enabled = true;
        config.publish.token_file = Some(token_file);
        config.publish.token_env = "ENERGY_TESTBED_UNSET_TOKEN_VAR".to_string();
        let plane = Arc::new(RecordingPlane::new(&config.results_root));

        let report = ExperimentOrchestrator::new(plane.clone(), config).run().await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(plane.loop_payloads.lock().unwrap()[0]["cores"].as_array().unwrap().len(), 8);
        assert!(plane.calls().contains(&"upload".to_string()));
        let manifest = read_manifest(&report);
        assert!(manifest.threading_enabled);
        assert_eq!(manifest.zenodo_html, "https://sandbox.zenodo.org/records/7");
        assert_eq!(report.deposition_url.as_deref(), Some("https://sandbox.zenodo.org/records/7"));
    }

    #[tokio::test]
    async fn test_soft_failure_still_writes_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut plane = RecordingPlane::new(&config.results_root);
        plane.fail_visualize = true;
        let plane = Arc::new(plane);

        let report = ExperimentOrchestrator::new(plane.clone(), config).run().await;

        assert_eq!(report.status.code(), 0);
        let soft: Vec<Phase> = report.soft_failures().iter().map(|r| r.phase).collect();
        assert_eq!(soft, vec![Phase::Collect]);
        assert!(report.submission_dir.unwrap().join("manifest.json").is_file());
    }

    #[tokio::test]
    async fn test_fatal_failure_stops_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());

        let mut plane = MockRemotePlane::new();
        plane.expect_free().times(1).returning(|_| Ok(()));
        plane.expect_allocate().times(1).returning(|nodes| {
            Ok(Allocation {
                id: "1".to_string(),
                nodes: nodes.iter().cloned().collect(),
                result_folder: PathBuf::from(RESULT_FOLDER),
            })
        });
        plane
            .expect_show()
            .times(1)
            .returning(|_| Err(RemoteError::Transport("ssh timeout".into())));
        plane.expect_set_variables().times(2).returning(|_, _, _, _| Ok(()));
        plane
            .expect_image()
            .times(1)
            .returning(|_, _| Err(RemoteError::Rejected("image not found".into())));

        let report = ExperimentOrchestrator::new(Arc::new(plane), config.clone()).run().await;

        assert_eq!(report.status, RunStatus::FatalFailure);
        assert_eq!(report.status.code(), 1);
        assert_eq!(report.final_state, RunState::ConfiguredLoop);
        assert!(report.error.unwrap().contains("apply image"));
        assert_eq!(report.phases.last().map(|r| r.phase), Some(Phase::Image));
        assert!(report.submission_dir.is_none());
        assert!(!config.submission_root.exists());
    }

    #[tokio::test]
    async fn test_missing_script_fails_preflight() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_in(tmp.path());
        config.workload_script = tmp.path().join("loadgen/missing.sh");

        let report = ExperimentOrchestrator::new(Arc::new(MockRemotePlane::new()), config)
            .run()
            .await;

        assert_eq!(report.status, RunStatus::MissingLocalFile);
        assert_eq!(report.status.code(), 2);
        assert!(report.phases.is_empty());
        assert_eq!(report.final_state, RunState::Idle);
    }

    #[tokio::test]
    async fn test_script_removed_after_preflight_keeps_missing_file_status() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut plane = RecordingPlane::new(&config.results_root);
        plane.remove_on_reset = Some(config.workload_script.clone());
        let plane = Arc::new(plane);

        let report = ExperimentOrchestrator::new(plane.clone(), config.clone()).run().await;

        assert_eq!(report.status, RunStatus::MissingLocalFile);
        assert_eq!(report.status.code(), 2);
        assert!(report.error.unwrap().contains("loadgen.sh"));
        assert!(plane.calls().contains(&"launch:setup".to_string()));
        assert!(!plane.calls().contains(&"launch:energy-stress-test".to_string()));
        assert!(report.submission_dir.is_none());
        assert!(!config.submission_root.exists());
    }
}
