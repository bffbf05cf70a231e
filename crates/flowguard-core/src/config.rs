use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use alerts::{DedupConfig, Severity};
use bus::BusConfig;
use features::{FeatureConfig, KeyProjection, WindowSpec};
use ingest::{Framing, IngestConfig};
use orchestrator::{OrchestratorConfig, ScopeLimit};
use policy_agent::{DecisionContext, FallbackThresholds};

const CONFIG_CANDIDATES: [&str; 3] = [
    "/etc/flowguard/flowguard.toml",
    "./conf/flowguard.toml",
    "./flowguard.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSpec {
    pub framing: Framing,
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub backend: String,
    pub path: String,
    pub memory_cap: usize,
    pub retention_secs: u64,
    pub purge_batch: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: "/var/lib/flowguard/audit.db".to_string(),
            memory_cap: audit::DEFAULT_MEMORY_CAP,
            retention_secs: 30 * 86_400,
            purge_batch: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub min_severity: Severity,
    pub dedup: DedupConfig,
    pub webhook_url: Option<String>,
    pub webhook_timeout_ms: u64,
    /// Bounded feed into the alert task; overflow drops oldest, counted.
    pub queue_capacity: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            min_severity: Severity::Low,
            dedup: DedupConfig::default(),
            webhook_url: None,
            webhook_timeout_ms: 3_000,
            queue_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSetup {
    pub packet_filter_enabled: bool,
    pub cloud_group_enabled: bool,
    pub cloud_base_url: String,
    pub cloud_group_id: String,
    pub cloud_api_token: String,
    /// Test/dev backend that enforces nothing but records everything.
    pub memory_enabled: bool,
}

impl Default for AdapterSetup {
    fn default() -> Self {
        Self {
            packet_filter_enabled: true,
            cloud_group_enabled: false,
            cloud_base_url: "http://localhost:8780".to_string(),
            cloud_group_id: "sg-default".to_string(),
            cloud_api_token: String::new(),
            memory_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub sensor_id: String,
    pub collectors: Vec<CollectorSpec>,
    pub bus: BusTuning,
    pub ingest: IngestTuning,
    pub windows: Vec<WindowSpec>,
    pub allowed_lateness_ms: i64,
    pub per_key_memory_cap: usize,
    pub detection_workers: usize,
    pub ensemble_artifact_path: Option<String>,
    pub ensemble_threshold_override: Option<f64>,
    /// Stacking weights in detector order; overrides the artifact's.
    pub ensemble_weights_override: Option<Vec<f64>>,
    pub agent_artifact_path: Option<String>,
    pub fallback: FallbackThresholds,
    pub decision_context: DecisionContext,
    pub orchestrator: OrchestratorConfig,
    pub audit: AuditConfig,
    pub alerts: AlertConfig,
    pub stage_deadline_ms: u64,
    pub expiry_scan_interval_ms: u64,
    pub retry_scan_interval_ms: u64,
    pub session_sweep_interval_ms: u64,
    pub hit_poll_interval_ms: u64,
    pub adapters: AdapterSetup,
}

/// Bus knobs, kept apart from `bus::BusConfig` so the file format stays
/// flat and serde-friendly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusTuning {
    pub partitions: usize,
    pub partition_capacity: usize,
    pub publish_timeout_ms: u64,
}

impl Default for BusTuning {
    fn default() -> Self {
        let base = BusConfig::default();
        Self {
            partitions: base.partitions,
            partition_capacity: base.partition_capacity,
            publish_timeout_ms: base.publish_timeout_ms,
        }
    }
}

impl BusTuning {
    pub fn to_bus(&self) -> BusConfig {
        BusConfig {
            partitions: self.partitions,
            partition_capacity: self.partition_capacity,
            publish_timeout_ms: self.publish_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestTuning {
    pub dedup_capacity: usize,
    pub publish_retry_max: u32,
    pub publish_retry_base_ms: u64,
}

impl Default for IngestTuning {
    fn default() -> Self {
        let base = IngestConfig::default();
        Self {
            dedup_capacity: base.dedup_capacity,
            publish_retry_max: base.publish_retry_max,
            publish_retry_base_ms: base.publish_retry_base_ms,
        }
    }
}

impl IngestTuning {
    pub fn to_ingest(&self) -> IngestConfig {
        IngestConfig {
            dedup_capacity: self.dedup_capacity,
            publish_retry_max: self.publish_retry_max,
            publish_retry_base_ms: self.publish_retry_base_ms,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sensor_id: default_sensor_id(),
            collectors: vec![
                CollectorSpec {
                    framing: Framing::FlowV5,
                    bind: "0.0.0.0:2055".to_string(),
                },
                CollectorSpec {
                    framing: Framing::FlowJson,
                    bind: "0.0.0.0:4739".to_string(),
                },
                CollectorSpec {
                    framing: Framing::PacketSummary,
                    bind: "0.0.0.0:7171".to_string(),
                },
                CollectorSpec {
                    framing: Framing::HostEvent,
                    bind: "0.0.0.0:7172".to_string(),
                },
            ],
            bus: BusTuning::default(),
            ingest: IngestTuning::default(),
            windows: vec![
                WindowSpec::tumbling(30_000),
                WindowSpec::sliding(60_000, 15_000),
                WindowSpec::session(120_000),
            ],
            allowed_lateness_ms: 5_000,
            per_key_memory_cap: 16_384,
            detection_workers: 2,
            ensemble_artifact_path: None,
            ensemble_threshold_override: None,
            ensemble_weights_override: None,
            agent_artifact_path: None,
            fallback: FallbackThresholds::default(),
            decision_context: DecisionContext::default(),
            orchestrator: OrchestratorConfig::default(),
            audit: AuditConfig::default(),
            alerts: AlertConfig::default(),
            stage_deadline_ms: 5_000,
            expiry_scan_interval_ms: 1_000,
            retry_scan_interval_ms: 1_000,
            session_sweep_interval_ms: 500,
            hit_poll_interval_ms: 10_000,
            adapters: AdapterSetup::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        config.apply_file_config()?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn feature_config(&self) -> FeatureConfig {
        FeatureConfig {
            projections: vec![KeyProjection::SrcAddr, KeyProjection::SrcAddrDstPort],
            windows: self.windows.clone(),
            allowed_lateness_ms: self.allowed_lateness_ms,
            max_tracked_keys: self.per_key_memory_cap,
            port_cardinality_cap: 512,
        }
    }

    fn apply_file_config(&mut self) -> Result<bool> {
        let Some(path) = resolve_config_path()? else {
            return Ok(false);
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        let file: FileConfig = toml::from_str(&raw)
            .with_context(|| format!("failed parsing TOML config {}", path.display()))?;

        self.apply_file_pipeline(file.pipeline);
        self.apply_file_windows(file.windows);
        self.apply_file_artifacts(file.artifacts);
        self.apply_file_orchestrator(file.orchestrator);
        self.apply_file_audit(file.audit);
        self.apply_file_alerts(file.alerts);
        self.apply_file_adapters(file.adapters);

        Ok(true)
    }

    fn apply_file_pipeline(&mut self, section: Option<FilePipeline>) {
        let Some(section) = section else {
            return;
        };
        if let Some(v) = non_empty(section.sensor_id) {
            self.sensor_id = v;
        }
        if let Some(v) = section.partitions {
            self.bus.partitions = v.max(1);
        }
        if let Some(v) = section.partition_capacity {
            self.bus.partition_capacity = v.max(1);
        }
        if let Some(v) = section.publish_timeout_ms {
            self.bus.publish_timeout_ms = v;
        }
        if let Some(v) = section.dedup_capacity {
            self.ingest.dedup_capacity = v.max(1);
        }
        if let Some(v) = section.detection_workers {
            self.detection_workers = v.max(1);
        }
        if let Some(v) = section.allowed_lateness_ms {
            self.allowed_lateness_ms = v;
        }
        if let Some(v) = section.per_key_memory_cap {
            self.per_key_memory_cap = v.max(1);
        }
        if let Some(v) = section.stage_deadline_ms {
            self.stage_deadline_ms = v;
        }
        if let Some(collectors) = section.collectors {
            if !collectors.is_empty() {
                self.collectors = collectors;
            }
        }
    }

    fn apply_file_windows(&mut self, windows: Option<Vec<FileWindow>>) {
        let Some(windows) = windows else {
            return;
        };
        if windows.is_empty() {
            return;
        }
        let mut specs = Vec::with_capacity(windows.len());
        for w in windows {
            let spec = match w.kind.as_str() {
                "tumbling" => WindowSpec::tumbling(w.span_ms.unwrap_or(30_000)),
                "sliding" => WindowSpec::sliding(
                    w.span_ms.unwrap_or(60_000),
                    w.slide_ms.unwrap_or(15_000),
                ),
                "session" => WindowSpec::session(w.gap_ms.unwrap_or(120_000)),
                _ => continue,
            };
            specs.push(spec);
        }
        if !specs.is_empty() {
            self.windows = specs;
        }
    }

    fn apply_file_artifacts(&mut self, section: Option<FileArtifacts>) {
        let Some(section) = section else {
            return;
        };
        if let Some(v) = non_empty(section.ensemble_path) {
            self.ensemble_artifact_path = Some(v);
        }
        if let Some(v) = section.ensemble_threshold {
            self.ensemble_threshold_override = Some(v);
        }
        if let Some(v) = section.ensemble_weights {
            if v.len() == 4 {
                self.ensemble_weights_override = Some(v);
            }
        }
        if let Some(v) = non_empty(section.agent_path) {
            self.agent_artifact_path = Some(v);
        }
        if let Some(v) = section.fallback_high {
            self.fallback.high = v;
        }
        if let Some(v) = section.fallback_medium {
            self.fallback.medium = v;
        }
    }

    fn apply_file_orchestrator(&mut self, section: Option<FileOrchestrator>) {
        let Some(section) = section else {
            return;
        };
        if let Some(v) = section.deny_priority {
            self.orchestrator.synthesis.priority.deny = v;
        }
        if let Some(v) = section.quarantine_priority {
            self.orchestrator.synthesis.priority.quarantine = v;
        }
        if let Some(v) = section.rate_limit_priority {
            self.orchestrator.synthesis.priority.rate_limit = v;
        }
        if let Some(v) = section.deny_ttl_secs {
            self.orchestrator.synthesis.ttl.deny_secs = v;
        }
        if let Some(v) = section.rate_limit_ttl_secs {
            self.orchestrator.synthesis.ttl.rate_limit_secs = v;
        }
        if let Some(v) = section.retry_max_attempts {
            self.orchestrator.retry.max_attempts = v;
        }
        if let Some(v) = section.retry_base_ms {
            self.orchestrator.retry.base_ms = v;
        }
        if let Some(v) = section.retry_max_ms {
            self.orchestrator.retry.max_ms = v;
        }
        if let Some(v) = section.deny_min_prefix_v4 {
            self.orchestrator.validator.deny_scope = ScopeLimit {
                min_prefix_v4: v,
                ..self.orchestrator.validator.deny_scope
            };
        }
        if let Some(assets) = section.protected_assets {
            let parsed: Vec<adapters::Cidr> = assets
                .iter()
                .filter_map(|raw| raw.parse().ok())
                .collect();
            self.orchestrator.validator.protected_assets = parsed;
        }
    }

    fn apply_file_audit(&mut self, section: Option<FileAudit>) {
        let Some(section) = section else {
            return;
        };
        if let Some(v) = non_empty(section.backend) {
            self.audit.backend = v;
        }
        if let Some(v) = non_empty(section.path) {
            self.audit.path = v;
        }
        if let Some(v) = section.retention_secs {
            self.audit.retention_secs = v;
        }
        if let Some(v) = section.purge_batch {
            self.audit.purge_batch = v.max(1);
        }
    }

    fn apply_file_alerts(&mut self, section: Option<FileAlerts>) {
        let Some(section) = section else {
            return;
        };
        if let Some(v) = non_empty(section.min_severity) {
            self.alerts.min_severity = parse_severity(&v);
        }
        if let Some(v) = section.dedup_window_secs {
            self.alerts.dedup.window_secs = v;
        }
        if let Some(v) = non_empty(section.webhook_url) {
            self.alerts.webhook_url = Some(v);
        }
        if let Some(v) = section.webhook_timeout_ms {
            self.alerts.webhook_timeout_ms = v;
        }
    }

    fn apply_file_adapters(&mut self, section: Option<FileAdapters>) {
        let Some(section) = section else {
            return;
        };
        if let Some(v) = section.packet_filter_enabled {
            self.adapters.packet_filter_enabled = v;
        }
        if let Some(v) = section.cloud_group_enabled {
            self.adapters.cloud_group_enabled = v;
        }
        if let Some(v) = non_empty(section.cloud_base_url) {
            self.adapters.cloud_base_url = v;
        }
        if let Some(v) = non_empty(section.cloud_group_id) {
            self.adapters.cloud_group_id = v;
        }
        if let Some(v) = non_empty(section.cloud_api_token) {
            self.adapters.cloud_api_token = v;
        }
        if let Some(v) = section.memory_enabled {
            self.adapters.memory_enabled = v;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_non_empty("FLOWGUARD_SENSOR_ID") {
            self.sensor_id = v;
        }
        if let Some(v) = env_non_empty("FLOWGUARD_ENSEMBLE_ARTIFACT") {
            self.ensemble_artifact_path = Some(v);
        }
        if let Some(v) = env_non_empty("FLOWGUARD_AGENT_ARTIFACT") {
            self.agent_artifact_path = Some(v);
        }
        if let Some(v) = env_non_empty("FLOWGUARD_AUDIT_BACKEND") {
            self.audit.backend = v;
        }
        if let Some(v) = env_non_empty("FLOWGUARD_AUDIT_PATH") {
            self.audit.path = v;
        }
        if let Some(v) = env_non_empty("FLOWGUARD_ALERT_WEBHOOK") {
            self.alerts.webhook_url = Some(v);
        }
        if let Some(v) = env_non_empty("FLOWGUARD_ALERT_MIN_SEVERITY") {
            self.alerts.min_severity = parse_severity(&v);
        }
        if let Some(v) = env_usize("FLOWGUARD_PARTITIONS") {
            self.bus.partitions = v.max(1);
        }
        if let Some(v) = env_usize("FLOWGUARD_DETECTION_WORKERS") {
            self.detection_workers = v.max(1);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    pipeline: Option<FilePipeline>,
    #[serde(default)]
    windows: Option<Vec<FileWindow>>,
    #[serde(default)]
    artifacts: Option<FileArtifacts>,
    #[serde(default)]
    orchestrator: Option<FileOrchestrator>,
    #[serde(default)]
    audit: Option<FileAudit>,
    #[serde(default)]
    alerts: Option<FileAlerts>,
    #[serde(default)]
    adapters: Option<FileAdapters>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FilePipeline {
    #[serde(default)]
    sensor_id: Option<String>,
    #[serde(default)]
    partitions: Option<usize>,
    #[serde(default)]
    partition_capacity: Option<usize>,
    #[serde(default)]
    publish_timeout_ms: Option<u64>,
    #[serde(default)]
    dedup_capacity: Option<usize>,
    #[serde(default)]
    detection_workers: Option<usize>,
    #[serde(default)]
    allowed_lateness_ms: Option<i64>,
    #[serde(default)]
    per_key_memory_cap: Option<usize>,
    #[serde(default)]
    stage_deadline_ms: Option<u64>,
    #[serde(default)]
    collectors: Option<Vec<CollectorSpec>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileWindow {
    kind: String,
    #[serde(default)]
    span_ms: Option<i64>,
    #[serde(default)]
    slide_ms: Option<i64>,
    #[serde(default)]
    gap_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileArtifacts {
    #[serde(default)]
    ensemble_path: Option<String>,
    #[serde(default)]
    ensemble_threshold: Option<f64>,
    #[serde(default)]
    ensemble_weights: Option<Vec<f64>>,
    #[serde(default)]
    agent_path: Option<String>,
    #[serde(default)]
    fallback_high: Option<f64>,
    #[serde(default)]
    fallback_medium: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileOrchestrator {
    #[serde(default)]
    deny_priority: Option<u16>,
    #[serde(default)]
    quarantine_priority: Option<u16>,
    #[serde(default)]
    rate_limit_priority: Option<u16>,
    #[serde(default)]
    deny_ttl_secs: Option<u64>,
    #[serde(default)]
    rate_limit_ttl_secs: Option<u64>,
    #[serde(default)]
    retry_max_attempts: Option<u32>,
    #[serde(default)]
    retry_base_ms: Option<u64>,
    #[serde(default)]
    retry_max_ms: Option<u64>,
    #[serde(default)]
    deny_min_prefix_v4: Option<u8>,
    #[serde(default)]
    protected_assets: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileAudit {
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    retention_secs: Option<u64>,
    #[serde(default)]
    purge_batch: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileAlerts {
    #[serde(default)]
    min_severity: Option<String>,
    #[serde(default)]
    dedup_window_secs: Option<u64>,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    webhook_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileAdapters {
    #[serde(default)]
    packet_filter_enabled: Option<bool>,
    #[serde(default)]
    cloud_group_enabled: Option<bool>,
    #[serde(default)]
    cloud_base_url: Option<String>,
    #[serde(default)]
    cloud_group_id: Option<String>,
    #[serde(default)]
    cloud_api_token: Option<String>,
    #[serde(default)]
    memory_enabled: Option<bool>,
}

fn resolve_config_path() -> Result<Option<PathBuf>> {
    if let Ok(p) = std::env::var("FLOWGUARD_CONFIG") {
        let p = p.trim();
        if !p.is_empty() {
            let path = PathBuf::from(p);
            if !path.exists() {
                anyhow::bail!("configured FLOWGUARD_CONFIG does not exist: {}", path.display());
            }
            return Ok(Some(path));
        }
    }

    for candidate in CONFIG_CANDIDATES {
        let p = Path::new(candidate);
        if p.exists() {
            return Ok(Some(p.to_path_buf()));
        }
    }

    Ok(None)
}

fn parse_severity(raw: &str) -> Severity {
    match raw.trim().to_ascii_lowercase().as_str() {
        "critical" => Severity::Critical,
        "high" => Severity::High,
        "medium" => Severity::Medium,
        _ => Severity::Low,
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| non_empty(Some(v)))
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

fn default_sensor_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "flowguard-core-1".to_string())
}
