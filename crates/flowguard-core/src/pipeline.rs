use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use adapters::{
    CloudGroupAdapter, CloudGroupConfig, FirewallAdapter, MemoryAdapter, PacketFilterAdapter,
    ProcessRunner,
};
use alerts::{Alert, AlertEngine, AlertSink, LogSink, WebhookSink};
use audit::{AuditRecord, AuditStore};
use bus::{partition_for, Subscription, Topic, TOPIC_FEATURES, TOPIC_NORMALIZED};
use detection::{Detection, Ensemble, EnsembleArtifact, EnsembleCounters};
use features::{FeatureEngine, FeatureFrame};
use ingest::{CommonRecord, Framing, IngestStage};
use orchestrator::{ApplyReport, DecisionOutcome, Orchestrator, RuleLifecycle};
use policy_agent::{AgentCounters, Decision, DecisionContext, PolicyAgent};

use crate::config::PipelineConfig;
use crate::service::{ControlCommand, PipelineService};

/// A scored record in flight from detection to the orchestrator.
pub(crate) struct Scored {
    pub detection: Detection,
    pub decision: Decision,
}

/// Handle collectors use to feed frames into the pipeline. The ingest
/// stage (dedup window included) is shared across collector sockets.
#[derive(Clone)]
pub struct CollectorHandle {
    sensor_id: String,
    stage: Arc<Mutex<IngestStage>>,
    topic: Arc<Topic<CommonRecord>>,
}

impl CollectorHandle {
    pub async fn ingest_frame(&self, framing: Framing, data: &[u8]) -> usize {
        let mut stage = self.stage.lock().await;
        stage
            .ingest_frame(framing, data, &self.sensor_id, &self.topic, now_unix_ms())
            .await
    }
}

/// The assembled detection → decision → enforcement pipeline. Stages are
/// tokio tasks joined by bus topics and bounded channels; shutdown drains
/// through a watch signal.
pub struct Pipeline {
    service: PipelineService,
    collector: CollectorHandle,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Pipeline {
    pub async fn start(
        config: PipelineConfig,
        extra_adapters: Vec<Arc<dyn FirewallAdapter>>,
    ) -> Result<Self> {
        let bus_config = config.bus.to_bus();
        let normalized: Arc<Topic<CommonRecord>> =
            Arc::new(Topic::new(TOPIC_NORMALIZED, &bus_config));
        // The features topic is partitioned by window key; its partition
        // count is the detection worker pool size.
        let features_bus = bus::BusConfig {
            partitions: config.detection_workers.max(1),
            ..bus_config.clone()
        };
        let features_topic: Arc<Topic<FeatureFrame>> =
            Arc::new(Topic::new(TOPIC_FEATURES, &features_bus));

        let ensemble = Arc::new(load_ensemble(&config)?);
        let agent = Arc::new(load_agent(&config)?);

        let mut adapter_list: Vec<Arc<dyn FirewallAdapter>> = Vec::new();
        if config.adapters.packet_filter_enabled {
            adapter_list.push(Arc::new(PacketFilterAdapter::new(Box::new(
                ProcessRunner::default(),
            ))));
        }
        if config.adapters.cloud_group_enabled {
            adapter_list.push(Arc::new(CloudGroupAdapter::new(CloudGroupConfig {
                base_url: config.adapters.cloud_base_url.clone(),
                group_id: config.adapters.cloud_group_id.clone(),
                api_token: config.adapters.cloud_api_token.clone(),
                ..CloudGroupConfig::default()
            })));
        }
        if config.adapters.memory_enabled {
            adapter_list.push(Arc::new(MemoryAdapter::new("memory")));
        }
        adapter_list.extend(extra_adapters);
        anyhow::ensure!(!adapter_list.is_empty(), "no enforcement adapters configured");

        let audit_store = match config.audit.backend.as_str() {
            "sqlite" => AuditStore::sqlite(&config.audit.path)
                .context("failed opening audit store")?,
            _ => AuditStore::memory(config.audit.memory_cap),
        };

        let mut sinks: Vec<Box<dyn AlertSink>> = vec![Box::new(LogSink)];
        if let Some(url) = &config.alerts.webhook_url {
            sinks.push(Box::new(WebhookSink::new(url, config.alerts.webhook_timeout_ms)));
        }
        let alert_engine = AlertEngine::new(
            config.alerts.min_severity,
            config.alerts.dedup.clone(),
            sinks,
        );

        let orchestrator = Orchestrator::new(config.orchestrator.clone(), adapter_list);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (decision_tx, decision_rx) = mpsc::channel::<Scored>(1_024);
        let (control_tx, control_rx) = mpsc::channel::<ControlCommand>(256);
        let (alert_tx, alert_rx) = mpsc::channel::<Alert>(config.alerts.queue_capacity.max(1));

        let mut tasks = JoinSet::new();

        // One feature shard per normalized partition: single-writer window
        // state with per-source ordering preserved end to end.
        for subscription in normalized.subscribe("features") {
            tasks.spawn(feature_worker(
                subscription,
                config.feature_config(),
                Arc::clone(&features_topic),
                config.session_sweep_interval_ms,
                shutdown_rx.clone(),
            ));
        }

        // Detection workers, one per features partition.
        for subscription in features_topic.subscribe("detection") {
            tasks.spawn(detection_worker(
                subscription,
                Arc::clone(&ensemble),
                Arc::clone(&agent),
                config.decision_context.clone(),
                decision_tx.clone(),
                config.stage_deadline_ms,
                shutdown_rx.clone(),
            ));
        }
        drop(decision_tx);

        tasks.spawn(control_task(
            orchestrator,
            audit_store,
            decision_rx,
            control_rx,
            alert_tx,
            config.clone(),
            shutdown_rx.clone(),
        ));

        tasks.spawn(alert_task(alert_engine, alert_rx, shutdown_rx.clone()));

        let ingest_stage = Arc::new(Mutex::new(IngestStage::new(config.ingest.to_ingest())));
        let collector = CollectorHandle {
            sensor_id: config.sensor_id.clone(),
            stage: ingest_stage,
            topic: Arc::clone(&normalized),
        };

        let service = PipelineService::new(
            ensemble,
            agent,
            config.decision_context.clone(),
            control_tx,
            config.stage_deadline_ms,
        );

        info!(
            partitions = bus_config.partitions,
            detection_workers = config.detection_workers,
            "pipeline started"
        );

        Ok(Self {
            service,
            collector,
            shutdown_tx,
            tasks,
        })
    }

    pub fn service(&self) -> PipelineService {
        self.service.clone()
    }

    pub fn collector(&self) -> CollectorHandle {
        self.collector.clone()
    }

    /// Signal shutdown and wait for every stage to drain.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        while self.tasks.join_next().await.is_some() {}
        info!("pipeline stopped");
    }
}

fn load_ensemble(config: &PipelineConfig) -> Result<Ensemble> {
    let mut artifact = match &config.ensemble_artifact_path {
        Some(path) => EnsembleArtifact::from_file(std::path::Path::new(path))
            .with_context(|| format!("failed loading detection artifact {}", path))?,
        None => EnsembleArtifact::default(),
    };
    if let Some(threshold) = config.ensemble_threshold_override {
        artifact.threshold = threshold;
    }
    if let Some(weights) = &config.ensemble_weights_override {
        if let [stumps, sequence, isolation, reconstruction] = weights[..] {
            artifact.weights = detection::EnsembleWeights {
                gradient_stumps: stumps,
                sequence,
                isolation,
                reconstruction,
            };
        }
    }
    Ensemble::new(artifact).context("invalid detection artifact")
}

fn load_agent(config: &PipelineConfig) -> Result<PolicyAgent> {
    match &config.agent_artifact_path {
        Some(path) => PolicyAgent::from_path(std::path::Path::new(path), config.fallback.clone())
            .map_err(|e| anyhow::anyhow!("failed loading policy artifact: {}", e)),
        None => Ok(PolicyAgent::with_default_artifact()),
    }
}

async fn feature_worker(
    subscription: Subscription<CommonRecord>,
    config: features::FeatureConfig,
    features_topic: Arc<Topic<FeatureFrame>>,
    sweep_interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut engine = FeatureEngine::new(config);
    let mut sweep = time::interval(Duration::from_millis(sweep_interval_ms.max(50)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            delivered = subscription.recv() => {
                let frames = engine.observe(&delivered.payload, now_unix_ms());
                publish_frames(&features_topic, frames).await;
                // Offset committed only after emitted windows are on the
                // features topic.
                subscription.commit(delivered.offset);
            }
            _ = sweep.tick() => {
                let frames = engine.sweep(now_unix_ms());
                publish_frames(&features_topic, frames).await;
            }
        }
    }
    debug!(
        partition = subscription.partition(),
        vectors = engine.counters().vectors_emitted,
        late_dropped = engine.counters().late_dropped,
        windows_evicted = engine.counters().windows_evicted,
        "feature worker stopped"
    );
}

async fn publish_frames(topic: &Topic<FeatureFrame>, frames: Vec<FeatureFrame>) {
    for frame in frames {
        let partition = partition_for(&frame.partition_key(), topic.partition_count());
        if let Err(error) = topic.publish(partition, frame).await {
            warn!(error = %error, "dropping feature frame after publish timeout");
        }
    }
}

async fn detection_worker(
    subscription: Subscription<FeatureFrame>,
    ensemble: Arc<Ensemble>,
    agent: Arc<PolicyAgent>,
    context: DecisionContext,
    decision_tx: mpsc::Sender<Scored>,
    deadline_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ensemble_counters = EnsembleCounters::default();
    let mut agent_counters = AgentCounters::default();
    let mut abandoned: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            delivered = subscription.recv() => {
                let detection = ensemble.score(&delivered.payload, now_unix_ms(), &mut ensemble_counters);
                let decision = agent.decide(&detection, &context, &mut agent_counters);
                let scored = Scored { detection, decision };

                match decision_tx
                    .send_timeout(scored, Duration::from_millis(deadline_ms.max(1)))
                    .await
                {
                    Ok(()) => subscription.commit(delivered.offset),
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                        // Deadline hit: abandon the in-flight record and
                        // leave the offset uncommitted for redelivery.
                        abandoned = abandoned.saturating_add(1);
                        warn!(partition = subscription.partition(), "decision handoff deadline elapsed");
                    }
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => break,
                }
            }
        }
    }
    debug!(
        partition = subscription.partition(),
        scored = ensemble_counters.scored,
        degraded = ensemble_counters.degraded,
        fallback_decisions = agent_counters.fallback_used,
        abandoned,
        "detection worker stopped"
    );
}

struct ControlState {
    orchestrator: Orchestrator,
    audit: AuditStore,
    alert_tx: mpsc::Sender<Alert>,
    audit_append_failures: u64,
    alerts_dropped: u64,
}

#[allow(clippy::too_many_arguments)]
async fn control_task(
    orchestrator: Orchestrator,
    audit: AuditStore,
    mut decision_rx: mpsc::Receiver<Scored>,
    mut control_rx: mpsc::Receiver<ControlCommand>,
    alert_tx: mpsc::Sender<Alert>,
    config: PipelineConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state = ControlState {
        orchestrator,
        audit,
        alert_tx,
        audit_append_failures: 0,
        alerts_dropped: 0,
    };

    let mut expiry = time::interval(Duration::from_millis(config.expiry_scan_interval_ms.max(100)));
    let mut retry = time::interval(Duration::from_millis(config.retry_scan_interval_ms.max(100)));
    let mut maintenance = time::interval(Duration::from_millis(config.hit_poll_interval_ms.max(500)));
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            scored = decision_rx.recv() => {
                let Some(scored) = scored else {
                    break;
                };
                handle_scored(&mut state, scored).await;
            }
            command = control_rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                handle_command(&mut state, command).await;
            }
            _ = expiry.tick() => {
                let reports = state.orchestrator.expire_due(now_unix()).await;
                for report in reports {
                    debug!(rule_id = %report.rule_id, "rule expired");
                }
            }
            _ = retry.tick() => {
                let reports = state.orchestrator.retry_due(now_unix()).await;
                for report in &reports {
                    if report.lifecycle == RuleLifecycle::Failed && !report.will_retry {
                        warn!(rule_id = %report.rule_id, "rule apply gave up after retries");
                    }
                }
            }
            _ = maintenance.tick() => {
                let now = now_unix();
                state.orchestrator.poll_hit_counters().await;
                state.orchestrator.probe_paused_adapters(now).await;
                let _ = state.orchestrator.purge_terminal(now);
                let cutoff = now.saturating_sub(config.audit.retention_secs as i64);
                loop {
                    match state.audit.purge_older_than(cutoff, config.audit.purge_batch) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(error) => {
                            warn!(error = %error, "audit retention purge failed");
                            break;
                        }
                    }
                }
            }
        }
    }
    info!(
        audit_append_failures = state.audit_append_failures,
        alerts_dropped = state.alerts_dropped,
        "control task stopped"
    );
}

async fn handle_scored(state: &mut ControlState, scored: Scored) {
    let now_ms = now_unix_ms();
    let now = now_unix();
    let Scored { detection, decision } = scored;

    let outcome = state.orchestrator.handle_decision(&decision, now).await;

    let mut record = AuditRecord::new(detection, decision.clone(), now);
    let mut alerts: Vec<Alert> = Vec::new();

    match &outcome {
        DecisionOutcome::Applied { rule, report, displaced } => {
            record = record
                .with_rule(rule.clone(), now_ms)
                .with_adapter_attempts(report.attempts.clone(), report.lifecycle.as_str(), now_ms);
            let mut alert = Alert::for_decision(&decision, now);
            alert.rule_id = Some(rule.rule_id.clone());
            alerts.push(alert);
            if report.lifecycle == RuleLifecycle::Failed && !report.will_retry {
                alerts.push(Alert::for_rule_event(
                    &decision,
                    Some(&rule.rule_id),
                    "rule apply permanently failed",
                    now,
                ));
            }
            for loser in displaced {
                debug!(rule_id = %loser, "conflicting rule displaced");
            }
        }
        DecisionOutcome::Rejected { rule, reason, .. } => {
            record = record
                .with_rule(rule.clone(), now_ms)
                .with_validation_reject(reason);
            alerts.push(Alert::for_rule_event(
                &decision,
                Some(&rule.rule_id),
                "rule rejected by validation",
                now,
            ));
        }
        DecisionOutcome::NoRule { .. } => {
            alerts.push(Alert::for_decision(&decision, now));
        }
        DecisionOutcome::Deduped { existing_rule_id, .. } => {
            record.rule_id = Some(existing_rule_id.clone());
            debug!(rule_id = %existing_rule_id, "decision deduped onto standing rule");
        }
        DecisionOutcome::LostConflict { winner_rule_id, .. } => {
            debug!(rule_id = %winner_rule_id, "decision lost conflict to standing rule");
        }
        DecisionOutcome::DuplicateDecision { rule_id, .. } => {
            debug!(rule_id = %rule_id, "duplicate decision replay suppressed");
        }
    }

    if let Err(error) = state.audit.append(record) {
        state.audit_append_failures = state.audit_append_failures.saturating_add(1);
        warn!(error = %error, "audit append failed");
    }

    for alert in alerts {
        // Alerts must never stall enforcement: full queue drops, counted.
        if state.alert_tx.try_send(alert).is_err() {
            state.alerts_dropped = state.alerts_dropped.saturating_add(1);
        }
    }
}

async fn handle_command(state: &mut ControlState, command: ControlCommand) {
    match command {
        ControlCommand::Apply { detection, decision, resp } => {
            let now = now_unix();
            let outcome = state.orchestrator.handle_decision(&decision, now).await;
            if let Some(detection) = detection {
                let mut record = AuditRecord::new(detection, decision.clone(), now);
                if let DecisionOutcome::Applied { rule, report, .. } = &outcome {
                    record = record
                        .with_rule(rule.clone(), now_unix_ms())
                        .with_adapter_attempts(
                            report.attempts.clone(),
                            report.lifecycle.as_str(),
                            now_unix_ms(),
                        );
                }
                if let Err(error) = state.audit.append(record) {
                    state.audit_append_failures = state.audit_append_failures.saturating_add(1);
                    warn!(error = %error, "audit append failed");
                }
            }
            let _ = resp.send(outcome);
        }
        ControlCommand::ApplyRule { rule, resp } => {
            let outcome = state
                .orchestrator
                .apply_rule(rule, "operator".to_string(), now_unix())
                .await;
            let _ = resp.send(outcome);
        }
        ControlCommand::Rollback { rule_id, resp } => {
            let report = state.orchestrator.rollback(&rule_id, now_unix()).await;
            let _ = resp.send(report);
        }
        ControlCommand::RollbackByDecision { decision_id, resp } => {
            let report = state
                .orchestrator
                .rollback_by_decision(&decision_id, now_unix())
                .await;
            let _ = resp.send(report);
        }
        ControlCommand::ListRules { lifecycle, resp } => {
            let _ = resp.send(state.orchestrator.list_rules(lifecycle));
        }
        ControlCommand::AuditByDetection { detection_id, resp } => {
            let _ = resp.send(state.audit.by_detection(&detection_id).unwrap_or_default());
        }
        ControlCommand::AuditByRule { rule_id, resp } => {
            let _ = resp.send(state.audit.by_rule(&rule_id).unwrap_or_default());
        }
        ControlCommand::Counters { resp } => {
            let _ = resp.send(state.orchestrator.counters().clone());
        }
    }
}

async fn alert_task(
    mut engine: AlertEngine,
    mut alert_rx: mpsc::Receiver<Alert>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            alert = alert_rx.recv() => {
                let Some(alert) = alert else {
                    break;
                };
                let _ = engine.emit(alert).await;
            }
        }
    }
    debug!(
        delivered = engine.counters().delivered,
        deduplicated = engine.counters().deduplicated,
        sink_failures = engine.counters().sink_failures,
        "alert task stopped"
    );
}

pub(crate) fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub(crate) fn now_unix() -> i64 {
    now_unix_ms().div_euclid(1_000)
}

/// Shape of responses the service hands back for the synchronous apply
/// surface.
#[derive(Debug)]
pub struct AppliedRule {
    pub rule_id: String,
    pub adapter_outcomes: Vec<(String, &'static str)>,
}

impl AppliedRule {
    pub fn from_report(report: &ApplyReport) -> Self {
        Self {
            rule_id: report.rule_id.clone(),
            adapter_outcomes: report
                .attempts
                .iter()
                .map(|attempt| (attempt.adapter_id.clone(), attempt.outcome.wire_value()))
                .collect(),
        }
    }
}

