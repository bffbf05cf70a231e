//! End-to-end test harness: an in-process pipeline wired to memory
//! adapters, plus builders for collector frames.

use std::sync::Arc;
use std::time::Duration;

use adapters::{FirewallAdapter, MemoryAdapter};
use features::WindowSpec;
use flowguard_core::config::PipelineConfig;
use flowguard_core::pipeline::{CollectorHandle, Pipeline};
use flowguard_core::service::PipelineService;
use ingest::Framing;
use tokio::time::sleep;

pub struct Harness {
    pub pipeline: Pipeline,
    pub service: PipelineService,
    pub collector: CollectorHandle,
    pub adapters: Vec<Arc<MemoryAdapter>>,
}

/// Pipeline tuned for tests: tumbling 30 s windows with no lateness
/// allowance, memory audit, log-only alerts, and the given number of
/// memory adapters standing in for enforcement backends.
pub async fn start_harness(adapter_count: usize) -> Harness {
    let mut config = PipelineConfig::default();
    config.sensor_id = "acceptance".to_string();
    config.windows = vec![WindowSpec::tumbling(30_000)];
    config.allowed_lateness_ms = 0;
    config.bus.partitions = 2;
    config.bus.publish_timeout_ms = 1_000;
    config.detection_workers = 2;
    config.stage_deadline_ms = 2_000;
    config.expiry_scan_interval_ms = 100;
    config.retry_scan_interval_ms = 100;
    config.session_sweep_interval_ms = 100;
    config.hit_poll_interval_ms = 500;
    config.audit.backend = "memory".to_string();
    config.adapters.packet_filter_enabled = false;
    config.adapters.cloud_group_enabled = false;
    config.adapters.memory_enabled = false;
    // Retries back off in whole seconds; keep tests fast.
    config.orchestrator.retry.base_ms = 1_000;
    config.orchestrator.retry.max_ms = 1_000;

    let adapters: Vec<Arc<MemoryAdapter>> = (0..adapter_count.max(1))
        .map(|index| Arc::new(MemoryAdapter::new(&format!("mem-{}", index))))
        .collect();
    let as_dyn: Vec<Arc<dyn FirewallAdapter>> = adapters
        .iter()
        .map(|adapter| Arc::clone(adapter) as Arc<dyn FirewallAdapter>)
        .collect();

    let pipeline = Pipeline::start(config, as_dyn).await.expect("pipeline start");
    let service = pipeline.service();
    let collector = pipeline.collector();

    Harness {
        pipeline,
        service,
        collector,
        adapters,
    }
}

/// One flow in the JSON export framing.
#[allow(clippy::too_many_arguments)]
pub fn flow_json_line(
    src: &str,
    src_port: u16,
    dst: &str,
    dst_port: u16,
    start_ms: i64,
    end_ms: i64,
    bytes: u64,
    packets: u64,
    control_bits: u8,
    flow_id: u64,
) -> String {
    format!(
        concat!(
            r#"{{"sourceIPv4Address":"{}","destinationIPv4Address":"{}","#,
            r#""sourceTransportPort":{},"destinationTransportPort":{},"protocolIdentifier":6,"#,
            r#""flowStartMilliseconds":{},"flowEndMilliseconds":{},"#,
            r#""octetDeltaCount":{},"packetDeltaCount":{},"tcpControlBits":{},"flowId":{}}}"#
        ),
        src, dst, src_port, dst_port, start_ms, end_ms, bytes, packets, control_bits, flow_id
    )
}

/// Feed flow lines through the collector surface in frames of 100.
pub async fn feed_flows(collector: &CollectorHandle, lines: &[String]) -> usize {
    let mut published = 0;
    for chunk in lines.chunks(100) {
        let frame = chunk.join("\n");
        published += collector.ingest_frame(Framing::FlowJson, frame.as_bytes()).await;
    }
    published
}

/// Poll until the predicate holds or the timeout elapses. The predicate
/// should capture clones, not references, so each poll owns its future.
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Window-aligned base timestamp used across scenarios: a multiple of the
/// 30 s tumbling span.
pub const T0: i64 = 1_700_000_010_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t0_is_window_aligned() {
        assert_eq!(T0 % 30_000, 0);
    }

    #[test]
    fn flow_line_is_valid_json() {
        let line = flow_json_line("203.0.113.7", 50_000, "10.0.0.5", 80, T0, T0 + 100, 60, 1, 2, 1);
        let value: serde_json::Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(value["destinationTransportPort"], 80);
    }
}
