use std::net::IpAddr;

use detection::Detection;
use features::layout::slot;
use serde::{Deserialize, Serialize};

pub const STATE_SLOT_COUNT: usize = 12;

/// `(name, meaning)` per state slot; every slot is normalized to [0, 1].
pub const STATE_SLOT_DOCS: [(&str, &str); STATE_SLOT_COUNT] = [
    ("threat_score", "ensemble aggregate score"),
    ("src_reputation", "source address reputation"),
    ("asset_criticality", "target asset criticality, 1-5 scaled"),
    ("traffic_volume", "window byte volume"),
    ("protocol_risk", "transport protocol risk"),
    ("time_risk", "time-of-day risk factor"),
    ("historical_alerts", "prior alert count for the source"),
    ("is_internal", "source is in private address space"),
    ("port_sensitivity", "target port sensitivity"),
    ("connection_freq", "window record count"),
    ("payload_anomaly", "payload anomaly score from sensors"),
    ("geo_risk", "geographic risk score"),
];

/// Bounded state vector fed to the policy head. Fixed slot order; a change
/// here invalidates trained policy artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub slots: [f64; STATE_SLOT_COUNT],
}

impl StateVector {
    pub fn threat_score(&self) -> f64 {
        self.slots[0]
    }

    pub fn is_internal(&self) -> bool {
        self.slots[7] >= 0.5
    }

    pub fn is_well_formed(&self) -> bool {
        self.slots
            .iter()
            .all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }
}

/// Enrichment context from outside the detection path: reputation feeds,
/// asset inventory, alert history. Everything optional with neutral
/// defaults so the agent still decides with no enrichment wired up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub src_reputation: f64,
    /// 1 (throwaway) to 5 (crown jewels).
    pub asset_criticality: u8,
    pub historical_alert_count: u32,
    pub payload_anomaly: f64,
    pub geo_risk: f64,
}

impl Default for DecisionContext {
    fn default() -> Self {
        Self {
            src_reputation: 0.5,
            asset_criticality: 3,
            historical_alert_count: 0,
            payload_anomaly: 0.0,
            geo_risk: 0.2,
        }
    }
}

/// Build the bounded state vector from a detection plus context.
pub fn build_state(detection: &Detection, context: &DecisionContext) -> StateVector {
    let mut slots = [0.0f64; STATE_SLOT_COUNT];

    // Unknown detections carry NaN; the agent treats them as maximally
    // uncertain rather than maximally dangerous.
    let threat = detection.aggregate_score;
    slots[0] = if threat.is_finite() {
        threat.clamp(0.0, 1.0)
    } else {
        0.5
    };
    slots[1] = context.src_reputation.clamp(0.0, 1.0);
    slots[2] = (context.asset_criticality.clamp(1, 5) as f64 - 1.0) / 4.0;
    slots[3] = detection.features.get(slot::BYTE_TOTAL);
    slots[4] = protocol_risk(&detection.context.protocol);
    slots[5] = time_risk(detection.decided_at_unix_ms);
    slots[6] = (context.historical_alert_count as f64 / 100.0).clamp(0.0, 1.0);
    slots[7] = if is_internal(&detection.context.key_addr) {
        1.0
    } else {
        0.0
    };
    slots[8] = port_sensitivity(detection.context.top_dst_port);
    slots[9] = detection.features.get(slot::RECORD_COUNT);
    slots[10] = context.payload_anomaly.clamp(0.0, 1.0);
    slots[11] = context.geo_risk.clamp(0.0, 1.0);

    StateVector { slots }
}

fn protocol_risk(protocol: &ingest::Protocol) -> f64 {
    match protocol {
        ingest::Protocol::Tcp => 0.3,
        ingest::Protocol::Udp => 0.4,
        ingest::Protocol::Icmp => 0.5,
        ingest::Protocol::Other(_) => 0.6,
    }
}

fn port_sensitivity(port: u16) -> f64 {
    match port {
        23 => 1.0,
        22 | 3389 | 445 => 0.9,
        3306 | 5432 | 27017 => 0.8,
        6379 => 0.7,
        _ => 0.2,
    }
}

pub fn is_internal(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
        }
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Off-hours traffic is riskier than business-hours traffic. Derived from
/// the decision timestamp in UTC.
fn time_risk(unix_ms: i64) -> f64 {
    let secs = unix_ms.div_euclid(1_000);
    let hour = secs.div_euclid(3_600).rem_euclid(24);
    // Unix epoch day 0 was a Thursday; 0 = Sunday after the shift.
    let weekday = (secs.div_euclid(86_400) + 4).rem_euclid(7);
    let weekend = weekday == 0 || weekday == 6;

    if weekend {
        0.6
    } else if (9..=18).contains(&hour) {
        0.2
    } else if hour < 6 {
        0.8
    } else {
        0.4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use detection::{Ensemble, EnsembleCounters};
    use features::{FeatureContext, FeatureFrame, FeatureVector, WindowKind};
    use ingest::Protocol;

    pub(crate) fn detection_with(score_vector: FeatureVector, src: &str, port: u16) -> Detection {
        let frame = FeatureFrame {
            vector: score_vector,
            context: FeatureContext {
                vector_id: "fv_t".to_string(),
                window_key: src.to_string(),
                window_kind: WindowKind::Tumbling,
                window_start_unix_ms: 0,
                window_end_unix_ms: 30_000,
                record_count: 10,
                key_addr: src.parse().expect("addr"),
                key_dst_port: None,
                top_dst_port: port,
                protocol: Protocol::Tcp,
            },
        };
        let ensemble = Ensemble::with_default_artifact();
        ensemble.score(&frame, 1_700_000_000_000, &mut EnsembleCounters::default())
    }

    #[test]
    fn state_vector_is_bounded() {
        let detection = detection_with(FeatureVector::zeroed(), "203.0.113.7", 22);
        let state = build_state(&detection, &DecisionContext::default());
        assert!(state.is_well_formed());
        assert_eq!(state.slots[8], 0.9);
        assert_eq!(state.slots[7], 0.0);
    }

    #[test]
    fn internal_addresses_are_flagged() {
        assert!(is_internal(&"10.1.2.3".parse().expect("addr")));
        assert!(is_internal(&"172.20.0.1".parse().expect("addr")));
        assert!(is_internal(&"192.168.9.9".parse().expect("addr")));
        assert!(!is_internal(&"8.8.8.8".parse().expect("addr")));
        assert!(!is_internal(&"172.32.0.1".parse().expect("addr")));
    }

    #[test]
    fn unknown_score_maps_to_neutral_threat() {
        let mut detection = detection_with(FeatureVector::zeroed(), "10.0.0.9", 80);
        detection.aggregate_score = f64::NAN;
        let state = build_state(&detection, &DecisionContext::default());
        assert_eq!(state.threat_score(), 0.5);
    }

    #[test]
    fn time_risk_tracks_hours() {
        // 2023-11-15 is a Wednesday; 12:00 UTC.
        let wednesday_noon = 1_700_049_600_000;
        assert_eq!(time_risk(wednesday_noon), 0.2);
        // Same day 03:00 UTC.
        let wednesday_night = 1_700_017_200_000;
        assert_eq!(time_risk(wednesday_night), 0.8);
        // 2023-11-18 is a Saturday.
        let saturday = 1_700_308_800_000;
        assert_eq!(time_risk(saturday), 0.6);
    }
}
