use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ingest::Protocol;
use serde::{Deserialize, Serialize};

/// CIDR block over v4 or v6. Host bits are zeroed on construction so two
/// spellings of the same block compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, BadCidr> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(BadCidr(format!("prefix /{} too long for {}", prefix_len, addr)));
        }
        Ok(Self {
            addr: mask_addr(addr, prefix_len),
            prefix_len,
        })
    }

    /// The /32 (or /128) block holding exactly this address.
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { addr, prefix_len }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(other)) => {
                let mask = v4_mask(self.prefix_len);
                u32::from(net) & mask == u32::from(*other) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(other)) => {
                let mask = v6_mask(self.prefix_len);
                u128::from(net) & mask == u128::from(*other) & mask
            }
            _ => false,
        }
    }

    pub fn contains_cidr(&self, other: &Cidr) -> bool {
        self.prefix_len <= other.prefix_len && self.contains(&other.addr)
    }

    /// Two blocks intersect exactly when one contains the other.
    pub fn intersects(&self, other: &Cidr) -> bool {
        self.contains_cidr(other) || other.contains_cidr(self)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

#[derive(Debug)]
pub struct BadCidr(pub String);

impl fmt::Display for BadCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad cidr: {}", self.0)
    }
}

impl std::error::Error for BadCidr {}

impl FromStr for Cidr {
    type Err = BadCidr;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().map_err(|_| BadCidr(raw.to_string()))?;
                let prefix_len: u8 = len.parse().map_err(|_| BadCidr(raw.to_string()))?;
                Self::new(addr, prefix_len)
            }
            None => {
                let addr: IpAddr = raw.parse().map_err(|_| BadCidr(raw.to_string()))?;
                Ok(Self::host(addr))
            }
        }
    }
}

fn mask_addr(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4((u32::from(v4) & v4_mask(prefix_len)).into()),
        IpAddr::V6(v6) => IpAddr::V6((u128::from(v6) & v6_mask(prefix_len)).into()),
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len.min(32))
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len.min(128))
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    pub fn new(start: u16, end: u16) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// Number of ports covered; never zero.
    pub fn count(&self) -> u32 {
        (self.end - self.start) as u32 + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn intersects(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// The vendor-neutral match. `None` in any dimension is a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleMatch {
    pub src_cidr: Option<Cidr>,
    pub dst_cidr: Option<Cidr>,
    pub protocol: Option<Protocol>,
    pub dst_ports: Option<PortRange>,
    pub src_ports: Option<PortRange>,
}

impl RuleMatch {
    pub fn any() -> Self {
        Self {
            src_cidr: None,
            dst_cidr: None,
            protocol: None,
            dst_ports: None,
            src_ports: None,
        }
    }

    pub fn from_src(cidr: Cidr) -> Self {
        Self {
            src_cidr: Some(cidr),
            ..Self::any()
        }
    }

    /// Whether the match sets overlap: every dimension must intersect, with
    /// wildcards intersecting everything.
    pub fn intersects(&self, other: &RuleMatch) -> bool {
        let cidr_overlap = |a: &Option<Cidr>, b: &Option<Cidr>| match (a, b) {
            (Some(x), Some(y)) => x.intersects(y),
            _ => true,
        };
        let port_overlap = |a: &Option<PortRange>, b: &Option<PortRange>| match (a, b) {
            (Some(x), Some(y)) => x.intersects(y),
            _ => true,
        };
        let proto_overlap = match (&self.protocol, &other.protocol) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        };

        cidr_overlap(&self.src_cidr, &other.src_cidr)
            && cidr_overlap(&self.dst_cidr, &other.dst_cidr)
            && proto_overlap
            && port_overlap(&self.dst_ports, &other.dst_ports)
            && port_overlap(&self.src_ports, &other.src_ports)
    }
}

/// What the rule does when the match fires.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RuleAction {
    Allow,
    Deny,
    RateLimit { pps: u32, burst: u32 },
    Quarantine { duration_secs: u64 },
    Monitor,
}

impl RuleAction {
    pub fn kind(&self) -> RuleActionKind {
        match self {
            Self::Allow => RuleActionKind::Allow,
            Self::Deny => RuleActionKind::Deny,
            Self::RateLimit { .. } => RuleActionKind::RateLimit,
            Self::Quarantine { .. } => RuleActionKind::Quarantine,
            Self::Monitor => RuleActionKind::Monitor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleActionKind {
    Allow,
    Deny,
    RateLimit,
    Quarantine,
    Monitor,
}

impl RuleActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RateLimit => "rate_limit",
            Self::Quarantine => "quarantine",
            Self::Monitor => "monitor",
        }
    }
}

/// Vendor-neutral enforcement record. Immutable once accepted by the
/// orchestrator; lifecycle state is tracked separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniversalRule {
    pub rule_id: String,
    pub matcher: RuleMatch,
    pub action: RuleAction,
    /// Total order; lower numbers win on overlap.
    pub priority: u16,
    pub ttl_secs: Option<u64>,
    pub origin_decision_id: Option<String>,
    pub created_at_unix: i64,
}

/// Stable wire values reported per adapter attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterOutcome {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "TRANSIENT")]
    Transient,
    #[serde(rename = "PERMANENT")]
    Permanent,
    #[serde(rename = "UNREACHABLE")]
    Unreachable,
}

impl AdapterOutcome {
    pub fn wire_value(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Transient => "TRANSIENT",
            Self::Permanent => "PERMANENT",
            Self::Unreachable => "UNREACHABLE",
        }
    }
}

/// What an adapter hands back for one applied universal rule. `native_ids`
/// has more than one entry when backend restrictions forced a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHandle {
    pub adapter_id: String,
    pub rule_id: String,
    pub native_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdapterRuleState {
    pub present: bool,
    pub hit_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(raw: &str) -> Cidr {
        raw.parse().expect("cidr")
    }

    #[test]
    fn cidr_normalizes_host_bits() {
        let a = cidr("10.1.2.3/8");
        let b = cidr("10.9.9.9/8");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn cidr_containment() {
        assert!(cidr("10.0.0.0/8").contains_cidr(&cidr("10.1.0.0/16")));
        assert!(!cidr("10.1.0.0/16").contains_cidr(&cidr("10.0.0.0/8")));
        assert!(cidr("203.0.113.7/32").contains(&"203.0.113.7".parse().expect("addr")));
        assert!(!cidr("203.0.113.7/32").contains(&"203.0.113.8".parse().expect("addr")));
    }

    #[test]
    fn cidr_intersection_is_containment_either_way() {
        assert!(cidr("10.0.0.0/8").intersects(&cidr("10.1.0.0/16")));
        assert!(cidr("10.1.0.0/16").intersects(&cidr("10.0.0.0/8")));
        assert!(!cidr("10.0.0.0/8").intersects(&cidr("192.168.0.0/16")));
    }

    #[test]
    fn zero_prefix_contains_everything() {
        assert!(cidr("0.0.0.0/0").contains(&"203.0.113.7".parse().expect("addr")));
    }

    #[test]
    fn v4_and_v6_never_intersect() {
        assert!(!cidr("10.0.0.0/8").intersects(&cidr("fd00::/8")));
    }

    #[test]
    fn rejects_overlong_prefix() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
    }

    #[test]
    fn port_ranges_intersect_inclusively() {
        assert!(PortRange::new(80, 443).intersects(&PortRange::single(443)));
        assert!(!PortRange::new(80, 443).intersects(&PortRange::single(444)));
    }

    #[test]
    fn wildcard_match_dimensions_always_overlap() {
        let narrow = RuleMatch {
            src_cidr: Some(cidr("203.0.113.7/32")),
            dst_cidr: Some(cidr("10.0.0.5/32")),
            protocol: Some(Protocol::Tcp),
            dst_ports: Some(PortRange::single(443)),
            src_ports: None,
        };
        assert!(RuleMatch::any().intersects(&narrow));
        assert!(narrow.intersects(&RuleMatch::any()));
    }

    #[test]
    fn disjoint_dimension_breaks_overlap() {
        let a = RuleMatch {
            dst_ports: Some(PortRange::single(443)),
            ..RuleMatch::from_src(cidr("203.0.113.7/32"))
        };
        let b = RuleMatch {
            dst_ports: Some(PortRange::single(80)),
            ..RuleMatch::from_src(cidr("203.0.113.7/32"))
        };
        assert!(!a.intersects(&b));

        let c = RuleMatch {
            dst_ports: Some(PortRange::single(443)),
            ..RuleMatch::from_src(cidr("198.51.100.0/24"))
        };
        assert!(!a.intersects(&c));
    }

    #[test]
    fn outcome_wire_values_are_stable() {
        assert_eq!(AdapterOutcome::Ok.wire_value(), "OK");
        assert_eq!(AdapterOutcome::Transient.wire_value(), "TRANSIENT");
        assert_eq!(AdapterOutcome::Permanent.wire_value(), "PERMANENT");
        assert_eq!(AdapterOutcome::Unreachable.wire_value(), "UNREACHABLE");
        let json = serde_json::to_string(&AdapterOutcome::Unreachable).expect("serialize");
        assert_eq!(json, "\"UNREACHABLE\"");
    }
}
