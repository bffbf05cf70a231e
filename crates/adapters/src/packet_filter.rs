use std::io;
use std::process::Command;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::AdapterError;
use crate::rule::{AdapterHandle, AdapterRuleState, RuleAction, RuleMatch, UniversalRule};
use crate::FirewallAdapter;

/// Seam between rule rendering and the host packet filter. Production runs
/// the real `nft` binary; tests record the rendered commands.
pub trait CommandRunner: Send + Sync {
    fn run(&self, args: &[String]) -> io::Result<String>;
}

pub struct ProcessRunner {
    binary: String,
}

impl ProcessRunner {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new("nft")
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, args: &[String]) -> io::Result<String> {
        let output = Command::new(&self.binary).args(args).output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Test runner: records every command and replays scripted responses.
#[derive(Default)]
pub struct RecordingRunner {
    pub commands: Mutex<Vec<Vec<String>>>,
    pub responses: Mutex<Vec<io::Result<String>>>,
}

impl RecordingRunner {
    pub fn recorded(&self) -> Vec<Vec<String>> {
        self.commands.lock().expect("recording lock").clone()
    }

    pub fn push_response(&self, response: io::Result<String>) {
        self.responses.lock().expect("recording lock").push(response);
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, args: &[String]) -> io::Result<String> {
        self.commands
            .lock()
            .expect("recording lock")
            .push(args.to_vec());
        let mut responses = self.responses.lock().expect("recording lock");
        if responses.is_empty() {
            Ok(String::new())
        } else {
            responses.remove(0)
        }
    }
}

/// Local packet-filter chain adapter. Rules land in one managed chain,
/// tagged by comment with a deterministic native id derived from the
/// universal `rule_id`, which is what makes retries idempotent.
pub struct PacketFilterAdapter {
    adapter_id: String,
    table: String,
    chain: String,
    runner: Box<dyn CommandRunner>,
}

const NATIVE_PREFIX: &str = "fg-";

impl PacketFilterAdapter {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            adapter_id: "packet_filter".to_string(),
            table: "flowguard".to_string(),
            chain: "input".to_string(),
            runner,
        }
    }

    pub fn with_chain(runner: Box<dyn CommandRunner>, table: &str, chain: &str) -> Self {
        Self {
            adapter_id: "packet_filter".to_string(),
            table: table.to_string(),
            chain: chain.to_string(),
            runner,
        }
    }

    fn native_ids_for(&self, rule: &UniversalRule) -> Vec<String> {
        match rule.action {
            // Quarantine isolates the host in both directions: one native
            // rule per direction under a compound handle.
            RuleAction::Quarantine { .. } => vec![
                format!("{}{}-in", NATIVE_PREFIX, rule.rule_id),
                format!("{}{}-out", NATIVE_PREFIX, rule.rule_id),
            ],
            _ => vec![format!("{}{}", NATIVE_PREFIX, rule.rule_id)],
        }
    }

    fn render_match(matcher: &RuleMatch, reverse: bool) -> Vec<String> {
        let mut parts = Vec::new();
        let (src_key, dst_key) = if reverse {
            ("daddr", "saddr")
        } else {
            ("saddr", "daddr")
        };
        if let Some(cidr) = &matcher.src_cidr {
            parts.extend(["ip".to_string(), src_key.to_string(), cidr.to_string()]);
        }
        if let Some(cidr) = &matcher.dst_cidr {
            parts.extend(["ip".to_string(), dst_key.to_string(), cidr.to_string()]);
        }
        if let (Some(protocol), Some(ports)) = (&matcher.protocol, &matcher.dst_ports) {
            parts.extend([
                protocol.as_str().to_string(),
                "dport".to_string(),
                ports.to_string(),
            ]);
        }
        if let (Some(protocol), Some(ports)) = (&matcher.protocol, &matcher.src_ports) {
            parts.extend([
                protocol.as_str().to_string(),
                "sport".to_string(),
                ports.to_string(),
            ]);
        }
        parts
    }

    fn render_verdict(action: &RuleAction) -> Vec<String> {
        match action {
            RuleAction::Allow => vec!["counter".into(), "accept".into()],
            RuleAction::Deny | RuleAction::Quarantine { .. } => {
                vec!["counter".into(), "drop".into()]
            }
            RuleAction::RateLimit { pps, burst } => vec![
                "limit".into(),
                "rate".into(),
                "over".into(),
                format!("{}/second", pps),
                "burst".into(),
                format!("{} packets", burst),
                "counter".into(),
                "drop".into(),
            ],
            RuleAction::Monitor => vec!["counter".into(), "log".into()],
        }
    }

    fn add_command(&self, rule: &UniversalRule, native_id: &str, reverse: bool) -> Vec<String> {
        let mut args = vec![
            "add".to_string(),
            "rule".to_string(),
            "inet".to_string(),
            self.table.clone(),
            self.chain.clone(),
        ];
        args.extend(Self::render_match(&rule.matcher, reverse));
        args.extend(Self::render_verdict(&rule.action));
        args.extend(["comment".to_string(), format!("\"{}\"", native_id)]);
        args
    }

    fn list_chain(&self) -> Result<String, AdapterError> {
        let args = vec![
            "list".to_string(),
            "chain".to_string(),
            "inet".to_string(),
            self.table.clone(),
            self.chain.clone(),
        ];
        self.runner.run(&args).map_err(map_io_error)
    }
}

#[async_trait]
impl FirewallAdapter for PacketFilterAdapter {
    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    async fn apply(&self, rule: &UniversalRule) -> Result<AdapterHandle, AdapterError> {
        let native_ids = self.native_ids_for(rule);

        // Idempotency: the chain is the source of truth. Skip natives the
        // chain already carries from an earlier attempt of the same rule.
        let listing = self.list_chain()?;
        for (index, native_id) in native_ids.iter().enumerate() {
            if listing.contains(native_id.as_str()) {
                debug!(native_id = %native_id, "native rule already present; skipping add");
                continue;
            }
            let reverse = index == 1;
            let args = self.add_command(rule, native_id, reverse);
            self.runner.run(&args).map_err(map_io_error)?;
        }

        Ok(AdapterHandle {
            adapter_id: self.adapter_id.clone(),
            rule_id: rule.rule_id.clone(),
            native_ids,
        })
    }

    async fn remove(&self, handle: &AdapterHandle) -> Result<(), AdapterError> {
        let listing = self.list_chain()?;
        for native_id in &handle.native_ids {
            if !listing.contains(native_id.as_str()) {
                continue;
            }
            let args = vec![
                "delete".to_string(),
                "rule".to_string(),
                "inet".to_string(),
                self.table.clone(),
                self.chain.clone(),
                "comment".to_string(),
                format!("\"{}\"", native_id),
            ];
            self.runner.run(&args).map_err(map_io_error)?;
        }
        Ok(())
    }

    async fn query(&self, handle: &AdapterHandle) -> Result<AdapterRuleState, AdapterError> {
        let listing = self.list_chain()?;
        let mut present = false;
        let mut hit_count = 0u64;
        for line in listing.lines() {
            if handle
                .native_ids
                .iter()
                .any(|native| line.contains(native.as_str()))
            {
                present = true;
                hit_count = hit_count.saturating_add(parse_counter_packets(line));
            }
        }
        Ok(AdapterRuleState { present, hit_count })
    }

    async fn list(&self) -> Result<Vec<AdapterHandle>, AdapterError> {
        let listing = self.list_chain()?;
        let mut handles = Vec::new();
        for line in listing.lines() {
            if let Some(native_id) = extract_comment(line) {
                if let Some(rule_id) = native_id
                    .strip_prefix(NATIVE_PREFIX)
                    .map(|id| id.trim_end_matches("-in").trim_end_matches("-out"))
                {
                    handles.push(AdapterHandle {
                        adapter_id: self.adapter_id.clone(),
                        rule_id: rule_id.to_string(),
                        native_ids: vec![native_id.to_string()],
                    });
                }
            }
        }
        Ok(handles)
    }
}

fn map_io_error(err: io::Error) -> AdapterError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            AdapterError::Unreachable(err.to_string())
        }
        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
            AdapterError::Transient(err.to_string())
        }
        _ => AdapterError::Permanent(err.to_string()),
    }
}

/// Pull `counter packets N` out of a chain listing line.
fn parse_counter_packets(line: &str) -> u64 {
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "packets" {
            return words
                .next()
                .and_then(|count| count.parse().ok())
                .unwrap_or(0);
        }
    }
    0
}

fn extract_comment(line: &str) -> Option<&str> {
    let index = line.find("comment")?;
    let rest = line[index + "comment".len()..].trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}
