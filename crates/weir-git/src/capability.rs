//! Capability negotiation for receive-pack.
//!
//! The client appends its capabilities to the first request line after a NUL
//! byte. They are parsed exactly once into an immutable [`CapabilitySet`];
//! [`Negotiated`] then derives the effective session behaviour from that set
//! and the server policy.

use crate::config::ReceiveConfig;
use std::collections::BTreeSet;

/// Client asks for `ok`/`ng` status lines.
pub const REPORT_STATUS: &str = "report-status";
/// Client may send delete commands.
pub const DELETE_REFS: &str = "delete-refs";
/// Side-band with 65520-byte frames.
pub const SIDE_BAND_64K: &str = "side-band-64k";
/// Side-band with 1000-byte frames.
pub const SIDE_BAND: &str = "side-band";
/// Suppress progress output.
pub const QUIET: &str = "quiet";
/// All-or-nothing ref updates.
pub const ATOMIC: &str = "atomic";
/// Pack may contain offset deltas.
pub const OFS_DELTA: &str = "ofs-delta";
/// Push options follow the command list.
pub const PUSH_OPTIONS: &str = "push-options";
/// Signed push certificate support; advertised with `=<nonce>`.
pub const PUSH_CERT: &str = "push-cert";
/// Agent identification; advertised with `=<agent>`.
pub const AGENT: &str = "agent";

/// Agent string this server advertises.
pub fn server_agent() -> String {
    format!("weir/{}", env!("CARGO_PKG_VERSION"))
}

/// Immutable set of capability tokens sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    tokens: BTreeSet<String>,
}

impl CapabilitySet {
    /// Parses whitespace-separated tokens.
    pub fn parse(s: &str) -> Self {
        Self {
            tokens: s.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Returns true if the bare token is present.
    pub fn contains(&self, name: &str) -> bool {
        self.tokens.contains(name)
    }

    /// Returns the value of a `name=value` token.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.tokens.iter().find_map(|token| {
            token
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    /// Returns the client's agent string, if it sent one.
    pub fn agent(&self) -> Option<&str> {
        self.value(AGENT)
    }

    /// Iterates the tokens in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    /// Returns true if the client sent no capabilities.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// The first request line split into its command part and capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstLine {
    /// The line without its capability suffix.
    pub line: String,
    /// Capabilities that followed the NUL byte.
    pub capabilities: CapabilitySet,
}

impl FirstLine {
    /// Splits a line on its first NUL byte.
    pub fn parse(line: &str) -> Self {
        match line.split_once('\0') {
            Some((line, caps)) => Self {
                line: line.to_string(),
                capabilities: CapabilitySet::parse(caps),
            },
            None => Self {
                line: line.to_string(),
                capabilities: CapabilitySet::default(),
            },
        }
    }
}

/// Effective session behaviour, derived once from the client's capabilities
/// and the server policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    capabilities: CapabilitySet,
    side_band: Option<usize>,
    quiet: bool,
    push_options: bool,
    report_status: bool,
    atomic: bool,
}

impl Negotiated {
    /// Derives session behaviour.
    pub fn new(capabilities: CapabilitySet, config: &ReceiveConfig) -> Self {
        let side_band = if capabilities.contains(SIDE_BAND_64K) {
            Some(crate::pktline::MAX_PKT_LEN)
        } else if capabilities.contains(SIDE_BAND) {
            Some(crate::sideband::SMALL_FRAME_LEN)
        } else {
            None
        };
        Self {
            side_band,
            quiet: config.allow_quiet && capabilities.contains(QUIET),
            push_options: config.allow_push_options && capabilities.contains(PUSH_OPTIONS),
            report_status: capabilities.contains(REPORT_STATUS),
            atomic: config.allow_atomic && capabilities.contains(ATOMIC),
            capabilities,
        }
    }

    /// Negotiation result for a session that sent no capability line.
    pub fn none() -> Self {
        Self::new(CapabilitySet::default(), &ReceiveConfig::default())
    }

    /// The raw client capability set.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Side-band frame size, if side-band was negotiated.
    pub fn side_band(&self) -> Option<usize> {
        self.side_band
    }

    /// Progress output is suppressed.
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Push options follow the command list.
    pub fn push_options(&self) -> bool {
        self.push_options
    }

    /// Client wants machine-readable status lines.
    pub fn report_status(&self) -> bool {
        self.report_status
    }

    /// Client requested all-or-nothing updates and the server allows it.
    pub fn atomic(&self) -> bool {
        self.atomic
    }

    /// Client may send offset deltas.
    pub fn ofs_delta(&self) -> bool {
        self.capabilities.contains(OFS_DELTA)
    }

    /// Client agent string.
    pub fn agent(&self) -> Option<&str> {
        self.capabilities.agent()
    }
}

/// Builds the capability list the server advertises.
pub fn advertised(config: &ReceiveConfig, supports_atomic: bool, nonce: Option<&str>) -> Vec<String> {
    let mut caps = vec![
        REPORT_STATUS.to_string(),
        DELETE_REFS.to_string(),
        SIDE_BAND_64K.to_string(),
    ];
    if config.allow_quiet {
        caps.push(QUIET.to_string());
    }
    if config.allow_atomic && supports_atomic {
        caps.push(ATOMIC.to_string());
    }
    if config.allow_ofs_delta {
        caps.push(OFS_DELTA.to_string());
    }
    if config.allow_push_options {
        caps.push(PUSH_OPTIONS.to_string());
    }
    if let Some(nonce) = nonce {
        caps.push(format!("{}={}", PUSH_CERT, nonce));
    }
    caps.push(format!("{}={}", AGENT, server_agent()));
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line_split() {
        let first = FirstLine::parse("old new refs/heads/main\0report-status side-band-64k agent=git/2.40");
        assert_eq!(first.line, "old new refs/heads/main");
        assert!(first.capabilities.contains(REPORT_STATUS));
        assert!(first.capabilities.contains(SIDE_BAND_64K));
        assert_eq!(first.capabilities.agent(), Some("git/2.40"));
    }

    #[test]
    fn test_first_line_without_caps() {
        let first = FirstLine::parse("old new refs/heads/main");
        assert_eq!(first.line, "old new refs/heads/main");
        assert!(first.capabilities.is_empty());
    }

    #[test]
    fn test_split_on_first_nul_only() {
        let first = FirstLine::parse("line\0a\0b");
        assert_eq!(first.line, "line");
        assert!(first.capabilities.contains("a\0b"));
    }

    #[test]
    fn test_unknown_tokens_ignored() {
        let caps = CapabilitySet::parse("frobnicate report-status");
        let negotiated = Negotiated::new(caps, &ReceiveConfig::default());
        assert!(negotiated.report_status());
        assert!(negotiated.side_band().is_none());
    }

    #[test]
    fn test_value_requires_equals() {
        let caps = CapabilitySet::parse("agentx agent=weir/1");
        assert_eq!(caps.value(AGENT), Some("weir/1"));
        assert!(caps.value("agentx").is_none());
    }

    #[test]
    fn test_side_band_sizes() {
        let config = ReceiveConfig::default();
        let large = Negotiated::new(CapabilitySet::parse("side-band-64k side-band"), &config);
        assert_eq!(large.side_band(), Some(65520));

        let small = Negotiated::new(CapabilitySet::parse("side-band"), &config);
        assert_eq!(small.side_band(), Some(1000));
    }

    #[test]
    fn test_quiet_requires_server_permission() {
        let caps = CapabilitySet::parse("quiet push-options atomic");
        let allowed = Negotiated::new(caps.clone(), &ReceiveConfig::default());
        assert!(allowed.is_quiet());
        assert!(allowed.push_options());
        assert!(allowed.atomic());

        let config = ReceiveConfig {
            allow_quiet: false,
            allow_push_options: false,
            allow_atomic: false,
            ..ReceiveConfig::default()
        };
        let denied = Negotiated::new(caps, &config);
        assert!(!denied.is_quiet());
        assert!(!denied.push_options());
        assert!(!denied.atomic());
    }

    #[test]
    fn test_advertised_capabilities() {
        let config = ReceiveConfig::default();
        let caps = advertised(&config, true, Some("1700000000-abcd"));
        assert!(caps.contains(&"report-status".to_string()));
        assert!(caps.contains(&"delete-refs".to_string()));
        assert!(caps.contains(&"side-band-64k".to_string()));
        assert!(caps.contains(&"atomic".to_string()));
        assert!(caps.contains(&"push-cert=1700000000-abcd".to_string()));
        assert!(caps.last().unwrap().starts_with("agent=weir/"));

        let no_atomic = advertised(&config, false, None);
        assert!(!no_atomic.contains(&"atomic".to_string()));
        assert!(!no_atomic.iter().any(|c| c.starts_with("push-cert")));
    }
}
