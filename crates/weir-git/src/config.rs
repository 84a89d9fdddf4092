//! Receive policy configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy applied to every receive-pack session.
///
/// Deserializes from a partial document; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Allow commands that create a ref.
    pub allow_creates: bool,
    /// Allow commands that delete a ref.
    pub allow_deletes: bool,
    /// Allow deleting refs under `refs/heads/`. Only consulted when
    /// `allow_deletes` is set.
    pub allow_branch_deletes: bool,
    /// Allow updates that are not fast-forwards.
    pub allow_non_fast_forwards: bool,
    /// Honour the client's `quiet` capability.
    pub allow_quiet: bool,
    /// Advertise and accept push options.
    pub allow_push_options: bool,
    /// Advertise and honour atomic pushes.
    pub allow_atomic: bool,
    /// Advertise `ofs-delta`.
    pub allow_ofs_delta: bool,

    /// Run the object checker on every received object and verify that the
    /// pushed graph is connected.
    pub check_received_objects: bool,
    /// Verify that everything reachable from the new tips is either part of
    /// the pack or reachable from what the server advertised.
    pub check_referenced_objects_are_reachable: bool,

    /// Maximum pack size in bytes, if any.
    pub max_pack_size: Option<u64>,
    /// Maximum inflated size of a single object in bytes, if any.
    pub max_object_size: Option<u64>,
    /// Upper bound on input skipped after a protocol error.
    pub max_discard_bytes: u64,

    /// Transport timeout in seconds; zero disables it.
    pub timeout_secs: u64,
    /// Multiplier applied to the timeout while the pack is received.
    pub pack_timeout_multiplier: u32,

    /// Seed for push certificate nonces. Push certificates are advertised
    /// only when set.
    pub certificate_nonce_seed: Option<String>,
    /// Accepted age in seconds of a nonce the server did not issue in this
    /// session.
    pub nonce_slop_secs: u64,

    /// Identity written to the reflog for pushed updates.
    pub ref_log_ident: String,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            allow_creates: true,
            allow_deletes: true,
            allow_branch_deletes: true,
            allow_non_fast_forwards: true,
            allow_quiet: true,
            allow_push_options: true,
            allow_atomic: true,
            allow_ofs_delta: true,
            check_received_objects: false,
            check_referenced_objects_are_reachable: false,
            max_pack_size: None,
            max_object_size: None,
            max_discard_bytes: 1024 * 1024,
            timeout_secs: 0,
            pack_timeout_multiplier: 10,
            certificate_nonce_seed: None,
            nonce_slop_secs: 300,
            ref_log_ident: "weir <weir@localhost>".to_string(),
        }
    }
}

impl ReceiveConfig {
    /// Transport timeout, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Timeout applied while the pack is streamed in.
    pub fn pack_timeout(&self) -> Option<Duration> {
        self.timeout()
            .map(|t| t.saturating_mul(self.pack_timeout_multiplier.max(1)))
    }

    /// Returns true if the connectivity checker has to run for a push with
    /// the given number of shallow lines.
    pub fn needs_connectivity_check(&self, shallow: usize) -> bool {
        self.check_received_objects || self.check_referenced_objects_are_reachable || shallow > 0
    }
}
