//! Per-command policy and consistency checks.
//!
//! Validation never aborts the session: every verdict is recorded on the
//! command itself, and commands that already carry one are left alone.

use crate::advertise::AdvertisedRefs;
use crate::command::{is_valid_ref_name, CommandResult, CommandType, ReceiveCommand};
use crate::config::ReceiveConfig;
use std::collections::HashSet;
use weir_storage::{ObjectId, ObjectStore, ObjectType};

const BRANCH_PREFIX: &str = "refs/heads/";

/// Checks commands against the ref snapshot and the receive policy.
#[derive(Debug, Clone, Copy)]
pub struct CommandValidator<'a> {
    config: &'a ReceiveConfig,
    advertised: &'a AdvertisedRefs,
    store: &'a ObjectStore,
}

impl<'a> CommandValidator<'a> {
    /// Creates a validator.
    pub fn new(config: &'a ReceiveConfig, advertised: &'a AdvertisedRefs, store: &'a ObjectStore) -> Self {
        Self {
            config,
            advertised,
            store,
        }
    }

    /// Validates every undecided command, in order.
    pub fn validate(&self, commands: &mut [ReceiveCommand]) {
        for cmd in commands.iter_mut() {
            if cmd.result().is_decided() {
                continue;
            }
            if is_acceptable_name(cmd.ref_name()) {
                self.validate_one(cmd);
            } else {
                cmd.reject("funny refname");
            }
            if cmd.result().is_decided() {
                tracing::warn!(
                    ref_name = %cmd.ref_name(),
                    result = ?cmd.result(),
                    reason = %cmd.reason(),
                    "command rejected"
                );
            }
        }
    }

    fn validate_one(&self, cmd: &mut ReceiveCommand) {
        let name = cmd.ref_name().to_string();
        match cmd.command_type() {
            CommandType::Delete => {
                // A stale old id is reported as such whatever the policy.
                let current = self.advertised.id(&name).unwrap_or(ObjectId::ZERO);
                if !cmd.old_id().is_zero() && cmd.old_id() != current {
                    cmd.reject("invalid old id sent");
                } else if !self.advertised.contains(&name) {
                    cmd.reject("no such ref");
                } else if !self.config.allow_deletes
                    || (!self.config.allow_branch_deletes && name.starts_with(BRANCH_PREFIX))
                {
                    cmd.set_result(CommandResult::RejectedNoDelete, None);
                }
            }
            CommandType::Create => {
                if !self.config.allow_creates {
                    cmd.set_result(CommandResult::RejectedNoCreate, None);
                } else if self.advertised.contains(&name) {
                    if !self.config.allow_non_fast_forwards {
                        cmd.set_result(CommandResult::RejectedNonFastForward, None);
                    } else {
                        cmd.reject("ref exists");
                    }
                }
            }
            CommandType::Update | CommandType::UpdateNonFastForward => {
                if !self.advertised.contains(&name) {
                    cmd.reject("no such ref");
                    return;
                }
                let Some(current) = self.advertised.id(&name) else {
                    cmd.reject("cannot update unborn branch");
                    return;
                };
                if current != cmd.old_id() {
                    cmd.reject("invalid old id sent");
                    return;
                }
                self.classify_update(cmd);
                if cmd.command_type() == CommandType::UpdateNonFastForward
                    && !self.config.allow_non_fast_forwards
                {
                    cmd.set_result(CommandResult::RejectedNonFastForward, None);
                }
            }
        }
    }

    /// Decides between fast-forward and non-fast-forward.
    fn classify_update(&self, cmd: &mut ReceiveCommand) {
        let old = match self.store.get(&cmd.old_id()) {
            Ok(object) => object,
            Err(_) => {
                let id = cmd.old_id().to_hex();
                cmd.set_result(CommandResult::RejectedMissingObject, Some(id));
                return;
            }
        };
        let new = match self.store.get(&cmd.new_id()) {
            Ok(object) => object,
            Err(_) => {
                let id = cmd.new_id().to_hex();
                cmd.set_result(CommandResult::RejectedMissingObject, Some(id));
                return;
            }
        };

        let both_commits =
            old.object_type == ObjectType::Commit && new.object_type == ObjectType::Commit;
        if !both_commits || !is_ancestor(self.store, old.id, new.id) {
            cmd.mark_non_fast_forward();
        }
    }
}

/// Returns true if `ancestor` is reachable from `descendant` through commit
/// parents (a commit is its own ancestor). Parents missing from the store
/// end their branch of the walk.
pub fn is_ancestor(store: &ObjectStore, ancestor: ObjectId, descendant: ObjectId) -> bool {
    let mut queue = vec![descendant];
    let mut seen = HashSet::new();
    while let Some(id) = queue.pop() {
        if id == ancestor {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Ok(info) = store.get(&id).and_then(|object| object.parse_commit()) {
            queue.extend(info.parents);
        }
    }
    false
}

fn is_acceptable_name(name: &str) -> bool {
    name.starts_with("refs/") && is_valid_ref_name(name)
}
