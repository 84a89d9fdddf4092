//! Fuzz target for a whole receive-pack session.
//!
//! Arbitrary client input against a repository with one branch. The session
//! may fail but must not panic, and a failed session leaves the ref alone.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use weir_git::{ReceiveConfig, ReceivePack};
use weir_storage::{GitObject, Repository};

const IDENT: &str = "Fuzz <fuzz@example.com> 1700000000 +0000";

fuzz_target!(|data: &[u8]| {
    let repo = Arc::new(Repository::new("fuzz.git"));
    let blob = repo.objects.put(GitObject::blob(b"fuzz".to_vec()));
    let tree = repo.objects.put(GitObject::tree(&[(0o100644, "f", blob)]));
    let tip = repo
        .objects
        .put(GitObject::commit(&tree, &[], IDENT, IDENT, "root"));
    repo.refs.set("refs/heads/main", tip);

    let config = ReceiveConfig {
        check_received_objects: true,
        max_pack_size: Some(1 << 20),
        max_discard_bytes: 1 << 16,
        ..ReceiveConfig::default()
    };
    let mut output = Vec::new();
    let result = ReceivePack::new(repo.clone(), config).receive(data, &mut output, None);
    if result.is_err() {
        assert_eq!(repo.refs.resolve("refs/heads/main"), Some(tip));
    }
});
