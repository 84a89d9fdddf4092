//! End-to-end receive-pack sessions.
//!
//! Each test plays the client side of a push against an in-memory
//! repository: it encodes the request, runs a [`ReceivePack`] session over
//! byte buffers and inspects the status report and the resulting refs.

use std::io::{Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use weir_git::{
    demux, encode_lines, CommandResult, CommandType, GitError, PackBuilder, PktLineReader, ReceiveConfig,
    ReceiveOutcome, ReceivePack, Result,
};
use weir_storage::{GitObject, ObjectId, Repository};

const IDENT: &str = "A U Thor <author@example.com> 1700000000 +0000";
const CAPS: &str = "report-status side-band-64k delete-refs";

/// Creates a commit whose tree and blob are already in the repository. The
/// commit itself is returned without being stored.
fn new_commit(repo: &Repository, parents: &[ObjectId], msg: &str) -> GitObject {
    let blob = repo.objects.put(GitObject::blob(msg.as_bytes().to_vec()));
    let tree = repo.objects.put(GitObject::tree(&[(0o100644, "file.txt", blob)]));
    GitObject::commit(&tree, parents, IDENT, IDENT, msg)
}

/// Creates and stores a commit.
fn stored_commit(repo: &Repository, parents: &[ObjectId], msg: &str) -> ObjectId {
    repo.objects.put(new_commit(repo, parents, msg))
}

fn pack_of(objects: &[GitObject]) -> Vec<u8> {
    let mut builder = PackBuilder::default();
    for object in objects {
        builder.add(object.clone());
    }
    builder.build().unwrap()
}

fn command(old: ObjectId, new: ObjectId, name: &str) -> String {
    format!("{} {} {}", old, new, name)
}

/// Encodes a request: command lines (capabilities on the first one), then the
/// pack if there is one.
fn request(commands: &[String], caps: &str, pack: Option<Vec<u8>>) -> Vec<u8> {
    let mut lines: Vec<String> = commands.to_vec();
    if let Some(first) = lines.first_mut() {
        first.push('\0');
        first.push_str(caps);
    }
    let mut buf = encode_lines(lines.iter().map(String::as_str)).unwrap();
    if let Some(pack) = pack {
        buf.extend_from_slice(&pack);
    }
    buf
}

fn run(repo: &Arc<Repository>, config: ReceiveConfig, input: &[u8]) -> (Result<ReceiveOutcome>, Vec<u8>) {
    let mut output = Vec::new();
    let result = ReceivePack::new(repo.clone(), config).receive(input, &mut output, None);
    (result, output)
}

fn report_lines(output: &[u8]) -> Vec<String> {
    let data = demux(output).unwrap().data;
    let mut reader = PktLineReader::new(Cursor::new(data));
    let mut lines = Vec::new();
    while let Some(line) = reader.read_string().unwrap() {
        lines.push(line);
    }
    lines
}

fn progress(output: &[u8]) -> String {
    String::from_utf8(demux(output).unwrap().progress).unwrap()
}

#[test]
fn test_create_new_branch() {
    let repo = Arc::new(Repository::new("project.git"));
    let c = new_commit(&repo, &[], "initial");
    let input = request(
        &[command(ObjectId::ZERO, c.id, "refs/heads/new")],
        CAPS,
        Some(pack_of(&[c.clone()])),
    );

    let (result, output) = run(&repo, ReceiveConfig::default(), &input);
    let outcome = result.unwrap();

    assert_eq!(outcome.commands[0].result(), CommandResult::Ok);
    assert_eq!(report_lines(&output), vec!["unpack ok", "ok refs/heads/new"]);
    assert!(demux(&output).unwrap().flushed);
    assert_eq!(repo.refs.resolve("refs/heads/new"), Some(c.id));
    assert_eq!(repo.refs.reflog("refs/heads/new").len(), 1);
}

#[test]
fn test_update_with_wrong_old_id() {
    let repo = Arc::new(Repository::new("project.git"));
    let x = stored_commit(&repo, &[], "x");
    let y = stored_commit(&repo, &[], "y");
    repo.refs.set("refs/heads/main", y);
    let next = new_commit(&repo, &[x], "next");

    let input = request(
        &[command(x, next.id, "refs/heads/main")],
        CAPS,
        Some(pack_of(&[next])),
    );
    let (result, output) = run(&repo, ReceiveConfig::default(), &input);

    assert_eq!(
        result.unwrap().commands[0].result(),
        CommandResult::RejectedOtherReason
    );
    assert_eq!(
        report_lines(&output)[1],
        "ng refs/heads/main invalid old id sent"
    );
    assert_eq!(repo.refs.resolve("refs/heads/main"), Some(y));
}

#[test]
fn test_branch_delete_prohibited_human_report() {
    let repo = Arc::new(Repository::new("project.git"));
    let c = stored_commit(&repo, &[], "topic work");
    repo.refs.set("refs/heads/topic", c);
    let config = ReceiveConfig {
        allow_branch_deletes: false,
        ..ReceiveConfig::default()
    };

    let input = request(
        &[command(c, ObjectId::ZERO, "refs/heads/topic")],
        "side-band-64k delete-refs",
        None,
    );
    let (result, output) = run(&repo, config, &input);

    assert_eq!(
        result.unwrap().commands[0].result(),
        CommandResult::RejectedNoDelete
    );
    assert!(progress(&output).contains("! [rejected] refs/heads/topic (deletion prohibited)\n"));
    assert!(report_lines(&output).is_empty());
    assert_eq!(repo.refs.resolve("refs/heads/topic"), Some(c));
}

#[test]
fn test_non_fast_forward_rejected_before_apply() {
    let repo = Arc::new(Repository::new("project.git"));
    let base = stored_commit(&repo, &[], "base");
    let ours = stored_commit(&repo, &[base], "ours");
    repo.refs.set("refs/heads/main", ours);
    let theirs = new_commit(&repo, &[base], "theirs");
    let config = ReceiveConfig {
        allow_non_fast_forwards: false,
        ..ReceiveConfig::default()
    };

    let input = request(
        &[command(ours, theirs.id, "refs/heads/main")],
        CAPS,
        Some(pack_of(&[theirs])),
    );
    let (result, output) = run(&repo, config, &input);

    assert_eq!(
        result.unwrap().commands[0].result(),
        CommandResult::RejectedNonFastForward
    );
    assert_eq!(report_lines(&output)[1], "ng refs/heads/main non-fast forward");
    assert_eq!(repo.refs.resolve("refs/heads/main"), Some(ours));
    assert!(repo.refs.reflog("refs/heads/main").is_empty());
}

#[test]
fn test_fast_forward_accepted_when_non_fast_forwards_disallowed() {
    let repo = Arc::new(Repository::new("project.git"));
    let base = stored_commit(&repo, &[], "base");
    repo.refs.set("refs/heads/main", base);
    let next = new_commit(&repo, &[base], "next");
    let config = ReceiveConfig {
        allow_non_fast_forwards: false,
        ..ReceiveConfig::default()
    };

    let input = request(
        &[command(base, next.id, "refs/heads/main")],
        CAPS,
        Some(pack_of(&[next.clone()])),
    );
    let (result, output) = run(&repo, config, &input);
    let outcome = result.unwrap();

    assert_eq!(outcome.commands[0].command_type(), CommandType::Update);
    assert_eq!(outcome.commands[0].result(), CommandResult::Ok);
    assert_eq!(report_lines(&output), vec!["unpack ok", "ok refs/heads/main"]);
    assert_eq!(repo.refs.resolve("refs/heads/main"), Some(next.id));
}

#[test]
fn test_oversized_delta_is_unpack_error() {
    let repo = Arc::new(Repository::new("project.git"));
    let base = repo.objects.put(GitObject::blob(b"x".to_vec()));
    let tip = new_commit(&repo, &[], "tip");
    let mut builder = PackBuilder::default();
    builder.add(tip.clone());
    builder.add_ref_delta(base, vec![0u8; 4096]);
    let config = ReceiveConfig {
        max_object_size: Some(1024),
        max_pack_size: Some(1 << 20),
        ..ReceiveConfig::default()
    };

    let input = request(
        &[command(ObjectId::ZERO, tip.id, "refs/heads/main")],
        CAPS,
        Some(builder.build().unwrap()),
    );
    let (result, output) = run(&repo, config, &input);

    assert!(matches!(
        result,
        Err(GitError::ObjectTooLarge { size: 4096, limit: 1024 })
    ));
    let lines = report_lines(&output);
    assert!(lines[0].starts_with("unpack error "));
    assert_eq!(lines[1], "ng refs/heads/main n/a (unpacker error)");
    assert_eq!(repo.refs.resolve("refs/heads/main"), None);
}

#[test]
fn test_request_error_reaches_client_that_keeps_socket_open() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let repo = Arc::new(Repository::new("project.git"));
        let mut session = ReceivePack::new(repo, ReceiveConfig::default())
            .timeout_control(Box::new(stream.try_clone().unwrap()));
        session.receive(&stream, &stream, None)
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let first = format!(
        "{} {} refs/heads/a\0report-status side-band-64k",
        ObjectId::ZERO,
        ObjectId::ZERO
    );
    client
        .write_all(&encode_lines([first.as_str(), "garbage"]).unwrap())
        .unwrap();

    // The write side stays open; the server must not wait for it to close.
    let mut output = Vec::new();
    client.read_to_end(&mut output).unwrap();

    let err = server.join().unwrap().unwrap_err();
    assert!(matches!(err, GitError::Protocol(_)));
    let out = demux(&output).unwrap();
    assert!(String::from_utf8(out.error).unwrap().contains("malformed command"));
    assert!(out.flushed);
}

#[test]
fn test_blind_delete_of_missing_ref() {
    let repo = Arc::new(Repository::new("project.git"));
    let c = stored_commit(&repo, &[], "kept");
    repo.refs.set("refs/heads/main", c);

    let input = request(
        &[
            command(ObjectId::ZERO, ObjectId::ZERO, "refs/heads/gone"),
            command(ObjectId::ZERO, ObjectId::ZERO, "refs/heads/main"),
        ],
        CAPS,
        None,
    );
    let (result, output) = run(&repo, ReceiveConfig::default(), &input);
    let outcome = result.unwrap();

    assert_eq!(outcome.commands[0].command_type(), CommandType::Delete);
    assert_eq!(
        report_lines(&output),
        vec![
            "unpack ok",
            "ng refs/heads/gone no such ref",
            "ok refs/heads/main",
        ]
    );
    assert_eq!(repo.refs.resolve("refs/heads/main"), None);
}

#[test]
fn test_head_stays_rejected() {
    let repo = Arc::new(Repository::new("project.git"));
    let c = new_commit(&repo, &[], "detached");
    let input = request(
        &[
            command(ObjectId::ZERO, c.id, "HEAD"),
            command(ObjectId::ZERO, c.id, "refs/heads/main"),
        ],
        CAPS,
        Some(pack_of(&[c.clone()])),
    );

    let (result, output) = run(&repo, ReceiveConfig::default(), &input);
    let outcome = result.unwrap();

    assert_eq!(
        outcome.commands[0].result(),
        CommandResult::RejectedCurrentBranch
    );
    assert_eq!(outcome.commands[1].result(), CommandResult::Ok);
    assert_eq!(
        report_lines(&output),
        vec![
            "unpack ok",
            "ng HEAD branch is currently checked out",
            "ok refs/heads/main",
        ]
    );
}

#[test]
fn test_atomic_push_with_lock_failure_applies_nothing() {
    let repo = Arc::new(Repository::new("project.git"));
    let c1 = stored_commit(&repo, &[], "one");
    repo.refs.set("refs/heads/main", c1);

    let mut session = ReceivePack::new(repo.clone(), ReceiveConfig::default());
    let mut advert = Vec::new();
    session.send_advertisement(&mut advert).unwrap();

    // Someone else moves main after the advertisement.
    let other = stored_commit(&repo, &[c1], "other");
    repo.refs.set("refs/heads/main", other);

    let c2 = new_commit(&repo, &[c1], "two");
    let input = request(
        &[
            command(c1, c2.id, "refs/heads/main"),
            command(ObjectId::ZERO, c2.id, "refs/heads/topic"),
        ],
        "report-status side-band-64k atomic",
        Some(pack_of(&[c2.clone()])),
    );
    let mut output = Vec::new();
    let outcome = session.receive(&input[..], &mut output, None).unwrap();

    assert!(outcome
        .commands
        .iter()
        .all(|c| c.result() != CommandResult::Ok));
    assert_eq!(outcome.commands[0].result(), CommandResult::LockFailure);
    assert_eq!(
        report_lines(&output),
        vec![
            "unpack ok",
            "ng refs/heads/main failed to lock",
            "ng refs/heads/topic transaction aborted",
        ]
    );
    assert_eq!(repo.refs.resolve("refs/heads/main"), Some(other));
    assert_eq!(repo.refs.resolve("refs/heads/topic"), None);
}

#[test]
fn test_missing_parent_fails_connectivity() {
    let repo = Arc::new(Repository::new("project.git"));
    let ghost = GitObject::commit(
        &repo.objects.put(GitObject::tree(&[])),
        &[],
        IDENT,
        IDENT,
        "never sent",
    );
    let tip = new_commit(&repo, &[ghost.id], "tip");
    let config = ReceiveConfig {
        check_received_objects: true,
        ..ReceiveConfig::default()
    };

    let input = request(
        &[command(ObjectId::ZERO, tip.id, "refs/heads/main")],
        CAPS,
        Some(pack_of(&[tip])),
    );
    let (result, output) = run(&repo, config, &input);

    match result {
        Err(GitError::MissingObject { id, .. }) => assert_eq!(id, ghost.id),
        other => panic!("expected missing object, got {:?}", other),
    }
    let lines = report_lines(&output);
    assert!(lines[0].starts_with("unpack error "));
    assert_eq!(lines[1], "ng refs/heads/main n/a (unpacker error)");
    assert_eq!(repo.refs.resolve("refs/heads/main"), None);
}

#[test]
fn test_reachability_check_accepts_complete_push() {
    let repo = Arc::new(Repository::new("project.git"));
    let base = stored_commit(&repo, &[], "base");
    repo.refs.set("refs/heads/main", base);

    let blob = GitObject::blob(b"new content".to_vec());
    let tree = GitObject::tree(&[(0o100644, "file.txt", blob.id)]);
    let tip = GitObject::commit(&tree.id, &[base], IDENT, IDENT, "tip");
    let config = ReceiveConfig {
        check_received_objects: true,
        check_referenced_objects_are_reachable: true,
        ..ReceiveConfig::default()
    };

    let input = request(
        &[command(base, tip.id, "refs/heads/main")],
        CAPS,
        Some(pack_of(&[blob, tree, tip.clone()])),
    );
    let (result, output) = run(&repo, config, &input);

    assert!(result.unwrap().all_ok());
    assert_eq!(report_lines(&output)[1], "ok refs/heads/main");
    assert_eq!(repo.refs.resolve("refs/heads/main"), Some(tip.id));
}

#[test]
fn test_oversized_pack_is_unpack_error() {
    let repo = Arc::new(Repository::new("project.git"));
    let c = new_commit(&repo, &[], "big");
    let config = ReceiveConfig {
        max_pack_size: Some(16),
        ..ReceiveConfig::default()
    };
    let input = request(
        &[command(ObjectId::ZERO, c.id, "refs/heads/main")],
        CAPS,
        Some(pack_of(&[c])),
    );

    let (result, output) = run(&repo, config, &input);
    assert!(matches!(result, Err(GitError::PackTooLarge { limit: 16 })));
    assert!(report_lines(&output)[0].starts_with("unpack error"));
}

#[test]
fn test_signed_push() {
    let repo = Arc::new(Repository::new("project.git"));
    let config = ReceiveConfig {
        certificate_nonce_seed: Some("s3cret".to_string()),
        ..ReceiveConfig::default()
    };
    let mut session = ReceivePack::new(repo.clone(), config);
    let mut advert = Vec::new();
    session.send_advertisement(&mut advert).unwrap();

    let first = PktLineReader::new(Cursor::new(advert))
        .read_string()
        .unwrap()
        .unwrap();
    let nonce = first
        .split(|c| c == '\0' || c == ' ')
        .find_map(|token| token.strip_prefix("push-cert="))
        .unwrap()
        .to_string();

    let c = new_commit(&repo, &[], "signed");
    let cmd = command(ObjectId::ZERO, c.id, "refs/heads/main");
    let lines = vec![
        format!("push-cert\0{}", CAPS),
        "certificate version 0.1".to_string(),
        format!("pusher {}", IDENT),
        "pushee git://localhost/project.git".to_string(),
        format!("nonce {}", nonce),
        String::new(),
        cmd.clone(),
        "-----BEGIN PGP SIGNATURE-----".to_string(),
        "iQEzBAABCAAdFiEE".to_string(),
        "-----END PGP SIGNATURE-----".to_string(),
        "push-cert-end".to_string(),
    ];
    let mut input = encode_lines(lines.iter().map(String::as_str)).unwrap();
    input.extend(pack_of(&[c.clone()]));

    let mut output = Vec::new();
    let outcome = session.receive(&input[..], &mut output, None).unwrap();

    let cert = outcome.certificate.expect("certificate");
    assert_eq!(cert.nonce_status(), weir_git::NonceStatus::Ok);
    assert_eq!(cert.commands(), &[cmd]);
    assert_eq!(cert.pushee(), Some("git://localhost/project.git"));
    assert!(outcome.commands[0].result() == CommandResult::Ok);
    assert_eq!(repo.refs.resolve("refs/heads/main"), Some(c.id));
}

#[test]
fn test_truncated_certificate_is_fatal() {
    let repo = Arc::new(Repository::new("project.git"));
    let lines = vec![
        format!("push-cert\0{}", CAPS),
        "certificate version 0.1".to_string(),
        format!("pusher {}", IDENT),
    ];
    let input = encode_lines(lines.iter().map(String::as_str)).unwrap();

    let (result, output) = run(&repo, ReceiveConfig::default(), &input);
    assert!(matches!(result, Err(GitError::Certificate(_))));
    assert!(!demux(&output).unwrap().error.is_empty());
}

fn branch_names() -> impl Strategy<Value = Vec<(String, bool)>> {
    prop::collection::vec(("[a-z]{1,8}", any::<bool>()), 1..12).prop_map(|names| {
        let mut seen = std::collections::HashSet::new();
        names
            .into_iter()
            .filter(|(name, _)| seen.insert(name.clone()))
            .map(|(name, create)| (format!("refs/heads/{}", name), create))
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// The report lists every command in the order it was received, whatever
    /// its outcome.
    #[test]
    fn prop_report_preserves_order(names in branch_names()) {
        let repo = Arc::new(Repository::new("project.git"));
        let c = new_commit(&repo, &[], "shared");
        let commands: Vec<String> = names
            .iter()
            .map(|(name, create)| {
                // Updates of refs that do not exist are rejected.
                let old = if *create { ObjectId::ZERO } else { c.id };
                command(old, c.id, name)
            })
            .collect();
        let input = request(&commands, CAPS, Some(pack_of(&[c.clone()])));

        let (result, output) = run(&repo, ReceiveConfig::default(), &input);
        let outcome = result.unwrap();
        let lines = report_lines(&output);

        prop_assert_eq!(lines.len(), names.len() + 1);
        for (i, (name, create)) in names.iter().enumerate() {
            prop_assert_eq!(outcome.commands[i].ref_name(), name.as_str());
            let expected = if *create {
                format!("ok {}", name)
            } else {
                format!("ng {} no such ref", name)
            };
            prop_assert_eq!(&lines[i + 1], &expected);
        }
    }

    /// A delete is accepted only with the advertised old id; any other old
    /// id is rejected as invalid whatever the deletion policy says.
    #[test]
    fn prop_delete_old_id_law(
        stale in any::<[u8; 20]>(),
        use_current in any::<bool>(),
        allow_deletes in any::<bool>(),
        allow_branch_deletes in any::<bool>(),
    ) {
        let repo = Arc::new(Repository::new("project.git"));
        let current = stored_commit(&repo, &[], "current");
        repo.refs.set("refs/heads/main", current);

        let stale = ObjectId::from_bytes(stale);
        prop_assume!(!stale.is_zero() && stale != current);
        let old = if use_current { current } else { stale };
        let config = ReceiveConfig {
            allow_deletes,
            allow_branch_deletes,
            ..ReceiveConfig::default()
        };

        let input = request(&[command(old, ObjectId::ZERO, "refs/heads/main")], CAPS, None);
        let (result, _) = run(&repo, config, &input);
        let cmd = result.unwrap().commands.remove(0);

        if !use_current {
            prop_assert_eq!(cmd.result(), CommandResult::RejectedOtherReason);
            prop_assert_eq!(cmd.reason(), "invalid old id sent");
            prop_assert_eq!(repo.refs.resolve("refs/heads/main"), Some(current));
        } else if allow_deletes && allow_branch_deletes {
            prop_assert_eq!(cmd.result(), CommandResult::Ok);
            prop_assert_eq!(repo.refs.resolve("refs/heads/main"), None);
        } else {
            prop_assert_eq!(cmd.result(), CommandResult::RejectedNoDelete);
        }
    }
}
