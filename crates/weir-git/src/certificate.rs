//! Signed push certificates.
//!
//! A client that saw `push-cert=<nonce>` in the advertisement may send a
//! certificate in place of the plain capability line:
//!
//! ```text
//! push-cert\0<capabilities>
//! certificate version 0.1
//! pusher <ident>
//! pushee <url>
//! nonce <nonce>
//! push-option <opt>
//!
//! <old> <new> <ref>
//! -----BEGIN PGP SIGNATURE-----
//! ...
//! -----END PGP SIGNATURE-----
//! push-cert-end
//! ```
//!
//! The structure is checked strictly and any deviation aborts the session.
//! The nonce is only graded (see [`NonceStatus`]); acting on the grade is up
//! to whoever consumes the certificate.

use crate::pktline::PktLineReader;
use crate::{GitError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;

/// Command part of a first line that starts a certificate.
pub const BEGIN_CERTIFICATE: &str = "push-cert";
/// Line opening the detached signature.
pub const BEGIN_SIGNATURE: &str = "-----BEGIN PGP SIGNATURE-----";
/// Line closing the detached signature.
pub const END_SIGNATURE: &str = "-----END PGP SIGNATURE-----";
/// Line closing the certificate.
pub const END_CERTIFICATE: &str = "push-cert-end";

const VERSION: &str = "0.1";

/// How the nonce in a certificate relates to the one the server issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    /// The server did not ask for a certificate.
    Unsolicited,
    /// The nonce was not produced by this server.
    Bad,
    /// The certificate carries no nonce.
    Missing,
    /// The nonce is the one sent in this session.
    Ok,
    /// The nonce is genuine but older than the accepted window.
    Slop,
}

/// Issues and grades stateless certificate nonces.
///
/// A nonce is `<unix-seconds>-<hex sha256(seed:repo:seconds)>`, so a nonce
/// issued to an earlier session can be recognised without keeping state.
#[derive(Clone)]
pub struct NonceGenerator {
    seed: String,
    slop_secs: u64,
}

impl std::fmt::Debug for NonceGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceGenerator")
            .field("slop_secs", &self.slop_secs)
            .finish_non_exhaustive()
    }
}

impl NonceGenerator {
    /// Creates a generator from a secret seed.
    pub fn new(seed: impl Into<String>, slop_secs: u64) -> Self {
        Self {
            seed: seed.into(),
            slop_secs,
        }
    }

    /// Creates the nonce for `repo` at `timestamp`.
    pub fn create_nonce(&self, repo: &str, timestamp: u64) -> String {
        format!("{}-{}", timestamp, self.digest(repo, timestamp))
    }

    /// Grades a received nonce against the one sent in this session.
    pub fn verify(&self, received: &str, sent: Option<&str>, repo: &str, now: u64) -> NonceStatus {
        if received.is_empty() {
            return NonceStatus::Missing;
        }
        let Some(sent) = sent else {
            return NonceStatus::Unsolicited;
        };
        if received == sent {
            return NonceStatus::Ok;
        }

        let Some((stamp, digest)) = received.split_once('-') else {
            return NonceStatus::Bad;
        };
        let Ok(stamp) = stamp.parse::<u64>() else {
            return NonceStatus::Bad;
        };
        if digest != self.digest(repo, stamp) {
            return NonceStatus::Bad;
        }
        if now.abs_diff(stamp) > self.slop_secs {
            NonceStatus::Slop
        } else {
            NonceStatus::Ok
        }
    }

    fn digest(&self, repo: &str, timestamp: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.as_bytes());
        hasher.update(b":");
        hasher.update(repo.as_bytes());
        hasher.update(b":");
        hasher.update(timestamp.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A parsed push certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCertificate {
    version: String,
    pusher: String,
    pushee: Option<String>,
    nonce: String,
    push_options: Vec<String>,
    commands: Vec<String>,
    signature: String,
    nonce_status: NonceStatus,
}

impl PushCertificate {
    /// Certificate format version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Identity of the signer.
    pub fn pusher(&self) -> &str {
        &self.pusher
    }

    /// Destination the client pushed to, if stated.
    pub fn pushee(&self) -> Option<&str> {
        self.pushee.as_deref()
    }

    /// Nonce echoed by the client.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Push options covered by the signature.
    pub fn push_options(&self) -> &[String] {
        &self.push_options
    }

    /// Command lines covered by the signature.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// ASCII-armoured signature, newline-terminated lines.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Grade of the nonce.
    pub fn nonce_status(&self) -> NonceStatus {
        self.nonce_status
    }

    /// The signed text: header, blank line, then commands.
    pub fn payload(&self) -> String {
        let mut out = format!("certificate version {}\npusher {}\n", self.version, self.pusher);
        if let Some(pushee) = &self.pushee {
            out.push_str(&format!("pushee {}\n", pushee));
        }
        out.push_str(&format!("nonce {}\n", self.nonce));
        for option in &self.push_options {
            out.push_str(&format!("push-option {}\n", option));
        }
        out.push('\n');
        for command in &self.commands {
            out.push_str(command);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Default)]
struct Header {
    version: Option<String>,
    pusher: Option<String>,
    pushee: Option<String>,
    nonce: Option<String>,
    push_options: Vec<String>,
}

/// Incrementally assembles a certificate while the command list is read.
#[derive(Debug, Default)]
pub struct PushCertificateParser {
    header: Option<Header>,
    commands: Vec<String>,
    signature: Option<String>,
}

impl PushCertificateParser {
    /// Creates an idle parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once a certificate header has been read.
    pub fn is_active(&self) -> bool {
        self.header.is_some()
    }

    /// Reads the header lines that follow `push-cert`, through the blank
    /// separator line.
    pub fn receive_header<R: Read>(&mut self, reader: &mut PktLineReader<R>) -> Result<()> {
        if self.header.is_some() {
            return Err(cert_error("duplicate certificate header"));
        }
        let mut header = Header::default();
        loop {
            let line = reader
                .read_string()?
                .ok_or_else(|| cert_error("header ended early"))?;
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| cert_error(format!("malformed header line: {}", line)))?;
            match key {
                "certificate" => {
                    let version = value
                        .strip_prefix("version ")
                        .ok_or_else(|| cert_error(format!("malformed header line: {}", line)))?;
                    set_once(&mut header.version, version, "certificate version")?;
                }
                "pusher" => set_once(&mut header.pusher, value, "pusher")?,
                "pushee" => set_once(&mut header.pushee, value, "pushee")?,
                "nonce" => set_once(&mut header.nonce, value, "nonce")?,
                "push-option" => header.push_options.push(value.to_string()),
                _ => return Err(cert_error(format!("unexpected header line: {}", line))),
            }
        }

        match header.version.as_deref() {
            Some(VERSION) => {}
            Some(other) => return Err(cert_error(format!("unsupported version {}", other))),
            None => return Err(cert_error("missing certificate version")),
        }
        if header.pusher.is_none() {
            return Err(cert_error("missing pusher"));
        }
        self.header = Some(header);
        Ok(())
    }

    /// Records a command line as part of the signed payload.
    pub fn add_command(&mut self, line: &str) {
        if self.header.is_some() && self.signature.is_none() {
            self.commands.push(line.to_string());
        }
    }

    /// Reads the signature after its opening line has been consumed, then
    /// the `push-cert-end` marker.
    pub fn receive_signature<R: Read>(&mut self, reader: &mut PktLineReader<R>) -> Result<()> {
        if self.header.is_none() {
            return Err(cert_error("signature without certificate"));
        }
        if self.signature.is_some() {
            return Err(cert_error("duplicate signature"));
        }
        let mut signature = format!("{}\n", BEGIN_SIGNATURE);
        loop {
            let line = reader
                .read_string()?
                .ok_or_else(|| cert_error("signature ended early"))?;
            signature.push_str(&line);
            signature.push('\n');
            if line == END_SIGNATURE {
                break;
            }
        }
        match reader.read_string()?.as_deref() {
            Some(END_CERTIFICATE) => {}
            _ => return Err(cert_error(format!("expected {}", END_CERTIFICATE))),
        }
        self.signature = Some(signature);
        Ok(())
    }

    /// Finishes the certificate and grades its nonce.
    ///
    /// Returns `None` when no certificate was sent.
    pub fn build(
        self,
        nonces: Option<&NonceGenerator>,
        sent_nonce: Option<&str>,
        repo: &str,
        now: u64,
    ) -> Result<Option<PushCertificate>> {
        let Some(header) = self.header else {
            return Ok(None);
        };
        let signature = self
            .signature
            .ok_or_else(|| cert_error("missing signature"))?;
        let nonce = header.nonce.unwrap_or_default();
        let nonce_status = match nonces {
            Some(generator) => generator.verify(&nonce, sent_nonce, repo, now),
            None if nonce.is_empty() => NonceStatus::Missing,
            None => NonceStatus::Unsolicited,
        };
        Ok(Some(PushCertificate {
            version: header.version.unwrap_or_else(|| VERSION.to_string()),
            pusher: header.pusher.unwrap_or_default(),
            pushee: header.pushee,
            nonce,
            push_options: header.push_options,
            commands: self.commands,
            signature,
            nonce_status,
        }))
    }
}

fn set_once(slot: &mut Option<String>, value: &str, field: &str) -> Result<()> {
    if slot.is_some() {
        return Err(cert_error(format!("duplicate {}", field)));
    }
    *slot = Some(value.to_string());
    Ok(())
}

fn cert_error(msg: impl Into<String>) -> GitError {
    GitError::Certificate(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::encode_lines;
    use std::io::Cursor;

    const CMD: &str = "0000000000000000000000000000000000000000 \
                       1111111111111111111111111111111111111111 refs/heads/main";

    fn reader(lines: &[&str]) -> PktLineReader<Cursor<Vec<u8>>> {
        PktLineReader::new(Cursor::new(encode_lines(lines.iter().copied()).unwrap()))
    }

    fn signed(parser: &mut PushCertificateParser) {
        parser.add_command(CMD);
        let mut sig = reader(&["abcdef", END_SIGNATURE, END_CERTIFICATE]);
        parser.receive_signature(&mut sig).unwrap();
    }

    #[test]
    fn test_nonce_roundtrip() {
        let generator = NonceGenerator::new("secret", 300);
        let nonce = generator.create_nonce("r.git", 1_700_000_000);
        assert!(nonce.starts_with("1700000000-"));

        assert_eq!(
            generator.verify(&nonce, Some(&nonce), "r.git", 1_700_000_000),
            NonceStatus::Ok
        );
        let older = generator.create_nonce("r.git", 1_699_999_900);
        assert_eq!(
            generator.verify(&older, Some(&nonce), "r.git", 1_700_000_000),
            NonceStatus::Ok
        );
        let stale = generator.create_nonce("r.git", 1_600_000_000);
        assert_eq!(
            generator.verify(&stale, Some(&nonce), "r.git", 1_700_000_000),
            NonceStatus::Slop
        );
    }

    #[test]
    fn test_nonce_grades() {
        let generator = NonceGenerator::new("secret", 300);
        let sent = generator.create_nonce("r.git", 100);
        assert_eq!(generator.verify("", Some(&sent), "r.git", 100), NonceStatus::Missing);
        assert_eq!(generator.verify(&sent, None, "r.git", 100), NonceStatus::Unsolicited);
        assert_eq!(generator.verify("junk", Some(&sent), "r.git", 100), NonceStatus::Bad);
        assert_eq!(generator.verify("100-beef", Some(&sent), "r.git", 100), NonceStatus::Bad);

        let other_repo = generator.create_nonce("other.git", 90);
        assert_eq!(
            generator.verify(&other_repo, Some(&sent), "r.git", 100),
            NonceStatus::Bad
        );
    }

    #[test]
    fn test_full_certificate() {
        let mut parser = PushCertificateParser::new();
        let mut header = reader(&[
            "certificate version 0.1",
            "pusher Jane <jane@example.com> 1700000000 +0000",
            "pushee git://example.com/r.git",
            "nonce 1700000000-abc",
            "push-option ci.skip",
            "",
        ]);
        parser.receive_header(&mut header).unwrap();
        assert!(parser.is_active());
        signed(&mut parser);

        let cert = parser.build(None, None, "r.git", 0).unwrap().unwrap();
        assert_eq!(cert.version(), "0.1");
        assert_eq!(cert.pusher(), "Jane <jane@example.com> 1700000000 +0000");
        assert_eq!(cert.pushee(), Some("git://example.com/r.git"));
        assert_eq!(cert.nonce(), "1700000000-abc");
        assert_eq!(cert.push_options(), ["ci.skip".to_string()]);
        assert_eq!(cert.commands(), [CMD.to_string()]);
        assert!(cert.signature().starts_with(BEGIN_SIGNATURE));
        assert!(cert.signature().ends_with("-----END PGP SIGNATURE-----\n"));
        assert_eq!(cert.nonce_status(), NonceStatus::Unsolicited);
        assert!(cert.payload().contains("\n\n0000000000"));
    }

    #[test]
    fn test_no_certificate() {
        let parser = PushCertificateParser::new();
        assert!(parser.build(None, None, "r", 0).unwrap().is_none());
    }

    #[test]
    fn test_bad_version() {
        let mut parser = PushCertificateParser::new();
        let mut header = reader(&["certificate version 9.9", "pusher x", ""]);
        assert!(matches!(
            parser.receive_header(&mut header),
            Err(GitError::Certificate(_))
        ));
    }

    #[test]
    fn test_header_requires_pusher() {
        let mut parser = PushCertificateParser::new();
        let mut header = reader(&["certificate version 0.1", "nonce n", ""]);
        assert!(parser.receive_header(&mut header).is_err());
    }

    #[test]
    fn test_unexpected_header_line() {
        let mut parser = PushCertificateParser::new();
        let mut header = reader(&["certificate version 0.1", "bogus line", ""]);
        assert!(parser.receive_header(&mut header).is_err());
    }

    #[test]
    fn test_header_truncated_by_flush() {
        let mut parser = PushCertificateParser::new();
        let mut header = reader(&["certificate version 0.1", "pusher x"]);
        assert!(parser.receive_header(&mut header).is_err());
    }

    #[test]
    fn test_missing_end_marker() {
        let mut parser = PushCertificateParser::new();
        let mut header = reader(&["certificate version 0.1", "pusher x", ""]);
        parser.receive_header(&mut header).unwrap();
        let mut sig = reader(&["abc", END_SIGNATURE, "not-the-end"]);
        assert!(parser.receive_signature(&mut sig).is_err());
    }

    #[test]
    fn test_missing_signature() {
        let mut parser = PushCertificateParser::new();
        let mut header = reader(&["certificate version 0.1", "pusher x", ""]);
        parser.receive_header(&mut header).unwrap();
        parser.add_command(CMD);
        assert!(parser.build(None, None, "r", 0).is_err());
    }

    #[test]
    fn test_signature_without_header() {
        let mut parser = PushCertificateParser::new();
        let mut sig = reader(&[END_SIGNATURE, END_CERTIFICATE]);
        assert!(parser.receive_signature(&mut sig).is_err());
    }

    #[test]
    fn test_nonce_graded_on_build() {
        let generator = NonceGenerator::new("seed", 60);
        let sent = generator.create_nonce("r.git", 1000);
        let mut parser = PushCertificateParser::new();
        let nonce_line = format!("nonce {}", sent);
        let mut header = reader(&["certificate version 0.1", "pusher x", &nonce_line, ""]);
        parser.receive_header(&mut header).unwrap();
        signed(&mut parser);
        let cert = parser
            .build(Some(&generator), Some(&sent), "r.git", 1000)
            .unwrap()
            .unwrap();
        assert_eq!(cert.nonce_status(), NonceStatus::Ok);
    }
}
