use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::models::HashAlgorithm;
use crate::error::{FerryError, Result};
use crate::session::{RemoteCommand, RemoteSession};

/// Local and remote digests of one uploaded archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub matched: bool,
    pub local: String,
    pub remote: String,
}

/// Hash the uploaded archive on the remote host and compare it with the
/// digest computed locally before transfer.
///
/// A mismatch is returned as `matched == false`, not as an error; only a
/// failing or unparseable hash command is an error.
pub async fn verify(
    session: &dyn RemoteSession,
    local_hash: &str,
    algorithm: HashAlgorithm,
    remote_path: &str,
    timeout: Duration,
) -> Result<Verification> {
    let command = RemoteCommand::Hash {
        algorithm,
        path: remote_path.to_string(),
    };

    debug!(remote = %remote_path, algorithm = %algorithm, "Computing remote digest");
    let output = session.execute(&command, timeout).await?.check(&command)?;

    let remote = parse_digest(&output.stdout).ok_or_else(|| FerryError::RemoteCommandFailure {
        command: command.to_shell(),
        exit_code: output.exit_code,
        stderr: format!("unexpected output: {}", output.stdout.trim()),
    })?;

    let matched = digests_match(local_hash, &remote);
    if matched {
        info!(digest = %remote, "Remote digest matches");
    } else {
        warn!(local = %local_hash, remote = %remote, "Remote digest differs");
    }

    Ok(Verification {
        matched,
        local: local_hash.to_string(),
        remote,
    })
}

// "5eb63bbbe01eeed093cb22bb8f5acdc3  /tmp/app.zip". GNU tools prefix a
// backslash when the file name needed escaping.
static DIGEST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\\?([0-9A-Fa-f]+)(?:\s|$)").expect("digest pattern is valid")
});

/// First field of `<hex>  <path>` output, if it is a hex string.
pub fn parse_digest(stdout: &str) -> Option<String> {
    DIGEST_LINE
        .captures(stdout)
        .map(|caps| caps[1].to_string())
}

/// Case-insensitive digest equality. Empty digests never match.
pub fn digests_match(local: &str, remote: &str) -> bool {
    !local.is_empty() && local.eq_ignore_ascii_case(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::simulated::SimulatedHost;
    use crate::session::{ConnectParams, Connector, Credential};
    use tempfile::tempdir;

    const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    #[test]
    fn parses_md5sum_output() {
        assert_eq!(
            parse_digest("5EB63BBBE01EEED093CB22BB8F5ACDC3  /tmp/x.zip\n").as_deref(),
            Some("5EB63BBBE01EEED093CB22BB8F5ACDC3")
        );
        assert_eq!(parse_digest("md5sum: /tmp/x.zip: No such file\n"), None);
        assert_eq!(parse_digest(""), None);
    }

    #[test]
    fn comparison_ignores_case() {
        assert!(digests_match(HELLO_MD5, &HELLO_MD5.to_uppercase()));
    }

    #[test]
    fn any_single_differing_character_fails() {
        for i in 0..HELLO_MD5.len() {
            let mut altered: Vec<u8> = HELLO_MD5.bytes().collect();
            altered[i] = if altered[i] == b'0' { b'1' } else { b'0' };
            let altered = String::from_utf8(altered).unwrap();
            assert!(!digests_match(HELLO_MD5, &altered), "position {}", i);
        }
    }

    #[test]
    fn empty_digests_never_match() {
        assert!(!digests_match("", ""));
    }

    async fn simulated_session(root: &std::path::Path) -> (SimulatedHost, Box<dyn RemoteSession>) {
        let host = SimulatedHost::new(root).unwrap();
        let session = host
            .connect(&ConnectParams {
                host: "sim".to_string(),
                port: 22,
                username: "deploy".to_string(),
                credential: Credential::Password("pw".to_string()),
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        (host, session)
    }

    #[tokio::test]
    async fn verify_against_remote_file() {
        let temp = tempdir().unwrap();
        let (host, session) = simulated_session(temp.path()).await;
        std::fs::write(host.local_path("/tmp/hello.txt"), b"hello world").unwrap();

        let ok = verify(
            session.as_ref(),
            &HELLO_MD5.to_uppercase(),
            HashAlgorithm::Md5,
            "/tmp/hello.txt",
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(ok.matched);

        let bad = verify(
            session.as_ref(),
            "5eb63bbbe01eeed093cb22bb8f5acdc4",
            HashAlgorithm::Md5,
            "/tmp/hello.txt",
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(!bad.matched);
        assert_eq!(bad.remote, HELLO_MD5);
    }

    #[tokio::test]
    async fn missing_remote_file_is_an_error() {
        let temp = tempdir().unwrap();
        let (_host, session) = simulated_session(temp.path()).await;

        let err = verify(
            session.as_ref(),
            HELLO_MD5,
            HashAlgorithm::Md5,
            "/tmp/missing.zip",
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FerryError::RemoteCommandFailure { .. }));
    }
}
