//! # Secrets-at-Rest Decryption
//!
//! Walks a checkout (honoring `.gitignore`) and decrypts every encrypted
//! file in place before the compose loader sees it, using the `sops` binary.
//! A decryption failure is fatal for the stack: deploying a file full of
//! `ENC[...]` blobs is worse than failing loudly.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::JobError;

/// Files above this size are never encrypted config files; skip them
const MAX_CANDIDATE_SIZE: u64 = 1_048_576;

/// Check whether file content carries the encryption marker.
///
/// Encrypted files have a distinctive structure:
/// - YAML files carry a top-level `sops:` mapping
/// - JSON files carry a root `"sops"` key
/// - dotenv files carry `sops_version` metadata or `ENC[AES256_GCM,...]` values
pub fn is_encrypted(content: &str) -> bool {
    if let Ok(yaml) = serde_yaml::from_str::<serde_yaml::Value>(content) {
        if yaml
            .as_mapping()
            .and_then(|m| m.get(serde_yaml::Value::String("sops".to_string())))
            .is_some()
        {
            return true;
        }
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(content) {
        if json.get("sops").is_some() {
            return true;
        }
    }

    if content.contains("sops_version") {
        return true;
    }

    content.contains("ENC[") && content.contains("AES256_GCM")
}

/// Decrypt every encrypted file below `root` in place.
///
/// Returns the number of files decrypted. Files ignored by `.gitignore`
/// never reach the detector, so local build artifacts cannot break a deploy.
pub async fn decrypt_repo_files(root: &Path) -> Result<usize, JobError> {
    let mut candidates = Vec::new();
    for entry in ignore::WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .build()
        .flatten()
    {
        let path = entry.path().to_path_buf();
        if !path.is_file() || path.components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        if entry
            .metadata()
            .map(|m| m.len() > MAX_CANDIDATE_SIZE)
            .unwrap_or(true)
        {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            // Binary file
            continue;
        };
        if is_encrypted(&content) {
            candidates.push(path);
        }
    }

    if candidates.is_empty() {
        return Ok(0);
    }

    let sops = which::which("sops").map_err(|_| {
        JobError::DecryptFailed("encrypted files present but no sops binary found".to_string())
    })?;

    for path in &candidates {
        debug!(path = %path.display(), "decrypting file");
        let output = Command::new(&sops)
            .arg("--decrypt")
            .arg(path)
            .output()
            .await
            .map_err(|e| JobError::DecryptFailed(format!("{}: {e}", path.display())))?;
        if !output.status.success() {
            return Err(JobError::DecryptFailed(format!(
                "{}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        std::fs::write(path, &output.stdout)
            .map_err(|e| JobError::DecryptFailed(format!("{}: {e}", path.display())))?;
    }

    info!(count = candidates.len(), "decrypted files in checkout");
    Ok(candidates.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_yaml_marker() {
        let content = "data: ENC[AES256_GCM,data:xxx,type:str]\nsops:\n  version: 3.8.1\n";
        assert!(is_encrypted(content));
    }

    #[test]
    fn test_detects_json_marker() {
        let content = r#"{"data": "x", "sops": {"version": "3.8.1"}}"#;
        assert!(is_encrypted(content));
    }

    #[test]
    fn test_detects_dotenv_marker() {
        assert!(is_encrypted(
            "DB_PASSWORD=ENC[AES256_GCM,data:abc,iv:def,tag:ghi,type:str]\n"
        ));
        assert!(is_encrypted("sops_version=3.8.1\n"));
    }

    #[test]
    fn test_plain_files_pass_through() {
        assert!(!is_encrypted("services:\n  web:\n    image: nginx\n"));
        assert!(!is_encrypted("DB_PASSWORD=plaintext\n"));
        assert!(!is_encrypted(r#"{"services": {}}"#));
    }

    #[tokio::test]
    async fn test_walk_without_encrypted_files_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("compose.yaml"), "services: {}\n").unwrap();
        // No sops binary required when nothing is encrypted
        let count = decrypt_repo_files(tmp.path()).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_gitignored_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        // `ignore` only honors .gitignore when a .git directory is present,
        // matching the real checkouts this function always runs against.
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".gitignore"), "ignored.env\n").unwrap();
        std::fs::write(
            tmp.path().join("ignored.env"),
            "X=ENC[AES256_GCM,data:abc,type:str]\n",
        )
        .unwrap();
        let count = decrypt_repo_files(tmp.path()).await.unwrap();
        assert_eq!(count, 0);
    }
}
