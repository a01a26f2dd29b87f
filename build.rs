//! Stamps build metadata into the binary so a running daemon can report
//! exactly which build it is. CI pipelines pin the values through the
//! `BUILD_*` environment variables; local builds fall back to the clock
//! and the state of the checkout.
//!
//! Git is driven as a command here, like everywhere else in this project,
//! so the build script links neither a git library nor a TLS stack.

use std::process::Command;

fn main() {
    let timestamp = env_override("BUILD_TIMESTAMP").unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
            .to_string()
    });

    let datetime = env_override("BUILD_DATETIME").unwrap_or_else(|| {
        chrono::Utc::now()
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string()
    });

    let git_hash = env_override("BUILD_GIT_HASH")
        .or_else(describe_checkout)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=BUILD_TIMESTAMP={timestamp}");
    println!("cargo:rustc-env=BUILD_DATETIME={datetime}");
    println!("cargo:rustc-env=BUILD_GIT_HASH={git_hash}");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=BUILD_TIMESTAMP");
    println!("cargo:rerun-if-env-changed=BUILD_DATETIME");
    println!("cargo:rerun-if-env-changed=BUILD_GIT_HASH");
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Short HEAD hash of the checkout, with a `-dirty` marker when tracked
/// files have local modifications. Untracked files are ignored; they don't
/// change what gets compiled.
fn describe_checkout() -> Option<String> {
    let head = git_stdout(&["rev-parse", "--short", "HEAD"])?;
    let modified = git_stdout(&["status", "--porcelain", "--untracked-files=no"])
        .map(|status| !status.is_empty())
        .unwrap_or(false);
    if modified {
        Some(format!("{head}-dirty"))
    } else {
        Some(head)
    }
}

fn git_stdout(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8(output.stdout).ok()?;
    Some(stdout.trim().to_string())
}
