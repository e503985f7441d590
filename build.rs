//! Stamps the build with a revision for the startup logs.
//!
//! `CAPSIGHT_GIT_HASH` wins when set (release pipelines building from a
//! tarball have no `.git`); otherwise ask git, otherwise "unknown".

use std::env;
use std::process::Command;

const HASH_ENV: &str = "CAPSIGHT_GIT_HASH";

fn git_short_hash() -> Option<String> {
    let output = Command::new("git").args(["rev-parse", "--short=10", "HEAD"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!hash.is_empty()).then_some(hash)
}

fn main() {
    let git_hash = env::var(HASH_ENV)
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(git_short_hash)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_HASH={git_hash}");
    println!("cargo:rerun-if-env-changed={HASH_ENV}");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
