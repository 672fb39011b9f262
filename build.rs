//! Build script for the fleet console
//!
//! Stamps git and toolchain details into `FLEET_*` compile-time variables
//! read by `src/version.rs`.

use std::env;
use std::process::Command;

const UNKNOWN: &str = "unknown";

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_dirty = match run("git", &["status", "--porcelain"]) {
        Some(status) if !status.is_empty() => "true",
        Some(_) => "false",
        None => UNKNOWN,
    };

    let stamps = [
        ("GIT_HASH", run_or_unknown("git", &["rev-parse", "--short=8", "HEAD"])),
        ("GIT_BRANCH", run_or_unknown("git", &["rev-parse", "--abbrev-ref", "HEAD"])),
        ("GIT_DIRTY", git_dirty.to_string()),
        (
            "BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("TARGET", cargo_var("TARGET")),
        ("HOST", cargo_var("HOST")),
        ("PROFILE", cargo_var("PROFILE")),
        ("RUSTC_VERSION", run_or_unknown("rustc", &["--version"])),
    ];

    for (key, value) in &stamps {
        println!("cargo:rustc-env=FLEET_{}={}", key, value);
    }
}

/// Trimmed stdout of a successful command
fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}

fn run_or_unknown(program: &str, args: &[&str]) -> String {
    run(program, args).unwrap_or_else(|| UNKNOWN.to_string())
}

fn cargo_var(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| UNKNOWN.to_string())
}
