//! Stamps the binary with the commit and build time shown by `--version`.

use std::process::Command;

fn git_commit() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8(output.stdout).ok()?;
    Some(commit.trim().to_string()).filter(|c| !c.is_empty())
}

fn main() {
    let commit = git_commit().unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=BURROW_COMMIT={commit}");
    println!(
        "cargo:rustc-env=BURROW_BUILD_TIME={}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
}
