use std::env;
use std::process::Command;

// Exposes the short commit hash as DMREVAL_GIT_SHA so reports can carry it.
fn git_sha() -> Option<String> {
    if let Ok(sha) = env::var("DMREVAL_GIT_SHA") {
        let sha = sha.trim().to_string();
        return if sha.is_empty() { None } else { Some(sha) };
    }

    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() { None } else { Some(sha) }
}

fn main() {
    println!("cargo:rerun-if-env-changed=DMREVAL_GIT_SHA");
    println!("cargo:rerun-if-changed=.git/HEAD");

    if let Some(sha) = git_sha() {
        println!("cargo:rustc-env=DMREVAL_GIT_SHA={}", sha);
    }
}
