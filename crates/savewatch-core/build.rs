use std::process::Command;

const SHA_VAR: &str = "SAVEWATCH_GIT_SHA";

/// Commit id baked into `savewatch_core::VERSION`.
///
/// Packagers building from a tarball can pin it through the environment.
fn build_sha() -> String {
    if let Ok(pinned) = std::env::var(SHA_VAR)
        && !pinned.trim().is_empty()
    {
        return pinned.trim().to_string();
    }

    let Ok(out) = Command::new("git")
        .args(["rev-parse", "--short=10", "HEAD"])
        .output()
    else {
        return "nogit".into();
    };
    match String::from_utf8(out.stdout) {
        Ok(sha) if out.status.success() && !sha.trim().is_empty() => sha.trim().to_string(),
        _ => "nogit".into(),
    }
}

fn main() {
    println!("cargo:rustc-env={SHA_VAR}={}", build_sha());
    println!("cargo:rerun-if-env-changed={SHA_VAR}");
    for watched in ["HEAD", "refs/heads"] {
        println!("cargo:rerun-if-changed=../../.git/{watched}");
    }
}
