use std::process::Command;

// the short commit id ends up in the version string the extended handshake
// advertises to peers
fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    let commit = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|commit| commit.trim().to_string())
        .filter(|commit| !commit.is_empty())
        .unwrap_or_else(|| "unreleased".to_string());

    println!("cargo:rustc-env=UNDERTOW_BUILD_COMMIT={commit}");
}
