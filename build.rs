use std::process::Command;

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8(output.stdout).ok()?;
    Some(revision.trim().to_string())
}

fn main() {
    let built = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let revision = git_revision().unwrap_or_else(|| "unknown".to_string());

    // shown by `socketace --version`
    println!(
        "cargo:rustc-env=SOCKETACE_LONG_VERSION={} ({} built {})",
        env!("CARGO_PKG_VERSION"),
        revision,
        built
    );
    println!("cargo:rerun-if-changed=.git/HEAD");
}
