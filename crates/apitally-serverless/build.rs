// Exports the compiler version for the startup metadata
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=RUSTC");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .and_then(|stdout| parse_version(&stdout))
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=APITALLY_RUSTC_VERSION={version}");
}

/// `rustc 1.75.0 (82e1608df 2023-12-21)` -> `1.75.0`
fn parse_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
}
