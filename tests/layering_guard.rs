//! Layering guardrails to keep the boundary vocabulary crate free of host machinery.
//!
//! `testhost_core` is linked by both sides of an isolated context. It may not depend on the `testhost` crate, on
//! CLI or subscriber crates, or on tokio's process support. This test scans its `Cargo.toml` `[dependencies]`.

const FORBIDDEN: &[&str] = &["testhost ", "testhost=", "clap", "tracing-subscriber", "toml"];

fn dependency_lines(manifest: &str) -> Vec<String> {
    let mut in_dependencies = false;
    let mut lines = Vec::new();

    for raw_line in manifest.lines() {
        let line = raw_line.trim();
        // Track when we enter/exit the `[dependencies]` table.
        if line.starts_with('[') {
            in_dependencies = line == "[dependencies]";
            continue;
        }
        if !in_dependencies || line.is_empty() || line.starts_with('#') {
            continue;
        }
        // Strip inline comments for robustness.
        let line_no_comment = line.split('#').next().unwrap_or("").trim();
        lines.push(line_no_comment.to_string());
    }
    lines
}

#[test]
fn core_does_not_depend_on_host_machinery() {
    let manifest = include_str!("../crates/testhost_core/Cargo.toml");
    for line in dependency_lines(manifest) {
        for forbidden in FORBIDDEN {
            assert!(
                !line.starts_with(forbidden),
                "`{forbidden}` must not appear in testhost_core [dependencies]: {line}"
            );
        }
        if line.starts_with("tokio ") || line.starts_with("tokio=") {
            assert!(
                !line.contains("\"process\"") && !line.contains("\"full\""),
                "testhost_core must not spawn processes"
            );
        }
    }
}

#[test]
fn host_depends_on_core_by_path() {
    let manifest = include_str!("../Cargo.toml");
    let lines = dependency_lines(manifest);
    assert!(
        lines.iter().any(|l| l.starts_with("testhost_core") && l.contains("crates/testhost_core")),
        "the root crate must use the workspace copy of testhost_core"
    );
}
