use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

const SOURCE_DIR: &str = "src";

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed={}", SOURCE_DIR);

    let sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=KEYSERVER_CONN_GIT_SHA={}", sha);

    let root = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => return,
    };
    let mut files = Vec::new();
    walk_directory(&root.join(SOURCE_DIR), &mut files);

    let mut violations = Vec::new();
    for file in &files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        let rel = file.strip_prefix(&root).unwrap_or(file).display().to_string();
        check_line_limit(&rel, &content, &mut violations);
        check_dead_code_allows(&rel, &content, &mut violations);
        check_test_functions(&rel, &content, &mut violations);
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("SOURCE CHECKS FAILED");
        eprintln!("========================================");
        for violation in &violations {
            eprintln!("  {}", violation);
        }
        eprintln!("========================================\n");
        panic!("Build failed: {} source check violation(s)", violations.len());
    }
}

fn walk_directory(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_directory(&path, files);
        } else if path.extension().and_then(|e| e.to_str()) == Some("rs") {
            files.push(path);
        }
    }
}

fn check_line_limit(rel: &str, content: &str, violations: &mut Vec<String>) {
    let count = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count();
    if count > MAX_LINES {
        violations.push(format!(
            "{} - {} lines (max {}); split it into smaller modules",
            rel, count, MAX_LINES
        ));
    }
}

fn check_dead_code_allows(rel: &str, content: &str, violations: &mut Vec<String>) {
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
            && trimmed.contains("dead_code")
        {
            violations.push(format!(
                "{}:{} - #[allow(dead_code)] is not allowed, delete the unused code",
                rel,
                idx + 1
            ));
        }
    }
}

/// Flags tests that silently skip and tests that mutate the environment
/// without `#[serial]`.
fn check_test_functions(rel: &str, content: &str, violations: &mut Vec<String>) {
    let lines: Vec<&str> = content.lines().collect();
    let mut idx = 0;
    while idx < lines.len() {
        let trimmed = lines[idx].trim();
        if trimmed != "#[test]" && !trimmed.starts_with("#[tokio::test") {
            idx += 1;
            continue;
        }

        let mut has_serial = false;
        let mut start = idx + 1;
        while start < lines.len() && !lines[start].contains("fn ") {
            let attr = lines[start].trim();
            if attr == "#[serial]" || attr == "#[serial_test::serial]" {
                has_serial = true;
            }
            start += 1;
        }
        if idx > 0 {
            let prev = lines[idx - 1].trim();
            if prev == "#[serial]" || prev == "#[serial_test::serial]" {
                has_serial = true;
            }
        }

        let mut depth = 0i32;
        let mut end = start;
        while end < lines.len() {
            let body = lines[end].trim();
            depth += body.matches('{').count() as i32;
            depth -= body.matches('}').count() as i32;
            if body.contains("skipping test") || body.contains("Skipping test") {
                violations.push(format!("{}:{} - test skips silently", rel, end + 1));
            }
            if body == "return;" && depth > 1 {
                violations.push(format!("{}:{} - conditional early return in test", rel, end + 1));
            }
            if !has_serial && body.contains("env::set_var") && !body.starts_with("//") {
                violations.push(format!("{}:{} - env mutation without #[serial]", rel, end + 1));
            }
            if depth <= 0 && end > start {
                break;
            }
            end += 1;
        }
        idx = end + 1;
    }
}
