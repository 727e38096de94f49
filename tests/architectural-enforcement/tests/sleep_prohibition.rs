//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the eventcast crates MUST NOT call sleep
//! methods. Backoff waits on a deadline (`sleep_until`) and sweeps tick on
//! `tokio::time::interval_at`.
//! **Exceptions**: test code

use std::fs;
use std::path::Path;

use architectural_enforcement::{workspace_path, PRODUCTION_DIRS};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();
    for dir in PRODUCTION_DIRS {
        let path = workspace_path(dir);
        assert!(path.exists(), "missing source directory {}", path.display());
        check_directory(&path, &mut violations);
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE:");
        eprintln!("  - tokio::time::sleep_until(deadline) for scheduled reconnects");
        eprintln!("  - tokio::time::interval for periodic sweeps");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions)");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn check_directory(path: &Path, violations: &mut Vec<String>) {
    for entry in walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
            check_file(entry.path(), violations);
        }
    }
}

fn check_file(path: &Path, violations: &mut Vec<String>) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    let lines: Vec<&str> = content.lines().collect();

    for idx in find_sleep_calls(&lines) {
        violations.push(format!(
            "{}:{} - {}",
            path.display(),
            idx + 1,
            lines[idx].trim()
        ));
    }
}

/// Line indices of sleep calls outside test code
fn find_sleep_calls(lines: &[&str]) -> Vec<usize> {
    let test_module = lines
        .iter()
        .position(|l| l.trim() == "#[cfg(test)]")
        .unwrap_or(lines.len());

    lines
        .iter()
        .enumerate()
        .take(test_module)
        .filter(|(_, line)| {
            let code = line.split("//").next().unwrap_or(line);
            code.contains("::sleep(") || code.contains(".sleep(")
        })
        .filter(|(idx, _)| !is_in_test_function(lines, *idx))
        .map(|(idx, _)| idx)
        .collect()
}

/// Check if line is inside a test function
fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    for line in lines[..current_idx].iter().rev().map(|l| l.trim()) {
        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }
        if (line.starts_with("fn ") || line.starts_with("async fn ") || line.starts_with("pub "))
            && !line.contains("test")
        {
            return false;
        }
        if line.starts_with("mod ") || line.starts_with("impl ") {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_violation_detection() {
        let code = vec![
            "async fn poll() {",
            "    tokio::time::sleep(Duration::from_millis(10)).await;",
            "}",
        ];
        assert_eq!(find_sleep_calls(&code), vec![1]);
    }

    #[test]
    fn test_deadline_wait_is_allowed() {
        let code = vec![
            "fn schedule(deadline: Instant) {",
            "    tokio::time::sleep_until(deadline).await;",
            "}",
        ];
        assert!(find_sleep_calls(&code).is_empty());
    }

    #[test]
    fn test_test_module_is_skipped() {
        let code = vec![
            "fn real() {}",
            "#[cfg(test)]",
            "mod tests {",
            "    async fn helper() { tokio::time::sleep(d).await; }",
            "}",
        ];
        assert!(find_sleep_calls(&code).is_empty());
    }
}
