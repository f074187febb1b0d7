// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Safety rules enforced by the executor, not by individual handlers:
//! path confinement to the project root, destructive shell-command
//! rejection, and private-address blocking for outbound HTTP.

use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

// ─── Path sanitization ────────────────────────────────────────────────────────

/// Resolve a model-supplied path against the project root.
///
/// - Relative paths are joined to the root and lexically normalized.
/// - Absolute paths inside the root are kept.
/// - Absolute paths outside the root are replaced with their basename under
///   the root.
/// - A doubled project root (the root's folder name appended once more,
///   a drift pattern small models produce constantly) is collapsed.
/// - `..` traversal that would escape the root falls back to the basename.
pub fn sanitize_path(project_root: &Path, raw: &str) -> PathBuf {
    let raw = raw.trim();
    let candidate = Path::new(raw);

    let relative: PathBuf = if candidate.is_absolute() {
        match candidate.strip_prefix(project_root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => return project_root.join(basename_of(raw)),
        }
    } else {
        candidate.to_path_buf()
    };

    let mut relative = normalize_components(&relative);
    if relative.is_none() {
        // Escaped the root via `..`.
        return project_root.join(basename_of(raw));
    }

    // Collapse "myproj/src/a.rs" under root ".../myproj" → "src/a.rs".
    if let (Some(rel), Some(root_name)) = (&relative, project_root.file_name()) {
        if rel.components().next() == Some(Component::Normal(root_name)) {
            let stripped: PathBuf = rel.components().skip(1).collect();
            if !stripped.as_os_str().is_empty() {
                relative = Some(stripped);
            }
        }
    }

    match relative {
        Some(rel) if !rel.as_os_str().is_empty() => project_root.join(rel),
        _ => project_root.to_path_buf(),
    }
}

fn basename_of(raw: &str) -> String {
    Path::new(raw)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

/// Lexically resolve `.` and `..`.  Returns `None` when the path climbs
/// above its starting point.
fn normalize_components(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(p) => out.push(p),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(out)
}

// ─── Shell sanitization ───────────────────────────────────────────────────────

static DESTRUCTIVE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"(?i)\brm\s+(-\w+\s+)*-\w*[rf]\w*\s+(/|/\*|~|\$HOME)(\s|$|;)",
            "recursive delete of a root directory",
        ),
        (r"(?i)\bmkfs(\.\w+)?\b", "filesystem format"),
        (r"(?i)\b(shutdown|poweroff|halt)\b", "system shutdown"),
        (r":\s*\(\s*\)\s*\{[^}]*:\s*\|\s*:\s*&[^}]*\}\s*;?\s*:", "fork bomb"),
        (
            r"(?i)\b(curl|wget)\b[^|;]*\|\s*(sudo\s+)?(ba|z|da|fi)?sh\b",
            "pipe from the network into a shell",
        ),
        (r"(?i)\bdd\b[^;|]*\bof=/dev/", "raw write to a block device"),
        (r"(?i)\bdel\s+/s\b.*\b[a-z]:\\?(\s|$)", "recursive delete of a drive root"),
        (r">\s*/dev/sd[a-z]", "redirect onto a block device"),
    ]
    .iter()
    .map(|(pat, why)| (Regex::new(pat).expect("destructive pattern must compile"), *why))
    .collect()
});

/// Check a shell command against the destructive-pattern list.
/// Returns the human-readable reason when the command must be rejected.
pub fn destructive_command(command: &str) -> Option<&'static str> {
    DESTRUCTIVE_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(command))
        .map(|(_, why)| *why)
}

// ─── SSRF blocking ────────────────────────────────────────────────────────────

/// Reject URLs that resolve into private or link-local address space.
///
/// Covers the RFC 1918 ranges, loopback, link-local (169.254/16, the cloud
/// metadata range), `metadata.google.internal`, and literal `0.0.0.0`.
/// Hostname-based targets other than the known metadata names pass; DNS
/// rebinding defense belongs to the host's transport layer.
pub fn ssrf_block(raw_url: &str) -> Option<String> {
    let parsed = match url::Url::parse(raw_url) {
        Ok(u) => u,
        Err(_) => return Some(format!("unparseable URL: {raw_url}")),
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return Some(format!("scheme '{}' is not allowed", parsed.scheme()));
    }
    let host = match parsed.host_str() {
        Some(h) => h,
        None => return Some("URL has no host".to_string()),
    };

    let lowered = host.to_ascii_lowercase();
    if lowered == "localhost"
        || lowered.ends_with(".localhost")
        || lowered == "metadata.google.internal"
    {
        return Some(format!("host '{host}' is private"));
    }

    let ip = lowered
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok();
    if let Some(ip) = ip {
        if is_private_ip(&ip) {
            return Some(format!("address {ip} is in a private range"));
        }
    }
    None
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            v4.is_loopback()
                || v4.is_unspecified()
                || a == 10
                || (a == 172 && (16..=31).contains(&b))
                || (a == 192 && b == 168)
                || (a == 169 && b == 254)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
