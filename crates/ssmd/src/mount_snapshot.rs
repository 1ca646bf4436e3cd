//! Mount Snapshot: parses `findmnt -P` output into [`MountSnapshotEntry`]
//! values (spec Section 6, Section 2 item 7).

use crate::mount_service::SnapshotProvider;
use ssm_core::MountSnapshotEntry;
use std::process::Stdio;
use tokio::process::Command;

/// Parse one `findmnt -P` line of `KEY="value"` pairs into ordered
/// key/value pairs, honoring the odd-trailing-backslash-means-escaped
/// quote rule.
fn parse_kv_line(line: &str) -> Vec<(String, String)> {
    let bytes = line.as_bytes();
    let mut pairs = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let key = line[key_start..i].to_string();
        i += 1;
        if i >= bytes.len() || bytes[i] != b'"' {
            break;
        }
        i += 1;
        let val_start = i;
        loop {
            if i >= bytes.len() {
                break;
            }
            if bytes[i] == b'"' {
                let mut backslashes = 0;
                let mut j = i;
                while j > val_start && bytes[j - 1] == b'\\' {
                    backslashes += 1;
                    j -= 1;
                }
                if backslashes % 2 == 0 {
                    break;
                }
            }
            i += 1;
        }
        let raw_value = line.get(val_start..i).unwrap_or("");
        pairs.push((key, decode_escapes(raw_value)));
        i += 1;
    }

    pairs
}

/// Decode `\NNN` octal and `\xHH` hex byte escapes; any other `\c`
/// sequence decodes to the literal character `c`.
fn decode_escapes(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let next = bytes[i + 1];
            if next == b'x' && i + 3 < bytes.len() && is_hex(bytes[i + 2]) && is_hex(bytes[i + 3]) {
                if let Ok(v) = u8::from_str_radix(&raw[i + 2..i + 4], 16) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
            if is_octal(next)
                && i + 3 < bytes.len()
                && is_octal(bytes[i + 2])
                && is_octal(bytes[i + 3])
            {
                if let Ok(v) = u8::from_str_radix(&raw[i + 1..i + 4], 8) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
            out.push(next);
            i += 2;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_hex(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

fn is_octal(b: u8) -> bool {
    (b'0'..=b'7').contains(&b)
}

fn extract_identity(source: &str, options: &str) -> String {
    if !source.is_empty() {
        return source.to_string();
    }
    options
        .split(',')
        .find_map(|opt| opt.strip_prefix("fsname="))
        .unwrap_or_default()
        .to_string()
}

/// Parse the full stdout of `findmnt -P -o TARGET,FSTYPE,SOURCE,OPTIONS`.
/// Collisions on the same mountpoint resolve to the first-seen entry.
pub fn parse_snapshot(stdout: &str) -> Vec<MountSnapshotEntry> {
    let mut entries: Vec<MountSnapshotEntry> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let pairs = parse_kv_line(line);
        let mut target = String::new();
        let mut fstype = String::new();
        let mut source = String::new();
        let mut options = String::new();
        for (key, value) in pairs {
            match key.as_str() {
                "TARGET" => target = value,
                "FSTYPE" => fstype = value,
                "SOURCE" => source = value,
                "OPTIONS" => options = value,
                _ => {}
            }
        }
        if target.is_empty() || !seen.insert(target.clone()) {
            continue;
        }
        entries.push(MountSnapshotEntry {
            mountpoint: target,
            fstype,
            identity: extract_identity(&source, &options),
        });
    }

    entries
}

/// Shell out to `findmnt -P -o TARGET,FSTYPE,SOURCE,OPTIONS` and parse the
/// result.
pub async fn take_snapshot() -> std::io::Result<Vec<MountSnapshotEntry>> {
    let output = Command::new("findmnt")
        .args(["-P", "-o", "TARGET,FSTYPE,SOURCE,OPTIONS"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    Ok(parse_snapshot(&String::from_utf8_lossy(&output.stdout)))
}

/// Production [`SnapshotProvider`] backed by the real `findmnt` binary.
pub struct FindmntSnapshotProvider;

#[async_trait::async_trait]
impl SnapshotProvider for FindmntSnapshotProvider {
    async fn snapshot(&self) -> std::io::Result<Vec<MountSnapshotEntry>> {
        take_snapshot().await
    }
}
