//! Parsers for VBoxManage text output.
//!
//! VBoxManage prints two block shapes that matter here:
//!
//! ```text
//! showvminfo --machinereadable        showhdinfo / list hdds
//! name="web-01"                        UUID:           5d1c...
//! memory=1024                          Location:       /vms/web-01.vdi
//! "IDE Controller-0-0"="/vms/a.vdi"    In use by VMs:  web-01 (UUID: 9a3f...)
//! ```
//!
//! Neither shape is a stable schema across VirtualBox releases, so both
//! parsers skip lines they do not understand instead of failing.

use std::collections::BTreeMap;

/// Key whose value carries a trailing lock-state parenthesis.
const IN_USE_BY_VMS: &str = "in-use-by-vms";

/// Flat key/value view of one block of tool output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAttributes {
    values: BTreeMap<String, String>,
}

impl RawAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Get a value, treating empty strings as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Parse a numeric value, `None` when absent or garbled.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Like [`get_u64`](Self::get_u64), `None` when out of range.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = RawAttributes::new();
        for (k, v) in iter {
            attrs.insert(k, v);
        }
        attrs
    }
}

/// Parse `key=value` lines (`showvminfo --machinereadable`).
///
/// Splits on the first `=`, strips whitespace and quotes from both sides and
/// lowercases the key. Lines without `=` are skipped.
pub fn parse_machine_readable(text: &str) -> RawAttributes {
    let mut attrs = RawAttributes::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let key = strip_quoted(key).to_lowercase();
        if key.is_empty() {
            continue;
        }

        attrs.insert(key, strip_quoted(value));
    }

    attrs
}

/// Parse `key: value` lines (`showhdinfo`, one block of `list hdds`).
///
/// Keys are lowercased with every non-alphanumeric run collapsed to `-`.
pub fn parse_colon_block(text: &str) -> RawAttributes {
    let mut attrs = RawAttributes::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        let key = normalize_key(key);
        if key.is_empty() {
            continue;
        }

        let mut value = value.trim();
        if key == IN_USE_BY_VMS && value.ends_with(')') {
            value = &value[..value.len() - 1];
        }

        attrs.insert(key, value);
    }

    attrs
}

/// Split listing output into blocks separated by blank lines.
pub fn split_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                blocks.push(text[s..offset].trim());
            }
        } else if start.is_none() {
            start = Some(offset);
        }
        offset += line.len();
    }

    if let Some(s) = start {
        blocks.push(text[s..].trim());
    }

    blocks
}

/// Parse `list vms` output: one `"name" {uuid}` per line.
pub fn parse_vm_list(text: &str) -> Vec<(String, String)> {
    text.lines().filter_map(parse_vm_list_line).collect()
}

fn parse_vm_list_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    let name_start = line.find('"')?;
    let name_end = line.rfind('"')?;
    if name_end <= name_start {
        return None;
    }

    let rest = &line[name_end + 1..];
    let open = rest.find('{')?;
    let close = rest.rfind('}')?;
    if close <= open + 1 {
        return None;
    }

    Some((
        line[name_start + 1..name_end].to_string(),
        rest[open + 1..close].trim().to_string(),
    ))
}

/// Lowercase and collapse non-alphanumeric runs to a single `-`.
pub fn normalize_key(key: &str) -> String {
    let mut normalized = String::with_capacity(key.len());
    let mut in_separator = false;

    for c in key.trim().chars() {
        if c.is_alphanumeric() {
            normalized.extend(c.to_lowercase());
            in_separator = false;
        } else if !in_separator {
            normalized.push('-');
            in_separator = true;
        }
    }

    normalized
}

fn strip_quoted(s: &str) -> String {
    s.trim().trim_matches('"').trim().to_string()
}
