//! One HAProxy pattern map.
//!
//! HAProxy evaluates map entries in list order and the first matching
//! regular expression wins, so entry order is part of correctness: a
//! general host pattern listed before a more specific one shadows it.
//! [`MapStore::sync_entries`] therefore rebuilds the whole list, sorts it
//! most-specific-first and swaps it in with one versioned
//! `prepare`/`add`/`commit` transaction.

use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

use super::client::{expect_success, Client};
use crate::error::DynconfError;

/// A map line. Keys may repeat; `id` is what identifies an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug)]
pub struct MapStore {
    client: Arc<Client>,
    name: String,
    entries: Vec<MapEntry>,
    dirty: bool,
}

impl MapStore {
    pub(crate) const fn new(client: Arc<Client>, name: String) -> Self {
        Self {
            client,
            name,
            entries: Vec::new(),
            dirty: true,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn refresh(&mut self) -> Result<(), DynconfError> {
        let command = format!("show map {}", self.name);
        self.entries = self
            .client
            .run_command(&command, |r| parse_map_entries(&command, r))
            .await?;
        self.dirty = false;
        Ok(())
    }

    pub async fn entries(&mut self) -> Result<&[MapEntry], DynconfError> {
        if self.dirty {
            self.refresh().await?;
        }
        Ok(&self.entries)
    }

    pub async fn find(&mut self, key: &str) -> Result<Vec<MapEntry>, DynconfError> {
        Ok(self
            .entries()
            .await?
            .iter()
            .filter(|e| e.key == key)
            .cloned()
            .collect())
    }

    /// Append `key value`; with `replace`, every existing entry for `key`
    /// is deleted first.
    pub async fn add(&mut self, key: &str, value: &str, replace: bool) -> Result<(), DynconfError> {
        if replace {
            self.delete(key).await?;
        }
        let command = format!("add map {} {key} {value}", self.name);
        let response = self.client.execute(&command).await?;
        self.dirty = true;
        expect_success(&command, &response, &[])
    }

    /// Remove every entry whose key is `key`.
    pub async fn delete(&mut self, key: &str) -> Result<(), DynconfError> {
        for entry in self.find(key).await? {
            self.delete_entry(&entry.id).await?;
        }
        Ok(())
    }

    pub async fn delete_entry(&mut self, id: &str) -> Result<(), DynconfError> {
        let command = format!("del map {} #{id}", self.name);
        let response = self.client.execute(&command).await?;
        self.dirty = true;
        expect_success(&command, &response, &[])
    }

    /// Merge `proposed` into the current content (adding or removing the
    /// mentioned keys) and atomically replace the live map with the
    /// specificity-ordered result.
    pub async fn sync_entries(
        &mut self,
        proposed: &[(String, String)],
        add: bool,
    ) -> Result<(), DynconfError> {
        let client = Arc::clone(&self.client);
        let _guard = client.lock_transaction().await;

        self.refresh().await?;
        let merged = merge_entries(&self.entries, proposed, add);

        let prepare = format!("prepare map {}", self.name);
        let version = self
            .client
            .run_command(&prepare, |r| parse_prepared_version(&prepare, r))
            .await?;

        // Marked dirty before the upload: a failure part-way leaves the live
        // content unknown.
        self.dirty = true;

        if !merged.is_empty() {
            let mut upload = format!("add map @{version} {} <<\n", self.name);
            for (key, value) in &merged {
                // write! to String is infallible
                let _ = writeln!(upload, "{key} {value}");
            }
            let response = self.client.execute(&upload).await?;
            expect_success(&upload, &response, &[])?;
        }

        let commit = format!("commit map @{version} {}", self.name);
        let response = self.client.execute(&commit).await?;
        expect_success(&commit, &response, &[])?;

        tracing::debug!(
            map = %self.name,
            version = %version,
            entries = merged.len(),
            added = add,
            "map content replaced"
        );
        Ok(())
    }
}

/// Merge the current entries with `proposed`: untouched keys are kept,
/// mentioned keys are dropped and, when `add` is set, re-added with their
/// proposed value. The result is ordered by [`sort_by_specificity`].
#[must_use]
pub fn merge_entries(
    current: &[MapEntry],
    proposed: &[(String, String)],
    add: bool,
) -> Vec<(String, String)> {
    let mentioned: HashSet<&str> = proposed.iter().map(|(k, _)| k.as_str()).collect();

    let mut merged: Vec<(String, String)> = current
        .iter()
        .filter(|e| !mentioned.contains(e.key.as_str()))
        .map(|e| (e.key.clone(), e.value.clone()))
        .collect();

    if add {
        let mut seen = HashSet::new();
        // Last proposal for a repeated key wins.
        for (key, value) in proposed.iter().rev() {
            if seen.insert(key.as_str()) {
                merged.push((key.clone(), value.clone()));
            }
        }
        let added = merged.len() - seen.len();
        merged[added..].reverse();
    }

    sort_by_specificity(&mut merged);
    merged
}

/// Stable sort, most literal dots first. Entries with equal counts keep
/// their relative order.
pub fn sort_by_specificity(entries: &mut [(String, String)]) {
    entries.sort_by_key(|(key, _)| std::cmp::Reverse(literal_dots(key)));
}

/// Count the dots in `pattern` that match a literal `.`: escaped dots
/// outside a character class, and bare dots that are not followed by a
/// quantifier (so plain host names count too).
#[must_use]
pub fn literal_dots(pattern: &str) -> usize {
    let chars: Vec<char> = pattern.chars().collect();
    let mut count = 0;
    let mut in_class = false;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                if !in_class && chars.get(i + 1) == Some(&'.') {
                    count += 1;
                }
                i += 2;
                continue;
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '.' if !in_class => {
                if !matches!(chars.get(i + 1), Some('*' | '+' | '?' | '{')) {
                    count += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    count
}

/// Parse `show map <name>`: `<id> <key> <value>` per line.
pub fn parse_map_entries(command: &str, response: &str) -> Result<Vec<MapEntry>, DynconfError> {
    let mut entries = Vec::new();
    for line in response.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, char::is_whitespace);
        match (fields.next(), fields.next(), fields.next()) {
            (Some(id), Some(key), Some(value)) => entries.push(MapEntry {
                id: id.to_string(),
                key: key.to_string(),
                value: value.trim().to_string(),
            }),
            _ => {
                return Err(DynconfError::UnexpectedResponse {
                    command: command.to_string(),
                    detail: format!("malformed map entry '{line}'"),
                });
            }
        }
    }
    Ok(entries)
}

/// Parse `prepare map`: `New version created: <n>`.
pub fn parse_prepared_version(command: &str, response: &str) -> Result<String, DynconfError> {
    response
        .trim()
        .strip_prefix("New version created:")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| DynconfError::UnexpectedResponse {
            command: command.to_string(),
            detail: response.trim().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, key: &str, value: &str) -> MapEntry {
        MapEntry {
            id: id.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    fn pair(key: &str, value: &str) -> (String, String) {
        (key.into(), value.into())
    }

    #[test]
    fn counts_literal_dots_in_host_patterns() {
        assert_eq!(literal_dots("route.test"), 1);
        assert_eq!(literal_dots("sub.route.test"), 2);
        assert_eq!(literal_dots(r"^a\.example\.com(:[0-9]+)?(/.*)?$"), 2);
        // The wildcard label is a character class, not a literal.
        assert_eq!(literal_dots(r"^[^\.]*\.example\.com(:[0-9]+)?(/.*)?$"), 2);
        assert_eq!(literal_dots(".*"), 0);
    }

    #[test]
    fn more_specific_sorts_first_regardless_of_insertion() {
        let one = merge_entries(&[], &[pair("sub.route.test", "A"), pair("route.test", "B")], true);
        let two = merge_entries(&[], &[pair("route.test", "B"), pair("sub.route.test", "A")], true);
        let expected = vec![pair("sub.route.test", "A"), pair("route.test", "B")];
        assert_eq!(one, expected);
        assert_eq!(two, expected);
    }

    #[test]
    fn equal_specificity_keeps_insertion_order() {
        let current = vec![entry("0x1", "b.test", "1"), entry("0x2", "a.test", "2")];
        let merged = merge_entries(&current, &[pair("c.test", "3")], true);
        assert_eq!(
            merged,
            vec![pair("b.test", "1"), pair("a.test", "2"), pair("c.test", "3")]
        );
    }

    #[test]
    fn adding_replaces_every_duplicate_of_a_key() {
        let current = vec![
            entry("0x1", "a.test", "old1"),
            entry("0x2", "a.test", "old2"),
            entry("0x3", "b.test", "keep"),
        ];
        let merged = merge_entries(&current, &[pair("a.test", "new")], true);
        assert_eq!(merged, vec![pair("b.test", "keep"), pair("a.test", "new")]);
    }

    #[test]
    fn removing_drops_mentioned_keys_only() {
        let current = vec![entry("0x1", "a.test", "1"), entry("0x2", "b.test", "2")];
        let merged = merge_entries(&current, &[pair("a.test", "ignored")], false);
        assert_eq!(merged, vec![pair("b.test", "2")]);
    }

    #[test]
    fn repeated_proposals_keep_the_last_value() {
        let merged = merge_entries(
            &[],
            &[pair("a.test", "1"), pair("b.test", "2"), pair("a.test", "3")],
            true,
        );
        assert_eq!(merged, vec![pair("b.test", "2"), pair("a.test", "3")]);
    }

    #[test]
    fn parses_entries_and_versions() {
        let entries = parse_map_entries(
            "show map x",
            "0x55d1 ^a\\.test(:[0-9]+)?(/.*)?$ be_http:ns:a\n0x55d2 ^b\\.test$ 1\n\n",
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "0x55d1");
        assert_eq!(entries[0].value, "be_http:ns:a");

        assert_eq!(
            parse_prepared_version("prepare map x", "New version created: 12\n").unwrap(),
            "12"
        );
        assert!(parse_prepared_version("prepare map x", "Unknown map identifier.").is_err());
        assert!(parse_map_entries("show map x", "0x1 lonely\n").is_err());
    }
}
