use std::collections::BTreeSet;
use std::path::Path;

use crate::persist::StoreFile;
use crate::record::Store;
use crate::{Error, Result};

/// Every roll we know about, and what's already on disk.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub all: BTreeSet<String>,
    pub store: Store,
}

impl Registry {
    /// The roll list is required. The store may be missing or corrupt, in
    /// which case the run starts from an empty one.
    pub async fn load(rolls_path: &Path, store_file: &StoreFile) -> Result<Self> {
        let all = load_rolls(rolls_path).await?;
        let store = store_file.load().await;
        tracing::info!(
            rolls = all.len(),
            stored = store.len(),
            "Loaded roll numbers and existing results"
        );
        Ok(Self { all, store })
    }

    pub fn pending(&self) -> Vec<String> {
        pending(&self.all, &self.store)
    }
}

/// Sorted rolls without a PASSED or FAILED record. ERROR records stay pending.
pub fn pending(all: &BTreeSet<String>, store: &Store) -> Vec<String> {
    let settled: BTreeSet<&str> = store.settled_rolls().collect();
    all.iter()
        .filter(|roll| !settled.contains(roll.as_str()))
        .cloned()
        .collect()
}

/// Reads a JSON array of roll numbers.
pub async fn load_rolls(path: &Path) -> Result<BTreeSet<String>> {
    let raw = tokio::fs::read(path).await.map_err(|e| {
        Error::Config(format!("Failed to load roll numbers from {}: {e}", path.display()))
    })?;
    let rolls: Vec<String> = serde_json::from_slice(&raw).map_err(|e| {
        Error::Config(format!("Malformed roll list {}: {e}", path.display()))
    })?;
    Ok(rolls.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ResultRecord;

    fn rolls(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pending_is_sorted_difference() {
        let store = Store::from_records(vec![ResultRecord::failed("A")]);
        assert_eq!(pending(&rolls(&["C", "A", "B"]), &store), vec!["B", "C"]);
    }

    #[test]
    fn error_records_are_still_pending() {
        let store = Store::from_records(vec![
            ResultRecord::failed("A"),
            ResultRecord::error("B", "Empty response"),
        ]);
        assert_eq!(pending(&rolls(&["A", "B", "C"]), &store), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn missing_or_malformed_roll_list_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_rolls(&dir.path().join("all_rolls.json")).await;
        assert!(matches!(missing, Err(Error::Config(_))));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, br#"{"rolls": 1}"#).unwrap();
        assert!(matches!(load_rolls(&path).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn corrupt_store_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let rolls_path = dir.path().join("all_rolls.json");
        std::fs::write(&rolls_path, br#"["2", "1", "2"]"#).unwrap();
        let store_path = dir.path().join("all_results.json");
        std::fs::write(&store_path, b"[{ truncated").unwrap();

        let registry = Registry::load(&rolls_path, &StoreFile::new(store_path))
            .await
            .unwrap();
        assert!(registry.store.is_empty());
        assert_eq!(registry.pending(), vec!["1", "2"]);
    }
}
