//! The persisted unit of knowledge per roll number and the keyed collection
//! holding all of them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Passed,
    Failed,
    /// Processing failed for this roll. Not a real result, retried next run.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub roll: String,
    pub status: Outcome,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub personal_details: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultRecord {
    pub fn passed(
        roll: impl Into<String>,
        position: impl Into<String>,
        subject: impl Into<String>,
        personal_details: BTreeMap<String, String>,
    ) -> Self {
        Self {
            roll: roll.into(),
            status: Outcome::Passed,
            position: Some(position.into()),
            subject: Some(subject.into()),
            personal_details,
            error: None,
        }
    }

    pub fn failed(roll: impl Into<String>) -> Self {
        Self {
            roll: roll.into(),
            status: Outcome::Failed,
            position: None,
            subject: None,
            personal_details: BTreeMap::new(),
            error: None,
        }
    }

    pub fn error(roll: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            roll: roll.into(),
            status: Outcome::Error,
            position: None,
            subject: None,
            personal_details: BTreeMap::new(),
            error: Some(info.into()),
        }
    }

    /// PASSED and FAILED are final. ERROR records keep the roll pending.
    pub fn is_settled(&self) -> bool {
        self.status != Outcome::Error
    }
}

/// Records keyed by roll, kept in first-insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Store {
    records: Vec<ResultRecord>,
    index: HashMap<String, usize>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from a raw list. A later duplicate replaces an earlier one.
    pub fn from_records(records: Vec<ResultRecord>) -> Self {
        let mut store = Self::with_capacity(records.len());
        store.extend(records);
        store
    }

    fn with_capacity(cap: usize) -> Self {
        Self {
            records: Vec::with_capacity(cap),
            index: HashMap::with_capacity(cap),
        }
    }

    /// Insert or replace by roll. Returns `true` if the roll was new.
    pub fn upsert(&mut self, record: ResultRecord) -> bool {
        match self.index.get(&record.roll) {
            Some(&i) => {
                self.records[i] = record;
                false
            }
            None => {
                self.index.insert(record.roll.clone(), self.records.len());
                self.records.push(record);
                true
            }
        }
    }

    pub fn get(&self, roll: &str) -> Option<&ResultRecord> {
        self.index.get(roll).map(|&i| &self.records[i])
    }

    pub fn contains(&self, roll: &str) -> bool {
        self.index.contains_key(roll)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    /// Rolls that already reached PASSED or FAILED.
    pub fn settled_rolls(&self) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .filter(|r| r.is_settled())
            .map(|r| r.roll.as_str())
    }
}

impl Extend<ResultRecord> for Store {
    fn extend<T: IntoIterator<Item = ResultRecord>>(&mut self, iter: T) {
        for record in iter {
            self.upsert(record);
        }
    }
}
