//! Predicate lookups over a partition.
//!
//! A [`Predicate`] is a conjunction of `field op value` clauses. Queries
//! return every matching guid in partition order and leave tie-breaking to
//! the caller.

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::guid::Guid;
use crate::host::TabId;
use crate::record::{Partition, RecordStore, TabRecord};

/// Record field a clause compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Guid,
    TabId,
    Index,
    Fingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Comparison operand.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Int(i64),
    Text(String),
}

impl From<i64> for Operand {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<TabId> for Operand {
    fn from(v: TabId) -> Self {
        Self::Int(v.0)
    }
}

impl From<&str> for Operand {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Operand {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&Guid> for Operand {
    fn from(v: &Guid) -> Self {
        Self::Text(v.as_str().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub field: Field,
    pub op: Op,
    pub value: Operand,
}

impl Clause {
    fn matches(&self, record: &TabRecord) -> bool {
        let actual = match self.field {
            Field::Guid => Operand::Text(record.guid.as_str().to_string()),
            Field::TabId => Operand::Int(record.tab_id.0),
            Field::Index => Operand::Int(record.index),
            Field::Fingerprint => Operand::Text(record.fingerprint.clone()),
        };

        // Int and Text never compare equal or ordered against each other.
        if std::mem::discriminant(&actual) != std::mem::discriminant(&self.value) {
            return false;
        }

        match self.op {
            Op::Eq => actual == self.value,
            Op::Ne => actual != self.value,
            Op::Gt => actual > self.value,
            Op::Ge => actual >= self.value,
            Op::Lt => actual < self.value,
            Op::Le => actual <= self.value,
        }
    }
}

/// Conjunction of clauses. An empty predicate matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub clauses: Vec<Clause>,
}

impl Predicate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: Field, op: Op, value: impl Into<Operand>) -> Self {
        self.clauses.push(Clause {
            field,
            op,
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn tab_id(self, tab_id: TabId) -> Self {
        self.with(Field::TabId, Op::Eq, tab_id)
    }

    #[must_use]
    pub fn index(self, index: i64) -> Self {
        self.with(Field::Index, Op::Eq, index)
    }

    #[must_use]
    pub fn fingerprint(self, fingerprint: &str) -> Self {
        self.with(Field::Fingerprint, Op::Eq, fingerprint)
    }

    #[must_use]
    pub fn matches(&self, record: &TabRecord) -> bool {
        self.clauses.iter().all(|clause| clause.matches(record))
    }
}

impl RecordStore {
    /// All guids in `partition` satisfying `predicate`, in partition order.
    #[must_use]
    pub fn select(&self, partition: Partition, predicate: &Predicate) -> Vec<Guid> {
        self.all(partition)
            .filter(|record| predicate.matches(record))
            .map(|record| record.guid.clone())
            .collect()
    }

    /// Like [`RecordStore::select`], addressing the partition by name.
    pub fn query(&self, partition: &str, predicate: &Predicate) -> Result<Vec<Guid>, RegistryError> {
        let partition: Partition = partition.parse()?;
        Ok(self.select(partition, predicate))
    }
}
