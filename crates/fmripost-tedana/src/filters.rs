use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fmripost_bids::Query;
use serde_json::Value;
use tracing::warn;

use crate::logging::CLI;

/// Logical queries a user may override from a BIDS filter file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryKind {
    EchoFiles,
    Mask,
    Confounds,
}

impl QueryKind {
    pub const ALL: [QueryKind; 3] = [QueryKind::EchoFiles, QueryKind::Mask, QueryKind::Confounds];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::EchoFiles => "echo_files",
            QueryKind::Mask => "mask",
            QueryKind::Confounds => "confounds",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == key)
    }
}

/// User-supplied query overrides, keyed by [`QueryKind`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOverrides {
    queries: BTreeMap<QueryKind, Query>,
}

impl FilterOverrides {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("Path does not exist: <{}>.", path.display()));
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read BIDS filter file {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("JSON syntax error in: <{}>.", path.display()))
    }

    /// Unknown top-level keys are skipped with a warning.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let parsed: BTreeMap<String, Value> = serde_json::from_str(raw)?;
        let mut overrides = Self::default();
        for (key, value) in parsed {
            let Some(kind) = QueryKind::from_key(&key) else {
                warn!(target: CLI, "ignoring unrecognized BIDS filter query '{key}'");
                continue;
            };
            let query: Query = serde_json::from_value(value)
                .with_context(|| format!("invalid filters for query '{key}'"))?;
            overrides.insert(kind, query);
        }
        Ok(overrides)
    }

    pub fn insert(&mut self, kind: QueryKind, query: Query) {
        self.queries.insert(kind, query);
    }

    pub fn get(&self, kind: QueryKind) -> Option<&Query> {
        self.queries.get(&kind)
    }

    /// `base` with this kind's override applied on top, entity by entity.
    pub fn apply(&self, kind: QueryKind, mut base: Query) -> Query {
        if let Some(user) = self.get(kind) {
            base.merge(user);
        }
        base
    }
}
