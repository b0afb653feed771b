use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::entities::{long_name, values_equal, Entities};

/// Constraint on a single entity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub enum EntityFilter {
    /// The entity must not be present.
    Absent,
    /// The entity must be present, with any value.
    Any,
    Value(String),
    OneOf(Vec<EntityFilter>),
}

impl EntityFilter {
    pub fn value(value: impl Into<String>) -> Self {
        EntityFilter::Value(value.into())
    }

    pub fn one_of<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityFilter>,
    {
        EntityFilter::OneOf(values.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, entity: &str, value: Option<&str>) -> bool {
        match (self, value) {
            (EntityFilter::Absent, found) => found.is_none(),
            (EntityFilter::Any, found) => found.is_some(),
            (EntityFilter::Value(expected), Some(found)) => values_equal(entity, expected, found),
            (EntityFilter::Value(_), None) => false,
            (EntityFilter::OneOf(options), found) => {
                options.iter().any(|option| option.matches(entity, found))
            }
        }
    }
}

impl From<&str> for EntityFilter {
    fn from(value: &str) -> Self {
        EntityFilter::value(value)
    }
}

impl From<String> for EntityFilter {
    fn from(value: String) -> Self {
        EntityFilter::Value(value)
    }
}

/// JSON `null` is [`EntityFilter::Absent`] and `"*"` is [`EntityFilter::Any`].
impl TryFrom<Value> for EntityFilter {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(EntityFilter::Absent),
            Value::String(s) if s == "*" => Ok(EntityFilter::Any),
            Value::String(s) => Ok(EntityFilter::Value(s)),
            Value::Number(n) => Ok(EntityFilter::Value(n.to_string())),
            Value::Array(items) => items
                .into_iter()
                .map(EntityFilter::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(EntityFilter::OneOf),
            other => Err(format!("unsupported entity filter value: {other}")),
        }
    }
}

/// A set of entity constraints. Keys are normalized to long entity names.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "BTreeMap<String, EntityFilter>")]
pub struct Query {
    filters: BTreeMap<String, EntityFilter>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entity: &str, filter: impl Into<EntityFilter>) -> Self {
        self.set(entity, filter);
        self
    }

    pub fn set(&mut self, entity: &str, filter: impl Into<EntityFilter>) {
        self.filters
            .insert(long_name(entity).to_string(), filter.into());
    }

    pub fn get(&self, entity: &str) -> Option<&EntityFilter> {
        self.filters.get(long_name(entity))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.filters.contains_key(long_name(entity))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EntityFilter)> {
        self.filters.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Applies `other` on top of `self`, entity by entity.
    pub fn merge(&mut self, other: &Query) {
        for (entity, filter) in &other.filters {
            self.filters.insert(entity.clone(), filter.clone());
        }
    }

    pub fn matches(&self, entities: &Entities) -> bool {
        self.filters.iter().all(|(entity, filter)| {
            filter.matches(entity, entities.get(entity).map(String::as_str))
        })
    }
}

impl From<BTreeMap<String, EntityFilter>> for Query {
    fn from(raw: BTreeMap<String, EntityFilter>) -> Self {
        let mut query = Query::new();
        for (entity, filter) in raw {
            query.set(&entity, filter);
        }
        query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::parse_entities;
    use std::path::Path;

    fn bold_entities() -> Entities {
        parse_entities(Path::new("sub-01/func/sub-01_task-rest_echo-2_bold.nii.gz"))
    }

    #[test]
    fn sentinels_match_presence() {
        let entities = bold_entities();
        assert!(Query::new().with("echo", EntityFilter::Any).matches(&entities));
        assert!(!Query::new().with("echo", EntityFilter::Absent).matches(&entities));
        assert!(Query::new().with("space", EntityFilter::Absent).matches(&entities));
    }

    #[test]
    fn one_of_accepts_absent_member() {
        let query = Query::new().with(
            "space",
            EntityFilter::OneOf(vec![EntityFilter::value("boldref"), EntityFilter::Absent]),
        );
        assert!(query.matches(&bold_entities()));
    }

    #[test]
    fn merge_overrides_entity_by_entity() {
        let mut base = Query::new()
            .with("echo", EntityFilter::Absent)
            .with("desc", "brain")
            .with("suffix", "mask");
        base.merge(&Query::new().with("desc", "custom"));
        assert_eq!(base.get("desc"), Some(&EntityFilter::value("custom")));
        assert_eq!(base.get("echo"), Some(&EntityFilter::Absent));
        assert_eq!(base.get("suffix"), Some(&EntityFilter::value("mask")));
    }

    #[test]
    fn json_sentinels_and_short_keys() {
        let query: Query = serde_json::from_str(
            r#"{"ses": null, "echo": "*", "run": 1, "acq": ["mb", null]}"#,
        )
        .unwrap();
        assert_eq!(query.get("session"), Some(&EntityFilter::Absent));
        assert_eq!(query.get("echo"), Some(&EntityFilter::Any));
        assert_eq!(query.get("run"), Some(&EntityFilter::value("1")));
        assert_eq!(
            query.get("acquisition"),
            Some(&EntityFilter::OneOf(vec![
                EntityFilter::value("mb"),
                EntityFilter::Absent
            ]))
        );
    }

    #[test]
    fn json_rejects_boolean_values() {
        let parsed: Result<Query, _> = serde_json::from_str(r#"{"echo": true}"#);
        assert!(parsed.is_err());
    }
}
