//! Metadata filter expressions for index queries.
//!
//! A [`Filter`] is a small tagged tree of exact-match conditions joined by
//! conjunctions and disjunctions. Combinators built through [`Filter::all`]
//! and [`Filter::any`] are normalized on construction:
//!
//! - a single condition is returned unwrapped (never `And([x])`), since some
//!   vector backends reject singleton boolean combinators;
//! - nested combinators of the same kind are flattened.
//!
//! Backends either evaluate a filter directly ([`Filter::matches`]) or
//! translate it into their own query language (see the SQLite index in the
//! application crate).

use serde::Serialize;

use crate::models::{RecordKind, RecordMetadata, Scope, ScopeTarget};

/// Metadata fields a filter may test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    UserId,
    BotId,
    StudySpaceId,
    Kind,
    SourceId,
}

impl Field {
    /// Column / key name used by storage backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::UserId => "user_id",
            Field::BotId => "bot_id",
            Field::StudySpaceId => "study_space_id",
            Field::Kind => "kind",
            Field::SourceId => "source_id",
        }
    }
}

/// A comparable metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FilterValue {
    Int(i64),
    Text(String),
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Int(v)
    }
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::Text(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        FilterValue::Text(v)
    }
}

/// A filter expression over [`RecordMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Equals(Field, FilterValue),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: Field, value: impl Into<FilterValue>) -> Self {
        Filter::Equals(field, value.into())
    }

    /// Conjunction of `conditions`, normalized.
    ///
    /// An empty conjunction matches every record.
    pub fn all(conditions: Vec<Filter>) -> Self {
        Self::combine(conditions, true)
    }

    /// Disjunction of `conditions`, normalized.
    ///
    /// An empty disjunction matches nothing.
    pub fn any(conditions: Vec<Filter>) -> Self {
        Self::combine(conditions, false)
    }

    /// Conjunction of `self` and `other`.
    pub fn and(self, other: Filter) -> Self {
        Filter::all(vec![self, other])
    }

    /// Tenant filter for a scope: `user_id` AND (`bot_id` | `study_space_id`).
    pub fn for_scope(scope: &Scope) -> Self {
        let target = match scope.target {
            ScopeTarget::Bot(id) => Filter::eq(Field::BotId, id),
            ScopeTarget::StudySpace(id) => Filter::eq(Field::StudySpaceId, id),
        };
        Filter::all(vec![Filter::eq(Field::UserId, scope.user_id), target])
    }

    /// Tenant filter restricted to one record kind.
    pub fn for_scope_kind(scope: &Scope, kind: RecordKind) -> Self {
        Filter::for_scope(scope).and(Filter::eq(Field::Kind, kind.as_str()))
    }

    fn combine(conditions: Vec<Filter>, conjunction: bool) -> Self {
        let mut flat = Vec::with_capacity(conditions.len());
        for c in conditions {
            match (c, conjunction) {
                (Filter::And(inner), true) => flat.extend(inner),
                (Filter::Or(inner), false) => flat.extend(inner),
                (other, _) => flat.push(other),
            }
        }
        if flat.len() == 1 {
            return flat.remove(0);
        }
        if conjunction {
            Filter::And(flat)
        } else {
            Filter::Or(flat)
        }
    }

    /// Evaluate this filter against a record's metadata.
    pub fn matches(&self, meta: &RecordMetadata) -> bool {
        match self {
            Filter::Equals(field, value) => field_matches(meta, *field, value),
            Filter::And(items) => items.iter().all(|f| f.matches(meta)),
            Filter::Or(items) => items.iter().any(|f| f.matches(meta)),
        }
    }
}

fn field_matches(meta: &RecordMetadata, field: Field, value: &FilterValue) -> bool {
    match (field, value) {
        (Field::UserId, FilterValue::Int(v)) => meta.user_id == Some(*v),
        (Field::BotId, FilterValue::Int(v)) => meta.bot_id == Some(*v),
        (Field::StudySpaceId, FilterValue::Int(v)) => meta.study_space_id == Some(*v),
        (Field::Kind, FilterValue::Text(v)) => meta.kind.as_str() == v,
        (Field::SourceId, FilterValue::Text(v)) => meta.source_id.as_deref() == Some(v.as_str()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn meta() -> RecordMetadata {
        RecordMetadata {
            kind: RecordKind::Document,
            user_id: Some(1),
            bot_id: Some(5),
            study_space_id: None,
            source_id: Some("src-a".into()),
            source_name: Some("a.txt".into()),
            chunk_index: 0,
            total_chunks: 1,
            role: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_singleton_is_unwrapped() {
        let f = Filter::all(vec![Filter::eq(Field::UserId, 1)]);
        assert_eq!(f, Filter::Equals(Field::UserId, FilterValue::Int(1)));
        let f = Filter::any(vec![Filter::eq(Field::SourceId, "x")]);
        assert!(matches!(f, Filter::Equals(Field::SourceId, _)));
    }

    #[test]
    fn test_nested_conjunctions_flatten() {
        let scope = Scope::bot(1, 5);
        let f = Filter::for_scope(&scope).and(Filter::eq(Field::Kind, "document"));
        match f {
            Filter::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected flat And, got {:?}", other),
        }
    }

    #[test]
    fn test_disjunction_inside_conjunction_is_kept() {
        let f = Filter::eq(Field::UserId, 1).and(Filter::any(vec![
            Filter::eq(Field::SourceId, "a"),
            Filter::eq(Field::SourceId, "b"),
        ]));
        match f {
            Filter::And(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(items[1], Filter::Or(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_matches_scope() {
        let m = meta();
        assert!(Filter::for_scope(&Scope::bot(1, 5)).matches(&m));
        assert!(!Filter::for_scope(&Scope::bot(2, 5)).matches(&m));
        assert!(!Filter::for_scope(&Scope::study_space(1, 5)).matches(&m));
    }

    #[test]
    fn test_matches_kind_and_source() {
        let m = meta();
        let scope = Scope::bot(1, 5);
        assert!(Filter::for_scope_kind(&scope, RecordKind::Document).matches(&m));
        assert!(!Filter::for_scope_kind(&scope, RecordKind::Memory).matches(&m));
        assert!(Filter::eq(Field::SourceId, "src-a").matches(&m));
        assert!(!Filter::eq(Field::SourceId, "src-b").matches(&m));
    }

    #[test]
    fn test_type_mismatch_never_matches() {
        let m = meta();
        assert!(!Filter::eq(Field::UserId, "1").matches(&m));
    }

    #[test]
    fn test_empty_combinators() {
        let mut m = meta();
        m.role = Some(Role::User);
        assert!(Filter::all(vec![]).matches(&m));
        assert!(!Filter::any(vec![]).matches(&m));
    }
}
