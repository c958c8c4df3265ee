//! Ordered-distinct query builder.
//!
//! Projections must be aliased and ordering must name one of those aliases.
//! Stores disagree about ordering on a raw property path after `DISTINCT`;
//! ordering on an alias works everywhere, so the builder refuses anything else.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

use super::BackendError;
use crate::ir::NodeKind;

/// A node attribute a query can project or filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Kind,
    QualifiedName,
    Name,
    FilePath,
    StartLine,
    EndLine,
    Scope,
    IsDependency,
}

impl Field {
    /// Property path as stored (also the column name in tabular backends).
    pub fn property(&self) -> &'static str {
        match self {
            Field::Kind => "kind",
            Field::QualifiedName => "qualified_name",
            Field::Name => "name",
            Field::FilePath => "file_path",
            Field::StartLine => "start_line",
            Field::EndLine => "end_line",
            Field::Scope => "scope",
            Field::IsDependency => "is_dependency",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Restrict to the given node kinds.
    KindIn(Vec<NodeKind>),
    /// Field equals value.
    Eq(Field, Value),
    /// File path starts with the given string.
    PathPrefix(String),
    /// Name contains the given substring (case-sensitive).
    NameContains(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub field: Field,
    pub alias: String,
}

/// Unvalidated query under construction.
#[derive(Debug, Clone, Default)]
pub struct DistinctQueryBuilder {
    projections: Vec<Projection>,
    predicates: Vec<Predicate>,
    order_by: Option<String>,
    descending: bool,
    limit: Option<usize>,
}

/// A validated ordered-distinct query. Only obtainable through [`DistinctQuery::builder`].
#[derive(Debug, Clone)]
pub struct DistinctQuery {
    projections: Vec<Projection>,
    predicates: Vec<Predicate>,
    order_by: String,
    descending: bool,
    limit: Option<usize>,
}

impl DistinctQuery {
    pub fn builder() -> DistinctQueryBuilder {
        DistinctQueryBuilder::default()
    }

    pub fn projections(&self) -> &[Projection] {
        &self.projections
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn order_by(&self) -> &str {
        &self.order_by
    }

    pub fn descending(&self) -> bool {
        self.descending
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn aliases(&self) -> Vec<String> {
        self.projections.iter().map(|p| p.alias.clone()).collect()
    }

    /// Position of the ordering alias among the projections.
    pub fn order_index(&self) -> usize {
        self.projections
            .iter()
            .position(|p| p.alias == self.order_by)
            .unwrap_or(0)
    }

    /// Node kinds the predicates allow.
    pub fn kinds(&self) -> Vec<NodeKind> {
        let mut kinds: Vec<NodeKind> = NodeKind::ALL.to_vec();
        for predicate in &self.predicates {
            match predicate {
                Predicate::KindIn(allowed) => kinds.retain(|k| allowed.contains(k)),
                Predicate::Eq(Field::Kind, Value::String(s)) => {
                    kinds.retain(|k| k.as_str() == s.as_str())
                }
                _ => {}
            }
        }
        kinds
    }

    /// Sort projected rows the way the query asks and apply the limit.
    ///
    /// Rows tie-break on the remaining columns left to right so every
    /// backend returns the same order.
    pub fn sort_rows(&self, rows: &mut Vec<Vec<Value>>) {
        let primary = self.order_index();
        rows.sort_by(|a, b| {
            let mut ord = compare_values(&a[primary], &b[primary]);
            if self.descending {
                ord = ord.reverse();
            }
            ord.then_with(|| {
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| compare_values(x, y))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            })
        });
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
    }
}

impl DistinctQueryBuilder {
    pub fn select(mut self, field: Field, alias: impl Into<String>) -> Self {
        self.projections.push(Projection {
            field,
            alias: alias.into(),
        });
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn order_by(mut self, alias: impl Into<String>) -> Self {
        self.order_by = Some(alias.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(self) -> Result<DistinctQuery, BackendError> {
        if self.projections.is_empty() {
            return Err(BackendError::InvalidQuery(
                "at least one projection is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for p in &self.projections {
            if !is_identifier(&p.alias) {
                return Err(BackendError::InvalidQuery(format!(
                    "projection of '{}' needs an alias made of letters, digits and '_', got '{}'",
                    p.field.property(),
                    p.alias
                )));
            }
            // SQL identifiers compare case-insensitively.
            if !seen.insert(p.alias.to_ascii_lowercase()) {
                return Err(BackendError::InvalidQuery(format!(
                    "duplicate alias '{}'",
                    p.alias
                )));
            }
        }
        let order_by = match self.order_by {
            Some(alias) => alias,
            None => self.projections[0].alias.clone(),
        };
        if !self.projections.iter().any(|p| p.alias == order_by) {
            return Err(BackendError::InvalidQuery(format!(
                "order by must name a projection alias, got '{}'",
                order_by
            )));
        }
        if let Some(Predicate::Eq(field, value)) = self
            .predicates
            .iter()
            .find(|p| matches!(p, Predicate::Eq(_, v) if v.is_null() || v.is_array() || v.is_object()))
        {
            return Err(BackendError::InvalidQuery(format!(
                "cannot compare '{}' with {}",
                field.property(),
                value
            )));
        }
        Ok(DistinctQuery {
            projections: self.projections,
            predicates: self.predicates,
            order_by,
            descending: self.descending,
            limit: self.limit,
        })
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Total order over projected values: null, then numbers and booleans, then strings.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) | Value::Number(_) => 1,
            Value::String(_) => 2,
            _ => 3,
        }
    }
    fn numeric(v: &Value) -> f64 {
        match v {
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => match (a, b) {
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Null, Value::Null) => Ordering::Equal,
            (x, y) if rank(x) == 1 => numeric(x).total_cmp(&numeric(y)),
            (x, y) => x.to_string().cmp(&y.to_string()),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_by_must_name_alias() {
        let err = DistinctQuery::builder()
            .select(Field::Name, "fn_name")
            .order_by("name")
            .build()
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidQuery(_)));

        let ok = DistinctQuery::builder()
            .select(Field::Name, "fn_name")
            .order_by("fn_name")
            .build()
            .unwrap();
        assert_eq!(ok.order_by(), "fn_name");
    }

    #[test]
    fn test_projection_needs_identifier_alias() {
        assert!(DistinctQuery::builder().build().is_err());
        assert!(DistinctQuery::builder().select(Field::Name, "").build().is_err());
        assert!(DistinctQuery::builder()
            .select(Field::Name, "n; DROP TABLE x")
            .build()
            .is_err());
        assert!(DistinctQuery::builder()
            .select(Field::Name, "a")
            .select(Field::FilePath, "a")
            .build()
            .is_err());
        assert!(DistinctQuery::builder()
            .select(Field::Name, "path")
            .select(Field::FilePath, "Path")
            .build()
            .is_err());
        // Keywords are fine as aliases; backends quote them.
        assert!(DistinctQuery::builder()
            .select(Field::Name, "order")
            .order_by("order")
            .build()
            .is_ok());
    }

    #[test]
    fn test_kinds_from_predicates() {
        let q = DistinctQuery::builder()
            .select(Field::Name, "name")
            .filter(Predicate::KindIn(vec![NodeKind::Function, NodeKind::Class]))
            .filter(Predicate::Eq(Field::Kind, json!("Class")))
            .build()
            .unwrap();
        assert_eq!(q.kinds(), vec![NodeKind::Class]);
    }

    #[test]
    fn test_sort_rows_descending_with_limit() {
        let q = DistinctQuery::builder()
            .select(Field::Name, "name")
            .select(Field::StartLine, "line")
            .order_by("line")
            .descending()
            .limit(2)
            .build()
            .unwrap();
        let mut rows = vec![
            vec![json!("a"), json!(3)],
            vec![json!("b"), json!(10)],
            vec![json!("c"), json!(7)],
        ];
        q.sort_rows(&mut rows);
        assert_eq!(rows, vec![vec![json!("b"), json!(10)], vec![json!("c"), json!(7)]]);
    }

    #[test]
    fn test_compare_values_ranks() {
        assert_eq!(compare_values(&Value::Null, &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!("1")), Ordering::Less);
        assert_eq!(compare_values(&json!(true), &json!(0)), Ordering::Greater);
        assert_eq!(compare_values(&json!("B"), &json!("a")), Ordering::Less);
    }
}
