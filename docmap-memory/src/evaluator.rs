//! Query evaluation for in-memory collections.
//!
//! Filters are walked with a [`QueryVisitor`]; field values are looked up by dotted path
//! and compared through [`Comparable`], which puts every numeric type on one scale.

use std::{cmp::Ordering, collections::HashMap};

use bson::{Bson, Document, datetime::DateTime};

use docmap_core::{
    error::{DocumentStoreError, DocumentStoreResult},
    query::{Expr, FieldOp, Query, QueryVisitor, SortDirection, lookup_path},
};

/// Type-erased, comparable representation of BSON values.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Bool(bool),
    /// All integers and floats normalized to f64.
    Number(f64),
    DateTime(DateTime),
    String(&'a str),
    Array(Vec<Comparable<'a>>),
    Map(HashMap<&'a str, Comparable<'a>>),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(*value as f64),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::Array(arr) => Comparable::Array(arr.iter().map(Comparable::from).collect()),
            Bson::Document(doc) => Comparable::Map(
                doc.iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect(),
            ),
            _ => Comparable::Null,
        }
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl Comparable<'_> {
    /// Total order used for sorting: values of different kinds order by kind.
    fn sort_cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other)
            .unwrap_or_else(|| self.rank().cmp(&other.rank()))
    }

    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Bool(_) => 1,
            Comparable::Number(_) => 2,
            Comparable::DateTime(_) => 3,
            Comparable::String(_) => 4,
            Comparable::Array(_) => 5,
            Comparable::Map(_) => 6,
        }
    }
}

pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> DocumentStoreResult<bool> {
        self.visit_expr(expr)
    }
}

fn list<'a>(value: &'a Bson, op: &FieldOp) -> DocumentStoreResult<Vec<Comparable<'a>>> {
    match value {
        Bson::Array(values) => Ok(values.iter().map(Comparable::from).collect()),
        other => Err(DocumentStoreError::InvalidDocument(format!(
            "{op:?} expects a list of values, got {:?}",
            other.element_type()
        ))),
    }
}

impl QueryVisitor for DocumentEvaluator<'_> {
    type Output = bool;
    type Error = DocumentStoreError;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if !self.visit_expr(expr)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error> {
        for expr in exprs {
            if self.visit_expr(expr)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_expr(expr)?)
    }

    // Documents missing the field never match, whatever the operator.
    fn visit_field(
        &mut self,
        field: &str,
        op: &FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error> {
        let Some(field_value) = lookup_path(self.document, field) else {
            return Ok(false);
        };
        let left = Comparable::from(field_value);
        let candidates = if op.takes_list() { list(value, op)? } else { Vec::new() };

        match op {
            FieldOp::Eq => Ok(left == Comparable::from(value)),
            FieldOp::Ne => Ok(left != Comparable::from(value)),
            FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => {
                Ok(match left.partial_cmp(&Comparable::from(value)) {
                    Some(ordering) => match op {
                        FieldOp::Gt => ordering == Ordering::Greater,
                        FieldOp::Gte => ordering != Ordering::Less,
                        FieldOp::Lt => ordering == Ordering::Less,
                        _ => ordering != Ordering::Greater,
                    },
                    None => false,
                })
            }
            FieldOp::ArrayContains => Ok(match left {
                Comparable::Array(items) => {
                    let needle = Comparable::from(value);
                    items.iter().any(|item| *item == needle)
                }
                _ => false,
            }),
            FieldOp::ArrayContainsAny => Ok(match left {
                Comparable::Array(items) => items.iter().any(|item| candidates.contains(item)),
                _ => false,
            }),
            FieldOp::In => Ok(candidates.contains(&left)),
            FieldOp::NotIn => Ok(!candidates.contains(&left)),
        }
    }
}

/// Runs `query` over the documents of one collection, given in identifier order.
///
/// Filters first, then sorts by every sort key in turn, then skips `offset` documents
/// and keeps at most `limit`. Documents missing a sort field are left out.
pub(crate) fn run_query<'a, I>(
    documents: I,
    query: &Query,
) -> DocumentStoreResult<Vec<(&'a str, &'a Document)>>
where
    I: IntoIterator<Item = (&'a str, &'a Document)>,
{
    let mut matched = Vec::new();

    for (id, document) in documents {
        if let Some(filter) = &query.filter {
            if !DocumentEvaluator::new(document).evaluate(filter)? {
                continue;
            }
        }
        if query.sort.iter().any(|sort| lookup_path(document, &sort.field).is_none()) {
            continue;
        }
        matched.push((id, document));
    }

    if !query.sort.is_empty() {
        matched.sort_by(|(_, a), (_, b)| {
            query
                .sort
                .iter()
                .map(|sort| {
                    let left = lookup_path(a, &sort.field).map(Comparable::from).unwrap_or(Comparable::Null);
                    let right = lookup_path(b, &sort.field).map(Comparable::from).unwrap_or(Comparable::Null);
                    match sort.direction {
                        SortDirection::Asc => left.sort_cmp(&right),
                        SortDirection::Desc => right.sort_cmp(&left),
                    }
                })
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }

    Ok(matched
        .into_iter()
        .skip(query.offset.unwrap_or(0))
        .take(query.limit.unwrap_or(usize::MAX))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docmap_core::query::{Filter, Sort};

    fn matches(document: &Document, expr: Expr) -> bool {
        DocumentEvaluator::new(document).evaluate(&expr).unwrap()
    }

    #[test]
    fn numbers_compare_across_types() {
        let document = doc! { "age": 30_i64, "profile": { "score": 4.5 } };

        assert!(matches(&document, Filter::eq("age", 30)));
        assert!(matches(&document, Filter::gte("age", 30.0)));
        assert!(matches(&document, Filter::lt("profile.score", 5)));
        assert!(!matches(&document, Filter::gt("profile.score", 5)));
    }

    #[test]
    fn missing_fields_never_match() {
        let document = doc! { "name": "Ada" };

        assert!(!matches(&document, Filter::ne("age", 3)));
        assert!(!matches(&document, Filter::none_of("age", vec![1, 2])));
        assert!(matches(&document, Filter::ne("name", "Grace")));
    }

    #[test]
    fn array_operators() {
        let document = doc! { "tags": ["rust", "db"], "status": "open" };

        assert!(matches(&document, Filter::array_contains("tags", "db")));
        assert!(!matches(&document, Filter::array_contains("status", "open")));
        assert!(matches(&document, Filter::array_contains_any("tags", vec!["go", "rust"])));
        assert!(matches(&document, Filter::any_of("status", vec!["open", "closed"])));
        assert!(!matches(&document, Filter::none_of("status", vec!["open"])));
    }

    #[test]
    fn list_operators_need_a_list() {
        let document = doc! { "status": "open" };
        let malformed = Expr::Field {
            field: "status".into(),
            op: FieldOp::In,
            value: Bson::String("open".into()),
        };

        assert!(matches!(
            DocumentEvaluator::new(&document).evaluate(&malformed),
            Err(DocumentStoreError::InvalidDocument(_))
        ));
    }

    #[test]
    fn queries_sort_then_page() {
        let docs = [
            ("a", doc! { "rank": 3, "name": "c" }),
            ("b", doc! { "rank": 1, "name": "a" }),
            ("c", doc! { "name": "unranked" }),
            ("d", doc! { "rank": 1, "name": "b" }),
            ("e", doc! { "rank": 2, "name": "d" }),
        ];
        let query = Query {
            filter: None,
            sort: vec![
                Sort { field: "rank".into(), direction: SortDirection::Asc },
                Sort { field: "name".into(), direction: SortDirection::Desc },
            ],
            limit: Some(2),
            offset: Some(1),
        };

        let ids: Vec<_> = run_query(docs.iter().map(|(id, d)| (*id, d)), &query)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        assert_eq!(ids, ["b", "e"]);
    }
}
