//! Native query representation handed to document store clients.
//!
//! Repositories translate their execution plans into a [`Query`]: a filter expression,
//! a list of sort keys, a limit and an offset. Clients walk the filter with a
//! [`QueryVisitor`] to evaluate it or translate it further.
//!
//! # Filter Expression API
//!
//! The [`Filter`] struct provides static methods for building filter expressions:
//!
//! - Comparison: `eq`, `ne`, `gt`, `gte`, `lt`, `lte`
//! - Array: `array_contains`, `array_contains_any`, `any_of`, `none_of`
//! - Logical: `and`, `or`
//!
//! ```ignore
//! use docmap::query::Filter;
//!
//! let expr = Filter::eq("status", "active").and(Filter::gt("age", 18));
//! ```

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::DocumentStoreError;

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    #[default]
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

/// Sort key for query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    /// The dotted field path to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

/// Field comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldOp {
    /// Equal to.
    Eq,
    /// Not equal to. Documents missing the field never match.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Array field contains the value.
    ArrayContains,
    /// Array field contains any of the values.
    ArrayContainsAny,
    /// Field equals any of the values.
    In,
    /// Field is present and equals none of the values.
    NotIn,
}

impl FieldOp {
    /// Returns `true` for operators whose value is a list.
    pub fn takes_list(&self) -> bool {
        matches!(self, FieldOp::ArrayContainsAny | FieldOp::In | FieldOp::NotIn)
    }
}

/// A filter expression for querying documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match).
    Or(Vec<Expr>),
    /// Logical NOT of an expression (inverts the result).
    Not(Box<Expr>),
    /// Field comparison expression.
    Field {
        /// The dotted field path to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The value to compare against.
        value: Bson,
    },
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: String, op: FieldOp, value: Bson) -> Self {
        Expr::Field { field, op, value }
    }

    /// Combines this expression with another using logical AND.
    ///
    /// If this expression is already an AND, the other expression is appended
    /// to the list. Otherwise, a new AND expression is created.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    ///
    /// If this expression is already an OR, the other expression is appended
    /// to the list. Otherwise, a new OR expression is created.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Joins expressions with AND, collapsing the trivial cases.
    pub fn all(exprs: Vec<Expr>) -> Option<Expr> {
        let mut exprs = exprs;
        match exprs.len() {
            0 => None,
            1 => exprs.pop(),
            _ => Some(Expr::And(exprs)),
        }
    }
}

/// A structured query for retrieving documents from one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Optional filter expression to match documents.
    pub filter: Option<Expr>,
    /// Sort keys, applied in order.
    pub sort: Vec<Sort>,
    /// Maximum number of documents to return.
    pub limit: Option<usize>,
    /// Number of matching documents to skip.
    pub offset: Option<usize>,
}

impl Query {
    /// Creates a new empty query with no filters or limits.
    pub fn new() -> Self {
        Query::default()
    }
}

/// Helper struct for constructing filter expressions.
///
/// All methods accept field names and values as `Into<String>` and `Into<Bson>`.
pub struct Filter;

impl Filter {
    /// Matches documents where the field equals the value.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Eq, value.into())
    }

    /// Matches documents where the field is present and differs from the value.
    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Ne, value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gt, value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gte, value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lt, value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lte, value.into())
    }

    /// Matches documents whose array field contains the value.
    pub fn array_contains(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::ArrayContains, value.into())
    }

    /// Matches documents whose array field contains any of the values.
    pub fn array_contains_any<V: Into<Bson>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Expr {
        Expr::field(field.into(), FieldOp::ArrayContainsAny, list(values))
    }

    /// Matches documents whose field equals any of the values.
    pub fn any_of<V: Into<Bson>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Expr {
        Expr::field(field.into(), FieldOp::In, list(values))
    }

    /// Matches documents whose field equals none of the values.
    pub fn none_of<V: Into<Bson>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Expr {
        Expr::field(field.into(), FieldOp::NotIn, list(values))
    }

    /// Combines multiple expressions such that all must match.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    /// Combines multiple expressions such that any can match.
    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }
}

fn list<V: Into<Bson>>(values: impl IntoIterator<Item = V>) -> Bson {
    Bson::Array(values.into_iter().map(Into::into).collect())
}

/// Reads a dotted field path out of a document.
///
/// `lookup_path(doc, "address.city")` returns `doc.address.city` when every
/// intermediate value is a document.
pub fn lookup_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }

    Some(current)
}

pub trait QueryVisitor {
    type Output;
    type Error: Into<DocumentStoreError>;

    fn visit_and(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, exprs: &[Expr]) -> Result<Self::Output, Self::Error>;
    fn visit_not(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error>;
    fn visit_field(
        &mut self,
        field: &str,
        op: &FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error>;

    fn visit_expr(&mut self, expr: &Expr) -> Result<Self::Output, Self::Error> {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
        }
    }
}
