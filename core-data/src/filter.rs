//! Row filters
//!
//! A [`Filter`] is the predicate accepted by the read and delete operations of
//! a repository. It renders to a parameterised SQL condition; column names are
//! checked against the entity map before anything reaches the database.
//!
//! ```
//! use core_data::filter::Filter;
//!
//! let filter = Filter::eq("Username", "alice").and(Filter::is_not_null("Email"));
//! assert!(matches!(filter, Filter::And(_, _)));
//! ```

use crate::error::{DataError, Result};
use crate::mapping::{quote_ident, EntityMap};
use bridge_traits::database::QueryValue;
use std::ops::Not;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: String,
        op: CompareOp,
        value: QueryValue,
    },
    IsNull(String),
    IsNotNull(String),
    In {
        column: String,
        values: Vec<QueryValue>,
    },
    Like {
        column: String,
        pattern: String,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
    /// Hand written condition with `?` placeholders
    Raw {
        sql: String,
        params: Vec<QueryValue>,
    },
}

impl Filter {
    fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<QueryValue>) -> Self {
        Filter::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// `column = value`. A `NULL` value never matches; use [`Filter::is_null`].
    pub fn eq(column: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        Self::compare(column, CompareOp::Ne, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        Self::compare(column, CompareOp::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        Self::compare(column, CompareOp::Ge, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        Self::compare(column, CompareOp::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        Self::compare(column, CompareOp::Le, value)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Filter::IsNull(column.into())
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Filter::IsNotNull(column.into())
    }

    pub fn in_list<V: Into<QueryValue>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// SQL `LIKE` with `%` and `_` wildcards
    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Filter::Like {
            column: column.into(),
            pattern: pattern.into(),
        }
    }

    pub fn raw(sql: impl Into<String>, params: Vec<QueryValue>) -> Self {
        Filter::Raw {
            sql: sql.into(),
            params,
        }
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Render the condition for `map`.
    ///
    /// # Errors
    ///
    /// [`DataError::InvalidArgument`] for an empty or unknown column, an empty
    /// `IN` list or empty raw SQL.
    pub(crate) fn render(&self, map: Option<&EntityMap>) -> Result<SqlFragment> {
        let mut fragment = SqlFragment::default();
        self.render_into(map, &mut fragment)?;
        Ok(fragment)
    }

    fn render_into(&self, map: Option<&EntityMap>, out: &mut SqlFragment) -> Result<()> {
        match self {
            Filter::Compare { column, op, value } => {
                out.sql.push_str(&checked_column(column, map)?);
                out.sql.push(' ');
                out.sql.push_str(op.as_sql());
                out.sql.push_str(" ?");
                out.params.push(value.clone());
            }
            Filter::IsNull(column) => {
                out.sql.push_str(&checked_column(column, map)?);
                out.sql.push_str(" IS NULL");
            }
            Filter::IsNotNull(column) => {
                out.sql.push_str(&checked_column(column, map)?);
                out.sql.push_str(" IS NOT NULL");
            }
            Filter::In { column, values } => {
                if values.is_empty() {
                    return Err(DataError::invalid_argument(
                        "filter",
                        format!("IN list for column {} is empty", column),
                    ));
                }
                out.sql.push_str(&checked_column(column, map)?);
                out.sql.push_str(" IN (");
                out.sql.push_str(&vec!["?"; values.len()].join(", "));
                out.sql.push(')');
                out.params.extend(values.iter().cloned());
            }
            Filter::Like { column, pattern } => {
                out.sql.push_str(&checked_column(column, map)?);
                out.sql.push_str(" LIKE ?");
                out.params.push(QueryValue::Text(pattern.clone()));
            }
            Filter::And(left, right) => render_binary(left, "AND", right, map, out)?,
            Filter::Or(left, right) => render_binary(left, "OR", right, map, out)?,
            Filter::Not(inner) => {
                out.sql.push_str("NOT (");
                inner.render_into(map, out)?;
                out.sql.push(')');
            }
            Filter::Raw { sql, params } => {
                if sql.trim().is_empty() {
                    return Err(DataError::invalid_argument("filter", "raw SQL is empty"));
                }
                out.sql.push('(');
                out.sql.push_str(sql);
                out.sql.push(')');
                out.params.extend(params.iter().cloned());
            }
        }
        Ok(())
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        self.negate()
    }
}

fn render_binary(
    left: &Filter,
    keyword: &str,
    right: &Filter,
    map: Option<&EntityMap>,
    out: &mut SqlFragment,
) -> Result<()> {
    out.sql.push('(');
    left.render_into(map, out)?;
    out.sql.push_str(") ");
    out.sql.push_str(keyword);
    out.sql.push_str(" (");
    right.render_into(map, out)?;
    out.sql.push(')');
    Ok(())
}

/// Quote `column` after checking it is mapped. Without a map (raw SQL
/// sources) only emptiness is checked.
fn checked_column(column: &str, map: Option<&EntityMap>) -> Result<String> {
    if column.trim().is_empty() {
        return Err(DataError::invalid_argument("filter", "column name is empty"));
    }
    if let Some(map) = map {
        if !map.has_column(column) {
            return Err(DataError::invalid_argument(
                "filter",
                format!("column {} is not mapped on {}", column, map.table()),
            ));
        }
    }
    Ok(quote_ident(column))
}

/// SQL text with its positional parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SqlFragment {
    pub sql: String,
    pub params: Vec<QueryValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_compare() {
        let fragment = Filter::eq("Name", "alice").render(None).unwrap();
        assert_eq!(fragment.sql, "\"Name\" = ?");
        assert_eq!(fragment.params, vec![QueryValue::Text("alice".to_string())]);
    }

    #[test]
    fn test_render_composite() {
        let filter = Filter::gt("Age", 18)
            .and(Filter::like("Name", "a%").or(Filter::is_null("Email")));
        let fragment = (!filter).render(None).unwrap();

        assert_eq!(
            fragment.sql,
            "NOT ((\"Age\" > ?) AND ((\"Name\" LIKE ?) OR (\"Email\" IS NULL)))"
        );
        assert_eq!(fragment.params.len(), 2);
    }

    #[test]
    fn test_render_in_list() {
        let fragment = Filter::in_list("Id", [1i64, 2, 3]).render(None).unwrap();
        assert_eq!(fragment.sql, "\"Id\" IN (?, ?, ?)");
        assert_eq!(fragment.params.len(), 3);
    }

    #[test]
    fn test_render_raw_keeps_params_in_order() {
        let filter = Filter::eq("A", 1).and(Filter::raw(
            "\"B\" BETWEEN ? AND ?",
            vec![QueryValue::Integer(2), QueryValue::Integer(3)],
        ));
        let fragment = filter.render(None).unwrap();

        assert_eq!(
            fragment.params,
            vec![
                QueryValue::Integer(1),
                QueryValue::Integer(2),
                QueryValue::Integer(3)
            ]
        );
    }

    #[test]
    fn test_malformed_filters_are_rejected() {
        let cases = vec![
            Filter::eq("", 1),
            Filter::in_list("Id", Vec::<i64>::new()),
            Filter::raw("  ", vec![]),
            Filter::eq("Name", "x").and(Filter::is_null(" ")),
        ];

        for filter in cases {
            let err = filter.render(None).unwrap_err();
            assert!(matches!(err, DataError::InvalidArgument { .. }), "{:?}", err);
        }
    }
}
