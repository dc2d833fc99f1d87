//! Filter expressions and queries over a shape
//!
//! Filters are a small expression tree rendered to a parameterized WHERE
//! clause. Field names are checked against the shape and always quoted;
//! values are always bound, never spliced into SQL text.

use std::ops::Not;

use crate::database::mapper::{quote_ident, Shape, Value};
use crate::error::{DataAccessError, Result};

/// Comparison operator of a [`Filter::Compare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl Comparison {
    fn sql(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "<>",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Like => "LIKE",
        }
    }
}

/// Row predicate
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// Matches every row
    #[default]
    All,
    Compare {
        field: String,
        op: Comparison,
        value: Value,
    },
    IsNull(String),
    IsNotNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn compare(field: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        Filter::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Ne, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Lt, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Le, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Gt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, Comparison::Ge, value)
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(field, Comparison::Like, Value::Text(pattern.into()))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Filter::IsNull(field.into())
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Filter::IsNotNull(field.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::All => other,
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            this => Filter::And(vec![this, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut parts) => {
                parts.push(other);
                Filter::Or(parts)
            }
            this => Filter::Or(vec![this, other]),
        }
    }

    /// Render as a SQL condition, appending bound values to `params`
    ///
    /// Placeholders are numbered from the current length of `params`.
    pub fn to_sql(&self, shape: &Shape, params: &mut Vec<Value>) -> Result<String> {
        Ok(match self {
            Filter::All => "1 = 1".to_string(),
            Filter::Compare { field, op, value } => {
                let column = checked_column(shape, field)?;
                params.push(value.clone());
                format!("{} {} ?{}", column, op.sql(), params.len())
            }
            Filter::IsNull(field) => format!("{} IS NULL", checked_column(shape, field)?),
            Filter::IsNotNull(field) => format!("{} IS NOT NULL", checked_column(shape, field)?),
            Filter::And(parts) => join(parts, " AND ", "1 = 1", shape, params)?,
            Filter::Or(parts) => join(parts, " OR ", "1 = 0", shape, params)?,
            Filter::Not(inner) => format!("NOT ({})", inner.to_sql(shape, params)?),
        })
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }
}

fn checked_column(shape: &Shape, field: &str) -> Result<String> {
    if shape.has_column(field) {
        Ok(quote_ident(field))
    } else {
        Err(DataAccessError::UnknownField {
            table: shape.table().to_string(),
            field: field.to_string(),
        })
    }
}

fn join(
    parts: &[Filter],
    separator: &str,
    empty: &str,
    shape: &Shape,
    params: &mut Vec<Value>,
) -> Result<String> {
    if parts.is_empty() {
        return Ok(empty.to_string());
    }
    let rendered = parts
        .iter()
        .map(|p| p.to_sql(shape, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", rendered.join(separator)))
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Filter plus ordering and paging
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    filter: Filter,
    order: Vec<(String, Order)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn get_filter(&self) -> &Filter {
        &self.filter
    }

    /// Render everything after `FROM <table>`
    pub fn to_sql(&self, shape: &Shape, params: &mut Vec<Value>) -> Result<String> {
        let mut sql = format!(" WHERE {}", self.filter.to_sql(shape, params)?);

        if !self.order.is_empty() {
            let terms = self
                .order
                .iter()
                .map(|(field, order)| {
                    let direction = match order {
                        Order::Asc => "ASC",
                        Order::Desc => "DESC",
                    };
                    checked_column(shape, field).map(|c| format!("{} {}", c, direction))
                })
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }

        if self.limit.is_some() || self.offset.is_some() {
            // the engine only accepts OFFSET after a LIMIT; -1 means unbounded
            let limit = self.limit.map(clamp).unwrap_or(-1);
            params.push(Value::Integer(limit));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
            if let Some(offset) = self.offset {
                params.push(Value::Integer(clamp(offset)));
                sql.push_str(&format!(" OFFSET ?{}", params.len()));
            }
        }

        Ok(sql)
    }
}

fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
