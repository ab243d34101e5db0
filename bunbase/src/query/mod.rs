//! Query builder (§4.3): turns a parsed [`QueryOptions`] into a safe `SELECT`/`COUNT` pair with
//! whitelisted identifiers and bound parameters.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PAGE, DEFAULT_PER_PAGE, MAX_PER_PAGE};
use crate::error::AppError;
use crate::schema::quote_ident;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
  Eq,
  Neq,
  Gt,
  Lt,
  Gte,
  Lte,
  Like,
  NotLike,
}

impl Op {
  pub fn parse(sigil: &str) -> Option<Op> {
    return match sigil {
      "=" | "" => Some(Op::Eq),
      "!=" => Some(Op::Neq),
      ">" => Some(Op::Gt),
      "<" => Some(Op::Lt),
      ">=" => Some(Op::Gte),
      "<=" => Some(Op::Lte),
      "~" => Some(Op::Like),
      "!~" => Some(Op::NotLike),
      _ => None,
    };
  }

  fn sql(&self) -> &'static str {
    return match self {
      Op::Eq => "=",
      Op::Neq => "!=",
      Op::Gt => ">",
      Op::Lt => "<",
      Op::Gte => ">=",
      Op::Lte => "<=",
      Op::Like => "LIKE",
      Op::NotLike => "NOT LIKE",
    };
  }
}

#[derive(Debug, Clone)]
pub struct Condition {
  pub field: String,
  pub op: Op,
  pub value: rusqlite::types::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
  Asc,
  Desc,
}

#[derive(Debug, Clone)]
pub struct SortKey {
  pub field: String,
  pub dir: SortDir,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
  pub filter: Vec<Condition>,
  pub sort: Vec<SortKey>,
  pub page: Option<i64>,
  pub per_page: Option<i64>,
  pub expand: Vec<String>,
}

impl QueryOptions {
  pub fn page(&self) -> i64 {
    return self.page.unwrap_or(DEFAULT_PAGE).max(1);
  }

  pub fn per_page(&self) -> i64 {
    return self
      .per_page
      .unwrap_or(DEFAULT_PER_PAGE)
      .clamp(1, MAX_PER_PAGE);
  }

  pub fn offset(&self) -> i64 {
    return (self.page() - 1) * self.per_page();
  }
}

/// Escapes `%`, `_` and `\` in a LIKE pattern operand so the user's literal text never becomes a
/// wildcard, then wraps it in `%...%` per §4.3.
pub fn escape_like_operand(raw: &str) -> String {
  let mut escaped = String::with_capacity(raw.len());
  for c in raw.chars() {
    if c == '%' || c == '_' || c == '\\' {
      escaped.push('\\');
    }
    escaped.push(c);
  }
  return format!("%{escaped}%");
}

#[derive(Debug)]
pub struct BuiltQuery {
  pub sql: String,
  pub count_sql: String,
  pub params: Vec<(String, rusqlite::types::Value)>,
}

/// Builds the paged `SELECT` and matching `COUNT` for `table`, validating every referenced
/// field against `valid_columns` (managed columns + schema fields) before it ever reaches SQL.
pub struct QueryBuilder;

impl QueryBuilder {
  pub fn build(
    table: &str,
    valid_columns: &[&str],
    extra_where: Option<&str>,
    opts: &QueryOptions,
  ) -> Result<BuiltQuery, AppError> {
    let mut where_clauses = vec![];
    let mut params: Vec<(String, rusqlite::types::Value)> = vec![];

    for (i, cond) in opts.filter.iter().enumerate() {
      if !valid_columns.contains(&cond.field.as_str()) {
        return Err(AppError::Validation(format!(
          "unknown filter field: {}",
          cond.field
        )));
      }

      let param_name = format!(":f{i}");
      let value = if matches!(cond.op, Op::Like | Op::NotLike) {
        match &cond.value {
          rusqlite::types::Value::Text(s) => {
            rusqlite::types::Value::Text(escape_like_operand(s))
          }
          other => other.clone(),
        }
      } else {
        cond.value.clone()
      };

      let clause = if matches!(cond.op, Op::Like | Op::NotLike) {
        format!(
          "{} {} {param_name} ESCAPE '\\'",
          quote_ident(&cond.field),
          cond.op.sql()
        )
      } else {
        format!("{} {} {param_name}", quote_ident(&cond.field), cond.op.sql())
      };

      where_clauses.push(clause);
      params.push((param_name, value));
    }

    if let Some(extra) = extra_where {
      if !extra.trim().is_empty() {
        where_clauses.push(format!("({extra})"));
      }
    }

    let where_sql = if where_clauses.is_empty() {
      String::new()
    } else {
      format!(" WHERE {}", where_clauses.join(" AND "))
    };

    let mut order_parts = vec![];
    for sort in &opts.sort {
      if !valid_columns.contains(&sort.field.as_str()) {
        return Err(AppError::Validation(format!(
          "unknown sort field: {}",
          sort.field
        )));
      }
      let dir = match sort.dir {
        SortDir::Asc => "ASC",
        SortDir::Desc => "DESC",
      };
      order_parts.push(format!("{} {}", quote_ident(&sort.field), dir));
    }
    // Ties broken by id for deterministic pagination.
    order_parts.push("\"id\" ASC".to_string());
    let order_sql = format!(" ORDER BY {}", order_parts.join(", "));

    let limit = opts.per_page();
    let offset = opts.offset();

    let table_q = quote_ident(table);
    let sql = format!(
      "SELECT * FROM {table_q}{where_sql}{order_sql} LIMIT {limit} OFFSET {offset}"
    );
    let count_sql = format!("SELECT COUNT(*) FROM {table_q}{where_sql}");

    return Ok(BuiltQuery {
      sql,
      count_sql,
      params,
    });
  }
}

pub fn total_pages(total_items: i64, per_page: i64) -> i64 {
  if total_items <= 0 {
    return 0;
  }
  return (total_items + per_page - 1) / per_page;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_like_escapes_special_chars() {
    assert_eq!(escape_like_operand("50% off"), "%50\\% off%");
    assert_eq!(escape_like_operand("a_b"), "%a\\_b%");
  }

  #[test]
  fn test_build_rejects_unknown_field() {
    let opts = QueryOptions {
      filter: vec![Condition {
        field: "nope".into(),
        op: Op::Eq,
        value: rusqlite::types::Value::Integer(1),
      }],
      ..Default::default()
    };
    let err = QueryBuilder::build("posts", &["id", "title"], None, &opts).unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
  }

  #[test]
  fn test_build_pagination_defaults() {
    let opts = QueryOptions::default();
    let built = QueryBuilder::build("posts", &["id"], None, &opts).unwrap();
    assert!(built.sql.contains("LIMIT 30 OFFSET 0"));
    assert!(!built.sql.contains("WHERE"));
  }

  #[test]
  fn test_total_pages() {
    assert_eq!(total_pages(5, 2), 3);
    assert_eq!(total_pages(0, 2), 0);
    assert_eq!(total_pages(4, 2), 2);
  }
}
