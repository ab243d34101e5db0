//! Query-string filter parsing (§6): turns `field`/`field[sigil]` keys plus the reserved `page`,
//! `perPage`, `sort`, `expand` keys into a [`QueryOptions`].
//!
//! Deliberately does not rely on a generic key/value query-string splitter. Per §6 the operator
//! sigil is part of the key and `=` is the delimiter, but the two-character sigils (`>=`, `<=`,
//! `!=`, `!~`) reuse that very delimiter as their own trailing character -- `views>=10` contains
//! exactly one `=`. A naive first-`=`-split would read that as field `views>` with value `10`,
//! losing the distinction between `>` (Gt) and `>=` (Gte). Instead each whole segment is decoded
//! first, then scanned for an identifier prefix followed by the longest matching sigil; any `=`
//! immediately following the sigil is then an explicit delimiter and is consumed too.

use rusqlite::types::Value as SqlValue;

use crate::error::AppError;
use crate::query::{Condition, Op, QueryOptions, SortDir, SortKey};
use crate::schema::{Collection, FieldType};

const SIGILS: &[(&str, Op)] = &[
  ("!=", Op::Neq),
  ("!~", Op::NotLike),
  (">=", Op::Gte),
  ("<=", Op::Lte),
  (">", Op::Gt),
  ("<", Op::Lt),
  ("~", Op::Like),
  ("=", Op::Eq),
];

/// Percent-decodes a whole `key[sigil][=]value` segment at once, so a literal `=` inside the
/// value (post sigil) is never mistaken for the field/value delimiter.
fn decode_segment(raw: &str) -> String {
  let synthetic = format!("x={raw}");
  return form_urlencoded::parse(synthetic.as_bytes())
    .next()
    .map(|(_, value)| value.into_owned())
    .unwrap_or_default();
}

fn split_field_and_op(decoded: &str) -> Option<(&str, Op, &str)> {
  let bytes = decoded.as_bytes();
  let mut end = 0;
  while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
    end += 1;
  }
  if end == 0 {
    return None;
  }
  let field = &decoded[..end];
  let rest = &decoded[end..];
  for (sigil, op) in SIGILS {
    if let Some(after_sigil) = rest.strip_prefix(sigil) {
      let value = after_sigil.strip_prefix('=').unwrap_or(after_sigil);
      return Some((field, *op, value));
    }
  }
  return None;
}

fn coerce_filter_value(field_type: Option<FieldType>, raw: &str) -> Result<SqlValue, AppError> {
  return match field_type {
    Some(FieldType::Number) => raw
      .parse::<f64>()
      .map(SqlValue::Real)
      .map_err(|_| AppError::Validation(format!("invalid number: {raw}"))),
    Some(FieldType::Boolean) => match raw {
      "true" => Ok(SqlValue::Integer(1)),
      "false" => Ok(SqlValue::Integer(0)),
      _ => Err(AppError::Validation(format!("invalid boolean: {raw}"))),
    },
    _ => Ok(SqlValue::Text(raw.to_string())),
  };
}

/// Parses a raw (undecoded) query string into [`QueryOptions`], validating every filter/sort
/// field against `collection`'s columns.
pub fn parse_query_options(raw: &str, collection: &Collection) -> Result<QueryOptions, AppError> {
  let mut opts = QueryOptions::default();
  if raw.is_empty() {
    return Ok(opts);
  }

  let valid_columns = collection.column_names();

  for segment in raw.split('&') {
    if segment.is_empty() {
      continue;
    }
    let decoded = decode_segment(segment);
    let (field, op, value) = split_field_and_op(&decoded)
      .ok_or_else(|| AppError::Validation(format!("malformed query parameter: {segment}")))?;

    match field {
      "page" => opts.page = value.parse().ok(),
      "perPage" => opts.per_page = value.parse().ok(),
      "sort" => {
        for key in value.split(',') {
          let key = key.trim();
          if key.is_empty() {
            continue;
          }
          let (dir, name) = match key.strip_prefix('-') {
            Some(stripped) => (SortDir::Desc, stripped),
            None => (SortDir::Asc, key),
          };
          if !valid_columns.contains(&name) {
            return Err(AppError::Validation(format!("unknown sort field: {name}")));
          }
          opts.sort.push(SortKey {
            field: name.to_string(),
            dir,
          });
        }
      }
      "expand" => {
        opts.expand = value
          .split(',')
          .map(str::trim)
          .filter(|s| !s.is_empty())
          .map(str::to_string)
          .collect();
      }
      field_name => {
        if !valid_columns.contains(&field_name) {
          return Err(AppError::Validation(format!("unknown filter field: {field_name}")));
        }
        let field_type = collection.field(field_name).map(|f| f.field_type);
        opts.filter.push(Condition {
          field: field_name.to_string(),
          op,
          value: coerce_filter_value(field_type, value)?,
        });
      }
    }
  }

  return Ok(opts);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::schema::{CollectionKind, Field, FieldOptions};

  fn posts() -> Collection {
    return Collection {
      name: "posts".into(),
      kind: CollectionKind::Base,
      fields: vec![
        Field {
          name: "title".into(),
          field_type: FieldType::Text,
          required: false,
          options: FieldOptions::default(),
        },
        Field {
          name: "views".into(),
          field_type: FieldType::Number,
          required: false,
          options: FieldOptions::default(),
        },
      ],
      list_rule: None,
      view_rule: None,
      create_rule: None,
      update_rule: None,
      delete_rule: None,
    };
  }

  #[test]
  fn test_gte_sigil_reuses_delimiter() {
    let opts = parse_query_options("views>=10&sort=-views&perPage=2&page=1", &posts()).unwrap();
    assert_eq!(opts.filter.len(), 1);
    assert_eq!(opts.filter[0].op, Op::Gte);
    assert_eq!(opts.filter[0].value, SqlValue::Real(10.0));
    assert_eq!(opts.page, Some(1));
    assert_eq!(opts.per_page, Some(2));
    assert_eq!(opts.sort[0].dir, SortDir::Desc);
  }

  #[test]
  fn test_gt_sigil_without_trailing_delimiter() {
    let opts = parse_query_options("views>10", &posts()).unwrap();
    assert_eq!(opts.filter[0].op, Op::Gt);
    assert_eq!(opts.filter[0].value, SqlValue::Real(10.0));
  }

  #[test]
  fn test_like_sigil_requires_explicit_delimiter() {
    let opts = parse_query_options("title~=50%25", &posts()).unwrap();
    assert_eq!(opts.filter[0].op, Op::Like);
    assert_eq!(opts.filter[0].value, SqlValue::Text("50%".to_string()));
  }

  #[test]
  fn test_plain_equality() {
    let opts = parse_query_options("title=hello", &posts()).unwrap();
    assert_eq!(opts.filter[0].op, Op::Eq);
    assert_eq!(opts.filter[0].value, SqlValue::Text("hello".to_string()));
  }

  #[test]
  fn test_unknown_field_rejected() {
    let err = parse_query_options("nope=1", &posts()).unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
  }

  #[test]
  fn test_expand_splits_on_comma() {
    let opts = parse_query_options("expand=author,editor", &posts()).unwrap();
    assert_eq!(opts.expand, vec!["author".to_string(), "editor".to_string()]);
  }
}
