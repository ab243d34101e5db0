//! Rule evaluator (§4.6): a small, auditable recursive-descent parser over a tiny comparison
//! grammar, with two interpreters -- an in-memory predicate evaluator for single-record actions,
//! and a SQL lowering pass used to project list rules into a `WHERE` clause.
//!
//! Per §9 design notes this deliberately does not reuse a generic expression-evaluation crate:
//! the grammar is small and the whole thing must stay auditable in one file.

use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::AppError;
use crate::query::Op;
use crate::schema::quote_ident;

/// The evaluating principal, or none for an anonymous caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
  pub id: Option<String>,
  pub is_admin: bool,
}

impl AuthContext {
  pub fn anonymous() -> Self {
    return Self::default();
  }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
  Ident(String),
  AtRecord,
  AtRequestAuthId,
  AtRequestAuthRole,
  String(String),
  Number(f64),
  Bool(bool),
  Null,
  Op(Op),
  And,
  Or,
  LParen,
  RParen,
  Dot,
}

fn tokenize(src: &str) -> Result<Vec<Token>, AppError> {
  let mut tokens = vec![];
  let chars: Vec<char> = src.chars().collect();
  let mut i = 0;

  while i < chars.len() {
    let c = chars[i];
    if c.is_whitespace() {
      i += 1;
      continue;
    }

    match c {
      '(' => {
        tokens.push(Token::LParen);
        i += 1;
      }
      ')' => {
        tokens.push(Token::RParen);
        i += 1;
      }
      '.' => {
        tokens.push(Token::Dot);
        i += 1;
      }
      '&' if chars.get(i + 1) == Some(&'&') => {
        tokens.push(Token::And);
        i += 2;
      }
      '|' if chars.get(i + 1) == Some(&'|') => {
        tokens.push(Token::Or);
        i += 2;
      }
      '=' => {
        tokens.push(Token::Op(Op::Eq));
        i += 1;
      }
      '!' if chars.get(i + 1) == Some(&'=') => {
        tokens.push(Token::Op(Op::Neq));
        i += 2;
      }
      '!' if chars.get(i + 1) == Some(&'~') => {
        tokens.push(Token::Op(Op::NotLike));
        i += 2;
      }
      '~' => {
        tokens.push(Token::Op(Op::Like));
        i += 1;
      }
      '>' if chars.get(i + 1) == Some(&'=') => {
        tokens.push(Token::Op(Op::Gte));
        i += 2;
      }
      '>' => {
        tokens.push(Token::Op(Op::Gt));
        i += 1;
      }
      '<' if chars.get(i + 1) == Some(&'=') => {
        tokens.push(Token::Op(Op::Lte));
        i += 2;
      }
      '<' => {
        tokens.push(Token::Op(Op::Lt));
        i += 1;
      }
      '\'' | '"' => {
        let quote = c;
        i += 1;
        let start = i;
        while i < chars.len() && chars[i] != quote {
          i += 1;
        }
        if i >= chars.len() {
          return Err(AppError::Validation("unterminated string literal in rule".into()));
        }
        tokens.push(Token::String(chars[start..i].iter().collect()));
        i += 1;
      }
      '@' => {
        // @request.auth.id | @request.auth.role | @record.field
        let start = i;
        i += 1;
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '.' || chars[i] == '_') {
          i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        match word.as_str() {
          "@request.auth.id" => tokens.push(Token::AtRequestAuthId),
          "@request.auth.role" => tokens.push(Token::AtRequestAuthRole),
          "@record" => tokens.push(Token::AtRecord),
          other => {
            return Err(AppError::Validation(format!("unknown reference: {other}")));
          }
        }
      }
      c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
        let start = i;
        i += 1;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
          i += 1;
        }
        let text: String = chars[start..i].iter().collect();
        let n: f64 = text
          .parse()
          .map_err(|_| AppError::Validation(format!("invalid number literal: {text}")))?;
        tokens.push(Token::Number(n));
      }
      c if c.is_alphabetic() || c == '_' => {
        let start = i;
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
          i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        match word.as_str() {
          "true" => tokens.push(Token::Bool(true)),
          "false" => tokens.push(Token::Bool(false)),
          "null" => tokens.push(Token::Null),
          _ => tokens.push(Token::Ident(word)),
        }
      }
      other => {
        return Err(AppError::Validation(format!("unexpected character '{other}' in rule")));
      }
    }
  }

  return Ok(tokens);
}

#[derive(Debug, Clone)]
enum Expr {
  Literal(Literal),
  Field(String),
  RecordField(String),
  AuthId,
  AuthRole,
  Compare(Box<Expr>, Op, Box<Expr>),
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum Literal {
  String(String),
  Number(f64),
  Bool(bool),
  Null,
}

impl fmt::Display for Literal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    return match self {
      Literal::String(s) => write!(f, "{s}"),
      Literal::Number(n) => write!(f, "{n}"),
      Literal::Bool(b) => write!(f, "{b}"),
      Literal::Null => write!(f, "null"),
    };
  }
}

struct Parser {
  tokens: Vec<Token>,
  pos: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Token> {
    return self.tokens.get(self.pos);
  }

  fn next(&mut self) -> Option<Token> {
    let t = self.tokens.get(self.pos).cloned();
    self.pos += 1;
    return t;
  }

  fn expect(&mut self, tok: &Token) -> Result<(), AppError> {
    if self.peek() == Some(tok) {
      self.pos += 1;
      return Ok(());
    }
    return Err(AppError::Validation(format!(
      "expected {tok:?} in rule expression"
    )));
  }

  // or_expr := and_expr ('||' and_expr)*
  fn parse_or(&mut self) -> Result<Expr, AppError> {
    let mut lhs = self.parse_and()?;
    while self.peek() == Some(&Token::Or) {
      self.pos += 1;
      let rhs = self.parse_and()?;
      lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
    }
    return Ok(lhs);
  }

  // and_expr := atom ('&&' atom)*
  fn parse_and(&mut self) -> Result<Expr, AppError> {
    let mut lhs = self.parse_atom()?;
    while self.peek() == Some(&Token::And) {
      self.pos += 1;
      let rhs = self.parse_atom()?;
      lhs = Expr::And(Box::new(lhs), Box::new(rhs));
    }
    return Ok(lhs);
  }

  // atom := '(' or_expr ')' | comparison
  fn parse_atom(&mut self) -> Result<Expr, AppError> {
    if self.peek() == Some(&Token::LParen) {
      self.pos += 1;
      let inner = self.parse_or()?;
      self.expect(&Token::RParen)?;
      return Ok(inner);
    }
    return self.parse_comparison();
  }

  // comparison := operand op operand
  fn parse_comparison(&mut self) -> Result<Expr, AppError> {
    let lhs = self.parse_operand()?;
    let Some(Token::Op(op)) = self.peek().cloned() else {
      return Err(AppError::Validation("expected comparison operator in rule".into()));
    };
    self.pos += 1;
    let rhs = self.parse_operand()?;
    return Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)));
  }

  fn parse_operand(&mut self) -> Result<Expr, AppError> {
    return match self.next() {
      Some(Token::String(s)) => Ok(Expr::Literal(Literal::String(s))),
      Some(Token::Number(n)) => Ok(Expr::Literal(Literal::Number(n))),
      Some(Token::Bool(b)) => Ok(Expr::Literal(Literal::Bool(b))),
      Some(Token::Null) => Ok(Expr::Literal(Literal::Null)),
      Some(Token::AtRequestAuthId) => Ok(Expr::AuthId),
      Some(Token::AtRequestAuthRole) => Ok(Expr::AuthRole),
      Some(Token::AtRecord) => {
        self.expect(&Token::Dot)?;
        match self.next() {
          Some(Token::Ident(field)) => Ok(Expr::RecordField(field)),
          _ => Err(AppError::Validation("expected field name after @record.".into())),
        }
      }
      Some(Token::Ident(name)) => Ok(Expr::Field(name)),
      other => Err(AppError::Validation(format!(
        "unexpected token in rule expression: {other:?}"
      ))),
    };
  }
}

/// A compiled rule expression, ready to be evaluated as a predicate or lowered to SQL.
pub struct Rule {
  expr: Expr,
}

impl Rule {
  pub fn parse(source: &str) -> Result<Rule, AppError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
      return Err(AppError::Validation("trailing tokens in rule expression".into()));
    }
    return Ok(Rule { expr });
  }
}

/// Context for the in-memory predicate interpreter.
pub struct PredicateContext<'a> {
  pub record: &'a serde_json::Map<String, JsonValue>,
  pub auth: &'a AuthContext,
}

fn literal_to_json(lit: &Literal) -> JsonValue {
  return match lit {
    Literal::String(s) => JsonValue::String(s.clone()),
    Literal::Number(n) => serde_json::Number::from_f64(*n)
      .map(JsonValue::Number)
      .unwrap_or(JsonValue::Null),
    Literal::Bool(b) => JsonValue::Bool(*b),
    Literal::Null => JsonValue::Null,
  };
}

fn resolve_operand(expr: &Expr, ctx: &PredicateContext) -> Result<JsonValue, AppError> {
  return match expr {
    Expr::Literal(lit) => Ok(literal_to_json(lit)),
    Expr::Field(name) | Expr::RecordField(name) => {
      Ok(ctx.record.get(name).cloned().unwrap_or(JsonValue::Null))
    }
    Expr::AuthId => Ok(ctx
      .auth
      .id
      .clone()
      .map(JsonValue::String)
      .unwrap_or(JsonValue::String(String::new()))),
    Expr::AuthRole => Ok(JsonValue::String(
      if ctx.auth.is_admin {
        "admin".to_string()
      } else if ctx.auth.id.is_some() {
        "user".to_string()
      } else {
        String::new()
      },
    )),
    _ => Err(AppError::Internal("non-operand expression".into())),
  };
}

fn compare_json(lhs: &JsonValue, op: Op, rhs: &JsonValue) -> bool {
  let ordering = match (lhs, rhs) {
    (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
    (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
    (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
    _ => None,
  };

  return match op {
    Op::Eq => lhs == rhs,
    Op::Neq => lhs != rhs,
    Op::Gt => ordering.is_some_and(|o| o.is_gt()),
    Op::Lt => ordering.is_some_and(|o| o.is_lt()),
    Op::Gte => ordering.is_some_and(|o| o.is_ge()),
    Op::Lte => ordering.is_some_and(|o| o.is_le()),
    Op::Like => match (lhs, rhs) {
      (JsonValue::String(a), JsonValue::String(b)) => a.contains(b.as_str()),
      _ => false,
    },
    Op::NotLike => match (lhs, rhs) {
      (JsonValue::String(a), JsonValue::String(b)) => !a.contains(b.as_str()),
      _ => true,
    },
  };
}

fn eval_predicate(expr: &Expr, ctx: &PredicateContext) -> Result<bool, AppError> {
  return match expr {
    Expr::And(a, b) => Ok(eval_predicate(a, ctx)? && eval_predicate(b, ctx)?),
    Expr::Or(a, b) => Ok(eval_predicate(a, ctx)? || eval_predicate(b, ctx)?),
    Expr::Compare(lhs, op, rhs) => {
      let l = resolve_operand(lhs, ctx)?;
      let r = resolve_operand(rhs, ctx)?;
      Ok(compare_json(&l, *op, &r))
    }
    _ => Err(AppError::Validation("rule must be a boolean expression".into())),
  };
}

/// Admits or denies a single-record action. `rule` of `None` means admin-only.
pub fn admits(rule: Option<&str>, record: &serde_json::Map<String, JsonValue>, auth: &AuthContext) -> Result<bool, AppError> {
  if auth.is_admin {
    return Ok(true);
  }
  let Some(rule) = rule else {
    return Ok(false);
  };
  if rule.trim().is_empty() {
    return Ok(false);
  }

  let compiled = Rule::parse(rule)?;
  let ctx = PredicateContext { record, auth };
  return eval_predicate(&compiled.expr, &ctx);
}

/// SQL projection of a rule, for composing into a list query's `WHERE` clause (§4.6). Field
/// references become quoted column refs; auth references become bound parameters.
pub struct SqlProjection {
  pub sql: String,
  pub params: Vec<(String, rusqlite::types::Value)>,
}

fn lower_operand(
  expr: &Expr,
  auth: &AuthContext,
  param_idx: &mut usize,
  params: &mut Vec<(String, rusqlite::types::Value)>,
) -> Result<String, AppError> {
  return match expr {
    Expr::Literal(lit) => {
      let name = format!(":r{param_idx}");
      *param_idx += 1;
      let value = match lit {
        Literal::String(s) => rusqlite::types::Value::Text(s.clone()),
        Literal::Number(n) => rusqlite::types::Value::Real(*n),
        Literal::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Literal::Null => rusqlite::types::Value::Null,
      };
      params.push((name.clone(), value));
      Ok(name)
    }
    Expr::Field(name) | Expr::RecordField(name) => Ok(quote_ident(name)),
    Expr::AuthId => {
      let name = format!(":r{param_idx}");
      *param_idx += 1;
      params.push((
        name.clone(),
        rusqlite::types::Value::Text(auth.id.clone().unwrap_or_default()),
      ));
      Ok(name)
    }
    Expr::AuthRole => {
      let name = format!(":r{param_idx}");
      *param_idx += 1;
      let role = if auth.is_admin {
        "admin"
      } else if auth.id.is_some() {
        "user"
      } else {
        ""
      };
      params.push((name.clone(), rusqlite::types::Value::Text(role.to_string())));
      Ok(name)
    }
    _ => Err(AppError::Internal("non-operand expression".into())),
  };
}

fn lower(
  expr: &Expr,
  auth: &AuthContext,
  param_idx: &mut usize,
  params: &mut Vec<(String, rusqlite::types::Value)>,
) -> Result<String, AppError> {
  return match expr {
    Expr::And(a, b) => Ok(format!(
      "({}) AND ({})",
      lower(a, auth, param_idx, params)?,
      lower(b, auth, param_idx, params)?
    )),
    Expr::Or(a, b) => Ok(format!(
      "({}) OR ({})",
      lower(a, auth, param_idx, params)?,
      lower(b, auth, param_idx, params)?
    )),
    Expr::Compare(lhs, op, rhs) => {
      let l = lower_operand(lhs, auth, param_idx, params)?;
      let r = lower_operand(rhs, auth, param_idx, params)?;
      let sql_op = match op {
        Op::Eq => "=",
        Op::Neq => "!=",
        Op::Gt => ">",
        Op::Lt => "<",
        Op::Gte => ">=",
        Op::Lte => "<=",
        Op::Like => "LIKE",
        Op::NotLike => "NOT LIKE",
      };
      Ok(format!("{l} {sql_op} {r}"))
    }
    _ => Err(AppError::Validation("rule must be a boolean expression".into())),
  };
}

/// Lowers `rule` to a parameterized SQL predicate. A `None` or admin-admitting context lowers
/// to `1=1` / `1=0` so the caller can always `AND` it into a query unconditionally.
pub fn to_sql_projection(rule: Option<&str>, auth: &AuthContext) -> Result<SqlProjection, AppError> {
  if auth.is_admin {
    return Ok(SqlProjection {
      sql: "1=1".to_string(),
      params: vec![],
    });
  }

  let Some(rule) = rule else {
    return Ok(SqlProjection {
      sql: "1=0".to_string(),
      params: vec![],
    });
  };
  if rule.trim().is_empty() {
    return Ok(SqlProjection {
      sql: "1=0".to_string(),
      params: vec![],
    });
  }

  let compiled = Rule::parse(rule)?;
  let mut params = vec![];
  let mut idx = 0;
  let sql = lower(&compiled.expr, auth, &mut idx, &mut params)?;
  return Ok(SqlProjection { sql, params });
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(pairs: &[(&str, JsonValue)]) -> serde_json::Map<String, JsonValue> {
    return pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
  }

  #[test]
  fn test_none_rule_is_admin_only() {
    let rec = record(&[]);
    let auth = AuthContext::anonymous();
    assert!(!admits(None, &rec, &auth).unwrap());

    let admin = AuthContext {
      id: Some("x".into()),
      is_admin: true,
    };
    assert!(admits(None, &rec, &admin).unwrap());
  }

  #[test]
  fn test_auth_id_comparison() {
    let rec = record(&[]);
    let anon = AuthContext::anonymous();
    assert!(!admits(Some("@request.auth.id != ''"), &rec, &anon).unwrap());

    let user = AuthContext {
      id: Some("u1".into()),
      is_admin: false,
    };
    assert!(admits(Some("@request.auth.id != ''"), &rec, &user).unwrap());
  }

  #[test]
  fn test_field_comparison_and_composition() {
    let rec = record(&[("owner", json!("u1")), ("published", json!(true))]);
    let user = AuthContext {
      id: Some("u1".into()),
      is_admin: false,
    };
    assert!(admits(
      Some("owner = @request.auth.id && published = true"),
      &rec,
      &user
    )
    .unwrap());

    let other = AuthContext {
      id: Some("u2".into()),
      is_admin: false,
    };
    assert!(!admits(
      Some("owner = @request.auth.id && published = true"),
      &rec,
      &other
    )
    .unwrap());
  }

  #[test]
  fn test_or_and_parens() {
    let rec = record(&[("visibility", json!("public"))]);
    let anon = AuthContext::anonymous();
    assert!(admits(
      Some("visibility = 'public' || (@request.auth.id != '')"),
      &rec,
      &anon
    )
    .unwrap());
  }

  #[test]
  fn test_sql_projection_binds_auth_as_param() {
    let user = AuthContext {
      id: Some("u1".into()),
      is_admin: false,
    };
    let proj = to_sql_projection(Some("owner = @request.auth.id"), &user).unwrap();
    assert!(proj.sql.contains("\"owner\" ="));
    assert_eq!(proj.params.len(), 1);
  }

  #[test]
  fn test_sql_projection_admin_bypasses() {
    let admin = AuthContext {
      id: Some("a".into()),
      is_admin: true,
    };
    let proj = to_sql_projection(Some("owner = @request.auth.id"), &admin).unwrap();
    assert_eq!(proj.sql, "1=1");
  }
}
