//! Auth subsystem (§4.7): issues and verifies bearer tokens, resolves a token to an admin or
//! user principal, and hashes/verifies passwords with a memory-hard algorithm.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use bunbase_sqlite::{params, Connection};

use crate::constants::{ADMINS_TABLE, DEFAULT_TOKEN_TTL_SECS};
use crate::error::AppError;
use crate::rules::AuthContext;
use crate::schema::SchemaRegistry;
use crate::util::{generate_record_id, generate_random_string, now_rfc3339};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
  Admin,
  User,
}

/// The JWT payload: `{subject, kind, exp}` (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
  pub sub: String,
  pub kind: PrincipalKind,
  pub exp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Admin {
  pub id: String,
  pub email: String,
}

fn hash_password(password: &str) -> Result<String, AppError> {
  let salt = SaltString::generate(&mut rand_core_06::OsRng);
  let hash = Argon2::default()
    .hash_password(password.as_bytes(), &salt)
    .map_err(|err| AppError::internal(std::io::Error::other(err.to_string())))?;
  return Ok(hash.to_string());
}

/// Constant-time verification via argon2's own comparison (§4.7).
fn verify_password(password: &str, hash: &str) -> Result<bool, AppError> {
  let parsed = PasswordHash::new(hash)
    .map_err(|err| AppError::internal(std::io::Error::other(err.to_string())))?;
  return Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok());
}

/// Mints and verifies bearer tokens and owns the `_admins` bootstrap/login/password flows.
pub struct AuthService {
  conn: Connection,
  schema: Arc<SchemaRegistry>,
  encoding_key: EncodingKey,
  decoding_key: DecodingKey,
  token_ttl_secs: i64,
}

impl AuthService {
  pub fn new(conn: Connection, schema: Arc<SchemaRegistry>, jwt_secret: &str) -> Self {
    return Self {
      conn,
      schema,
      encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
      decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
      token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
    };
  }

  /// Creates the initial `admin@<default>` row with a random password, logged once, if
  /// `_admins` is empty (§4.7). No-op otherwise.
  pub async fn bootstrap_initial_admin(&self, default_domain: &str) -> Result<(), AppError> {
    let count: i64 = self
      .conn
      .query_value(&format!("SELECT COUNT(*) FROM {ADMINS_TABLE}"), ())
      .await
      .map_err(AppError::from)?
      .unwrap_or(0);
    if count > 0 {
      return Ok(());
    }

    let email = format!("admin@{default_domain}");
    let password = generate_random_string(20);
    let hash = hash_password(&password)?;
    let id = generate_record_id();
    let now = now_rfc3339();

    self
      .conn
      .execute(
        &format!(
          "INSERT INTO {ADMINS_TABLE} (id, email, password_hash, created_at, updated_at) VALUES (:id, :email, :hash, :now, :now)"
        ),
        vec![
          (":id".to_string(), rusqlite::types::Value::Text(id)),
          (":email".to_string(), rusqlite::types::Value::Text(email.clone())),
          (":hash".to_string(), rusqlite::types::Value::Text(hash)),
          (":now".to_string(), rusqlite::types::Value::Text(now)),
        ],
      )
      .await
      .map_err(AppError::from)?;

    log::warn!("created initial admin '{email}' with password: {password}");
    return Ok(());
  }

  pub async fn login_admin(&self, email: &str, password: &str) -> Result<(Admin, String), AppError> {
    let row = self
      .conn
      .query_row(
        &format!("SELECT id, email, password_hash FROM {ADMINS_TABLE} WHERE email = :email"),
        params!(email.to_string()),
      )
      .await
      .map_err(AppError::from)?
      .ok_or(AppError::Unauthorized)?;

    let id: String = row.get(0).map_err(AppError::from)?;
    let stored_email: String = row.get(1).map_err(AppError::from)?;
    let hash: String = row.get(2).map_err(AppError::from)?;

    if !verify_password(password, &hash)? {
      return Err(AppError::Unauthorized);
    }

    let token = self.issue_token(&id, PrincipalKind::Admin)?;
    return Ok((
      Admin {
        id,
        email: stored_email,
      },
      token,
    ));
  }

  pub async fn change_admin_password(
    &self,
    admin_id: &str,
    old_password: &str,
    new_password: &str,
  ) -> Result<(), AppError> {
    let row = self
      .conn
      .query_row(
        &format!("SELECT password_hash FROM {ADMINS_TABLE} WHERE id = :id"),
        params!(admin_id.to_string()),
      )
      .await
      .map_err(AppError::from)?
      .ok_or(AppError::Unauthorized)?;
    let hash: String = row.get(0).map_err(AppError::from)?;

    if !verify_password(old_password, &hash)? {
      return Err(AppError::Unauthorized);
    }

    let new_hash = hash_password(new_password)?;
    let now = now_rfc3339();
    self
      .conn
      .execute(
        &format!("UPDATE {ADMINS_TABLE} SET password_hash = :hash, updated_at = :now WHERE id = :id"),
        vec![
          (":hash".to_string(), rusqlite::types::Value::Text(new_hash)),
          (":now".to_string(), rusqlite::types::Value::Text(now)),
          (":id".to_string(), rusqlite::types::Value::Text(admin_id.to_string())),
        ],
      )
      .await
      .map_err(AppError::from)?;
    return Ok(());
  }

  /// User-record login against an `auth`-kind collection's `email`/`password_hash` columns.
  pub async fn login_user(
    &self,
    collection: &str,
    email: &str,
    password: &str,
  ) -> Result<(String, String), AppError> {
    let coll = self
      .schema
      .get_collection(collection)
      .ok_or_else(|| AppError::NotFound(format!("collection '{collection}' not found")))?;
    if coll.kind != crate::schema::CollectionKind::Auth {
      return Err(AppError::Validation(format!(
        "collection '{collection}' is not an auth collection"
      )));
    }

    let row = self
      .conn
      .query_row(
        &format!(
          "SELECT \"id\", \"password_hash\" FROM {} WHERE \"email\" = :email",
          crate::schema::quote_ident(collection)
        ),
        params!(email.to_string()),
      )
      .await
      .map_err(AppError::from)?
      .ok_or(AppError::Unauthorized)?;

    let id: String = row.get(0).map_err(AppError::from)?;
    let hash: String = row.get(1).map_err(AppError::from)?;
    if !verify_password(password, &hash)? {
      return Err(AppError::Unauthorized);
    }

    let token = self.issue_token(&id, PrincipalKind::User)?;
    return Ok((id, token));
  }

  pub fn issue_token(&self, subject: &str, kind: PrincipalKind) -> Result<String, AppError> {
    let exp = chrono::Utc::now().timestamp() + self.token_ttl_secs;
    let claims = Claims {
      sub: subject.to_string(),
      kind,
      exp,
    };
    return jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
      .map_err(|err| AppError::internal(std::io::Error::other(err.to_string())));
  }

  /// Resolves a bearer token to a principal, or `None` if absent/invalid/expired (§4.7).
  pub fn resolve(&self, bearer_token: Option<&str>) -> Option<AuthContext> {
    let token = bearer_token?;
    let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &Validation::default()).ok()?;
    return Some(AuthContext {
      id: Some(data.claims.sub),
      is_admin: data.claims.kind == PrincipalKind::Admin,
    });
  }

  /// Looks up an admin principal by id, for `/admin/auth/me` (§6).
  pub async fn get_admin(&self, id: &str) -> Result<Admin, AppError> {
    let row = self
      .conn
      .query_row(
        &format!("SELECT id, email FROM {ADMINS_TABLE} WHERE id = :id"),
        params!(id.to_string()),
      )
      .await
      .map_err(AppError::from)?
      .ok_or(AppError::Unauthorized)?;
    return Ok(Admin {
      id: row.get(0).map_err(AppError::from)?,
      email: row.get(1).map_err(AppError::from)?,
    });
  }

  /// Raises `Unauthorized` unless `ctx` resolves to an admin principal (§4.7).
  pub fn require_admin(&self, ctx: &Option<AuthContext>) -> Result<(), AppError> {
    return match ctx {
      Some(auth) if auth.is_admin => Ok(()),
      _ => Err(AppError::Unauthorized),
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn service() -> AuthService {
    let conn = Connection::open_in_memory().await.unwrap();
    let schema = Arc::new(SchemaRegistry::new(conn.clone()).await.unwrap());
    return AuthService::new(conn, schema, "test-secret");
  }

  #[tokio::test]
  async fn test_bootstrap_creates_admin_once() {
    let service = service().await;
    service.bootstrap_initial_admin("local.test").await.unwrap();
    let count: i64 = service
      .conn
      .query_value(&format!("SELECT COUNT(*) FROM {ADMINS_TABLE}"), ())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(count, 1);

    service.bootstrap_initial_admin("local.test").await.unwrap();
    let count_again: i64 = service
      .conn
      .query_value(&format!("SELECT COUNT(*) FROM {ADMINS_TABLE}"), ())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(count_again, 1);
  }

  #[tokio::test]
  async fn test_token_roundtrip_resolves_admin() {
    let service = service().await;
    let token = service.issue_token("abc123", PrincipalKind::Admin).unwrap();
    let ctx = service.resolve(Some(&token)).unwrap();
    assert_eq!(ctx.id.as_deref(), Some("abc123"));
    assert!(ctx.is_admin);
  }

  #[tokio::test]
  async fn test_resolve_rejects_garbage_token() {
    let service = service().await;
    assert!(service.resolve(Some("not-a-jwt")).is_none());
    assert!(service.resolve(None).is_none());
  }

  #[tokio::test]
  async fn test_require_admin() {
    let service = service().await;
    assert!(service.require_admin(&None).is_err());
    let user_ctx = Some(AuthContext {
      id: Some("u1".into()),
      is_admin: false,
    });
    assert!(service.require_admin(&user_ctx).is_err());
    let admin_ctx = Some(AuthContext {
      id: Some("a1".into()),
      is_admin: true,
    });
    assert!(service.require_admin(&admin_ctx).is_ok());
  }

  #[tokio::test]
  async fn test_password_hash_and_verify() {
    let hash = hash_password("correct horse battery staple").unwrap();
    assert!(verify_password("correct horse battery staple", &hash).unwrap());
    assert!(!verify_password("wrong", &hash).unwrap());
  }

  #[tokio::test]
  async fn test_admin_login_flow() {
    let service = service().await;
    service.bootstrap_initial_admin("local.test").await.unwrap();

    let wrong = service.login_admin("admin@local.test", "wrong-password").await;
    assert!(matches!(wrong, Err(AppError::Unauthorized)));
  }
}
