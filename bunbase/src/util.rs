//! Small free functions shared across subsystems: id generation and identifier validation.

use rand::distr::{Distribution, Uniform};
use rand::rng;

use crate::constants::ID_LENGTH;

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// A 12-char URL-safe random token, used as the primary key of every record.
pub fn generate_record_id() -> String {
  return generate_random_string(ID_LENGTH);
}

pub fn generate_random_string(len: usize) -> String {
  let mut rng = rng();
  let dist = Uniform::new(0, ID_ALPHABET.len()).expect("non-empty alphabet");
  return (0..len)
    .map(|_| ID_ALPHABET[dist.sample(&mut rng)] as char)
    .collect();
}

pub fn now_rfc3339() -> String {
  return chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
}

/// `[a-zA-Z][a-zA-Z0-9_]*`, matching collection and field name rules (§3).
pub fn is_valid_identifier(name: &str) -> bool {
  let mut chars = name.chars();
  let Some(first) = chars.next() else {
    return false;
  };
  if !first.is_ascii_alphabetic() {
    return false;
  }
  return chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_generate_record_id_length_and_charset() {
    let id = generate_record_id();
    assert_eq!(id.len(), ID_LENGTH);
    assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
  }

  #[test]
  fn test_is_valid_identifier() {
    assert!(is_valid_identifier("posts"));
    assert!(is_valid_identifier("a1_b2"));
    assert!(!is_valid_identifier("_posts"));
    assert!(!is_valid_identifier("1posts"));
    assert!(!is_valid_identifier("post-s"));
    assert!(!is_valid_identifier(""));
  }
}
