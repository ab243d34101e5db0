#![allow(clippy::needless_return)]

//! The database gateway: a typed async facade over a single writer-thread
//! `rusqlite::Connection`. No schema knowledge lives here -- just parameterized
//! query/exec, transactions, and connection lifecycle.

pub mod connection;
pub mod error;
pub mod params;
pub mod rows;

pub use connection::{connect_sqlite, Connection, Result};
pub use error::Error;
pub use params::{NamedParams, Params, ToSqlType};
pub use rows::{Row, Rows, ValueType};
pub use rusqlite::types::Value;
