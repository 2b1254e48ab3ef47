//! Namespace naming rules and deterministic relational identifiers.

use std::fmt;

use super::{StorageError, StorageResult, METADATA_TABLE};
use crate::backend::Dialect;

pub const MAX_DATABASE_NAME: usize = 63;
pub const MAX_COLLECTION_NAME: usize = 235;

const RESERVED_PREFIX: &str = "_docwire";
const FORBIDDEN_DB_CHARS: &[char] = &['/', '\\', '.', '"', '$', '*', '<', '>', ':', '|', '?', ' ', '\0'];

/// A `(database, collection)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Splits `db.coll` at the first dot.
    pub fn parse(full: &str) -> StorageResult<Self> {
        match full.split_once('.') {
            Some((db, coll)) => {
                validate_database_name(db)?;
                validate_collection_name(coll)?;
                Ok(Self::new(db, coll))
            }
            None => Err(StorageError::InvalidNamespace(full.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

pub fn validate_database_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.len() > MAX_DATABASE_NAME {
        return Err(StorageError::InvalidNamespace(format!(
            "database name must be 1 to {} bytes: '{}'",
            MAX_DATABASE_NAME, name
        )));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_DB_CHARS.contains(c)) {
        return Err(StorageError::InvalidNamespace(format!(
            "database name '{}' contains an invalid character {:?}",
            name, c
        )));
    }
    if name.starts_with("pg_") {
        return Err(StorageError::InvalidNamespace(format!(
            "database name '{}' uses a reserved prefix",
            name
        )));
    }
    Ok(())
}

pub fn validate_collection_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.len() > MAX_COLLECTION_NAME {
        return Err(StorageError::InvalidNamespace(format!(
            "collection name must be 1 to {} bytes: '{}'",
            MAX_COLLECTION_NAME, name
        )));
    }
    if name.contains('$') || name.contains('\0') {
        return Err(StorageError::InvalidNamespace(format!(
            "collection name '{}' contains an invalid character",
            name
        )));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(StorageError::InvalidNamespace(format!(
            "collection name '{}' uses a reserved prefix",
            name
        )));
    }
    Ok(())
}

/// Schema identifier for a database.
pub fn schema_ident(dialect: &dyn Dialect, db: &str) -> String {
    mangle(dialect, db)
}

/// Table identifier for a collection.
pub fn table_ident(dialect: &dyn Dialect, coll: &str) -> String {
    let table = mangle(dialect, coll);
    debug_assert_ne!(table, METADATA_TABLE);
    table
}

/// Keeps `name` when the backend can represent it verbatim, otherwise
/// derives `<lowercased prefix>_<seahash>`.
fn mangle(dialect: &dyn Dialect, name: &str) -> String {
    let limit = dialect.max_identifier_len();
    let case_clash = dialect.folds_identifier_case() && name.chars().any(char::is_uppercase);
    if name.len() <= limit && !case_clash {
        return name.to_string();
    }
    let hash = format!("{:08x}", seahash::hash(name.as_bytes()) as u32);
    let lower = name.to_lowercase();
    let mut cut = limit.saturating_sub(hash.len() + 1).min(lower.len());
    while !lower.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{}", &lower[..cut], hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::postgres::PostgresDialect;
    use crate::backend::sqlite::SqliteDialect;

    #[test]
    fn test_database_name_rules() {
        assert!(validate_database_name("test").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("a.b").is_err());
        assert!(validate_database_name("a b").is_err());
        assert!(validate_database_name("pg_catalog").is_err());
        assert!(validate_database_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_collection_name_rules() {
        assert!(validate_collection_name("values").is_ok());
        assert!(validate_collection_name("system.profile").is_ok());
        assert!(validate_collection_name("a$b").is_err());
        assert!(validate_collection_name("_docwire_collections").is_err());
        assert!(validate_collection_name("").is_err());
    }

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("test.a.b").unwrap();
        assert_eq!(ns.db, "test");
        assert_eq!(ns.coll, "a.b");
        assert_eq!(ns.to_string(), "test.a.b");
        assert!(Namespace::parse("nodot").is_err());
    }

    #[test]
    fn test_identifiers_are_deterministic() {
        let pg = PostgresDialect;
        assert_eq!(table_ident(&pg, "Values"), "Values");
        let long = "c".repeat(100);
        let first = table_ident(&pg, &long);
        assert_eq!(first, table_ident(&pg, &long));
        assert_eq!(first.len(), 63);
        assert!(first.starts_with("ccc"));

        let sqlite = SqliteDialect;
        let upper = table_ident(&sqlite, "Values");
        assert_ne!(upper, table_ident(&sqlite, "values"));
        assert!(upper.starts_with("values_"));
        assert_eq!(upper.len(), "values_".len() + 8);
        assert_eq!(schema_ident(&sqlite, "test"), "test");
    }
}
