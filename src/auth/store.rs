//! SQLite-backed credential store.
//!
//! Tables:
//! - `accounts`: identity, password hash, profile fields
//! - `roles`: named permission groups
//! - `account_roles`: many-to-many assignment
//!
//! Uniqueness of username, email, nickname and public identifier is enforced
//! by UNIQUE constraints; the store is the single source of truth, so two
//! concurrent registrations can never both win.

use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// A stored account. `password_hash` is a PHC string, never the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub public_id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub nickname: Option<String>,
    pub gender: Option<String>,
    pub age: Option<u32>,
    pub major: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Everything needed to create an account; `roles` are assigned in the same
/// transaction as the insert.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub public_id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub nickname: Option<String>,
    pub gender: Option<String>,
    pub age: Option<u32>,
    pub major: Option<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AccountWithRoles {
    pub account: Account,
    pub roles: Vec<String>,
}

/// Columns carrying a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Username,
    Email,
    Nickname,
    PublicId,
}

impl UniqueField {
    fn column(self) -> &'static str {
        match self {
            Self::Username => "username",
            Self::Email => "email",
            Self::Nickname => "nickname",
            Self::PublicId => "public_id",
        }
    }
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PublicId => "public identifier",
            other => other.column(),
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} already in use")]
    Duplicate(UniqueField),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("unknown account: {0}")]
    UnknownAccount(i64),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Persistence seam for accounts and role memberships.
pub trait CredentialStore: Send + Sync {
    /// Insert the account and its initial roles atomically.
    fn insert_account(&self, new: &NewAccount) -> Result<Account, StoreError>;

    fn find_by_id(&self, id: i64) -> Result<Option<Account>, StoreError>;

    /// Case-insensitive email lookup.
    fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError>;

    /// Case-insensitive check for username, email or nickname.
    fn is_taken(&self, field: UniqueField, value: &str) -> Result<bool, StoreError>;

    fn public_id_taken(&self, public_id: i64) -> Result<bool, StoreError>;

    /// Current role names of the account, sorted.
    fn roles_for(&self, account_id: i64) -> Result<Vec<String>, StoreError>;

    /// Create the role if it does not exist yet.
    fn ensure_role(&self, name: &str) -> Result<(), StoreError>;

    /// Returns `true` when the role was newly granted.
    fn assign_role(&self, account_id: i64, role: &str) -> Result<bool, StoreError>;

    /// Returns `true` when the role was held and is now removed.
    fn revoke_role(&self, account_id: i64, role: &str) -> Result<bool, StoreError>;

    fn list_accounts(&self) -> Result<Vec<AccountWithRoles>, StoreError>;

    fn account_count(&self) -> Result<u64, StoreError>;
}

const ACCOUNT_COLUMNS: &str = "id, public_id, username, email, password_hash, nickname, \
                               gender, age, major, created_at, updated_at";

/// SQLite-backed credential store.
pub struct SqliteCredentialStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the credential database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::with_connection(conn)
    }

    /// Private in-memory database, used by tests and the `--ephemeral` mode.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(rusqlite::Connection::open_in_memory()?)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                public_id INTEGER NOT NULL UNIQUE,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                nickname TEXT UNIQUE COLLATE NOCASE,
                gender TEXT,
                age INTEGER,
                major TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS roles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS account_roles (
                account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                PRIMARY KEY (account_id, role_id)
            );
            CREATE INDEX IF NOT EXISTS idx_account_roles_role ON account_roles(role_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_account(
        conn: &rusqlite::Connection,
        clause: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Option<Account>, StoreError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {clause}");
        match conn.query_row(&sql, [param], account_from_row) {
            Ok(account) => Ok(Some(account)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn role_id(conn: &rusqlite::Connection, role: &str) -> Result<i64, StoreError> {
        match conn.query_row(
            "SELECT id FROM roles WHERE name = ?1",
            rusqlite::params![role],
            |row| row.get(0),
        ) {
            Ok(id) => Ok(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::UnknownRole(role.into())),
            Err(e) => Err(e.into()),
        }
    }

    fn account_exists(conn: &rusqlite::Connection, account_id: i64) -> Result<(), StoreError> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE id = ?1)",
            rusqlite::params![account_id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::UnknownAccount(account_id))
        }
    }

    fn roles_with_conn(
        conn: &rusqlite::Connection,
        account_id: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = conn.prepare_cached(
            "SELECT r.name FROM account_roles ar
             JOIN roles r ON r.id = ar.role_id
             WHERE ar.account_id = ?1
             ORDER BY r.name",
        )?;
        let roles = stmt
            .query_map(rusqlite::params![account_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(roles)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn insert_account(&self, new: &NewAccount) -> Result<Account, StoreError> {
        let now = epoch_secs();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO accounts
                (public_id, username, email, password_hash, nickname, gender, age, major,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            rusqlite::params![
                new.public_id,
                new.username,
                new.email.to_lowercase(),
                new.password_hash,
                new.nickname,
                new.gender,
                new.age,
                new.major,
                now,
            ],
        );
        if let Err(e) = inserted {
            return Err(classify_constraint(e));
        }
        let id = tx.last_insert_rowid();

        for role in &new.roles {
            let role_id = Self::role_id(&tx, role)?;
            tx.execute(
                "INSERT OR IGNORE INTO account_roles (account_id, role_id) VALUES (?1, ?2)",
                rusqlite::params![id, role_id],
            )?;
        }

        let account = Self::query_account(&tx, "id = ?1", &id)?
            .ok_or(StoreError::UnknownAccount(id))?;
        tx.commit()?;
        Ok(account)
    }

    fn find_by_id(&self, id: i64) -> Result<Option<Account>, StoreError> {
        let conn = self.conn.lock();
        Self::query_account(&conn, "id = ?1", &id)
    }

    fn find_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        let conn = self.conn.lock();
        Self::query_account(&conn, "email = ?1 COLLATE NOCASE", &email.trim())
    }

    fn is_taken(&self, field: UniqueField, value: &str) -> Result<bool, StoreError> {
        if field == UniqueField::PublicId {
            return match value.parse::<i64>() {
                Ok(id) => self.public_id_taken(id),
                Err(_) => Ok(false),
            };
        }
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE {} = ?1 COLLATE NOCASE)",
            field.column()
        );
        let taken = conn.query_row(&sql, rusqlite::params![value.trim()], |row| row.get(0))?;
        Ok(taken)
    }

    fn public_id_taken(&self, public_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let taken = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE public_id = ?1)",
            rusqlite::params![public_id],
            |row| row.get(0),
        )?;
        Ok(taken)
    }

    fn roles_for(&self, account_id: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        Self::roles_with_conn(&conn, account_id)
    }

    fn ensure_role(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO roles (name) VALUES (?1)",
            rusqlite::params![name.trim()],
        )?;
        Ok(())
    }

    fn assign_role(&self, account_id: i64, role: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        Self::account_exists(&conn, account_id)?;
        let role_id = Self::role_id(&conn, role)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO account_roles (account_id, role_id) VALUES (?1, ?2)",
            rusqlite::params![account_id, role_id],
        )?;
        if inserted > 0 {
            tracing::info!(account_id, role, "role granted");
        }
        Ok(inserted > 0)
    }

    fn revoke_role(&self, account_id: i64, role: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        Self::account_exists(&conn, account_id)?;
        let role_id = Self::role_id(&conn, role)?;
        let deleted = conn.execute(
            "DELETE FROM account_roles WHERE account_id = ?1 AND role_id = ?2",
            rusqlite::params![account_id, role_id],
        )?;
        if deleted > 0 {
            tracing::info!(account_id, role, "role revoked");
        }
        Ok(deleted > 0)
    }

    fn list_accounts(&self) -> Result<Vec<AccountWithRoles>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"
        ))?;
        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        accounts
            .into_iter()
            .map(|account| {
                let roles = Self::roles_with_conn(&conn, account.id)?;
                Ok::<_, StoreError>(AccountWithRoles { account, roles })
            })
            .collect()
    }

    fn account_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        public_id: row.get(1)?,
        username: row.get(2)?,
        email: row.get(3)?,
        password_hash: row.get(4)?,
        nickname: row.get(5)?,
        gender: row.get(6)?,
        age: row.get(7)?,
        major: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Map a UNIQUE violation on `accounts` to the column that caused it.
fn classify_constraint(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, Some(msg)) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            for field in [
                UniqueField::Username,
                UniqueField::Email,
                UniqueField::Nickname,
                UniqueField::PublicId,
            ] {
                if msg.contains(&format!("accounts.{}", field.column())) {
                    return StoreError::Duplicate(field);
                }
            }
        }
    }
    StoreError::Database(err)
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> SqliteCredentialStore {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        for role in ["admin", "operator", "user"] {
            store.ensure_role(role).unwrap();
        }
        store
    }

    fn new_account(username: &str, email: &str, public_id: i64) -> NewAccount {
        NewAccount {
            public_id,
            username: username.into(),
            email: email.into(),
            password_hash: "$pbkdf2-sha256$i=1000,l=32$c2FsdA$aGFzaA".into(),
            nickname: None,
            gender: None,
            age: Some(20),
            major: Some("Psychology".into()),
            roles: vec!["user".into()],
        }
    }

    #[test]
    fn insert_and_find_account() {
        let store = test_store();
        let created = store
            .insert_account(&new_account("alice", "Alice@Example.com", 12_345_678))
            .unwrap();

        assert_eq!(created.email, "alice@example.com");
        assert_eq!(created.age, Some(20));

        let by_email = store.find_by_email("ALICE@example.COM").unwrap().unwrap();
        assert_eq!(by_email.id, created.id);

        let by_id = store.find_by_id(created.id).unwrap().unwrap();
        assert_eq!(by_id.username, "alice");

        assert_eq!(
            store.roles_for(created.id).unwrap(),
            vec!["user".to_string()]
        );
    }

    #[test]
    fn duplicate_columns_are_reported_by_name() {
        let store = test_store();
        store
            .insert_account(&new_account("alice", "a@x.com", 11_111_111))
            .unwrap();

        let err = store
            .insert_account(&new_account("ALICE", "b@x.com", 22_222_222))
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(UniqueField::Username)));

        let err = store
            .insert_account(&new_account("bob", "A@X.COM", 33_333_333))
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(UniqueField::Email)));

        let err = store
            .insert_account(&new_account("carol", "c@x.com", 11_111_111))
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(UniqueField::PublicId)));

        assert_eq!(store.account_count().unwrap(), 1);
    }

    #[test]
    fn nickname_unique_but_nullable() {
        let store = test_store();
        let mut a = new_account("a", "a@x.com", 10_000_001);
        let mut b = new_account("b", "b@x.com", 10_000_002);
        store.insert_account(&a).unwrap();
        store.insert_account(&b).unwrap();

        a = new_account("c", "c@x.com", 10_000_003);
        a.nickname = Some("Moonlight".into());
        store.insert_account(&a).unwrap();

        b = new_account("d", "d@x.com", 10_000_004);
        b.nickname = Some("moonlight".into());
        let err = store.insert_account(&b).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(UniqueField::Nickname)));
        assert!(store.is_taken(UniqueField::Nickname, "MOONLIGHT").unwrap());
    }

    #[test]
    fn unknown_initial_role_rolls_back_insert() {
        let store = test_store();
        let mut account = new_account("alice", "a@x.com", 12_345_678);
        account.roles = vec!["superhero".into()];

        let err = store.insert_account(&account).unwrap_err();
        assert!(matches!(err, StoreError::UnknownRole(_)));
        assert_eq!(store.account_count().unwrap(), 0);
    }

    #[test]
    fn assign_and_revoke_roles() {
        let store = test_store();
        let account = store
            .insert_account(&new_account("alice", "a@x.com", 12_345_678))
            .unwrap();

        assert!(store.assign_role(account.id, "admin").unwrap());
        assert!(!store.assign_role(account.id, "admin").unwrap());
        assert_eq!(
            store.roles_for(account.id).unwrap(),
            vec!["admin".to_string(), "user".to_string()]
        );

        assert!(store.revoke_role(account.id, "admin").unwrap());
        assert!(!store.revoke_role(account.id, "admin").unwrap());
        assert_eq!(
            store.roles_for(account.id).unwrap(),
            vec!["user".to_string()]
        );
    }

    #[test]
    fn assign_role_rejects_unknown_role_and_account() {
        let store = test_store();
        let account = store
            .insert_account(&new_account("alice", "a@x.com", 12_345_678))
            .unwrap();

        assert!(matches!(
            store.assign_role(account.id, "wizard"),
            Err(StoreError::UnknownRole(_))
        ));
        assert!(matches!(
            store.assign_role(9_999, "admin"),
            Err(StoreError::UnknownAccount(9_999))
        ));
    }

    #[test]
    fn list_accounts_includes_roles() {
        let store = test_store();
        let a = store
            .insert_account(&new_account("alice", "a@x.com", 10_000_001))
            .unwrap();
        store
            .insert_account(&new_account("bob", "b@x.com", 10_000_002))
            .unwrap();
        store.assign_role(a.id, "operator").unwrap();

        let listed = store.list_accounts().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].account.username, "alice");
        assert_eq!(
            listed[0].roles,
            vec!["operator".to_string(), "user".to_string()]
        );
        assert_eq!(listed[1].roles, vec!["user".to_string()]);
    }

    #[test]
    fn on_disk_store_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("auth.db");
        {
            let store = SqliteCredentialStore::open(&path).unwrap();
            store.ensure_role("user").unwrap();
            store
                .insert_account(&new_account("alice", "a@x.com", 12_345_678))
                .unwrap();
        }
        let reopened = SqliteCredentialStore::open(&path).unwrap();
        assert!(reopened.public_id_taken(12_345_678).unwrap());
        assert!(reopened.find_by_email("a@x.com").unwrap().is_some());
    }
}
