//! User account storage

use crate::db::{is_constraint_violation, Database};
use crate::types::{now_epoch_secs, Role};
use crate::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const USER_COLUMNS: &str = "id, username, email, password_hash, role, is_active, totp_enabled, \
                            totp_secret, created_at, updated_at, last_login";

const RECENT_SIGNUP_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;

/// Stored account. Secrets are never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub totp_enabled: bool,
    #[serde(skip)]
    pub totp_secret: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_login: Option<i64>,
}

impl UserRecord {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Fields for a new account; the password must already be hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
}

/// Partial update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStats {
    pub total_users: i64,
    pub active_users: i64,
    pub admin_users: i64,
    pub recent_signups: i64,
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let role: String = row.get(4)?;
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role: role.parse().unwrap_or(Role::Viewer),
        is_active: row.get(5)?,
        totp_enabled: row.get(6)?,
        totp_secret: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        last_login: row.get(10)?,
    })
}

/// Users table wrapper
#[derive(Clone)]
pub struct UserStore {
    db: Database,
}

impl UserStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, new: &NewUser) -> Result<UserRecord> {
        let now = now_epoch_secs();
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO users (username, email, password_hash, role, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
            params![new.username, new.email, new.password_hash, new.role.to_string(), now],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::already_exists("user", &new.username)
            } else {
                Error::Database(e)
            }
        })?;

        Ok(UserRecord {
            id: conn.last_insert_rowid(),
            username: new.username.clone(),
            email: new.email.clone(),
            password_hash: new.password_hash.clone(),
            role: new.role,
            is_active: true,
            totp_enabled: false,
            totp_secret: None,
            created_at: now,
            updated_at: now,
            last_login: None,
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<UserRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id],
                map_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                params![username],
                map_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
                params![email],
                map_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Page through accounts ordered by id
    pub fn list(&self, skip: i64, limit: i64) -> Result<Vec<UserRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users ORDER BY id LIMIT ?1 OFFSET ?2",
            USER_COLUMNS
        ))?;
        let users = stmt
            .query_map(params![limit, skip], map_user)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn stats(&self) -> Result<UserStats> {
        let since = now_epoch_secs() - RECENT_SIGNUP_WINDOW_SECS;
        let conn = self.db.connection();
        let conn = conn.lock();
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(is_active), 0),
                    COALESCE(SUM(CASE WHEN role = 'admin' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN created_at >= ?1 THEN 1 ELSE 0 END), 0)
             FROM users",
            params![since],
            |row| {
                Ok(UserStats {
                    total_users: row.get(0)?,
                    active_users: row.get(1)?,
                    admin_users: row.get(2)?,
                    recent_signups: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Apply a partial update and return the new record
    pub fn update(&self, id: i64, update: &UserUpdate) -> Result<UserRecord> {
        {
            let conn = self.db.connection();
            let conn = conn.lock();
            let now = now_epoch_secs();
            let changed = conn
                .execute(
                    "UPDATE users SET
                        email = COALESCE(?1, email),
                        role = COALESCE(?2, role),
                        is_active = COALESCE(?3, is_active),
                        updated_at = ?4
                     WHERE id = ?5",
                    params![
                        update.email,
                        update.role.map(|r| r.to_string()),
                        update.is_active,
                        now,
                        id
                    ],
                )
                .map_err(|e| {
                    if is_constraint_violation(&e) {
                        Error::already_exists("email", update.email.as_deref().unwrap_or_default())
                    } else {
                        Error::Database(e)
                    }
                })?;
            if changed == 0 {
                return Err(Error::not_found("user", id));
            }
        }
        self.get(id)?.ok_or_else(|| Error::not_found("user", id))
    }

    pub fn set_password_hash(&self, id: i64, password_hash: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
            params![password_hash, now_epoch_secs(), id],
        )?;
        Ok(())
    }

    pub fn touch_last_login(&self, id: i64) -> Result<i64> {
        let now = now_epoch_secs();
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(now)
    }

    /// Store a sealed TOTP secret. `enabled` flips once the user confirms a code.
    pub fn set_totp(&self, id: i64, sealed_secret: Option<&str>, enabled: bool) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE users SET totp_secret = ?1, totp_enabled = ?2, updated_at = ?3 WHERE id = ?4",
            params![sealed_secret, enabled, now_epoch_secs(), id],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> UserStore {
        UserStore::new(Database::open_memory().unwrap())
    }

    fn new_user(name: &str, role: Role) -> NewUser {
        NewUser {
            username: name.to_string(),
            email: format!("{}@example.org", name),
            password_hash: "pbkdf2_sha256$1$AA$AA".to_string(),
            role,
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let users = store();
        let alice = users.create(&new_user("alice", Role::User)).unwrap();
        assert!(alice.id > 0);
        assert!(alice.is_active);

        let by_name = users.get_by_username("alice").unwrap().unwrap();
        assert_eq!(by_name.id, alice.id);
        let by_email = users.get_by_email("alice@example.org").unwrap().unwrap();
        assert_eq!(by_email.role, Role::User);
        assert!(users.get(999).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let users = store();
        users.create(&new_user("alice", Role::User)).unwrap();
        let mut dup = new_user("alice", Role::User);
        dup.email = "other@example.org".to_string();
        assert!(matches!(users.create(&dup), Err(Error::AlreadyExists { .. })));
    }

    #[test]
    fn test_update_and_stats() {
        let users = store();
        let admin = users.create(&new_user("root-admin", Role::Admin)).unwrap();
        let bob = users.create(&new_user("bob", Role::Viewer)).unwrap();

        let bob = users
            .update(
                bob.id,
                &UserUpdate {
                    role: Some(Role::User),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(bob.role, Role::User);
        assert!(!bob.is_active);
        assert_eq!(bob.email, "bob@example.org");

        let stats = users.stats().unwrap();
        assert_eq!(
            stats,
            UserStats {
                total_users: 2,
                active_users: 1,
                admin_users: 1,
                recent_signups: 2,
            }
        );

        let taken = UserUpdate {
            email: Some("root-admin@example.org".to_string()),
            ..Default::default()
        };
        assert!(matches!(users.update(bob.id, &taken), Err(Error::AlreadyExists { .. })));
        assert!(matches!(
            users.update(999, &UserUpdate::default()),
            Err(Error::NotFound { .. })
        ));
        assert!(users.delete(admin.id).unwrap());
        assert_eq!(users.count().unwrap(), 1);
    }

    #[test]
    fn test_secrets_not_serialized() {
        let users = store();
        let alice = users.create(&new_user("alice", Role::User)).unwrap();
        users.set_totp(alice.id, Some("sealed"), true).unwrap();
        let alice = users.get(alice.id).unwrap().unwrap();
        assert!(alice.totp_enabled);
        let json = serde_json::to_string(&alice).unwrap();
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("sealed"));
    }
}
