// 👤 User Accounts - roles and bcrypt password hashes
// The users table lives next to the record tables (see db::setup_database).
// An empty table means first run: the first account is always an admin.

use crate::error::{LedgerError, Result, ValidationError};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
// bcrypt's minimum cost; keeps the test suite fast
#[cfg(test)]
const HASH_COST: u32 = 4;

const BAD_CREDENTIALS: &str = "用户名或密码错误";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Admin => "管理员",
            Role::User => "普通用户",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "admin" | "管理员" => Ok(Role::Admin),
            "user" | "普通用户" => Ok(Role::User),
            other => Err(ValidationError::new(
                "role",
                format!("unknown role '{}', expected admin or user", other),
            )),
        }
    }
}

/// A stored account; the password hash never leaves this module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: Role,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let role: String = row.get(2)?;
        let role = role
            .parse::<Role>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            role,
        })
    }
}

pub fn require_admin(user: &User) -> Result<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(LedgerError::Forbidden("需要管理员权限".to_string()))
    }
}

// ============================================================================
// PASSWORDS
// ============================================================================

pub fn hash_password(password: &str) -> Result<String> {
    Ok(bcrypt::hash(password, HASH_COST)?)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    Ok(bcrypt::verify(password, hash)?)
}

// ============================================================================
// QUERIES
// ============================================================================

pub fn count_users(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
    Ok(count)
}

fn count_admins(conn: &Connection) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = ?1",
        params![Role::Admin.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn.prepare("SELECT id, username, role FROM users ORDER BY id")?;
    let users = stmt
        .query_map([], User::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}

pub fn get_user(conn: &Connection, username: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, username, role FROM users WHERE username = ?1",
            params![username.trim()],
            User::from_row,
        )
        .optional()?;
    Ok(user)
}

pub fn get_user_by_id(conn: &Connection, id: i64) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, username, role FROM users WHERE id = ?1",
            params![id],
            User::from_row,
        )
        .optional()?;
    Ok(user)
}

// ============================================================================
// WRITES
// ============================================================================

pub fn add_user(conn: &Connection, username: &str, password: &str, role: Role) -> Result<User> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ValidationError::new("username", "用户名不能为空").into());
    }
    if password.is_empty() {
        return Err(ValidationError::new("password", "密码不能为空").into());
    }
    if get_user(conn, username)?.is_some() {
        return Err(ValidationError::new("username", format!("用户名 '{}' 已存在", username)).into());
    }

    let hash = hash_password(password)?;
    conn.execute(
        "INSERT INTO users (username, password_hash, role) VALUES (?1, ?2, ?3)",
        params![username, hash, role.as_str()],
    )
    .map_err(|e| LedgerError::Persistence(e.to_string()))?;

    let user = User {
        id: conn.last_insert_rowid(),
        username: username.to_string(),
        role,
    };
    info!(username = %user.username, role = %user.role, "user added");
    Ok(user)
}

/// First-run setup: only allowed while there are no accounts at all
pub fn create_first_admin(conn: &Connection, username: &str, password: &str) -> Result<User> {
    if count_users(conn)? > 0 {
        return Err(LedgerError::Forbidden("已存在用户账号, 请登录".to_string()));
    }
    add_user(conn, username, password, Role::Admin)
}

/// Remove an account. The last admin cannot be removed.
pub fn remove_user(conn: &Connection, id: i64) -> Result<User> {
    let user = get_user_by_id(conn, id)?.ok_or(LedgerError::NotFound { table: "users", id })?;
    if user.is_admin() && count_admins(conn)? <= 1 {
        return Err(ValidationError::new("id", "至少需要保留一个管理员").into());
    }

    conn.execute("DELETE FROM users WHERE id = ?1", params![id])
        .map_err(|e| LedgerError::Persistence(e.to_string()))?;
    info!(username = %user.username, "user deleted");
    Ok(user)
}

/// Remove an account on behalf of a signed-in admin, who may not remove themselves
pub fn delete_user(conn: &Connection, id: i64, acting: &User) -> Result<User> {
    require_admin(acting)?;
    if acting.id == id {
        return Err(ValidationError::new("id", "不能删除当前登录的用户").into());
    }
    remove_user(conn, id)
}

/// Check a username/password pair
pub fn authenticate(conn: &Connection, username: &str, password: &str) -> Result<User> {
    let row = conn
        .query_row(
            "SELECT id, username, role, password_hash FROM users WHERE username = ?1",
            params![username.trim()],
            |row| Ok((User::from_row(row)?, row.get::<_, String>(3)?)),
        )
        .optional()?;

    let Some((user, hash)) = row else {
        warn!(username = %username.trim(), "login failed: unknown user");
        return Err(LedgerError::Unauthorized(BAD_CREDENTIALS.to_string()));
    };
    if !verify_password(password, &hash)? {
        warn!(username = %user.username, "login failed: wrong password");
        return Err(LedgerError::Unauthorized(BAD_CREDENTIALS.to_string()));
    }

    info!(username = %user.username, role = %user.role, "user signed in");
    Ok(user)
}
