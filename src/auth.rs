use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Instructor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Instructor => "instructor",
        }
    }
}

/// The resolved identity behind the current sidecar session. An identity with
/// a linked instructor row is an instructor; any other authenticated identity
/// is an admin.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub instructor_id: Option<String>,
}

impl Session {
    pub fn role(&self) -> Role {
        if self.instructor_id.is_some() {
            Role::Instructor
        } else {
            Role::Admin
        }
    }

    pub fn scope(&self) -> db::Scope {
        match &self.instructor_id {
            Some(id) => db::Scope::Instructor(id.clone()),
            None => db::Scope::Admin,
        }
    }
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub salt: String,
    pub password_hash: String,
}

pub fn get_user_by_email(conn: &Connection, email: &str) -> anyhow::Result<Option<UserRow>> {
    conn.query_row(
        "SELECT id, email, salt, password_hash FROM app_users WHERE email = ?",
        [email],
        |r| {
            Ok(UserRow {
                id: r.get(0)?,
                email: r.get(1)?,
                salt: r.get(2)?,
                password_hash: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn user_count(conn: &Connection) -> anyhow::Result<i64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM app_users", [], |r| r.get(0))?;
    Ok(n)
}

pub fn verify_password(user: &UserRow, password: &str) -> bool {
    hash_password(&user.salt, password) == user.password_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_digest_is_salted() {
        let a = hash_password("salt-a", "secreto");
        let b = hash_password("salt-b", "secreto");
        assert_ne!(a, b);
        assert_eq!(a, hash_password("salt-a", "secreto"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn role_follows_instructor_link() {
        let admin = Session {
            user_id: "u1".into(),
            email: "a@x".into(),
            instructor_id: None,
        };
        assert_eq!(admin.role(), Role::Admin);
        let instructor = Session {
            user_id: "u2".into(),
            email: "i@x".into(),
            instructor_id: Some("ins1".into()),
        };
        assert_eq!(instructor.role(), Role::Instructor);
    }
}
