//! Role registration repository
//!
//! One row per role. Every write after the initial insert is guarded by the
//! row's current lease token.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Sqlite};
use uuid::Uuid;

use super::{from_db_time, from_db_time_opt, to_db_time};
use crate::{Error, Result};
use conductor_core::registration::RoleRegistration;
use conductor_core::work_item::Role;

const TABLE: &str = "role_registrations";

#[derive(Debug, FromRow)]
struct RegistrationRow {
    role: String,
    holder_pid: i64,
    lease_token: String,
    claimed_at: String,
    last_heartbeat: Option<String>,
    released_at: Option<String>,
}

impl RegistrationRow {
    fn into_domain(self) -> Result<RoleRegistration> {
        Ok(RoleRegistration {
            role: self.role.parse()?,
            holder_pid: u32::try_from(self.holder_pid)
                .map_err(|_| Error::corrupt(TABLE, format!("holder_pid {}", self.holder_pid)))?,
            lease_token: Uuid::parse_str(&self.lease_token)
                .map_err(|e| Error::corrupt(TABLE, e.to_string()))?,
            claimed_at: from_db_time(TABLE, &self.claimed_at)?,
            last_heartbeat: from_db_time_opt(TABLE, self.last_heartbeat.as_deref())?,
            released_at: from_db_time_opt(TABLE, self.released_at.as_deref())?,
        })
    }
}

/// Repository for role registrations
pub struct RegistrationRepository {
    pool: Pool<Sqlite>,
}

impl RegistrationRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert when no row exists for the role; `false` when one already does
    pub async fn insert_if_absent(&self, registration: &RoleRegistration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_registrations (role, holder_pid, lease_token, claimed_at, last_heartbeat, released_at)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL)
            ON CONFLICT(role) DO NOTHING
            "#,
        )
        .bind(registration.role.as_str())
        .bind(registration.holder_pid as i64)
        .bind(registration.lease_token.to_string())
        .bind(to_db_time(registration.claimed_at))
        .bind(registration.last_heartbeat.map(to_db_time))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn find(&self, role: Role) -> Result<Option<RoleRegistration>> {
        let row = sqlx::query_as::<_, RegistrationRow>(
            r#"
            SELECT role, holder_pid, lease_token, claimed_at, last_heartbeat, released_at
            FROM role_registrations WHERE role = ?1
            "#,
        )
        .bind(role.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(RegistrationRow::into_domain).transpose()
    }

    pub async fn list(&self) -> Result<Vec<RoleRegistration>> {
        let rows = sqlx::query_as::<_, RegistrationRow>(
            r#"
            SELECT role, holder_pid, lease_token, claimed_at, last_heartbeat, released_at
            FROM role_registrations ORDER BY role
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RegistrationRow::into_domain).collect()
    }

    /// Take over the row if it still carries `expected_token`
    pub async fn replace(
        &self,
        expected_token: Uuid,
        registration: &RoleRegistration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE role_registrations
            SET holder_pid = ?1, lease_token = ?2, claimed_at = ?3, last_heartbeat = ?4, released_at = NULL
            WHERE role = ?5 AND lease_token = ?6
            "#,
        )
        .bind(registration.holder_pid as i64)
        .bind(registration.lease_token.to_string())
        .bind(to_db_time(registration.claimed_at))
        .bind(registration.last_heartbeat.map(to_db_time))
        .bind(registration.role.as_str())
        .bind(expected_token.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn heartbeat(&self, role: Role, token: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE role_registrations SET last_heartbeat = ?1
            WHERE role = ?2 AND lease_token = ?3 AND released_at IS NULL
            "#,
        )
        .bind(to_db_time(at))
        .bind(role.as_str())
        .bind(token.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_holder(&self, role: Role, token: Uuid, pid: u32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE role_registrations SET holder_pid = ?1
            WHERE role = ?2 AND lease_token = ?3 AND released_at IS NULL
            "#,
        )
        .bind(pid as i64)
        .bind(role.as_str())
        .bind(token.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release(&self, role: Role, token: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE role_registrations SET released_at = ?1
            WHERE role = ?2 AND lease_token = ?3 AND released_at IS NULL
            "#,
        )
        .bind(to_db_time(at))
        .bind(role.as_str())
        .bind(token.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop the row regardless of holder
    pub async fn delete(&self, role: Role) -> Result<bool> {
        let result = sqlx::query("DELETE FROM role_registrations WHERE role = ?1")
            .bind(role.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM role_registrations WHERE released_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_pool;

    fn registration(role: Role, pid: u32) -> RoleRegistration {
        RoleRegistration {
            role,
            holder_pid: pid,
            lease_token: Uuid::new_v4(),
            claimed_at: Utc::now(),
            last_heartbeat: None,
            released_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let repo = RegistrationRepository::new(test_pool().await);
        let first = registration(Role::Coder, 10);
        assert!(repo.insert_if_absent(&first).await.unwrap());
        assert!(!repo
            .insert_if_absent(&registration(Role::Coder, 11))
            .await
            .unwrap());

        let stored = repo.find(Role::Coder).await.unwrap().unwrap();
        assert_eq!(stored.holder_pid, 10);
        assert_eq!(stored.lease_token, first.lease_token);
    }

    #[tokio::test]
    async fn test_token_guarded_writes() {
        let repo = RegistrationRepository::new(test_pool().await);
        let first = registration(Role::Tester, 10);
        repo.insert_if_absent(&first).await.unwrap();

        let stranger = Uuid::new_v4();
        assert!(!repo.heartbeat(Role::Tester, stranger, Utc::now()).await.unwrap());
        assert!(repo
            .heartbeat(Role::Tester, first.lease_token, Utc::now())
            .await
            .unwrap());
        assert!(repo.set_holder(Role::Tester, first.lease_token, 99).await.unwrap());

        let second = registration(Role::Tester, 20);
        assert!(!repo.replace(stranger, &second).await.unwrap());
        assert!(repo.replace(first.lease_token, &second).await.unwrap());
        assert!(!repo
            .release(Role::Tester, first.lease_token, Utc::now())
            .await
            .unwrap());
        assert!(repo
            .release(Role::Tester, second.lease_token, Utc::now())
            .await
            .unwrap());

        let stored = repo.find(Role::Tester).await.unwrap().unwrap();
        assert!(stored.is_released());
        assert_eq!(repo.count().await.unwrap(), 0);
        assert!(repo.delete(Role::Tester).await.unwrap());
        assert!(repo.list().await.unwrap().is_empty());
    }
}
