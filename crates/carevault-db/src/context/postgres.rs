//! Postgres implementations of the session traits.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, Postgres};

use super::session::{
    SecuritySession, SessionPool, SessionVariables, IS_SYSTEM_VAR, PRINCIPAL_ID_VAR, ROLE_VAR,
};
use crate::error::DbError;
use crate::pool::DbPool;

#[async_trait]
impl SecuritySession for PgConnection {
    async fn call_set_security_context(
        &mut self,
        principal_id: &str,
        role: &str,
        is_system: bool,
    ) -> Result<(), DbError> {
        sqlx::query("SELECT set_security_context($1, $2, $3)")
            .bind(principal_id)
            .bind(role)
            .bind(is_system)
            .execute(&mut *self)
            .await
            .map_err(DbError::from_query)?;
        Ok(())
    }

    async fn call_clear_security_context(&mut self) -> Result<(), DbError> {
        sqlx::query("SELECT clear_security_context()")
            .execute(&mut *self)
            .await
            .map_err(DbError::from_query)?;
        Ok(())
    }

    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), DbError> {
        sqlx::query("SELECT set_config($1, $2, false)")
            .bind(name)
            .bind(value)
            .execute(&mut *self)
            .await
            .map_err(DbError::from_query)?;
        Ok(())
    }

    async fn session_variables(&mut self) -> Result<SessionVariables, DbError> {
        let (principal_id, role, is_system): (Option<String>, Option<String>, Option<String>) =
            sqlx::query_as(
                "SELECT current_setting($1, true), current_setting($2, true), current_setting($3, true)",
            )
            .bind(PRINCIPAL_ID_VAR)
            .bind(ROLE_VAR)
            .bind(IS_SYSTEM_VAR)
            .fetch_one(&mut *self)
            .await
            .map_err(DbError::from_query)?;

        Ok(SessionVariables {
            principal_id: principal_id.unwrap_or_default(),
            role: role.unwrap_or_else(|| "none".to_string()),
            is_system: is_system.as_deref().is_some_and(SessionVariables::parse_flag),
        })
    }
}

#[async_trait]
impl SecuritySession for PoolConnection<Postgres> {
    async fn call_set_security_context(
        &mut self,
        principal_id: &str,
        role: &str,
        is_system: bool,
    ) -> Result<(), DbError> {
        (**self)
            .call_set_security_context(principal_id, role, is_system)
            .await
    }

    async fn call_clear_security_context(&mut self) -> Result<(), DbError> {
        (**self).call_clear_security_context().await
    }

    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), DbError> {
        (**self).set_session_variable(name, value).await
    }

    async fn session_variables(&mut self) -> Result<SessionVariables, DbError> {
        (**self).session_variables().await
    }
}

#[async_trait]
impl SessionPool for DbPool {
    type Session = PoolConnection<Postgres>;

    async fn checkout(&self) -> Result<Self::Session, DbError> {
        self.acquire().await
    }

    fn discard(&self, mut session: Self::Session) {
        session.close_on_drop();
        drop(session);
    }
}
