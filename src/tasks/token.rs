//! Capability tokens scoping task callbacks to one task.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::models::Task;

const TOKEN_LIFETIME_DAYS: i64 = 30;

/// JWT claims of a task token
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TaskClaims {
    /// Task identifier
    pub sub: Uuid,
    pub project_id: Uuid,
    pub connector_id: Uuid,
    pub exp: i64,
    pub iat: i64,
}

/// Mints and verifies HS256 task tokens.
#[derive(Clone)]
pub struct TaskTokens {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TaskTokens {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn mint(&self, task: &Task) -> Result<String> {
        let now = Utc::now();
        let claims = TaskClaims {
            sub: task.id,
            project_id: task.project_id,
            connector_id: task.connector_id,
            exp: (now + Duration::days(TOKEN_LIFETIME_DAYS)).timestamp(),
            iat: now.timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    pub fn verify(&self, token: &str) -> Result<TaskClaims> {
        decode::<TaskClaims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Task token rejected: {}", e);
                PoolError::from(e)
            })
    }

    /// Verify `token` and check that it belongs to `task`.
    pub fn verify_for(&self, token: &str, task: &Task) -> Result<TaskClaims> {
        let claims = self.verify(token)?;
        if claims.sub != task.id
            || claims.project_id != task.project_id
            || claims.connector_id != task.connector_id
        {
            return Err(PoolError::TaskScope(format!("task {}", task.id)));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;
    use serde_json::json;

    fn task() -> Task {
        Task::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            TaskKind::Install,
            2,
            json!({}),
            0,
        )
    }

    #[test]
    fn test_token_is_scoped_to_its_task() {
        let tokens = TaskTokens::new("secret");
        let task = task();
        let token = tokens.mint(&task).unwrap();

        let claims = tokens.verify_for(&token, &task).unwrap();
        assert_eq!(claims.sub, task.id);

        let other = self::task();
        assert!(matches!(
            tokens.verify_for(&token, &other),
            Err(PoolError::TaskScope(_))
        ));
    }

    #[test]
    fn test_token_from_other_secret_is_rejected() {
        let task = task();
        let token = TaskTokens::new("one").mint(&task).unwrap();
        let err = TaskTokens::new("two").verify(&token).unwrap_err();
        assert!(matches!(err, PoolError::TaskToken(_)));
    }
}
