//! Username/password authentication with opaque session tokens.

use anyhow::{bail, Result};
use ojforge_storage::{Repository, UserRecord};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub struct AuthService {
    repo: Arc<dyn Repository>,
    sessions: RwLock<HashMap<String, i64>>,
}

impl AuthService {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        is_admin: bool,
    ) -> Result<i64> {
        if username.is_empty() || password.len() < 6 {
            bail!("username must be non-empty and password at least 6 characters");
        }
        let salt = random_hex(16);
        let hash = hash_password(&salt, password);
        let id = self.repo.create_user(username, &hash, &salt, is_admin).await?;
        info!(user_id = id, username, "user registered");
        Ok(id)
    }

    /// Creates the admin account on first boot if no such user exists.
    pub async fn ensure_user(&self, username: &str, password: &str, is_admin: bool) -> Result<i64> {
        if let Some(user) = self.repo.get_user_by_name(username).await? {
            return Ok(user.id);
        }
        self.register(username, password, is_admin).await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(String, UserRecord)> {
        let Some(user) = self.repo.get_user_by_name(username).await? else {
            bail!("invalid username or password");
        };
        if !user.active {
            bail!("account is disabled");
        }
        if hash_password(&user.salt, password) != user.password_hash {
            bail!("invalid username or password");
        }

        let token = random_hex(32);
        self.sessions.write().await.insert(token.clone(), user.id);
        self.repo
            .log_activity(user.id, "login", serde_json::json!({ "username": username }))
            .await?;
        Ok((token, user))
    }

    pub async fn check(&self, token: &str) -> Result<Option<UserRecord>> {
        let user_id = { self.sessions.read().await.get(token).copied() };
        match user_id {
            Some(id) => self.repo.get_user(id).await,
            None => Ok(None),
        }
    }

    pub async fn logout(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ojforge_storage::{CredentialCipher, MemoryRepository};

    fn auth() -> AuthService {
        AuthService::new(Arc::new(MemoryRepository::new(CredentialCipher::from_secret(
            "t",
        ))))
    }

    #[tokio::test]
    async fn login_round_trip() {
        let auth = auth();
        auth.register("alice", "hunter22", false).await.unwrap();

        let (token, user) = auth.login("alice", "hunter22").await.unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(auth.check(&token).await.unwrap().unwrap().id, user.id);

        auth.logout(&token).await;
        assert!(auth.check(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let auth = auth();
        auth.register("bob", "hunter22", false).await.unwrap();
        assert!(auth.login("bob", "wrong").await.is_err());
        assert!(auth.login("nobody", "hunter22").await.is_err());
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let auth = auth();
        let a = auth.ensure_user("admin", "changeme", true).await.unwrap();
        let b = auth.ensure_user("admin", "changeme", true).await.unwrap();
        assert_eq!(a, b);
    }
}
