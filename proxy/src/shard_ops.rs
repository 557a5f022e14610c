//! Calls the Migration Coordinator makes into the shards themselves.

use crate::shards::Shards;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ShardOpsError {
    #[error("unknown shard: {0}")]
    UnknownShard(String),
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("shard {shard} rejected {operation} with status {status}")]
    Rejected {
        shard: String,
        operation: &'static str,
        status: u16,
    },
}

/// Queue-moving primitives. The durable store under the shards addresses users,
/// not queues, so every operation is per realm or per user.
#[async_trait]
pub trait ShardOperations: Send + Sync {
    /// Users of the realm that own queues on `shard`.
    async fn list_users(&self, shard: &str, realm: &str) -> Result<Vec<String>, ShardOpsError>;

    /// Prepares empty queues for `users` on `shard`.
    async fn provision(&self, shard: &str, realm: &str, users: &[String])
    -> Result<(), ShardOpsError>;

    /// Flushes pending writes for the realm on `shard`.
    async fn drain(&self, shard: &str, realm: &str) -> Result<(), ShardOpsError>;

    /// Serialized queue state of one user.
    async fn export(&self, shard: &str, realm: &str, user: &str) -> Result<Vec<u8>, ShardOpsError>;

    /// Merges exported state with whatever the shard received since the commit,
    /// preserving per-queue order.
    async fn merge(
        &self,
        shard: &str,
        realm: &str,
        user: &str,
        state: Vec<u8>,
    ) -> Result<(), ShardOpsError>;
}

#[derive(Serialize)]
struct RealmRequest<'a> {
    realm: &'a str,
}

#[derive(Serialize)]
struct ProvisionRequest<'a> {
    realm: &'a str,
    users: &'a [String],
}

#[derive(Deserialize)]
struct UsersResponse {
    users: Vec<String>,
}

/// Talks to the `/internal/migration/*` endpoints of each shard.
pub struct HttpShardOperations {
    client: reqwest::Client,
    shards: Arc<Shards>,
}

impl HttpShardOperations {
    pub fn new(shards: Arc<Shards>, timeout: Duration) -> Result<Self, ShardOpsError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpShardOperations { client, shards })
    }

    fn url(&self, shard: &str, path: &str) -> Result<reqwest::Url, ShardOpsError> {
        let shard = self
            .shards
            .get(shard)
            .ok_or_else(|| ShardOpsError::UnknownShard(shard.to_string()))?;
        Ok(shard.url_for(&format!("/internal/migration/{path}")))
    }

    fn check(
        shard: &str,
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ShardOpsError> {
        if response.status() != StatusCode::OK {
            return Err(ShardOpsError::Rejected {
                shard: shard.to_string(),
                operation,
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ShardOperations for HttpShardOperations {
    async fn list_users(&self, shard: &str, realm: &str) -> Result<Vec<String>, ShardOpsError> {
        let response = self
            .client
            .get(self.url(shard, "users")?)
            .query(&[("realm", realm)])
            .send()
            .await?;
        let body: UsersResponse = Self::check(shard, "list_users", response)?.json().await?;
        Ok(body.users)
    }

    async fn provision(
        &self,
        shard: &str,
        realm: &str,
        users: &[String],
    ) -> Result<(), ShardOpsError> {
        let response = self
            .client
            .post(self.url(shard, "provision")?)
            .json(&ProvisionRequest { realm, users })
            .send()
            .await?;
        Self::check(shard, "provision", response)?;
        Ok(())
    }

    async fn drain(&self, shard: &str, realm: &str) -> Result<(), ShardOpsError> {
        let response = self
            .client
            .post(self.url(shard, "drain")?)
            .json(&RealmRequest { realm })
            .send()
            .await?;
        Self::check(shard, "drain", response)?;
        Ok(())
    }

    async fn export(&self, shard: &str, realm: &str, user: &str) -> Result<Vec<u8>, ShardOpsError> {
        let response = self
            .client
            .get(self.url(shard, "export")?)
            .query(&[("realm", realm), ("user", user)])
            .send()
            .await?;
        let bytes = Self::check(shard, "export", response)?.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn merge(
        &self,
        shard: &str,
        realm: &str,
        user: &str,
        state: Vec<u8>,
    ) -> Result<(), ShardOpsError> {
        let response = self
            .client
            .post(self.url(shard, "merge")?)
            .query(&[("realm", realm), ("user", user)])
            .body(state)
            .send()
            .await?;
        Self::check(shard, "merge", response)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use crate::testutils::start_test_server;
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::{Request, Response};
    use std::convert::Infallible;

    async fn migration_api(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let body = req.into_body().collect().await.unwrap().to_bytes();

        let (status, reply) = match path.as_str() {
            "/internal/migration/users" if query == "realm=zulip" => {
                (200, Bytes::from(r#"{"users":["iago","hamlet"]}"#))
            }
            "/internal/migration/provision" => {
                let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(value["users"][1], "hamlet");
                (200, Bytes::new())
            }
            "/internal/migration/drain" => (200, Bytes::new()),
            "/internal/migration/export" => (200, Bytes::from_static(b"\x01\x02queue")),
            "/internal/migration/merge" if &body[..] == b"\x01\x02queue" => (200, Bytes::new()),
            _ => (409, Bytes::new()),
        };
        let mut response = Response::new(Full::new(reply));
        *response.status_mut() = hyper::StatusCode::from_u16(status).unwrap();
        Ok(response)
    }

    #[tokio::test]
    async fn test_http_shard_operations() {
        let port = start_test_server(migration_api).await;
        let shards = Arc::new(Shards::new(vec![ShardConfig {
            id: "shard-a".into(),
            url: format!("http://127.0.0.1:{port}").parse().unwrap(),
            dedicated: false,
        }]));
        let ops = HttpShardOperations::new(shards, Duration::from_secs(2)).unwrap();

        let users = ops.list_users("shard-a", "zulip").await.unwrap();
        assert_eq!(users, vec!["iago".to_string(), "hamlet".to_string()]);
        ops.provision("shard-a", "zulip", &users).await.unwrap();
        ops.drain("shard-a", "zulip").await.unwrap();
        let state = ops.export("shard-a", "zulip", "iago").await.unwrap();
        ops.merge("shard-a", "zulip", "iago", state).await.unwrap();

        assert!(matches!(
            ops.merge("shard-a", "zulip", "iago", b"corrupt".to_vec()).await,
            Err(ShardOpsError::Rejected { status: 409, operation: "merge", .. })
        ));
        assert!(matches!(
            ops.drain("shard-z", "zulip").await,
            Err(ShardOpsError::UnknownShard(_))
        ));
    }
}
