//! Helpers for tests: an in-process HTTP server and a scripted set of shard
//! operations.

use crate::shard_ops::{ShardOperations, ShardOpsError};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// Serves `handler` on an ephemeral localhost port and returns the port.
pub async fn start_test_server<F, Fut, B>(handler: F) -> u16
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<B>, Infallible>> + Send + 'static,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
        return 0;
    };
    let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let _ = Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service_fn(handler))
                    .await;
            });
        }
    });

    port
}

/// In-memory shard operations. Queue state is keyed by (shard, user).
#[derive(Default)]
pub struct ScriptedShardOperations {
    users: Mutex<HashMap<(String, String), Vec<String>>>,
    queues: Mutex<HashMap<(String, String), Vec<u8>>>,
    failing: Mutex<Option<&'static str>>,
    gates: Mutex<HashMap<&'static str, Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedShardOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(self, shard: &str, realm: &str, users: &[&str]) -> Self {
        {
            let mut queues = self.queues.lock();
            for user in users {
                queues.insert((shard.to_string(), user.to_string()), user.as_bytes().to_vec());
            }
        }
        self.users.lock().insert(
            (shard.to_string(), realm.to_string()),
            users.iter().map(|u| u.to_string()).collect(),
        );
        self
    }

    /// Makes every later call to `operation` fail.
    pub fn fail(&self, operation: &'static str) {
        *self.failing.lock() = Some(operation);
    }

    /// Blocks `operation` until the returned handle is notified.
    pub fn gate(&self, operation: &'static str) -> Arc<Notify> {
        self.gates
            .lock()
            .entry(operation)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn queue(&self, shard: &str, user: &str) -> Option<Vec<u8>> {
        self.queues
            .lock()
            .get(&(shard.to_string(), user.to_string()))
            .cloned()
    }

    async fn enter(&self, operation: &'static str, shard: &str) -> Result<(), ShardOpsError> {
        self.calls.lock().push(format!("{operation}:{shard}"));
        let gate = self.gates.lock().get(operation).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if *self.failing.lock() == Some(operation) {
            return Err(ShardOpsError::Rejected {
                shard: shard.to_string(),
                operation,
                status: 500,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ShardOperations for ScriptedShardOperations {
    async fn list_users(&self, shard: &str, realm: &str) -> Result<Vec<String>, ShardOpsError> {
        self.enter("list_users", shard).await?;
        Ok(self
            .users
            .lock()
            .get(&(shard.to_string(), realm.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn provision(
        &self,
        shard: &str,
        realm: &str,
        users: &[String],
    ) -> Result<(), ShardOpsError> {
        self.enter("provision", shard).await?;
        self.users
            .lock()
            .insert((shard.to_string(), realm.to_string()), users.to_vec());
        Ok(())
    }

    async fn drain(&self, shard: &str, _realm: &str) -> Result<(), ShardOpsError> {
        self.enter("drain", shard).await
    }

    async fn export(&self, shard: &str, _realm: &str, user: &str) -> Result<Vec<u8>, ShardOpsError> {
        self.enter("export", shard).await?;
        Ok(self.queue(shard, user).unwrap_or_default())
    }

    async fn merge(
        &self,
        shard: &str,
        _realm: &str,
        user: &str,
        state: Vec<u8>,
    ) -> Result<(), ShardOpsError> {
        self.enter("merge", shard).await?;
        let mut queues = self.queues.lock();
        let queue = queues
            .entry((shard.to_string(), user.to_string()))
            .or_default();
        // Exported events go before anything received since the commit.
        let received = std::mem::replace(queue, state);
        queue.extend(received);
        Ok(())
    }
}
