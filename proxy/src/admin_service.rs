//! Operator-facing endpoints: probes, realm lookups, pins, migrations and shard
//! draining.

use crate::errors::ProxyError;
use crate::health::HealthMonitor;
use crate::migration::{MigrationCoordinator, MigrationError};
use directory::migration::Strategy;
use directory::{Directory, DirectoryError, Resolution};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use shared::http::{full_body, make_error_response, make_json_response};
use std::future::Future;
use std::pin::Pin;

const MAX_ADMIN_BODY: usize = 16 * 1024;

type AdminResponse = Response<BoxBody<Bytes, ProxyError>>;

#[derive(Deserialize)]
struct PinRequest {
    shard: String,
}

#[derive(Deserialize)]
struct MigrationRequest {
    realm: String,
    target: String,
    strategy: Strategy,
}

#[derive(Deserialize)]
struct DrainingRequest {
    draining: bool,
}

#[derive(Clone)]
pub struct AdminService {
    directory: Directory,
    health: HealthMonitor,
    migrations: MigrationCoordinator,
}

impl AdminService {
    pub fn new(
        directory: Directory,
        health: HealthMonitor,
        migrations: MigrationCoordinator,
    ) -> Self {
        Self {
            directory,
            health,
            migrations,
        }
    }

    async fn route(&self, req: Request<Incoming>) -> AdminResponse {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => Response::new(full_body("ok\n")),
            (&Method::GET, ["ready"]) => match self.directory.is_ready() {
                true => Response::new(full_body("ok\n")),
                false => make_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            (&Method::GET, ["realms", realm]) => self.get_realm(realm).await,
            (&Method::PUT, ["pins", realm]) => match read_json::<PinRequest>(req).await {
                Ok(pin) => self.set_pin(realm, Some(&pin.shard)).await,
                Err(response) => response,
            },
            (&Method::DELETE, ["pins", realm]) => self.set_pin(realm, None).await,
            (&Method::GET, ["migrations"]) => {
                make_json_response(StatusCode::OK, &json!(self.directory.migrations()))
            }
            (&Method::POST, ["migrations"]) => match read_json::<MigrationRequest>(req).await {
                Ok(request) => self.start_migration(request).await,
                Err(response) => response,
            },
            (&Method::GET, ["migrations", realm]) => match self.directory.migration(realm) {
                Some(migration) => make_json_response(StatusCode::OK, &json!(migration)),
                None => make_error_response(StatusCode::NOT_FOUND),
            },
            (&Method::GET, ["shards"]) => {
                make_json_response(StatusCode::OK, &json!(self.health.statuses()))
            }
            (&Method::PUT, ["shards", shard, "draining"]) => {
                match read_json::<DrainingRequest>(req).await {
                    Ok(request) => self.set_draining(shard, request.draining),
                    Err(response) => response,
                }
            }
            (_, ["health" | "ready" | "realms" | "pins" | "migrations" | "shards", ..]) => {
                make_error_response(StatusCode::METHOD_NOT_ALLOWED)
            }
            _ => make_error_response(StatusCode::NOT_FOUND),
        }
    }

    async fn get_realm(&self, realm: &str) -> AdminResponse {
        match self.directory.resolve(realm).await {
            Ok(Resolution::Shard(target)) => make_json_response(
                StatusCode::OK,
                &json!({
                    "realm": realm,
                    "shard": target.shard,
                    "epoch": target.epoch,
                    "source": target.source.as_str(),
                }),
            ),
            Ok(Resolution::Migrating(migration)) => make_json_response(
                StatusCode::OK,
                &json!({
                    "realm": realm,
                    "shard": migration.old,
                    "epoch": migration.old_epoch,
                    "source": "migrating",
                    "migration": migration,
                }),
            ),
            Err(err) => directory_error(err),
        }
    }

    async fn set_pin(&self, realm: &str, shard: Option<&str>) -> AdminResponse {
        match self.directory.set_pin(realm, shard).await {
            Ok(()) => make_json_response(StatusCode::OK, &json!({"realm": realm, "pin": shard})),
            Err(err) => directory_error(err),
        }
    }

    async fn start_migration(&self, request: MigrationRequest) -> AdminResponse {
        match self
            .migrations
            .start(&request.realm, &request.target, request.strategy)
            .await
        {
            Ok(state) => make_json_response(StatusCode::ACCEPTED, &json!(state)),
            Err(err) => {
                let status = match &err {
                    MigrationError::Conflict(_)
                    | MigrationError::Pinned(_)
                    | MigrationError::AlreadyOnShard { .. } => StatusCode::CONFLICT,
                    MigrationError::UnknownShard(_) => StatusCode::NOT_FOUND,
                    MigrationError::Frozen => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                tracing::warn!(realm = %request.realm, error = %err, "Migration rejected");
                make_json_response(status, &json!({"error": err.to_string()}))
            }
        }
    }

    fn set_draining(&self, shard: &str, draining: bool) -> AdminResponse {
        if let Err(err) = self.directory.set_draining(shard, draining) {
            return directory_error(err);
        }
        self.health.set_draining(shard, draining);
        make_json_response(
            StatusCode::OK,
            &json!({"shard": shard, "draining": draining}),
        )
    }
}

fn directory_error(err: DirectoryError) -> AdminResponse {
    let status = match &err {
        DirectoryError::UnknownShard(_) => StatusCode::NOT_FOUND,
        DirectoryError::Pinned(_) | DirectoryError::Migration(_) => StatusCode::CONFLICT,
        DirectoryError::NoShards => StatusCode::SERVICE_UNAVAILABLE,
        DirectoryError::Store(_) => StatusCode::BAD_GATEWAY,
    };
    make_json_response(status, &json!({"error": err.to_string()}))
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, AdminResponse> {
    let body = Limited::new(req.into_body(), MAX_ADMIN_BODY)
        .collect()
        .await
        .map_err(|_| make_error_response(StatusCode::PAYLOAD_TOO_LARGE))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|err| {
        make_json_response(StatusCode::BAD_REQUEST, &json!({"error": err.to_string()}))
    })
}

impl Service<Request<Incoming>> for AdminService {
    type Response = AdminResponse;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.route(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, HealthConfig};
    use crate::testutils::{ScriptedShardOperations, start_test_server};
    use directory::backup::NoopBackupStore;
    use directory::directory::DirectoryOptions;
    use directory::store::MemoryAssignmentStore;
    use directory::types::{ShardSpec, StoredAssignment};
    use serde_json::Value;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;

    struct Admin {
        base: String,
        directory: Directory,
        ops: Arc<ScriptedShardOperations>,
    }

    async fn start_admin() -> Admin {
        let directory = Directory::new(
            vec![ShardSpec::new("shard-a"), ShardSpec::new("shard-b")],
            Arc::new(MemoryAssignmentStore::with_rows([StoredAssignment::new(
                "zulip", "shard-a",
            )])),
            Arc::new(NoopBackupStore),
            DirectoryOptions::default(),
        );
        let health = HealthMonitor::new(
            ["shard-a".to_string(), "shard-b".to_string()],
            HealthConfig::default(),
            &BufferConfig::default(),
        );
        let ops = Arc::new(ScriptedShardOperations::new());
        let migrations =
            MigrationCoordinator::new(directory.clone(), ops.clone(), Duration::from_secs(600));
        let admin = AdminService::new(directory.clone(), health, migrations);

        let port = start_test_server(move |req| {
            let admin = admin.clone();
            async move { Ok::<_, Infallible>(admin.route(req).await) }
        })
        .await;
        Admin {
            base: format!("http://127.0.0.1:{port}"),
            directory,
            ops,
        }
    }

    #[tokio::test]
    async fn test_probes_and_unknown_routes() {
        let admin = start_admin().await;
        let client = reqwest::Client::new();

        let response = client.get(format!("{}/ready", admin.base)).send().await.unwrap();
        assert_eq!(response.status(), 503);
        admin.directory.load().await.unwrap();
        let response = client.get(format!("{}/ready", admin.base)).send().await.unwrap();
        assert_eq!(response.status(), 200);

        let response = client.get(format!("{}/health", admin.base)).send().await.unwrap();
        assert_eq!(response.status(), 200);
        let response = client.post(format!("{}/health", admin.base)).send().await.unwrap();
        assert_eq!(response.status(), 405);
        let response = client.get(format!("{}/nope", admin.base)).send().await.unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_pin_validation() {
        let admin = start_admin().await;
        let client = reqwest::Client::new();

        let response = client
            .put(format!("{}/pins/zulip", admin.base))
            .json(&json!({"shard": "shard-z"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        let response = client
            .put(format!("{}/pins/zulip", admin.base))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let response = client
            .delete(format!("{}/pins/zulip", admin.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_second_migration_conflicts() {
        let admin = start_admin().await;
        admin.directory.load().await.unwrap();
        // Keeps the first migration in Preparing.
        let gate = admin.ops.gate("list_users");
        let client = reqwest::Client::new();
        let start = json!({"realm": "zulip", "target": "shard-b", "strategy": "transparent"});

        let response = client
            .post(format!("{}/migrations", admin.base))
            .json(&start)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let response = client
            .post(format!("{}/migrations", admin.base))
            .json(&start)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 409);

        // Pinning would bypass the migration's routing.
        let response = client
            .put(format!("{}/pins/zulip", admin.base))
            .json(&json!({"shard": "shard-a"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 409);

        let value: Value = client
            .get(format!("{}/migrations/zulip", admin.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(value["phase"], "preparing");
        assert_eq!(value["new"], "shard-b");

        let value: Value = client
            .get(format!("{}/realms/zulip", admin.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(value["source"], "migrating");
        assert_eq!(value["shard"], "shard-a");
        gate.notify_one();
    }
}
