//! Interface to the authoritative realm to shard assignment database.
//!
//! The database is reached through its HTTP control API. It is read in bulk at
//! startup, read per realm on a cold cache miss, and written by the migration
//! coordinator and by pin management.

const BASE_DELAY: u64 = 500;
const MAX_RETRIES: u32 = 3;

use crate::types::{RealmId, ShardId, StoredAssignment};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("store unavailable")]
    RetriesExceeded,
    #[error("store rejected the request with status {0}")]
    Rejected(u16),
    #[error("assignment for {realm} is at epoch {current}, refusing to write epoch {attempted}")]
    StaleEpoch {
        realm: RealmId,
        current: u64,
        attempted: u64,
    },
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Loads every explicit assignment and pin.
    async fn load_all(&self) -> Result<Vec<StoredAssignment>, StoreError>;

    /// Looks up a single realm. `None` means the realm follows the hash ring.
    async fn fetch(&self, realm: &str) -> Result<Option<StoredAssignment>, StoreError>;

    /// Records that `realm` now lives on `shard`. Epochs only move forward.
    async fn commit(&self, realm: &str, shard: &str, epoch: u64) -> Result<(), StoreError>;

    /// Sets or clears the pin override of a realm.
    async fn set_pin(&self, realm: &str, shard: Option<&str>) -> Result<(), StoreError>;
}

#[derive(Deserialize)]
struct PageMetadata {
    cursor: String,
    has_more: bool,
}

#[derive(Deserialize)]
struct AssignmentPage {
    data: Vec<StoredAssignment>,
    metadata: PageMetadata,
}

#[derive(Serialize)]
struct CommitBody<'a> {
    realm: &'a str,
    shard: &'a str,
    epoch: u64,
}

#[derive(Serialize)]
struct PinBody<'a> {
    realm: &'a str,
    shard: Option<&'a str>,
}

pub struct HttpAssignmentStore {
    client: reqwest::Client,
    assignments_url: String,
    pins_url: String,
}

impl HttpAssignmentStore {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, StoreError> {
        let base = base_url.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(HttpAssignmentStore {
            client,
            assignments_url: format!("{base}/realm-assignments/"),
            pins_url: format!("{base}/realm-pins/"),
        })
    }

    fn parse_url(url: &str) -> Result<Url, StoreError> {
        Url::parse(url).map_err(|e| StoreError::InvalidUrl(e.to_string()))
    }

    // Retries retriable statuses with exponential backoff. Transport errors are
    // returned immediately so a cold miss never waits on a dead database.
    async fn send_with_retries<F>(&self, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retries = 0;
        loop {
            let response = build().send().await?;
            let status = response.status();
            if status.is_success() || status == StatusCode::NOT_FOUND {
                return Ok(response);
            }
            if RETRIABLE_STATUS_CODES.contains(&status) {
                if retries >= MAX_RETRIES {
                    return Err(StoreError::RetriesExceeded);
                }
                let retry_millis = BASE_DELAY * 2_u64.pow(retries);
                sleep(Duration::from_millis(retry_millis)).await;
                retries += 1;
                continue;
            }
            return Err(StoreError::Rejected(status.as_u16()));
        }
    }
}

#[async_trait]
impl AssignmentStore for HttpAssignmentStore {
    async fn load_all(&self) -> Result<Vec<StoredAssignment>, StoreError> {
        let mut assignments = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page_fetches = 0;

        loop {
            let mut url = Self::parse_url(&self.assignments_url)?;
            if let Some(ref c) = cursor {
                url.query_pairs_mut().append_pair("cursor", c);
            }

            let response = self
                .send_with_retries(|| self.client.get(url.clone()))
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(StoreError::Rejected(StatusCode::NOT_FOUND.as_u16()));
            }
            let page = response.json::<AssignmentPage>().await?;

            assignments.extend(page.data);
            page_fetches += 1;
            cursor = Some(page.metadata.cursor);

            if !page.metadata.has_more {
                break;
            }
        }

        tracing::info!(
            pages = page_fetches,
            rows = assignments.len(),
            "Loaded realm assignments from store"
        );
        Ok(assignments)
    }

    async fn fetch(&self, realm: &str) -> Result<Option<StoredAssignment>, StoreError> {
        let mut url = Self::parse_url(&self.assignments_url)?;
        url.query_pairs_mut().append_pair("realm", realm);

        let response = self
            .send_with_retries(|| self.client.get(url.clone()))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.json::<StoredAssignment>().await?))
    }

    async fn commit(&self, realm: &str, shard: &str, epoch: u64) -> Result<(), StoreError> {
        let url = Self::parse_url(&self.assignments_url)?;
        let body = CommitBody {
            realm,
            shard,
            epoch,
        };
        let response = self
            .send_with_retries(|| self.client.put(url.clone()).json(&body))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::Rejected(StatusCode::NOT_FOUND.as_u16()));
        }
        Ok(())
    }

    async fn set_pin(&self, realm: &str, shard: Option<&str>) -> Result<(), StoreError> {
        let url = Self::parse_url(&self.pins_url)?;
        let body = PinBody { realm, shard };
        self.send_with_retries(|| self.client.put(url.clone()).json(&body))
            .await?;
        Ok(())
    }
}

/// In-memory store used for single-node deployments and tests. It can be switched
/// into an unavailable mode to exercise degraded-mode resolution.
#[derive(Default)]
pub struct MemoryAssignmentStore {
    rows: Mutex<HashMap<RealmId, StoredAssignment>>,
    unavailable: AtomicBool,
}

impl MemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = StoredAssignment>,
    {
        let store = Self::new();
        {
            let mut guard = store.rows.lock();
            for row in rows {
                guard.insert(row.realm.clone(), row);
            }
        }
        store
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn get(&self, realm: &str) -> Option<StoredAssignment> {
        self.rows.lock().get(realm).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::RetriesExceeded);
        }
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for MemoryAssignmentStore {
    async fn load_all(&self) -> Result<Vec<StoredAssignment>, StoreError> {
        self.check_available()?;
        Ok(self.rows.lock().values().cloned().collect())
    }

    async fn fetch(&self, realm: &str) -> Result<Option<StoredAssignment>, StoreError> {
        self.check_available()?;
        Ok(self.rows.lock().get(realm).cloned())
    }

    async fn commit(&self, realm: &str, shard: &str, epoch: u64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut rows = self.rows.lock();
        let row = rows
            .entry(realm.to_string())
            .or_insert_with(|| StoredAssignment::new(realm, shard));
        if epoch < row.epoch {
            return Err(StoreError::StaleEpoch {
                realm: realm.to_string(),
                current: row.epoch,
                attempted: epoch,
            });
        }
        row.shard = ShardId::from(shard);
        row.epoch = epoch;
        Ok(())
    }

    async fn set_pin(&self, realm: &str, shard: Option<&str>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut rows = self.rows.lock();
        match shard {
            Some(shard) => {
                let row = rows
                    .entry(realm.to_string())
                    .or_insert_with(|| StoredAssignment::new(realm, shard));
                row.shard = shard.to_string();
                row.pinned = true;
            }
            None => {
                if let Some(row) = rows.get_mut(realm) {
                    row.pinned = false;
                }
            }
        }
        Ok(())
    }
}
