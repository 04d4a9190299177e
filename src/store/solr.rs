use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;

use super::{ConnectionError, Status, StoreClient, TransportError};
use crate::record::Record;

// Where the cluster lives. `url` is the host plus the root path of any node, for
// example `http://solr:8983/solr`; the node list actually written to is discovered
// from the cluster status at connect time.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub url: String,
    pub collection: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

pub struct SolrClient {
    http: reqwest::Client,
    collection: String,
    credentials: Option<(String, Option<String>)>,
    nodes: Vec<String>,
    // Next node to write to. Shared by every worker, so it is atomic.
    cursor: AtomicUsize,
}

impl SolrClient {
    pub async fn connect(target: &TargetConfig) -> Result<Self, ConnectionError> {
        let http = reqwest::Client::builder()
            .connect_timeout(target.connect_timeout)
            .timeout(target.request_timeout)
            .build()
            .map_err(ConnectionError::Client)?;

        let mut client = Self {
            http,
            collection: target.collection.clone(),
            credentials: target
                .user
                .clone()
                .map(|user| (user, target.password.clone())),
            nodes: Vec::new(),
            cursor: AtomicUsize::new(0),
        };

        let uri = format!("{}/admin/collections", target.url.trim_end_matches('/'));
        tracing::debug!("Requesting cluster status [uri={}, collection={}]", uri, target.collection);
        let response = client
            .authorize(client.http.get(&uri))
            .query(&[
                ("action", "CLUSTERSTATUS"),
                ("collection", target.collection.as_str()),
                ("wt", "json"),
            ])
            .send()
            .await
            .map_err(|source| ConnectionError::Unreachable {
                uri: uri.clone(),
                source,
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| ConnectionError::Unreachable {
                uri: uri.clone(),
                source,
            })?;
        if !status.is_success() {
            return Err(ConnectionError::Rejected {
                uri,
                status: status.as_u16(),
                body,
            });
        }

        client.nodes = active_nodes(&uri, &target.collection, &body)?;
        tracing::info!(
            "Connected to collection {} [nodes={}]",
            target.collection,
            client.nodes.join(",")
        );
        Ok(client)
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    // Flushes everything written so far so it becomes searchable.
    pub async fn commit(&self) -> Result<Status, TransportError> {
        let uri = self.endpoint("update");
        let response = self
            .authorize(self.http.post(&uri))
            .query(&[("commit", "true"), ("wt", "json")])
            .json(&[] as &[Record])
            .send()
            .await
            .map_err(|source| TransportError::Request {
                uri: uri.clone(),
                source,
            })?;
        let (status, body) = read_body(&uri, response).await?;
        classify_update(&uri, status, &body)
    }

    /// Number of documents in the collection carrying the given surname.
    pub async fn count_last_name(&self, last_name: &str) -> Result<u64, TransportError> {
        let uri = self.endpoint("select");
        let filter = format!("last_name:\"{last_name}\"");
        let response = self
            .authorize(self.http.get(&uri))
            .query(&[
                ("q", "*:*"),
                ("fq", filter.as_str()),
                ("rows", "0"),
                ("wt", "json"),
            ])
            .send()
            .await
            .map_err(|source| TransportError::Request {
                uri: uri.clone(),
                source,
            })?;
        let (status, body) = read_body(&uri, response).await?;
        if !(200..300).contains(&status) {
            return Err(TransportError::Rejected { uri, status, body });
        }
        let parsed: SelectResponse =
            serde_json::from_str(&body).map_err(|err| TransportError::Decode {
                uri,
                reason: err.to_string(),
            })?;
        Ok(parsed.response.num_found)
    }

    // Round robin over the discovered nodes, one step per request.
    fn endpoint(&self, handler: &str) -> String {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        format!(
            "{}/{}/{}",
            self.nodes[index].trim_end_matches('/'),
            self.collection,
            handler
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_deref()),
            None => request,
        }
    }
}

impl StoreClient for SolrClient {
    async fn submit(&self, batch: &[Record]) -> Result<Status, TransportError> {
        let uri = self.endpoint("update");
        let response = self
            .authorize(self.http.post(&uri))
            .query(&[("wt", "json")])
            .json(batch)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                uri: uri.clone(),
                source,
            })?;
        let (status, body) = read_body(&uri, response).await?;
        classify_update(&uri, status, &body)
    }
}

async fn read_body(uri: &str, response: Response) -> Result<(u16, String), TransportError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|source| TransportError::Request {
            uri: uri.to_string(),
            source,
        })?;
    Ok((status, body))
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(rename = "responseHeader")]
    header: ResponseHeader,
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    status: i32,
}

#[derive(Debug, Deserialize)]
struct SelectResponse {
    response: SelectBody,
}

#[derive(Debug, Deserialize)]
struct SelectBody {
    #[serde(rename = "numFound")]
    num_found: u64,
}

// A successful HTTP exchange must carry a response header we can read; its status is
// the store's verdict. Error responses usually carry one too, but a proxy in front of
// the cluster may answer with anything, in which case the HTTP code stands in.
fn classify_update(uri: &str, http_status: u16, body: &str) -> Result<Status, TransportError> {
    let parsed = serde_json::from_str::<UpdateResponse>(body);
    if (200..300).contains(&http_status) {
        let parsed = parsed.map_err(|err| TransportError::Decode {
            uri: uri.to_string(),
            reason: err.to_string(),
        })?;
        return Ok(Status::from_code(parsed.header.status));
    }
    let code = match parsed {
        Ok(parsed) if parsed.header.status != Status::SUCCESS_CODE => parsed.header.status,
        _ => i32::from(http_status),
    };
    Ok(Status::Failure(code))
}

#[derive(Debug, Deserialize)]
struct ClusterStatusResponse {
    cluster: ClusterState,
}

#[derive(Debug, Deserialize)]
struct ClusterState {
    #[serde(default)]
    live_nodes: Vec<String>,
    #[serde(default)]
    collections: HashMap<String, CollectionState>,
}

#[derive(Debug, Deserialize)]
struct CollectionState {
    #[serde(default)]
    shards: HashMap<String, ShardState>,
}

#[derive(Debug, Deserialize)]
struct ShardState {
    #[serde(default)]
    state: String,
    #[serde(default)]
    replicas: HashMap<String, ReplicaState>,
}

#[derive(Debug, Deserialize)]
struct ReplicaState {
    base_url: String,
    node_name: String,
    state: String,
}

const ACTIVE: &str = "active";

// Base URLs of every active replica of an active shard hosted on a live node,
// deduplicated and sorted so the rotation order is stable.
fn active_nodes(uri: &str, collection: &str, body: &str) -> Result<Vec<String>, ConnectionError> {
    let parsed: ClusterStatusResponse =
        serde_json::from_str(body).map_err(|err| ConnectionError::Decode {
            uri: uri.to_string(),
            reason: err.to_string(),
        })?;
    let live: HashSet<&str> = parsed.cluster.live_nodes.iter().map(String::as_str).collect();
    let state = parsed
        .cluster
        .collections
        .get(collection)
        .ok_or_else(|| ConnectionError::UnknownCollection(collection.to_string()))?;

    let nodes: BTreeSet<String> = state
        .shards
        .values()
        .filter(|shard| shard.state.is_empty() || shard.state == ACTIVE)
        .flat_map(|shard| shard.replicas.values())
        .filter(|replica| replica.state == ACTIVE && live.contains(replica.node_name.as_str()))
        .map(|replica| replica.base_url.trim_end_matches('/').to_string())
        .collect();

    if nodes.is_empty() {
        return Err(ConnectionError::NoActiveReplicas(collection.to_string()));
    }
    Ok(nodes.into_iter().collect())
}
