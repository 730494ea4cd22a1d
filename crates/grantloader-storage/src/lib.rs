//! Repository and directory clients consumed by the reconciliation engine, plus the
//! watermark properties file that carries the incremental start bound between runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use grantloader_core::{EntityKind, IdentifierType, RepoId, Resource};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grantloader-storage";

/// Attributes stored as lists; lookups on them are membership tests.
const LIST_ATTRIBUTES: &[&str] = &["locatorIds", "coPis", "roles"];

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: RepoId },
    #[error("{kind} resource has no id; cannot update")]
    MissingId { kind: EntityKind },
    #[error("more than one {kind} has {attribute} = {value}")]
    Ambiguous {
        kind: EntityKind,
        attribute: String,
        value: String,
    },
    #[error("repository request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed repository payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// The four primitives the reconciler needs from the repository.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    async fn find_by_attribute(
        &self,
        kind: EntityKind,
        attribute: &str,
        value: &str,
    ) -> Result<Option<RepoId>, RepositoryError>;

    async fn read_resource(&self, id: &RepoId, kind: EntityKind) -> Result<Resource, RepositoryError>;

    async fn create_resource(&self, resource: &Resource) -> Result<RepoId, RepositoryError>;

    async fn update_resource(&self, resource: &Resource) -> Result<(), RepositoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Create(EntityKind, RepoId),
    Update(EntityKind, RepoId),
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: BTreeMap<RepoId, Resource>,
    writes: Vec<WriteOp>,
    lookups: usize,
}

/// Repository held in process memory. Records every write for inspection.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `resource` directly, bypassing the write log. Returns its id.
    pub async fn seed(&self, mut resource: Resource) -> RepoId {
        let id = resource
            .id()
            .cloned()
            .unwrap_or_else(|| RepoId::new(Uuid::new_v4().to_string()));
        resource.set_id(id.clone());
        self.state.lock().await.resources.insert(id.clone(), resource);
        id
    }

    pub async fn get(&self, id: &RepoId) -> Option<Resource> {
        self.state.lock().await.resources.get(id).cloned()
    }

    pub async fn resources_of(&self, kind: EntityKind) -> Vec<Resource> {
        self.state
            .lock()
            .await
            .resources
            .values()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn writes(&self) -> Vec<WriteOp> {
        self.state.lock().await.writes.clone()
    }

    pub async fn lookup_count(&self) -> usize {
        self.state.lock().await.lookups
    }

    pub async fn clear_log(&self) {
        let mut state = self.state.lock().await;
        state.writes.clear();
        state.lookups = 0;
    }
}

fn attribute_matches(resource: &Resource, attribute: &str, value: &str) -> bool {
    let Ok(json) = serde_json::to_value(resource) else {
        return false;
    };
    match json.get(attribute) {
        Some(JsonValue::String(s)) => s == value,
        Some(JsonValue::Array(items)) => items.iter().any(|item| item.as_str() == Some(value)),
        _ => false,
    }
}

#[async_trait]
impl RepositoryClient for InMemoryRepository {
    async fn find_by_attribute(
        &self,
        kind: EntityKind,
        attribute: &str,
        value: &str,
    ) -> Result<Option<RepoId>, RepositoryError> {
        let mut state = self.state.lock().await;
        state.lookups += 1;
        let mut hits = state
            .resources
            .iter()
            .filter(|(_, r)| r.kind() == kind && attribute_matches(r, attribute, value))
            .map(|(id, _)| id.clone());
        let first = hits.next();
        if first.is_some() && hits.next().is_some() {
            return Err(RepositoryError::Ambiguous {
                kind,
                attribute: attribute.to_string(),
                value: value.to_string(),
            });
        }
        Ok(first)
    }

    async fn read_resource(&self, id: &RepoId, kind: EntityKind) -> Result<Resource, RepositoryError> {
        let state = self.state.lock().await;
        match state.resources.get(id) {
            Some(resource) if resource.kind() == kind => Ok(resource.clone()),
            _ => Err(RepositoryError::NotFound {
                kind,
                id: id.clone(),
            }),
        }
    }

    async fn create_resource(&self, resource: &Resource) -> Result<RepoId, RepositoryError> {
        let id = RepoId::new(Uuid::new_v4().to_string());
        let mut stored = resource.clone();
        stored.set_id(id.clone());
        let mut state = self.state.lock().await;
        state.resources.insert(id.clone(), stored);
        state.writes.push(WriteOp::Create(resource.kind(), id.clone()));
        Ok(id)
    }

    async fn update_resource(&self, resource: &Resource) -> Result<(), RepositoryError> {
        let kind = resource.kind();
        let id = resource
            .id()
            .cloned()
            .ok_or(RepositoryError::MissingId { kind })?;
        let mut state = self.state.lock().await;
        if !state.resources.contains_key(&id) {
            return Err(RepositoryError::NotFound { kind, id });
        }
        state.resources.insert(id.clone(), resource.clone());
        state.writes.push(WriteOp::Update(kind, id));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            username: None,
            password: None,
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonApiResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: Map<String, JsonValue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonApiDocument {
    data: JsonApiResource,
}

#[derive(Debug, Deserialize)]
struct JsonApiList {
    #[serde(default)]
    data: Vec<JsonApiResource>,
}

const JSON_API: &str = "application/vnd.api+json";

fn to_document(resource: &Resource) -> Result<JsonApiDocument, RepositoryError> {
    let JsonValue::Object(mut attributes) = serde_json::to_value(resource)? else {
        return Err(RepositoryError::Decode("resource did not serialize to an object".into()));
    };
    attributes.remove("type");
    let id = attributes
        .remove("id")
        .and_then(|v| v.as_str().map(str::to_string));
    Ok(JsonApiDocument {
        data: JsonApiResource {
            id,
            kind: resource.kind().as_str().to_string(),
            attributes,
        },
    })
}

fn from_document(doc: JsonApiResource, kind: EntityKind) -> Result<Resource, RepositoryError> {
    if doc.kind != kind.as_str() {
        return Err(RepositoryError::Decode(format!(
            "expected {kind} payload, got {}",
            doc.kind
        )));
    }
    let mut object = doc.attributes;
    object.insert("type".into(), JsonValue::String(doc.kind));
    if let Some(id) = doc.id {
        object.insert("id".into(), JsonValue::String(id));
    }
    Ok(serde_json::from_value(JsonValue::Object(object))?)
}

/// JSON:API client for the repository service. No retries: a failed call is returned to
/// the caller, which aborts the batch.
#[derive(Debug)]
pub struct HttpRepository {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpRepository {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
        })
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/data/{}", self.base_url, kind.as_str())
    }

    fn resource_url(&self, kind: EntityKind, id: &RepoId) -> String {
        format!("{}/{}", self.collection_url(kind), id)
    }

    async fn find_matching(
        &self,
        kind: EntityKind,
        attribute: &str,
        value: &str,
    ) -> Result<Option<RepoId>, RepositoryError> {
        let op = if LIST_ATTRIBUTES.contains(&attribute) {
            "=hasmember="
        } else {
            "=="
        };
        let filter = format!("{attribute}{op}'{}'", value.replace('\'', "\\'"));
        let resp = self
            .request(Method::GET, &self.collection_url(kind))
            .query(&[(format!("filter[{}]", kind.as_str()), filter)])
            .send()
            .await?;
        let list: JsonApiList = check_status(resp, kind, None).await?.json().await?;
        debug!(hits = list.data.len(), "lookup complete");
        let mut ids = list.data.into_iter().filter_map(|r| r.id);
        let first = ids.next();
        if first.is_some() && ids.next().is_some() {
            return Err(RepositoryError::Ambiguous {
                kind,
                attribute: attribute.to_string(),
                value: value.to_string(),
            });
        }
        Ok(first.map(RepoId::new))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, JSON_API);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }
}

async fn check_status(
    resp: Response,
    kind: EntityKind,
    id: Option<&RepoId>,
) -> Result<Response, RepositoryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if let (StatusCode::NOT_FOUND, Some(id)) = (status, id) {
        return Err(RepositoryError::NotFound {
            kind,
            id: id.clone(),
        });
    }
    Err(RepositoryError::HttpStatus {
        status: status.as_u16(),
        url: resp.url().to_string(),
    })
}

#[async_trait]
impl RepositoryClient for HttpRepository {
    async fn find_by_attribute(
        &self,
        kind: EntityKind,
        attribute: &str,
        value: &str,
    ) -> Result<Option<RepoId>, RepositoryError> {
        let span = info_span!("repository_find", %kind, attribute, value);
        self.find_matching(kind, attribute, value)
            .instrument(span)
            .await
    }

    async fn read_resource(&self, id: &RepoId, kind: EntityKind) -> Result<Resource, RepositoryError> {
        let url = self.resource_url(kind, id);
        let resp = self
            .request(Method::GET, &url)
            .send()
            .instrument(info_span!("repository_read", %kind, %id))
            .await?;
        let doc: JsonApiDocument = check_status(resp, kind, Some(id)).await?.json().await?;
        from_document(doc.data, kind)
    }

    async fn create_resource(&self, resource: &Resource) -> Result<RepoId, RepositoryError> {
        let kind = resource.kind();
        let body = to_document(resource)?;
        let resp = self
            .request(Method::POST, &self.collection_url(kind))
            .header(reqwest::header::CONTENT_TYPE, JSON_API)
            .body(serde_json::to_vec(&body)?)
            .send()
            .instrument(info_span!("repository_create", %kind))
            .await?;
        let created: JsonApiDocument = check_status(resp, kind, None).await?.json().await?;
        created
            .data
            .id
            .map(RepoId::new)
            .ok_or_else(|| RepositoryError::Decode(format!("created {kind} response has no id")))
    }

    async fn update_resource(&self, resource: &Resource) -> Result<(), RepositoryError> {
        let kind = resource.kind();
        let id = resource
            .id()
            .cloned()
            .ok_or(RepositoryError::MissingId { kind })?;
        let body = to_document(resource)?;
        let resp = self
            .request(Method::PATCH, &self.resource_url(kind, &id))
            .header(reqwest::header::CONTENT_TYPE, JSON_API)
            .body(serde_json::to_vec(&body)?)
            .send()
            .instrument(info_span!("repository_update", %kind, %id))
            .await?;
        check_status(resp, kind, Some(&id)).await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("directory returned http status {status}")]
    HttpStatus { status: u16 },
}

/// Maps one institutional identifier to another.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    async fn resolve_identifier(
        &self,
        source_type: IdentifierType,
        source_id: &str,
    ) -> Result<Option<String>, DirectoryError>;
}

/// Used when no directory service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDirectory;

#[async_trait]
impl DirectoryLookup for NoDirectory {
    async fn resolve_identifier(
        &self,
        _source_type: IdentifierType,
        _source_id: &str,
    ) -> Result<Option<String>, DirectoryError> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryAnswer {
    #[serde(default)]
    target_id: Option<String>,
}

#[derive(Debug)]
pub struct HttpDirectoryLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectoryLookup {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DirectoryLookup for HttpDirectoryLookup {
    async fn resolve_identifier(
        &self,
        source_type: IdentifierType,
        source_id: &str,
    ) -> Result<Option<String>, DirectoryError> {
        let url = format!("{}/{}/{}", self.base_url, source_type.as_str(), source_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .instrument(info_span!("directory_lookup", id_type = source_type.as_str()))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let answer: DirectoryAnswer = resp.json().await?;
                Ok(answer.target_id.filter(|id| !id.trim().is_empty()))
            }
            status => Err(DirectoryError::HttpStatus {
                status: status.as_u16(),
            }),
        }
    }
}

/// `key=value` properties file holding the last-updated watermark per sync mode.
#[derive(Debug, Clone)]
pub struct WatermarkFile {
    path: PathBuf,
}

impl WatermarkFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read_all(&self) -> anyhow::Result<BTreeMap<String, String>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking watermark file {}", self.path.display()))?
        {
            return Ok(BTreeMap::new());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading watermark file {}", self.path.display()))?;
        Ok(parse_properties(&text))
    }

    pub async fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.read_all().await?.remove(key))
    }

    /// Replaces `key` and rewrites the file atomically via temp-file rename.
    pub async fn write(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut properties = self.read_all().await?;
        properties.insert(key.to_string(), value.to_string());
        let rendered = render_properties(&properties);

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating watermark directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.watermark.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp watermark file {}", temp_path.display()))?;
        file.write_all(rendered.as_bytes())
            .await
            .with_context(|| format!("writing temp watermark file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp watermark file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn render_properties(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::from("# last-updated watermarks, one per sync mode\n");
    for (key, value) in properties {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}
