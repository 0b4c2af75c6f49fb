//! GenesysProvider - REST-backed resource operations
//!
//! Resources are plain JSON documents under `/api/v2` collection paths.
//! Each operation checks a client out of the pool for its whole duration,
//! including the read-back that waits for the API to become consistent.

use std::collections::HashMap;
use std::time::Duration;

use genesys_core::consistency::wait_for_consistency;
use genesys_core::provider::{
    BoxFuture, ErrorKind, Provider, ProviderError, ProviderResult, ResourceSchema, ResourceType,
};
use genesys_core::resource::{Resource, ResourceId, State, Value};
use genesys_core::retry::{
    Attempt, Backoff, RetryError, RetryWhen, retry_when, retry_with_timeout,
};
use log::{debug, info};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiError, ClientConfiguration};
use crate::debug::ResourceContext;
use crate::pool::ClientPool;
use crate::pooled::{ProviderMeta, with_pooled_client};

/// Page size used when listing a collection
pub const LIST_PAGE_SIZE: u32 = 100;

/// Default window for read-back after create, update and delete
pub const DEFAULT_CONSISTENCY_TIMEOUT: Duration = Duration::from_secs(60);

/// Response fields that are never part of a resource's attributes
const SERVER_FIELDS: &[&str] = &["id", "selfUri"];

/// How an existing resource is modified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMethod {
    Put,
    Patch,
}

impl UpdateMethod {
    fn method(self) -> Method {
        match self {
            UpdateMethod::Put => Method::PUT,
            UpdateMethod::Patch => Method::PATCH,
        }
    }
}

/// A resource type and the collection it lives in
#[derive(Debug)]
pub struct ResourceDef {
    pub name: &'static str,
    pub path: &'static str,
    pub update: UpdateMethod,
    pub attributes: &'static [&'static str],
}

pub static RESOURCES: &[ResourceDef] = &[
    ResourceDef {
        name: "oauth_client",
        path: "/api/v2/oauth/clients",
        update: UpdateMethod::Put,
        attributes: &[
            "name",
            "description",
            "authorizedGrantType",
            "accessTokenValiditySeconds",
            "registeredRedirectUri",
            "scope",
            "state",
        ],
    },
    ResourceDef {
        name: "outbound_contactlisttemplate",
        path: "/api/v2/outbound/contactlisttemplates",
        update: UpdateMethod::Put,
        attributes: &[
            "name",
            "columnNames",
            "phoneColumns",
            "emailColumns",
            "previewModeColumnName",
            "previewModeAcceptedValues",
            "attemptLimits",
            "automaticTimeZoneMapping",
            "zipCodeColumnName",
        ],
    },
    ResourceDef {
        name: "routing_wrapupcode",
        path: "/api/v2/routing/wrapupcodes",
        update: UpdateMethod::Put,
        attributes: &["name", "division", "description"],
    },
    ResourceDef {
        name: "knowledge_knowledgebase",
        path: "/api/v2/knowledge/knowledgebases",
        update: UpdateMethod::Patch,
        attributes: &["name", "description", "coreLanguage"],
    },
    ResourceDef {
        name: "architect_greeting",
        path: "/api/v2/greetings",
        update: UpdateMethod::Put,
        attributes: &["name", "type", "ownerType", "owner", "audioFile", "audioTTS"],
    },
];

pub fn resource_def(resource_type: &str) -> Option<&'static ResourceDef> {
    RESOURCES.iter().find(|def| def.name == resource_type)
}

struct GenesysResourceType(&'static ResourceDef);

impl ResourceType for GenesysResourceType {
    fn name(&self) -> &'static str {
        self.0.name
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema {
            attributes: self.0.attributes.to_vec(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityListing {
    #[serde(default)]
    entities: Vec<serde_json::Value>,
    #[serde(default)]
    page_count: Option<u32>,
}

/// Provider for Genesys Cloud resources backed by a client pool
#[derive(Debug, Clone)]
pub struct GenesysProvider {
    pool: ClientPool,
    meta: ProviderMeta,
    cancel: CancellationToken,
    consistency_timeout: Duration,
    version_retry: RetryWhen,
}

impl GenesysProvider {
    pub fn new(pool: ClientPool, meta: ProviderMeta) -> Self {
        Self {
            pool,
            meta,
            cancel: CancellationToken::new(),
            consistency_timeout: DEFAULT_CONSISTENCY_TIMEOUT,
            version_retry: RetryWhen::default(),
        }
    }

    /// Cancel in-flight and future operations when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_consistency_timeout(mut self, timeout: Duration) -> Self {
        self.consistency_timeout = timeout;
        self
    }

    /// Attempts for updates and deletes rejected with a version mismatch
    pub fn with_version_retry(mut self, policy: RetryWhen) -> Self {
        self.version_retry = policy;
        self
    }

    pub fn meta(&self) -> &ProviderMeta {
        &self.meta
    }

    pub async fn read_resource(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> ProviderResult<State> {
        let def = lookup(id)?;
        let Some(identifier) = identifier else {
            return Ok(State::not_found(id.clone()));
        };
        let context = ResourceContext::new(&id.resource_type, identifier, &id.name);

        with_pooled_client(&self.pool, &self.cancel, &self.meta, |meta| async move {
            fetch(meta.client()?, def, id, identifier, &context).await
        })
        .await
    }

    pub async fn create_resource(&self, resource: &Resource) -> ProviderResult<State> {
        let id = &resource.id;
        let def = lookup(id)?;
        let body = attributes_to_json(&resource.attributes);
        let timeout = self.consistency_timeout;

        with_pooled_client(&self.pool, &self.cancel, &self.meta, |meta| async move {
            let client = meta.client()?;
            let context = ResourceContext::for_type(&id.resource_type);
            let created = client
                .send(Method::POST, def.path, Some(&body), Some(&context))
                .await
                .map_err(|e| api_error(e).for_resource(id.clone()))?;
            let created: serde_json::Value = created
                .json()
                .map_err(|e| api_error(e).for_resource(id.clone()))?;
            let identifier = created
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ProviderError::new("create response did not include an id")
                        .with_kind(ErrorKind::Api)
                        .for_resource(id.clone())
                })?
                .to_string();
            info!("Created {} {}", id, identifier);

            let identifier = identifier.as_str();
            let context = ResourceContext::new(&id.resource_type, identifier, &id.name);
            let context = &context;
            wait_for_consistency(timeout, resource, move || {
                fetch(client, def, id, identifier, context)
            })
            .await
            .map_err(|e| created_but(e, identifier))
        })
        .await
    }

    pub async fn update_resource(
        &self,
        id: &ResourceId,
        identifier: &str,
        to: &Resource,
    ) -> ProviderResult<State> {
        let def = lookup(id)?;
        let body = attributes_to_json(&to.attributes);
        let timeout = self.consistency_timeout;
        let policy = self.version_retry;
        let context = ResourceContext::new(&id.resource_type, identifier, &id.name);

        with_pooled_client(&self.pool, &self.cancel, &self.meta, |meta| async move {
            let client = meta.client()?;
            let path = format!("{}/{}", def.path, identifier);
            retry_when(policy, ApiError::is_version_mismatch, || {
                client.send(def.update.method(), &path, Some(&body), Some(&context))
            })
            .await
            .map_err(|e| retry_api_error(e).for_resource(id.clone()))?;
            info!("Updated {} {}", id, identifier);

            let context = &context;
            wait_for_consistency(timeout, to, move || {
                fetch(client, def, id, identifier, context)
            })
            .await
        })
        .await
    }

    /// Delete a resource and wait until reads report it gone.
    ///
    /// A resource that is already gone is not an error.
    pub async fn delete_resource(&self, id: &ResourceId, identifier: &str) -> ProviderResult<()> {
        let def = lookup(id)?;
        let timeout = self.consistency_timeout;
        let policy = self.version_retry;
        let context = ResourceContext::new(&id.resource_type, identifier, &id.name);

        with_pooled_client(&self.pool, &self.cancel, &self.meta, |meta| async move {
            let client = meta.client()?;
            let path = format!("{}/{}", def.path, identifier);
            let deleted = retry_when(policy, ApiError::is_version_mismatch, || {
                client.send(Method::DELETE, &path, None, Some(&context))
            })
            .await;
            match deleted {
                Ok(_) => info!("Deleted {} {}", id, identifier),
                Err(RetryError::Failed(e)) if e.is_not_found() => {
                    debug!("{} {} already deleted", id, identifier);
                    return Ok(());
                }
                Err(e) => return Err(retry_api_error(e).for_resource(id.clone())),
            }

            let context = &context;
            let backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(5));
            let result = retry_with_timeout(timeout, backoff, move || async move {
                match fetch(client, def, id, identifier, context).await {
                    Ok(state) if !state.exists => Attempt::Success(()),
                    Ok(_) => Attempt::retry(
                        ProviderError::new("resource still exists")
                            .with_kind(ErrorKind::Consistency),
                    ),
                    Err(e) => Attempt::Fail(e),
                }
            })
            .await;

            result.map_err(|e| match e {
                RetryError::Failed(e) => e,
                RetryError::Timeout { timeout, .. } => ProviderError::new(format!(
                    "resource was not deleted within {:?}",
                    timeout
                ))
                .with_kind(ErrorKind::Consistency)
                .for_resource(id.clone()),
                RetryError::Exhausted { last_error, .. } => last_error,
            })
        })
        .await
    }

    /// Every existing resource of a type, one page of [`LIST_PAGE_SIZE`] at
    /// a time.
    pub async fn list_resources(&self, resource_type: &str) -> ProviderResult<Vec<State>> {
        let id = ResourceId::new(resource_type, "");
        let def = lookup(&id)?;
        let context = ResourceContext::for_type(resource_type);

        with_pooled_client(&self.pool, &self.cancel, &self.meta, |meta| async move {
            let client = meta.client()?;
            let mut states = Vec::new();
            let mut page_number = 1u32;
            loop {
                let path = format!(
                    "{}?pageSize={}&pageNumber={}",
                    def.path, LIST_PAGE_SIZE, page_number
                );
                let listing: EntityListing = client
                    .get(&path, Some(&context))
                    .await
                    .and_then(|response| response.json())
                    .map_err(api_error)?;

                let received = listing.entities.len();
                for entity in &listing.entities {
                    if let Some(state) = listed_state(def, entity) {
                        states.push(state);
                    }
                }

                let page_count = listing.page_count.unwrap_or(page_number);
                if received == 0 || page_number >= page_count {
                    break;
                }
                page_number += 1;
            }
            debug!("Listed {} {} resources", states.len(), def.name);
            Ok(states)
        })
        .await
    }
}

fn lookup(id: &ResourceId) -> ProviderResult<&'static ResourceDef> {
    resource_def(&id.resource_type).ok_or_else(|| {
        ProviderError::new(format!("Unknown resource type: {}", id.resource_type))
            .for_resource(id.clone())
    })
}

fn api_error(e: ApiError) -> ProviderError {
    let kind = if e.is_not_found() {
        ErrorKind::NotFound
    } else {
        ErrorKind::Api
    };
    ProviderError::new(e.to_string()).with_kind(kind).with_cause(e)
}

/// Failure of a write that still gave up after version-mismatch retries
fn retry_api_error(e: RetryError<ApiError>) -> ProviderError {
    let attempts = match &e {
        RetryError::Exhausted { attempts, .. } => Some(*attempts),
        _ => None,
    };
    match (e.into_last_error(), attempts) {
        (Some(last), Some(attempts)) => {
            let mut error = api_error(last);
            error.message = format!("{} (after {} attempts)", error.message, attempts);
            error
        }
        (Some(last), None) => api_error(last),
        (None, _) => ProviderError::new("request was not attempted").with_kind(ErrorKind::Api),
    }
}

/// Failures after a successful create still name the remote resource, so
/// it can be imported or removed instead of leaking.
fn created_but(e: ProviderError, identifier: &str) -> ProviderError {
    let message = format!("{} (created as {})", e.message, identifier);
    ProviderError { message, ..e }.with_identifier(identifier)
}

/// Read one resource; a 404 means it does not exist.
async fn fetch(
    client: &ClientConfiguration,
    def: &ResourceDef,
    id: &ResourceId,
    identifier: &str,
    context: &ResourceContext,
) -> ProviderResult<State> {
    let path = format!("{}/{}", def.path, identifier);
    match client.get(&path, Some(context)).await {
        Ok(response) => {
            let body: serde_json::Value = response
                .json()
                .map_err(|e| api_error(e).for_resource(id.clone()))?;
            Ok(State::existing(id.clone(), json_to_attributes(&body)).with_identifier(identifier))
        }
        Err(e) if e.is_not_found() => Ok(State::not_found(id.clone())),
        Err(e) => Err(api_error(e).for_resource(id.clone())),
    }
}

/// State for a listing entry, named after its `name` field (or its id)
fn listed_state(def: &ResourceDef, entity: &serde_json::Value) -> Option<State> {
    let identifier = entity.get("id")?.as_str()?;
    let name = entity
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(identifier);
    let id = ResourceId::new(def.name, name);
    Some(State::existing(id, json_to_attributes(entity)).with_identifier(identifier))
}

fn json_to_attributes(body: &serde_json::Value) -> HashMap<String, Value> {
    let Some(object) = body.as_object() else {
        return HashMap::new();
    };
    object
        .iter()
        .filter(|(key, _)| !SERVER_FIELDS.contains(&key.as_str()))
        .filter_map(|(key, value)| json_to_value(value).map(|v| (key.clone(), v)))
        .collect()
}

fn attributes_to_json(attributes: &HashMap<String, Value>) -> serde_json::Value {
    let object: serde_json::Map<String, serde_json::Value> = attributes
        .iter()
        .filter_map(|(key, value)| value_to_json(value).map(|v| (key.clone(), v)))
        .collect();
    serde_json::Value::Object(object)
}

/// Object members set to `null` are dropped as unset; `null` list elements
/// are kept so positions survive a round-trip.
pub fn json_to_value(value: &serde_json::Value) -> Option<Value> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(Value::String(s.clone())),
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Value::Int(i)),
            None => n.as_f64().map(Value::Float),
        },
        serde_json::Value::Array(items) => Some(Value::List(
            items
                .iter()
                .map(|item| json_to_value(item).unwrap_or(Value::Null))
                .collect(),
        )),
        serde_json::Value::Object(map) => Some(Value::Map(
            map.iter()
                .filter_map(|(k, v)| json_to_value(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
    }
}

/// Non-finite floats have no JSON representation and are dropped
pub fn value_to_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Null => Some(serde_json::Value::Null),
        Value::String(s) => Some(json!(s)),
        Value::Bool(b) => Some(json!(b)),
        Value::Int(i) => Some(json!(i)),
        Value::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number),
        Value::List(items) => Some(serde_json::Value::Array(
            items.iter().filter_map(value_to_json).collect(),
        )),
        Value::Map(map) => Some(serde_json::Value::Object(
            map.iter()
                .filter_map(|(k, v)| value_to_json(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
    }
}

impl Provider for GenesysProvider {
    fn name(&self) -> &'static str {
        "genesyscloud"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        RESOURCES
            .iter()
            .map(|def| Box::new(GenesysResourceType(def)) as Box<dyn ResourceType>)
            .collect()
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.map(|s| s.to_string());
        Box::pin(async move { self.read_resource(&id, identifier.as_deref()).await })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move { self.create_resource(&resource).await })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        _from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let to = to.clone();
        Box::pin(async move { self.update_resource(&id, &identifier, &to).await })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move { self.delete_resource(&id, &identifier).await })
    }

    fn list(&self, resource_type: &str) -> BoxFuture<'_, ProviderResult<Vec<State>>> {
        let resource_type = resource_type.to_string();
        Box::pin(async move { self.list_resources(&resource_type).await })
    }
}
