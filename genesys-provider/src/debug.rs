//! SDK debug records emitted around every API invocation
//!
//! Each request and response produces one record. Records always go to the
//! `log` facade at debug level; when SDK debugging is enabled they are also
//! appended to the configured debug file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use serde::Serialize;

use crate::config::SdkDebugFormat;

pub const REQUEST_DEBUG_TYPE: &str = "SDK DEBUG REQUEST";
pub const RESPONSE_DEBUG_TYPE: &str = "SDK DEBUG RESPONSE";

/// Placeholder id/name used when an operation has no resource data yet
pub const UNAVAILABLE: &str = "unavailable";

/// Resource an API call is made on behalf of
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceContext {
    pub resource_type: String,
    pub resource_id: String,
    pub resource_name: String,
}

impl ResourceContext {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            resource_name: resource_name.into(),
        }
    }

    /// Context for calls where only the resource type is known
    pub fn for_type(resource_type: impl Into<String>) -> Self {
        Self::new(resource_type, UNAVAILABLE, UNAVAILABLE)
    }
}

fn is_blank(value: &str) -> bool {
    value.is_empty() || value == UNAVAILABLE
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn is_zero_status(value: &u16) -> bool {
    *value == 0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SdkDebugRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub debug_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub transaction_id: String,
    /// Zero on the first invocation, incremented on each retry
    #[serde(skip_serializing_if = "is_zero")]
    pub invocation_count: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub invocation_method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub invocation_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_name: String,
}

impl SdkDebugRequest {
    /// `transaction_id` is also sent as the request's correlation id.
    pub fn new(
        transaction_id: &str,
        count: u32,
        method: &str,
        url_path: &str,
        context: Option<&ResourceContext>,
        body: Option<&[u8]>,
    ) -> Self {
        let mut record = Self {
            debug_type: REQUEST_DEBUG_TYPE.to_string(),
            transaction_id: transaction_id.to_string(),
            invocation_count: count,
            invocation_method: method.to_string(),
            invocation_url: url_path.to_string(),
            ..Default::default()
        };
        if let Some(context) = context {
            record.resource_type = context.resource_type.clone();
            record.resource_id = context.resource_id.clone();
            record.resource_name = context.resource_name.clone();
        }
        fill_from_body(&mut record.resource_id, &mut record.resource_name, body);
        record
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SdkDebugResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub debug_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub transaction_id: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub invocation_count: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub invocation_method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub invocation_url: String,
    #[serde(skip_serializing_if = "is_zero_status")]
    pub invocation_status_code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub invocation_retry_after: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_name: String,
}

impl SdkDebugResponse {
    pub fn new(
        request: &SdkDebugRequest,
        status: u16,
        retry_after: Option<&str>,
        context: Option<&ResourceContext>,
        body: Option<&[u8]>,
    ) -> Self {
        let mut record = Self {
            debug_type: RESPONSE_DEBUG_TYPE.to_string(),
            transaction_id: request.transaction_id.clone(),
            invocation_count: request.invocation_count,
            invocation_method: request.invocation_method.clone(),
            invocation_url: request.invocation_url.clone(),
            invocation_status_code: status,
            invocation_retry_after: retry_after.unwrap_or_default().to_string(),
            ..Default::default()
        };
        if let Some(context) = context {
            record.resource_type = context.resource_type.clone();
            record.resource_id = context.resource_id.clone();
            record.resource_name = context.resource_name.clone();
        }
        fill_from_body(&mut record.resource_id, &mut record.resource_name, body);
        record
    }
}

/// Replace missing or placeholder id/name with the `id`/`name` of a JSON body.
fn fill_from_body(id: &mut String, name: &mut String, body: Option<&[u8]>) {
    if !is_blank(id) && !is_blank(name) {
        return;
    }
    let Some(body) = body else { return };
    let (body_id, body_name) = id_and_name_from_json(body);
    if is_blank(id) {
        if let Some(body_id) = body_id {
            *id = body_id;
        }
    }
    if is_blank(name) {
        if let Some(body_name) = body_name {
            *name = body_name;
        }
    }
}

/// `id` and `name` fields of a JSON object body. Anything unparseable
/// yields `(None, None)`.
pub fn id_and_name_from_json(body: &[u8]) -> (Option<String>, Option<String>) {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(body) else {
        return (None, None);
    };

    let id = match map.get("id") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(|i| i.to_string())
            .or_else(|| n.as_f64().map(|f| format!("{:.0}", f))),
        _ => None,
    };
    let name = match map.get("name") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    };
    (id, name)
}

/// Record types the sink knows how to render
pub trait DebugRecord: Serialize {
    fn to_text(&self) -> String;
}

impl DebugRecord for SdkDebugRequest {
    fn to_text(&self) -> String {
        format!(
            "{} [{}] {} {} (invocation {}) resource={}/{}/{}",
            self.debug_type,
            self.transaction_id,
            self.invocation_method,
            self.invocation_url,
            self.invocation_count,
            self.resource_type,
            self.resource_id,
            self.resource_name
        )
    }
}

impl DebugRecord for SdkDebugResponse {
    fn to_text(&self) -> String {
        format!(
            "{} [{}] {} {} status={} retry-after={} resource={}/{}/{}",
            self.debug_type,
            self.transaction_id,
            self.invocation_method,
            self.invocation_url,
            self.invocation_status_code,
            self.invocation_retry_after,
            self.resource_type,
            self.resource_id,
            self.resource_name
        )
    }
}

/// Append-only SDK debug log file
#[derive(Debug)]
pub struct DebugSink {
    path: PathBuf,
    format: SdkDebugFormat,
    file: Mutex<File>,
}

impl DebugSink {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path, format: SdkDebugFormat) -> std::io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            format,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<R: DebugRecord>(&self, record: &R) {
        let line = match self.format {
            SdkDebugFormat::Text => record.to_text(),
            SdkDebugFormat::Json => match serde_json::to_string(record) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Unable to serialize SDK debug record: {}", e);
                    return;
                }
            },
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("Unable to write SDK debug log {}: {}", self.path.display(), e);
        }
    }
}

/// Log `record` and, when a sink is configured, append it to the debug file.
pub(crate) fn emit<R: DebugRecord>(sink: Option<&DebugSink>, record: &R) {
    match serde_json::to_string(record) {
        Ok(json) => debug!("{}", json),
        Err(e) => warn!("Unable to log SDK debug record: {}", e),
    }
    if let Some(sink) = sink {
        sink.write(record);
    }
}
