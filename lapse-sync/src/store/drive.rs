//! Google Drive v3 binding for [`RemoteStore`].
//!
//! Authentication is out of scope: the store is handed a bearer token.
//! Uploads use the resumable protocol (metadata POST, then a single PUT of
//! the bytes) so large artifacts are streamed rather than buffered.
//!
//! Classification:
//!
//! | signal                                   | class              |
//! |------------------------------------------|--------------------|
//! | transport error (DNS, TLS, reset, EOF)   | `Transient`        |
//! | 429, 5xx                                 | `Transient`        |
//! | 403 with a rate-limit reason             | `Transient`        |
//! | 401, other 403                           | `PermissionDenied` |
//! | 404                                      | `NotFound`         |
//! | anything else                            | `Other`            |

use std::io::{Read, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use lapse_core::RemoteObject;

use super::{
    ErrorClass, NewObject, ObjectQuery, Page, RemoteStore, StoreError, StoredObject, FOLDER_MIME,
};

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FILE_FIELDS: &str = "id,name,mimeType,size,createdTime,modifiedTime,trashed";
const PAGE_SIZE: &str = "1000";

const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

/// Drive client bound to one access token.
pub struct DriveStore {
    agent: ureq::Agent,
    token: String,
    api_base: String,
    upload_base: String,
}

impl DriveStore {
    pub fn new(token: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .build();
        Self {
            agent,
            token: token.into(),
            api_base: API_BASE.to_string(),
            upload_base: UPLOAD_BASE.to_string(),
        }
    }

    /// Point the client at another endpoint (proxies, emulators).
    pub fn with_endpoints(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    fn authorized(&self, request: ureq::Request) -> ureq::Request {
        request
            .set("Authorization", &format!("Bearer {}", self.token))
            .query("supportsAllDrives", "true")
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base, id)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    /// Int64 values arrive as JSON strings; folders have no size.
    size: Option<String>,
    created_time: Option<DateTime<Utc>>,
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    trashed: bool,
}

impl DriveFile {
    fn into_object(self) -> (RemoteObject, bool) {
        let created_at = self.created_time.or(self.modified_time).unwrap_or_default();
        let modified_at = self.modified_time.unwrap_or(created_at);
        let object = RemoteObject {
            id: self.id,
            name: self.name,
            mime_type: self.mime_type,
            size_bytes: self.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            created_at,
            modified_at,
        };
        (object, self.trashed)
    }
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Map an HTTP status and the API's structured reason codes to a class.
pub(crate) fn classify_status(status: u16, reasons: &[String]) -> ErrorClass {
    match status {
        404 => ErrorClass::NotFound,
        429 | 500..=599 => ErrorClass::Transient,
        403 if reasons
            .iter()
            .any(|r| RATE_LIMIT_REASONS.contains(&r.as_str())) =>
        {
            ErrorClass::Transient
        }
        401 | 403 => ErrorClass::PermissionDenied,
        _ => ErrorClass::Other,
    }
}

fn classify(err: ureq::Error) -> StoreError {
    match err {
        ureq::Error::Status(status, response) => {
            let (message, reasons) = match response.into_json::<ErrorEnvelope>() {
                Ok(envelope) => (
                    envelope.error.message,
                    envelope
                        .error
                        .errors
                        .into_iter()
                        .map(|d| d.reason)
                        .collect::<Vec<_>>(),
                ),
                Err(_) => (String::new(), Vec::new()),
            };
            StoreError::new(
                classify_status(status, &reasons),
                format!("HTTP {status} {message}").trim_end().to_string(),
            )
        }
        ureq::Error::Transport(transport) => StoreError::transient(transport.to_string()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(response: ureq::Response) -> Result<T, StoreError> {
    response
        .into_json::<T>()
        .map_err(|e| StoreError::from_io(&e))
}

/// Render a query in Drive's `q` syntax.
pub(crate) fn render_query(query: &ObjectQuery) -> String {
    let mut clauses = Vec::new();
    if let Some(parent) = query.parent.as_deref() {
        clauses.push(format!("'{}' in parents", escape(parent)));
    }
    match query.mime_types.len() {
        0 => {}
        1 => clauses.push(format!("mimeType = '{}'", escape(&query.mime_types[0]))),
        _ => {
            let any = query
                .mime_types
                .iter()
                .map(|m| format!("mimeType = '{}'", escape(m)))
                .collect::<Vec<_>>()
                .join(" or ");
            clauses.push(format!("({any})"));
        }
    }
    if let Some(name) = query.name.as_deref() {
        clauses.push(format!("name = '{}'", escape(name)));
    }
    if !query.include_trashed {
        clauses.push("trashed = false".to_string());
    }
    clauses.join(" and ")
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

impl RemoteStore for DriveStore {
    fn list(&self, query: &ObjectQuery, page_token: Option<&str>) -> Result<Page, StoreError> {
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        let mut request = self
            .authorized(self.agent.get(&format!("{}/files", self.api_base)))
            .query("q", &render_query(query))
            .query("pageSize", PAGE_SIZE)
            .query("fields", &fields)
            .query("includeItemsFromAllDrives", "true");
        if let Some(token) = page_token {
            request = request.query("pageToken", token);
        }
        let list: FileList = decode(request.call().map_err(classify)?)?;
        Ok(Page {
            objects: list.files.into_iter().map(|f| f.into_object().0).collect(),
            next_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    fn get(&self, id: &str) -> Result<StoredObject, StoreError> {
        let response = self
            .authorized(self.agent.get(&self.file_url(id)))
            .query("fields", FILE_FIELDS)
            .call()
            .map_err(classify)?;
        let (object, trashed) = decode::<DriveFile>(response)?.into_object();
        Ok(StoredObject { object, trashed })
    }

    fn download(&self, id: &str, sink: &mut dyn Write) -> Result<u64, StoreError> {
        let response = self
            .authorized(self.agent.get(&self.file_url(id)))
            .query("alt", "media")
            .call()
            .map_err(classify)?;
        std::io::copy(&mut response.into_reader(), sink).map_err(|e| StoreError::from_io(&e))
    }

    fn upload(
        &self,
        meta: &NewObject,
        source: &mut dyn Read,
        len: u64,
    ) -> Result<String, StoreError> {
        let session = self
            .authorized(self.agent.post(&format!("{}/files", self.upload_base)))
            .query("uploadType", "resumable")
            .set("X-Upload-Content-Type", &meta.mime_type)
            .set("X-Upload-Content-Length", &len.to_string())
            .send_json(json!({
                "name": meta.name,
                "mimeType": meta.mime_type,
                "parents": [meta.parent],
            }))
            .map_err(classify)?;
        let location = session
            .header("Location")
            .map(str::to_string)
            .ok_or_else(|| StoreError::other("resumable session without Location header"))?;

        let response = self
            .agent
            .put(&location)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Content-Type", &meta.mime_type)
            .set("Content-Length", &len.to_string())
            .send(source)
            .map_err(classify)?;
        Ok(decode::<CreatedFile>(response)?.id)
    }

    fn create_folder(&self, parent: &str, name: &str) -> Result<String, StoreError> {
        let response = self
            .authorized(self.agent.post(&format!("{}/files", self.api_base)))
            .query("fields", "id")
            .send_json(json!({
                "name": name,
                "mimeType": FOLDER_MIME,
                "parents": [parent],
            }))
            .map_err(classify)?;
        Ok(decode::<CreatedFile>(response)?.id)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.authorized(self.agent.delete(&self.file_url(id)))
            .call()
            .map(|_| ())
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IMAGE_MIMES;

    #[test]
    fn statuses_map_to_classes() {
        assert_eq!(classify_status(404, &[]), ErrorClass::NotFound);
        assert_eq!(classify_status(429, &[]), ErrorClass::Transient);
        assert_eq!(classify_status(503, &[]), ErrorClass::Transient);
        assert_eq!(classify_status(401, &[]), ErrorClass::PermissionDenied);
        assert_eq!(classify_status(403, &[]), ErrorClass::PermissionDenied);
        assert_eq!(classify_status(400, &[]), ErrorClass::Other);
    }

    #[test]
    fn rate_limit_reason_makes_403_transient() {
        let reasons = vec!["userRateLimitExceeded".to_string()];
        assert_eq!(classify_status(403, &reasons), ErrorClass::Transient);
        let reasons = vec!["insufficientFilePermissions".to_string()];
        assert_eq!(classify_status(403, &reasons), ErrorClass::PermissionDenied);
    }

    #[test]
    fn image_query_renders_like_the_drive_syntax() {
        let q = ObjectQuery::children_of("abc").with_mime_types(IMAGE_MIMES);
        assert_eq!(
            render_query(&q),
            "'abc' in parents and (mimeType = 'image/jpeg' or mimeType = 'image/png' \
             or mimeType = 'image/jpg') and trashed = false"
        );
    }

    #[test]
    fn names_are_quoted_safely() {
        let q = ObjectQuery::children_of("abc").named("it's.mp4");
        assert!(render_query(&q).contains(r"name = 'it\'s.mp4'"));
    }

    #[test]
    fn drive_file_json_decodes() {
        let file: DriveFile = serde_json::from_str(
            r#"{"id":"1","name":"a.jpg","mimeType":"image/jpeg","size":"2048",
                "createdTime":"2024-05-01T10:00:00.000Z",
                "modifiedTime":"2024-05-01T10:05:00.000Z"}"#,
        )
        .unwrap();
        let (object, trashed) = file.into_object();
        assert_eq!(object.size_bytes, 2048);
        assert!(object.modified_at > object.created_at);
        assert!(!trashed);
    }
}
