//! Google Drive folder backend over the Drive v3 REST API.
//!
//! Authenticates with a bearer access token; obtaining and refreshing the
//! token is left to whoever deploys the relay.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::channels::folder::{RemoteFile, RemoteFolder};
use crate::error::ChannelError;

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";

/// Per-request timeout for Drive calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    /// Decimal string; absent for Google-native documents.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    md5_checksum: Option<String>,
}

impl DriveFile {
    /// Content checksum when Drive has one, else size plus modification time.
    fn version(&self) -> Option<String> {
        if let Some(md5) = &self.md5_checksum {
            return Some(md5.clone());
        }
        if self.size.is_none() && self.modified_time.is_none() {
            return None;
        }
        Some(format!(
            "{}:{}",
            self.size.as_deref().unwrap_or_default(),
            self.modified_time.as_deref().unwrap_or_default()
        ))
    }
}

/// A Drive folder shared with the agent.
pub struct DriveFolder {
    folder_id: String,
    access_token: SecretString,
    client: reqwest::Client,
}

impl DriveFolder {
    pub fn new(folder_id: String, access_token: SecretString) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::InvalidResponse {
                name: "drive".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            folder_id,
            access_token,
            client,
        })
    }

    /// Turn a non-success response into the matching channel error.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ChannelError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ChannelError::AuthFailed {
                name: "drive".into(),
                reason: format!("{status}: {body}"),
            });
        }
        Err(ChannelError::InvalidResponse {
            name: "drive".into(),
            reason: format!("{status}: {body}"),
        })
    }
}

#[async_trait]
impl RemoteFolder for DriveFolder {
    fn backend(&self) -> &str {
        "drive"
    }

    async fn upload(&self, name: &str, contents: Vec<u8>) -> Result<(), ChannelError> {
        let boundary = format!("vcf-relay-{}", uuid::Uuid::new_v4().simple());
        let metadata = serde_json::json!({
            "name": name,
            "parents": [self.folder_id],
        });
        let body = multipart_related_body(&boundary, &metadata, &contents);

        let resp = self
            .client
            .post(UPLOAD_URL)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .bearer_auth(self.access_token.expose_secret())
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| ChannelError::DispatchFailed {
                name: "drive".into(),
                reason: e.to_string(),
            })?;

        let resp = Self::check(resp).await?;
        let created: serde_json::Value =
            resp.json().await.map_err(|e| ChannelError::InvalidResponse {
                name: "drive".into(),
                reason: e.to_string(),
            })?;
        debug!(file = %name, drive_id = %created["id"], "Uploaded file to Drive");
        Ok(())
    }

    async fn find(&self, name: &str) -> Result<Option<RemoteFile>, ChannelError> {
        let resp = self
            .client
            .get(FILES_URL)
            .query(&[
                ("q", name_query(&self.folder_id, name).as_str()),
                ("fields", "files(id, name, size, modifiedTime, md5Checksum)"),
                ("spaces", "drive"),
            ])
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| ChannelError::ProbeFailed {
                name: "drive".into(),
                reason: e.to_string(),
            })?;

        let list: FileList =
            Self::check(resp)
                .await?
                .json()
                .await
                .map_err(|e| ChannelError::InvalidResponse {
                    name: "drive".into(),
                    reason: e.to_string(),
                })?;

        Ok(list.files.into_iter().next().map(|f| RemoteFile {
            version: f.version(),
            id: f.id,
            name: f.name,
        }))
    }

    async fn download(&self, file: &RemoteFile) -> Result<Vec<u8>, ChannelError> {
        let resp = self
            .client
            .get(format!("{FILES_URL}/{}", file.id))
            .query(&[("alt", "media")])
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| ChannelError::ProbeFailed {
                name: "drive".into(),
                reason: e.to_string(),
            })?;

        let bytes = Self::check(resp)
            .await?
            .bytes()
            .await
            .map_err(|e| ChannelError::ProbeFailed {
                name: "drive".into(),
                reason: format!("download of {} interrupted: {e}", file.name),
            })?;
        Ok(bytes.to_vec())
    }
}

/// Drive search query matching one exact file name inside a folder.
pub fn name_query(folder_id: &str, name: &str) -> String {
    format!(
        "'{}' in parents and name = '{}' and trashed = false",
        escape_query_literal(folder_id),
        escape_query_literal(name)
    )
}

fn escape_query_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Body for a Drive `uploadType=multipart` request: JSON metadata part, then media part.
pub fn multipart_related_body(
    boundary: &str,
    metadata: &serde_json::Value,
    contents: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(contents.len() + 512);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_matches_exact_name_in_folder() {
        assert_eq!(
            name_query("F1", "abc123.txt"),
            "'F1' in parents and name = 'abc123.txt' and trashed = false"
        );
    }

    #[test]
    fn query_escapes_quotes() {
        assert_eq!(
            name_query("F1", "o'neil.txt"),
            r"'F1' in parents and name = 'o\'neil.txt' and trashed = false"
        );
    }

    #[test]
    fn multipart_body_layout() {
        let metadata = serde_json::json!({ "name": "j.vcf" });
        let body = multipart_related_body("B", &metadata, b"ACGT");
        let text = String::from_utf8(body).unwrap();

        assert!(text.starts_with("--B\r\nContent-Type: application/json"));
        assert!(text.contains(r#"{"name":"j.vcf"}"#));
        assert!(text.contains("Content-Type: application/octet-stream\r\n\r\nACGT\r\n--B--\r\n"));
        assert_eq!(text.matches("--B").count(), 3);
    }

    #[test]
    fn file_version_prefers_checksum() {
        let listed: FileList = serde_json::from_value(serde_json::json!({
            "files": [
                { "id": "1", "name": "a.txt", "size": "17", "modifiedTime": "2026-01-02T03:04:05Z", "md5Checksum": "d41d8c" },
                { "id": "2", "name": "b.txt", "size": "17", "modifiedTime": "2026-01-02T03:04:05Z" },
                { "id": "3", "name": "c.gdoc" }
            ]
        }))
        .unwrap();

        assert_eq!(listed.files[0].version().as_deref(), Some("d41d8c"));
        assert_eq!(listed.files[1].version().as_deref(), Some("17:2026-01-02T03:04:05Z"));
        assert_eq!(listed.files[2].version(), None);
    }

    #[test]
    fn folder_builds() {
        let folder = DriveFolder::new("F1".into(), SecretString::from("token".to_string())).unwrap();
        assert_eq!(folder.backend(), "drive");
    }
}
