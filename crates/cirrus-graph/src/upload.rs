//! Upload operations: single-PUT small uploads and resumable sessions.
//!
//! The small path is `PUT .../content` with an optional `If-Match`; the
//! session path is `POST .../createUploadSession` followed by `PUT`s of
//! aligned chunks carrying `Content-Range`. The chunk loop, offset
//! persistence, and retry policy live in the upload manager; this module
//! only speaks the protocol.

use bytes::Bytes;
use cirrus_core::domain::CoreError;
use cirrus_core::ports::{
    ChunkOutcome, ConflictBehavior, RemoteItem, UploadSessionInfo, UploadTarget,
};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::client::{error_for_response, GraphClient};
use crate::items::{drive_prefix, to_remote_item, GraphDriveItem};

/// Server-required alignment for session chunks (320 KiB).
pub const CHUNK_ALIGNMENT: u64 = 320 * 1024;

/// Response from creating an upload session
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
    expiration_date_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Response to an intermediate chunk (HTTP 202)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextRangesResponse {
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

/// Builds the API path addressing an upload target.
fn target_path(drive_id: &str, target: &UploadTarget, suffix: &str) -> String {
    match target {
        UploadTarget::Item(id) => {
            format!("{}/items/{}/{suffix}", drive_prefix(drive_id), id.as_str())
        }
        UploadTarget::ChildOf { parent, name } => format!(
            "{}/items/{}:/{}:/{suffix}",
            drive_prefix(drive_id),
            parent.as_str(),
            name
        ),
    }
}

/// Uploads a small body in one conditional PUT.
pub(crate) async fn upload_small(
    client: &GraphClient,
    drive_id: &str,
    target: &UploadTarget,
    body: Bytes,
    if_match: Option<&str>,
) -> Result<RemoteItem, CoreError> {
    let path = target_path(drive_id, target, "content");
    let mut request = client
        .request(Method::PUT, &path)
        .await?
        .header("Content-Type", "application/octet-stream")
        .body(body);
    if let Some(etag) = if_match {
        request = request.header("If-Match", etag);
    }
    let response = client.execute(request).await?;
    let response = client.expect_success(response).await?;
    let item: GraphDriveItem = response
        .json()
        .await
        .map_err(|e| CoreError::Transient(format!("malformed upload response: {e}")))?;
    Ok(to_remote_item(item))
}

/// Creates a resumable upload session.
pub(crate) async fn create_upload_session(
    client: &GraphClient,
    drive_id: &str,
    target: &UploadTarget,
    behavior: ConflictBehavior,
) -> Result<UploadSessionInfo, CoreError> {
    let path = target_path(drive_id, target, "createUploadSession");
    let behavior = match behavior {
        ConflictBehavior::Fail => "fail",
        ConflictBehavior::Replace => "replace",
        ConflictBehavior::Rename => "rename",
    };
    let body = json!({ "item": { "@microsoft.graph.conflictBehavior": behavior } });
    let request = client.request(Method::POST, &path).await?.json(&body);
    let response = client.execute(request).await?;
    let response = client.expect_success(response).await?;
    let session: UploadSessionResponse = response
        .json()
        .await
        .map_err(|e| CoreError::Transient(format!("malformed session response: {e}")))?;
    Ok(UploadSessionInfo {
        upload_url: session.upload_url,
        expires: session.expiration_date_time,
        chunk_alignment: CHUNK_ALIGNMENT,
    })
}

/// Uploads one chunk to a session URL.
///
/// An empty chunk with `offset == total` queries session state and yields
/// the completed item if the server already has every byte.
pub(crate) async fn put_chunk(
    client: &GraphClient,
    upload_url: &str,
    chunk: Bytes,
    offset: u64,
    total: u64,
) -> Result<ChunkOutcome, CoreError> {
    let content_range = if chunk.is_empty() {
        format!("bytes */{total}")
    } else {
        let end = offset + chunk.len() as u64 - 1;
        format!("bytes {offset}-{end}/{total}")
    };

    let request = client
        .request_absolute(Method::PUT, upload_url)
        .await?
        .header("Content-Length", chunk.len().to_string())
        .header("Content-Range", &content_range)
        .body(chunk);

    let response = client.execute(request).await?;
    let status = response.status();
    match status {
        StatusCode::ACCEPTED => {
            let ranges: NextRangesResponse = response
                .json()
                .await
                .map_err(|e| CoreError::Transient(format!("malformed chunk response: {e}")))?;
            let next_offset = ranges
                .next_expected_ranges
                .first()
                .and_then(|r| r.split('-').next())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(offset + 1);
            Ok(ChunkOutcome::Accepted { next_offset })
        }
        StatusCode::OK | StatusCode::CREATED => {
            let item: GraphDriveItem = response
                .json()
                .await
                .map_err(|e| CoreError::Transient(format!("malformed final chunk response: {e}")))?;
            Ok(ChunkOutcome::Complete(to_remote_item(item)))
        }
        _ => Err(error_for_response(response).await),
    }
}

/// Abandons an open session.
pub(crate) async fn cancel_upload_session(
    client: &GraphClient,
    upload_url: &str,
) -> Result<(), CoreError> {
    let request = client.request_absolute(Method::DELETE, upload_url).await?;
    let response = client.execute(request).await?;
    client.expect_success(response).await?;
    Ok(())
}
