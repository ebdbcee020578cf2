//! Item metadata operations and the DriveItem wire format.
//!
//! Maps the Graph API's DriveItem JSON onto the port-level
//! [`RemoteItem`] DTO and implements get/list/patch/delete.

use chrono::{DateTime, Utc};
use cirrus_core::domain::{CoreError, ItemId, ItemKind};
use cirrus_core::ports::{ChildPage, ItemPatch, RemoteItem};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::client::GraphClient;

// ============================================================================
// Wire format
// ============================================================================

/// DriveItem as returned by the Graph API.
///
/// Fields are `Option` because not every facet is present on every item:
/// tombstones lack file metadata, folders lack hashes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphDriveItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub size: Option<u64>,
    pub e_tag: Option<String>,
    pub created_date_time: Option<DateTime<Utc>>,
    pub last_modified_date_time: Option<DateTime<Utc>>,
    pub parent_reference: Option<GraphParentReference>,
    pub file: Option<GraphFileFacet>,
    pub folder: Option<serde_json::Value>,
    pub package: Option<serde_json::Value>,
    pub deleted: Option<serde_json::Value>,
}

/// Parent reference facet
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphParentReference {
    pub id: Option<String>,
}

/// File facet (present iff the item is a file)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphFileFacet {
    pub mime_type: Option<String>,
    pub hashes: Option<GraphHashes>,
}

/// Content hashes of a file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphHashes {
    pub quick_xor_hash: Option<String>,
}

/// Body of a metadata PATCH (rename and/or move)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatchBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_reference: Option<PatchParentReference>,
}

#[derive(Debug, Serialize)]
struct PatchParentReference {
    id: String,
}

/// One page of a children listing
#[derive(Debug, Deserialize)]
pub(crate) struct GraphChildrenResponse {
    #[serde(default)]
    pub value: Vec<GraphDriveItem>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

/// Converts a wire DriveItem into the port DTO.
pub(crate) fn to_remote_item(item: GraphDriveItem) -> RemoteItem {
    let kind = if item.folder.is_some() {
        ItemKind::Folder
    } else if item.package.is_some() {
        ItemKind::Package
    } else {
        ItemKind::File
    };
    RemoteItem {
        id: ItemId::new(item.id),
        name: item.name,
        parent_id: item
            .parent_reference
            .and_then(|pr| pr.id)
            .map(ItemId::new),
        size: item.size.unwrap_or(0),
        etag: item.e_tag,
        hash: item
            .file
            .as_ref()
            .and_then(|f| f.hashes.as_ref())
            .and_then(|h| h.quick_xor_hash.clone()),
        mime: item.file.as_ref().and_then(|f| f.mime_type.clone()),
        created: item.created_date_time,
        modified: item.last_modified_date_time,
        kind,
        deleted: item.deleted.is_some(),
    }
}

// ============================================================================
// Path construction
// ============================================================================

/// Prefix selecting the drive: `/me/drive` or `/drives/{id}`.
pub(crate) fn drive_prefix(drive_id: &str) -> String {
    if drive_id == "me" {
        "/me/drive".to_string()
    } else {
        format!("/drives/{drive_id}")
    }
}

// ============================================================================
// Operations
// ============================================================================

/// `GET /drives/{drive}/items/{id}`
pub(crate) async fn get_item(
    client: &GraphClient,
    drive_id: &str,
    id: &ItemId,
) -> Result<RemoteItem, CoreError> {
    let path = format!("{}/items/{}", drive_prefix(drive_id), id.as_str());
    let request = client.request(Method::GET, &path).await?;
    let response = client.execute(request).await?;
    let response = client.expect_success(response).await?;
    let item: GraphDriveItem = response
        .json()
        .await
        .map_err(|e| CoreError::Transient(format!("malformed item response: {e}")))?;
    Ok(to_remote_item(item))
}

/// `GET /drives/{drive}/root:/{path}:` — path is drive-root-relative.
pub(crate) async fn get_item_by_path(
    client: &GraphClient,
    drive_id: &str,
    item_path: &str,
) -> Result<RemoteItem, CoreError> {
    let trimmed = item_path.trim_matches('/');
    let path = if trimmed.is_empty() {
        format!("{}/root", drive_prefix(drive_id))
    } else {
        format!("{}/root:/{}:", drive_prefix(drive_id), trimmed)
    };
    let request = client.request(Method::GET, &path).await?;
    let response = client.execute(request).await?;
    let response = client.expect_success(response).await?;
    let item: GraphDriveItem = response
        .json()
        .await
        .map_err(|e| CoreError::Transient(format!("malformed item response: {e}")))?;
    Ok(to_remote_item(item))
}

/// `GET /drives/{drive}/items/{id}/children`, one page at a time. The
/// page token is the full `@odata.nextLink` URL.
pub(crate) async fn list_children(
    client: &GraphClient,
    drive_id: &str,
    id: &ItemId,
    page: Option<&str>,
) -> Result<ChildPage, CoreError> {
    let request = match page {
        Some(url) => client.request_absolute(Method::GET, url).await?,
        None => {
            let path = format!("{}/items/{}/children", drive_prefix(drive_id), id.as_str());
            client.request(Method::GET, &path).await?
        }
    };
    let response = client.execute(request).await?;
    let response = client.expect_success(response).await?;
    let page: GraphChildrenResponse = response
        .json()
        .await
        .map_err(|e| CoreError::Transient(format!("malformed children response: {e}")))?;
    Ok(ChildPage {
        items: page.value.into_iter().map(to_remote_item).collect(),
        next_page: page.next_link,
    })
}

/// `POST /drives/{drive}/items/{parent}/children` with a folder facet.
pub(crate) async fn create_folder(
    client: &GraphClient,
    drive_id: &str,
    parent: &ItemId,
    name: &str,
) -> Result<RemoteItem, CoreError> {
    let path = format!(
        "{}/items/{}/children",
        drive_prefix(drive_id),
        parent.as_str()
    );
    let body = serde_json::json!({
        "name": name,
        "folder": {},
        "@microsoft.graph.conflictBehavior": "fail",
    });
    let request = client.request(Method::POST, &path).await?.json(&body);
    let response = client.execute(request).await?;
    let response = client.expect_success(response).await?;
    let item: GraphDriveItem = response
        .json()
        .await
        .map_err(|e| CoreError::Transient(format!("malformed folder response: {e}")))?;
    Ok(to_remote_item(item))
}

/// `PATCH /drives/{drive}/items/{id}` with optional `If-Match`.
pub(crate) async fn patch(
    client: &GraphClient,
    drive_id: &str,
    id: &ItemId,
    fields: &ItemPatch,
    if_match: Option<&str>,
) -> Result<RemoteItem, CoreError> {
    let path = format!("{}/items/{}", drive_prefix(drive_id), id.as_str());
    let body = PatchBody {
        name: fields.name.clone(),
        parent_reference: fields
            .parent_id
            .as_ref()
            .map(|p| PatchParentReference {
                id: p.as_str().to_string(),
            }),
    };
    let mut request = client.request(Method::PATCH, &path).await?.json(&body);
    if let Some(etag) = if_match {
        request = request.header("If-Match", etag);
    }
    let response = client.execute(request).await?;
    let response = client.expect_success(response).await?;
    let item: GraphDriveItem = response
        .json()
        .await
        .map_err(|e| CoreError::Transient(format!("malformed patch response: {e}")))?;
    Ok(to_remote_item(item))
}

/// `DELETE /drives/{drive}/items/{id}` with optional `If-Match`.
pub(crate) async fn delete(
    client: &GraphClient,
    drive_id: &str,
    id: &ItemId,
    if_match: Option<&str>,
) -> Result<(), CoreError> {
    let path = format!("{}/items/{}", drive_prefix(drive_id), id.as_str());
    let mut request = client.request(Method::DELETE, &path).await?;
    if let Some(etag) = if_match {
        request = request.header("If-Match", etag);
    }
    let response = client.execute(request).await?;
    client.expect_success(response).await?;
    Ok(())
}
