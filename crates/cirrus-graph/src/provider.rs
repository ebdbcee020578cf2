//! `RemoteDrive` implementation over the Graph client.

use bytes::Bytes;
use cirrus_core::domain::{CoreError, ItemId};
use cirrus_core::ports::{
    ChildPage, ChunkOutcome, ConflictBehavior, DeltaPage, DownloadOutcome, ItemPatch,
    Reachability, RemoteDrive, RemoteItem, UploadSessionInfo, UploadTarget,
};
use reqwest::{Method, StatusCode};

use crate::client::{error_for_response, GraphClient};
use crate::items::drive_prefix;
use crate::{delta, items, upload};

/// The concrete remote drive: a Graph client bound to one drive id.
pub struct GraphDrive {
    client: GraphClient,
    drive_id: String,
}

impl GraphDrive {
    /// Binds a client to a drive (`"me"` selects the default drive).
    pub fn new(client: GraphClient, drive_id: impl Into<String>) -> Self {
        Self {
            client,
            drive_id: drive_id.into(),
        }
    }

    /// The drive this instance addresses.
    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }
}

#[async_trait::async_trait]
impl RemoteDrive for GraphDrive {
    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, CoreError> {
        items::get_item(&self.client, &self.drive_id, id).await
    }

    async fn get_item_by_path(&self, path: &str) -> Result<RemoteItem, CoreError> {
        items::get_item_by_path(&self.client, &self.drive_id, path).await
    }

    async fn list_children(
        &self,
        id: &ItemId,
        page: Option<&str>,
    ) -> Result<ChildPage, CoreError> {
        items::list_children(&self.client, &self.drive_id, id, page).await
    }

    async fn download(
        &self,
        id: &ItemId,
        if_none_match: Option<&str>,
    ) -> Result<DownloadOutcome, CoreError> {
        let path = format!(
            "{}/items/{}/content",
            drive_prefix(&self.drive_id),
            id.as_str()
        );
        let mut request = self.client.request(Method::GET, &path).await?;
        if let Some(etag) = if_none_match {
            request = request.header("If-None-Match", etag);
        }
        let response = self.client.execute(request).await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(DownloadOutcome::NotModified),
            s if s.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| CoreError::Transient(format!("download body error: {e}")))?;
                Ok(DownloadOutcome::Full(bytes))
            }
            _ => Err(error_for_response(response).await),
        }
    }

    async fn upload_small(
        &self,
        target: &UploadTarget,
        body: Bytes,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, CoreError> {
        upload::upload_small(&self.client, &self.drive_id, target, body, if_match).await
    }

    async fn create_upload_session(
        &self,
        target: &UploadTarget,
        behavior: ConflictBehavior,
    ) -> Result<UploadSessionInfo, CoreError> {
        upload::create_upload_session(&self.client, &self.drive_id, target, behavior).await
    }

    async fn put_chunk(
        &self,
        upload_url: &str,
        chunk: Bytes,
        offset: u64,
        total: u64,
    ) -> Result<ChunkOutcome, CoreError> {
        upload::put_chunk(&self.client, upload_url, chunk, offset, total).await
    }

    async fn cancel_upload_session(&self, upload_url: &str) -> Result<(), CoreError> {
        upload::cancel_upload_session(&self.client, upload_url).await
    }

    async fn create_folder(&self, parent: &ItemId, name: &str) -> Result<RemoteItem, CoreError> {
        items::create_folder(&self.client, &self.drive_id, parent, name).await
    }

    async fn patch(
        &self,
        id: &ItemId,
        fields: &ItemPatch,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, CoreError> {
        items::patch(&self.client, &self.drive_id, id, fields, if_match).await
    }

    async fn delete(&self, id: &ItemId, if_match: Option<&str>) -> Result<(), CoreError> {
        items::delete(&self.client, &self.drive_id, id, if_match).await
    }

    async fn delta(&self, drive_id: &str, cursor: Option<&str>) -> Result<DeltaPage, CoreError> {
        delta::delta_page(&self.client, drive_id, cursor).await
    }

    async fn probe(&self) -> Reachability {
        // an unauthenticated, cheap endpoint is enough to prove the network
        let path = format!("{}/root", drive_prefix(&self.drive_id));
        match self.client.request(Method::GET, &path).await {
            Ok(request) => match self.client.execute(request).await {
                Ok(_) => Reachability::Reachable,
                Err(CoreError::Transient(_)) => Reachability::Unreachable,
                // any HTTP-level answer proves the wire works
                Err(_) => Reachability::Reachable,
            },
            Err(_) => Reachability::Unreachable,
        }
    }
}
