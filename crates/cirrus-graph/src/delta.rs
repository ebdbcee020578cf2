//! Delta change-feed queries.
//!
//! One call fetches one page. The caller (the delta applier) follows
//! `next_page` links within a poll and persists `final_cursor` when the
//! feed is drained; both tokens are the full URLs returned by the server,
//! so resuming is a plain absolute GET.

use cirrus_core::domain::CoreError;
use cirrus_core::ports::DeltaPage;
use reqwest::Method;
use serde::Deserialize;

use crate::client::GraphClient;
use crate::items::{drive_prefix, to_remote_item, GraphDriveItem};

/// Raw response from `GET .../root/delta`
#[derive(Debug, Deserialize)]
struct GraphDeltaResponse {
    #[serde(default)]
    value: Vec<GraphDriveItem>,
    /// Present when more pages exist within this poll
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    /// Present only on the last page; the cursor for the next poll
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

/// Fetches one page of the change feed.
///
/// `cursor` is `None` for the initial full enumeration, or a previously
/// returned next-page/final-cursor URL.
pub(crate) async fn delta_page(
    client: &GraphClient,
    drive_id: &str,
    cursor: Option<&str>,
) -> Result<DeltaPage, CoreError> {
    let request = match cursor {
        Some(url) if url.starts_with("http") => {
            client.request_absolute(Method::GET, url).await?
        }
        Some(token) => {
            let path = format!("{}/root/delta?token={token}", drive_prefix(drive_id));
            client.request(Method::GET, &path).await?
        }
        None => {
            let path = format!("{}/root/delta", drive_prefix(drive_id));
            client.request(Method::GET, &path).await?
        }
    };

    let response = client.execute(request).await?;
    let response = client.expect_success(response).await?;
    let page: GraphDeltaResponse = response
        .json()
        .await
        .map_err(|e| CoreError::Transient(format!("malformed delta response: {e}")))?;

    tracing::debug!(
        items = page.value.len(),
        has_next = page.next_link.is_some(),
        done = page.delta_link.is_some(),
        "delta page"
    );

    Ok(DeltaPage {
        items: page.value.into_iter().map(to_remote_item).collect(),
        next_page: page.next_link,
        final_cursor: page.delta_link,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_response_with_next_link() {
        let json = r#"{
            "value": [
                { "id": "A", "name": "a.txt", "size": 10,
                  "file": {}, "parentReference": { "id": "ROOT" } }
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/me/drive/root/delta?token=p2"
        }"#;

        let resp: GraphDeltaResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.value.len(), 1);
        assert!(resp.next_link.is_some());
        assert!(resp.delta_link.is_none());
    }

    #[test]
    fn test_delta_response_final_page() {
        let json = r#"{
            "value": [],
            "@odata.deltaLink": "https://graph.microsoft.com/v1.0/me/drive/root/delta?token=final"
        }"#;

        let resp: GraphDeltaResponse = serde_json::from_str(json).unwrap();
        assert!(resp.value.is_empty());
        assert!(resp.delta_link.unwrap().contains("token=final"));
    }

    #[test]
    fn test_delta_response_includes_tombstones() {
        let json = r#"{
            "value": [
                { "id": "D", "name": "gone.txt", "deleted": {} }
            ],
            "@odata.deltaLink": "https://example/delta?token=t"
        }"#;

        let resp: GraphDeltaResponse = serde_json::from_str(json).unwrap();
        let item = to_remote_item(resp.value.into_iter().next().unwrap());
        assert!(item.deleted);
    }
}
