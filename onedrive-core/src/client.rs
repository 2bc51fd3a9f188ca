use std::sync::Arc;

use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;

use crate::error::DriveError;
use crate::resource::{
    AsyncCopySession, AsyncOperationProgress, AsyncOperationStatus, ConflictBehavior, Drive,
    DriveItem, ItemLocator, ItemPage, ItemPatch, ItemReference, UploadProgress, UploadSession,
    UploadSessionStatus,
};
use crate::transport::{CallOptions, RetryingTransport};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0/";
const CONFLICT_BEHAVIOR: &str = "@microsoft.graph.conflictBehavior";
const ROOT_PATH: &str = "/drive/root:";

/// Remote path of a drive-relative path, in the form the API reports in
/// `parentReference.path` (`/drive/root:/Docs`).
pub fn remote_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        ROOT_PATH.to_string()
    } else {
        format!("{ROOT_PATH}/{trimmed}")
    }
}

#[derive(Clone)]
pub struct DriveClient {
    transport: Arc<RetryingTransport>,
    base_url: Url,
}

impl DriveClient {
    pub fn new(transport: Arc<RetryingTransport>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, transport)
    }

    pub fn with_base_url(
        base_url: &str,
        transport: Arc<RetryingTransport>,
    ) -> Result<Self, DriveError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase.into());
        }
        Ok(Self {
            transport,
            base_url,
        })
    }

    pub fn transport(&self) -> &Arc<RetryingTransport> {
        &self.transport
    }

    pub async fn get_drive(&self) -> Result<Drive, DriveError> {
        let url = self.drive_url(&[])?;
        let response = self
            .transport
            .send(CallOptions::default(), |http| http.get(url.clone()))
            .await?;
        decode(response).await
    }

    pub async fn get_item(&self, locator: &ItemLocator) -> Result<DriveItem, DriveError> {
        let url = self.item_url(locator, None)?;
        let response = self
            .transport
            .send(CallOptions::default(), |http| http.get(url.clone()))
            .await?;
        decode(response).await
    }

    /// First page of the children of `path`; follow `next_link` with
    /// [`DriveClient::list_children_next`].
    pub async fn list_children(&self, path: &str) -> Result<ItemPage, DriveError> {
        let url = self.item_url(&ItemLocator::Path(path.to_string()), Some("children"))?;
        let response = self
            .transport
            .send(CallOptions::default(), |http| http.get(url.clone()))
            .await?;
        decode(response).await
    }

    pub async fn list_children_next(&self, next_link: &str) -> Result<ItemPage, DriveError> {
        let url = Url::parse(next_link)?;
        let response = self
            .transport
            .send(CallOptions::default(), |http| http.get(url.clone()))
            .await?;
        decode(response).await
    }

    pub async fn create_folder(
        &self,
        parent: &str,
        name: &str,
        conflict: ConflictBehavior,
    ) -> Result<DriveItem, DriveError> {
        let url = self.item_url(&ItemLocator::Path(parent.to_string()), Some("children"))?;
        let body = json!({
            "name": name,
            "folder": {},
            CONFLICT_BEHAVIOR: conflict.as_str(),
        });
        let response = self
            .transport
            .send(CallOptions::default(), |http| {
                http.post(url.clone()).json(&body)
            })
            .await?;
        decode(response).await
    }

    pub async fn delete_item(&self, locator: &ItemLocator) -> Result<(), DriveError> {
        let url = self.item_url(locator, None)?;
        self.transport
            .send(CallOptions::default(), |http| http.delete(url.clone()))
            .await?;
        Ok(())
    }

    pub async fn update_item(
        &self,
        locator: &ItemLocator,
        patch: &ItemPatch,
    ) -> Result<DriveItem, DriveError> {
        let url = self.item_url(locator, None)?;
        let response = self
            .transport
            .send(CallOptions::default(), |http| {
                http.patch(url.clone()).json(patch)
            })
            .await?;
        decode(response).await
    }

    /// Requests bytes `start..=end` of the item content. Servers may ignore
    /// the range and answer `200` with the whole body.
    pub async fn download_range(
        &self,
        item_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Response, DriveError> {
        let url = self.item_url(&ItemLocator::Id(item_id.to_string()), Some("content"))?;
        let range = format!("bytes={start}-{end}");
        self.transport
            .send(CallOptions::default(), |http| {
                http.get(url.clone()).header(RANGE, range.as_str())
            })
            .await
    }

    pub async fn upload_small(
        &self,
        parent: &str,
        name: &str,
        content: Vec<u8>,
        conflict: ConflictBehavior,
    ) -> Result<DriveItem, DriveError> {
        let mut url = self.item_url(&ItemLocator::Path(join(parent, name)), Some("content"))?;
        url.query_pairs_mut()
            .append_pair(CONFLICT_BEHAVIOR, conflict.as_str());
        let response = self
            .transport
            .send(CallOptions::default(), |http| {
                http.put(url.clone()).body(content.clone())
            })
            .await?;
        decode(response).await
    }

    pub async fn create_upload_session(
        &self,
        parent: &str,
        name: &str,
        conflict: ConflictBehavior,
    ) -> Result<UploadSession, DriveError> {
        let url = self.item_url(
            &ItemLocator::Path(join(parent, name)),
            Some("createUploadSession"),
        )?;
        let body = json!({ "item": { CONFLICT_BEHAVIOR: conflict.as_str() } });
        let response = self
            .transport
            .send(CallOptions::default(), |http| {
                http.post(url.clone()).json(&body)
            })
            .await?;
        decode(response).await
    }

    /// Sends one fragment starting at byte `start` of a `total`-byte file.
    pub async fn upload_fragment(
        &self,
        session: &UploadSession,
        chunk: Vec<u8>,
        start: u64,
        total: u64,
    ) -> Result<UploadProgress, DriveError> {
        if chunk.is_empty() {
            return Err(DriveError::MalformedResponse(
                "upload session requested an empty fragment".into(),
            ));
        }
        let url = Url::parse(&session.upload_url)?;
        let end = start + chunk.len() as u64 - 1;
        let content_range = format!("bytes {start}-{end}/{total}");
        let response = self
            .transport
            .send(CallOptions::anonymous(), |http| {
                http.put(url.clone())
                    .header(CONTENT_RANGE, content_range.as_str())
                    .body(chunk.clone())
            })
            .await?;
        if response.status() == StatusCode::ACCEPTED {
            let status: UploadSessionStatus = decode(response).await?;
            let mut next = session.clone();
            next.apply(status);
            Ok(UploadProgress::Pending(next))
        } else {
            let item: DriveItem = decode(response).await?;
            Ok(UploadProgress::Complete(Box::new(item)))
        }
    }

    pub async fn copy_item(
        &self,
        source: &ItemLocator,
        dest_parent: &str,
        name: &str,
    ) -> Result<AsyncCopySession, DriveError> {
        let url = self.item_url(source, Some("copy"))?;
        let body = json!({
            "parentReference": ItemReference {
                path: Some(remote_path(dest_parent)),
                ..ItemReference::default()
            },
            "name": name,
        });
        let response = self
            .transport
            .send(CallOptions::default(), |http| {
                http.post(url.clone()).json(&body)
            })
            .await?;
        let monitor = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                DriveError::MalformedResponse("copy response has no Location header".into())
            })?;
        Ok(AsyncCopySession::new(monitor))
    }

    pub async fn poll_copy(
        &self,
        session: &AsyncCopySession,
    ) -> Result<AsyncCopySession, DriveError> {
        let url = Url::parse(&session.monitor_url)?;
        let response = self
            .transport
            .send(CallOptions::anonymous(), |http| http.get(url.clone()))
            .await?;
        let status = response.status();
        let body: serde_json::Value = decode(response).await?;
        let mut next = session.clone();
        if status != StatusCode::ACCEPTED && body.get("id").is_some() {
            let item: DriveItem = serde_json::from_value(body)
                .map_err(|err| DriveError::MalformedResponse(err.to_string()))?;
            next.status = AsyncOperationStatus::Completed;
            next.percentage_complete = 100.0;
            next.resource_id = Some(item.id.clone());
            next.item = Some(Box::new(item));
            return Ok(next);
        }
        let progress: AsyncOperationProgress = serde_json::from_value(body)
            .map_err(|err| DriveError::MalformedResponse(err.to_string()))?;
        next.status = progress.status;
        next.percentage_complete = progress.percentage_complete;
        if progress.resource_id.is_some() {
            next.resource_id = progress.resource_id;
        }
        Ok(next)
    }

    fn drive_url(&self, tail: &[&str]) -> Result<Url, DriveError> {
        let mut url = self.base_url.clone();
        let Ok(mut segments) = url.path_segments_mut() else {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase.into());
        };
        segments.pop_if_empty().push("drive");
        for segment in tail {
            segments.push(segment);
        }
        drop(segments);
        Ok(url)
    }

    fn item_url(&self, locator: &ItemLocator, action: Option<&str>) -> Result<Url, DriveError> {
        let mut tail: Vec<String> = Vec::new();
        match locator {
            ItemLocator::Id(id) => {
                tail.push("items".into());
                tail.push(id.clone());
            }
            ItemLocator::Path(path) => {
                let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
                match parts.split_last() {
                    None => tail.push("root".into()),
                    Some((last, init)) => {
                        tail.push("root:".into());
                        tail.extend(init.iter().map(|part| part.to_string()));
                        tail.push(format!("{last}:"));
                    }
                }
            }
        }
        if let Some(action) = action {
            tail.push(action.to_string());
        }
        let tail: Vec<&str> = tail.iter().map(String::as_str).collect();
        self.drive_url(&tail)
    }
}

fn join(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, DriveError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|err| DriveError::MalformedResponse(err.to_string()))
}
