use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{GroupId, UserId},
    error::ApiException,
    protocol::{
        FileUrlResponse, FriendSummary, FriendsResponse, GroupMessageRecord, GroupSummary,
        UploadResponse,
    },
};

use crate::{session::SessionContext, types::AttachmentUpload};

/// Request/response side of the server. Every failure here is non-fatal to
/// the session; callers log or surface it and carry on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_friends(&self) -> Result<Vec<FriendSummary>>;
    async fn fetch_groups(&self) -> Result<Vec<GroupSummary>>;
    async fn fetch_group_messages(
        &self,
        group_id: GroupId,
        limit: u32,
    ) -> Result<Vec<GroupMessageRecord>>;
    async fn mark_direct_read(&self, friend_id: UserId) -> Result<()>;
    async fn upload_file(&self, upload: &AttachmentUpload) -> Result<UploadResponse>;
    async fn file_url(&self, path: &str) -> Result<String>;
}

/// Stand-in for sessions with no REST backend: directory calls come back
/// empty, everything else fails.
pub struct MissingChatApi;

#[async_trait]
impl ChatApi for MissingChatApi {
    async fn fetch_friends(&self) -> Result<Vec<FriendSummary>> {
        Ok(Vec::new())
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupSummary>> {
        Ok(Vec::new())
    }

    async fn fetch_group_messages(
        &self,
        _group_id: GroupId,
        _limit: u32,
    ) -> Result<Vec<GroupMessageRecord>> {
        Ok(Vec::new())
    }

    async fn mark_direct_read(&self, _friend_id: UserId) -> Result<()> {
        Err(anyhow!("chat api is not configured"))
    }

    async fn upload_file(&self, _upload: &AttachmentUpload) -> Result<UploadResponse> {
        Err(anyhow!("chat api is not configured"))
    }

    async fn file_url(&self, _path: &str) -> Result<String> {
        Err(anyhow!("chat api is not configured"))
    }
}

pub struct HttpChatApi {
    http: Client,
    server_url: String,
    bearer: String,
}

impl HttpChatApi {
    pub fn new(session: &SessionContext) -> Self {
        Self::with_client(Client::new(), session)
    }

    pub fn with_client(http: Client, session: &SessionContext) -> Self {
        Self {
            http,
            server_url: session.server_url.clone(),
            bearer: session.credential.bearer(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.server_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .header(reqwest::header::AUTHORIZATION, &self.bearer)
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_friends(&self) -> Result<Vec<FriendSummary>> {
        let response: FriendsResponse = self.get_json("/user/my/friends").await?;
        Ok(response.friends)
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupSummary>> {
        self.get_json("/group/my-groups").await
    }

    async fn fetch_group_messages(
        &self,
        group_id: GroupId,
        limit: u32,
    ) -> Result<Vec<GroupMessageRecord>> {
        let response = self
            .http
            .get(self.url(&format!("/group/{group_id}/messages")))
            .header(reqwest::header::AUTHORIZATION, &self.bearer)
            .query(&[("limit", limit)])
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    async fn mark_direct_read(&self, friend_id: UserId) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/user/messages/{friend_id}/read")))
            .header(reqwest::header::AUTHORIZATION, &self.bearer)
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    async fn upload_file(&self, upload: &AttachmentUpload) -> Result<UploadResponse> {
        let part = multipart::Part::bytes(upload.bytes.clone())
            .file_name(upload.file_name.clone())
            .mime_str(
                upload
                    .mime_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )?;
        let form = multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(self.url("/user/upload"))
            .header(reqwest::header::AUTHORIZATION, &self.bearer)
            .multipart(form)
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    async fn file_url(&self, path: &str) -> Result<String> {
        let response: FileUrlResponse = self
            .get_json(&format!("/user/file/{}", path.trim_start_matches('/')))
            .await?;
        Ok(response.url)
    }
}

async fn checked(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiException::from_response(status.as_u16(), &body).into())
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
