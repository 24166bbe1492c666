//! REST-backed content store.
//!
//! Talks to the project service that owns file contents:
//! - `GET  {base}/projects/{project}/files/{file}/content` → `{"content": ".."}`
//! - `PUT  {base}/projects/{project}/files/{file}/content` ← `{"content": ".."}`
//! - `GET  {base}/projects/{project}/changes` → `[LogEntry, ..]`

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use tandem_core::LogEntry;

use super::{ContentStore, StoreError};

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Service root, without a trailing slash
    pub base_url: String,
    /// Sent as `Authorization: Bearer <token>` when present
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".into(),
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl HttpStoreConfig {
    pub fn for_testing(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ContentBody {
    content: String,
}

pub struct HttpStore {
    client: Client,
    config: HttpStoreConfig,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn content_url(&self, project_id: Uuid, file_id: Uuid) -> String {
        self.url(&format!("/projects/{project_id}/files/{file_id}/content"))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl ContentStore for HttpStore {
    async fn fetch_content(&self, project_id: Uuid, file_id: Uuid) -> Result<String, StoreError> {
        let response = self
            .authorize(self.client.get(self.content_url(project_id, file_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(file_id));
        }
        let body: ContentBody = response.error_for_status()?.json().await?;
        Ok(body.content)
    }

    async fn save_content(
        &self,
        project_id: Uuid,
        file_id: Uuid,
        content: String,
    ) -> Result<(), StoreError> {
        let bytes = content.len();
        self.authorize(self.client.put(self.content_url(project_id, file_id)))
            .json(&ContentBody { content })
            .send()
            .await?
            .error_for_status()?;
        log::debug!("PUT content for file {file_id} ({bytes} bytes)");
        Ok(())
    }

    async fn fetch_change_log(&self, project_id: Uuid) -> Result<Vec<LogEntry>, StoreError> {
        let url = self.url(&format!("/projects/{project_id}/changes"));
        let entries = self
            .authorize(self.client.get(url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{ChangeRecord, Origin, Position};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer, token: Option<&str>) -> HttpStore {
        let mut config = HttpStoreConfig::for_testing(server.uri());
        config.token = token.map(str::to_owned);
        HttpStore::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_content() {
        let server = MockServer::start().await;
        let project = Uuid::new_v4();
        let file = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/projects/{project}/files/{file}/content")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "content": "fn main() {}" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let text = store(&server, None).fetch_content(project, file).await.unwrap();
        assert_eq!(text, "fn main() {}");
    }

    #[tokio::test]
    async fn test_save_sends_body_and_bearer_token() {
        let server = MockServer::start().await;
        let project = Uuid::new_v4();
        let file = Uuid::new_v4();
        Mock::given(method("PUT"))
            .and(path(format!("/projects/{project}/files/{file}/content")))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(serde_json::json!({ "content": "saved" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        store(&server, Some("secret"))
            .save_content(project, file, "saved".into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let file = Uuid::new_v4();
        let err = store(&server, None)
            .fetch_content(Uuid::new_v4(), file)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(file));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = store(&server, None)
            .save_content(Uuid::new_v4(), Uuid::new_v4(), "x".into())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Http { status: 500 });
    }

    #[tokio::test]
    async fn test_fetch_change_log() {
        let server = MockServer::start().await;
        let project = Uuid::new_v4();
        let entry = LogEntry::relayed(
            3,
            ChangeRecord {
                file_id: Uuid::new_v4(),
                author_id: Uuid::new_v4(),
                origin: Origin::Paste,
                from: Position::new(1, 0),
                to: Position::new(1, 0),
                removed_text: String::new(),
                inserted_text: "pasted".into(),
                timestamp: 1_700_000_000_000,
            },
        );
        Mock::given(method("GET"))
            .and(path(format!("/projects/{project}/changes")))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![entry.clone()]))
            .mount(&server)
            .await;

        let log = store(&server, None).fetch_change_log(project).await.unwrap();
        assert_eq!(log, vec![entry]);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let config = HttpStoreConfig::for_testing("http://127.0.0.1:1");
        let err = HttpStore::new(config)
            .unwrap()
            .fetch_content(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }
}
