use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    Action, BrowserPage, ElementHandle, ExtractSchema, ProviderError, SelectorChain,
    SessionOptions, SessionProvider,
};
use crate::platform::PlatformId;

struct HttpInner {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpInner {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ProviderError> {
        let response = self.authorize(req).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Http(e)
            }
        })?;
        check_status(response).await
    }
}

/// Map a non-success status onto a provider error.
async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout(body),
        StatusCode::NOT_FOUND | StatusCode::GONE => ProviderError::Detached(body),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            ProviderError::Exhausted(body)
        }
        other => ProviderError::Protocol(format!("status {}: {body}", other.as_u16())),
    })
}

async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, ProviderError> {
    response
        .json::<T>()
        .await
        .map_err(|e| ProviderError::Protocol(format!("invalid response body: {e}")))
}

/// Session provider backed by a remote browser service speaking JSON over HTTP.
///
/// Pointed at a cloud endpoint it is the primary provider; pointed at a local
/// browser daemon it serves as the fallback.
pub struct RemoteBrowserProvider {
    name: String,
    max_sessions: usize,
    inner: Arc<HttpInner>,
}

impl RemoteBrowserProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        max_sessions: usize,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            name: name.into(),
            max_sessions,
            inner: Arc::new(HttpInner {
                client,
                base_url: base_url.into(),
                api_key,
            }),
        })
    }
}

#[derive(Deserialize)]
struct CreatedSession {
    id: String,
}

#[async_trait]
impl SessionProvider for RemoteBrowserProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    async fn create_session(
        &self,
        platform: PlatformId,
        options: &SessionOptions,
    ) -> Result<Arc<dyn BrowserPage>, ProviderError> {
        let req = self
            .inner
            .client
            .post(self.inner.url("/sessions"))
            .json(&json!({ "platform": platform, "options": options }));
        let created: CreatedSession = decode(self.inner.send(req).await?).await?;
        debug!(provider = %self.name, session_id = %created.id, %platform, "session created");
        Ok(Arc::new(RemotePage {
            id: created.id,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn close_session(&self, id: &str) -> Result<(), ProviderError> {
        let req = self
            .inner
            .client
            .delete(self.inner.url(&format!("/sessions/{id}")));
        match self.inner.send(req).await {
            Ok(_) | Err(ProviderError::Detached(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> bool {
        let req = self.inner.client.get(self.inner.url("/health"));
        self.inner.send(req).await.is_ok()
    }
}

struct RemotePage {
    id: String,
    inner: Arc<HttpInner>,
}

impl RemotePage {
    fn path(&self, op: &str) -> String {
        self.inner.url(&format!("/sessions/{}/{op}", self.id))
    }
}

#[derive(Deserialize)]
struct UrlBody {
    url: String,
}

#[derive(Deserialize)]
struct LocateBody {
    element: Option<ElementHandle>,
}

#[derive(Deserialize)]
struct ExtractBody {
    data: serde_json::Value,
}

#[async_trait]
impl BrowserPage for RemotePage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<(), ProviderError> {
        let req = self
            .inner
            .client
            .post(self.path("navigate"))
            .json(&json!({ "url": url }));
        self.inner.send(req).await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, ProviderError> {
        let req = self.inner.client.get(self.path("url"));
        let body: UrlBody = decode(self.inner.send(req).await?).await?;
        Ok(body.url)
    }

    async fn locate(&self, chain: &SelectorChain) -> Result<Option<ElementHandle>, ProviderError> {
        let req = self
            .inner
            .client
            .post(self.path("locate"))
            .json(&json!({ "selectors": chain }));
        let body: LocateBody = decode(self.inner.send(req).await?).await?;
        Ok(body.element)
    }

    async fn act(
        &self,
        element: &ElementHandle,
        action: Action,
        value: Option<&str>,
    ) -> Result<(), ProviderError> {
        let req = self
            .inner
            .client
            .post(self.path("act"))
            .json(&json!({ "element": element, "action": action, "value": value }));
        self.inner.send(req).await?;
        Ok(())
    }

    async fn extract(&self, schema: &ExtractSchema) -> Result<serde_json::Value, ProviderError> {
        let req = self.inner.client.post(self.path("extract")).json(schema);
        let body: ExtractBody = decode(self.inner.send(req).await?).await?;
        Ok(body.data)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ProviderError> {
        let req = self.inner.client.get(self.path("screenshot"));
        let bytes = self.inner.send(req).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
