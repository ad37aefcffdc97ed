//! Browser session provider seam.
//!
//! The engine never drives a browser directly: it leases pages from a
//! [`SessionProvider`] and talks to them through [`BrowserPage`]. Strategies
//! only ever see `&dyn BrowserPage`.

pub mod error;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::platform::PlatformId;

pub use error::ProviderError;
pub use remote::RemoteBrowserProvider;

/// Ordered list of CSS selectors for one logical control, most specific first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectorChain(pub Vec<String>);

impl SelectorChain {
    pub fn new(selectors: &[&str]) -> Self {
        Self(selectors.iter().map(|s| s.to_string()).collect())
    }

    /// Split a comma-separated selector group into a chain, keeping order.
    /// Commas inside brackets or quotes (`a[href*="x,y"]`) are not split on.
    pub fn parse(group: &str) -> Self {
        let mut out = Vec::new();
        let mut depth = 0i32;
        let mut quote: Option<char> = None;
        let mut current = String::new();
        for c in group.chars() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"') | (None, '\'') => quote = Some(c),
                (None, '[') | (None, '(') => depth += 1,
                (None, ']') | (None, ')') => depth -= 1,
                (None, ',') if depth == 0 => {
                    let s = current.trim();
                    if !s.is_empty() {
                        out.push(s.to_string());
                    }
                    current.clear();
                    continue;
                }
                _ => {}
            }
            current.push(c);
        }
        let s = current.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
        Self(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A located element. `selector` is the chain entry that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementHandle {
    pub id: String,
    pub selector: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Click,
    Fill,
    Upload,
    Select,
    Check,
}

/// What to pull out of the current page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractSchema {
    /// Visible body text as a JSON string.
    PageText,
    /// Unfilled question controls: `[{"label": ..., "selector": ..., "required": bool}]`.
    OpenQuestions,
    /// Provider-specific schema passed through as-is.
    Custom { schema: serde_json::Value },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub headless: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// One browser page inside a provider session.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    fn id(&self) -> &str;

    async fn navigate(&self, url: &str) -> Result<(), ProviderError>;

    async fn current_url(&self) -> Result<String, ProviderError>;

    /// First element matching any selector of the chain, in chain order.
    async fn locate(&self, chain: &SelectorChain) -> Result<Option<ElementHandle>, ProviderError>;

    async fn act(
        &self,
        element: &ElementHandle,
        action: Action,
        value: Option<&str>,
    ) -> Result<(), ProviderError>;

    async fn extract(&self, schema: &ExtractSchema) -> Result<serde_json::Value, ProviderError>;

    async fn screenshot(&self) -> Result<Vec<u8>, ProviderError>;
}

/// Creates and destroys browser sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Concurrent sessions this provider allows.
    fn max_sessions(&self) -> usize;

    async fn create_session(
        &self,
        platform: PlatformId,
        options: &SessionOptions,
    ) -> Result<Arc<dyn BrowserPage>, ProviderError>;

    async fn close_session(&self, id: &str) -> Result<(), ProviderError>;

    async fn health_check(&self) -> bool;
}
