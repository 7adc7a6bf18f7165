//! Paginated, rate-limit aware HTTP fetcher
//!
//! Every vendor integration pulls its data through [`Fetcher`]: GET a URL,
//! pull the item list out of the JSON body, follow the next page, repeat.
//! Rate limits and transient failures are retried according to a
//! [`BackoffPolicy`]; nothing here ever returns `Err`. When a page finally
//! fails the outcome carries the items gathered so far plus the error, and
//! the caller decides whether partial data is worth storing.
//!
//! # Example
//!
//! ```ignore
//! let outcome = ctx
//!     .fetcher()
//!     .fetch(
//!         &FetchRequest::new("https://graph.microsoft.com/v1.0/users")
//!             .auth(Auth::ClientCredentials(exchange))
//!             .items("/value")
//!             .pagination(Pagination::body_link("/@odata.nextLink")),
//!     )
//!     .await;
//! ```

pub mod auth;
pub mod backoff;
pub mod pagination;
pub mod throttle;

pub use auth::{Auth, TokenExchange};
pub use backoff::{BackoffPolicy, RetryReason};
pub use pagination::Pagination;
pub use throttle::MinInterval;

use crate::error::FetchError;
use crate::metrics;
use auth::TokenCache;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What to fetch and how to walk its pages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub auth: Auth,
    /// JSON pointer to the item list; empty for the body root
    pub items: String,
    pub pagination: Pagination,
    pub headers: Vec<(String, String)>,
    /// Query parameters for the first request (and every page-number request)
    pub query: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn items(mut self, pointer: impl Into<String>) -> Self {
        self.items = pointer.into();
        self
    }

    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

/// Result of a fetch
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Accumulated items (empty for [`Fetcher::fetch_each`])
    pub items: Vec<Value>,
    /// Items seen across all pages
    pub item_count: usize,
    /// Pages successfully fetched
    pub pages: u32,
    /// Every backoff sleep taken, in order
    pub retry_sleeps: Vec<Duration>,
    /// Why fetching stopped early, if it did
    pub error: Option<FetchError>,
}

impl FetchOutcome {
    /// All pages fetched without error
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// HTTP fetcher shared by plugins
///
/// Cheap to clone; clones share the throttle and token cache.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    backoff: BackoffPolicy,
    throttle: Option<Arc<MinInterval>>,
    transient_retries: Option<u32>,
    tokens: Arc<TokenCache>,
}

impl Fetcher {
    /// Fetcher with the default exponential backoff and no throttle
    pub fn new(client: Client) -> Self {
        Self {
            client,
            backoff: BackoffPolicy::default(),
            throttle: None,
            transient_retries: None,
            tokens: Arc::new(TokenCache::default()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Space requests at least `interval` apart
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.throttle = Some(Arc::new(MinInterval::new(interval)));
        self
    }

    /// Retry timeouts, connect failures and 5xx up to `max` times under the
    /// header-driven policy (the exponential policy always retries them)
    pub fn with_transient_retries(mut self, max: u32) -> Self {
        self.transient_retries = Some(max);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Fetch every page and return the accumulated items
    pub async fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        let mut items = Vec::new();
        let mut outcome = self.fetch_each(request, |page| items.extend(page)).await;
        outcome.items = items;
        outcome
    }

    /// Fetch every page, handing each non-empty page to `on_page`
    pub async fn fetch_each<F>(&self, request: &FetchRequest, mut on_page: F) -> FetchOutcome
    where
        F: FnMut(Vec<Value>) + Send,
    {
        let mut outcome = FetchOutcome::default();

        let auth = match self.tokens.header(&self.client, &request.auth).await {
            Ok(header) => header,
            Err(e) => {
                warn!(url = %request.url, error = %e, "authentication failed, no items fetched");
                outcome.error = Some(e);
                return outcome;
            }
        };

        let mut url = request.url.clone();
        let mut query = request.query.clone();
        let mut page_number = match &request.pagination {
            Pagination::PageNumber { start, .. } => *start,
            _ => 0,
        };

        loop {
            let mut page_query = query.clone();
            if let Pagination::PageNumber { param, .. } = &request.pagination {
                page_query.push((param.clone(), page_number.to_string()));
            }

            let response = match self
                .send(&url, &page_query, request, auth.as_ref(), &mut outcome.retry_sleeps)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(url = %url, pages = outcome.pages, error = %e, "fetch stopped");
                    outcome.error = Some(e);
                    break;
                }
            };

            let headers = response.headers().clone();
            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(e) => {
                    let err = FetchError::Decode(e.to_string());
                    warn!(url = %url, error = %err, "fetch stopped");
                    outcome.error = Some(err);
                    break;
                }
            };

            let next = match &request.pagination {
                Pagination::BodyLink(pointer) => pagination::body_next_link(&body, pointer),
                Pagination::LinkHeader => pagination::header_next_link(&headers),
                Pagination::None | Pagination::PageNumber { .. } => None,
            };

            let items = match pagination::extract_items(body, &request.items) {
                Ok(items) => items,
                Err(e) => {
                    warn!(url = %url, error = %e, "fetch stopped");
                    outcome.error = Some(e);
                    break;
                }
            };

            outcome.pages += 1;
            outcome.item_count += items.len();
            let empty = items.is_empty();
            debug!(url = %url, page = outcome.pages, items = items.len(), "page fetched");
            if !empty {
                on_page(items);
            }

            match &request.pagination {
                Pagination::None => break,
                Pagination::PageNumber { .. } => {
                    if empty {
                        break;
                    }
                    page_number += 1;
                }
                Pagination::BodyLink(_) | Pagination::LinkHeader => match next {
                    Some(next) if next == url => {
                        warn!(url = %url, "next link points at the current page, stopping");
                        break;
                    }
                    Some(next) => {
                        url = next;
                        // next links carry their own query string
                        query.clear();
                    }
                    None => break,
                },
            }
        }

        outcome
    }

    /// One GET with retries; returns only successful responses
    async fn send(
        &self,
        url: &str,
        query: &[(String, String)],
        request: &FetchRequest,
        auth: Option<&(String, String)>,
        sleeps: &mut Vec<Duration>,
    ) -> Result<Response, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            if let Some(throttle) = &self.throttle {
                throttle.wait().await;
            }

            let mut builder = self.client.get(url);
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some((name, value)) = auth {
                builder = builder.header(name.as_str(), value.as_str());
            }
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let (reason, headers, last) = match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let headers = response.headers().clone();
                        (RetryReason::RateLimited, Some(headers), format!("status {status}"))
                    } else if status.is_server_error() {
                        (RetryReason::Transient, None, format!("status {status}"))
                    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        let message = response.text().await.unwrap_or_default();
                        return Err(FetchError::Authentication {
                            status: status.as_u16(),
                            message,
                        });
                    } else if !status.is_success() {
                        return Err(FetchError::Status {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    (RetryReason::Transient, None, e.to_string())
                }
                Err(e) => return Err(e.into()),
            };

            let Some(delay) =
                self.backoff
                    .next_delay(attempt, reason, headers.as_ref(), self.transient_retries)
            else {
                return Err(if attempt == 0 && reason == RetryReason::Transient {
                    FetchError::Transport(last)
                } else {
                    FetchError::RetriesExhausted {
                        attempts: attempt,
                        last,
                    }
                });
            };

            warn!(
                url = %url,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                reason = reason.as_str(),
                "retrying request"
            );
            metrics::try_record_fetch_retry(reason.as_str());
            tokio::time::sleep(delay).await;
            sleeps.push(delay);
            attempt += 1;
        }
    }
}
