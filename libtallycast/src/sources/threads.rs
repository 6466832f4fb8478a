//! Threads adapter
//!
//! Credentials: slot 1 long-lived Graph API access token. Follows
//! `paging.next` links and asks the insights endpoint for each post's
//! counters. An `OAuthException` with code 190 means the token was revoked
//! or expired and is reported as a credential error.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::error::{FetchError, Result};
use crate::normalize::timestamp_or_now;
use crate::pacing::Throttle;
use crate::sources::{FetchContext, RunState, SourceAdapter};
use crate::transport::{HttpRequest, HttpResponse};
use crate::types::{IngestedItem, Metrics, Network, PostType, RunReport, Source};

const GRAPH_BASE: &str = "https://graph.threads.net/v1.0";
const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%z"];

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiError,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    code: i64,
}

#[derive(Debug, Deserialize)]
struct ThreadsPage {
    #[serde(default)]
    data: Vec<ThreadsPost>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Debug, Default, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadsPost {
    id: String,
    #[serde(default)]
    shortcode: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    media_type: String,
}

#[derive(Debug, Deserialize)]
struct InsightsResponse {
    #[serde(default)]
    data: Vec<InsightMetric>,
}

#[derive(Debug, Deserialize)]
struct InsightMetric {
    name: String,
    #[serde(default)]
    values: Vec<InsightValue>,
}

#[derive(Debug, Deserialize)]
struct InsightValue {
    #[serde(default)]
    value: i64,
}

pub struct ThreadsAdapter {
    pub max_pages: usize,
    pub page_delay: Duration,
}

impl Default for ThreadsAdapter {
    fn default() -> Self {
        Self {
            max_pages: 100,
            page_delay: Duration::from_millis(500),
        }
    }
}

fn is_token_error(resp: &HttpResponse) -> bool {
    resp.json::<ApiErrorBody>()
        .map(|body| body.error.kind == "OAuthException" && body.error.code == 190)
        .unwrap_or(false)
}

/// Fail on non-2xx, singling out revoked tokens
fn check_status(resp: HttpResponse) -> std::result::Result<HttpResponse, FetchError> {
    if !resp.is_success() && is_token_error(&resp) {
        return Err(FetchError::Credential(
            "Threads access token is invalid or expired".to_string(),
        ));
    }
    resp.error_for_status()
}

fn post_type(media_type: &str) -> PostType {
    match media_type {
        "IMAGE" | "CAROUSEL_ALBUM" => PostType::Image,
        "VIDEO" => PostType::Video,
        _ => PostType::Post,
    }
}

/// likes, reposts + quotes, views
fn insight_metrics(insights: &InsightsResponse) -> Metrics {
    let mut likes = 0;
    let mut reposts = 0;
    let mut views = 0;
    for metric in &insights.data {
        let Some(first) = metric.values.first() else {
            continue;
        };
        match metric.name.as_str() {
            "likes" => likes = first.value,
            "reposts" | "quotes" => reposts += first.value,
            "views" => views = first.value,
            _ => {}
        }
    }
    Metrics::new(Some(likes), Some(reposts), Some(views))
}

impl ThreadsAdapter {
    async fn fetch_followers(
        ctx: &FetchContext,
        access_token: &str,
        throttle: &Throttle,
    ) -> std::result::Result<Option<i64>, FetchError> {
        let since = chrono::Utc::now().timestamp() / 86_400 * 86_400;
        let request = HttpRequest::get(format!(
            "{}/me/threads_insights?metric=followers_count&period=day&since={}&until={}&access_token={}",
            GRAPH_BASE,
            since,
            since + 86_400,
            access_token
        ));

        let resp = ctx
            .send(ctx.transports.general.as_ref(), &request, throttle)
            .await?;
        let insights: InsightsResponse = check_status(resp)?.json()?;

        Ok(insights
            .data
            .iter()
            .find(|m| m.name == "followers_count")
            .and_then(|m| m.values.last())
            .map(|v| v.value)
            .filter(|count| *count > 0))
    }

    /// Per-post counters; unavailable insights yield empty metrics
    async fn fetch_insights(
        ctx: &FetchContext,
        post_id: &str,
        access_token: &str,
        throttle: &Throttle,
    ) -> Metrics {
        let request = HttpRequest::get(format!(
            "{}/{}/insights?metric=likes,reposts,quotes,views&access_token={}",
            GRAPH_BASE, post_id, access_token
        ));

        let result = match ctx
            .send(ctx.transports.general.as_ref(), &request, throttle)
            .await
        {
            Ok(resp) if resp.status == 401 || resp.status == 403 => return Metrics::default(),
            Ok(resp) => resp.error_for_status().and_then(|r| r.json::<InsightsResponse>()),
            Err(e) => Err(e),
        };

        match result {
            Ok(insights) => insight_metrics(&insights),
            Err(e) => {
                warn!(post_id, error = %e, "Failed to fetch Threads insights");
                Metrics::default()
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for ThreadsAdapter {
    fn network(&self) -> Network {
        Network::Threads
    }

    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport> {
        let mut run = RunState::begin(ctx, source).await?;
        let token = ctx.token(source).await?;
        let access_token = token.s1();

        let throttle = ctx.throttle(&[429], Duration::from_secs(5));
        let followers = match Self::fetch_followers(ctx, access_token, &throttle).await {
            Ok(count) => count,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Failed to fetch Threads follower count");
                None
            }
        };

        let transport = ctx.transports.general.as_ref();
        let mut next_url = Some(format!(
            "{}/me/threads?fields=id,shortcode,text,timestamp,media_type&limit=100&access_token={}",
            GRAPH_BASE, access_token
        ));

        while let Some(url) = next_url.take() {
            if run.pages() >= self.max_pages {
                break;
            }
            ctx.pause(self.page_delay).await;

            let resp = ctx.send(transport, &HttpRequest::get(url), &throttle).await?;
            let page: ThreadsPage = check_status(resp)?.json()?;
            if page.data.is_empty() {
                break;
            }

            for post in &page.data {
                let network_id = if post.shortcode.is_empty() {
                    post.id.clone()
                } else {
                    post.shortcode.clone()
                };
                if !run.admit(&network_id) || post.media_type == "REPOST_FACADE" {
                    continue;
                }

                let metrics = Self::fetch_insights(ctx, &post.id, access_token, &throttle).await;
                let item = IngestedItem {
                    network_internal_id: network_id,
                    post_type: post_type(&post.media_type),
                    author: source.username.clone(),
                    content: post.text.clone(),
                    posted_at: timestamp_or_now(&post.timestamp, TIMESTAMP_FORMATS),
                    metrics,
                };
                run.ingest(&item).await;
            }
            run.page_done();

            next_url = page.paging.next.filter(|n| !n.is_empty());
        }

        run.finish(followers, None).await
    }
}
