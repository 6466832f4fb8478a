//! Weasyl adapter
//!
//! Credentials: slot 1 API key, sent as `X-Weasyl-API-Key`. The gallery is
//! walked with `nextid`; favorites, views and tags come from one extra view
//! request per submission.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::error::{FetchError, Result};
use crate::normalize::{append_hashtags, timestamp_or_now};
use crate::pacing::Throttle;
use crate::sources::{FetchContext, RunState, SourceAdapter};
use crate::transport::HttpRequest;
use crate::types::{IngestedItem, Metrics, Network, PostType, RunReport, Source};

const API_BASE: &str = "https://www.weasyl.com/api";
const API_KEY_HEADER: &str = "X-Weasyl-API-Key";

#[derive(Debug, Deserialize)]
struct GalleryResponse {
    #[serde(default)]
    submissions: Vec<Submission>,
    #[serde(default)]
    nextid: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Submission {
    submitid: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    posted_at: String,
    #[serde(default)]
    subtype: String,
}

#[derive(Debug, Deserialize)]
struct SubmissionView {
    #[serde(default)]
    favorites: i64,
    #[serde(default)]
    views: i64,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UserView {
    #[serde(default)]
    statistics: UserStatistics,
}

#[derive(Debug, Default, Deserialize)]
struct UserStatistics {
    #[serde(default)]
    followed: i64,
    #[serde(default)]
    following: i64,
}

pub struct WeasylAdapter {
    pub max_pages: usize,
    pub page_delay: Duration,
    pub detail_delay: Duration,
}

impl Default for WeasylAdapter {
    fn default() -> Self {
        Self {
            max_pages: 500,
            page_delay: Duration::from_millis(500),
            detail_delay: Duration::from_millis(200),
        }
    }
}

async fn get<T: serde::de::DeserializeOwned>(
    ctx: &FetchContext,
    url: String,
    api_key: &str,
    throttle: &Throttle,
) -> std::result::Result<T, FetchError> {
    let request = HttpRequest::get(url).header(API_KEY_HEADER, api_key);
    ctx.get_json(ctx.transports.general.as_ref(), &request, throttle)
        .await
}

fn post_type(subtype: &str) -> PostType {
    match subtype {
        "visual" | "multimedia" => PostType::Image,
        _ => PostType::Post,
    }
}

#[async_trait]
impl SourceAdapter for WeasylAdapter {
    fn network(&self) -> Network {
        Network::Weasyl
    }

    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport> {
        let mut run = RunState::begin(ctx, source).await?;
        let token = ctx.token(source).await?;
        let api_key = token.s1();

        let throttle = ctx.throttle(&[429], Duration::from_secs(5));
        let profile_url = format!("{}/users/{}/view", API_BASE, source.username);
        let profile: Option<UserView> = match get(ctx, profile_url, api_key, &throttle).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Failed to fetch Weasyl profile");
                None
            }
        };

        let mut next_id: Option<i64> = None;

        while run.pages() < self.max_pages {
            ctx.pause(self.page_delay).await;

            let mut url = format!("{}/users/{}/gallery?count=100", API_BASE, source.username);
            if let Some(id) = next_id {
                url.push_str(&format!("&nextid={}", id));
            }
            let gallery: GalleryResponse = get(ctx, url, api_key, &throttle).await?;
            if gallery.submissions.is_empty() {
                break;
            }

            for submission in &gallery.submissions {
                let network_id = submission.submitid.to_string();
                if !run.admit(&network_id) {
                    continue;
                }

                ctx.pause(self.detail_delay).await;
                let detail_url = format!("{}/submissions/{}/view", API_BASE, submission.submitid);
                let (metrics, tags) = match get::<SubmissionView>(ctx, detail_url, api_key, &throttle).await {
                    Ok(view) => (
                        Metrics::new(Some(view.favorites), None, Some(view.views)),
                        view.tags,
                    ),
                    Err(e) => {
                        warn!(source_id = %source.id, network_id = %network_id, error = %e, "Failed to fetch submission details");
                        (Metrics::default(), Vec::new())
                    }
                };

                let item = IngestedItem {
                    network_internal_id: network_id,
                    post_type: post_type(&submission.subtype),
                    author: source.username.clone(),
                    content: append_hashtags(&submission.title, &tags),
                    posted_at: timestamp_or_now(&submission.posted_at, &[]),
                    metrics,
                };
                run.ingest(&item).await;
            }
            run.page_done();

            match gallery.nextid.filter(|id| *id > 0) {
                Some(id) if next_id != Some(id) => next_id = Some(id),
                _ => break,
            }
        }

        let (followers, following) = profile
            .map(|p| (Some(p.statistics.followed), Some(p.statistics.following)))
            .unwrap_or((None, None));
        run.finish(followers, following).await
    }
}
