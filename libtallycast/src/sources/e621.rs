//! e621 adapter
//!
//! Credentials: slot 1 API key, slot 2 account name used for basic auth.
//! Pages are numbered from 1; an empty page ends the listing. e621 answers
//! 503 when it wants clients to slow down.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::normalize::timestamp_or_now;
use crate::sources::{FetchContext, RunState, SourceAdapter};
use crate::transport::HttpRequest;
use crate::types::{IngestedItem, Metrics, Network, PostType, RunReport, Source};

const API_BASE: &str = "https://e621.net";

#[derive(Debug, Deserialize)]
struct PostsResponse {
    #[serde(default)]
    posts: Vec<E621Post>,
}

#[derive(Debug, Deserialize)]
struct E621Post {
    id: i64,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    score: Score,
    #[serde(default)]
    fav_count: i64,
}

#[derive(Debug, Default, Deserialize)]
struct Score {
    #[serde(default)]
    total: i64,
}

pub struct E621Adapter {
    pub max_pages: usize,
    pub page_delay: Duration,
    pub busy_backoff: Duration,
}

impl Default for E621Adapter {
    fn default() -> Self {
        Self {
            max_pages: 500,
            page_delay: Duration::from_secs(1),
            busy_backoff: Duration::from_secs(5),
        }
    }
}

impl E621Adapter {
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }
}

#[async_trait]
impl SourceAdapter for E621Adapter {
    fn network(&self) -> Network {
        Network::E621
    }

    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport> {
        let mut run = RunState::begin(ctx, source).await?;
        let token = ctx.token(source).await?;
        let (api_key, api_user) = (token.s1(), token.s2());

        let user_agent = format!("{} (by {})", ctx.user_agent, api_user);
        let throttle = ctx.throttle(&[503], self.busy_backoff);
        let transport = ctx.transports.general.as_ref();

        for page in 1..=self.max_pages {
            ctx.pause(self.page_delay).await;

            let request = HttpRequest::get(format!(
                "{}/posts.json?tags=user:{}&page={}",
                API_BASE, source.username, page
            ))
            .header("User-Agent", user_agent.as_str())
            .basic_auth(api_user, api_key);

            let body: PostsResponse = ctx.get_json(transport, &request, &throttle).await?;
            if body.posts.is_empty() {
                debug!(source_id = %source.id, page, "Empty page, listing complete");
                break;
            }

            for post in &body.posts {
                let network_id = post.id.to_string();
                if !run.admit(&network_id) {
                    continue;
                }

                let item = IngestedItem {
                    network_internal_id: network_id,
                    post_type: PostType::Post,
                    author: source.username.clone(),
                    content: post.description.clone(),
                    posted_at: timestamp_or_now(&post.created_at, &[]),
                    metrics: Metrics::new(Some(post.score.total + post.fav_count), None, None),
                };
                run.ingest(&item).await;
            }
            run.page_done();
        }

        run.finish(None, None).await
    }
}
