//! Reddit adapter
//!
//! Reads the public `submitted.json` listing, so no credentials are needed.
//! Slot 2, when set, is a comma-separated list of subreddits to keep; posts
//! from any other subreddit are ignored, and previously stored posts from
//! subreddits that were dropped from the list are pruned.
//!
//! Reddit closes persistent connections aggressively, so this adapter uses
//! the isolated transport.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{CredentialError, FetchError, Result};
use crate::normalize::compose_content;
use crate::pacing::{SoftLimit, Throttle};
use crate::sources::{FetchContext, RunState, SourceAdapter};
use crate::transport::HttpRequest;
use crate::types::{IngestedItem, Metrics, Network, PostType, RunReport, Source};

const SITE: &str = "https://www.reddit.com";

static FOLLOWERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d,]+)\s+followers").expect("valid regex"));

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    data: Submission,
}

#[derive(Debug, Deserialize)]
struct Submission {
    id: String,
    #[serde(default)]
    subreddit: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    author: String,
    #[serde(default)]
    is_video: bool,
}

pub struct RedditAdapter {
    pub max_pages: usize,
    pub page_delay: Duration,
}

impl Default for RedditAdapter {
    fn default() -> Self {
        Self {
            max_pages: 500,
            page_delay: Duration::from_secs(3),
        }
    }
}

impl RedditAdapter {
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    fn soft_limit() -> SoftLimit {
        SoftLimit {
            remaining_header: "x-ratelimit-remaining",
            reset_header: "x-ratelimit-reset",
            threshold: 5.0,
            margin: Duration::from_secs(1),
            fallback: Duration::from_secs(10),
        }
    }

    /// Subreddit allow-list from slot 2; a missing token means no filter
    async fn subreddit_filter(ctx: &FetchContext, source: &Source) -> Result<HashSet<String>> {
        match ctx.credentials.get_source_token(&source.id).await {
            Ok(token) => Ok(parse_subreddits(token.s2())),
            Err(CredentialError::NotFound(_)) => Ok(HashSet::new()),
            Err(e) => Err(FetchError::Credential(e.to_string()).into()),
        }
    }

    /// Drop stored posts from subreddits no longer in the allow-list
    async fn prune_removed_subreddits(
        ctx: &FetchContext,
        source: &Source,
        filter: &HashSet<String>,
    ) -> Result<()> {
        if filter.is_empty() {
            return Ok(());
        }

        let prefixes: HashSet<String> = ctx
            .db
            .list_posts(&source.id)
            .await?
            .iter()
            .filter_map(|post| subreddit_prefix(&post.content))
            .filter(|(sub, _)| !filter.contains(&sub.to_lowercase()))
            .map(|(_, prefix)| prefix.to_string())
            .collect();

        for prefix in prefixes {
            let deleted = ctx
                .db
                .delete_posts_with_content_prefix(&source.id, &prefix)
                .await?;
            info!(source_id = %source.id, prefix = %prefix, deleted, "Pruned posts from removed subreddit");
        }
        Ok(())
    }

    async fn fetch_followers(
        ctx: &FetchContext,
        username: &str,
        user_agent: &str,
        throttle: &Throttle,
    ) -> Option<i64> {
        let request = HttpRequest::get(format!("{}/user/{}/", SITE, username))
            .header("User-Agent", user_agent)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9");

        let resp = match ctx.send(ctx.transports.isolated.as_ref(), &request, throttle).await {
            Ok(resp) if resp.is_success() => resp,
            Ok(resp) => {
                warn!(username, status = resp.status, "Profile page request failed");
                return None;
            }
            Err(e) => {
                warn!(username, error = %e, "Profile page request failed");
                return None;
            }
        };

        let followers = parse_followers(&resp.text());
        if followers.is_none() {
            debug!(username, "Follower count not found on profile page");
        }
        followers
    }
}

fn parse_subreddits(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `("art", "r/art:")` for content shaped like `r/art: title`
fn subreddit_prefix(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("r/")?;
    let colon = rest.find(':')?;
    if colon == 0 {
        return None;
    }
    Some((&rest[..colon], &content[..colon + 3]))
}

fn parse_followers(html: &str) -> Option<i64> {
    let idx = html.find(r#"data-testid="profile-followers-widget""#)?;
    let caps = FOLLOWERS.captures(&html[idx..])?;
    caps[1].replace(',', "").parse().ok().filter(|n| *n > 0)
}

fn submission_content(post: &Submission) -> String {
    let header = format!("r/{}: {}", post.subreddit, post.title);
    match post.selftext.as_str() {
        "" | "[deleted]" | "[removed]" => header,
        body => compose_content(&header, body),
    }
}

#[async_trait]
impl SourceAdapter for RedditAdapter {
    fn network(&self) -> Network {
        Network::Reddit
    }

    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport> {
        let filter = Self::subreddit_filter(ctx, source).await?;
        Self::prune_removed_subreddits(ctx, source, &filter).await?;

        let mut run = RunState::begin(ctx, source).await?;
        let version = ctx.user_agent.rsplit('/').next().unwrap_or_default();
        let user_agent = format!("tallycast:{} (for /u/{})", version, source.username);
        let throttle = ctx
            .throttle(&[429], Duration::from_secs(60))
            .with_margin(Duration::from_secs(5));
        let soft_limit = Self::soft_limit();
        let transport = ctx.transports.isolated.as_ref();

        let mut after: Option<String> = None;
        while run.pages() < self.max_pages {
            ctx.pause(self.page_delay).await;

            let mut url = format!(
                "{}/user/{}/submitted.json?limit=100&raw_json=1",
                SITE, source.username
            );
            if let Some(cursor) = &after {
                url.push_str("&after=");
                url.push_str(cursor);
            }
            let request = HttpRequest::get(url)
                .header("User-Agent", user_agent.as_str())
                .header("Accept", "application/json, */*;q=0.9")
                .header("Accept-Language", "en-US,en;q=0.9");

            let resp = ctx.send(transport, &request, &throttle).await?;
            soft_limit.respect(ctx.sleeper.as_ref(), &resp).await;
            let listing: Listing = resp.error_for_status()?.json()?;

            if listing.data.children.is_empty() {
                break;
            }

            for child in &listing.data.children {
                let post = &child.data;
                if !run.admit(&post.id) {
                    continue;
                }
                if !filter.is_empty() && !filter.contains(&post.subreddit.to_lowercase()) {
                    continue;
                }

                let item = IngestedItem {
                    network_internal_id: post.id.clone(),
                    post_type: if post.is_video {
                        PostType::Video
                    } else {
                        PostType::Post
                    },
                    author: post.author.clone(),
                    content: submission_content(post),
                    posted_at: post.created_utc as i64,
                    metrics: Metrics::new(Some(post.score), None, None),
                };
                run.ingest(&item).await;
            }
            run.page_done();

            match listing.data.after.filter(|a| !a.is_empty()) {
                Some(next) if after.as_deref() != Some(next.as_str()) => after = Some(next),
                _ => break,
            }
        }

        let followers = if run.report().seen > 0 {
            Self::fetch_followers(ctx, &source.username, &user_agent, &throttle).await
        } else {
            None
        };
        run.finish(followers, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_support::Harness;
    use crate::transport::HttpResponse;
    use serde_json::json;

    const LISTING: &str = "https://www.reddit.com/user/poster/submitted.json";
    const PROFILE: &str = "https://www.reddit.com/user/poster/";

    fn submission(id: &str, subreddit: &str, selftext: &str) -> serde_json::Value {
        json!({"data": {
            "id": id,
            "subreddit": subreddit,
            "title": format!("Title {}", id),
            "selftext": selftext,
            "score": 42,
            "created_utc": 1700000000.0,
            "author": "poster",
            "is_video": false
        }})
    }

    fn listing(children: Vec<serde_json::Value>, after: Option<&str>) -> serde_json::Value {
        json!({"data": {"after": after, "children": children}})
    }

    #[test]
    fn test_subreddit_prefix() {
        assert_eq!(subreddit_prefix("r/Art: hello"), Some(("Art", "r/Art:")));
        assert_eq!(subreddit_prefix("r/: nothing"), None);
        assert_eq!(subreddit_prefix("plain"), None);
    }

    #[test]
    fn test_parse_followers() {
        let html = r#"<div data-testid="profile-followers-widget"><span>1,234 followers</span></div>"#;
        assert_eq!(parse_followers(html), Some(1234));
        assert_eq!(parse_followers("<p>5 followers</p>"), None);
    }

    #[test]
    fn test_parse_subreddits() {
        let subs = parse_subreddits(" Art, furry ,,");
        assert!(subs.contains("art"));
        assert!(subs.contains("furry"));
        assert_eq!(subs.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_follows_after_cursor() {
        let h = Harness::new().await;
        let source = h.source(Network::Reddit, "poster", ["", "", "", ""]).await;
        h.mock
            .on_json(
                LISTING,
                listing(vec![submission("a", "art", "body"), submission("b", "art", "[removed]")], Some("t3_b")),
            )
            .on_json(LISTING, listing(vec![submission("c", "pics", "")], None));
        h.mock.on_text(
            PROFILE,
            r#"<div data-testid="profile-followers-widget">77 followers</div>"#,
        );

        let report = RedditAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(report.ingested, 3);

        let urls = h.mock.requests_to(LISTING);
        assert!(urls[1].request.url.ends_with("&after=t3_b"));
        assert_eq!(
            urls[0].request.header_value("User-Agent"),
            Some("tallycast:test (for /u/poster)")
        );

        let a = h.db.get_post_by_network_id(&source.id, "a").await.unwrap().unwrap();
        assert_eq!(a.content, "r/art: Title a\n\nbody");
        let b = h.db.get_post_by_network_id(&source.id, "b").await.unwrap().unwrap();
        assert_eq!(b.content, "r/art: Title b");

        let stats = h.db.get_source_stats(&source.id).await.unwrap().unwrap();
        assert_eq!(stats.summary.followers, Some(77));
        assert_eq!(stats.summary.avg_likes, Some(42.0));
    }

    #[tokio::test]
    async fn test_repeated_after_cursor_stops() {
        let h = Harness::new().await;
        let source = h.source(Network::Reddit, "poster", ["", "", "", ""]).await;
        h.mock
            .on_json(LISTING, listing(vec![submission("a", "art", "")], Some("t3_a")));
        h.mock.on(PROFILE, HttpResponse::new(404, ""));

        RedditAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(h.mock.requests_to(LISTING).len(), 2);
    }

    #[tokio::test]
    async fn test_endless_listing_stops_at_page_ceiling() {
        let h = Harness::new().await;
        let source = h.source(Network::Reddit, "poster", ["", "", "", ""]).await;
        for page in 0..10 {
            let cursor = format!("t3_{}", page);
            h.mock
                .on_json(LISTING, listing(vec![submission("a", "art", "")], Some(&cursor)));
        }
        h.mock.on(PROFILE, HttpResponse::new(404, ""));

        RedditAdapter::default()
            .with_max_pages(3)
            .fetch(&h.ctx, &source)
            .await
            .unwrap();
        assert_eq!(h.mock.requests_to(LISTING).len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_same_page_after_retry_after() {
        let h = Harness::new().await;
        let source = h.source(Network::Reddit, "poster", ["", "", "", ""]).await;
        h.mock
            .on(LISTING, HttpResponse::new(429, "").with_header("Retry-After", "5"))
            .on_json(LISTING, listing(vec![submission("a", "art", "")], None));
        h.mock.on(PROFILE, HttpResponse::new(404, ""));

        RedditAdapter::default().fetch(&h.ctx, &source).await.unwrap();

        let requests = h.mock.requests_to(LISTING);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].request.url, requests[1].request.url);
        assert!(requests[1].at - requests[0].at >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_low_budget_pauses_before_next_page() {
        let h = Harness::new().await;
        let source = h.source(Network::Reddit, "poster", ["", "", "", ""]).await;
        h.mock
            .on(
                LISTING,
                HttpResponse::new(200, listing(vec![submission("a", "art", "")], Some("t3_a")).to_string())
                    .with_header("X-Ratelimit-Remaining", "1.0")
                    .with_header("X-Ratelimit-Reset", "30"),
            )
            .on_json(LISTING, listing(vec![], None));
        h.mock.on(PROFILE, HttpResponse::new(404, ""));

        RedditAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert!(h.sleeper.sleeps().contains(&Duration::from_secs(31)));
    }

    #[tokio::test]
    async fn test_subreddit_filter_and_prune() {
        let h = Harness::new().await;
        let source = h.source(Network::Reddit, "poster", ["", "art, pics", "", ""]).await;
        h.mock.on_json(
            LISTING,
            listing(
                vec![
                    submission("a", "Art", ""),
                    submission("b", "memes", ""),
                    submission("c", "pics", ""),
                ],
                None,
            ),
        );
        h.mock.on(PROFILE, HttpResponse::new(500, ""));

        RedditAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(h.db.count_posts(&source.id).await.unwrap(), 2);
        assert!(h.db.get_post_by_network_id(&source.id, "b").await.unwrap().is_none());

        h.creds.insert(&source.id, ["", "art", "", ""]);
        RedditAdapter::default().fetch(&h.ctx, &source).await.unwrap();

        assert!(h.db.get_post_by_network_id(&source.id, "c").await.unwrap().is_none());
        assert!(h.db.get_post_by_network_id(&source.id, "a").await.unwrap().is_some());
    }
}
