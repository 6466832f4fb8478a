//! Mastodon adapter
//!
//! The source username is the full handle, `user@instance`. Public account
//! statuses are read without credentials and paged backwards with `max_id`.
//! Boosts are skipped; only the account's own posts are tracked.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, TallyError};
use crate::normalize::{strip_html, timestamp_or_now, truncate_with_ellipsis};
use crate::sources::{FetchContext, RunState, SourceAdapter};
use crate::transport::HttpRequest;
use crate::types::{IngestedItem, Metrics, Network, PostType, RunReport, Source};

const CONTENT_PREVIEW_CHARS: usize = 97;

#[derive(Debug, Deserialize)]
struct Account {
    id: String,
    #[serde(default)]
    followers_count: Option<i64>,
    #[serde(default)]
    following_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Status {
    id: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    favourites_count: i64,
    #[serde(default)]
    reblogs_count: i64,
    #[serde(default)]
    quotes_count: i64,
    #[serde(default)]
    content: String,
    #[serde(default)]
    account: StatusAccount,
    #[serde(default)]
    reblog: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusAccount {
    #[serde(default)]
    uri: String,
}

pub struct MastodonAdapter {
    pub max_pages: usize,
    pub page_delay: Duration,
}

impl Default for MastodonAdapter {
    fn default() -> Self {
        Self {
            max_pages: 500,
            page_delay: Duration::from_millis(500),
        }
    }
}

/// Split `user@instance` (a leading `@` is tolerated)
pub fn split_handle(handle: &str) -> Result<(&str, &str)> {
    let handle = handle.trim().trim_start_matches('@');
    match handle.split_once('@') {
        Some((user, domain)) if !user.is_empty() && !domain.is_empty() => Ok((user, domain)),
        _ => Err(TallyError::InvalidInput(format!(
            "Mastodon username must look like user@instance, got {:?}",
            handle
        ))),
    }
}

/// `user@host` from an actor URI such as `https://host/users/user`
fn author_from_uri(uri: &str, fallback: &str) -> String {
    let Ok(parsed) = url::Url::parse(uri) else {
        return fallback.to_string();
    };
    let user = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty());

    match (user, parsed.host_str()) {
        (Some(user), Some(host)) => format!("{}@{}", user, host),
        _ => fallback.to_string(),
    }
}

#[async_trait]
impl SourceAdapter for MastodonAdapter {
    fn network(&self) -> Network {
        Network::Mastodon
    }

    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport> {
        let (user, domain) = split_handle(&source.username)?;
        let mut run = RunState::begin(ctx, source).await?;

        let throttle = ctx.throttle(&[429], Duration::from_secs(30));
        let transport = ctx.transports.general.as_ref();

        let lookup = HttpRequest::get(format!(
            "https://{}/api/v1/accounts/lookup?acct={}",
            domain, user
        ));
        let account: Account = ctx.get_json(transport, &lookup, &throttle).await?;

        let mut max_id: Option<String> = None;
        while run.pages() < self.max_pages {
            ctx.pause(self.page_delay).await;

            let mut url = format!(
                "https://{}/api/v1/accounts/{}/statuses?exclude_replies=true&limit=40",
                domain, account.id
            );
            if let Some(id) = &max_id {
                url.push_str("&max_id=");
                url.push_str(id);
            }
            let feed: Vec<Status> = ctx
                .get_json(transport, &HttpRequest::get(url), &throttle)
                .await?;
            let Some(last) = feed.last() else {
                break;
            };
            if max_id.as_deref() == Some(last.id.as_str()) {
                break;
            }
            max_id = Some(last.id.clone());

            for status in &feed {
                if status.reblog.is_some() || !run.admit(&status.id) {
                    continue;
                }

                let text = strip_html(&status.content);
                let item = IngestedItem {
                    network_internal_id: status.id.clone(),
                    post_type: PostType::Post,
                    author: author_from_uri(&status.account.uri, &source.username),
                    content: truncate_with_ellipsis(&text, CONTENT_PREVIEW_CHARS),
                    posted_at: timestamp_or_now(&status.created_at, &[]),
                    metrics: Metrics::new(
                        Some(status.favourites_count),
                        Some(status.reblogs_count + status.quotes_count),
                        None,
                    ),
                };
                run.ingest(&item).await;
            }
            run.page_done();
        }

        run.finish(account.followers_count, account.following_count)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_support::Harness;
    use serde_json::json;

    const LOOKUP: &str = "https://mastodon.art/api/v1/accounts/lookup";
    const STATUSES: &str = "https://mastodon.art/api/v1/accounts/109/statuses";

    fn status(id: &str, content: &str, reblog: bool) -> serde_json::Value {
        json!({
            "id": id,
            "created_at": "2024-02-01T12:00:00.000Z",
            "favourites_count": 6,
            "reblogs_count": 2,
            "quotes_count": 1,
            "content": content,
            "account": {"uri": "https://mastodon.art/users/painter"},
            "reblog": if reblog { json!({"id": "x"}) } else { serde_json::Value::Null }
        })
    }

    #[test]
    fn test_split_handle() {
        assert_eq!(split_handle("painter@mastodon.art").unwrap(), ("painter", "mastodon.art"));
        assert_eq!(split_handle("@painter@mastodon.art").unwrap(), ("painter", "mastodon.art"));
        assert!(split_handle("painter").is_err());
        assert!(split_handle("painter@").is_err());
    }

    #[test]
    fn test_author_from_uri() {
        assert_eq!(
            author_from_uri("https://mastodon.art/users/painter", "fallback"),
            "painter@mastodon.art"
        );
        assert_eq!(author_from_uri("", "fallback"), "fallback");
    }

    #[tokio::test]
    async fn test_fetch_pages_with_max_id() {
        let h = Harness::new().await;
        let source = h.source(Network::Mastodon, "painter@mastodon.art", ["", "", "", ""]).await;
        let long = format!("<p>{}</p>", "word ".repeat(40));

        h.mock.on_json(
            LOOKUP,
            json!({"id": "109", "followers_count": 512, "following_count": 64}),
        );
        h.mock
            .on_json(
                STATUSES,
                json!([status("300", "<p>Hello &amp; welcome</p>", false), status("299", "boost", true)]),
            )
            .on_json(STATUSES, json!([status("200", &long, false)]))
            .on_json(STATUSES, json!([]));

        let report = MastodonAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(report.ingested, 2);
        assert_eq!(report.pages, 2);

        let urls: Vec<String> = h.mock.requests_to(STATUSES).into_iter().map(|r| r.request.url).collect();
        assert!(!urls[0].contains("max_id"));
        assert!(urls[1].ends_with("&max_id=299"));
        assert!(urls[2].ends_with("&max_id=200"));

        let hello = h.db.get_post_by_network_id(&source.id, "300").await.unwrap().unwrap();
        assert_eq!(hello.content, "Hello & welcome");
        assert_eq!(hello.author, "painter@mastodon.art");
        assert!(h.db.get_post_by_network_id(&source.id, "299").await.unwrap().is_none());

        let long_post = h.db.get_post_by_network_id(&source.id, "200").await.unwrap().unwrap();
        assert_eq!(long_post.content.chars().count(), 100);
        assert!(long_post.content.ends_with("..."));

        let snapshot = &h.db.list_reactions(&hello.id).await.unwrap()[0];
        assert_eq!(
            (snapshot.likes, snapshot.reposts, snapshot.views),
            (Some(6), Some(3), None)
        );

        let stats = h.db.get_source_stats(&source.id).await.unwrap().unwrap();
        assert_eq!(stats.summary.followers, Some(512));
        assert_eq!(stats.summary.following, Some(64));
    }

    #[tokio::test]
    async fn test_repeated_page_stops() {
        let h = Harness::new().await;
        let source = h.source(Network::Mastodon, "painter@mastodon.art", ["", "", "", ""]).await;
        h.mock.on_json(LOOKUP, json!({"id": "109"}));
        h.mock.on_json(STATUSES, json!([status("50", "same", false)]));

        let report = MastodonAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(report.pages, 1);
        assert_eq!(h.mock.requests_to(STATUSES).len(), 2);
    }

    #[tokio::test]
    async fn test_endless_feed_stops_at_page_ceiling() {
        let h = Harness::new().await;
        let source = h.source(Network::Mastodon, "painter@mastodon.art", ["", "", "", ""]).await;
        h.mock.on_json(LOOKUP, json!({"id": "109"}));
        for id in (100..110).rev() {
            h.mock.on_json(STATUSES, json!([status(&id.to_string(), "more", false)]));
        }

        let adapter = MastodonAdapter {
            max_pages: 3,
            ..MastodonAdapter::default()
        };
        let report = adapter.fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(report.ingested, 3);
        assert_eq!(h.mock.requests_to(STATUSES).len(), 3);
    }

    #[tokio::test]
    async fn test_bad_handle_is_invalid_input() {
        let h = Harness::new().await;
        let source = h.source(Network::Mastodon, "painter", ["", "", "", ""]).await;

        let err = MastodonAdapter::default().fetch(&h.ctx, &source).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(h.mock.requests().is_empty());
    }
}
