//! DeviantArt adapter
//!
//! Credentials: slot 1 client secret, slot 2 client id (client-credentials
//! grant). The gallery is walked by offset; each page's deviations are then
//! looked up in one metadata batch for description, tags and views. When
//! the metadata call fails the page is still ingested, without views.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::error::{FetchError, Result};
use crate::normalize::{append_hashtags, compose_content, slug_from_url, strip_html};
use crate::pacing::Throttle;
use crate::sources::{FetchContext, RunState, SourceAdapter};
use crate::transport::HttpRequest;
use crate::types::{IngestedItem, Metrics, Network, PostType, RunReport, Source};

const TOKEN_URL: &str = "https://www.deviantart.com/oauth2/token";
const API_BASE: &str = "https://www.deviantart.com/api/v1/oauth2";
const PAGE_LIMIT: usize = 24;
const WATCHERS_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

/// Integer that some endpoints send as a JSON string
fn flexible_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Number(i64),
        Text(String),
    }

    match Flexible::deserialize(deserializer)? {
        Flexible::Number(n) => Ok(n),
        Flexible::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct GalleryResponse {
    #[serde(default)]
    results: Vec<Deviation>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct Deviation {
    deviationid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default, deserialize_with = "flexible_i64")]
    published_time: i64,
    #[serde(default)]
    stats: DeviationStats,
}

#[derive(Debug, Default, Deserialize)]
struct DeviationStats {
    #[serde(default)]
    favourites: i64,
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    #[serde(default)]
    metadata: Vec<Metadata>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    deviationid: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    stats: MetadataStats,
}

#[derive(Debug, Deserialize)]
struct Tag {
    tag_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataStats {
    #[serde(default)]
    views: i64,
    #[serde(default)]
    favourites: i64,
}

#[derive(Debug, Deserialize)]
struct WatchersResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_offset: Option<usize>,
}

pub struct DeviantArtAdapter {
    /// Offset at which the gallery walk stops
    pub max_items: usize,
    pub max_pages: usize,
    pub max_watcher_pages: usize,
    pub page_delay: Duration,
    pub watchers_delay: Duration,
}

impl Default for DeviantArtAdapter {
    fn default() -> Self {
        Self {
            max_items: 5000,
            max_pages: 500,
            max_watcher_pages: 200,
            page_delay: Duration::from_millis(500),
            watchers_delay: Duration::from_millis(300),
        }
    }
}

async fn access_token(
    ctx: &FetchContext,
    client_id: &str,
    client_secret: &str,
) -> std::result::Result<String, FetchError> {
    let request = HttpRequest::post(TOKEN_URL).form(&[
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ]);
    let resp = ctx.transports.general.execute(request).await?;
    if resp.status == 400 || resp.status == 401 || resp.status == 403 {
        return Err(FetchError::Credential(format!(
            "DeviantArt rejected client credentials ({})",
            resp.status
        )));
    }

    let token: TokenResponse = resp.error_for_status()?.json()?;
    if token.access_token.is_empty() {
        return Err(FetchError::Credential(
            "DeviantArt returned an empty access token".to_string(),
        ));
    }
    Ok(token.access_token)
}

/// Metadata keyed by upper-cased deviation id
async fn fetch_metadata(
    ctx: &FetchContext,
    access_token: &str,
    ids: &[&str],
    throttle: &Throttle,
) -> std::result::Result<HashMap<String, Metadata>, FetchError> {
    // The serializer is not Send; finish it before the first await
    let query = {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for id in ids {
            query.append_pair("deviationids[]", id);
        }
        query
            .append_pair("ext_submission", "false")
            .append_pair("ext_camera", "false")
            .append_pair("ext_stats", "true")
            .append_pair("ext_collection", "false")
            .append_pair("ext_gallery", "false")
            .append_pair("with_session", "false")
            .append_pair("mature_content", "true");
        query.finish()
    };

    let request =
        HttpRequest::get(format!("{}/deviation/metadata?{}", API_BASE, query)).bearer(access_token);
    let resp: MetadataResponse = ctx
        .get_json(ctx.transports.general.as_ref(), &request, throttle)
        .await?;

    Ok(resp
        .metadata
        .into_iter()
        .map(|m| (m.deviationid.to_uppercase(), m))
        .collect())
}

fn deviation_content(deviation: &Deviation, meta: Option<&Metadata>) -> String {
    let Some(meta) = meta else {
        return deviation.title.clone();
    };

    let body = compose_content(&deviation.title, &strip_html(&meta.description));
    let tags: Vec<&str> = meta.tags.iter().map(|t| t.tag_name.as_str()).collect();
    let hashtags = append_hashtags("", &tags);
    compose_content(&body, &hashtags)
}

impl DeviantArtAdapter {
    async fn fetch_watchers(
        &self,
        ctx: &FetchContext,
        access_token: &str,
        username: &str,
        throttle: &Throttle,
    ) -> std::result::Result<i64, FetchError> {
        let encoded: String = url::form_urlencoded::byte_serialize(username.as_bytes()).collect();
        let mut total = 0;
        let mut offset = 0;

        for _ in 0..self.max_watcher_pages {
            let request = HttpRequest::get(format!(
                "{}/user/watchers/{}?limit={}&offset={}&mature_content=true",
                API_BASE, encoded, WATCHERS_LIMIT, offset
            ))
            .bearer(access_token);
            let page: WatchersResponse = ctx
                .get_json(ctx.transports.general.as_ref(), &request, throttle)
                .await?;

            total += page.results.len() as i64;
            match page.next_offset {
                Some(next) if page.has_more && !page.results.is_empty() && next > offset => {
                    offset = next
                }
                _ => break,
            }
            ctx.pause(self.watchers_delay).await;
        }
        Ok(total)
    }
}

#[async_trait]
impl SourceAdapter for DeviantArtAdapter {
    fn network(&self) -> Network {
        Network::DeviantArt
    }

    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport> {
        let mut run = RunState::begin(ctx, source).await?;
        let token = ctx.token(source).await?;
        let access_token = access_token(ctx, token.s2(), token.s1()).await?;

        let throttle = ctx.throttle(&[429], Duration::from_secs(5));
        let transport = ctx.transports.general.as_ref();
        let username: String =
            url::form_urlencoded::byte_serialize(source.username.as_bytes()).collect();

        let mut offset = 0;
        while offset < self.max_items && run.pages() < self.max_pages {
            ctx.pause(self.page_delay).await;

            let request = HttpRequest::get(format!(
                "{}/gallery/all?username={}&limit={}&offset={}&mature_content=true",
                API_BASE, username, PAGE_LIMIT, offset
            ))
            .bearer(&access_token);
            let gallery: GalleryResponse = ctx.get_json(transport, &request, &throttle).await?;
            if gallery.results.is_empty() {
                break;
            }

            let ids: Vec<&str> = gallery.results.iter().map(|d| d.deviationid.as_str()).collect();
            let metadata = match fetch_metadata(ctx, &access_token, &ids, &throttle).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(source_id = %source.id, offset, error = %e, "Failed to fetch deviation metadata");
                    HashMap::new()
                }
            };

            for deviation in &gallery.results {
                let network_id =
                    slug_from_url(&deviation.url).unwrap_or_else(|| deviation.deviationid.clone());
                if !run.admit(&network_id) {
                    continue;
                }

                let meta = metadata.get(&deviation.deviationid.to_uppercase());
                let metrics = match meta {
                    Some(m) => Metrics::new(Some(m.stats.favourites), None, Some(m.stats.views)),
                    None => Metrics::new(Some(deviation.stats.favourites), None, None),
                };

                let item = IngestedItem {
                    network_internal_id: network_id,
                    post_type: PostType::Post,
                    author: source.username.clone(),
                    content: deviation_content(deviation, meta),
                    posted_at: deviation.published_time,
                    metrics,
                };
                run.ingest(&item).await;
            }
            run.page_done();

            match gallery.next_offset {
                Some(next) if gallery.has_more && next > offset => offset = next,
                Some(next) if gallery.has_more => {
                    warn!(source_id = %source.id, offset, next, "Gallery offset did not advance, stopping");
                    break;
                }
                _ => break,
            }
        }

        let watchers = if run.report().seen > 0 {
            match self
                .fetch_watchers(ctx, &access_token, &source.username, &throttle)
                .await
            {
                Ok(count) => Some(count),
                Err(e) => {
                    warn!(source_id = %source.id, error = %e, "Failed to fetch DeviantArt watchers");
                    None
                }
            }
        } else {
            None
        };
        run.finish(watchers, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_support::Harness;
    use crate::transport::HttpResponse;
    use serde_json::json;

    const GALLERY: &str = "https://www.deviantart.com/api/v1/oauth2/gallery/all";
    const METADATA: &str = "https://www.deviantart.com/api/v1/oauth2/deviation/metadata";
    const WATCHERS: &str = "https://www.deviantart.com/api/v1/oauth2/user/watchers/";

    async fn harness() -> (Harness, Source) {
        let h = Harness::new().await;
        let source = h.source(Network::DeviantArt, "painter", ["secret", "client", "", ""]).await;
        h.mock.on_json(TOKEN_URL, json!({"access_token": "tok", "status": "success"}));
        (h, source)
    }

    #[test]
    fn test_flexible_published_time() {
        let numeric: Deviation =
            serde_json::from_value(json!({"deviationid": "A", "published_time": 1700000000})).unwrap();
        let text: Deviation =
            serde_json::from_value(json!({"deviationid": "A", "published_time": "1700000000"})).unwrap();
        assert_eq!(numeric.published_time, 1700000000);
        assert_eq!(text.published_time, 1700000000);
    }

    #[tokio::test]
    async fn test_gallery_with_metadata_and_watchers() {
        let (h, source) = harness().await;
        h.mock
            .on_json(
                GALLERY,
                json!({
                    "results": [
                        {"deviationid": "aaa-1", "title": "Sunset", "url": "https://www.deviantart.com/painter/art/Sunset-101", "published_time": "1700000000", "stats": {"favourites": 3}},
                        {"deviationid": "bbb-2", "title": "Moon", "url": "", "published_time": 1700000500, "stats": {"favourites": 8}}
                    ],
                    "has_more": true,
                    "next_offset": 24
                }),
            )
            .on_json(GALLERY, json!({"results": [], "has_more": false}));
        h.mock.on_json(
            METADATA,
            json!({"metadata": [{
                "deviationid": "AAA-1",
                "description": "<b>Warm</b> colors",
                "tags": [{"tag_name": "digital art"}, {"tag_name": "sky"}],
                "stats": {"views": 90, "favourites": 5}
            }]}),
        );
        h.mock
            .on_json(WATCHERS, json!({"results": [{}, {}], "has_more": true, "next_offset": 50}))
            .on_json(WATCHERS, json!({"results": [{}], "has_more": false}));

        let report = DeviantArtAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(report.ingested, 2);

        let sunset = h
            .db
            .get_post_by_network_id(&source.id, "Sunset-101")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sunset.content, "Sunset\n\nWarm colors\n\n#digital_art #sky");
        let snapshot = &h.db.list_reactions(&sunset.id).await.unwrap()[0];
        assert_eq!((snapshot.likes, snapshot.views), (Some(5), Some(90)));

        let moon = h.db.get_post_by_network_id(&source.id, "bbb-2").await.unwrap().unwrap();
        assert_eq!(moon.content, "Moon");
        assert_eq!(moon.created_at, 1700000500);
        let snapshot = &h.db.list_reactions(&moon.id).await.unwrap()[0];
        assert_eq!((snapshot.likes, snapshot.views), (Some(8), None));

        let galleries = h.mock.requests_to(GALLERY);
        assert!(galleries[1].request.url.contains("offset=24"));

        let stats = h.db.get_source_stats(&source.id).await.unwrap().unwrap();
        assert_eq!(stats.summary.followers, Some(3));
        assert!(h.sleeper.sleeps().contains(&Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn test_metadata_failure_still_ingests() {
        let (h, source) = harness().await;
        h.mock.on_json(
            GALLERY,
            json!({"results": [{"deviationid": "c-3", "title": "Solo", "url": "https://www.deviantart.com/painter/art/Solo-3", "published_time": 1}], "has_more": false}),
        );
        h.mock.on(METADATA, HttpResponse::new(500, "broken"));
        h.mock.on(WATCHERS, HttpResponse::new(500, "broken"));

        let report = DeviantArtAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(report.ingested, 1);

        let stats = h.db.get_source_stats(&source.id).await.unwrap().unwrap();
        assert_eq!(stats.summary.followers, None);
        assert_eq!(stats.summary.avg_views, None);
    }

    #[tokio::test]
    async fn test_gallery_stops_at_item_ceiling() {
        let (h, source) = harness().await;
        h.mock.on_json(
            GALLERY,
            json!({"results": [{"deviationid": "d-4", "title": "Loop", "url": "", "published_time": 1}], "has_more": true, "next_offset": 24}),
        );
        h.mock.on_json(METADATA, json!({"metadata": []}));
        h.mock.on_json(WATCHERS, json!({"results": [], "has_more": false}));

        let adapter = DeviantArtAdapter {
            max_items: 24,
            ..DeviantArtAdapter::default()
        };
        adapter.fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(h.mock.requests_to(GALLERY).len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_gallery_offset_stops() {
        let (h, source) = harness().await;
        h.mock.on_json(
            GALLERY,
            json!({"results": [{"deviationid": "e-5", "title": "Stuck", "url": "", "published_time": 1}], "has_more": true, "next_offset": 0}),
        );
        h.mock.on_json(METADATA, json!({"metadata": []}));
        h.mock.on_json(WATCHERS, json!({"results": [], "has_more": false}));

        let report = DeviantArtAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(h.mock.requests_to(GALLERY).len(), 1);
    }

    #[tokio::test]
    async fn test_gallery_stops_at_page_ceiling() {
        let (h, source) = harness().await;
        // Offsets keep advancing but the same deviation comes back every time
        for page in 1..=10 {
            h.mock.on_json(
                GALLERY,
                json!({"results": [{"deviationid": "f-6", "title": "Again", "url": "", "published_time": 1}], "has_more": true, "next_offset": page * 24}),
            );
        }
        h.mock.on_json(METADATA, json!({"metadata": []}));
        h.mock.on_json(WATCHERS, json!({"results": [], "has_more": false}));

        let adapter = DeviantArtAdapter {
            max_pages: 3,
            ..DeviantArtAdapter::default()
        };
        adapter.fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(h.mock.requests_to(GALLERY).len(), 3);
    }

    #[tokio::test]
    async fn test_watchers_stop_on_stuck_offset_and_ceiling() {
        let (h, source) = harness().await;
        h.mock.on_json(
            GALLERY,
            json!({"results": [{"deviationid": "g-7", "title": "One", "url": "", "published_time": 1}], "has_more": false}),
        );
        h.mock.on_json(METADATA, json!({"metadata": []}));
        h.mock
            .on_json(WATCHERS, json!({"results": [{}], "has_more": true, "next_offset": 0}));

        DeviantArtAdapter::default().fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(h.mock.requests_to(WATCHERS).len(), 1);
        let stats = h.db.get_source_stats(&source.id).await.unwrap().unwrap();
        assert_eq!(stats.summary.followers, Some(1));
    }

    #[tokio::test]
    async fn test_watchers_stop_at_page_ceiling() {
        let (h, source) = harness().await;
        h.mock.on_json(
            GALLERY,
            json!({"results": [{"deviationid": "h-8", "title": "One", "url": "", "published_time": 1}], "has_more": false}),
        );
        h.mock.on_json(METADATA, json!({"metadata": []}));
        for page in 1..=10 {
            h.mock.on_json(
                WATCHERS,
                json!({"results": [{}], "has_more": true, "next_offset": page * 50}),
            );
        }

        let adapter = DeviantArtAdapter {
            max_watcher_pages: 4,
            ..DeviantArtAdapter::default()
        };
        adapter.fetch(&h.ctx, &source).await.unwrap();
        assert_eq!(h.mock.requests_to(WATCHERS).len(), 4);
    }
}
