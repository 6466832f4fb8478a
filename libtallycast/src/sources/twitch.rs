//! Twitch adapter
//!
//! Credentials: slot 1 client secret, slot 2 client id. An app access token
//! is obtained through the client-credentials grant before anything else.
//! Videos and clips are walked one after the other and share the run's
//! dedup set. Twitch reports only views.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::error::{FetchError, Result};
use crate::normalize::{compose_content, timestamp_or_now};
use crate::pacing::Throttle;
use crate::sources::{FetchContext, RunState, SourceAdapter};
use crate::transport::HttpRequest;
use crate::types::{IngestedItem, Metrics, Network, PostType, RunReport, Source};

const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const HELIX: &str = "https://api.twitch.tv/helix";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    data: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Video {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    view_count: i64,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Clip {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    view_count: i64,
    #[serde(default)]
    creator_name: String,
}

#[derive(Debug, Deserialize)]
struct FollowersResponse {
    #[serde(default)]
    total: i64,
}

/// Authenticated Helix session for one run
struct Helix<'a> {
    ctx: &'a FetchContext,
    client_id: String,
    app_token: String,
    throttle: Throttle,
}

impl Helix<'_> {
    fn request(&self, url: String) -> HttpRequest {
        HttpRequest::get(url)
            .header("Client-Id", self.client_id.as_str())
            .bearer(&self.app_token)
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> std::result::Result<T, FetchError> {
        let request = self.request(url);
        self.ctx
            .get_json(self.ctx.transports.general.as_ref(), &request, &self.throttle)
            .await
    }

    async fn user_id(&self, login: &str) -> std::result::Result<String, FetchError> {
        let users: UsersResponse = self.get(format!("{}/users?login={}", HELIX, login)).await?;
        users
            .data
            .into_iter()
            .next()
            .map(|u| u.id)
            .ok_or_else(|| FetchError::NotFound(format!("Twitch user {}", login)))
    }

    async fn followers(&self, user_id: &str) -> Option<i64> {
        let url = format!("{}/channels/followers?broadcaster_id={}", HELIX, user_id);
        match self.get::<FollowersResponse>(url).await {
            Ok(resp) => Some(resp.total).filter(|t| *t > 0),
            Err(e) => {
                warn!(user_id, error = %e, "Failed to fetch Twitch followers");
                None
            }
        }
    }
}

pub struct TwitchAdapter {
    /// Page ceiling applied to videos and clips separately
    pub max_pages: usize,
    pub page_delay: Duration,
}

impl Default for TwitchAdapter {
    fn default() -> Self {
        Self {
            max_pages: 200,
            page_delay: Duration::from_millis(500),
        }
    }
}

async fn app_token(
    ctx: &FetchContext,
    client_id: &str,
    client_secret: &str,
) -> std::result::Result<String, FetchError> {
    let request = HttpRequest::post(TOKEN_URL).form(&[
        ("client_id", client_id),
        ("client_secret", client_secret),
        ("grant_type", "client_credentials"),
    ]);
    let resp = ctx.transports.general.execute(request).await?;
    if resp.status == 400 || resp.status == 401 || resp.status == 403 {
        return Err(FetchError::Credential(format!(
            "Twitch rejected client credentials ({})",
            resp.status
        )));
    }
    let token: TokenResponse = resp.error_for_status()?.json()?;
    Ok(token.access_token)
}

fn video_item(video: &Video, username: &str) -> IngestedItem {
    IngestedItem {
        network_internal_id: video.id.clone(),
        post_type: if video.kind == "archive" {
            PostType::Broadcast
        } else {
            PostType::Video
        },
        author: username.to_string(),
        content: compose_content(&video.title, &video.description),
        posted_at: timestamp_or_now(&video.created_at, &[]),
        metrics: Metrics::new(None, None, Some(video.view_count)),
    }
}

fn clip_item(clip: &Clip, username: &str) -> IngestedItem {
    IngestedItem {
        network_internal_id: clip.id.clone(),
        post_type: PostType::Video,
        author: username.to_string(),
        content: format!("{}\n\n(TwitchClip by @{})", clip.title, clip.creator_name),
        posted_at: timestamp_or_now(&clip.created_at, &[]),
        metrics: Metrics::new(None, None, Some(clip.view_count)),
    }
}

impl TwitchAdapter {
    /// Walk one cursor-paginated Helix listing, turning entries into items
    async fn walk<T: DeserializeOwned>(
        &self,
        helix: &Helix<'_>,
        run: &mut RunState<'_>,
        base_url: &str,
        to_item: impl Fn(&T) -> IngestedItem,
    ) -> Result<()> {
        let mut cursor: Option<String> = None;
        for _ in 0..self.max_pages {
            helix.ctx.pause(self.page_delay).await;

            let url = match &cursor {
                Some(after) => format!("{}&after={}", base_url, after),
                None => base_url.to_string(),
            };
            let page: Page<T> = helix.get(url).await?;
            if page.data.is_empty() {
                break;
            }

            for entry in &page.data {
                let item = to_item(entry);
                if run.admit(&item.network_internal_id) {
                    run.ingest(&item).await;
                }
            }
            run.page_done();

            match page.pagination.cursor.filter(|c| !c.is_empty()) {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for TwitchAdapter {
    fn network(&self) -> Network {
        Network::Twitch
    }

    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport> {
        let token = ctx.token(source).await?;
        let (client_secret, client_id) = (token.s1(), token.s2());

        let helix = Helix {
            ctx,
            client_id: client_id.to_string(),
            app_token: app_token(ctx, client_id, client_secret).await?,
            throttle: ctx.throttle(&[429], Duration::from_secs(30)),
        };
        let user_id = helix.user_id(&source.username).await?;

        let mut run = RunState::begin(ctx, source).await?;
        let username = source.username.as_str();

        self.walk(
            &helix,
            &mut run,
            &format!("{}/videos?user_id={}&first=100", HELIX, user_id),
            |v: &Video| video_item(v, username),
        )
        .await?;
        self.walk(
            &helix,
            &mut run,
            &format!("{}/clips?broadcaster_id={}&first=100", HELIX, user_id),
            |c: &Clip| clip_item(c, username),
        )
        .await?;

        let followers = if run.report().seen > 0 {
            helix.followers(&user_id).await
        } else {
            None
        };
        run.finish(followers, None).await
    }
}
