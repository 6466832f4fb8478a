//! Core types for Tallycast

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TallyError;

/// Networks a source can be tracked on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Reddit,
    Threads,
    Twitch,
    DeviantArt,
    E621,
    FurAffinity,
    Weasyl,
    Mastodon,
    SearchConsole,
}

/// What a network can report about its content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub engagement: bool,
    pub views: bool,
    pub followers: bool,
}

/// One secret an adapter reads from the credential store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialSlot {
    /// Zero-based slot position
    pub index: usize,
    pub label: &'static str,
    /// Hidden when typed in
    pub secret: bool,
}

const fn slot(index: usize, label: &'static str, secret: bool) -> CredentialSlot {
    CredentialSlot {
        index,
        label,
        secret,
    }
}

impl Network {
    pub const ALL: [Network; 9] = [
        Network::Reddit,
        Network::Threads,
        Network::Twitch,
        Network::DeviantArt,
        Network::E621,
        Network::FurAffinity,
        Network::Weasyl,
        Network::Mastodon,
        Network::SearchConsole,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Reddit => "reddit",
            Network::Threads => "threads",
            Network::Twitch => "twitch",
            Network::DeviantArt => "deviantart",
            Network::E621 => "e621",
            Network::FurAffinity => "furaffinity",
            Network::Weasyl => "weasyl",
            Network::Mastodon => "mastodon",
            Network::SearchConsole => "search_console",
        }
    }

    /// Human-facing network name
    pub fn display_name(&self) -> &'static str {
        match self {
            Network::Reddit => "Reddit",
            Network::Threads => "Threads",
            Network::Twitch => "Twitch",
            Network::DeviantArt => "DeviantArt",
            Network::E621 => "e621",
            Network::FurAffinity => "FurAffinity",
            Network::Weasyl => "Weasyl",
            Network::Mastodon => "Mastodon",
            Network::SearchConsole => "Google Search Console",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let (engagement, views, followers) = match self {
            Network::Reddit => (true, false, false),
            Network::Threads => (true, true, true),
            Network::Twitch => (false, true, true),
            Network::DeviantArt => (true, true, true),
            Network::E621 => (true, false, false),
            Network::FurAffinity => (true, true, true),
            Network::Weasyl => (true, true, true),
            Network::Mastodon => (true, false, true),
            Network::SearchConsole => (false, false, false),
        };
        Capabilities {
            engagement,
            views,
            followers,
        }
    }
}

const REDDIT_SLOTS: &[CredentialSlot] =
    &[slot(1, "Subreddits to keep (comma-separated, blank for all)", false)];
const TOKEN_SLOTS: &[CredentialSlot] = &[slot(0, "Graph API access token", true)];
const CLIENT_SLOTS: &[CredentialSlot] = &[slot(0, "Client secret", true), slot(1, "Client ID", false)];
const E621_SLOTS: &[CredentialSlot] = &[slot(0, "API key", true), slot(1, "Account name", false)];
const API_KEY_SLOTS: &[CredentialSlot] = &[slot(0, "API key", true)];
const SEARCH_CONSOLE_SLOTS: &[CredentialSlot] = &[
    slot(0, "Service account JSON key", true),
    slot(1, "Site (blank to use the source username)", false),
];

impl Network {
    /// Credential slots the network's adapter reads, in slot order
    pub fn credential_slots(&self) -> &'static [CredentialSlot] {
        match self {
            Network::Reddit => REDDIT_SLOTS,
            Network::Threads => TOKEN_SLOTS,
            Network::Twitch | Network::DeviantArt => CLIENT_SLOTS,
            Network::E621 => E621_SLOTS,
            Network::Weasyl => API_KEY_SLOTS,
            Network::SearchConsole => SEARCH_CONSOLE_SLOTS,
            Network::FurAffinity | Network::Mastodon => &[],
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "reddit" => Ok(Network::Reddit),
            "threads" => Ok(Network::Threads),
            "twitch" => Ok(Network::Twitch),
            "deviantart" => Ok(Network::DeviantArt),
            "e621" => Ok(Network::E621),
            "furaffinity" => Ok(Network::FurAffinity),
            "weasyl" => Ok(Network::Weasyl),
            "mastodon" => Ok(Network::Mastodon),
            "search_console" | "google_search_console" | "gsc" => Ok(Network::SearchConsole),
            _ => Err(TallyError::InvalidInput(format!("Unknown network: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Initialized,
    Syncing,
    Synced,
    Failed,
    Deactivated,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Initialized => "initialized",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Deactivated => "deactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialized" => Some(SyncStatus::Initialized),
            "syncing" => Some(SyncStatus::Syncing),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            "deactivated" => Some(SyncStatus::Deactivated),
            _ => None,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One tracked account on one network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub network: Network,
    pub username: String,
    pub active: bool,
    pub sync_status: SyncStatus,
    pub status_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Source {
    pub fn new(network: Network, username: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            network,
            username: username.into(),
            active: true,
            sync_status: SyncStatus::Initialized,
            status_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    Post,
    Image,
    Video,
    Broadcast,
}

impl PostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Post => "post",
            PostType::Image => "image",
            PostType::Video => "video",
            PostType::Broadcast => "broadcast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "post" => Some(PostType::Post),
            "image" => Some(PostType::Image),
            "video" => Some(PostType::Video),
            "broadcast" => Some(PostType::Broadcast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub source_id: String,
    pub network_internal_id: String,
    pub network: Network,
    pub author: String,
    pub post_type: PostType,
    pub content: String,
    pub created_at: i64,
    pub last_synced_at: i64,
}

/// Engagement counters; `None` means the network has no such metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub likes: Option<i64>,
    pub reposts: Option<i64>,
    pub views: Option<i64>,
}

impl Metrics {
    pub fn new(likes: Option<i64>, reposts: Option<i64>, views: Option<i64>) -> Self {
        Self {
            likes,
            reposts,
            views,
        }
    }
}

/// One point-in-time engagement measurement for a post
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionSnapshot {
    pub id: i64,
    pub post_id: String,
    pub likes: Option<i64>,
    pub reposts: Option<i64>,
    pub views: Option<i64>,
    pub synced_at: i64,
}

/// Normalized content item produced by every source adapter
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedItem {
    pub network_internal_id: String,
    pub post_type: PostType,
    pub author: String,
    pub content: String,
    pub posted_at: i64,
    pub metrics: Metrics,
}

/// Aggregated stats for a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub avg_likes: Option<f64>,
    pub avg_reposts: Option<f64>,
    pub avg_views: Option<f64>,
    pub followers: Option<i64>,
    pub following: Option<i64>,
}

impl StatsSummary {
    pub fn with_followers(mut self, followers: Option<i64>, following: Option<i64>) -> Self {
        self.followers = followers;
        self.following = following;
        self
    }
}

/// Stored aggregate row for a source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStats {
    pub source_id: String,
    pub summary: StatsSummary,
    pub updated_at: i64,
}

/// Outcome of a single adapter run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Distinct items seen in the listing, excluded ones included
    pub seen: usize,
    pub ingested: usize,
    pub excluded: usize,
    pub failed: usize,
    pub pages: usize,
}
