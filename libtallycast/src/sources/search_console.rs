//! Google Search Console adapter
//!
//! Credentials: slot 1 service-account JSON key, slot 2 site (falls back to
//! the source username). A signed RS256 assertion is exchanged for an access
//! token, then daily clicks/impressions are pulled for the site and per page.
//!
//! Unlike the posting networks this writes analytics rows, not posts. The
//! first run backfills two years; later runs refresh the last week.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FetchError, Result};
use crate::sources::{FetchContext, SourceAdapter};
use crate::transport::HttpRequest;
use crate::types::{Network, RunReport, Source};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const READONLY_SCOPE: &str = "https://www.googleapis.com/auth/webmasters.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const API_BASE: &str = "https://www.googleapis.com/webmasters/v3/sites";
const ROW_LIMIT: u32 = 5000;
const BACKFILL_DAYS: i64 = 730;
const REFRESH_DAYS: i64 = 7;

static JWT_HEADER: LazyLock<Header> = LazyLock::new(|| Header::new(Algorithm::RS256));

type FetchResult<T> = std::result::Result<T, FetchError>;

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    start_date: &'a str,
    end_date: &'a str,
    dimensions: &'a [&'a str],
    row_limit: u32,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<Row>,
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    clicks: f64,
    #[serde(default)]
    impressions: f64,
}

/// `sc-domain:` property name for a site given as a URL or bare domain
pub fn normalize_site(site: &str) -> String {
    let mut domain = site.trim();
    for prefix in ["sc-domain:", "https://", "http://", "www."] {
        domain = domain.strip_prefix(prefix).unwrap_or(domain);
    }
    format!("sc-domain:{}", domain.trim_end_matches('/'))
}

/// Inclusive `(start, end)` dates for a query ending on `today`
fn query_window(today: NaiveDate, has_history: bool) -> (String, String) {
    let days = if has_history { REFRESH_DAYS } else { BACKFILL_DAYS };
    let start = today - ChronoDuration::days(days);
    (
        start.format("%Y-%m-%d").to_string(),
        today.format("%Y-%m-%d").to_string(),
    )
}

fn valid_date(value: &str) -> bool {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

/// Path part of a page URL, then mapped through the redirect table
fn page_path(raw: &str, redirects: &HashMap<String, String>) -> String {
    let path = match url::Url::parse(raw) {
        Ok(parsed) if !parsed.path().is_empty() => parsed.path().to_string(),
        _ => raw.to_string(),
    };
    redirects.get(&path).cloned().unwrap_or(path)
}

/// Sum page rows per `(date, path)`; several URLs can land on one path
fn aggregate_pages(
    rows: &[Row],
    redirects: &HashMap<String, String>,
) -> BTreeMap<(String, String), (i64, i64)> {
    let mut totals: BTreeMap<(String, String), (i64, i64)> = BTreeMap::new();
    for row in rows {
        let [date, page, ..] = row.keys.as_slice() else {
            continue;
        };
        if !valid_date(date) {
            warn!(date = %date, "Skipping page row with unparseable date");
            continue;
        }

        let entry = totals
            .entry((date.clone(), page_path(page, redirects)))
            .or_default();
        entry.0 += row.clicks as i64;
        entry.1 += row.impressions as i64;
    }
    totals
}

fn signed_assertion(key: &ServiceAccountKey, token_uri: &str, now: i64) -> FetchResult<String> {
    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| FetchError::Credential(format!("invalid service account private key: {}", e)))?;
    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: READONLY_SCOPE,
        aud: token_uri,
        iat: now,
        exp: now + 3600,
    };

    jsonwebtoken::encode(&JWT_HEADER, &claims, &encoding_key)
        .map_err(|e| FetchError::Credential(format!("failed to sign token assertion: {}", e)))
}

#[derive(Default)]
pub struct SearchConsoleAdapter;

impl SearchConsoleAdapter {
    async fn access_token(ctx: &FetchContext, key: &ServiceAccountKey) -> FetchResult<String> {
        let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let assertion = signed_assertion(key, token_uri, Utc::now().timestamp())?;

        let request = HttpRequest::post(token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())]);
        let resp = ctx.transports.general.execute(request).await?;
        if resp.status == 400 || resp.status == 401 || resp.status == 403 {
            return Err(FetchError::Credential(format!(
                "Google rejected service account assertion ({})",
                resp.status
            )));
        }
        let token: TokenResponse = resp.error_for_status()?.json()?;
        Ok(token.access_token)
    }

    async fn query(
        ctx: &FetchContext,
        site: &str,
        access_token: &str,
        window: &(String, String),
        dimensions: &[&str],
    ) -> FetchResult<Vec<Row>> {
        let site: String = url::form_urlencoded::byte_serialize(site.as_bytes()).collect();
        let body = QueryRequest {
            start_date: &window.0,
            end_date: &window.1,
            dimensions,
            row_limit: ROW_LIMIT,
        };
        let request = HttpRequest::post(format!("{}/{}/searchAnalytics/query", API_BASE, site))
            .bearer(access_token)
            .json(&body)?;

        let throttle = ctx.throttle(&[429], Duration::from_secs(30));
        let response: QueryResponse = ctx
            .get_json(ctx.transports.general.as_ref(), &request, &throttle)
            .await?;
        Ok(response.rows)
    }
}

#[async_trait]
impl SourceAdapter for SearchConsoleAdapter {
    fn network(&self) -> Network {
        Network::SearchConsole
    }

    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport> {
        let token = ctx.token(source).await?;
        let key: ServiceAccountKey = serde_json::from_str(token.s1())
            .map_err(|e| FetchError::Credential(format!("invalid service account JSON: {}", e)))?;
        let site = if token.s2().trim().is_empty() {
            normalize_site(&source.username)
        } else {
            normalize_site(token.s2())
        };

        let has_history = match ctx.db.count_site_stats(&source.id).await {
            Ok(count) => count > 0,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Failed to count existing site stats");
                false
            }
        };
        let window = query_window(Utc::now().date_naive(), has_history);
        debug!(source_id = %source.id, site = %site, start = %window.0, end = %window.1, "Querying Search Console");

        let access_token = Self::access_token(ctx, &key).await?;
        let mut report = RunReport::default();

        let site_rows = Self::query(ctx, &site, &access_token, &window, &["date"]).await?;
        report.pages += 1;
        for row in &site_rows {
            let Some(date) = row.keys.first() else {
                continue;
            };
            report.seen += 1;
            if !valid_date(date) {
                warn!(source_id = %source.id, date = %date, "Skipping site row with unparseable date");
                report.failed += 1;
                continue;
            }
            match ctx
                .db
                .upsert_site_stat(&source.id, date, row.clicks as i64, row.impressions as i64)
                .await
            {
                Ok(()) => report.ingested += 1,
                Err(e) => {
                    warn!(source_id = %source.id, date = %date, error = %e, "Failed to save site stat");
                    report.failed += 1;
                }
            }
        }

        let page_rows = Self::query(ctx, &site, &access_token, &window, &["date", "page"]).await?;
        report.pages += 1;
        report.seen += page_rows.len();

        let redirects = match ctx.db.get_redirects(&source.id).await {
            Ok(redirects) => redirects,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Failed to load redirects");
                HashMap::new()
            }
        };
        for ((date, path), (clicks, impressions)) in aggregate_pages(&page_rows, &redirects) {
            match ctx
                .db
                .upsert_page_stat(&source.id, &date, &path, clicks, impressions)
                .await
            {
                Ok(()) => report.ingested += 1,
                Err(e) => {
                    warn!(source_id = %source.id, date = %date, page = %path, error = %e, "Failed to save page stat");
                    report.failed += 1;
                }
            }
        }

        info!(
            source_id = %source.id,
            network = %source.network,
            seen = report.seen,
            ingested = report.ingested,
            failed = report.failed,
            "Search Console run complete"
        );
        Ok(report)
    }
}
