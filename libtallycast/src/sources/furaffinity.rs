//! FurAffinity adapter
//!
//! FurAffinity has no API, so gallery and submission pages are scraped.
//! No credentials are needed. Stats are refreshed even when the run fails
//! part-way, since whatever was stored before the failure is still valid.
//!
//! `scraper::Html` is not `Send`, so every page is parsed into owned data
//! before the next await.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::warn;

use crate::error::{FetchError, Result};
use crate::normalize::{compose_content, parse_timestamp, strip_html};
use crate::sources::{FetchContext, RunState, SourceAdapter};
use crate::transport::HttpRequest;
use crate::types::{IngestedItem, Metrics, Network, PostType, RunReport, Source};

const SITE: &str = "https://www.furaffinity.net";
const POPUP_DATE_FORMATS: &[&str] = &["%b %e, %Y %I:%M:%S %p", "%b %e, %Y %I:%M %p"];

type FetchResult<T> = std::result::Result<T, FetchError>;

fn selector(css: &str) -> FetchResult<Selector> {
    Selector::parse(css).map_err(|e| FetchError::Scrape(format!("bad selector {}: {}", css, e)))
}

fn first_text(doc: &Html, css: &str) -> FetchResult<String> {
    let sel = selector(css)?;
    Ok(doc
        .select(&sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default())
}

fn parse_count(text: &str) -> Option<i64> {
    text.trim().replace(',', "").parse().ok()
}

/// Watched-by and watching counts from the profile header
fn parse_profile(html: &str) -> FetchResult<(Option<i64>, Option<i64>)> {
    let doc = Html::parse_document(html);
    let links = selector(".section-header .floatright h3 a")?;

    let mut followers = None;
    let mut following = None;
    for link in doc.select(&links) {
        let text = link.text().collect::<String>();
        let count = text
            .split_whitespace()
            .last()
            .map(|last| last.trim_start_matches('(').trim_end_matches(')'))
            .and_then(parse_count);

        if text.contains("Watched by") {
            followers = count;
        } else if text.contains("Watching") {
            following = count;
        }
    }
    Ok((followers, following))
}

/// Submission ids linked from a gallery page, in page order
fn parse_gallery(html: &str) -> FetchResult<Vec<String>> {
    let doc = Html::parse_document(html);
    let links = selector("figure figcaption a")?;

    Ok(doc
        .select(&links)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.starts_with("/view/"))
        .filter_map(|href| href.split('/').nth(2))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect())
}

#[derive(Debug, PartialEq)]
struct SubmissionPage {
    title: String,
    description: String,
    views: Option<i64>,
    favorites: Option<i64>,
    posted_at: Option<i64>,
}

fn posted_at(date: ElementRef<'_>) -> Option<i64> {
    date.value()
        .attr("data-time")
        .and_then(|t| t.trim().parse::<i64>().ok())
        .or_else(|| {
            date.value()
                .attr("title")
                .and_then(|title| parse_timestamp(title, POPUP_DATE_FORMATS))
        })
}

fn parse_submission(html: &str) -> FetchResult<SubmissionPage> {
    let doc = Html::parse_document(html);

    let description = selector(".submission-description")?;
    let description = doc
        .select(&description)
        .next()
        .map(|el| strip_html(&el.inner_html()))
        .unwrap_or_default();

    let date = selector(".popup_date")?;
    let posted_at = doc.select(&date).next().and_then(posted_at);

    Ok(SubmissionPage {
        title: first_text(&doc, ".submission-title h2 p")?,
        description,
        views: parse_count(&first_text(&doc, ".views .font-large")?),
        favorites: parse_count(&first_text(&doc, ".favorites .font-large")?),
        posted_at,
    })
}

pub struct FurAffinityAdapter {
    pub max_pages: usize,
    pub page_delay: Duration,
    pub submission_delay: Duration,
}

impl Default for FurAffinityAdapter {
    fn default() -> Self {
        Self {
            max_pages: 500,
            page_delay: Duration::from_secs(1),
            submission_delay: Duration::from_millis(500),
        }
    }
}

impl FurAffinityAdapter {
    async fn get_html(ctx: &FetchContext, url: String) -> FetchResult<String> {
        let throttle = ctx.throttle(&[429, 503], Duration::from_secs(10));
        let resp = ctx
            .send(ctx.transports.general.as_ref(), &HttpRequest::get(url), &throttle)
            .await?;
        Ok(resp.error_for_status()?.text())
    }

    async fn fetch_profile(ctx: &FetchContext, source: &Source) -> (Option<i64>, Option<i64>) {
        let url = format!("{}/user/{}/", SITE, source.username);
        match Self::get_html(ctx, url).await.and_then(|html| parse_profile(&html)) {
            Ok(counts) => counts,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Failed to fetch FurAffinity profile");
                (None, None)
            }
        }
    }

    async fn fetch_submission(
        &self,
        ctx: &FetchContext,
        source: &Source,
        submission_id: &str,
    ) -> FetchResult<IngestedItem> {
        ctx.pause(self.submission_delay).await;
        let html = Self::get_html(ctx, format!("{}/view/{}/", SITE, submission_id)).await?;
        let page = parse_submission(&html)?;

        Ok(IngestedItem {
            network_internal_id: submission_id.to_string(),
            post_type: PostType::Post,
            author: source.username.clone(),
            content: compose_content(&page.title, &page.description),
            posted_at: page
                .posted_at
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            metrics: Metrics::new(Some(page.favorites.unwrap_or(0)), None, Some(page.views.unwrap_or(0))),
        })
    }

    async fn walk_gallery(&self, ctx: &FetchContext, source: &Source, run: &mut RunState<'_>) -> Result<()> {
        for page in 1..=self.max_pages {
            if page > 1 {
                ctx.pause(self.page_delay).await;
            }

            let html = Self::get_html(ctx, format!("{}/gallery/{}/{}/", SITE, source.username, page)).await?;
            let ids = parse_gallery(&html)?;
            if ids.is_empty() {
                break;
            }

            for id in ids {
                if !run.admit(&id) {
                    continue;
                }
                match self.fetch_submission(ctx, source, &id).await {
                    Ok(item) => {
                        run.ingest(&item).await;
                    }
                    Err(e) => {
                        warn!(source_id = %source.id, network_id = %id, error = %e, "Failed to scrape submission");
                    }
                }
            }
            run.page_done();
        }
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for FurAffinityAdapter {
    fn network(&self) -> Network {
        Network::FurAffinity
    }

    async fn fetch(&self, ctx: &FetchContext, source: &Source) -> Result<RunReport> {
        let mut run = RunState::begin(ctx, source).await?;
        let (followers, following) = Self::fetch_profile(ctx, source).await;

        let walked = self.walk_gallery(ctx, source, &mut run).await;
        run.refresh_stats(followers, following).await;
        walked?;

        run.conclude()
    }
}
