use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use serde_json::json;
use url::Url;

use crawlq_core::error::AppError;
use crawlq_core::plan::{FoundUrl, Plan, PlanFailure, PlanOutput, PlanResult};
use crawlq_core::traits::{Fetcher, Page};
use crawlq_core::task::Task;

pub const PLAN_NAME: &str = "hackernews";

const HOST: &str = "news.ycombinator.com";
const BASE_URL: &str = "https://news.ycombinator.com/";

/// Priority of a post's comment page on the next frontier.
pub const COMMENTS_PRIORITY: i32 = 1;
/// Priority of the "More" link.
pub const PAGINATION_PRIORITY: i32 = 2;

/// One story row on a listing page, or the story header of an item page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Post {
    pub post_id: String,
    pub title: String,
    pub url: String,
    pub points: u32,
    pub author: String,
    pub posted_time: DateTime<Utc>,
    pub comments: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    /// Inner HTML of the comment body.
    pub text: String,
    pub time: DateTime<Utc>,
    /// The enclosing comment, or the post for top-level comments.
    pub parent_id: String,
    pub level: u32,
}

struct Selectors {
    page_title: Selector,
    post_row: Selector,
    title_link: Selector,
    score: Selector,
    user: Selector,
    age: Selector,
    age_link: Selector,
    subline_link: Selector,
    more_link: Selector,
    fat_item: Selector,
    top_text: Selector,
    comment_row: Selector,
    indent: Selector,
    comment_text: Selector,
}

fn selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::ParseError(format!("invalid selector '{css}': {e:?}")))
}

impl Selectors {
    fn new() -> Result<Self, AppError> {
        Ok(Self {
            page_title: selector("title")?,
            post_row: selector("tr.athing")?,
            title_link: selector(".titleline > a")?,
            score: selector(".score")?,
            user: selector(".hnuser")?,
            age: selector(".age")?,
            age_link: selector(".age a")?,
            subline_link: selector(".subline > a, .subtext > a")?,
            more_link: selector("a.morelink")?,
            fat_item: selector("table.fatitem")?,
            top_text: selector(".toptext")?,
            comment_row: selector("tr.athing.comtr")?,
            indent: selector("td.ind")?,
            comment_text: selector(".commtext")?,
        })
    }
}

/// Plan for Hacker News listing pages and item (discussion) pages.
///
/// Listing pages yield the posts plus `comments` and `pagination` links for
/// the next frontier. Item pages yield the post and its comment tree; they
/// never extend the frontier.
pub struct HackerNewsPlan<F: Fetcher> {
    fetcher: F,
    selectors: Selectors,
}

impl<F: Fetcher> HackerNewsPlan<F> {
    pub fn new(fetcher: F) -> Result<Self, AppError> {
        Ok(Self {
            fetcher,
            selectors: Selectors::new()?,
        })
    }

    /// Parse an already-fetched page.
    pub fn parse(&self, task: &Task, page: &Page) -> Result<PlanOutput, AppError> {
        let now = Utc::now();
        let base = Url::parse(&page.url)
            .or_else(|_| Url::parse(BASE_URL))
            .map_err(|e| AppError::ParseError(format!("invalid base URL: {e}")))?;

        let document = Html::parse_document(&page.body);
        let mut result = PlanResult::for_task(task, PLAN_NAME);
        result.status_code = page.status_code;
        result.title = document
            .select(&self.selectors.page_title)
            .next()
            .map(element_text)
            .unwrap_or_default();

        if is_item_page(&task.url) {
            self.parse_item_page(task, &document, &base, now, result)
        } else {
            self.parse_listing(task, &document, &base, now, result)
        }
    }

    fn parse_listing(
        &self,
        task: &Task,
        document: &Html,
        base: &Url,
        now: DateTime<Utc>,
        mut result: PlanResult,
    ) -> Result<PlanOutput, AppError> {
        let s = &self.selectors;
        let can_expand = task.depth < task.max_depth;
        let mut posts = Vec::new();
        let mut found = Vec::new();

        for row in document.select(&s.post_row) {
            let post = self.parse_post(row, next_row(row), base, now);

            if can_expand && post.comments > 0 && !post.post_id.is_empty() {
                found.push(
                    FoundUrl::new(format!("{BASE_URL}item?id={}", post.post_id), "comments")
                        .with_plan(PLAN_NAME)
                        .with_priority(COMMENTS_PRIORITY)
                        .with_context("post_id", json!(post.post_id))
                        .with_context("post_title", json!(post.title)),
                );
            }
            posts.push(post);
        }

        if can_expand {
            let next_page = document
                .select(&s.more_link)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| base.join(href).ok());
            if let Some(next_page) = next_page {
                found.push(
                    FoundUrl::new(next_page.to_string(), "pagination")
                        .with_plan(PLAN_NAME)
                        .with_priority(PAGINATION_PRIORITY),
                );
            }
        }

        result.insert("post_count", json!(posts.len()));
        result.insert("posts", serde_json::to_value(&posts)?);
        Ok((result, found))
    }

    fn parse_item_page(
        &self,
        task: &Task,
        document: &Html,
        base: &Url,
        now: DateTime<Utc>,
        mut result: PlanResult,
    ) -> Result<PlanOutput, AppError> {
        let s = &self.selectors;
        let header = document
            .select(&s.fat_item)
            .next()
            .unwrap_or_else(|| document.root_element());

        let mut post = match header.select(&s.post_row).next() {
            Some(row) => self.parse_post(row, next_row(row), base, now),
            None => self.parse_post(header, Some(header), base, now),
        };
        if post.post_id.is_empty() {
            post.post_id = item_id(&task.url).unwrap_or_default();
        }
        post.text = header
            .select(&s.top_text)
            .next()
            .map(|el| el.inner_html().trim().to_string())
            .filter(|t| !t.is_empty());

        let limit = comment_depth_limit(task);
        let comments = self.parse_comments(document, &post.post_id, limit, now);

        result.insert("comments_count", json!(comments.len()));
        result.insert("comments", serde_json::to_value(&comments)?);
        result.insert("post", serde_json::to_value(&post)?);
        Ok((result, Vec::new()))
    }

    /// Extract a post from its title row and the metadata row that follows it.
    fn parse_post(
        &self,
        row: ElementRef<'_>,
        meta: Option<ElementRef<'_>>,
        base: &Url,
        now: DateTime<Utc>,
    ) -> Post {
        let s = &self.selectors;
        let title_link = row.select(&s.title_link).next();
        let url = title_link
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| base.join(href).ok())
            .map(|u| u.to_string())
            .unwrap_or_default();

        let (points, author, posted_time, comments) = match meta {
            Some(meta) => (
                meta.select(&s.score)
                    .next()
                    .and_then(|el| leading_number(&element_text(el)))
                    .unwrap_or(0),
                first_text(meta, &s.user),
                self.posted_time(meta, now),
                meta.select(&s.subline_link)
                    .last()
                    .and_then(|a| leading_number(&element_text(a)))
                    .unwrap_or(0),
            ),
            None => (0, String::new(), now, 0),
        };

        Post {
            post_id: row.value().attr("id").unwrap_or_default().to_string(),
            title: title_link.map(element_text).unwrap_or_default(),
            url,
            points,
            author,
            posted_time,
            comments,
            text: None,
        }
    }

    /// Exact timestamp from the age tooltip when present, else the relative text.
    fn posted_time(&self, scope: ElementRef<'_>, now: DateTime<Utc>) -> DateTime<Utc> {
        let s = &self.selectors;
        scope
            .select(&s.age)
            .next()
            .and_then(|el| el.value().attr("title"))
            .and_then(parse_age_title)
            .unwrap_or_else(|| parse_relative_time(&first_text(scope, &s.age_link), now))
    }

    /// Flatten the comment tree in document order.
    ///
    /// HN renders the tree as a flat list of rows carrying their indentation
    /// level, so parents are tracked with a stack of open ancestors. Comments
    /// at `limit` or deeper are dropped.
    fn parse_comments(
        &self,
        document: &Html,
        post_id: &str,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Vec<Comment> {
        let s = &self.selectors;
        let mut ancestors: Vec<(u32, String)> = Vec::new();
        let mut comments = Vec::new();

        for row in document.select(&s.comment_row) {
            let level = row
                .select(&s.indent)
                .next()
                .and_then(|td| td.value().attr("indent"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let id = row.value().attr("id").unwrap_or_default().to_string();

            while ancestors.last().is_some_and(|(open, _)| *open >= level) {
                ancestors.pop();
            }
            let parent_id = ancestors
                .last()
                .map_or_else(|| post_id.to_string(), |(_, id)| id.clone());
            ancestors.push((level, id.clone()));

            if level >= limit {
                continue;
            }

            comments.push(Comment {
                id,
                author: first_text(row, &s.user),
                text: row
                    .select(&s.comment_text)
                    .next()
                    .map(|el| el.inner_html().trim().to_string())
                    .unwrap_or_default(),
                time: self.posted_time(row, now),
                parent_id,
                level,
            });
        }

        comments
    }
}

#[async_trait]
impl<F: Fetcher> Plan for HackerNewsPlan<F> {
    fn name(&self) -> &str {
        PLAN_NAME
    }

    fn matches(&self, url: &str) -> bool {
        Url::parse(url).is_ok_and(|u| u.host_str() == Some(HOST))
    }

    async fn execute(&self, task: &Task) -> Result<PlanOutput, PlanFailure> {
        let page = self.fetcher.fetch(&task.url).await?;
        let output = self.parse(task, &page).map_err(|e| {
            let mut partial = PlanResult::for_task(task, PLAN_NAME);
            partial.status_code = page.status_code;
            PlanFailure::with_partial(e, partial)
        })?;
        tracing::debug!(
            url = %task.url,
            found = output.1.len(),
            "Parsed Hacker News page"
        );
        Ok(output)
    }
}

fn is_item_page(url: &str) -> bool {
    url.contains("item?id=")
}

fn item_id(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned())
}

/// `options.comment_depth` if set, else the task's `max_depth`.
fn comment_depth_limit(task: &Task) -> u32 {
    task.options
        .get("comment_depth")
        .and_then(|v| v.as_u64())
        .map_or(task.max_depth, |d| u32::try_from(d).unwrap_or(u32::MAX))
}

fn next_row(row: ElementRef<'_>) -> Option<ElementRef<'_>> {
    row.next_siblings().find_map(ElementRef::wrap)
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> String {
    scope.select(selector).next().map(element_text).unwrap_or_default()
}

/// "123 points" / "45 comments" → the leading integer.
fn leading_number(text: &str) -> Option<u32> {
    text.split_whitespace().next()?.parse().ok()
}

/// Age tooltips look like `2024-05-01T12:00:00 1714564800`.
fn parse_age_title(title: &str) -> Option<DateTime<Utc>> {
    let mut parts = title.split_whitespace();
    let iso = parts.next()?;
    if let Some(ts) = parts.next().and_then(|t| t.parse::<i64>().ok()) {
        return DateTime::from_timestamp(ts, 0);
    }
    NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Convert "3 hours ago" into an absolute time relative to `now`.
///
/// Unrecognised input yields `now`. Months count as 30 days and years as 365.
pub fn parse_relative_time(age: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let mut parts = age.split_whitespace();
    let (Some(count), Some(unit)) = (parts.next(), parts.next()) else {
        return now;
    };
    let Ok(count) = count.parse::<i64>() else {
        return now;
    };

    let delta = if unit.contains("minute") {
        Duration::minutes(count)
    } else if unit.contains("hour") {
        Duration::hours(count)
    } else if unit.contains("day") {
        Duration::days(count)
    } else if unit.contains("month") {
        Duration::days(count * 30)
    } else if unit.contains("year") {
        Duration::days(count * 365)
    } else {
        return now;
    };
    now - delta
}
