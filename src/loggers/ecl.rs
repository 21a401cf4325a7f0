//! Fermilab Electronic Collaboration Logbook (ECL) run logger.
//!
//! Each run produces a `Run Start` form entry and, once it ends, a `Run End` entry.
//! Before posting, the logger reads back its most recent entry from the logbook so
//! that restarts of the daemon neither duplicate posts nor leave a run without an end
//! entry. Runs must therefore arrive in increasing order; an older run than the last
//! one posted is ignored.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use rand::Rng;
use reqwest::{header::CONTENT_TYPE, Client, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{AppResult, LoggerError};
use crate::logger::{parse_settings, RunLogger};
use crate::run_info::RunInfo;

/// Form used for start-of-run entries.
pub const START_FORM: &str = "Run Start";
/// Form used for end-of-run entries.
pub const END_FORM: &str = "Run End";

const ECL_TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S";
const POST_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const RUN_CACHE_SIZE: usize = 1000;

/// Settings table for `type = "ecl"`.
#[derive(Debug, Clone, Deserialize)]
pub struct EclSettings {
    /// Base URL of the logbook, e.g. `https://dbweb0.fnal.gov/ECL/sbnd`
    pub url: String,
    /// Account sent in the `X-User` header
    pub username: String,
    /// File whose first line is the password
    #[serde(default = "default_password_file")]
    pub password_file: PathBuf,
    /// Runs below this number are never posted
    #[serde(default)]
    pub min_run: u64,
    /// Minimum spacing between logbook interactions
    #[serde(default = "default_min_interval", with = "humantime_serde")]
    pub min_interval: Duration,
    #[serde(default = "default_category")]
    /// Logbook category searched and posted to
    pub category: String,
    /// Number of recent entries searched for the last post
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

fn default_password_file() -> PathBuf {
    PathBuf::from("ecl_pwd.txt")
}

fn default_min_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_category() -> String {
    "DAQ/Automation".to_string()
}

fn default_search_limit() -> usize {
    20
}

fn xml_err(err: impl std::fmt::Display) -> LoggerError {
    LoggerError::Xml(err.to_string())
}

/// A form entry ready to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EclEntry {
    /// Logbook category, e.g. `DAQ/Automation`
    pub category: String,
    /// Form name, [`START_FORM`] or [`END_FORM`]
    pub form: String,
    /// Form fields in posting order
    pub fields: Vec<(String, String)>,
}

impl EclEntry {
    /// Empty entry for `form` in `category`.
    pub fn new(category: impl Into<String>, form: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            form: form.into(),
            fields: Vec::new(),
        }
    }

    /// Append a form field.
    pub fn set_value(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value set for `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Post body for this entry.
    pub fn to_xml(&self) -> AppResult<String> {
        self.render(&[])
    }

    /// Render with additional `<entry>` attributes (the logbook adds `id` and
    /// `timestamp` to stored entries).
    pub(crate) fn render(&self, extra_attrs: &[(&str, &str)]) -> AppResult<String> {
        let mut writer = Writer::new(Vec::new());

        let mut entry = BytesStart::new("entry");
        for attr in extra_attrs {
            entry.push_attribute(*attr);
        }
        entry.push_attribute(("category", self.category.as_str()));
        writer.write_event(Event::Start(entry)).map_err(xml_err)?;

        let form = BytesStart::new("form").with_attributes([("name", self.form.as_str())]);
        writer.write_event(Event::Start(form)).map_err(xml_err)?;
        for (name, value) in &self.fields {
            let field = BytesStart::new("field").with_attributes([("name", name.as_str())]);
            writer.write_event(Event::Start(field)).map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(value)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new("field")))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("form")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("entry")))
            .map_err(xml_err)?;

        String::from_utf8(writer.into_inner()).map_err(xml_err)
    }
}

/// An entry read back from a logbook search.
#[derive(Debug, Clone, Default)]
struct StoredEntry {
    id: String,
    timestamp: Option<NaiveDateTime>,
    form: Option<String>,
    fields: HashMap<String, String>,
}

/// Parse the `<entry>` elements of a search response.
fn parse_entries(xml: &str) -> AppResult<Vec<StoredEntry>> {
    let mut reader = Reader::from_str(xml);
    let mut entries = Vec::new();
    let mut current: Option<StoredEntry> = None;
    let mut field: Option<(String, String)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"entry" => {
                let mut entry = StoredEntry::default();
                for attr in e.attributes() {
                    let attr = attr.map_err(xml_err)?;
                    let value = attr.unescape_value()?.into_owned();
                    match attr.key.as_ref() {
                        b"id" => entry.id = value,
                        b"timestamp" => {
                            entry.timestamp =
                                NaiveDateTime::parse_from_str(&value, ECL_TIMESTAMP_FORMAT).ok();
                        }
                        b"form" => entry.form = Some(value),
                        _ => {}
                    }
                }
                current = Some(entry);
            }
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"form" => {
                if let Some(entry) = current.as_mut() {
                    for attr in e.attributes() {
                        let attr = attr.map_err(xml_err)?;
                        if attr.key.as_ref() == b"name" {
                            entry.form = Some(attr.unescape_value()?.into_owned());
                        }
                    }
                }
            }
            Event::Start(e) if e.name().as_ref() == b"field" => {
                let mut name = String::new();
                for attr in e.attributes() {
                    let attr = attr.map_err(xml_err)?;
                    if attr.key.as_ref() == b"name" {
                        name = attr.unescape_value()?.into_owned();
                    }
                }
                field = Some((name, String::new()));
            }
            Event::Empty(e) if e.name().as_ref() == b"field" => {
                if let Some(entry) = current.as_mut() {
                    for attr in e.attributes() {
                        let attr = attr.map_err(xml_err)?;
                        if attr.key.as_ref() == b"name" {
                            entry
                                .fields
                                .insert(attr.unescape_value()?.into_owned(), String::new());
                        }
                    }
                }
            }
            Event::Text(t) => {
                if let Some((_, value)) = field.as_mut() {
                    value.push_str(&t.unescape()?);
                }
            }
            Event::End(e) if e.name().as_ref() == b"field" => {
                if let (Some(entry), Some((name, value))) = (current.as_mut(), field.take()) {
                    entry.fields.insert(name, value.trim().to_string());
                }
            }
            Event::End(e) if e.name().as_ref() == b"entry" => {
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(entries)
}

/// The newest entry this logger posted, as found in the logbook.
#[derive(Debug, Clone)]
struct LastPost {
    run_number: u64,
    ended: bool,
    info: RunInfo,
}

fn last_post(entries: Vec<StoredEntry>) -> Option<LastPost> {
    let entry = entries
        .into_iter()
        .filter(|e| matches!(e.form.as_deref(), Some(START_FORM) | Some(END_FORM)))
        .filter(|e| e.timestamp.is_some())
        // Timestamps have one-second resolution; the logbook id breaks ties
        .max_by_key(|e| (e.timestamp, e.id.parse::<u64>().ok()))?;

    let run_number = match entry.fields.get("number").and_then(|n| n.trim().parse().ok()) {
        Some(n) => n,
        None => {
            tracing::warn!(entry_id = %entry.id, "Last ECL entry has no valid run number");
            return None;
        }
    };

    let timestamp = entry.timestamp?;
    let start_time = entry
        .fields
        .get("start_time")
        .and_then(|t| NaiveDateTime::parse_from_str(t, POST_TIME_FORMAT).ok())
        .unwrap_or(timestamp);
    let field = |name: &str| entry.fields.get(name).cloned().unwrap_or_default();

    let mut info = RunInfo::new(run_number, start_time, field("configuration"));
    info.components = field("components")
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    let metadata = field("metadata");
    if !metadata.is_empty() {
        info.metadata = Some(metadata);
    }

    Some(LastPost {
        run_number,
        ended: entry.form.as_deref() == Some(END_FORM),
        info,
    })
}

/// Logbook operations the run logger relies on.
#[async_trait]
pub trait EclBackend: Send {
    /// Raw XML of the most recent entries, optionally restricted to a category.
    async fn search(&mut self, category: Option<&str>, limit: usize) -> AppResult<String>;

    /// Store a new entry.
    async fn post(&mut self, entry: &EclEntry) -> AppResult<()>;
}

/// ECL XML API client using salted, signed requests.
pub struct EclClient {
    base: Url,
    username: String,
    password: String,
    client: Client,
}

impl EclClient {
    /// Client for the logbook at `url`.
    pub fn new(url: &str, username: impl Into<String>, password: impl Into<String>) -> AppResult<Self> {
        let normalized = if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{url}/")
        };
        let base = Url::parse(&normalized)
            .map_err(|e| LoggerError::Configuration(format!("Invalid ECL url '{url}': {e}")))?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            base,
            username: username.into(),
            password: password.into(),
            client,
        })
    }

    /// Read the password from the first line of `path`.
    pub fn read_password(path: &Path) -> AppResult<String> {
        let contents = std::fs::read_to_string(path)?;
        let password = contents.lines().next().unwrap_or_default().trim().to_string();
        if password.is_empty() {
            return Err(LoggerError::Configuration(format!(
                "ECL password file '{}' is empty",
                path.display()
            )));
        }
        Ok(password)
    }

    fn salted_url(&self, endpoint: &str, args: &[(&str, String)]) -> AppResult<Url> {
        let mut url = self
            .base
            .join(endpoint)
            .map_err(|e| LoggerError::Http(e.to_string()))?;
        let salt = format!("{:016x}", rand::thread_rng().gen::<u64>());
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in args {
                query.append_pair(key, value);
            }
            query.append_pair("salt", &salt);
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, query: &str, body: &str) -> AppResult<String> {
        let response = request
            .header("X-User", &self.username)
            .header("X-Signature", signature(query, &self.password, body))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(LoggerError::Http(format!("ECL returned {status}: {text}")));
        }
        Ok(text)
    }
}

/// Request signature: hex SHA-256 of `query:password:body`.
pub fn signature(query: &str, password: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.update(b":");
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl EclBackend for EclClient {
    async fn search(&mut self, category: Option<&str>, limit: usize) -> AppResult<String> {
        let mut args = vec![("l", limit.to_string())];
        if let Some(category) = category {
            args.push(("c", category.to_string()));
        }
        let url = self.salted_url("E/xml_search", &args)?;
        let query = url.query().unwrap_or_default().to_string();
        self.send(self.client.get(url), &query, "").await
    }

    async fn post(&mut self, entry: &EclEntry) -> AppResult<()> {
        let body = entry.to_xml()?;
        let url = self.salted_url("E/xml_post", &[])?;
        let query = url.query().unwrap_or_default().to_string();
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/xml")
            .body(body.clone());
        self.send(request, &query, &body).await?;
        Ok(())
    }
}

/// Posts run start/end forms to the ECL.
pub struct EclRunLogger<B = EclClient> {
    id: String,
    backend: B,
    category: String,
    min_run: u64,
    search_limit: usize,
    rate_limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    /// Runs whose end entry has been posted
    completed: VecDeque<u64>,
}

impl EclRunLogger<EclClient> {
    /// Factory for `type = "ecl"`. Reads the password file.
    pub fn from_config(id: &str, settings: &toml::Value) -> AppResult<Box<dyn RunLogger>> {
        let settings: EclSettings = parse_settings(id, settings)?;
        let password = EclClient::read_password(&settings.password_file)?;
        let backend = EclClient::new(&settings.url, settings.username.clone(), password)?;
        Ok(Box::new(EclRunLogger::new(id, backend, &settings)))
    }
}

impl<B: EclBackend> EclRunLogger<B> {
    /// Logger posting through `backend`.
    pub fn new(id: impl Into<String>, backend: B, settings: &EclSettings) -> Self {
        Self {
            id: id.into(),
            backend,
            category: settings.category.clone(),
            min_run: settings.min_run,
            search_limit: settings.search_limit,
            rate_limiter: Quota::with_period(settings.min_interval).map(RateLimiter::direct),
            completed: VecDeque::with_capacity(RUN_CACHE_SIZE),
        }
    }

    fn is_completed(&self, run_number: u64) -> bool {
        self.completed.contains(&run_number)
    }

    fn mark_completed(&mut self, run_number: u64) {
        if self.completed.len() == RUN_CACHE_SIZE {
            self.completed.pop_front();
        }
        self.completed.push_back(run_number);
    }

    /// Build the start or end form for a run.
    pub fn entry_for(&self, info: &RunInfo, end_of_run: bool) -> EclEntry {
        let form = if end_of_run { END_FORM } else { START_FORM };
        let mut entry = EclEntry::new(&self.category, form);
        entry.set_value("number", info.run_number.to_string());
        entry.set_value("configuration", &info.configuration);
        entry.set_value("components", info.components.join(", "));
        entry.set_value("metadata", info.metadata.clone().unwrap_or_default());

        if end_of_run {
            let end_time = info
                .end_time
                .map(|t| t.format(POST_TIME_FORMAT).to_string())
                .unwrap_or_default();
            entry.set_value("end_time", end_time);
            entry.set_value("crashed", if info.bad_end { "Yes" } else { "No" });
        } else {
            entry.set_value("start_time", info.start_time.format(POST_TIME_FORMAT).to_string());
        }
        entry
    }

    async fn post_run(&mut self, info: &RunInfo, end_of_run: bool) -> AppResult<()> {
        let entry = self.entry_for(info, end_of_run);
        tracing::info!(
            logger_id = %self.id,
            run_number = info.run_number,
            form = %entry.form,
            "Posting to ECL"
        );
        self.backend.post(&entry).await?;
        if end_of_run {
            self.mark_completed(info.run_number);
        }
        Ok(())
    }

    async fn find_last_post(&mut self) -> AppResult<Option<LastPost>> {
        let xml = self
            .backend
            .search(Some(self.category.as_str()), self.search_limit)
            .await?;
        Ok(last_post(parse_entries(&xml)?))
    }
}

#[async_trait]
impl<B: EclBackend> RunLogger for EclRunLogger<B> {
    fn name(&self) -> &str {
        &self.id
    }

    fn filter_run(&self, info: &RunInfo) -> bool {
        info.run_number >= self.min_run && !self.is_completed(info.run_number)
    }

    async fn log_run(&mut self, info: &RunInfo) -> AppResult<()> {
        if !self.filter_run(info) {
            tracing::debug!(logger_id = %self.id, run_number = info.run_number, "Run filtered, not posting");
            return Ok(());
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let last = self.find_last_post().await?;
        match last {
            Some(last) if info.run_number == last.run_number => {
                if info.is_complete() && !last.ended {
                    self.post_run(info, true).await?;
                }
            }
            Some(last) if info.run_number < last.run_number => {
                tracing::warn!(
                    logger_id = %self.id,
                    run_number = info.run_number,
                    last_run_number = last.run_number,
                    "Run is older than the last ECL post, not posting"
                );
            }
            previous => {
                if let Some(unterminated) = previous.filter(|p| !p.ended) {
                    let mut closing = unterminated.info;
                    closing.bad_end = true;
                    closing.end_time = Some(info.start_time);
                    tracing::warn!(
                        logger_id = %self.id,
                        run_number = closing.run_number,
                        "Previous run never ended, closing it"
                    );
                    self.post_run(&closing, true).await?;
                }

                self.post_run(info, false).await?;
                if info.is_complete() {
                    self.post_run(info, true).await?;
                }
            }
        }
        Ok(())
    }
}
