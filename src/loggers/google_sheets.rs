//! Google Sheets run logger.
//!
//! Column A of the target sheet holds run numbers, starting directly below a fixed
//! number of header rows. A run that already has a row is updated in place (so the
//! end time can be filled in later), any other run is appended to the table.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppResult, LoggerError};
use crate::logger::{parse_settings, RunLogger};
use crate::loggers::google_auth::{ServiceAccountKey, TokenProvider, SPREADSHEETS_SCOPE};
use crate::run_info::RunInfo;

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const INPUT_OPTION: &str = "USER_ENTERED";

/// Settings table for `type = "google_sheets"`.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleSheetsSettings {
    /// Spreadsheet id from the sheet URL
    pub sheet_id: String,
    /// Tab holding the run table
    pub sheet_name: String,
    /// Service-account key JSON
    pub credentials_file: PathBuf,
    /// Number of header rows above the first run
    #[serde(default)]
    pub header: u32,
    /// Cell the append call uses to locate the table (default: first run cell)
    #[serde(default)]
    pub range: Option<String>,
    /// Minimum spacing between posts
    #[serde(default = "default_min_interval", with = "humantime_serde")]
    pub min_interval: Duration,
}

fn default_min_interval() -> Duration {
    Duration::from_secs(1)
}

/// Value-range operations the logger needs from the spreadsheet service.
#[async_trait]
pub trait SheetsBackend: Send {
    /// Read a range. Missing trailing cells are absent, not empty.
    async fn get_values(&mut self, range: &str) -> AppResult<Vec<Vec<Value>>>;

    /// Overwrite a range, returning the raw API response.
    async fn update_values(&mut self, range: &str, rows: Vec<Vec<Value>>) -> AppResult<Value>;

    /// Append after the table containing `range`, returning the raw API response.
    async fn append_values(&mut self, range: &str, rows: Vec<Vec<Value>>) -> AppResult<Value>;
}

/// Sheets v4 REST client authenticated with a service account.
pub struct SheetsClient {
    spreadsheet_id: String,
    client: Client,
    tokens: TokenProvider,
}

impl SheetsClient {
    /// Client for one spreadsheet.
    pub fn new(spreadsheet_id: impl Into<String>, tokens: TokenProvider) -> AppResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            spreadsheet_id: spreadsheet_id.into(),
            client,
            tokens,
        })
    }

    fn values_url(&self, segment: &str) -> AppResult<Url> {
        let mut url = Url::parse(SHEETS_API).map_err(|e| LoggerError::Http(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| LoggerError::Http(format!("Cannot build URL from {SHEETS_API}")))?
            .push(&self.spreadsheet_id)
            .push("values")
            .push(segment);
        Ok(url)
    }

    async fn send(&mut self, request: reqwest::RequestBuilder) -> AppResult<Value> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LoggerError::Http(format!("Sheets API returned {status}: {body}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SheetsBackend for SheetsClient {
    async fn get_values(&mut self, range: &str) -> AppResult<Vec<Vec<Value>>> {
        let url = self.values_url(range)?;
        let request = self.client.get(url);
        let body = self.send(request).await?;
        match body.get("values") {
            Some(values) => Ok(serde_json::from_value(values.clone())?),
            None => Ok(Vec::new()),
        }
    }

    async fn update_values(&mut self, range: &str, rows: Vec<Vec<Value>>) -> AppResult<Value> {
        let url = self.values_url(range)?;
        let request = self
            .client
            .put(url)
            .query(&[("valueInputOption", INPUT_OPTION)])
            .json(&json!({ "values": rows }));
        self.send(request).await
    }

    async fn append_values(&mut self, range: &str, rows: Vec<Vec<Value>>) -> AppResult<Value> {
        let url = self.values_url(&format!("{range}:append"))?;
        let request = self
            .client
            .post(url)
            .query(&[("valueInputOption", INPUT_OPTION)])
            .json(&json!({ "values": rows }));
        self.send(request).await
    }
}

/// Adds one row per run to a Google sheet.
pub struct GoogleSheetsRunLogger<B = SheetsClient> {
    id: String,
    backend: B,
    sheet_name: String,
    header: u32,
    append_range: String,
    rate_limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    /// Completed runs already written; they are never posted again
    completed: HashSet<u64>,
}

impl GoogleSheetsRunLogger<SheetsClient> {
    /// Factory for `type = "google_sheets"`. Reads the credentials file.
    pub fn from_config(id: &str, settings: &toml::Value) -> AppResult<Box<dyn RunLogger>> {
        let settings: GoogleSheetsSettings = parse_settings(id, settings)?;
        let key = ServiceAccountKey::from_file(&settings.credentials_file)?;
        let tokens = TokenProvider::new(key, SPREADSHEETS_SCOPE)?;
        let backend = SheetsClient::new(settings.sheet_id.clone(), tokens)?;
        Ok(Box::new(GoogleSheetsRunLogger::new(id, backend, &settings)))
    }
}

impl<B: SheetsBackend> GoogleSheetsRunLogger<B> {
    /// Logger writing through `backend`.
    pub fn new(id: impl Into<String>, backend: B, settings: &GoogleSheetsSettings) -> Self {
        let first_row = settings.header.saturating_add(1);
        let range = settings
            .range
            .clone()
            .unwrap_or_else(|| format!("A{first_row}:A{first_row}"));

        Self {
            id: id.into(),
            backend,
            sheet_name: settings.sheet_name.clone(),
            header: settings.header,
            append_range: format!("{}!{range}", settings.sheet_name),
            rate_limiter: Quota::with_period(settings.min_interval).map(RateLimiter::direct),
            completed: HashSet::new(),
        }
    }

    /// Map each run number in column A to its 1-based sheet row. When a run appears
    /// more than once the last row wins.
    pub async fn run_row_map(&mut self) -> AppResult<HashMap<u64, u32>> {
        let first_row = self.header.saturating_add(1);
        let range = format!("{}!A{first_row}:A", self.sheet_name);
        let rows = self.backend.get_values(&range).await?;

        let mut map = HashMap::new();
        for (offset, row) in (0u32..).zip(rows.iter()) {
            let sheet_row = first_row.saturating_add(offset);
            match row.first().and_then(parse_run_number) {
                Some(run_number) => {
                    map.insert(run_number, sheet_row);
                }
                None => tracing::warn!(
                    logger_id = %self.id,
                    row = sheet_row,
                    value = ?row,
                    "Invalid run number in sheet"
                ),
            }
        }
        Ok(map)
    }

    /// Cells written for a run, in column order.
    pub fn row_for(info: &RunInfo) -> Vec<Value> {
        let end_time = info
            .end_time
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default();

        vec![
            json!(info.run_number),
            json!(info.start_time.format("%y/%m/%d").to_string()),
            json!(info.start_time.format("%H:%M:%S").to_string()),
            json!(end_time),
            json!(info.configuration),
            json!(info.components.join(", ")),
            json!(info.comments.clone().unwrap_or_default()),
        ]
    }
}

fn parse_run_number(cell: &Value) -> Option<u64> {
    match cell {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn updated_cells(response: &Value) -> u64 {
    response
        .get("updatedCells")
        .or_else(|| response.pointer("/updates/updatedCells"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

#[async_trait]
impl<B: SheetsBackend> RunLogger for GoogleSheetsRunLogger<B> {
    fn name(&self) -> &str {
        &self.id
    }

    fn filter_run(&self, info: &RunInfo) -> bool {
        !self.completed.contains(&info.run_number)
    }

    async fn log_run(&mut self, info: &RunInfo) -> AppResult<()> {
        if self.completed.contains(&info.run_number) {
            tracing::debug!(logger_id = %self.id, run_number = info.run_number, "Run already logged, skipping");
            return Ok(());
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let rows = vec![Self::row_for(info)];
        let existing = self.run_row_map().await?.get(&info.run_number).copied();

        let response = match existing {
            Some(row) => {
                tracing::info!(logger_id = %self.id, run_number = info.run_number, row, "Updating run row");
                let range = format!("{}!A{row}:Z{row}", self.sheet_name);
                self.backend.update_values(&range, rows).await?
            }
            None => {
                tracing::info!(logger_id = %self.id, run_number = info.run_number, "Appending new run row");
                let range = self.append_range.clone();
                self.backend.append_values(&range, rows).await?
            }
        };

        if updated_cells(&response) == 0 {
            tracing::warn!(
                logger_id = %self.id,
                run_number = info.run_number,
                %response,
                "Unexpected result from Sheets API"
            );
        }

        if info.is_complete() {
            self.completed.insert(info.run_number);
        }
        Ok(())
    }
}
