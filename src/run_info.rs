//! Run records exchanged between the DAQ, the daemon and every logger.
//!
//! A [`RunInfo`] is a plain value: loggers receive clones and the run source
//! compares records field by field to decide whether anything changed.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Description of a single DAQ run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    /// Run number assigned by the DAQ
    pub run_number: u64,
    /// Local wall-clock time the run started
    pub start_time: NaiveDateTime,
    /// Name of the DAQ configuration used for the run
    pub configuration: String,
    /// Components participating in the run
    #[serde(default)]
    pub components: Vec<String>,
    /// Local wall-clock time the run ended, if it has
    #[serde(default)]
    pub end_time: Option<NaiveDateTime>,
    /// DAQ software version
    #[serde(default)]
    pub version: Option<String>,
    /// Free-form shifter comments
    #[serde(default)]
    pub comments: Option<String>,
    /// Free-form metadata blob forwarded to the logbook
    #[serde(default)]
    pub metadata: Option<String>,
    /// Set when a run is closed without an observed end
    #[serde(default)]
    pub bad_end: bool,
}

/// Value of a single [`RunInfo`] field, as seen by attribute forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunAttribute {
    /// Scalar rendered as text
    Text(String),
    /// Multi-valued field
    List(Vec<String>),
    /// Date and time
    Time(NaiveDateTime),
    /// Optional field that holds no value
    Missing,
}

impl RunInfo {
    /// Field names accepted by [`RunInfo::attribute`].
    pub const ATTRIBUTES: &'static [&'static str] = &[
        "run_number",
        "start_time",
        "configuration",
        "components",
        "end_time",
        "version",
        "comments",
        "metadata",
        "bad_end",
    ];

    /// Create a record for a run that has just started.
    pub fn new(run_number: u64, start_time: NaiveDateTime, configuration: impl Into<String>) -> Self {
        Self {
            run_number,
            start_time,
            configuration: configuration.into(),
            components: Vec::new(),
            end_time: None,
            version: None,
            comments: None,
            metadata: None,
            bad_end: false,
        }
    }

    /// Mark the run as ended at `end_time`.
    pub fn with_end_time(mut self, end_time: NaiveDateTime) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// Replace the participating components.
    pub fn with_components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components = components.into_iter().map(Into::into).collect();
        self
    }

    /// Set shifter comments.
    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    /// Set the DAQ software version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the metadata blob.
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// A run is complete once its end time is known.
    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }

    /// Look up a field by name. Returns `None` for names that are not fields.
    pub fn attribute(&self, name: &str) -> Option<RunAttribute> {
        fn optional_text(value: &Option<String>) -> RunAttribute {
            value
                .as_ref()
                .map_or(RunAttribute::Missing, |v| RunAttribute::Text(v.clone()))
        }

        let attr = match name {
            "run_number" => RunAttribute::Text(self.run_number.to_string()),
            "start_time" => RunAttribute::Time(self.start_time),
            "configuration" => RunAttribute::Text(self.configuration.clone()),
            "components" => RunAttribute::List(self.components.clone()),
            "end_time" => self.end_time.map_or(RunAttribute::Missing, RunAttribute::Time),
            "version" => optional_text(&self.version),
            "comments" => optional_text(&self.comments),
            "metadata" => optional_text(&self.metadata),
            "bad_end" => RunAttribute::Text(if self.bad_end { "True" } else { "False" }.to_string()),
            _ => return None,
        };
        Some(attr)
    }
}
