//! Runs a command for every run record, forwarding selected fields as arguments.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::{AppResult, LoggerError};
use crate::logger::{parse_settings, RunLogger};
use crate::run_info::{RunAttribute, RunInfo};

/// Settings table for `type = "shell"`.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSettings {
    /// Program to execute (no shell interpretation)
    pub command: String,
    /// Record fields appended as arguments, in order
    #[serde(default)]
    pub forward_attrs: Vec<String>,
    /// strftime format for date/time fields
    #[serde(default = "default_date_format")]
    pub date_format: String,
}

fn default_date_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}

/// Invokes an external program per record.
///
/// Date/time fields are formatted with `date_format` and split on whitespace, so the
/// default format produces two arguments (date, time). List fields produce one
/// argument per element and empty optional fields produce a single `""`.
pub struct ShellRunLogger {
    id: String,
    settings: ShellSettings,
}

impl ShellRunLogger {
    /// Fails if a forwarded attribute is not a [`RunInfo`] field.
    pub fn new(id: impl Into<String>, settings: ShellSettings) -> AppResult<Self> {
        let id = id.into();
        if let Some(unknown) = settings
            .forward_attrs
            .iter()
            .find(|attr| !RunInfo::ATTRIBUTES.contains(&attr.as_str()))
        {
            return Err(LoggerError::Configuration(format!(
                "Logger '{id}' forwards unknown attribute '{unknown}'. Must be one of: {}",
                RunInfo::ATTRIBUTES.join(", ")
            )));
        }
        Ok(Self { id, settings })
    }

    /// Factory for `type = "shell"`.
    pub fn from_config(id: &str, settings: &toml::Value) -> AppResult<Box<dyn RunLogger>> {
        let settings: ShellSettings = parse_settings(id, settings)?;
        Ok(Box::new(Self::new(id, settings)?))
    }

    /// Arguments passed after the command for this record.
    pub fn arguments(&self, info: &RunInfo) -> Vec<String> {
        let mut args = Vec::new();
        for name in &self.settings.forward_attrs {
            match info.attribute(name) {
                Some(RunAttribute::Text(value)) => args.push(value),
                Some(RunAttribute::List(values)) => args.extend(values),
                Some(RunAttribute::Time(time)) => args.extend(
                    time.format(&self.settings.date_format)
                        .to_string()
                        .split_whitespace()
                        .map(str::to_string),
                ),
                Some(RunAttribute::Missing) => args.push(String::new()),
                // Rejected at construction
                None => {}
            }
        }
        args
    }
}

#[async_trait]
impl RunLogger for ShellRunLogger {
    fn name(&self) -> &str {
        &self.id
    }

    async fn log_run(&mut self, info: &RunInfo) -> AppResult<()> {
        let args = self.arguments(info);
        tracing::debug!(
            logger_id = %self.id,
            run_number = info.run_number,
            command = %self.settings.command,
            ?args,
            "Running shell logger command"
        );

        let status = Command::new(&self.settings.command)
            .args(&args)
            .kill_on_drop(true)
            .status()
            .await?;

        if !status.success() {
            return Err(LoggerError::logger(
                &self.id,
                format!("'{}' exited with {status}", self.settings.command),
            ));
        }
        Ok(())
    }
}
