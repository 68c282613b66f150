//! # Target Catalogue
//!
//! Loads the list of watched targets from a JSON5 document.
//!
//! ```json5
//! {
//!   targets: [
//!     { id: "fast-5", nominalIntervalSeconds: 75, timingClass: "ZERO_WAIT",
//!       endpoint: { url: "https://origin.example/fast-5/latest" } },
//!     { id: "sched-1", timingClass: "SCHEDULED_WINDOW",
//!       window: { drawTimes: ["21:30"], timezone: "Europe/Athens",
//!                 leadMinutes: 3, dataDelayMinutes: 10 } },
//!   ],
//! }
//! ```
//!
//! Every entry is decoded and validated on its own: a broken entry is
//! reported in [`Catalogue::rejected`] and skipped, the rest still load.
//! Only a catalogue with nothing loadable is an error.

use async_trait::async_trait;
use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::core::target::{DrawWindow, PollTuning, Target, TimingClass};
use crate::error::CatalogueError;

#[cfg(feature = "ingestors")]
use crate::ingestors::HttpEndpoint;

/// Timing class names as written in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimingClassName {
    /// See [`TimingClass::ZeroWait`].
    ZeroWait,
    /// See [`TimingClass::ImmediateDraw`].
    ImmediateDraw,
    /// See [`TimingClass::ScheduledWindow`].
    ScheduledWindow,
    /// See [`TimingClass::Manual`].
    Manual,
}

fn default_true() -> bool {
    true
}
fn default_late_window() -> u64 {
    10
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_lead_minutes() -> u32 {
    5
}
fn default_data_delay_minutes() -> u32 {
    10
}
fn default_lead_cadence() -> u64 {
    5
}
fn default_post_draw_cadence() -> u64 {
    30
}

/// Calendar block of a SCHEDULED_WINDOW entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowDef {
    /// Local times of day, `HH:MM` or `HH:MM:SS`.
    pub draw_times: Vec<String>,
    /// Weekday names (`Mon`, `tuesday`, ...). Empty means every day.
    #[serde(default)]
    pub weekdays: Vec<String>,
    /// IANA timezone name.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Minutes of polling before each draw.
    #[serde(default = "default_lead_minutes")]
    pub lead_minutes: u32,
    /// Minutes after each draw the origin may take to publish.
    #[serde(default = "default_data_delay_minutes")]
    pub data_delay_minutes: u32,
    /// Cadence during the lead-in.
    #[serde(default = "default_lead_cadence")]
    pub lead_cadence_seconds: u64,
    /// Cadence between the draw and the end of the data delay.
    #[serde(default = "default_post_draw_cadence")]
    pub post_draw_cadence_seconds: u64,
}

impl WindowDef {
    fn to_window(&self, id: &str) -> Result<DrawWindow, CatalogueError> {
        let invalid = |reason: String| CatalogueError::Invalid {
            id: id.to_string(),
            reason,
        };

        let draw_times = self
            .draw_times
            .iter()
            .map(|t| {
                NaiveTime::parse_from_str(t, "%H:%M")
                    .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
                    .map_err(|_| invalid(format!("bad draw time '{}'", t)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let weekdays = self
            .weekdays
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| invalid(format!("bad weekday '{}'", d)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let timezone = self
            .timezone
            .parse::<Tz>()
            .map_err(|e| invalid(format!("bad timezone '{}': {}", self.timezone, e)))?;

        Ok(DrawWindow {
            draw_times,
            weekdays,
            timezone,
            lead_minutes: self.lead_minutes,
            data_delay_minutes: self.data_delay_minutes,
            lead_cadence_secs: self.lead_cadence_seconds,
            post_draw_cadence_secs: self.post_draw_cadence_seconds,
        })
    }
}

/// One catalogue entry as written in the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDef {
    /// Unique target id.
    pub id: String,
    /// Seconds between draws; required for countdown classes.
    #[serde(default)]
    pub nominal_interval_seconds: u64,
    /// `ZERO_WAIT`, `IMMEDIATE_DRAW`, `SCHEDULED_WINDOW` or `MANUAL`.
    pub timing_class: TimingClassName,
    /// Seconds taken off the far-band wait.
    #[serde(default)]
    pub early_fetch_offset_seconds: u64,
    /// Defaults to true.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides for the default tuning knobs.
    #[serde(default)]
    pub tuning: PollTuning,
    /// IMMEDIATE_DRAW only.
    #[serde(default = "default_late_window")]
    pub late_window_seconds: u64,
    /// SCHEDULED_WINDOW only.
    #[serde(default)]
    pub window: Option<WindowDef>,
    /// Where the HTTP/JSON fetcher finds this target.
    #[cfg(feature = "ingestors")]
    #[serde(default)]
    pub endpoint: Option<HttpEndpoint>,
}

impl TargetDef {
    /// Builds and validates the runtime target.
    pub fn to_target(&self) -> Result<Target, CatalogueError> {
        let timing = match self.timing_class {
            TimingClassName::ZeroWait => TimingClass::ZeroWait,
            TimingClassName::ImmediateDraw => TimingClass::ImmediateDraw {
                late_window_secs: self.late_window_seconds,
            },
            TimingClassName::ScheduledWindow => {
                let window = self.window.as_ref().ok_or_else(|| CatalogueError::Invalid {
                    id: self.id.clone(),
                    reason: "SCHEDULED_WINDOW needs a window block".to_string(),
                })?;
                TimingClass::ScheduledWindow(window.to_window(&self.id)?)
            }
            TimingClassName::Manual => TimingClass::Manual,
        };

        let mut target = Target::new(self.id.clone(), self.nominal_interval_seconds, timing)
            .with_tuning(self.tuning)
            .with_early_offset(self.early_fetch_offset_seconds);
        target.enabled = self.enabled;
        target.validate()?;
        Ok(target)
    }
}

/// Result of loading a catalogue document.
#[derive(Debug, Default)]
pub struct Catalogue {
    /// Loadable targets in file order.
    pub targets: Vec<Target>,
    /// Endpoint descriptions of the loadable targets that carry one.
    #[cfg(feature = "ingestors")]
    pub endpoints: Vec<(String, HttpEndpoint)>,
    /// Entries that were skipped.
    pub rejected: Vec<CatalogueError>,
}

impl Catalogue {
    /// Parses a JSON5 document. Fails with [`CatalogueError::Empty`] when no
    /// entry survives validation.
    pub fn parse(text: &str) -> Result<Self, CatalogueError> {
        let document: Value =
            serde_json5::from_str(text).map_err(|e| CatalogueError::Parse(e.to_string()))?;
        let entries = match document {
            Value::Object(mut map) => match map.remove("targets") {
                Some(Value::Array(entries)) => entries,
                _ => {
                    return Err(CatalogueError::Parse(
                        "expected a 'targets' array".to_string(),
                    ))
                }
            },
            Value::Array(entries) => entries,
            _ => {
                return Err(CatalogueError::Parse(
                    "expected an object or an array".to_string(),
                ))
            }
        };

        let mut catalogue = Catalogue::default();
        let mut seen = HashSet::new();
        for (index, entry) in entries.into_iter().enumerate() {
            let hint = entry
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", index));

            let def: TargetDef = match serde_json::from_value(entry) {
                Ok(def) => def,
                Err(e) => {
                    catalogue.rejected.push(CatalogueError::Invalid {
                        id: hint,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !seen.insert(def.id.clone()) {
                catalogue.rejected.push(CatalogueError::Invalid {
                    id: def.id.clone(),
                    reason: "duplicate id".to_string(),
                });
                continue;
            }
            match def.to_target() {
                Ok(target) => {
                    #[cfg(feature = "ingestors")]
                    if let Some(endpoint) = def.endpoint.clone() {
                        catalogue.endpoints.push((target.id.clone(), endpoint));
                    }
                    catalogue.targets.push(target);
                }
                Err(e) => catalogue.rejected.push(e),
            }
        }

        for rejected in &catalogue.rejected {
            tracing::warn!(error = %rejected, "catalogue entry skipped");
        }
        if catalogue.targets.is_empty() {
            return Err(CatalogueError::Empty);
        }
        Ok(catalogue)
    }
}

/// Supplies the target catalogue.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Loads the current catalogue.
    async fn load(&self) -> Result<Catalogue, CatalogueError>;

    /// Opaque revision marker. A change means [`load`](Self::load) may
    /// return something new. `None` when the source cannot tell.
    async fn revision(&self) -> Option<SystemTime>;

    /// Human readable origin, for logs.
    fn describe(&self) -> String;
}

/// A catalogue stored in a JSON5 file.
#[derive(Debug, Clone)]
pub struct FileCatalogue {
    path: PathBuf,
}

impl FileCatalogue {
    /// Reads the catalogue from `path` on every load.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The catalogue file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileCatalogue {
    async fn load(&self) -> Result<Catalogue, CatalogueError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        Catalogue::parse(&text)
    }

    async fn revision(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    // comments and trailing commas are fine
    {
      targets: [
        { id: "fast-5", nominalIntervalSeconds: 75, timingClass: "ZERO_WAIT",
          earlyFetchOffsetSeconds: 2, tuning: { staleRetryBudget: 4 } },
        { id: "quick", nominalIntervalSeconds: 60, timingClass: "IMMEDIATE_DRAW" },
        { id: "sched-1", timingClass: "SCHEDULED_WINDOW",
          window: { drawTimes: ["21:30"], weekdays: ["Mon", "friday"],
                    timezone: "Europe/Athens", leadMinutes: 3 } },
        { id: "ops", timingClass: "MANUAL", enabled: false },
        { id: "broken", timingClass: "ZERO_WAIT" },
        { id: "fast-5", nominalIntervalSeconds: 30, timingClass: "ZERO_WAIT" },
        { nominalIntervalSeconds: 30, timingClass: "WHENEVER" },
      ],
    }
    "#;

    #[test]
    fn loads_valid_entries_and_skips_the_rest() {
        let catalogue = Catalogue::parse(SAMPLE).unwrap();
        let ids: Vec<_> = catalogue.targets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["fast-5", "quick", "sched-1", "ops"]);
        assert_eq!(catalogue.rejected.len(), 3);

        let fast = &catalogue.targets[0];
        assert_eq!(fast.early_fetch_offset_secs, 2);
        assert_eq!(fast.tuning.stale_retry_budget, 4);
        assert_eq!(fast.tuning.failure_threshold, PollTuning::default().failure_threshold);

        assert_eq!(
            catalogue.targets[1].timing,
            TimingClass::ImmediateDraw { late_window_secs: 10 }
        );

        match &catalogue.targets[2].timing {
            TimingClass::ScheduledWindow(w) => {
                assert_eq!(w.lead_minutes, 3);
                assert_eq!(w.data_delay_minutes, 10);
                assert_eq!(w.weekdays, vec![Weekday::Mon, Weekday::Fri]);
                assert_eq!(w.timezone, chrono_tz::Europe::Athens);
            }
            other => panic!("unexpected timing {:?}", other),
        }
        assert!(!catalogue.targets[3].enabled);
    }

    #[test]
    fn nothing_loadable_is_empty() {
        let text = r#"{ targets: [ { id: "x", timingClass: "ZERO_WAIT" } ] }"#;
        assert!(matches!(Catalogue::parse(text), Err(CatalogueError::Empty)));
        assert!(matches!(Catalogue::parse("{ targets: [] }"), Err(CatalogueError::Empty)));
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        assert!(matches!(Catalogue::parse("{ targets: "), Err(CatalogueError::Parse(_))));
        assert!(matches!(Catalogue::parse("42"), Err(CatalogueError::Parse(_))));
    }

    #[test]
    fn zero_retry_delays_are_rejected() {
        let text = r#"[
            { id: "ok", nominalIntervalSeconds: 60, timingClass: "ZERO_WAIT",
              tuning: { degradedIntervalSeconds: 60 } },
            { id: "spin", nominalIntervalSeconds: 60, timingClass: "ZERO_WAIT",
              tuning: { degradedIntervalSeconds: 0 } },
            { id: "hammer", nominalIntervalSeconds: 60, timingClass: "ZERO_WAIT",
              tuning: { failureRetryMs: 0, staleRetryIntervalMs: 0 } },
        ]"#;
        let catalogue = Catalogue::parse(text).unwrap();
        let ids: Vec<_> = catalogue.targets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["ok"]);
        assert_eq!(catalogue.targets[0].tuning.degraded_interval_secs, 60);
        assert_eq!(catalogue.rejected.len(), 2);
        assert!(catalogue
            .rejected
            .iter()
            .all(|e| matches!(e, CatalogueError::Invalid { .. })));
    }

    #[test]
    fn bad_window_is_rejected() {
        let text = r#"[
            { id: "ok", timingClass: "MANUAL" },
            { id: "tz", timingClass: "SCHEDULED_WINDOW",
              window: { drawTimes: ["21:30"], timezone: "Mars/Olympus" } },
            { id: "time", timingClass: "SCHEDULED_WINDOW", window: { drawTimes: ["25:99"] } },
            { id: "none", timingClass: "SCHEDULED_WINDOW" },
        ]"#;
        let catalogue = Catalogue::parse(text).unwrap();
        assert_eq!(catalogue.targets.len(), 1);
        let ids: Vec<_> = catalogue
            .rejected
            .iter()
            .map(|e| match e {
                CatalogueError::Invalid { id, .. } => id.clone(),
                other => other.to_string(),
            })
            .collect();
        assert_eq!(ids, vec!["tz", "time", "none"]);
    }

    #[tokio::test]
    async fn file_source_reads_and_reports_revision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json5");
        let source = FileCatalogue::new(&path);
        assert!(source.revision().await.is_none());
        assert!(matches!(source.load().await, Err(CatalogueError::Io(_))));

        std::fs::write(&path, SAMPLE).unwrap();
        assert!(source.revision().await.is_some());
        assert_eq!(source.load().await.unwrap().targets.len(), 4);
    }
}
