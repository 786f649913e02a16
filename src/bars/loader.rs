//! CSV loader for bar data.
//!
//! Files come from several exporters, so the layout is sniffed from the
//! first row:
//! - with a header, columns are matched by name (`time`/`datetime`/`date`,
//!   an optional separate clock column, `open`..`close`, `tick_volume`)
//! - without one, `Date, Clock, Open, High, Low, Close, Volume` is assumed,
//!   or `Timestamp, Open, High, Low, Close, Volume` when the first cell is
//!   already a full timestamp

use super::{Bar, BarSeries};
use crate::error::{ReplayError, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use csv::StringRecord;
use std::path::Path;

/// Timestamp formats seen in exported bar files
const TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y.%m.%d %H:%M:%S",
    "%Y.%m.%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d"];

const HEADER_HINTS: &[&str] = &["time", "date", "open", "high", "low", "close"];

/// Loader options
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Keep only bars from this calendar year
    pub year: Option<i32>,
}

/// Column positions resolved from the first row
#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnMap {
    time: usize,
    clock: Option<usize>,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: Option<usize>,
}

impl ColumnMap {
    fn from_header(header: &StringRecord) -> Result<Self> {
        let names: Vec<String> = header.iter().map(|h| h.trim().to_lowercase()).collect();
        let find = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|c| names.iter().position(|n| n == c))
        };
        let require = |name: &str| {
            find(&[name]).ok_or_else(|| ReplayError::Data(format!("missing '{}' column", name)))
        };

        let datetime = find(&["datetime", "timestamp"]);
        let date = find(&["date"]);
        let clock = find(&["clock", "time"]);

        let (time, clock) = match (datetime, date, clock) {
            (Some(dt), _, _) => (dt, None),
            (None, Some(d), Some(c)) => (d, Some(c)),
            (None, None, Some(c)) => (c, None),
            (None, Some(d), None) => (d, None),
            (None, None, None) => {
                return Err(ReplayError::Data("no time column in header".to_string()))
            }
        };

        Ok(Self {
            time,
            clock,
            open: require("open")?,
            high: require("high")?,
            low: require("low")?,
            close: require("close")?,
            volume: find(&["tick_volume", "volume", "tickvol", "vol"]),
        })
    }

    fn headerless(first: &StringRecord) -> Result<Self> {
        let first_cell = first.get(0).unwrap_or_default();
        if is_full_timestamp(first_cell) && first.len() >= 5 {
            return Ok(Self {
                time: 0,
                clock: None,
                open: 1,
                high: 2,
                low: 3,
                close: 4,
                volume: (first.len() > 5).then_some(5),
            });
        }
        if first.len() < 6 {
            return Err(ReplayError::Data(format!(
                "headerless row has {} columns, expected at least 6",
                first.len()
            )));
        }
        Ok(Self {
            time: 0,
            clock: Some(1),
            open: 2,
            high: 3,
            low: 4,
            close: 5,
            volume: (first.len() > 6).then_some(6),
        })
    }

    fn parse_row(&self, record: &StringRecord) -> Option<Bar> {
        let cell = |i: usize| record.get(i).map(str::trim);
        let time_cell = cell(self.time)?;

        let time = match self.clock.and_then(cell) {
            Some(clock) => parse_timestamp(&format!("{} {}", time_cell, clock))
                .or_else(|| parse_timestamp(time_cell)),
            None => parse_timestamp(time_cell),
        }?;

        let price = |i: usize| cell(i)?.parse::<f64>().ok().filter(|v| v.is_finite());
        let volume = self
            .volume
            .and_then(cell)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64)
            .unwrap_or(0);

        Some(Bar {
            time,
            open: price(self.open)?,
            high: price(self.high)?,
            low: price(self.low)?,
            close: price(self.close)?,
            volume,
        })
    }
}

fn looks_like_header(record: &StringRecord) -> bool {
    record.iter().any(|cell| {
        let cell = cell.to_lowercase();
        HEADER_HINTS.iter().any(|hint| cell.contains(hint))
    })
}

fn is_full_timestamp(s: &str) -> bool {
    TIME_FORMATS
        .iter()
        .any(|fmt| NaiveDateTime::parse_from_str(s.trim(), fmt).is_ok())
}

/// Parse a timestamp in any of the supported exporter formats.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in TIME_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t);
        }
    }
    if s.bytes().all(|b| b.is_ascii_digit()) && s.len() >= 9 {
        let secs: i64 = s.parse().ok()?;
        return DateTime::from_timestamp(secs, 0).map(|t| t.naive_utc());
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Load a bar series from a CSV file.
pub fn load_csv(path: &Path, options: &LoadOptions) -> Result<BarSeries> {
    if !path.exists() {
        return Err(ReplayError::Data(format!(
            "data file not found: {}",
            path.display()
        )));
    }

    let csv_err = |source| ReplayError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    let mut records = reader.records();
    let first = match records.next() {
        Some(record) => record.map_err(csv_err)?,
        None => return Err(ReplayError::Data(format!("{} is empty", path.display()))),
    };

    let has_header = looks_like_header(&first);
    let columns = if has_header {
        ColumnMap::from_header(&first)?
    } else {
        ColumnMap::headerless(&first)?
    };
    tracing::debug!(?columns, has_header, "Sniffed CSV layout");

    let mut bars = Vec::new();
    let mut skipped = 0usize;

    let mut accept = |record: &StringRecord, line: u64| match columns.parse_row(record) {
        Some(bar) => {
            if options.year.map_or(true, |y| bar.time.year() == y) {
                bars.push(bar);
            }
        }
        None => {
            skipped += 1;
            tracing::debug!(line, "Skipping unparseable row");
        }
    };

    if !has_header {
        accept(&first, 1);
    }
    for (i, record) in records.enumerate() {
        let record = record.map_err(csv_err)?;
        accept(&record, i as u64 + 2);
    }

    if skipped > 0 {
        tracing::warn!(skipped, path = %path.display(), "Skipped rows without a valid bar");
    }

    if bars.is_empty() {
        let scope = match options.year {
            Some(y) => format!(" for year {}", y),
            None => String::new(),
        };
        return Err(ReplayError::Data(format!(
            "no bars loaded from {}{}",
            path.display(),
            scope
        )));
    }

    let series = BarSeries::new(bars);
    tracing::info!(bars = series.len(), path = %path.display(), "Loaded bar data");
    Ok(series)
}
