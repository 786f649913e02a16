//! Bar source for the replay.
//!
//! A `BarSeries` is loaded once before a session starts and is read-only
//! afterwards. Lookups by time go through the formatted time key, which is
//! the same string the chart client echoes back in `STATUS` frames.

pub mod loader;

pub use loader::{load_csv, LoadOptions};

use chrono::NaiveDateTime;

/// Wire format of a bar's time key (`YYYY.MM.DD HH:MM`)
pub const TIME_KEY_FORMAT: &str = "%Y.%m.%d %H:%M";

/// One OHLCV sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub time: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Tick volume
    pub volume: u64,
}

impl Bar {
    /// Time formatted as the client renders it.
    pub fn time_key(&self) -> String {
        self.time.format(TIME_KEY_FORMAT).to_string()
    }

    /// Relative candle body, `(close - open) / open`.
    pub fn body_ratio(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.close - self.open) / self.open
    }
}

/// Time-ordered sequence of bars.
#[derive(Debug, Clone, Default)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    /// Build a series, sorting by time. The sort is stable so bars sharing a
    /// timestamp keep their input order.
    pub fn new(mut bars: Vec<Bar>) -> Self {
        bars.sort_by(|a, b| a.time.cmp(&b.time));
        Self { bars }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Bar> {
        self.bars.get(index)
    }

    pub fn first(&self) -> Option<&Bar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bar> {
        self.bars.iter()
    }

    /// Bars in `[start, start + count)`, truncated at the end of the series.
    pub fn window(&self, start: usize, count: usize) -> &[Bar] {
        let start = start.min(self.bars.len());
        let end = start.saturating_add(count).min(self.bars.len());
        &self.bars[start..end]
    }

    /// Exact lookup of a formatted time key. No nearest-time fallback.
    pub fn position_of_key(&self, key: &str) -> Option<usize> {
        self.bars.iter().position(|bar| bar.time_key() == key)
    }

    /// Indices of bars whose body ratio exceeds `threshold`.
    pub fn points_of_interest(&self, threshold: f64) -> Vec<usize> {
        self.bars
            .iter()
            .enumerate()
            .filter(|(_, bar)| bar.body_ratio() > threshold)
            .map(|(i, _)| i)
            .collect()
    }
}

impl From<Vec<Bar>> for BarSeries {
    fn from(bars: Vec<Bar>) -> Self {
        Self::new(bars)
    }
}
