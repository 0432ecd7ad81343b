//! Pure helpers that turn a list of fetched items into the derived numbers
//! handed to the summarizer: who is active, what they talk about, and when.

use std::collections::{BTreeMap, HashMap};

use chrono::{Local, TimeZone, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use recap_store::NormalizedRecord;

static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9'_-]+").expect("word regex"));

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "was", "has", "are", "not", "this", "that", "with", "from", "have",
    "you", "your", "can", "its", "will", "but", "they", "all", "been", "also", "into", "more",
    "than", "when", "who", "what", "how", "out", "our", "new", "now", "just", "about", "there",
    "their", "would", "could", "should", "there's", "it's", "i'm", "we're", "don't", "can't",
    "here", "then", "them", "some", "any", "get", "got", "one", "let", "know", "like", "thanks",
    "please", "yes", "okay", "sure", "too", "very", "were", "which", "while", "https", "http",
    "www", "com", "re", "fwd",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ranked {
    pub name: String,
    pub count: usize,
}

/// Tally `items` by the key `key` returns; items without a key are ignored.
pub fn count_by<'a, I, F>(items: I, key: F) -> HashMap<String, usize>
where
    I: IntoIterator<Item = &'a NormalizedRecord>,
    F: Fn(&'a NormalizedRecord) -> Option<&'a str>,
{
    let mut counts = HashMap::new();
    for item in items {
        if let Some(k) = key(item) {
            *counts.entry(k.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Highest counts first, ties broken alphabetically.
pub fn top_n(counts: HashMap<String, usize>, n: usize) -> Vec<Ranked> {
    let mut ranked: Vec<Ranked> = counts
        .into_iter()
        .map(|(name, count)| Ranked { name, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(n);
    ranked
}

pub fn top_senders(items: &[NormalizedRecord], n: usize) -> Vec<Ranked> {
    top_n(count_by(items, |r| r.sender.as_deref()), n)
}

/// Most frequent words across `texts`, with stop words and short tokens dropped.
pub fn extract_keywords<'a>(texts: impl IntoIterator<Item = &'a str>, n: usize) -> Vec<Ranked> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for m in WORD_RE.find_iter(text) {
            let word = m.as_str().trim_matches(|c| c == '\'' || c == '-').to_lowercase();
            if word.len() < 3 || STOP_WORDS.contains(&word.as_str()) {
                continue;
            }
            *counts.entry(word).or_insert(0) += 1;
        }
    }
    top_n(counts, n)
}

/// Item counts per local hour of day.
pub fn hourly_activity(items: &[NormalizedRecord]) -> [usize; 24] {
    let mut hours = [0usize; 24];
    for item in items {
        if let Some(at) = Local.timestamp_opt(item.timestamp, 0).single() {
            hours[at.hour() as usize] += 1;
        }
    }
    hours
}

/// Hour with the most items, earliest on ties. `None` when there are no items.
pub fn busiest_hour(hours: &[usize; 24]) -> Option<u32> {
    let (hour, count) = hours
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(&a.0)))?;
    (*count > 0).then_some(hour as u32)
}

/// Item counts per local calendar day (`YYYY-MM-DD`).
pub fn daily_activity(items: &[NormalizedRecord]) -> BTreeMap<String, usize> {
    let mut days = BTreeMap::new();
    for item in items {
        if let Some(at) = Local.timestamp_opt(item.timestamp, 0).single() {
            *days.entry(at.format("%Y-%m-%d").to_string()).or_insert(0) += 1;
        }
    }
    days
}
