//! Key-casing adapter applied at the persistence boundary.
//!
//! Records written by one tool (camelCase) must stay readable by another
//! (snake_case) and vice versa. Every object key is rewritten recursively;
//! arrays are mapped element-wise and leaf values pass through unchanged.
//! Key order is preserved (`serde_json` is built with `preserve_order`).
//!
//! Word boundaries are: any non-alphanumeric separator, every uppercase
//! letter, and every letter/digit transition. A chunk written entirely in
//! capitals (`LOCAL_EXTRACTION`, `HTTP`) is one word per chunk. Mixed-case
//! chunks split on each uppercase letter rather than grouping acronyms, which
//! keeps the two directions exact inverses: for any key `k`, with
//! `s = to_snake_case(k)`, `to_snake_case(&to_camel_case(&s)) == s`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// KeyCase
// ---------------------------------------------------------------------------

/// Field-naming convention of a persisted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyCase {
    /// `time_stamp`, `log_file`.
    #[default]
    Snake,
    /// `timeStamp`, `logFile`.
    Camel,
}

impl KeyCase {
    /// Convert a single key to this convention.
    pub fn convert(&self, key: &str) -> String {
        match self {
            Self::Snake => to_snake_case(key),
            Self::Camel => to_camel_case(key),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snake => "snake",
            Self::Camel => "camel",
        }
    }
}

impl std::fmt::Display for KeyCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyCase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snake" | "snake_case" => Ok(Self::Snake),
            "camel" | "camelcase" => Ok(Self::Camel),
            other => Err(format!("unknown key case '{other}': expected 'snake' or 'camel'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Word splitting
// ---------------------------------------------------------------------------

/// Split a key into words, case preserved.
pub fn split_words(key: &str) -> Vec<String> {
    static SEPARATOR_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("valid regex"));

    let mut words = Vec::new();
    for chunk in SEPARATOR_RE.split(key).filter(|c| !c.is_empty()) {
        let chars: Vec<char> = chunk.chars().collect();
        // `LOCAL`, `HTTP2`: a screaming chunk is one word, not one per letter.
        if chars[0].is_uppercase() && !chars.iter().any(|c| c.is_lowercase()) {
            words.extend(split_digits(&chars));
            continue;
        }
        let mut start = 0;
        for i in 1..chars.len() {
            let (prev, cur) = (chars[i - 1], chars[i]);
            let boundary = cur.is_uppercase()
                || (prev.is_alphabetic() && cur.is_numeric())
                || (prev.is_numeric() && cur.is_alphabetic());
            if boundary {
                words.push(chars[start..i].iter().collect());
                start = i;
            }
        }
        words.push(chars[start..].iter().collect());
    }
    words
}

fn split_digits(chars: &[char]) -> Vec<String> {
    let mut words = Vec::new();
    let mut start = 0;
    for i in 1..chars.len() {
        if chars[i - 1].is_numeric() != chars[i].is_numeric() {
            words.push(chars[start..i].iter().collect());
            start = i;
        }
    }
    words.push(chars[start..].iter().collect());
    words
}

/// `logFile`, `LogFile`, `log-file` → `log_file`.
pub fn to_snake_case(key: &str) -> String {
    split_words(key)
        .iter()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// `log_file`, `LogFile`, `log-file` → `logFile`.
pub fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, word) in split_words(key).iter().enumerate() {
        let lower = word.to_lowercase();
        if i == 0 {
            out.push_str(&lower);
            continue;
        }
        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Recursive transforms
// ---------------------------------------------------------------------------

/// Rewrite every object key in `value` to `case`.
///
/// When two keys collapse onto the same converted name the later one wins.
pub fn adapt_keys(value: &Value, case: KeyCase) -> Value {
    adapt_inner(value, case, &[])
}

/// Like [`adapt_keys`], but the values under any key whose converted name is in
/// `opaque` are copied untouched (step payloads, free-form metadata).
pub fn adapt_envelope(value: &Value, case: KeyCase, opaque: &[&str]) -> Value {
    adapt_inner(value, case, opaque)
}

fn adapt_inner(value: &Value, case: KeyCase, opaque: &[&str]) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| adapt_inner(v, case, opaque)).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let converted = case.convert(key);
                let child = if opaque.contains(&converted.as_str()) {
                    child.clone()
                } else {
                    adapt_inner(child, case, opaque)
                };
                out.insert(converted, child);
            }
            Value::Object(out)
        }
        leaf => leaf.clone(),
    }
}

// ---------------------------------------------------------------------------
// FormatAdapter
// ---------------------------------------------------------------------------

/// Boundary adapter between the in-memory convention (snake_case, what serde
/// derives produce) and the convention of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatAdapter {
    disk: KeyCase,
    opaque: Vec<String>,
}

impl FormatAdapter {
    pub fn new(disk: KeyCase) -> Self {
        Self {
            disk,
            opaque: Vec::new(),
        }
    }

    /// Keys whose values are never rewritten, e.g. `data` or `meta`.
    pub fn with_opaque<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opaque.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn disk_case(&self) -> KeyCase {
        self.disk
    }

    /// In-memory (snake_case) → on-disk convention.
    pub fn to_disk(&self, value: &Value) -> Value {
        let opaque: Vec<&str> = self.opaque.iter().map(String::as_str).collect();
        // Opaque names are matched after conversion, so convert them too.
        let converted: Vec<String> = opaque.iter().map(|k| self.disk.convert(k)).collect();
        let converted: Vec<&str> = converted.iter().map(String::as_str).collect();
        adapt_envelope(value, self.disk, &converted)
    }

    /// Any convention → in-memory snake_case.
    pub fn from_disk(&self, value: &Value) -> Value {
        let opaque: Vec<&str> = self.opaque.iter().map(String::as_str).collect();
        adapt_envelope(value, KeyCase::Snake, &opaque)
    }
}
