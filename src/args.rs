//! Element argument parsing
//!
//! An element's configuration string is a comma-separated list:
//! positional values first, then `KEYWORD value` pairs. Splitting
//! respects quotes and nested parentheses, so `DATA "a,b"` is one
//! argument. Typed accessors parse the common value shapes: booleans,
//! integers, durations (`10ms`, `2s`, bare seconds) and bandwidths
//! (`1000kbps`, `8Mbps`, bare bits per second).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArgError {
    #[error("keyword '{0}' given twice")]
    DuplicateKeyword(String),

    #[error("unknown keyword '{0}'")]
    UnknownKeyword(String),

    #[error("too many positional arguments (expected at most {0})")]
    TooManyPositional(usize),

    #[error("'{keyword}': expected {expected}, found '{found}'")]
    BadValue {
        keyword: String,
        expected: &'static str,
        found: String,
    },
}

/// Split a configuration string on top-level commas, trimming each
/// piece. Commas inside quotes or parentheses do not split. Empty
/// input yields no arguments.
pub fn split_args(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut cur = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quote = !in_quote;
                cur.push(c);
            }
            '\\' if in_quote => {
                cur.push(c);
                if let Some(next) = chars.next() {
                    cur.push(next);
                }
            }
            '(' if !in_quote => {
                depth += 1;
                cur.push(c);
            }
            ')' if !in_quote && depth > 0 => {
                depth -= 1;
                cur.push(c);
            }
            ',' if !in_quote && depth == 0 => {
                out.push(cur.trim().to_string());
                cur.clear();
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() || !out.is_empty() {
        out.push(cur.trim().to_string());
    }
    out
}

/// Parsed element arguments: positional values and keyword pairs, in
/// declaration order.
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<String>,
    keywords: Vec<(String, String)>,
}

impl Args {
    /// Parse a raw configuration string. An argument is a keyword pair
    /// when it starts with an all-caps word followed by a space;
    /// everything before the first keyword is positional.
    pub fn parse(text: &str) -> Result<Args, ArgError> {
        let mut args = Args::default();
        let mut saw_keyword = false;
        for piece in split_args(text) {
            if piece.is_empty() {
                continue;
            }
            match keyword_split(&piece) {
                Some((kw, value)) => {
                    if args.keywords.iter().any(|(k, _)| k == kw) {
                        return Err(ArgError::DuplicateKeyword(kw.to_string()));
                    }
                    args.keywords.push((kw.to_string(), value.to_string()));
                    saw_keyword = true;
                }
                None if saw_keyword => {
                    // positional after a keyword reads as a bad keyword
                    return Err(ArgError::UnknownKeyword(piece));
                }
                None => args.positional.push(piece),
            }
        }
        Ok(args)
    }

    pub fn positional(&self) -> &[String] {
        &self.positional
    }

    pub fn keyword(&self, name: &str) -> Option<&str> {
        self.keywords
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Reject keywords outside `allowed` and positionals beyond
    /// `max_positional`. Elements call this after pulling what they
    /// understand so typos surface as configure errors.
    pub fn check(&self, max_positional: usize, allowed: &[&str]) -> Result<(), ArgError> {
        if self.positional.len() > max_positional {
            return Err(ArgError::TooManyPositional(max_positional));
        }
        for (k, _) in &self.keywords {
            if !allowed.contains(&k.as_str()) {
                return Err(ArgError::UnknownKeyword(k.clone()));
            }
        }
        Ok(())
    }

    pub fn get_bool(&self, name: &str, default: bool) -> Result<bool, ArgError> {
        match self.keyword(name) {
            None => Ok(default),
            Some(v) => parse_bool(v).ok_or_else(|| bad(name, "a boolean", v)),
        }
    }

    pub fn get_u64(&self, name: &str, default: u64) -> Result<u64, ArgError> {
        match self.keyword(name) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| bad(name, "an unsigned integer", v)),
        }
    }

    pub fn get_i64(&self, name: &str, default: i64) -> Result<i64, ArgError> {
        match self.keyword(name) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| bad(name, "an integer", v)),
        }
    }

    pub fn get_usize(&self, name: &str, default: usize) -> Result<usize, ArgError> {
        match self.keyword(name) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| bad(name, "an unsigned integer", v)),
        }
    }

    pub fn get_duration(&self, name: &str, default: Duration) -> Result<Duration, ArgError> {
        match self.keyword(name) {
            None => Ok(default),
            Some(v) => parse_duration(v).ok_or_else(|| bad(name, "a duration", v)),
        }
    }

    /// Bandwidth in bits per second.
    pub fn get_bandwidth(&self, name: &str, default: u64) -> Result<u64, ArgError> {
        match self.keyword(name) {
            None => Ok(default),
            Some(v) => parse_bandwidth(v).ok_or_else(|| bad(name, "a bandwidth", v)),
        }
    }

    pub fn get_string(&self, name: &str, default: &str) -> String {
        match self.keyword(name) {
            None => default.to_string(),
            Some(v) => unquote(v),
        }
    }
}

fn bad(keyword: &str, expected: &'static str, found: &str) -> ArgError {
    ArgError::BadValue {
        keyword: keyword.to_string(),
        expected,
        found: found.to_string(),
    }
}

fn keyword_split(piece: &str) -> Option<(&str, &str)> {
    let space = piece.find(char::is_whitespace)?;
    let (head, tail) = piece.split_at(space);
    let is_keyword = !head.is_empty()
        && head
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if is_keyword {
        Some((head, tail.trim_start()))
    } else {
        None
    }
}

pub fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "true" | "TRUE" | "1" | "yes" => Some(true),
        "false" | "FALSE" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// `10ms`, `50us`, `2s`, or a bare (possibly fractional) second count.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if let Some(num) = text.strip_suffix("ms") {
        let v: f64 = num.trim().parse().ok()?;
        return duration_from_secs(v / 1e3);
    }
    if let Some(num) = text.strip_suffix("us") {
        let v: f64 = num.trim().parse().ok()?;
        return duration_from_secs(v / 1e6);
    }
    if let Some(num) = text.strip_suffix('s') {
        let v: f64 = num.trim().parse().ok()?;
        return duration_from_secs(v);
    }
    let v: f64 = text.parse().ok()?;
    duration_from_secs(v)
}

fn duration_from_secs(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// `1000kbps`, `8Mbps`, `1Gbps`, or bare bits per second.
pub fn parse_bandwidth(text: &str) -> Option<u64> {
    let text = text.trim();
    let (num, mult) = if let Some(n) = text.strip_suffix("Gbps") {
        (n, 1_000_000_000u64)
    } else if let Some(n) = text.strip_suffix("Mbps") {
        (n, 1_000_000)
    } else if let Some(n) = text.strip_suffix("kbps") {
        (n, 1_000)
    } else if let Some(n) = text.strip_suffix("bps") {
        (n, 1)
    } else {
        (text, 1)
    };
    let v: f64 = num.trim().parse().ok()?;
    if v.is_finite() && v >= 0.0 {
        Some((v * mult as f64) as u64)
    } else {
        None
    }
}

fn unquote(text: &str) -> String {
    let t = text.trim();
    if t.len() >= 2 && t.starts_with('"') && t.ends_with('"') {
        let inner = &t[1..t.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(n) = chars.next() {
                    out.push(n);
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        t.to_string()
    }
}
