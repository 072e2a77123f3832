//! Ordered pattern strategies for responses whose format varies between
//! firmware revisions.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// One way of reading a response.
pub struct Strategy<T> {
    pub name: &'static str,
    pub regex: &'static LazyLock<Regex>,
    pub extract: fn(&Captures<'_>) -> Option<T>,
}

/// Declares a [`Strategy`] with its own lazily compiled regex.
macro_rules! strategy {
    ($name:literal, $pattern:literal, $extract:expr) => {{
        static RE: ::std::sync::LazyLock<::regex::Regex> =
            ::std::sync::LazyLock::new(|| ::regex::Regex::new($pattern).unwrap());
        $crate::parse::Strategy {
            name: $name,
            regex: &RE,
            extract: $extract,
        }
    }};
}
pub(crate) use strategy;

/// Applies `strategies` in order. The first one whose regex matches and
/// whose extractor accepts the captures wins.
pub fn first_match<T>(strategies: &[Strategy<T>], text: &str) -> Option<(&'static str, T)> {
    strategies.iter().find_map(|strategy| {
        let captures = strategy.regex.captures(text)?;
        (strategy.extract)(&captures).map(|value| (strategy.name, value))
    })
}

/// Parses capture group `i`.
pub fn group<T: std::str::FromStr>(captures: &Captures<'_>, i: usize) -> Option<T> {
    captures.get(i)?.as_str().trim().parse().ok()
}

/// Splits a comma separated field list, keeping commas inside double quotes
/// and stripping the quotes.
pub fn split_quoted_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(current.trim().to_owned());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_owned());
    fields
}
