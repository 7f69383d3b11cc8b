//! Plugin version ordering
//!
//! Versions look like `[epoch:]token.token...[-release]`. Tokens are compared
//! pairwise: two numeric tokens numerically, a numeric token above an
//! alphabetic one, two alphabetic tokens lexicographically. On a common
//! prefix the version with more tokens wins.
//!
//! Versions fall into three ranks: absent or empty, then versions whose
//! epoch or release does not parse (ordered as plain strings), then
//! everything that parses. Mixing string and structured comparison across
//! ranks would not be transitive.

use std::cmp::Ordering;

struct ParsedVersion<'a> {
    epoch: u64,
    tokens: Vec<&'a str>,
    release: u64,
}

fn parse(raw: &str) -> Option<ParsedVersion<'_>> {
    let (epoch, rest) = match raw.split_once(':') {
        Some((epoch, rest)) => (epoch.parse().ok()?, rest),
        None => (0, raw),
    };
    let (rest, release) = match rest.rsplit_once('-') {
        Some((rest, release)) => (rest, release.parse().ok()?),
        None => (rest, 0),
    };
    Some(ParsedVersion {
        epoch,
        tokens: rest.split('.').collect(),
        release,
    })
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

/// Numeric comparison on digit strings of any length
fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn compare_tokens(a: &str, b: &str) -> Ordering {
    match (is_numeric(a), is_numeric(b)) {
        (true, true) => compare_numeric(a, b),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// Total order over optional version strings
pub fn compare_versions(a: Option<&str>, b: Option<&str>) -> Ordering {
    let a = a.map(str::trim).filter(|v| !v.is_empty());
    let b = b.map(str::trim).filter(|v| !v.is_empty());

    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(a), Some(b)) => (a, b),
    };
    if a == b {
        return Ordering::Equal;
    }

    let (pa, pb) = match (parse(a), parse(b)) {
        (Some(pa), Some(pb)) => (pa, pb),
        (None, None) => return a.cmp(b),
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
    };

    pa.epoch
        .cmp(&pb.epoch)
        .then_with(|| {
            pa.tokens
                .iter()
                .zip(&pb.tokens)
                .map(|(ta, tb)| compare_tokens(ta, tb))
                .find(|ord| ord.is_ne())
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| pa.tokens.len().cmp(&pb.tokens.len()))
        .then_with(|| pa.release.cmp(&pb.release))
}

/// `true` when `a` sorts strictly before `b`
pub fn version_less_than(a: Option<&str>, b: Option<&str>) -> bool {
    compare_versions(a, b) == Ordering::Less
}
