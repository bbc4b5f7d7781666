//! Version policy: stability, ordering, filter expressions and latest selection.
//!
//! Filter syntax accepted by [`VersionFilter::parse`]:
//!
//! | expression      | meaning                                          |
//! |-----------------|--------------------------------------------------|
//! | `latest:N`      | the N highest versions                           |
//! | `1.9.`, `1.9.x` | prefix match                                     |
//! | `>=1.5.0`       | comparison (`>=`, `>`, `<=`, `<`)                |
//! | `1.13, 1.14.2`  | union of tokens, each prefix-first then exact    |
//! | `1.9`           | prefix `1.9.` if anything matches, else exact    |

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::model::MirrorVersion;

/// True when the version has neither a pre-release nor a build suffix.
pub fn is_stable(version: &str) -> bool {
    let v = version.strip_prefix('v').unwrap_or(version);
    !v.contains('-') && !v.contains('+')
}

/// Parse as strict semver, tolerating a leading `v`.
pub fn parse_semver(version: &str) -> Option<semver::Version> {
    let v = version.strip_prefix('v').unwrap_or(version);
    semver::Version::parse(v).ok()
}

/// Order two version strings.
///
/// Uses full semver precedence when both sides parse; otherwise falls back to
/// comparing the numeric `major.minor.patch` core with suffixes ignored.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_semver(a), parse_semver(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => numeric_core(a).cmp(&numeric_core(b)),
    }
}

fn numeric_core(version: &str) -> [u64; 3] {
    let v = version.strip_prefix('v').unwrap_or(version);
    let v = v.find(['-', '+']).map_or(v, |idx| &v[..idx]);
    let mut out = [0u64; 3];
    for (slot, part) in out.iter_mut().zip(v.splitn(4, '.')) {
        *slot = part
            .chars()
            .filter(char::is_ascii_digit)
            .fold(0u64, |n, c| {
                n.saturating_mul(10)
                    .saturating_add(u64::from(c.to_digit(10).unwrap_or(0)))
            });
    }
    out
}

/// Comparison operator of a constraint filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `>=`
    Ge,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `<`
    Lt,
}

impl Comparison {
    fn admits(self, ord: Ordering) -> bool {
        match self {
            Self::Ge => ord != Ordering::Less,
            Self::Gt => ord == Ordering::Greater,
            Self::Le => ord != Ordering::Greater,
            Self::Lt => ord == Ordering::Less,
        }
    }
}

/// Parsed version filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionFilter {
    /// No filter, or an unusable `latest:N`.
    All,
    /// Keep the N highest versions.
    Latest(usize),
    /// Keep versions starting with the prefix.
    Prefix(String),
    /// Keep versions satisfying `version <op> target`.
    Constraint(Comparison, String),
    /// Union of single-token matches.
    Tokens(Vec<String>),
}

impl VersionFilter {
    /// Parse an optional filter expression. Never fails: a malformed
    /// `latest:N` keeps everything.
    pub fn parse(expr: Option<&str>) -> Self {
        let Some(expr) = expr.map(str::trim).filter(|e| !e.is_empty()) else {
            return Self::All;
        };

        if let Some(count) = expr.strip_prefix("latest:") {
            return match count.trim().parse::<usize>() {
                Ok(n) if n > 0 => Self::Latest(n),
                _ => Self::All,
            };
        }

        if expr.ends_with('.') || expr.ends_with(".x") {
            return Self::Prefix(expr.trim_end_matches('x').to_string());
        }

        for (token, op) in [
            (">=", Comparison::Ge),
            ("<=", Comparison::Le),
            (">", Comparison::Gt),
            ("<", Comparison::Lt),
        ] {
            if let Some(target) = expr.strip_prefix(token) {
                return Self::Constraint(op, target.trim().to_string());
            }
        }

        Self::Tokens(
            expr.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Apply the filter, keeping input order except for `Latest`, which
    /// returns the highest versions first.
    pub fn apply<T, F>(&self, items: Vec<T>, version_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        match self {
            Self::All => items,
            Self::Latest(n) => {
                let mut sorted = items;
                sorted.sort_by(|a, b| compare_versions(version_of(b), version_of(a)));
                sorted.truncate(*n);
                sorted
            }
            Self::Prefix(prefix) => items
                .into_iter()
                .filter(|i| version_of(i).starts_with(prefix.as_str()))
                .collect(),
            Self::Constraint(op, target) => items
                .into_iter()
                .filter(|i| op.admits(compare_versions(version_of(i), target)))
                .collect(),
            Self::Tokens(tokens) => {
                let mut keep: HashSet<String> = HashSet::new();
                for token in tokens {
                    keep.extend(match_token(&items, &version_of, token));
                }
                items
                    .into_iter()
                    .filter(|i| keep.contains(version_of(i)))
                    .collect()
            }
        }
    }
}

// A bare token is a prefix when it matches anything as `token.`, else exact.
fn match_token<T, F>(items: &[T], version_of: &F, token: &str) -> Vec<String>
where
    F: Fn(&T) -> &str,
{
    let versions = items.iter().map(version_of);
    if token.ends_with('.') || token.ends_with(".x") {
        let prefix = token.trim_end_matches('x');
        return versions
            .filter(|v| v.starts_with(prefix))
            .map(str::to_string)
            .collect();
    }
    let dotted = format!("{token}.");
    let by_prefix: Vec<String> = items
        .iter()
        .map(version_of)
        .filter(|v| v.starts_with(&dotted))
        .map(str::to_string)
        .collect();
    if !by_prefix.is_empty() {
        return by_prefix;
    }
    versions.filter(|v| *v == token).map(str::to_string).collect()
}

/// Pick the version that should carry `is_latest`.
///
/// Candidates are stable, non-deprecated and semver-parseable; the highest
/// semver wins and equal versions fall back to the most recent release date.
pub fn select_latest<'a, I>(versions: I) -> Option<&'a MirrorVersion>
where
    I: IntoIterator<Item = &'a MirrorVersion>,
{
    versions
        .into_iter()
        .filter(|v| is_stable(&v.version) && !v.is_deprecated)
        .filter_map(|v| parse_semver(&v.version).map(|sv| (sv, v)))
        .max_by(|(a_sv, a), (b_sv, b)| {
            a_sv.cmp(b_sv)
                .then_with(|| a.release_date.cmp(&b.release_date))
        })
        .map(|(_, v)| v)
}
