//! Parsing of CoRE link-format listings returned by the resource directory.

use indexmap::IndexSet;
use thiserror::Error;
use tracing::warn;

use crate::state::player::PlayerIdentity;

const COAP_SCHEME: &str = "coap://";

/// Why a single directory entry could not be turned into an identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkFormatError {
    /// The entry has no `<...>` target.
    #[error("entry has no link target")]
    MissingTarget,
    /// The entry's `base` attribute or target is not a `coap://host/...` URI.
    #[error("`{0}` is not a coap URI with a host")]
    NotCoapUri(String),
}

/// Extract the unique endpoint hosts listed in a directory `payload`, in listing order.
///
/// Malformed entries are skipped with a warning; an empty payload yields an empty set.
pub fn parse_endpoints(payload: &str) -> IndexSet<PlayerIdentity> {
    let mut endpoints = IndexSet::new();
    for entry in split_entries(payload) {
        match parse_entry(entry) {
            Ok(identity) => {
                endpoints.insert(identity);
            }
            Err(err) => warn!(entry = %entry, error = %err, "skipping malformed directory entry"),
        }
    }
    endpoints
}

/// Host of one link-format entry; the `base` attribute wins over the target URI.
pub fn parse_entry(entry: &str) -> Result<PlayerIdentity, LinkFormatError> {
    if let Some(base) = attribute(entry, "base") {
        return host_of(base);
    }

    let target = entry
        .trim()
        .strip_prefix('<')
        .and_then(|rest| rest.split_once('>'))
        .map(|(target, _)| target)
        .ok_or(LinkFormatError::MissingTarget)?;
    host_of(target)
}

/// Split on commas that are outside quoted strings and link targets.
fn split_entries(payload: &str) -> impl Iterator<Item = &str> {
    let mut entries = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut in_target = false;
    for (index, ch) in payload.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_target = true,
            '>' if !in_quotes => in_target = false,
            ',' if !in_quotes && !in_target => {
                entries.push(&payload[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    entries.push(&payload[start..]);
    entries
        .into_iter()
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
}

/// Value of `name="..."` (or unquoted `name=...`) among the entry's `;` parameters.
fn attribute<'a>(entry: &'a str, name: &str) -> Option<&'a str> {
    entry.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        (key.trim() == name).then(|| value.trim().trim_matches('"'))
    })
}

fn host_of(uri: &str) -> Result<PlayerIdentity, LinkFormatError> {
    let rest = uri
        .strip_prefix(COAP_SCHEME)
        .ok_or_else(|| LinkFormatError::NotCoapUri(uri.to_owned()))?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(LinkFormatError::NotCoapUri(uri.to_owned()));
    }
    Ok(host.to_owned())
}
