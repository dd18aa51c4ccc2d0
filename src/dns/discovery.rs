//! Registry discovery records
//!
//! A trust root can advertise its registry endpoint in DNS:
//! `_nap-registry.<trust_root>  TXT  "v=nap1 url=<https-url>"`.
//! The first record matching the format wins; admission control on top of the
//! discovered URL is the resolver's job, not this parser's.

use std::sync::Arc;

use tracing::debug;

use crate::errors::Result;

use super::TxtLookup;

pub const DISCOVERY_LABEL: &str = "_nap-registry";
pub const DISCOVERY_VERSION: &str = "v=nap1";

/// Parse one TXT string of the form `v=nap1 url=<https-url>`.
pub fn parse_discovery_record(record: &str) -> Option<String> {
    let mut tokens = record.split_whitespace();
    if tokens.next() != Some(DISCOVERY_VERSION) {
        return None;
    }
    let url = tokens.find_map(|t| t.strip_prefix("url="))?;
    if !url.starts_with("https://") {
        return None;
    }
    Some(url.to_string())
}

/// Look up the discovery record for a trust root; `None` when the domain
/// publishes nothing usable.
pub async fn discover_registry_url(
    lookup: &Arc<dyn TxtLookup>,
    trust_root: &str,
) -> Result<Option<String>> {
    let name = format!("{DISCOVERY_LABEL}.{trust_root}");
    let records = lookup.lookup_txt(&name).await?;
    let url = records.iter().find_map(|r| parse_discovery_record(r));
    debug!(trust_root, found = url.is_some(), "registry discovery lookup");
    Ok(url)
}
