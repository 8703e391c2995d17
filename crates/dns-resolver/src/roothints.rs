//! The root-hints loader (component C4): provides the canonical list
//! of root NS/A/AAAA records that bootstrap iterative resolution.
//!
//! The on-disk format is the same ASCII text IANA has published as
//! `named.root` for decades: a "last update" anchor line followed by
//! `<name> <ttl-seconds> <type> <rdata>` record lines for A, AAAA, and
//! NS records.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{NaiveDate, TimeZone, Utc};
use dns_types::protocol::types::{DomainName, RecordClass, RecordTypeWithData, ResourceRecord};

pub const DEFAULT_URL: &str = "https://www.internic.net/domain/named.root";
pub const DEFAULT_PATH: &str = "named.root";

/// A parsed root-hints file: its records, and the anchor date the
/// "last update" line declared (as seconds since the Unix epoch),
/// used to compute each record's absolute expiration.
#[derive(Debug, Clone)]
pub struct RootHints {
    pub records: Vec<ResourceRecord>,
    pub anchor_epoch_seconds: u64,
}

impl RootHints {
    /// Records whose effective absolute expiration (`anchor +
    /// declared_ttl`) is still in the future relative to `now`.
    pub fn unexpired_records(&self, now_epoch_seconds: u64) -> Vec<ResourceRecord> {
        self.records
            .iter()
            .filter(|rr| self.anchor_epoch_seconds.saturating_add(u64::from(rr.ttl)) > now_epoch_seconds)
            .cloned()
            .collect()
    }

    fn is_expired(&self, now_epoch_seconds: u64) -> bool {
        self.records
            .iter()
            .all(|rr| self.anchor_epoch_seconds.saturating_add(u64::from(rr.ttl)) <= now_epoch_seconds)
    }

    /// Whether any record's remaining lifetime (effective expiration
    /// minus `now`) exceeds what fits in 32 bits. A file claiming a
    /// lifetime this long cannot be trusted to be the genuine,
    /// up-to-date hints file.
    fn remaining_lifetime_too_large(&self, now_epoch_seconds: u64) -> bool {
        self.records.iter().any(|rr| {
            let expiration = self.anchor_epoch_seconds.saturating_add(u64::from(rr.ttl));
            expiration.saturating_sub(now_epoch_seconds) > u64::from(u32::MAX)
        })
    }
}

/// Load root hints following the documented policy: try the local
/// file first; if it is missing, unparseable, or expired, fetch fresh
/// content from `url`, write it to `path`, and use that instead.
///
/// # Errors
///
/// If neither the local file nor the URL yields usable root hints.
pub async fn load(path: &Path, url: &str) -> Result<RootHints, RootHintsError> {
    let now = now_epoch_seconds();

    if let Ok(text) = tokio::fs::read_to_string(path).await {
        if let Ok(hints) = parse(&text) {
            if !hints.is_expired(now) && !hints.remaining_lifetime_too_large(now) {
                return Ok(hints);
            }
        }
    }

    let text = fetch(url).await?;
    let hints = parse(&text)?;
    if hints.is_expired(now) {
        return Err(RootHintsError::Expired);
    }
    if hints.remaining_lifetime_too_large(now) {
        return Err(RootHintsError::RemainingLifetimeTooLarge);
    }

    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if let Err(error) = tokio::fs::write(path, &text).await {
        tracing::warn!(?error, path = %path.display(), "could not persist root hints to disk");
    }

    Ok(hints)
}

async fn fetch(url: &str) -> Result<String, RootHintsError> {
    let response = reqwest::get(url)
        .await
        .map_err(|error| RootHintsError::Fetch(error.to_string()))?;
    response
        .text()
        .await
        .map_err(|error| RootHintsError::Fetch(error.to_string()))
}

/// Parse the `named.root` text format: the anchor date from the
/// "last update: <Month> <day>, <year>" line, and A/AAAA/NS record
/// lines, ignoring comments (`;`) and blank lines.
///
/// # Errors
///
/// If no anchor line is found, or a record line's fields are
/// malformed.
pub fn parse(text: &str) -> Result<RootHints, RootHintsError> {
    let mut anchor_epoch_seconds = None;
    let mut records = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = lowercase_find(trimmed, "last update:") {
            anchor_epoch_seconds = Some(parse_anchor_date(rest)?);
            continue;
        }

        if trimmed.starts_with(';') {
            continue;
        }

        if let Some(rr) = parse_record_line(trimmed)? {
            records.push(rr);
        }
    }

    let anchor_epoch_seconds = anchor_epoch_seconds.ok_or(RootHintsError::MissingAnchorDate)?;

    Ok(RootHints {
        records,
        anchor_epoch_seconds,
    })
}

fn lowercase_find<'a>(line: &'a str, needle: &str) -> Option<&'a str> {
    let lower = line.to_ascii_lowercase();
    lower
        .find(needle)
        .map(|idx| line[idx + needle.len()..].trim())
}

/// Parses a date of the form "Month day, year", e.g. "January 3,
/// 2024", into seconds since the Unix epoch at midnight UTC.
fn parse_anchor_date(s: &str) -> Result<u64, RootHintsError> {
    let s = s.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    let parts: Vec<&str> = s.split(|c: char| c == ' ' || c == ',').filter(|p| !p.is_empty()).collect();
    if parts.len() != 3 {
        return Err(RootHintsError::BadAnchorDate(s.to_string()));
    }

    let normalised = format!("{} {} {}", parts[0], parts[1], parts[2]);
    let date = NaiveDate::parse_from_str(&normalised, "%B %d %Y")
        .map_err(|_| RootHintsError::BadAnchorDate(s.to_string()))?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| RootHintsError::BadAnchorDate(s.to_string()))?;

    Ok(Utc.from_utc_datetime(&midnight).timestamp() as u64)
}

fn parse_record_line(line: &str) -> Result<Option<ResourceRecord>, RootHintsError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Ok(None);
    }

    let name = DomainName::from_relative_dotted_string(&DomainName::root_domain(), fields[0])
        .ok_or_else(|| RootHintsError::BadRecordLine(line.to_string()))?;
    let ttl: u32 = fields[1].parse().map_err(|_| RootHintsError::BadRecordLine(line.to_string()))?;
    let rtype = fields[2].to_ascii_uppercase();
    let rdata = fields[3];

    let rtype_with_data = match rtype.as_str() {
        "A" => {
            let address: Ipv4Addr = rdata.parse().map_err(|_| RootHintsError::BadRecordLine(line.to_string()))?;
            RecordTypeWithData::A { address }
        }
        "AAAA" => {
            let address: Ipv6Addr = rdata.parse().map_err(|_| RootHintsError::BadRecordLine(line.to_string()))?;
            RecordTypeWithData::AAAA { address }
        }
        "NS" => {
            let nsdname = DomainName::from_relative_dotted_string(&DomainName::root_domain(), rdata)
                .ok_or_else(|| RootHintsError::BadRecordLine(line.to_string()))?;
            RecordTypeWithData::NS { nsdname }
        }
        _ => return Ok(None),
    };

    Ok(Some(ResourceRecord {
        name,
        rtype_with_data,
        rclass: RecordClass::IN,
        ttl,
    }))
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn default_path() -> PathBuf {
    PathBuf::from(DEFAULT_PATH)
}

/// Convenience for turning a parsed NS/A/AAAA trio into socket
/// addresses the query engine can dial directly, resolving each NS's
/// hostname against the A/AAAA glue in the same file.
pub fn root_addresses(hints: &RootHints) -> Vec<IpAddr> {
    hints
        .records
        .iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::A { address } => Some(IpAddr::V4(*address)),
            RecordTypeWithData::AAAA { address } => Some(IpAddr::V6(*address)),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RootHintsError {
    MissingAnchorDate,
    BadAnchorDate(String),
    BadRecordLine(String),
    Expired,
    RemainingLifetimeTooLarge,
    Fetch(String),
}

impl std::fmt::Display for RootHintsError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RootHintsError::MissingAnchorDate => write!(f, "no 'last update' line found"),
            RootHintsError::BadAnchorDate(s) => write!(f, "could not parse anchor date '{s}'"),
            RootHintsError::BadRecordLine(s) => write!(f, "could not parse record line '{s}'"),
            RootHintsError::Expired => write!(f, "root hints file is expired"),
            RootHintsError::RemainingLifetimeTooLarge => {
                write!(f, "a record's remaining lifetime exceeds 2^32-1 seconds")
            }
            RootHintsError::Fetch(msg) => write!(f, "could not fetch root hints: {msg}"),
        }
    }
}

impl std::error::Error for RootHintsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
; formerly NS.INTERNIC.NET
;       last update:     January  3, 2024
;       related version of root zone:     2024010300
;
.                        3600000      NS    A.ROOT-SERVERS.NET.
A.ROOT-SERVERS.NET.      3600000      A     198.41.0.4
A.ROOT-SERVERS.NET.      3600000      AAAA  2001:503:ba3e::2:30
";

    #[test]
    fn parses_anchor_date_and_records() {
        let hints = parse(SAMPLE).unwrap();
        assert_eq!(3, hints.records.len());
        assert!(hints.anchor_epoch_seconds > 0);
    }

    #[test]
    fn rejects_missing_anchor() {
        assert_eq!(
            Err(RootHintsError::MissingAnchorDate),
            parse(".                3600000      NS    A.ROOT-SERVERS.NET.\n")
        );
    }

    #[test]
    fn unexpired_records_filters_by_anchor_plus_ttl() {
        let hints = parse(SAMPLE).unwrap();
        let far_future = hints.anchor_epoch_seconds + 10 * 3600000;
        assert!(hints.unexpired_records(far_future).is_empty());
        assert_eq!(3, hints.unexpired_records(hints.anchor_epoch_seconds + 1).len());
    }

    #[test]
    fn remaining_lifetime_too_large_flags_distant_expiration() {
        let hints = parse(SAMPLE).unwrap();
        assert!(!hints.remaining_lifetime_too_large(hints.anchor_epoch_seconds));

        // The sample's TTLs are 3_600_000 seconds; pretend `now` is far
        // enough before the anchor that the remaining lifetime blows
        // past u32::MAX.
        let now = hints.anchor_epoch_seconds.saturating_sub(u64::from(u32::MAX));
        assert!(hints.remaining_lifetime_too_large(now));
    }

    #[test]
    fn parse_anchor_date_matches_known_epoch() {
        assert_eq!(0, parse_anchor_date("January 1, 1970").unwrap());
        // 2024-01-03 is 19724 days after the epoch.
        assert_eq!(19724 * 86400, parse_anchor_date("January 3, 2024").unwrap());
    }
}
