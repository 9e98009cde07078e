//! Core domain model, listing normalizer and verdict engine for Okazje.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "okazje-core";

/// Longest description we carry forward; marketplace pages can be huge.
const DESCRIPTION_CAP: usize = 1000;

/// Confidence floor below which an "original" label is not trusted for a buy.
pub const BUY_CONFIDENCE_FLOOR: f64 = 0.7;

/// Closed set of supported marketplaces plus manually pasted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Olx,
    Vinted,
    Allegro,
    Sprzedajemy,
    Gratka,
    Manual,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Olx => "olx",
            Platform::Vinted => "vinted",
            Platform::Allegro => "allegro",
            Platform::Sprzedajemy => "sprzedajemy",
            Platform::Gratka => "gratka",
            Platform::Manual => "manual",
        }
    }

    /// Sniff the platform from a listing URL host. Unknown hosts get no tag.
    pub fn from_url(url: &str) -> Option<Platform> {
        let host = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_start_matches("www.")
            .split('/')
            .next()?;
        if host.ends_with("olx.pl") {
            Some(Platform::Olx)
        } else if host.ends_with("vinted.pl") {
            Some(Platform::Vinted)
        } else if host.ends_with("allegro.pl") || host.ends_with("allegrolokalnie.pl") {
            Some(Platform::Allegro)
        } else if host.ends_with("sprzedajemy.pl") {
            Some(Platform::Sprzedajemy)
        } else if host.ends_with("gratka.pl") {
            Some(Platform::Gratka)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque fetched content handed to an adapter. Owned by the fetch that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDocument {
    pub body: String,
    pub url: Option<String>,
    pub platform: Platform,
    pub fetched_at: DateTime<Utc>,
}

/// Adapter handoff: whatever the marketplace page yielded, fields absent when
/// the page does not carry them. Never a guessed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialListing {
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub condition_text: String,
    pub seller_text: String,
    pub description: String,
    pub photo_count: u32,
    pub url: Option<String>,
}

/// Canonical listing record, immutable once built by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalListing {
    pub id: String,
    pub platform: Platform,
    pub url: Option<String>,
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub condition_text: String,
    pub seller_text: String,
    pub description: String,
    pub photo_count: u32,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticityLabel {
    Original,
    Replica,
    Uncertain,
}

/// Externally produced valuation consumed by the verdict engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub authenticity: AuthenticityLabel,
    pub estimated_market_value: f64,
    pub confidence: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Buy,
    Negotiate,
    Investigate,
    Skip,
}

impl Verdict {
    /// Interface-layer emoji for each verdict; the decision table in
    /// [`evaluate`] is the single source of truth feeding this mapping.
    pub fn emoji(&self) -> &'static str {
        match self {
            Verdict::Buy => "🟢",
            Verdict::Negotiate => "🟡",
            Verdict::Investigate => "🟠",
            Verdict::Skip => "❌",
        }
    }
}

/// Derived recommendation; never mutates the listing it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictResult {
    pub verdict: Verdict,
    pub margin_percent: f64,
    pub reasons: Vec<String>,
}

/// Numeric purchase policy, validated at startup by the scan config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnginePolicy {
    pub max_price: f64,
    pub min_margin_percent: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("title empty after trim")]
    EmptyTitle,
    #[error("price text missing")]
    MissingPrice,
    #[error("unparseable price: {0:?}")]
    Price(String),
    #[error("non-positive price: {0}")]
    NonPositivePrice(f64),
}

#[derive(Debug, Error, PartialEq)]
pub enum EvaluateError {
    #[error("listing price {0} is not positive")]
    InvalidListing(f64),
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Collapse whitespace runs and trim.
fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip a URL down to a stable `host/path` key: no scheme, no query string,
/// no fragment, no trailing slash. Tracking-parameter variants of the same
/// listing collapse to one key.
pub fn normalize_url_path(url: &str) -> String {
    let without_scheme = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.");
    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme);
    without_query.trim_end_matches('/').to_string()
}

/// Stable listing identity. URL-backed listings key on platform + normalized
/// path; manual text keys on a content hash of title+price+description, so
/// identical pastes dedup while edited text becomes a new entry.
pub fn derive_listing_id(
    platform: Platform,
    url: Option<&str>,
    title: &str,
    price: f64,
    description: &str,
) -> String {
    let digest = match url {
        Some(url) => sha256_hex(format!("{}:{}", platform, normalize_url_path(url)).as_bytes()),
        None => sha256_hex(format!("{title}\n{price:.2}\n{description}").as_bytes()),
    };
    digest[..16].to_string()
}

/// Digit groups of a numeric token, each with the separator that preceded it.
pub fn price_tokens(run: &str) -> Vec<(Option<char>, String)> {
    let mut tokens: Vec<(Option<char>, String)> = Vec::new();
    let mut pending_sep: Option<char> = None;
    let mut chars = run.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '0'..='9' => match tokens.last_mut() {
                Some((_, digits)) if pending_sep.is_none() => digits.push(ch),
                _ => {
                    tokens.push((pending_sep.take(), ch.to_string()));
                }
            },
            ' ' | '\u{a0}' | '.' | ',' if !tokens.is_empty() => {
                // A separator counts only when digits follow directly.
                if pending_sep.is_some() || !matches!(chars.peek(), Some('0'..='9')) {
                    break;
                }
                pending_sep = Some(if ch == '\u{a0}' { ' ' } else { ch });
            }
            _ if tokens.is_empty() => {}
            _ => break,
        }
    }
    tokens
}

/// Parse a locale-formatted price string ("1 299,00 zł", "1.299,00", "349.99",
/// "450 PLN") into a non-negative number. A decimal comma always means a
/// fraction; a dot means a fraction unless it joins three-digit thousands
/// groups. Returns `None` when no parseable number is present or the
/// grouping is malformed; never fabricates a value from a partial read.
pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned = text.to_lowercase().replace("zł", " ").replace("pln", " ");
    let start = cleaned.find(|c: char| c.is_ascii_digit())?;
    let mut tokens = price_tokens(&cleaned[start..]);
    if tokens.is_empty() {
        return None;
    }

    let decimal = match tokens.last() {
        Some((Some(','), digits)) => Some(digits.clone()),
        Some((Some('.'), digits)) if digits.len() <= 2 => Some(digits.clone()),
        _ => None,
    };
    if decimal.is_some() {
        tokens.pop();
    }

    // Integer part: the leading group joined with exact three-digit
    // thousands groups. "1 29,00" is malformed, not 1.00.
    let mut integer = tokens[0].1.clone();
    for (_, digits) in &tokens[1..] {
        if digits.len() != 3 {
            return None;
        }
        integer.push_str(digits);
    }

    let number = match decimal {
        Some(frac) => format!("{integer}.{frac}"),
        None => integer,
    };
    number.parse::<f64>().ok().filter(|v| *v >= 0.0)
}

/// Merge adapter output into a canonical listing, rejecting incomplete input.
pub fn normalize(
    platform: Platform,
    url: Option<&str>,
    partial: &PartialListing,
    fetched_at: DateTime<Utc>,
) -> Result<CanonicalListing, NormalizeError> {
    let title = partial
        .title
        .as_deref()
        .map(normalize_whitespace)
        .unwrap_or_default();
    if title.is_empty() {
        return Err(NormalizeError::EmptyTitle);
    }

    let price_text = partial
        .price_text
        .as_deref()
        .ok_or(NormalizeError::MissingPrice)?;
    let price = parse_price(price_text)
        .ok_or_else(|| NormalizeError::Price(price_text.to_string()))?;
    if price <= 0.0 {
        return Err(NormalizeError::NonPositivePrice(price));
    }

    let url = url.or(partial.url.as_deref()).map(str::to_string);
    let mut description = normalize_whitespace(&partial.description);
    if description.len() > DESCRIPTION_CAP {
        let mut cut = DESCRIPTION_CAP;
        while !description.is_char_boundary(cut) {
            cut -= 1;
        }
        description.truncate(cut);
    }

    let id = derive_listing_id(platform, url.as_deref(), &title, price, &description);

    Ok(CanonicalListing {
        id,
        platform,
        url,
        title,
        price,
        currency: "PLN".to_string(),
        condition_text: normalize_whitespace(&partial.condition_text),
        seller_text: normalize_whitespace(&partial.seller_text),
        description,
        photo_count: partial.photo_count,
        fetched_at,
    })
}

/// Margin between estimated resale value and asking price. Defined only for
/// positive prices; callers hold that invariant via [`normalize`].
pub fn margin_percent(price: f64, market_value: f64) -> f64 {
    (market_value - price) / price * 100.0
}

/// Verdict decision table, evaluated top to bottom, first match wins.
/// Total over label x margin x confidence x price cap; every result carries
/// at least one reason.
pub fn evaluate(
    listing: &CanonicalListing,
    assessment: &Assessment,
    policy: &EnginePolicy,
) -> Result<VerdictResult, EvaluateError> {
    if listing.price <= 0.0 {
        return Err(EvaluateError::InvalidListing(listing.price));
    }
    let margin = margin_percent(listing.price, assessment.estimated_market_value);

    if assessment.authenticity == AuthenticityLabel::Replica {
        return Ok(VerdictResult {
            verdict: Verdict::Skip,
            margin_percent: margin,
            reasons: vec!["identified as replica".to_string()],
        });
    }

    if listing.price > policy.max_price {
        return Ok(VerdictResult {
            verdict: Verdict::Skip,
            margin_percent: margin,
            reasons: vec!["exceeds maximum purchase price".to_string()],
        });
    }

    if margin >= policy.min_margin_percent {
        if assessment.authenticity == AuthenticityLabel::Original
            && assessment.confidence >= BUY_CONFIDENCE_FLOOR
        {
            return Ok(VerdictResult {
                verdict: Verdict::Buy,
                margin_percent: margin,
                reasons: vec![format!(
                    "margin {margin:.0}% meets threshold with verified original"
                )],
            });
        }
        return Ok(VerdictResult {
            verdict: Verdict::Negotiate,
            margin_percent: margin,
            reasons: vec!["positive margin but unverified / price negotiable".to_string()],
        });
    }

    if assessment.authenticity == AuthenticityLabel::Uncertain {
        return Ok(VerdictResult {
            verdict: Verdict::Investigate,
            margin_percent: margin,
            reasons: vec!["authenticity unclear".to_string()],
        });
    }

    Ok(VerdictResult {
        verdict: Verdict::Skip,
        margin_percent: margin,
        reasons: vec!["insufficient margin".to_string()],
    })
}
