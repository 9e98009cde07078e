//! Per-marketplace source adapters: pure transforms from fetched documents
//! into partial listings. No network calls live here.

use std::collections::HashSet;

use okazje_core::{PartialListing, Platform, RawDocument};
use scraper::{Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "okazje-adapters";

/// Search pages yield at most this many hits per keyword.
const SEARCH_HIT_CAP: usize = 20;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("required field not located: {0}")]
    MissingField(&'static str),
    #[error("document platform {got} does not match adapter {expected}")]
    PlatformMismatch { expected: Platform, got: Platform },
    #[error("platform {0} has no keyword search endpoint")]
    SearchUnsupported(Platform),
    #[error("invalid selector: {0}")]
    Selector(String),
}

/// Shared parse capability over a fixed platform. Adapters tolerate missing
/// optional fields but fail outright when title or price cannot be located:
/// a fabricated price would corrupt valuation downstream.
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Extract a single listing from its detail page or pasted text.
    fn parse(&self, doc: &RawDocument) -> Result<PartialListing, ParseError>;

    /// Keyword search URL, `None` for platforms without a crawlable search.
    fn search_url(&self, _keyword: &str) -> Option<String> {
        None
    }

    /// Extract listing snippets from a keyword search results page.
    fn parse_search(&self, _doc: &RawDocument) -> Result<Vec<PartialListing>, ParseError> {
        Err(ParseError::SearchUnsupported(self.platform()))
    }
}

fn check_platform(adapter: Platform, doc: &RawDocument) -> Result<(), ParseError> {
    if doc.platform != adapter {
        return Err(ParseError::PlatformMismatch {
            expected: adapter,
            got: doc.platform,
        });
    }
    Ok(())
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" "))))
}

fn body_text(document: &Html) -> String {
    document
        .root_element()
        .text()
        .filter_map(|t| text_or_none(t.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// First "<number> zł" occurrence in free text, returned still as text so the
/// normalizer owns the numeric parse. Never invents a value. The number is
/// trimmed back to the well-formed token nearest "zł" so unrelated digits
/// earlier in the snippet ("nr 14 45 zł") do not leak into the price.
pub fn price_snippet(text: &str) -> Option<String> {
    for (idx, _) in text.match_indices("zł") {
        let prefix = &text[..idx];
        let run: String = prefix
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit() || matches!(c, ' ' | '\u{a0}' | ',' | '.'))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if let Some(number) = trailing_number(&run) {
            return Some(format!("{number} zł"));
        }
    }
    None
}

/// Longest well-formed grouped number ending the run: a leading group, then
/// three-digit thousands groups, then an optional decimal tail.
fn trailing_number(run: &str) -> Option<String> {
    let segment = last_clean_segment(run.trim_matches(|c: char| !c.is_ascii_digit()));
    let tokens = okazje_core::price_tokens(segment);
    if tokens.is_empty() {
        return None;
    }

    let decimal = match tokens.last() {
        Some((Some(sep @ ','), digits)) => Some(format!("{sep}{digits}")),
        Some((Some(sep @ '.'), digits)) if digits.len() <= 2 => Some(format!("{sep}{digits}")),
        _ => None,
    };
    let int_end = tokens.len() - usize::from(decimal.is_some());

    let mut start = int_end - 1;
    while start > 0
        && tokens[start].1.len() == 3
        && matches!(tokens[start].0, Some(' ') | Some('.'))
    {
        start -= 1;
    }

    let mut number = String::new();
    for (sep, digits) in &tokens[start..int_end] {
        if !number.is_empty() {
            if let Some(sep) = sep {
                number.push(*sep);
            }
        }
        number.push_str(digits);
    }
    if let Some(decimal) = decimal {
        number.push_str(&decimal);
    }
    Some(number)
}

/// Digits separated by two or more separator characters are distinct tokens;
/// keep only the last one.
fn last_clean_segment(run: &str) -> &str {
    let mut cut = 0usize;
    let mut prev_sep = false;
    for (idx, ch) in run.char_indices() {
        let sep = !ch.is_ascii_digit();
        if sep && prev_sep {
            cut = idx + ch.len_utf8();
        }
        prev_sep = sep;
    }
    run[cut..].trim_matches(|c: char| !c.is_ascii_digit())
}

fn title_from_heading(document: &Html) -> Result<Option<String>, ParseError> {
    match select_first_text(document, "h1")? {
        Some(t) => Ok(Some(t)),
        None => select_first_text(document, "title"),
    }
}

fn condition_keywords(body: &str) -> String {
    let lower = body.to_lowercase();
    if lower.contains("nowe") {
        "nowe".to_string()
    } else if lower.contains("używane") {
        "używane".to_string()
    } else {
        String::new()
    }
}

struct SprzedajemyAdapter;
struct GratkaAdapter;
struct OlxAdapter;
struct AllegroAdapter;
struct VintedAdapter;
struct ManualAdapter;

impl SourceAdapter for SprzedajemyAdapter {
    fn platform(&self) -> Platform {
        Platform::Sprzedajemy
    }

    fn parse(&self, doc: &RawDocument) -> Result<PartialListing, ParseError> {
        check_platform(self.platform(), doc)?;
        let document = Html::parse_document(&doc.body);
        let body = body_text(&document);

        let title = title_from_heading(&document)?.ok_or(ParseError::MissingField("title"))?;
        let price_text = select_first_text(&document, r#"span[class*="price"]"#)?
            .filter(|t| t.chars().any(|c| c.is_ascii_digit()))
            .or_else(|| price_snippet(&body))
            .ok_or(ParseError::MissingField("price"))?;

        let desc_sel = selector(r#"div[class*="desc"], div[class*="opis"], div[class*="content"]"#)?;
        let mut description = document
            .select(&desc_sel)
            .take(3)
            .filter_map(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
            .collect::<Vec<_>>()
            .join("\n");
        if description.is_empty() {
            // Fallback: the listing body usually opens with one of these.
            for marker in ["Polecam", "Sprzedam", "Oferuję", "Zapraszam", "Stan:"] {
                if let Some(idx) = body.find(marker) {
                    description = body[idx..].chars().take(500).collect();
                    break;
                }
            }
        }
        if description.is_empty() {
            description = body.chars().take(500).collect();
        }

        let seller_text =
            select_first_text(&document, r#"[class*="user"]"#)?.unwrap_or_default();
        let thumb_sel = selector(r#"img[src*="thumbs"]"#)?;
        let photo_count = document.select(&thumb_sel).count() as u32;

        Ok(PartialListing {
            title: Some(title),
            price_text: Some(price_text),
            condition_text: condition_keywords(&body),
            seller_text,
            description,
            photo_count,
            url: doc.url.clone(),
        })
    }

    fn search_url(&self, keyword: &str) -> Option<String> {
        Some(format!(
            "https://sprzedajemy.pl/szukaj?inp_text={}",
            keyword.replace(' ', "+")
        ))
    }

    fn parse_search(&self, doc: &RawDocument) -> Result<Vec<PartialListing>, ParseError> {
        check_platform(self.platform(), doc)?;
        let document = Html::parse_document(&doc.body);
        let anchor_sel = selector("a[href]")?;

        let mut seen_hrefs = HashSet::new();
        let mut hits = Vec::new();
        for anchor in document.select(&anchor_sel) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            // Listing detail links end in "-nr<digits>".
            if !has_nr_suffix(href) || !seen_hrefs.insert(href.to_string()) {
                continue;
            }
            let full_url = if href.starts_with('/') {
                format!("https://sprzedajemy.pl{href}")
            } else {
                href.to_string()
            };

            let text = anchor.text().collect::<Vec<_>>().join(" ");
            let title: String = text.trim().chars().take(100).collect();
            if title.chars().count() < 3 {
                continue;
            }

            hits.push(PartialListing {
                title: Some(title),
                price_text: price_snippet(&text),
                url: Some(full_url),
                ..PartialListing::default()
            });
            if hits.len() >= SEARCH_HIT_CAP {
                break;
            }
        }
        Ok(hits)
    }
}

fn has_nr_suffix(href: &str) -> bool {
    match href.rfind("-nr") {
        Some(idx) => {
            let tail = &href[idx + 3..];
            !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

impl SourceAdapter for GratkaAdapter {
    fn platform(&self) -> Platform {
        Platform::Gratka
    }

    fn parse(&self, doc: &RawDocument) -> Result<PartialListing, ParseError> {
        check_platform(self.platform(), doc)?;
        let document = Html::parse_document(&doc.body);
        let body = body_text(&document);

        let title = title_from_heading(&document)?.ok_or(ParseError::MissingField("title"))?;
        let price_text = price_snippet(&body).ok_or(ParseError::MissingField("price"))?;

        Ok(PartialListing {
            title: Some(title),
            price_text: Some(price_text),
            condition_text: condition_keywords(&body),
            description: body,
            url: doc.url.clone(),
            ..PartialListing::default()
        })
    }

    fn search_url(&self, keyword: &str) -> Option<String> {
        Some(format!(
            "https://gratka.pl/szukaj?q={}",
            keyword.replace(' ', "+")
        ))
    }

    fn parse_search(&self, doc: &RawDocument) -> Result<Vec<PartialListing>, ParseError> {
        check_platform(self.platform(), doc)?;
        let document = Html::parse_document(&doc.body);
        let anchor_sel = selector("a[href]")?;

        let mut seen_hrefs = HashSet::new();
        let mut hits = Vec::new();
        for anchor in document.select(&anchor_sel) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let is_listing = (href.contains("gratka.pl/") || href.starts_with('/'))
                && href.chars().any(|c| c.is_ascii_digit());
            if !is_listing || !seen_hrefs.insert(href.to_string()) {
                continue;
            }
            let full_url = if href.starts_with('/') {
                format!("https://gratka.pl{href}")
            } else {
                href.to_string()
            };

            let text = anchor.text().collect::<Vec<_>>().join(" ");
            let title: String = text.trim().chars().take(100).collect();
            if title.chars().count() < 3 {
                continue;
            }

            hits.push(PartialListing {
                title: Some(title),
                price_text: price_snippet(&text),
                url: Some(full_url),
                ..PartialListing::default()
            });
            if hits.len() >= SEARCH_HIT_CAP {
                break;
            }
        }
        Ok(hits)
    }
}

/// OLX renders the price into JSON-LD; the visible HTML is JS-hydrated.
fn jsonld_price(document: &Html) -> Result<Option<String>, ParseError> {
    let sel = selector(r#"script[type="application/ld+json"]"#)?;
    for script in document.select(&sel) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };
        let price = value
            .pointer("/offers/price")
            .or_else(|| value.pointer("/offers/0/price"))
            .or_else(|| value.get("price"));
        match price {
            Some(serde_json::Value::Number(n)) => return Ok(Some(format!("{n} zł"))),
            Some(serde_json::Value::String(s)) if !s.is_empty() => {
                return Ok(Some(format!("{s} zł")))
            }
            _ => {}
        }
    }
    Ok(None)
}

impl SourceAdapter for OlxAdapter {
    fn platform(&self) -> Platform {
        Platform::Olx
    }

    fn parse(&self, doc: &RawDocument) -> Result<PartialListing, ParseError> {
        check_platform(self.platform(), doc)?;
        let document = Html::parse_document(&doc.body);
        let body = body_text(&document);

        let title = title_from_heading(&document)?.ok_or(ParseError::MissingField("title"))?;
        let price_text = jsonld_price(&document)?
            .or_else(|| price_snippet(&body))
            .ok_or(ParseError::MissingField("price"))?;

        Ok(PartialListing {
            title: Some(title),
            price_text: Some(price_text),
            condition_text: condition_keywords(&body),
            description: body,
            url: doc.url.clone(),
            ..PartialListing::default()
        })
    }
}

impl SourceAdapter for AllegroAdapter {
    fn platform(&self) -> Platform {
        Platform::Allegro
    }

    fn parse(&self, doc: &RawDocument) -> Result<PartialListing, ParseError> {
        check_platform(self.platform(), doc)?;
        let document = Html::parse_document(&doc.body);
        let body = body_text(&document);

        let title = title_from_heading(&document)?.ok_or(ParseError::MissingField("title"))?;
        let price_text = price_snippet(&body).ok_or(ParseError::MissingField("price"))?;

        Ok(PartialListing {
            title: Some(title),
            price_text: Some(price_text),
            condition_text: condition_keywords(&body),
            description: body,
            url: doc.url.clone(),
            ..PartialListing::default()
        })
    }
}

impl SourceAdapter for VintedAdapter {
    fn platform(&self) -> Platform {
        Platform::Vinted
    }

    fn parse(&self, doc: &RawDocument) -> Result<PartialListing, ParseError> {
        check_platform(self.platform(), doc)?;
        let document = Html::parse_document(&doc.body);
        let body = body_text(&document);

        let title = title_from_heading(&document)?.ok_or(ParseError::MissingField("title"))?;
        let price_text = price_snippet(&body).ok_or(ParseError::MissingField("price"))?;

        Ok(PartialListing {
            title: Some(title),
            price_text: Some(price_text),
            condition_text: condition_keywords(&body),
            description: body,
            url: doc.url.clone(),
            ..PartialListing::default()
        })
    }
}

impl SourceAdapter for ManualAdapter {
    fn platform(&self) -> Platform {
        Platform::Manual
    }

    /// Pasted plain text: first non-empty line becomes the title, the price
    /// is located anywhere in the text.
    fn parse(&self, doc: &RawDocument) -> Result<PartialListing, ParseError> {
        check_platform(self.platform(), doc)?;
        let title = doc
            .body
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| l.chars().take(100).collect::<String>())
            .ok_or(ParseError::MissingField("title"))?;
        let price_text = price_snippet(&doc.body).ok_or(ParseError::MissingField("price"))?;

        Ok(PartialListing {
            title: Some(title),
            price_text: Some(price_text),
            description: doc.body.clone(),
            ..PartialListing::default()
        })
    }
}

/// Single resolution point for platform-specific parsing.
pub fn adapter_for(platform: Platform) -> &'static dyn SourceAdapter {
    match platform {
        Platform::Olx => &OlxAdapter,
        Platform::Vinted => &VintedAdapter,
        Platform::Allegro => &AllegroAdapter,
        Platform::Sprzedajemy => &SprzedajemyAdapter,
        Platform::Gratka => &GratkaAdapter,
        Platform::Manual => &ManualAdapter,
    }
}

/// Platforms with a crawlable keyword search, scanned by the monitor.
pub fn monitored_platforms() -> &'static [Platform] {
    &[Platform::Sprzedajemy, Platform::Gratka]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn doc(platform: Platform, url: Option<&str>, body: &str) -> RawDocument {
        RawDocument {
            body: body.to_string(),
            url: url.map(str::to_string),
            platform,
            fetched_at: Utc.with_ymd_and_hms(2026, 8, 29, 12, 0, 0).single().unwrap(),
        }
    }

    const SPRZEDAJEMY_DETAIL: &str = r#"<html><body>
        <h1>Zegarek Błonie Zodiak</h1>
        <span class="offer-price">1 299,00 zł</span>
        <div class="offer-description">Sprzedam zegarek Błonie z lat 60. Stan: używane, sprawny.</div>
        <span class="userName">antykwariat_kato</span>
        <img src="/thumbs/1.jpg"><img src="/thumbs/2.jpg">
    </body></html>"#;

    #[test]
    fn sprzedajemy_detail_extracts_all_fields() {
        let adapter = adapter_for(Platform::Sprzedajemy);
        let partial = adapter
            .parse(&doc(
                Platform::Sprzedajemy,
                Some("https://sprzedajemy.pl/zegarek-blonie-nr123"),
                SPRZEDAJEMY_DETAIL,
            ))
            .unwrap();
        assert_eq!(partial.title.as_deref(), Some("Zegarek Błonie Zodiak"));
        assert_eq!(partial.price_text.as_deref(), Some("1 299,00 zł"));
        assert_eq!(partial.condition_text, "używane");
        assert_eq!(partial.seller_text, "antykwariat_kato");
        assert_eq!(partial.photo_count, 2);
        assert!(partial.description.contains("Sprzedam zegarek"));
    }

    #[test]
    fn missing_price_is_a_parse_failure_not_a_guess() {
        let adapter = adapter_for(Platform::Gratka);
        let err = adapter
            .parse(&doc(
                Platform::Gratka,
                Some("https://gratka.pl/szabla-123"),
                "<html><body><h1>Szabla wz. 34</h1><p>cena do uzgodnienia</p></body></html>",
            ))
            .unwrap_err();
        assert_eq!(err, ParseError::MissingField("price"));
    }

    #[test]
    fn missing_title_is_a_parse_failure() {
        let adapter = adapter_for(Platform::Gratka);
        let err = adapter
            .parse(&doc(
                Platform::Gratka,
                None,
                "<html><body><p>100 zł</p></body></html>",
            ))
            .unwrap_err();
        assert_eq!(err, ParseError::MissingField("title"));
    }

    #[test]
    fn olx_reads_price_from_jsonld() {
        let body = r#"<html><head><title>Zegarek Wostok | OLX.pl</title>
            <script type="application/ld+json">{"@type":"Product","offers":{"price":"349.99","priceCurrency":"PLN"}}</script>
            </head><body><div id="app"></div></body></html>"#;
        let adapter = adapter_for(Platform::Olx);
        let partial = adapter
            .parse(&doc(Platform::Olx, Some("https://olx.pl/d/oferta/x-ID1.html"), body))
            .unwrap();
        assert_eq!(partial.price_text.as_deref(), Some("349.99 zł"));
        assert_eq!(partial.title.as_deref(), Some("Zegarek Wostok | OLX.pl"));
    }

    #[test]
    fn manual_text_parses_first_line_and_price() {
        let adapter = adapter_for(Platform::Manual);
        let partial = adapter
            .parse(&doc(
                Platform::Manual,
                None,
                "Kapitan Żbik - Tajemnica ikony\nPierwsze wydanie 1968\nCena 120 zł, odbiór Katowice",
            ))
            .unwrap();
        assert_eq!(partial.title.as_deref(), Some("Kapitan Żbik - Tajemnica ikony"));
        assert_eq!(partial.price_text.as_deref(), Some("120 zł"));
    }

    #[test]
    fn sprzedajemy_search_collects_deduped_listing_anchors() {
        let body = r#"<html><body>
            <a href="/komiks-relax-14-nr100">Komiks Relax nr 14 45 zł</a>
            <a href="/komiks-relax-14-nr100">Komiks Relax nr 14 45 zł</a>
            <a href="/porcelana-cmielow-nr200">Figurka Ćmielów 230 zł</a>
            <a href="/kontakt">Kontakt</a>
            <a href="/x-nr300">ok</a>
        </body></html>"#;
        let adapter = adapter_for(Platform::Sprzedajemy);
        let hits = adapter
            .parse_search(&doc(Platform::Sprzedajemy, None, body))
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(
            hits[0].url.as_deref(),
            Some("https://sprzedajemy.pl/komiks-relax-14-nr100")
        );
        assert_eq!(hits[0].price_text.as_deref(), Some("45 zł"));
        assert_eq!(
            hits[1].title.as_deref(),
            Some("Figurka Ćmielów 230 zł")
        );
    }

    #[test]
    fn gratka_search_builds_absolute_urls() {
        let body = r#"<html><body>
            <a href="/bagnet-wz-24-ob123">Bagnet wz. 24 150 zł</a>
            <a href="https://gratka.pl/szabla-ob456">Szabla oficerska</a>
            <a href="/regulamin">Regulamin</a>
        </body></html>"#;
        let adapter = adapter_for(Platform::Gratka);
        let hits = adapter.parse_search(&doc(Platform::Gratka, None, body)).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url.as_deref(), Some("https://gratka.pl/bagnet-wz-24-ob123"));
        assert_eq!(hits[1].url.as_deref(), Some("https://gratka.pl/szabla-ob456"));
    }

    #[test]
    fn search_urls_encode_keywords() {
        assert_eq!(
            adapter_for(Platform::Sprzedajemy).search_url("komiks PRL").as_deref(),
            Some("https://sprzedajemy.pl/szukaj?inp_text=komiks+PRL")
        );
        assert_eq!(
            adapter_for(Platform::Gratka).search_url("zegarek Błonie").as_deref(),
            Some("https://gratka.pl/szukaj?q=zegarek+Błonie")
        );
        assert!(adapter_for(Platform::Olx).search_url("x").is_none());
    }

    #[test]
    fn search_unsupported_platforms_signal_it() {
        let err = adapter_for(Platform::Vinted)
            .parse_search(&doc(Platform::Vinted, None, "<html></html>"))
            .unwrap_err();
        assert_eq!(err, ParseError::SearchUnsupported(Platform::Vinted));
    }

    #[test]
    fn platform_mismatch_is_rejected() {
        let err = adapter_for(Platform::Olx)
            .parse(&doc(Platform::Gratka, None, "<html></html>"))
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::PlatformMismatch {
                expected: Platform::Olx,
                got: Platform::Gratka,
            }
        );
    }
}
