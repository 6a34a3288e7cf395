//! Catalog HTML to [`Candidate`] records
//!
//! Both entry points are pure functions of the page text. Markup that does
//! not look the way we expect yields fewer candidates, never an error: one
//! broken result block must not cost the rest of the page.

pub mod price;
pub mod selectors;

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::debug;

use crate::models::{CATALOG_BASE_URL, Candidate, ItemId};
use price::{element_price, has_unit_qualifier, is_reference_price, parse_badge_percent, parse_price};
use selectors::{detail, listing};

static ID_IN_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(?:dp|gp/product)/([A-Za-z0-9]{10})(?:[/?#]|$)").unwrap());

const SPONSORED_LINK_MARKERS: &[&str] = &["/sspa/", "sp_csd"];

const LIMITED_TIME_MARKER: &str = "limited time deal";

/// Extracts candidates from one search/listing page. Sponsored placements
/// and blocks without a valid identifier or title are dropped.
pub fn parse_listing(html: &str, category: &str) -> Vec<Candidate> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    let mut sponsored = 0usize;

    for block in document.select(&listing::RESULT) {
        if is_sponsored(&block) {
            sponsored += 1;
            continue;
        }

        let Some(id) = extract_listing_id(&block) else {
            continue;
        };
        if seen.contains(&id) {
            continue;
        }

        let Some(title) = block.select(&listing::TITLE).next().map(element_text) else {
            debug!("No title for {} in {}", id, category);
            continue;
        };
        let Some(mut candidate) = Candidate::new(id, &title, category) else {
            continue;
        };
        seen.insert(candidate.id.clone());

        let block_text = element_text(block);
        let (selling, reference) = extract_prices(block.select(&selectors::PRICE));
        candidate.set_prices(selling, reference);
        candidate.set_badge_discount(parse_badge_percent(&block_text));
        candidate.image_url = block
            .select(&listing::IMAGE)
            .next()
            .and_then(|img| {
                let img = img.value();
                img.attr("src")
                    .filter(|src| !src.starts_with("data:"))
                    .or_else(|| img.attr("data-src"))
            })
            .and_then(absolutize);
        candidate.limited_time = block_text.to_lowercase().contains(LIMITED_TIME_MARKER);

        candidates.push(candidate);
    }

    debug!(
        "Parsed {} candidates for {} ({} sponsored skipped)",
        candidates.len(),
        category,
        sponsored
    );
    candidates
}

/// Parses a product page for `source_id`. Used only to backfill fields of a
/// candidate that came from a listing, so the category is left empty.
pub fn parse_detail(html: &str, source_id: &ItemId) -> Option<Candidate> {
    let document = Html::parse_document(html);

    let title = document.select(&detail::TITLE).next().map(element_text)?;
    let mut candidate = Candidate::new(source_id.clone(), &title, "")?;

    let selling = document
        .select(&detail::SELLING_PRICE)
        .filter(|el| !is_reference_price(el))
        .find_map(|el| element_price(&el))
        .or_else(|| {
            document
                .select(&detail::LEGACY_PRICE)
                .find_map(|el| parse_price(&element_text(el)))
        });
    let reference = document
        .select(&detail::REFERENCE_PRICE)
        .filter(|el| !has_unit_qualifier(el))
        .find_map(|el| element_price(&el));
    candidate.set_prices(selling, reject_reference(selling, reference));

    let badge = document
        .select(&detail::SAVINGS_BADGE)
        .find_map(|el| parse_badge_percent(&element_text(el)));
    candidate.set_badge_discount(badge);

    candidate.image_url = document
        .select(&detail::IMAGE)
        .next()
        .and_then(|img| {
            let img = img.value();
            img.attr("data-old-hires")
                .filter(|src| !src.is_empty())
                .or_else(|| img.attr("src"))
        })
        .and_then(absolutize);

    candidate.limited_time = document
        .select(&detail::DEAL_BADGE)
        .any(|el| element_text(el).to_lowercase().contains(LIMITED_TIME_MARKER));

    Some(candidate)
}

/// A result block is sponsored if any of its markers say so.
fn is_sponsored(block: &ElementRef<'_>) -> bool {
    let el = block.value();

    if el
        .attr(listing::COMPONENT_ATTR)
        .is_some_and(|t| t.to_lowercase().contains("sp-sponsored"))
    {
        return true;
    }
    if el.classes().any(|c| c == "AdHolder") {
        return true;
    }
    if block
        .select(&listing::SPONSORED_LABEL)
        .any(|label| element_text(label).to_lowercase().contains("sponsored"))
    {
        return true;
    }

    block.select(&listing::LINK).any(|a| {
        a.value()
            .attr("href")
            .is_some_and(|href| SPONSORED_LINK_MARKERS.iter().any(|m| href.contains(m)))
    })
}

/// Identifier from the block attribute, else from a product link. A present
/// but malformed attribute rejects the block.
fn extract_listing_id(block: &ElementRef<'_>) -> Option<ItemId> {
    match block.value().attr(listing::ID_ATTR).map(str::trim) {
        Some(raw) if !raw.is_empty() => ItemId::parse(raw),
        _ => block
            .select(&listing::LINK)
            .filter_map(|a| a.value().attr("href"))
            .find_map(id_from_url),
    }
}

pub fn id_from_url(url: &str) -> Option<ItemId> {
    let caps = ID_IN_URL.captures(url)?;
    ItemId::parse(caps.get(1)?.as_str())
}

/// First selling price and first plausible reference price among `prices`.
/// Containers are told apart by markup, never by position.
fn extract_prices<'a>(prices: impl Iterator<Item = ElementRef<'a>>) -> (Option<f64>, Option<f64>) {
    let mut selling = None;
    let mut reference = None;

    for el in prices {
        if is_reference_price(&el) {
            if reference.is_some() {
                continue;
            }
            if has_unit_qualifier(&el) {
                debug!("Ignoring per-unit price {:?}", element_price(&el));
                continue;
            }
            reference = element_price(&el);
        } else if selling.is_none() {
            selling = element_price(&el);
        }
    }

    (selling, reject_reference(selling, reference))
}

/// A reference price at or below the selling price is a mis-extraction.
fn reject_reference(selling: Option<f64>, reference: Option<f64>) -> Option<f64> {
    match (selling, reference) {
        (Some(s), Some(r)) if r <= s => {
            debug!("Discarding reference price {} not above selling price {}", r, s);
            None
        }
        _ => reference,
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn absolutize(src: &str) -> Option<String> {
    let src = src.trim();
    if src.is_empty() || src.starts_with("data:") {
        None
    } else if src.starts_with("http") {
        Some(src.to_string())
    } else if src.starts_with("//") {
        Some(format!("https:{src}"))
    } else {
        Some(format!("{CATALOG_BASE_URL}{src}"))
    }
}
