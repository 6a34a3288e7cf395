//! Price and percentage extraction from display text

use std::sync::LazyLock;

use regex::Regex;
use scraper::ElementRef;

use super::selectors;

static AMOUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").unwrap());

static UNIT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*(?:/|per\b)").unwrap());

static BADGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"-\s*(\d{1,3})\s*%",
        r"(?i)(\d{1,3})\s*%\s*off",
        r"(?i)save\s*(\d{1,3})\s*%",
        r"\((\d{1,3})\s*%\)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// First amount in `text`, e.g. `"₹1,299.00"` → `1299.0`. Indian digit
/// grouping (`1,23,456`) is handled by dropping every comma.
pub fn parse_price(text: &str) -> Option<f64> {
    let raw = AMOUNT.find(text)?.as_str().replace(',', "");
    let value: f64 = raw.parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Largest in-range percentage shown as a badge ("-45%", "45% off", ...).
pub fn parse_badge_percent(text: &str) -> Option<u32> {
    BADGE_PATTERNS
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .filter(|p| *p <= 100)
        .max()
}

/// Struck-through / list price container rather than a selling price.
pub fn is_reference_price(price: &ElementRef<'_>) -> bool {
    let el = price.value();
    el.classes().any(|c| c == "a-text-price") || el.attr("data-a-strike") == Some("true")
}

/// The price is directly followed by a per-unit suffix, as in
/// `(₹5.99/100 g)` or `₹20 per count`. Only the next non-blank sibling is
/// read, so slashes elsewhere in the block do not count.
pub fn has_unit_qualifier(price: &ElementRef<'_>) -> bool {
    let trailing = price.next_siblings().find_map(|node| {
        let text = match node.value().as_text() {
            Some(text) => str::to_string(text),
            None => ElementRef::wrap(node)?.text().collect(),
        };
        (!text.trim().is_empty()).then_some(text)
    });
    trailing.is_some_and(|text| UNIT_SUFFIX.is_match(&text))
}

/// Amount held by a price element, preferring its screen-reader copy.
pub fn element_price(price: &ElementRef<'_>) -> Option<f64> {
    let text = price
        .select(&selectors::OFFSCREEN)
        .next()
        .map_or_else(|| price.text().collect::<String>(), |el| el.text().collect());
    parse_price(&text)
}
