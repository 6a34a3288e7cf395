//! HTML rendering of deal posts and tips

use crate::models::Candidate;

/// Telegram's caption ceiling for photo posts, in characters.
pub const CAPTION_LIMIT: usize = 1024;

/// Ceiling for plain text messages.
pub const TEXT_LIMIT: usize = 4096;

const ELLIPSIS: char = '…';

/// Escapes markup characters for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Rupee amount with Indian digit grouping: `123456.5` → `₹1,23,456.50`.
pub fn format_inr(amount: f64) -> String {
    let paise = (amount * 100.0).round() as u64;
    let (rupees, fraction) = (paise / 100, paise % 100);

    let digits = rupees.to_string();
    let grouped = if digits.len() <= 3 {
        digits
    } else {
        let (head, tail) = digits.split_at(digits.len() - 3);
        let mut groups = Vec::new();
        let mut rest = head;
        while rest.len() > 2 {
            let (left, right) = rest.split_at(rest.len() - 2);
            groups.push(right);
            rest = left;
        }
        groups.push(rest);
        groups.reverse();
        format!("{},{tail}", groups.join(","))
    };

    if fraction == 0 {
        format!("₹{grouped}")
    } else {
        format!("₹{grouped}.{fraction:02}")
    }
}

/// Caption for a photo post. The title is shortened when the whole caption
/// would exceed [`CAPTION_LIMIT`].
pub fn render_caption(candidate: &Candidate, link: &str, emoji: &str) -> String {
    render_post(candidate, link, emoji, CAPTION_LIMIT)
}

/// Body of the text-only fallback post.
pub fn render_text(candidate: &Candidate, link: &str, emoji: &str) -> String {
    render_post(candidate, link, emoji, TEXT_LIMIT)
}

fn render_post(candidate: &Candidate, link: &str, emoji: &str, limit: usize) -> String {
    let mut body = String::new();

    if let Some(deal) = candidate.deal_price() {
        body.push_str(&format!("\n\n💰 <b>Deal price:</b> {}", format_inr(deal)));
    }
    if let Some(original) = candidate.original_price() {
        body.push_str(&format!("\n🏷️ M.R.P: <s>{}</s>", format_inr(original)));
    }
    if let Some(discount) = candidate.discount_percent() {
        body.push_str(&format!("\n📉 <b>{discount}% OFF</b>"));
    }
    if candidate.limited_time {
        body.push_str("\n⏰ Limited time deal");
    }
    body.push_str(&format!(
        "\n\n🛒 <a href=\"{}\">Buy now</a>",
        escape_html(link)
    ));
    if !candidate.category.is_empty() {
        body.push_str(&format!("\n#{}", hashtag(&candidate.category)));
    }

    let prefix = format!("{emoji} ");
    let fixed = prefix.chars().count() + "<b></b>".len() + body.chars().count();
    let budget = limit.saturating_sub(fixed);

    format!(
        "{prefix}<b>{}</b>{body}",
        escape_html(&truncate_title(&candidate.title, budget))
    )
}

pub fn render_tip(tip: &str) -> String {
    format!("💡 {}", escape_html(tip))
}

/// Shortens `title` so that its escaped form fits in `budget` characters.
fn truncate_title(title: &str, budget: usize) -> String {
    if escape_html(title).chars().count() <= budget {
        return title.to_string();
    }

    let mut out = String::new();
    let mut used = 1; // ellipsis
    for c in title.chars() {
        let cost = escape_html(c.encode_utf8(&mut [0; 4])).chars().count();
        if used + cost > budget {
            break;
        }
        used += cost;
        out.push(c);
    }
    let mut out = out.trim_end().to_string();
    out.push(ELLIPSIS);
    out
}

fn hashtag(category: &str) -> String {
    category
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}
