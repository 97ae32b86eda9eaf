//! Ad-name parsing.
//!
//! Names follow `<launch_date> - <product> - <variant> - <color> - <brand> -
//! <source> - <format> - <description>`. Any segment may be missing or
//! malformed; parsing never fails and reports what it could not read as
//! [`ParseDegradation`]s.

use adspend_core::{AdFormat, NameSegment, ParseDegradation, ParsedAdAttributes};
use chrono::NaiveDate;

const TEXT_SEGMENTS: [NameSegment; 7] = [
    NameSegment::Product,
    NameSegment::Variant,
    NameSegment::Color,
    NameSegment::Brand,
    NameSegment::Source,
    NameSegment::Format,
    NameSegment::Description,
];

const PLACEHOLDER_TOKENS: [&str; 7] = ["n/a", "na", "none", "null", "tbd", "?", "xxx"];

pub fn parse_ad_name(ad_name: &str, campaign_name: &str) -> ParsedAdAttributes {
    let mut attrs = ParsedAdAttributes::default();
    let mut segments = split_segments(ad_name).into_iter().peekable();

    // Only a date-shaped leading segment is read as the launch date; anything
    // else is the product.
    let date_token = match segments.peek() {
        Some(first) if looks_like_date(first) => segments.next(),
        Some(first) if first.is_empty() => {
            segments.next();
            None
        }
        _ => None,
    };
    if let Some(token) = date_token {
        match parse_launch_date(&token) {
            Ok(date) => attrs.launch_date = Some(date),
            Err(reason) => attrs.degradations.push(ParseDegradation {
                segment: NameSegment::LaunchDate,
                raw: token,
                reason,
            }),
        }
    }

    let mut text: Vec<String> = segments.collect();
    if text.len() > TEXT_SEGMENTS.len() {
        let tail = text.split_off(TEXT_SEGMENTS.len() - 1);
        text.push(tail.join(" - "));
    }

    for (segment, token) in TEXT_SEGMENTS.iter().copied().zip(text) {
        if token.is_empty() {
            continue;
        }
        if is_placeholder(&token) {
            attrs.degradations.push(ParseDegradation {
                segment,
                raw: token,
                reason: "placeholder token".to_string(),
            });
            continue;
        }
        match segment {
            NameSegment::Product => attrs.product = Some(token),
            NameSegment::Variant => attrs.variant = Some(token),
            NameSegment::Color => attrs.color = Some(token),
            NameSegment::Brand => attrs.brand = Some(token),
            NameSegment::Source => attrs.source = Some(token),
            NameSegment::Format => attrs.format = Some(parse_format(&token)),
            NameSegment::Description => attrs.description = Some(token),
            NameSegment::LaunchDate => {}
        }
    }

    let campaign = campaign_name.trim();
    attrs.category_hint = attrs
        .product
        .clone()
        .or_else(|| (!campaign.is_empty()).then(|| campaign.to_string()));
    attrs
}

/// Splits on dashes that stand alone between whitespace, so `play-mat` and
/// ISO dates stay intact while `a - - b` yields an empty middle segment.
fn split_segments(name: &str) -> Vec<String> {
    let chars: Vec<char> = name.chars().collect();
    let mut out = Vec::new();
    let mut current = String::new();
    for (idx, &ch) in chars.iter().enumerate() {
        let prev_blank = idx == 0 || chars[idx - 1].is_whitespace();
        let next_blank = idx + 1 == chars.len() || chars[idx + 1].is_whitespace();
        if ch == '-' && prev_blank && next_blank {
            out.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
    }
    out.push(current.trim().to_string());
    if out.len() == 1 && out[0].is_empty() {
        out.clear();
    }
    out
}

fn looks_like_date(token: &str) -> bool {
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    if token.contains('/') {
        return has_digit;
    }
    let bytes = token.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(idx, b)| match idx {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

fn is_placeholder(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    PLACEHOLDER_TOKENS.contains(&lower.as_str()) || (token.starts_with('{') && token.ends_with('}'))
}

pub fn pivot_two_digit_year(yy: u32) -> i32 {
    if yy < 50 {
        2000 + yy as i32
    } else {
        1900 + yy as i32
    }
}

pub fn parse_launch_date(token: &str) -> Result<NaiveDate, String> {
    let token = token.trim();
    if token.contains('/') {
        let parts: Vec<&str> = token.split('/').map(str::trim).collect();
        let [month, day, year] = parts.as_slice() else {
            return Err(format!("expected M/D/Y, got {token:?}"));
        };
        let month: u32 = month.parse().map_err(|_| format!("bad month {month:?}"))?;
        let day: u32 = day.parse().map_err(|_| format!("bad day {day:?}"))?;
        if !year.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("bad year {year:?}"));
        }
        let year = match year.len() {
            2 => pivot_two_digit_year(year.parse().map_err(|_| format!("bad year {year:?}"))?),
            4 => year.parse().map_err(|_| format!("bad year {year:?}"))?,
            _ => return Err(format!("year must have 2 or 4 digits, got {year:?}")),
        };
        return NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| format!("no such calendar date {token:?}"));
    }
    NaiveDate::parse_from_str(token, "%Y-%m-%d").map_err(|_| format!("unrecognized date {token:?}"))
}

pub fn parse_format(token: &str) -> AdFormat {
    let squashed: String = token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    match squashed.as_str() {
        "video" | "vid" | "reel" | "reels" => AdFormat::Video,
        "static" | "image" | "img" | "photo" => AdFormat::Static,
        "carousel" | "caro" => AdFormat::Carousel,
        "ugc" => AdFormat::Ugc,
        _ => AdFormat::Other(token.to_string()),
    }
}
