//! Lenient extraction of structured data from free-text model output.
//!
//! Nothing in here can fail: every function degrades to a usable value.
//!
//! Summary tiers:
//! 1. A labeled section (`Summary:`, `## Summary`, `摘要：`, ...). Text on the
//!    label line wins; a bare heading takes the paragraph below it.
//! 2. The first substantial line. A first line shorter than 50 characters is
//!    treated as a title and the next line is used instead.
//! 3. The first 500 characters of the raw output.
//!
//! Key point tiers:
//! 1. A labeled section (`Key Points:`, `要点：`, ...) split into items.
//! 2. Bulleted lines anywhere in the output.
//! 3. Numbered lines anywhere in the output.
//! 4. Empty.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::models::{AiSummary, AnswerResponse, Citation};
use crate::prompt::truncate_chars;

/// Longest summary produced by the unlabeled fallback tiers.
pub const FALLBACK_SUMMARY_CHARS: usize = 500;

/// A first line shorter than this is assumed to be a title.
const TITLE_LINE_CHARS: usize = 50;

static SUMMARY_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t#>*_\-\d.]*(?:summary|摘要|总结|概要)[ \t*_]*(?:[:：]|$)[ \t*_]*")
        .expect("summary label regex")
});

static KEY_POINTS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^[ \t#>*_\-\d.]*(?:key[ \t]*points?|key[ \t]*takeaways?|要点|关键点|核心要点)[ \t*_]*(?:[:：]|$)[ \t*_]*",
    )
    .expect("key points label regex")
});

static CITATIONS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t#>*_\-\d.]*(?:citations?|references?|引用|引文)[ \t*_]*(?:[:：]|$)")
        .expect("citations label regex")
});

static INLINE_KEY_POINTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)key[ \t]*points?|要点").expect("inline key points regex"));

static LIST_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[ \t]*(?:[•\-*+][ \t]+|\d+[.、)][ \t]*)").expect("list marker regex")
});

static BULLET_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*[•\-*+][ \t]+(.+)$").expect("bullet line regex"));

static NUMBERED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*\d+[.、)][ \t]+(.+)$").expect("numbered line regex"));

static ITEM_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[、，;；]").expect("item separator regex"));

static CITATION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)\[(\d+)\]:[ \t]*([^\[\n]+)").expect("citation regex"));

static CITATION_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[ \t]*\[\d+\]:").expect("citation start regex"));

/// Parses a summarize response. `source` is the content that was summarized.
#[must_use]
pub fn parse_summary(raw: &str, source: &str) -> AiSummary {
    let summary = labeled_summary(raw)
        .or_else(|| first_substantial_line(raw))
        .unwrap_or_else(|| truncate_chars(raw, FALLBACK_SUMMARY_CHARS).trim().to_string());

    let key_points = labeled_key_points(raw)
        .or_else(|| captured_lines(&BULLET_LINE, raw))
        .or_else(|| captured_lines(&NUMBERED_LINE, raw))
        .unwrap_or_default();

    AiSummary {
        summary,
        key_points,
        citations: extract_citations(raw, source),
    }
}

/// Parses a question-answering response; the whole text is the answer.
#[must_use]
pub fn parse_answer(raw: &str, source: &str) -> AnswerResponse {
    AnswerResponse {
        answer: raw.to_string(),
        citations: extract_citations(raw, source),
    }
}

/// Collects `[n]: excerpt` citations whose excerpt occurs verbatim in `source`.
#[must_use]
pub fn extract_citations(raw: &str, source: &str) -> Vec<Citation> {
    CITATION_LINE
        .captures_iter(raw)
        .filter_map(|caps| {
            let cited = caps.get(2)?.as_str().trim();
            locate(cited, source).or_else(|| locate(strip_quotes(cited), source))
        })
        .collect()
}

fn locate(text: &str, source: &str) -> Option<Citation> {
    if text.is_empty() {
        return None;
    }
    let byte_idx = source.find(text)?;
    Some(Citation {
        text: text.to_string(),
        position: source[..byte_idx].chars().count(),
        page: None,
        section: None,
    })
}

fn strip_quotes(text: &str) -> &str {
    text.trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '「' | '」'))
        .trim()
}

fn is_section_boundary(line: &str) -> bool {
    SUMMARY_LABEL.is_match(line)
        || KEY_POINTS_LABEL.is_match(line)
        || CITATIONS_LABEL.is_match(line)
        || CITATION_START.is_match(line)
}

fn labeled_summary(raw: &str) -> Option<String> {
    let label = SUMMARY_LABEL.find(raw)?;
    let rest = &raw[label.end()..];

    let first_line = rest.lines().next().unwrap_or("");
    let first_line = match INLINE_KEY_POINTS.find(first_line) {
        Some(m) if m.start() > 0 => &first_line[..m.start()],
        _ => first_line,
    };
    let first_line = first_line.trim();
    if !first_line.is_empty() {
        return Some(first_line.to_string());
    }

    let paragraph: Vec<&str> = rest
        .trim_start()
        .lines()
        .take_while(|line| !line.trim().is_empty() && !is_section_boundary(line))
        .map(str::trim)
        .collect();
    (!paragraph.is_empty()).then(|| paragraph.join(" "))
}

fn first_substantial_line(raw: &str) -> Option<String> {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let first = lines.first()?;
    let chosen = if first.chars().count() < TITLE_LINE_CHARS && lines.len() > 1 {
        lines[1]
    } else {
        first
    };
    Some(truncate_chars(chosen, FALLBACK_SUMMARY_CHARS).to_string())
}

fn labeled_key_points(raw: &str) -> Option<Vec<String>> {
    let label = KEY_POINTS_LABEL.find(raw)?;
    let rest = raw[label.end()..].trim_start();

    let lines: Vec<&str> = rest.lines().collect();
    let mut section: Vec<&str> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            // A blank line ends the section unless the list carries on below it.
            let continues = lines[idx + 1..]
                .iter()
                .find(|l| !l.trim().is_empty())
                .is_some_and(|next| LIST_MARKER.is_match(next));
            if continues {
                continue;
            }
            break;
        }
        if is_section_boundary(line) {
            break;
        }
        section.push(line);
    }

    let items = split_items(&section);
    (!items.is_empty()).then_some(items)
}

fn split_items(section: &[&str]) -> Vec<String> {
    if let [only] = section
        && !LIST_MARKER.is_match(only)
    {
        return ITEM_SEPARATOR
            .split(only)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(ToString::to_string)
            .collect();
    }

    section
        .iter()
        .map(|line| LIST_MARKER.replace(line, "").trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn captured_lines(pattern: &Regex, raw: &str) -> Option<Vec<String>> {
    let items: Vec<String> = pattern
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    (!items.is_empty()).then_some(items)
}
