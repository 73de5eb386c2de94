//! Prompt templates, language helpers and the content caps applied before a
//! request leaves the broker.

use crate::core::models::Message;

/// Content longer than this is summarized with the academic template.
pub const LONG_FORM_THRESHOLD_CHARS: usize = 10_000;

/// Cap on content submitted for summarization or translation.
pub const CONTENT_CAP_CHARS: usize = 50_000;

/// Cap on the context content prepended to question answering.
pub const ANSWER_CONTEXT_CAP_CHARS: usize = 30_000;

/// Language value meaning "answer in the language of the content".
pub const AUTO_LANGUAGE: &str = "auto";

/// Returns at most `max_chars` characters of `text`, cut on a char boundary.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Maps a BCP-47-ish language code to the English name a model understands.
#[must_use]
pub fn language_name_for_model(lang_code: &str) -> &'static str {
    let lang = lang_code.to_ascii_lowercase();
    let table: [(&str, &'static str); 9] = [
        ("zh", "Chinese"),
        ("ja", "Japanese"),
        ("ko", "Korean"),
        ("fr", "French"),
        ("de", "German"),
        ("es", "Spanish"),
        ("ru", "Russian"),
        ("pt", "Portuguese"),
        ("it", "Italian"),
    ];
    table
        .iter()
        .find(|(prefix, _)| lang.starts_with(prefix))
        .map_or("English", |(_, name)| *name)
}

/// Guesses the dominant language of `content` from its script, falling back
/// to `fallback` for Latin-script or empty text.
#[must_use]
pub fn detect_content_language(content: &str, fallback: &str) -> String {
    let total = content.chars().count();
    if total == 0 {
        return fallback.to_string();
    }

    let (mut chinese, mut japanese, mut korean) = (0usize, 0usize, 0usize);
    for ch in content.chars() {
        match ch {
            '\u{4e00}'..='\u{9fff}' | '\u{3000}'..='\u{303f}' | '\u{ff00}'..='\u{ffef}' => {
                chinese += 1;
            }
            '\u{3040}'..='\u{309f}' | '\u{30a0}'..='\u{30ff}' => japanese += 1,
            '\u{ac00}'..='\u{d7af}' => korean += 1,
            _ => {}
        }
    }

    // A script counts once it covers more than 5% of the text.
    let dominant = |count: usize| count > 0 && count * 20 > total;
    if dominant(chinese) {
        return "zh-CN".to_string();
    }
    if dominant(japanese) {
        return "ja".to_string();
    }
    if dominant(korean) {
        return "ko".to_string();
    }
    if chinese > 10 {
        return "zh-CN".to_string();
    }
    fallback.to_string()
}

fn language_instruction(target_language: Option<&str>) -> String {
    match target_language.filter(|l| !l.trim().is_empty() && *l != AUTO_LANGUAGE) {
        None => " IMPORTANT: Respond in the same language as the content you are analyzing."
            .to_string(),
        Some(lang) => {
            let name = language_name_for_model(lang);
            format!(
                " IMPORTANT: Respond in {name}. The summary, key points and citations must all be in {name}."
            )
        }
    }
}

/// Whether `content` should use the long-form (academic) templates.
#[must_use]
pub fn is_long_form(content: &str, flagged_long_form: bool) -> bool {
    flagged_long_form || content.chars().count() > LONG_FORM_THRESHOLD_CHARS
}

#[must_use]
pub fn summarize_messages(
    content: &str,
    long_form: bool,
    target_language: Option<&str>,
) -> Vec<Message> {
    let instruction = language_instruction(target_language);
    let body = truncate_chars(content, CONTENT_CAP_CHARS);

    let (system, user) = if long_form {
        (
            format!(
                "You are an expert academic researcher. Analyze the paper and give a structured summary covering Objective, Methodology, Key Results and Implications.{instruction}"
            ),
            format!(
                "Analyze this paper thoroughly:\n\
                 1. Summary: a structured abstract (max 150 words)\n\
                 2. Key Points: 3-5 bullet points on methodology and core findings\n\
                 3. Citations: key excerpts quoted verbatim as [n]: excerpt\n\n\
                 Content:\n{body}"
            ),
        )
    } else {
        (
            format!(
                "You are an expert content analyzer. Provide a concise summary and the key takeaways.{instruction}"
            ),
            format!(
                "Analyze the following content and provide:\n\
                 1. Summary: 2-3 sentences\n\
                 2. Key Points: 3-5 bullet points\n\
                 3. Citations: important excerpts quoted verbatim as [n]: excerpt\n\n\
                 Content:\n{body}"
            ),
        )
    };

    vec![Message::system(system), Message::user(user)]
}

#[must_use]
pub fn translate_messages(content: &str, target_language: &str, professional: bool) -> Vec<Message> {
    let system = if professional {
        format!(
            "You are a professional translator. Translate the text to {target_language} while preserving:\n\
             1. Proper nouns (people, companies, products, brands)\n\
             2. Country and city names (original or standard translation)\n\
             3. Technical terms (standard terminology)\n\
             4. Numbers, dates and measurements\n\
             5. Formatting and structure\n\n\
             Provide only the translation, no explanations."
        )
    } else {
        format!(
            "You are a professional translator. Translate the following content to {target_language} while keeping the original formatting and structure."
        )
    };

    vec![
        Message::system(system),
        Message::user(format!(
            "Translate this content:\n\n{}",
            truncate_chars(content, CONTENT_CAP_CHARS)
        )),
    ]
}

#[must_use]
pub fn answer_messages(
    question: &str,
    content: &str,
    history: &[Message],
    long_form: bool,
) -> Vec<Message> {
    let system = if long_form {
        "You are an expert at analyzing academic papers. Answer questions from the provided content and cite supporting passages verbatim as [n]: excerpt."
    } else {
        "You are an expert at analyzing web content. Answer questions from the provided content and cite supporting passages verbatim as [n]: excerpt."
    };

    let mut messages = Vec::with_capacity(history.len() + 3);
    messages.push(Message::system(system));
    messages.push(Message::system(format!(
        "Context content:\n{}",
        truncate_chars(content, ANSWER_CONTEXT_CAP_CHARS)
    )));
    messages.extend(history.iter().cloned());
    messages.push(Message::user(question));
    messages
}
