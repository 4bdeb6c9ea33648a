//! Prompt rendering for answer steps.

use webquery_browser::FetchResult;
use webquery_chat::Prompt;

const SYSTEM_PROMPT: &str = "You are a research assistant. Answer the user's question using only \
the web page content provided. Cite the source URL for each fact you use. If the content does \
not contain the answer, say so plainly.";

/// Per-source cap so one long page cannot crowd out the others.
const MAX_SOURCE_CHARS: usize = 8000;

/// Build the prompt for answering `question` from fetched pages.
pub fn answer_prompt(question: &str, sources: &[&FetchResult]) -> Prompt {
    let mut body = String::new();
    if sources.is_empty() {
        body.push_str("No page content was retrieved.\n");
    }
    for (i, source) in sources.iter().enumerate() {
        let content: String = source.content.chars().take(MAX_SOURCE_CHARS).collect();
        body.push_str(&format!("Source {} ({}):\n{}\n\n", i + 1, source.url, content.trim()));
    }
    body.push_str(&format!("Question: {}", question.trim()));
    Prompt::new(SYSTEM_PROMPT, body)
}
