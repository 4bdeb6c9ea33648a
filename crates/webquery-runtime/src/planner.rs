//! Query planner: turns a query into a validated step DAG.
//!
//! Planning is pure and deterministic: the same text and configuration
//! always yield the same graph.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use webquery_browser::FetchSpec;
use webquery_chat::BackendSelector;
use webquery_core::{Error, OrchestrationConfig, Query, Result};

use crate::types::{ModelStep, Plan, PlanBuilder, StepId};

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s<>"'`]+"#).unwrap());
static AND_ALSO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+and\s+also\s+").unwrap());

const URL_TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}'];

#[derive(Debug, Clone)]
pub struct QueryPlanner {
    max_query_chars: usize,
    max_sub_questions: usize,
    search_url_template: String,
    deadline: Duration,
    selector: BackendSelector,
}

impl QueryPlanner {
    pub fn new(config: &OrchestrationConfig) -> Self {
        Self {
            max_query_chars: config.max_query_chars,
            max_sub_questions: config.max_sub_questions.max(1),
            search_url_template: config.search_url_template.clone(),
            deadline: config.plan_deadline(),
            selector: BackendSelector::Auto,
        }
    }

    /// Backend every model step of produced plans targets.
    pub fn with_selector(mut self, selector: BackendSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn plan(&self, query: &Query) -> Result<Plan> {
        let text = query.text().trim();
        if text.is_empty() {
            return Err(Error::UnplannableQuery("query is empty".into()));
        }
        let len = text.chars().count();
        if len > self.max_query_chars {
            return Err(Error::UnplannableQuery(format!(
                "query is {} characters, limit is {}",
                len, self.max_query_chars
            )));
        }
        if !text.chars().any(char::is_alphanumeric) {
            return Err(Error::UnplannableQuery(
                "query has no searchable content".into(),
            ));
        }

        let questions = split_sub_questions(text, self.max_sub_questions);
        if questions.is_empty() {
            return Err(Error::UnplannableQuery(
                "query has no searchable content".into(),
            ));
        }
        let branched = questions.len() > 1;

        let mut builder = PlanBuilder::new(query.id().clone(), text, self.deadline);
        for (n, question) in questions.iter().enumerate() {
            let urls = extract_urls(question);
            let fetches: Vec<StepId> = if urls.is_empty() {
                vec![builder.add_fetch(
                    format!("search: {}", question),
                    FetchSpec::search(&self.search_url_template, question),
                    branched,
                )]
            } else {
                urls.iter()
                    .map(|url| {
                        builder.add_fetch(format!("fetch: {}", url), FetchSpec::text(url.clone()), branched)
                    })
                    .collect()
            };

            let name = if branched {
                format!("answer {}: {}", n + 1, question)
            } else {
                "answer".to_string()
            };
            let answer = builder.add_model(
                name,
                ModelStep {
                    instruction: question.clone(),
                    selector: self.selector.clone(),
                },
                fetches,
                branched,
            );
            builder.answer(answer);
        }

        let plan = builder.build()?;
        debug!(
            "Planned query {}: {} sub-question(s), {} step(s)",
            query.id(),
            questions.len(),
            plan.len()
        );
        Ok(plan)
    }
}

/// Split text into independent sub-questions: on newlines, `;`, " and also ",
/// and after a `?` that is followed by more text. Fragments without
/// alphanumeric content are dropped. Anything past `max` is folded into the
/// last sub-question.
pub fn split_sub_questions(text: &str, max: usize) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for line in text.split(|c: char| c == '\n' || c == ';') {
        for clause in AND_ALSO_RE.split(line) {
            parts.extend(split_after_question_marks(clause));
        }
    }
    let mut parts: Vec<String> = parts
        .into_iter()
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| p.chars().any(char::is_alphanumeric))
        .collect();

    let max = max.max(1);
    if parts.len() > max {
        let rest = parts.split_off(max - 1).join(" ");
        parts.push(rest);
    }
    parts
}

fn split_after_question_marks(clause: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = clause.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        // `?` inside a URL query string is not a sentence break.
        if c == '?' && chars.peek().map_or(false, |n| n.is_whitespace()) && !ends_in_url(&current) {
            out.push(std::mem::take(&mut current));
        }
    }
    out.push(current);
    out
}

fn ends_in_url(text: &str) -> bool {
    text.split_whitespace()
        .last()
        .map_or(false, |word| URL_RE.is_match(word) && !word.ends_with('?'))
}

/// Explicit `http(s)` URLs in order of appearance, without trailing
/// punctuation, deduplicated.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for m in URL_RE.find_iter(text) {
        let url = m.as_str().trim_end_matches(URL_TRAILING).to_string();
        if url.len() > "https://".len() && !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}
