//! Condense per-database answers into one short synthesis.
//!
//! Summarization never fails the request: on any model error the raw
//! per-database results are returned with the error prepended.

use tracing::warn;

use crate::llm::LlmClient;
use crate::router::DatabaseResult;

const SUMMARY_SYSTEM_PROMPT: &str = "You compare answers gathered from several quick-commerce \
platforms (one database per platform) and explain them to a shopper. \
Use only the facts in the results. Treat lines starting with 'Error:' as missing data.";

/// Returned without calling the model when there is nothing to summarize.
pub const NO_RESULTS: &str = "No relevant data found for this query.";

fn format_results(results: &[DatabaseResult]) -> String {
    results
        .iter()
        .map(|r| format!("{}: {}", r.database, r.output))
        .collect::<Vec<_>>()
        .join("\n")
}

fn summary_prompt(query: &str, results: &[DatabaseResult]) -> String {
    format!(
        "User query: {query}\n\n\
         Results by platform:\n{}\n\n\
         Provide:\n\
         1. A short summary of the findings\n\
         2. A comparison across platforms where relevant\n\
         3. A recommendation if applicable\n\n\
         Keep the whole response under 150 words.",
        format_results(results)
    )
}

/// Summarize `results` for `query`.
pub async fn summarize(llm: &dyn LlmClient, query: &str, results: &[DatabaseResult]) -> String {
    if results.is_empty() {
        return NO_RESULTS.to_string();
    }

    match llm.complete(SUMMARY_SYSTEM_PROMPT, &summary_prompt(query, results)).await {
        Ok(completion) => completion.text.trim().to_string(),
        Err(e) => {
            warn!("Summarization failed, returning raw results: {e}");
            format!(
                "Summarization failed: {e}\n\nRaw results:\n{}",
                format_results(results)
            )
        }
    }
}
