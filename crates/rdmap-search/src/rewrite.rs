use async_trait::async_trait;
use tracing::debug;

use rdmap_core::error::{Error, Result};
use rdmap_core::traits::QueryRewriter;

use crate::llm::ChatClient;

const REWRITE_SYSTEM_PROMPT: &str = "You are a bilingual (RU/EN) technical search assistant. \
Rewrite user query into precise scientific/engineering terminology. \
Return ONLY the rewritten query in the same language as input (or English if technical). No quotes.";

/// Rewrites queries into domain terminology with a chat model.
pub struct LlmRewriter {
    client: ChatClient,
    model: String,
}

impl LlmRewriter {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self { client, model: model.into() }
    }
}

#[async_trait]
impl QueryRewriter for LlmRewriter {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn rewrite(&self, query: &str) -> Result<String> {
        let reply = self
            .client
            .complete(&self.model, REWRITE_SYSTEM_PROMPT, &format!("Query: {query}"), None)
            .await
            .map_err(|e| Error::RewriteFailed(e.to_string()))?;
        let cleaned = clean_reply(&reply);
        if cleaned.is_empty() {
            return Err(Error::RewriteFailed("empty rewrite".into()));
        }
        debug!(original = query, rewritten = %cleaned, "query rewritten");
        Ok(cleaned)
    }
}

/// Drops an echoed `Query:` prefix and surrounding quotes.
fn clean_reply(reply: &str) -> String {
    let mut s = reply.lines().next().unwrap_or_default().trim();
    if let Some(rest) = s.strip_prefix("Query:") {
        s = rest.trim();
    }
    s.trim_matches(|c| matches!(c, '"' | '\'' | '«' | '»' | '`')).trim().to_string()
}
