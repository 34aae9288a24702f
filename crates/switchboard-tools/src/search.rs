//! `search_documents`: retrieval over the knowledge corpus.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{require_str, Tool, ToolCtx, ToolOutcome};

const TOP_K: usize = 5;

pub struct SearchDocumentsTool;

#[async_trait]
impl Tool for SearchDocumentsTool {
    fn name(&self) -> &str {
        "search_documents"
    }

    fn description(&self) -> &str {
        "Search the policy and procedure documents. Use when the caller \
         asks something you need reference material for (coverage rules, \
         deadlines, required documents). Results are added to your \
         context for the next reply."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look up."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, ctx: &mut ToolCtx<'_>, input: Value) -> ToolOutcome {
        let query = match require_str(&input, "query") {
            Ok(q) => q,
            Err(out) => return out,
        };
        let Some(search) = ctx.deps.search.as_ref() else {
            return ToolOutcome::error("document search is not configured");
        };

        match search.search(query, TOP_K).await {
            Ok(hits) if hits.is_empty() => ToolOutcome::success("no matching documents"),
            Ok(hits) => {
                let summary: Vec<String> = hits
                    .iter()
                    .enumerate()
                    .map(|(i, h)| format!("[{}] {}", i + 1, h.snippet))
                    .collect();
                ctx.turn.knowledge_produced = true;
                ctx.turn.search_hits.extend(hits);
                ToolOutcome::success(summary.join("\n"))
            }
            Err(e) => ToolOutcome::error(format!("search failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_call;
    use crate::{ToolDeps, TurnScratch};
    use std::sync::Arc;
    use switchboard_services::{DocumentSearch, SearchHit};

    struct FixedSearch;

    #[async_trait]
    impl DocumentSearch for FixedSearch {
        async fn search(
            &self,
            _query: &str,
            _k: usize,
        ) -> switchboard_services::Result<Vec<SearchHit>> {
            Ok(vec![SearchHit {
                snippet: "Water damage must be reported within 5 working days.".to_string(),
                score: 0.92,
                source: Some("policy-guide.pdf".to_string()),
            }])
        }
    }

    #[tokio::test]
    async fn hits_land_in_turn_scratch() {
        let mut call = sample_call();
        let mut turn = TurnScratch::default();
        let deps = ToolDeps {
            search: Some(Arc::new(FixedSearch)),
            sms: Arc::new(crate::test_support::RecordingOutbox::default()),
        };
        let mut ctx = ToolCtx {
            call: &mut call,
            turn: &mut turn,
            deps: &deps,
        };

        let outcome = SearchDocumentsTool
            .execute(&mut ctx, json!({"query": "water damage deadline"}))
            .await;
        assert!(!outcome.is_error);
        assert!(outcome.content.contains("5 working days"));
        assert_eq!(turn.search_hits.len(), 1);
        assert!(turn.knowledge_produced);
    }

    #[tokio::test]
    async fn unconfigured_search_is_an_error() {
        let mut call = sample_call();
        let mut turn = TurnScratch::default();
        let deps = crate::test_support::deps();
        let mut ctx = ToolCtx {
            call: &mut call,
            turn: &mut turn,
            deps: &deps,
        };
        let outcome = SearchDocumentsTool
            .execute(&mut ctx, json!({"query": "anything"}))
            .await;
        assert!(outcome.is_error);
    }
}
