use crate::provider::ToolInvocation;

/// Events emitted while a completion streams.
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// A tool call whose name and argument JSON are fully assembled
    /// (after repair when needed). Never emitted for partial deltas.
    ToolCall(ToolInvocation),

    /// A tool call whose arguments stayed invalid after repair. The
    /// orchestrator reports it to the model as a tool error and retries
    /// the turn once.
    ToolCallInvalid {
        id: String,
        name: String,
        raw_arguments: String,
    },

    /// Stream completed.
    Done { finish_reason: String },

    /// Error during streaming.
    Error { message: String },
}

/// Parse a single SSE line: `event: <type>` or `data: <json>`.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_and_event_lines() {
        match parse_sse_line("data: {\"x\":1}") {
            Some(SseParsed::Data(d)) => assert_eq!(d, "{\"x\":1}"),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_sse_line("event: message_start") {
            Some(SseParsed::Event(e)) => assert_eq!(e, "message_start"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_sse_line(": keep-alive").is_none());
    }
}
