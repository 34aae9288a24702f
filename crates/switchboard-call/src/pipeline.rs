//! Response pipeline: LLM token stream in, ordered speech out.
//!
//! Tokens accumulate into sentences; each sentence is translated into the
//! caller's language when it differs from the pivot, screened by the
//! content-safety filter, and handed to the speaker queue. Tool calls are
//! collected out-of-band and never spoken. Barge-in (scope cancellation)
//! stops the pipeline; what was already spoken is reported back so the
//! partial assistant turn can be persisted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard_core::cancel::CancelScope;
use switchboard_core::types::LangTag;
use switchboard_llm::provider::ToolInvocation;
use switchboard_llm::stream::CompletionEvent;
use switchboard_media::cues::Utterance;
use switchboard_media::speaker::SpeakerHandle;
use switchboard_media::tts::SpeechPiece;
use switchboard_services::{ContentSafety, Translator};
use switchboard_store::Style;

pub struct PipelineDeps {
    pub speaker: SpeakerHandle,
    pub translator: Option<Arc<dyn Translator>>,
    pub safety: Option<Arc<dyn ContentSafety>>,
}

#[derive(Debug, Clone)]
pub struct TurnParams {
    pub language: LangTag,
    pub pivot: LangTag,
    pub style: Style,
    pub voice: String,
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
    pub max_sentence_chars: usize,
    pub safety_categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SpokenSentence {
    /// Text as synthesized (caller's language).
    pub text: String,
    /// Speaker sequence number; compare with `played_seq` to know whether
    /// it finished playing.
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed { finish_reason: String },
    /// No full response within the hard timeout; the turn was aborted.
    HardTimeout,
    /// The turn scope was cancelled (barge-in or call teardown).
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
pub struct TurnResult {
    pub sentences: Vec<SpokenSentence>,
    pub tool_calls: Vec<ToolInvocation>,
    pub invalid_tool_calls: Vec<(String, String)>,
    /// At least one sentence was dropped by the content filter.
    pub filtered: bool,
    pub soft_cue_played: bool,
    pub outcome: TurnOutcome,
}

impl TurnResult {
    /// Sentences that finished playing, joined — the partial assistant
    /// text retained after a barge-in.
    pub fn committed_text(&self, played_seq: u64) -> String {
        self.sentences
            .iter()
            .filter(|s| s.seq <= played_seq)
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Everything that was submitted for synthesis this turn.
    pub fn full_text(&self) -> String {
        self.sentences
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Consume one completion stream and speak it.
pub async fn run_response_turn(
    mut rx: mpsc::Receiver<CompletionEvent>,
    deps: PipelineDeps,
    params: TurnParams,
    scope: CancelScope,
) -> TurnResult {
    let mut result = TurnResult {
        sentences: Vec::new(),
        tool_calls: Vec::new(),
        invalid_tool_calls: Vec::new(),
        filtered: false,
        soft_cue_played: false,
        outcome: TurnOutcome::Failed("stream closed without completion".to_string()),
    };
    let mut splitter = SentenceSplitter::new(params.max_sentence_chars);

    let soft = tokio::time::sleep(params.soft_timeout);
    let hard = tokio::time::sleep(params.hard_timeout);
    tokio::pin!(soft, hard);

    loop {
        tokio::select! {
            _ = scope.cancelled() => {
                result.outcome = TurnOutcome::Cancelled;
                return result;
            }
            _ = &mut soft, if !result.soft_cue_played && result.sentences.is_empty() => {
                debug!("soft answer timeout, playing still-working cue");
                result.soft_cue_played = true;
                let cue = Utterance::StillWorking.text(&params.language);
                let piece = SpeechPiece::new(cue, params.style.as_str(), params.language.clone(), &params.voice);
                // Cue pieces are not sentences; failures here are not fatal.
                let _ = deps.speaker.speak(piece).await;
            }
            _ = &mut hard => {
                warn!("hard answer timeout, aborting turn");
                scope.cancel();
                result.outcome = TurnOutcome::HardTimeout;
                return result;
            }
            event = rx.recv() => match event {
                Some(CompletionEvent::TextDelta { text }) => {
                    for sentence in splitter.push(&text) {
                        if !emit_sentence(&deps, &params, sentence, &scope, &mut result).await {
                            return result;
                        }
                    }
                }
                Some(CompletionEvent::ToolCall(invocation)) => {
                    debug!(tool = %invocation.name, "tool call collected");
                    result.tool_calls.push(invocation);
                }
                Some(CompletionEvent::ToolCallInvalid { id, name, .. }) => {
                    warn!(tool = %name, "invalid tool call survived repair");
                    result.invalid_tool_calls.push((id, name));
                }
                Some(CompletionEvent::Done { finish_reason }) => {
                    if let Some(rest) = splitter.flush() {
                        if !emit_sentence(&deps, &params, rest, &scope, &mut result).await {
                            return result;
                        }
                    }
                    info!(
                        sentences = result.sentences.len(),
                        tool_calls = result.tool_calls.len(),
                        "turn stream complete"
                    );
                    result.outcome = TurnOutcome::Completed { finish_reason };
                    return result;
                }
                Some(CompletionEvent::Error { message }) => {
                    result.outcome = TurnOutcome::Failed(message);
                    return result;
                }
                None => {
                    // Driver gave up; whatever was spoken stands.
                    return result;
                }
            }
        }
    }
}

/// Translate, screen, and enqueue one sentence. Returns `false` when the
/// turn must stop (cancellation or a dead speaker queue).
async fn emit_sentence(
    deps: &PipelineDeps,
    params: &TurnParams,
    sentence: String,
    scope: &CancelScope,
    result: &mut TurnResult,
) -> bool {
    let mut text = sentence;

    if params.language != params.pivot {
        if let Some(translator) = &deps.translator {
            match scope
                .run(translator.translate(&text, Some(&params.pivot), &params.language))
                .await
            {
                Some(Ok(translated)) => text = translated,
                Some(Err(e)) => {
                    // Speak the pivot-language sentence rather than nothing.
                    warn!(err = %e, "translation failed, speaking untranslated");
                }
                None => {
                    result.outcome = TurnOutcome::Cancelled;
                    return false;
                }
            }
        }
    }

    if let Some(safety) = &deps.safety {
        match scope.run(safety.check(&text, &params.safety_categories)).await {
            Some(Ok(verdict)) if !verdict.allowed => {
                warn!(categories = ?verdict.categories_matched, "sentence blocked by content filter");
                result.filtered = true;
                return true; // drop the sentence, continue the turn
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                // Fail closed: an unscreenable sentence is not spoken.
                warn!(err = %e, "content filter unavailable, dropping sentence");
                result.filtered = true;
                return true;
            }
            None => {
                result.outcome = TurnOutcome::Cancelled;
                return false;
            }
        }
    }

    let piece = SpeechPiece::new(
        text.clone(),
        params.style.as_str(),
        params.language.clone(),
        &params.voice,
    );
    match scope.run(deps.speaker.speak(piece)).await {
        Some(Ok(seq)) => {
            result.sentences.push(SpokenSentence { text, seq });
            true
        }
        Some(Err(e)) => {
            result.outcome = TurnOutcome::Failed(e.to_string());
            false
        }
        None => {
            result.outcome = TurnOutcome::Cancelled;
            false
        }
    }
}

/// Rolling sentence extractor. Splits at sentence terminators (followed
/// by whitespace) and at the length cap, never inside a word.
struct SentenceSplitter {
    buf: String,
    max_chars: usize,
}

const TERMINATORS: &[char] = &['.', '!', '?', ';', '…', '。', '！', '？'];

impl SentenceSplitter {
    fn new(max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            max_chars: max_chars.max(16),
        }
    }

    fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);
        let mut out = Vec::new();
        loop {
            match self.next_boundary() {
                Some(end) => {
                    let sentence: String = self.buf.drain(..end).collect();
                    self.buf = self.buf.trim_start().to_string();
                    let sentence = sentence.trim();
                    if !sentence.is_empty() {
                        out.push(sentence.to_string());
                    }
                }
                None => break,
            }
        }
        out
    }

    fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Byte index just past the end of a completed sentence, if any.
    fn next_boundary(&self) -> Option<usize> {
        let mut last_space: Option<usize> = None;
        let mut prev_terminator = false;

        for (idx, c) in self.buf.char_indices() {
            if prev_terminator && c.is_whitespace() {
                return Some(idx);
            }
            prev_terminator = TERMINATORS.contains(&c);
            if c.is_whitespace() {
                last_space = Some(idx);
            }
            // Length cap: cut at the last whitespace once exceeded.
            if idx >= self.max_chars {
                if let Some(space) = last_space {
                    if space > 0 {
                        return Some(space);
                    }
                }
                return Some(idx);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use switchboard_media::mock::RecordingSynthesizer;
    use switchboard_media::speaker::SpeakerQueue;
    use switchboard_services::SafetyVerdict;

    fn split_all(max: usize, deltas: &[&str]) -> (Vec<String>, Option<String>) {
        let mut splitter = SentenceSplitter::new(max);
        let mut out = Vec::new();
        for d in deltas {
            out.extend(splitter.push(d));
        }
        (out, splitter.flush())
    }

    #[test]
    fn splits_on_terminators() {
        let (sentences, rest) = split_all(
            120,
            &["Bonjour. ", "Je suis Emma", ". Comment puis-je ", "vous aider ? Voilà"],
        );
        assert_eq!(
            sentences,
            vec!["Bonjour.", "Je suis Emma.", "Comment puis-je vous aider ?"]
        );
        assert_eq!(rest.as_deref(), Some("Voilà"));
    }

    #[test]
    fn decimals_are_not_boundaries() {
        let (sentences, rest) = split_all(120, &["Le montant est 3.5 millions environ"]);
        assert!(sentences.is_empty());
        assert_eq!(rest.as_deref(), Some("Le montant est 3.5 millions environ"));
    }

    #[test]
    fn long_buffer_cuts_at_whitespace() {
        let long = "mot ".repeat(60); // 240 chars, no terminator
        let (sentences, rest) = split_all(120, &[&long]);
        assert!(!sentences.is_empty());
        for s in &sentences {
            assert!(s.len() <= 124, "sentence too long: {}", s.len());
            // cuts land on whitespace, never inside a word
            assert!(s.ends_with("mot"));
        }
        assert!(rest.is_some());
    }

    // -- pipeline tests ----------------------------------------------------

    struct TaggingTranslator;

    #[async_trait]
    impl Translator for TaggingTranslator {
        async fn translate(
            &self,
            text: &str,
            _source: Option<&LangTag>,
            target: &LangTag,
        ) -> switchboard_services::Result<String> {
            Ok(format!("[{}] {}", target.as_str(), text))
        }
    }

    struct BlockWord(&'static str);

    #[async_trait]
    impl ContentSafety for BlockWord {
        async fn check(
            &self,
            text: &str,
            _categories: &[String],
        ) -> switchboard_services::Result<SafetyVerdict> {
            Ok(SafetyVerdict {
                allowed: !text.contains(self.0),
                categories_matched: vec![],
            })
        }
    }

    fn params() -> TurnParams {
        TurnParams {
            language: LangTag::new("fr-FR"),
            pivot: LangTag::new("fr-FR"),
            style: Style::None,
            voice: "neutral-1".to_string(),
            soft_timeout: Duration::from_secs(4),
            hard_timeout: Duration::from_secs(15),
            max_sentence_chars: 120,
            safety_categories: vec![],
        }
    }

    fn speaker_and_synth(scope: &CancelScope) -> (SpeakerHandle, Arc<RecordingSynthesizer>) {
        let synth = Arc::new(RecordingSynthesizer::default());
        let handle = SpeakerQueue::spawn(synth.clone(), 8, scope);
        (handle, synth)
    }

    async fn feed(events: Vec<CompletionEvent>) -> mpsc::Receiver<CompletionEvent> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for e in events {
                if tx.send(e).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    fn text(t: &str) -> CompletionEvent {
        CompletionEvent::TextDelta {
            text: t.to_string(),
        }
    }

    fn done() -> CompletionEvent {
        CompletionEvent::Done {
            finish_reason: "stop".to_string(),
        }
    }

    #[tokio::test]
    async fn sentences_spoken_in_extraction_order() {
        let scope = CancelScope::root();
        let (speaker, synth) = speaker_and_synth(&scope);
        let rx = feed(vec![text("Un. "), text("Deux. "), text("Trois."), done()]).await;

        let result = run_response_turn(
            rx,
            PipelineDeps {
                speaker: speaker.clone(),
                translator: None,
                safety: None,
            },
            params(),
            scope.child(),
        )
        .await;

        assert!(matches!(result.outcome, TurnOutcome::Completed { .. }));
        speaker.drain().await;
        let spoken: Vec<String> = synth.spoken().iter().map(|p| p.text.clone()).collect();
        assert_eq!(spoken, vec!["Un.", "Deux.", "Trois."]);
        assert_eq!(result.full_text(), "Un. Deux. Trois.");
    }

    #[tokio::test]
    async fn translation_applies_when_languages_differ() {
        let scope = CancelScope::root();
        let (speaker, synth) = speaker_and_synth(&scope);
        let rx = feed(vec![text("Hello there. "), done()]).await;

        let mut p = params();
        p.pivot = LangTag::new("en-US");
        let result = run_response_turn(
            rx,
            PipelineDeps {
                speaker: speaker.clone(),
                translator: Some(Arc::new(TaggingTranslator)),
                safety: None,
            },
            p,
            scope.child(),
        )
        .await;

        assert!(matches!(result.outcome, TurnOutcome::Completed { .. }));
        speaker.drain().await;
        assert_eq!(synth.spoken()[0].text, "[fr-FR] Hello there.");
    }

    #[tokio::test]
    async fn blocked_sentence_is_dropped_turn_continues() {
        let scope = CancelScope::root();
        let (speaker, synth) = speaker_and_synth(&scope);
        let rx = feed(vec![
            text("Une phrase correcte. "),
            text("Un gros mot interdit. "),
            text("Et la suite."),
            done(),
        ])
        .await;

        let result = run_response_turn(
            rx,
            PipelineDeps {
                speaker: speaker.clone(),
                translator: None,
                safety: Some(Arc::new(BlockWord("interdit"))),
            },
            params(),
            scope.child(),
        )
        .await;

        assert!(result.filtered);
        assert!(matches!(result.outcome, TurnOutcome::Completed { .. }));
        speaker.drain().await;
        let spoken: Vec<String> = synth.spoken().iter().map(|p| p.text.clone()).collect();
        assert_eq!(spoken, vec!["Une phrase correcte.", "Et la suite."]);
    }

    #[tokio::test]
    async fn tool_calls_are_collected_not_spoken() {
        let scope = CancelScope::root();
        let (speaker, synth) = speaker_and_synth(&scope);
        let rx = feed(vec![
            CompletionEvent::ToolCall(ToolInvocation {
                id: "c1".to_string(),
                name: "update_claim".to_string(),
                arguments: serde_json::json!({"field": "policy_number", "value": "B01371946"}),
            }),
            text("C'est noté."),
            done(),
        ])
        .await;

        let result = run_response_turn(
            rx,
            PipelineDeps {
                speaker: speaker.clone(),
                translator: None,
                safety: None,
            },
            params(),
            scope.child(),
        )
        .await;

        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].name, "update_claim");
        speaker.drain().await;
        let spoken: Vec<String> = synth.spoken().iter().map(|p| p.text.clone()).collect();
        assert_eq!(spoken, vec!["C'est noté."]);
    }

    #[tokio::test]
    async fn cancellation_stops_new_sentences() {
        let call_scope = CancelScope::root();
        let (speaker, synth) = speaker_and_synth(&call_scope);
        let turn_scope = call_scope.child();

        let (tx, rx) = mpsc::channel(32);
        let deps = PipelineDeps {
            speaker: speaker.clone(),
            translator: None,
            safety: None,
        };
        let pipeline = tokio::spawn(run_response_turn(rx, deps, params(), turn_scope.clone()));

        tx.send(text("Une. Deux. Trois. ")).await.unwrap();
        // give the pipeline a chance to emit, then barge in
        tokio::time::sleep(Duration::from_millis(50)).await;
        turn_scope.cancel();
        speaker.cancel();
        tx.send(text("Quatre. Cinq. ")).await.unwrap();

        let result = pipeline.await.unwrap();
        assert_eq!(result.outcome, TurnOutcome::Cancelled);
        speaker.drain().await;
        let spoken: Vec<String> = synth.spoken().iter().map(|p| p.text.clone()).collect();
        assert!(spoken.len() <= 3);
        assert!(!result.full_text().contains("Quatre"));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_timeout_plays_still_working_once() {
        let scope = CancelScope::root();
        let (speaker, synth) = speaker_and_synth(&scope);

        let (tx, rx) = mpsc::channel(32);
        let deps = PipelineDeps {
            speaker: speaker.clone(),
            translator: None,
            safety: None,
        };
        let pipeline = tokio::spawn(run_response_turn(rx, deps, params(), scope.child()));

        // nothing arrives for 5 simulated seconds
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(text("Enfin une réponse.")).await.unwrap();
        tx.send(done()).await.unwrap();

        let result = pipeline.await.unwrap();
        assert!(result.soft_cue_played);
        assert!(matches!(result.outcome, TurnOutcome::Completed { .. }));
        speaker.drain().await;
        let spoken: Vec<String> = synth.spoken().iter().map(|p| p.text.clone()).collect();
        assert_eq!(spoken[0], Utterance::StillWorking.text(&LangTag::new("fr-FR")));
        assert_eq!(spoken[1], "Enfin une réponse.");
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_aborts_turn() {
        let scope = CancelScope::root();
        let (speaker, _synth) = speaker_and_synth(&scope);

        let (_tx, rx) = mpsc::channel::<CompletionEvent>(32);
        let deps = PipelineDeps {
            speaker,
            translator: None,
            safety: None,
        };
        let turn_scope = scope.child();
        let result = tokio::spawn(run_response_turn(rx, deps, params(), turn_scope.clone()))
            .await
            .unwrap();

        assert_eq!(result.outcome, TurnOutcome::HardTimeout);
        // the turn scope was cancelled so the driver stops too
        assert!(turn_scope.is_cancelled());
    }

    #[tokio::test]
    async fn committed_text_respects_played_seq() {
        let result = TurnResult {
            sentences: vec![
                SpokenSentence { text: "Un.".into(), seq: 1 },
                SpokenSentence { text: "Deux.".into(), seq: 2 },
                SpokenSentence { text: "Trois.".into(), seq: 3 },
                SpokenSentence { text: "Quatre.".into(), seq: 4 },
            ],
            tool_calls: vec![],
            invalid_tool_calls: vec![],
            filtered: false,
            soft_cue_played: false,
            outcome: TurnOutcome::Cancelled,
        };
        assert_eq!(result.committed_text(3), "Un. Deux. Trois.");
        assert_eq!(result.full_text(), "Un. Deux. Trois. Quatre.");
    }
}
