//! The per-call state machine.
//!
//! One session owns one Call document for the lifetime of a connection:
//! `Greeting → Listening → Thinking → Speaking → … → Ending → Closed`.
//! Sub-tasks (STT consumer, LLM stream, speaker queue, lease keeper)
//! communicate through channels; nothing else touches the Call while the
//! lease is held.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use switchboard_core::cancel::CancelScope;
use switchboard_core::config::{MAX_BUFFERED_SENTENCES, MAX_SENTENCE_CHARS};
use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::flags::{FlagService, FlagSnapshot};
use switchboard_core::types::{CallId, EventFingerprint, LangTag};
use switchboard_llm::driver::TieredDriver;
use switchboard_llm::provider::{CompletionRequest, ModelTier};
use switchboard_llm::stream::CompletionEvent;
use switchboard_media::cues::{SoundCue, Utterance};
use switchboard_media::speaker::{SpeakerHandle, SpeakerQueue};
use switchboard_media::stt::{RecognitionEvent, SpeechRecognizer};
use switchboard_media::tts::{SpeechPiece, SpeechSynthesizer};
use switchboard_media::turn::{TurnDetector, TurnSignal, TurnThresholds};
use switchboard_queue::{BackgroundDispatcher, MediaEventKind, WorkQueue};
use switchboard_services::{ContentSafety, Translator};
use switchboard_store::{
    Call, CallStore, Lease, LeaseManager, Message, MessageAction, NextAction, NextStep, Persona,
    StoreError, Style, ToolCallRecord,
};
use switchboard_tools::{CallDirective, ToolCtx, ToolDeps, ToolRegistry, TurnScratch};

use crate::pipeline::{run_response_turn, PipelineDeps, TurnOutcome, TurnParams, TurnResult};
use crate::prompt::{assemble, TurnContext};

/// Tool-loop bound per human turn, matching the runaway guard the rest of
/// the stack uses for agentic loops.
const MAX_TURN_ITERATIONS: usize = 8;
/// Grace period for the telephony side to confirm disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);
/// Detector tick cadence — well under the smallest threshold.
const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Idle warns spoken before the call is closed as silent.
const MAX_IDLE_WARNS: u32 = 3;

/// Everything a session needs, shared across the worker pool.
pub struct CallRuntime {
    pub store: Arc<CallStore>,
    pub leases: Arc<LeaseManager>,
    pub queue: Arc<WorkQueue>,
    pub dispatcher: Arc<BackgroundDispatcher>,
    pub driver: Arc<TieredDriver>,
    pub registry: Arc<ToolRegistry>,
    pub tool_deps: ToolDeps,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub translator: Option<Arc<dyn Translator>>,
    pub safety: Option<Arc<dyn ContentSafety>>,
    pub flags: Arc<FlagService>,
    pub voice: String,
    /// Maps an emotional style to a provider voice variant; styles with
    /// no entry fall back to `voice`.
    pub voice_styles: std::collections::HashMap<String, String>,
    pub pivot_lang: LangTag,
    pub context_chars: usize,
}

impl CallRuntime {
    /// Voice variant for a given speaking style.
    pub fn voice_for(&self, style: Style) -> String {
        self.voice_styles
            .get(style.as_str())
            .cloned()
            .unwrap_or_else(|| self.voice.clone())
    }
}

/// Events the worker routes into a live session.
#[derive(Debug)]
pub enum SessionEvent {
    Media {
        event_id: String,
        media: MediaEventKind,
        payload: Option<serde_json::Value>,
    },
    Sms {
        event_id: String,
        body: String,
        received_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
pub struct CallOutcome {
    pub call_id: CallId,
    /// Reached `Closed` (vs. aborted by lease loss / shutdown).
    pub closed: bool,
}

enum TurnControl {
    /// Back to Listening.
    Continue,
    /// Move to Ending with this disposition.
    End {
        action: NextAction,
        justification: String,
        farewell: Option<Utterance>,
        /// The far side already hung up — skip the disconnect wait.
        disconnected: bool,
    },
}

pub struct CallSession {
    runtime: Arc<CallRuntime>,
    call: Call,
    lease: Lease,
    scope: CancelScope,
    speaker: SpeakerHandle,
    detector: TurnDetector,
    flags: Arc<FlagSnapshot>,
    idle_warns: u32,
    knowledge: bool,
    stt_closed: bool,
    events_closed: bool,
    /// Set when a hangup/transfer event arrives mid-turn; consumed once
    /// the in-flight turn has been wound down.
    pending_end: Option<TurnControl>,
    /// Stops the current lease keeper; replaced on rollover so a released
    /// lease never triggers a spurious scope cancellation.
    lease_keeper: CancelScope,
}

impl CallSession {
    /// Drive one call to `Closed` (or until the scope is cancelled).
    pub async fn run(
        runtime: Arc<CallRuntime>,
        call: Call,
        lease: Lease,
        events_rx: mpsc::Receiver<SessionEvent>,
        scope: CancelScope,
    ) -> Result<CallOutcome> {
        let flags = runtime.flags.snapshot();
        let speaker =
            SpeakerQueue::spawn(runtime.synthesizer.clone(), MAX_BUFFERED_SENTENCES, &scope);
        let detector = TurnDetector::new(TurnThresholds::from_flags(&flags), Utc::now());

        let lease_keeper =
            spawn_lease_keeper(runtime.leases.clone(), lease.clone(), scope.clone());

        let session = CallSession {
            runtime,
            call,
            lease,
            scope,
            speaker,
            detector,
            flags,
            idle_warns: 0,
            knowledge: false,
            stt_closed: false,
            events_closed: false,
            pending_end: None,
            lease_keeper,
        };
        session.run_inner(events_rx).await
    }

    async fn run_inner(mut self, mut events_rx: mpsc::Receiver<SessionEvent>) -> Result<CallOutcome> {
        let call_id = self.call.call_id.clone();
        info!(%call_id, phone = %self.call.caller_phone(), "call session starting");

        // Greeting
        self.call.in_progress = true;
        self.save_call()?;
        self.speak_utterance(Utterance::Hello).await;
        self.speaker.drain().await;

        // Listening: start STT, arm the detector.
        let mut stt = self
            .runtime
            .recognizer
            .subscribe(
                &call_id,
                &self.call.lang_current_short_code.clone(),
                &self.scope,
            )
            .await
            .map_err(|e| SwitchboardError::Media(e.to_string()))?;
        let _ = self.runtime.synthesizer.play_cue(SoundCue::NoiseFloor).await;
        self.detector.reset_idle(Utc::now());

        let control = self.listen_loop(&mut stt, &mut events_rx).await?;

        match control {
            Some(end) => {
                self.ending(end, &mut events_rx).await?;
                info!(%call_id, "call closed");
                Ok(CallOutcome {
                    call_id,
                    closed: true,
                })
            }
            None => {
                // Scope cancelled: lease lost or worker shutdown. The call
                // resumes on another worker from the last saved state.
                warn!(%call_id, "session aborted before close");
                Ok(CallOutcome {
                    call_id,
                    closed: false,
                })
            }
        }
    }

    /// The Listening state. Returns the ending disposition, or `None`
    /// when the scope was cancelled.
    async fn listen_loop(
        &mut self,
        stt: &mut mpsc::Receiver<RecognitionEvent>,
        events_rx: &mut mpsc::Receiver<SessionEvent>,
    ) -> Result<Option<TurnControl>> {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let scope = self.scope.clone();

        loop {
            let signal = tokio::select! {
                _ = scope.cancelled() => return Ok(None),
                event = events_rx.recv(), if !self.events_closed => {
                    match event {
                        Some(event) => {
                            if let Some(end) = self.apply_session_event(event).await? {
                                return Ok(Some(end));
                            }
                            continue;
                        }
                        None => {
                            self.events_closed = true;
                            continue;
                        }
                    }
                }
                recognized = stt.recv(), if !self.stt_closed => {
                    match recognized {
                        Some(event) => {
                            self.maybe_switch_language(&event)?;
                            self.detector.on_event(&event)
                        }
                        None => {
                            self.stt_closed = true;
                            continue;
                        }
                    }
                }
                _ = tick.tick() => self.detector.on_tick(Utc::now()),
            };

            match signal {
                Some(TurnSignal::TurnEnded(text)) if !text.is_empty() => {
                    self.idle_warns = 0;
                    self.call.append_message(Message::human(&text));
                    debug!(%text, "human turn ended");
                    let control = self.assistant_turn(stt, events_rx).await?;
                    match control {
                        TurnControl::Continue => {
                            self.detector.reset_idle(Utc::now());
                        }
                        end @ TurnControl::End { .. } => return Ok(Some(end)),
                    }
                }
                Some(TurnSignal::TurnEnded(_)) => {}
                Some(TurnSignal::IdleWarn) => {
                    self.idle_warns += 1;
                    if self.idle_warns > MAX_IDLE_WARNS {
                        info!("caller silent beyond the last warning, ending call");
                        return Ok(Some(TurnControl::End {
                            action: NextAction::Silence,
                            justification: "caller never spoke despite re-engagement".to_string(),
                            farewell: Some(Utterance::Goodbye),
                            disconnected: false,
                        }));
                    }
                    debug!(warns = self.idle_warns, "idle warn, re-engaging caller");
                    self.speak_utterance(Utterance::ReEngage).await;
                    self.detector.reset_idle(Utc::now());
                }
                Some(TurnSignal::BargeIn) => {
                    // Not speaking in this state; nothing to cancel.
                }
                None => {}
            }
        }
    }

    /// One assistant turn: completion → speech + tool dispatch, repeated
    /// while the model keeps requesting tools.
    async fn assistant_turn(
        &mut self,
        stt: &mut mpsc::Receiver<RecognitionEvent>,
        events_rx: &mut mpsc::Receiver<SessionEvent>,
    ) -> Result<TurnControl> {
        self.flags = self.runtime.flags.snapshot();
        let mut scratch = TurnScratch::default();
        let mut apologised = false;
        let mut retried_invalid = false;

        let _ = self
            .runtime
            .synthesizer
            .play_cue(SoundCue::ThinkingLoop)
            .await;
        self.detector.set_speaking(true);

        let control = 'turn: loop {
            for iteration in 0..MAX_TURN_ITERATIONS {
                let turn_scope = self.scope.child();
                let played_before = self.speaker.played_seq();
                let result = self
                    .completion_pass(stt, events_rx, &scratch, &turn_scope)
                    .await;

                // Commit whatever was actually spoken.
                let spoken = match result.outcome {
                    TurnOutcome::Cancelled | TurnOutcome::HardTimeout => {
                        result.committed_text(self.speaker.played_seq().max(played_before))
                    }
                    _ => {
                        self.speaker.drain().await;
                        result.full_text()
                    }
                };
                let had_tool_calls = !result.tool_calls.is_empty();
                let tool_records = self.dispatch_tools(&result, &mut scratch).await;
                let directives: Vec<CallDirective> = tool_records
                    .iter()
                    .filter_map(|(_, d)| *d)
                    .collect();

                self.append_turn_messages(&spoken, tool_records);
                if result.filtered {
                    self.call.append_message(Message::system(
                        MessageAction::Note,
                        "one or more sentences were withheld by the content filter",
                    ));
                }
                self.save_call()?;

                // Control-flow directives win over everything else.
                if directives.contains(&CallDirective::TransferToAgent) {
                    self.speak_utterance(Utterance::TransferComing).await;
                    break 'turn TurnControl::End {
                        action: NextAction::CaseEscalated,
                        justification: "caller transferred to a human agent".to_string(),
                        farewell: None,
                        disconnected: false,
                    };
                }
                if directives.contains(&CallDirective::EndCall) {
                    break 'turn TurnControl::End {
                        action: NextAction::CaseClosed,
                        justification: "assistant completed the request and ended the call"
                            .to_string(),
                        farewell: Some(Utterance::Goodbye),
                        disconnected: false,
                    };
                }
                if directives.contains(&CallDirective::ResetClaim) {
                    self.rollover_call().await?;
                }
                if directives.contains(&CallDirective::AcknowledgeClaim) {
                    self.speak_utterance(Utterance::ClaimAcknowledged).await;
                }

                match result.outcome {
                    TurnOutcome::Completed { ref finish_reason } => {
                        if !result.invalid_tool_calls.is_empty() && !retried_invalid {
                            // One repair-failed retry, preceded by an apology.
                            retried_invalid = true;
                            self.speak_utterance(Utterance::Apology).await;
                            continue;
                        }
                        let wants_more = finish_reason == "tool_calls"
                            || (had_tool_calls && spoken.is_empty());
                        if wants_more && iteration + 1 < MAX_TURN_ITERATIONS {
                            continue;
                        }
                        break 'turn TurnControl::Continue;
                    }
                    TurnOutcome::Cancelled => {
                        if let Some(end) = self.pending_end.take() {
                            break 'turn end;
                        }
                        // Barge-in: the caller has the floor again.
                        break 'turn TurnControl::Continue;
                    }
                    TurnOutcome::HardTimeout => {
                        error!(call_id = %self.call.call_id, "turn hard timeout incident");
                        if !apologised {
                            apologised = true;
                            self.speak_utterance(Utterance::Apology).await;
                        }
                        break 'turn TurnControl::Continue;
                    }
                    TurnOutcome::Failed(ref message) => {
                        warn!(%message, "turn failed");
                        if !apologised {
                            apologised = true;
                            self.speak_utterance(Utterance::Apology).await;
                        }
                        break 'turn TurnControl::Continue;
                    }
                }
            }
            warn!("tool loop hit maximum iterations");
            break TurnControl::Continue;
        };

        self.detector.set_speaking(false);
        let _ = self.runtime.synthesizer.stop_cues().await;

        // Hangup observed mid-turn takes precedence over whatever the
        // turn decided.
        if let Some(end) = self.pending_end.take() {
            return Ok(end);
        }
        Ok(control)
    }

    /// Run one completion stream to completion while watching STT and
    /// session events for barge-in and hangup.
    async fn completion_pass(
        &mut self,
        stt: &mut mpsc::Receiver<RecognitionEvent>,
        events_rx: &mut mpsc::Receiver<SessionEvent>,
        scratch: &TurnScratch,
        turn_scope: &CancelScope,
    ) -> TurnResult {
        let tier = if self.flags.slow_llm_for_chat {
            ModelTier::Slow
        } else {
            ModelTier::Fast
        };
        let messages = assemble(
            &self.call,
            &TurnContext {
                today: Utc::now(),
                search_hits: &scratch.search_hits,
                context_chars: self.runtime.context_chars,
            },
        );
        let request = CompletionRequest {
            messages,
            tools: self.runtime.registry.definitions(),
            max_tokens: 0,
        };

        let (tx, rx) = mpsc::channel::<CompletionEvent>(64);
        let driver = self.runtime.driver.clone();
        let driver_scope = turn_scope.clone();
        let driver_task = tokio::spawn(async move {
            if let Err(e) = driver.complete(&request, tier, tx, &driver_scope).await {
                debug!(err = %e, "driver finished with error");
            }
        });

        let style = Style::None;
        let params = TurnParams {
            language: self.call.lang_current_short_code.clone(),
            pivot: self.runtime.pivot_lang.clone(),
            style,
            voice: self.runtime.voice_for(style),
            soft_timeout: Duration::from_secs(self.flags.answer_soft_timeout_sec),
            hard_timeout: Duration::from_secs(self.flags.answer_hard_timeout_sec),
            max_sentence_chars: MAX_SENTENCE_CHARS,
            safety_categories: Vec::new(),
        };
        let deps = PipelineDeps {
            speaker: self.speaker.clone(),
            translator: self.runtime.translator.clone(),
            safety: self.runtime.safety.clone(),
        };
        let mut pipeline = tokio::spawn(run_response_turn(rx, deps, params, turn_scope.clone()));

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                joined = &mut pipeline => {
                    break joined.unwrap_or_else(|e| {
                        error!(err = %e, "pipeline task panicked");
                        TurnResult {
                            sentences: Vec::new(),
                            tool_calls: Vec::new(),
                            invalid_tool_calls: Vec::new(),
                            filtered: false,
                            soft_cue_played: false,
                            outcome: TurnOutcome::Failed("pipeline task failed".to_string()),
                        }
                    });
                }
                recognized = stt.recv(), if !self.stt_closed => {
                    match recognized {
                        Some(event) => {
                            if let Some(TurnSignal::BargeIn) = self.detector.on_event(&event) {
                                info!("barge-in, cancelling assistant turn");
                                turn_scope.cancel();
                                self.speaker.cancel();
                            }
                        }
                        None => self.stt_closed = true,
                    }
                }
                event = events_rx.recv(), if !self.events_closed => {
                    match event {
                        Some(event) => {
                            if let Ok(Some(end)) = self.apply_session_event(event).await {
                                info!("call ending event during assistant turn");
                                self.pending_end = Some(end);
                                turn_scope.cancel();
                                self.speaker.cancel();
                            }
                        }
                        None => self.events_closed = true,
                    }
                }
                _ = tick.tick() => {
                    // Timers stay paused for turn-end while the assistant
                    // has the floor; this keeps the idle clock honest.
                    let _ = self.detector.on_tick(Utc::now());
                }
            }
        };

        driver_task.abort();
        result
    }

    /// Dispatch the turn's tool calls sequentially, in emission order.
    async fn dispatch_tools(
        &mut self,
        result: &TurnResult,
        scratch: &mut TurnScratch,
    ) -> Vec<(ToolCallRecord, Option<CallDirective>)> {
        let mut records = Vec::new();

        for invocation in &result.tool_calls {
            let outcome = {
                let mut ctx = ToolCtx {
                    call: &mut self.call,
                    turn: &mut *scratch,
                    deps: &self.runtime.tool_deps,
                };
                self.runtime.registry.dispatch(&mut ctx, invocation).await
            };
            debug!(tool = %invocation.name, error = outcome.is_error, "tool dispatched");
            records.push((
                ToolCallRecord {
                    id: invocation.id.clone(),
                    name: invocation.name.clone(),
                    arguments: invocation.arguments.clone(),
                    result: (!outcome.is_error).then(|| outcome.content.clone()),
                    error: outcome.is_error.then(|| outcome.content.clone()),
                },
                outcome.directive,
            ));
        }

        for (id, name) in &result.invalid_tool_calls {
            records.push((
                ToolCallRecord {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: serde_json::Value::Null,
                    result: None,
                    error: Some("tool arguments were not valid JSON".to_string()),
                },
                None,
            ));
        }

        if scratch.knowledge_produced {
            self.knowledge = true;
        }
        records
    }

    /// Append the assistant message (text + tool calls) and one tool
    /// message per result, in dispatch order.
    fn append_turn_messages(
        &mut self,
        spoken: &str,
        records: Vec<(ToolCallRecord, Option<CallDirective>)>,
    ) {
        if spoken.is_empty() && records.is_empty() {
            return;
        }
        let mut assistant = Message::assistant(spoken, Style::None);
        assistant.tool_calls = records.iter().map(|(r, _)| r.clone()).collect();
        self.call.append_message(assistant);

        for (record, _) in records {
            let content = record
                .result
                .clone()
                .or(record.error.clone())
                .unwrap_or_default();
            let mut tool_message = Message::tool(&record.id, content);
            tool_message.tool_calls[0].name = record.name;
            self.call.append_message(tool_message);
        }
    }

    /// `new_claim`: finalize the current Call and continue on a fresh one
    /// for the same caller.
    async fn rollover_call(&mut self) -> Result<()> {
        info!(call_id = %self.call.call_id, "rolling over to a new claim record");

        self.call.in_progress = false;
        if self.call.next.is_none() {
            let _ = self.call.set_next(NextStep {
                action: NextAction::CaseClosed,
                justification: "caller opened a new claim in the same call".to_string(),
            });
        }
        self.save_call()?;
        self.runtime
            .dispatcher
            .dispatch_closed(&self.call.call_id, self.knowledge)
            .map_err(|e| SwitchboardError::Queue(e.to_string()))?;
        // Stop the keeper before the release so it never reports the
        // released lease as lost.
        self.lease_keeper.cancel();
        self.runtime
            .leases
            .release(self.lease.clone())
            .map_err(|e| SwitchboardError::Store(e.to_string()))?;

        let mut fresh = Call::new(self.call.initiate.clone());
        fresh.lang_current_short_code = self.call.lang_current_short_code.clone();
        fresh.in_progress = true;
        self.lease = self
            .runtime
            .leases
            .acquire(
                &fresh.call_id.lease_key(),
                Duration::from_secs(switchboard_core::config::CALL_LEASE_TTL_SECS),
            )
            .map_err(|e| SwitchboardError::Store(e.to_string()))?;
        self.runtime
            .store
            .create(&fresh)
            .map_err(|e| SwitchboardError::Store(e.to_string()))?;
        self.lease_keeper = spawn_lease_keeper(
            self.runtime.leases.clone(),
            self.lease.clone(),
            self.scope.clone(),
        );

        self.call = fresh;
        self.knowledge = false;
        Ok(())
    }

    /// The Ending state: farewell, terminal disposition, wait for the
    /// telephony disconnect, then close.
    async fn ending(
        &mut self,
        end: TurnControl,
        events_rx: &mut mpsc::Receiver<SessionEvent>,
    ) -> Result<()> {
        let TurnControl::End {
            action,
            justification,
            farewell,
            disconnected,
        } = end
        else {
            return Ok(());
        };

        if let Some(utterance) = farewell {
            self.speak_utterance(utterance).await;
            self.speaker.drain().await;
        }

        if self.call.next.is_none() {
            self.call
                .set_next(NextStep {
                    action,
                    justification,
                })
                .map_err(|e| SwitchboardError::Store(e.to_string()))?;
        }
        self.call
            .append_message(Message::system(MessageAction::Hangup, "call ending"));
        self.save_call()?;

        if !disconnected {
            // Ending → telephony_disconnected → Closed, with a grace cap
            // for gateways that never confirm.
            let deadline = tokio::time::sleep(DISCONNECT_GRACE);
            tokio::pin!(deadline);
            let scope = self.scope.clone();
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = scope.cancelled() => break,
                    event = events_rx.recv(), if !self.events_closed => match event {
                        Some(SessionEvent::Media { media: MediaEventKind::Hangup, .. }) => break,
                        Some(_) => continue,
                        None => { self.events_closed = true; break }
                    },
                }
            }
        }

        // Closed
        self.call.in_progress = false;
        self.save_call()?;
        self.lease_keeper.cancel();
        self.runtime
            .leases
            .release(self.lease.clone())
            .map_err(|e| SwitchboardError::Store(e.to_string()))?;
        self.runtime
            .dispatcher
            .dispatch_closed(&self.call.call_id, self.knowledge)
            .map_err(|e| SwitchboardError::Queue(e.to_string()))?;
        Ok(())
    }

    /// Apply a routed event. Returns an ending disposition for hangups.
    async fn apply_session_event(&mut self, event: SessionEvent) -> Result<Option<TurnControl>> {
        match event {
            SessionEvent::Media {
                event_id,
                media,
                payload,
            } => {
                if !self.record_event(&event_id) {
                    return Ok(None);
                }
                match media {
                    MediaEventKind::Hangup => {
                        self.call.append_message(Message::system(
                            MessageAction::Hangup,
                            "caller disconnected",
                        ));
                        Ok(Some(TurnControl::End {
                            action: NextAction::CaseClosed,
                            justification: "caller hung up".to_string(),
                            farewell: None,
                            disconnected: true,
                        }))
                    }
                    MediaEventKind::Transferred => {
                        self.call.append_message(Message::system(
                            MessageAction::Transfer,
                            "call transferred by the gateway",
                        ));
                        Ok(Some(TurnControl::End {
                            action: NextAction::CaseEscalated,
                            justification: "call transferred".to_string(),
                            farewell: None,
                            disconnected: true,
                        }))
                    }
                    MediaEventKind::RecordingStarted => {
                        if self.flags.recording_enabled {
                            debug!("recording started");
                        }
                        Ok(None)
                    }
                    MediaEventKind::RecordingStopped => {
                        // The gateway reports the artifact location.
                        if let Some(uri) = payload
                            .as_ref()
                            .and_then(|p| p.get("uri"))
                            .and_then(|u| u.as_str())
                        {
                            self.call.recording_uri = Some(uri.to_string());
                            self.save_call()?;
                        }
                        Ok(None)
                    }
                    MediaEventKind::Connected => Ok(None),
                }
            }
            SessionEvent::Sms {
                event_id,
                body,
                received_at,
            } => {
                if !self.record_event(&event_id) {
                    return Ok(None);
                }
                // Appended silently, with a brief spoken cue.
                self.call.append_message(Message {
                    created_at: received_at,
                    action: MessageAction::Sms,
                    persona: Persona::Human,
                    content: body,
                    style: Style::None,
                    tool_calls: Vec::new(),
                });
                self.save_call()?;
                self.speak_utterance(Utterance::SmsReceived).await;
                Ok(None)
            }
        }
    }

    /// Record an event fingerprint; `false` means duplicate.
    fn record_event(&mut self, event_id: &str) -> bool {
        let fp = EventFingerprint::new(&self.call.call_id, event_id);
        let fresh = self.call.record_event(&fp);
        if !fresh {
            debug!(%fp, "duplicate event dropped");
        }
        fresh
    }

    /// Switch the active language when STT confidently detects another
    /// available one.
    fn maybe_switch_language(&mut self, event: &RecognitionEvent) -> Result<()> {
        let Some(detected) = &event.detected_language else {
            return Ok(());
        };
        if detected == &self.call.lang_current_short_code {
            return Ok(());
        }
        let target = self
            .call
            .initiate
            .languages_available
            .iter()
            .find(|l| l.primary() == detected.primary())
            .cloned();
        if let Some(target) = target {
            info!(lang = %target, "switching call language");
            self.call
                .set_language(target)
                .map_err(|e| SwitchboardError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    async fn speak_utterance(&self, utterance: Utterance) {
        let text = utterance.text(&self.call.lang_current_short_code);
        let piece = SpeechPiece::new(
            text,
            Style::None.as_str(),
            self.call.lang_current_short_code.clone(),
            &self.runtime.voice_for(Style::None),
        );
        if let Err(e) = self.speaker.speak(piece).await {
            warn!(err = %e, "cue utterance not spoken");
        }
    }

    /// Save under the lease. A conflict here means another writer touched
    /// the document despite the lease — the holder's copy wins, up to the
    /// standard three attempts.
    fn save_call(&mut self) -> Result<()> {
        const MAX_SAVE_ATTEMPTS: u32 = 3;
        for attempt in 0..MAX_SAVE_ATTEMPTS {
            match self.runtime.store.save(&mut self.call) {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict { .. }) => {
                    warn!(attempt, call_id = %self.call.call_id, "save conflict under lease");
                    match self.runtime.store.get_by_id(&self.call.call_id) {
                        Ok(Some(fresh)) => self.call.version = fresh.version,
                        Ok(None) => {
                            return Err(SwitchboardError::FatalCall(
                                "call document vanished".to_string(),
                            ))
                        }
                        Err(e) => return Err(SwitchboardError::Store(e.to_string())),
                    }
                }
                Err(e) => return Err(SwitchboardError::Store(e.to_string())),
            }
        }
        Err(SwitchboardError::FatalCall(format!(
            "save conflicted {MAX_SAVE_ATTEMPTS} times for call {}",
            self.call.call_id
        )))
    }
}

/// Renew the lease at half its TTL until stopped. Losing the lease
/// cancels the whole call scope; the returned keeper scope stops just
/// this keeper (used when the session swaps leases on rollover).
fn spawn_lease_keeper(
    leases: Arc<LeaseManager>,
    lease: Lease,
    scope: CancelScope,
) -> CancelScope {
    let keeper = scope.child();
    let keeper_task = keeper.clone();
    tokio::spawn(async move {
        let every = lease.renew_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(every) => {
                    if let Err(e) = leases.renew(&lease) {
                        warn!(key = %lease.key, err = %e, "lease renewal failed, aborting call scope");
                        scope.cancel();
                        return;
                    }
                }
                _ = keeper_task.cancelled() => return,
            }
        }
    });
    keeper
}
