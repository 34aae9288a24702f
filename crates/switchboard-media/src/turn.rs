//! Decides when the caller has finished a turn.
//!
//! Events are processed strictly in arrival order, so when a turn-end and
//! a barge-in race, the signal whose triggering event arrived first wins.

use std::time::Duration;

use chrono::{DateTime, Utc};

use switchboard_core::flags::FlagSnapshot;

use crate::stt::{RecognitionEvent, RecognitionKind};

#[derive(Debug, Clone, Copy)]
pub struct TurnThresholds {
    /// Silence window after a final recognition that closes the turn.
    pub vad_silence: Duration,
    /// Budget for cutting speech on barge-in (used by the pipeline).
    pub vad_cutoff: Duration,
    /// Continuous silence before a re-engagement utterance.
    pub phone_silence: Duration,
}

impl TurnThresholds {
    pub fn from_flags(flags: &FlagSnapshot) -> Self {
        Self {
            vad_silence: Duration::from_millis(flags.vad_silence_timeout_ms),
            vad_cutoff: Duration::from_millis(flags.vad_cutoff_timeout_ms),
            phone_silence: Duration::from_secs(flags.phone_silence_timeout_sec),
        }
    }
}

impl Default for TurnThresholds {
    fn default() -> Self {
        Self::from_flags(&FlagSnapshot::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnSignal {
    /// The caller finished speaking; the collected utterance text.
    TurnEnded(String),
    /// The caller started speaking while the bot was talking.
    BargeIn,
    /// Nothing heard for the phone-silence window.
    IdleWarn,
}

#[derive(Debug)]
pub struct TurnDetector {
    thresholds: TurnThresholds,
    speaking: bool,
    barge_reported: bool,
    /// Committed utterance texts for the turn being collected.
    collected: Vec<String>,
    /// Latest uncommitted hypothesis; superseded by each partial/final.
    pending_partial: String,
    last_final_at: Option<DateTime<Utc>>,
    /// Last caller activity (speech) or explicit reset; drives IdleWarn.
    idle_since: DateTime<Utc>,
}

impl TurnDetector {
    pub fn new(thresholds: TurnThresholds, now: DateTime<Utc>) -> Self {
        Self {
            thresholds,
            speaking: false,
            barge_reported: false,
            collected: Vec::new(),
            pending_partial: String::new(),
            last_final_at: None,
            idle_since: now,
        }
    }

    pub fn thresholds(&self) -> &TurnThresholds {
        &self.thresholds
    }

    /// Tell the detector whether the response pipeline is speaking.
    /// While speaking, caller speech raises `BargeIn` instead of ending
    /// a turn.
    pub fn set_speaking(&mut self, speaking: bool) {
        self.speaking = speaking;
        if !speaking {
            self.barge_reported = false;
        }
    }

    /// Restart the idle clock (after the bot finished speaking or a
    /// re-engagement was played).
    pub fn reset_idle(&mut self, now: DateTime<Utc>) {
        self.idle_since = now;
    }

    /// Text collected so far for the current turn.
    pub fn collected_text(&self) -> String {
        let mut parts: Vec<&str> = self.collected.iter().map(String::as_str).collect();
        if !self.pending_partial.is_empty() {
            parts.push(&self.pending_partial);
        }
        parts.join(" ").trim().to_string()
    }

    /// Feed one recognition event.
    pub fn on_event(&mut self, event: &RecognitionEvent) -> Option<TurnSignal> {
        match event.kind {
            RecognitionKind::Partial => {
                self.pending_partial = event.text.clone();
                self.idle_since = event.at;
                if self.speaking && !self.barge_reported {
                    self.barge_reported = true;
                    return Some(TurnSignal::BargeIn);
                }
                None
            }
            RecognitionKind::Final => {
                if !event.text.trim().is_empty() {
                    self.collected.push(event.text.trim().to_string());
                }
                self.pending_partial.clear();
                self.last_final_at = Some(event.at);
                self.idle_since = event.at;
                if self.speaking && !self.barge_reported {
                    self.barge_reported = true;
                    return Some(TurnSignal::BargeIn);
                }
                None
            }
            RecognitionKind::Silence => None,
            RecognitionKind::RecognitionComplete => {
                // With nothing collected this is a no-op.
                if self.collected_text().is_empty() {
                    return None;
                }
                if self.speaking {
                    return None;
                }
                Some(self.end_turn(event.at))
            }
        }
    }

    /// Advance timers. Call at a cadence well under the smallest
    /// threshold (the orchestrator ticks every 100 ms).
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Option<TurnSignal> {
        if !self.speaking {
            if let Some(final_at) = self.last_final_at {
                let quiet = self.pending_partial.is_empty();
                let elapsed = (now - final_at).to_std().unwrap_or_default();
                if quiet && elapsed >= self.thresholds.vad_silence && !self.collected.is_empty() {
                    return Some(self.end_turn(now));
                }
            }
        }

        if self.collected.is_empty() && self.pending_partial.is_empty() {
            let idle = (now - self.idle_since).to_std().unwrap_or_default();
            if idle >= self.thresholds.phone_silence {
                self.idle_since = now;
                return Some(TurnSignal::IdleWarn);
            }
        }
        None
    }

    fn end_turn(&mut self, now: DateTime<Utc>) -> TurnSignal {
        let text = self.collected_text();
        self.collected.clear();
        self.pending_partial.clear();
        self.last_final_at = None;
        self.idle_since = now;
        TurnSignal::TurnEnded(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn detector(now: DateTime<Utc>) -> TurnDetector {
        TurnDetector::new(TurnThresholds::default(), now)
    }

    fn at(base: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
        base + ChronoDuration::milliseconds(ms)
    }

    fn event(kind: RecognitionKind, text: &str, when: DateTime<Utc>) -> RecognitionEvent {
        RecognitionEvent {
            kind,
            text: text.to_string(),
            detected_language: None,
            at: when,
        }
    }

    #[test]
    fn turn_ends_after_silence_window() {
        let t0 = Utc::now();
        let mut d = detector(t0);

        d.on_event(&event(RecognitionKind::Partial, "je veux", at(t0, 100)));
        d.on_event(&event(
            RecognitionKind::Final,
            "je veux déclarer un sinistre",
            at(t0, 900),
        ));

        // 400 ms of silence, not yet
        assert_eq!(d.on_tick(at(t0, 1300)), None);
        // 500 ms, turn over
        match d.on_tick(at(t0, 1400)) {
            Some(TurnSignal::TurnEnded(text)) => {
                assert_eq!(text, "je veux déclarer un sinistre")
            }
            other => panic!("unexpected: {other:?}"),
        }
        // detector is reset for the next turn
        assert!(d.collected_text().is_empty());
    }

    #[test]
    fn recognition_complete_ends_turn_immediately() {
        let t0 = Utc::now();
        let mut d = detector(t0);
        d.on_event(&event(RecognitionKind::Final, "ma police est B01371946", at(t0, 500)));
        match d.on_event(&event(RecognitionKind::RecognitionComplete, "", at(t0, 600))) {
            Some(TurnSignal::TurnEnded(text)) => assert_eq!(text, "ma police est B01371946"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn recognition_complete_with_nothing_collected_is_noop() {
        let t0 = Utc::now();
        let mut d = detector(t0);
        assert_eq!(
            d.on_event(&event(RecognitionKind::RecognitionComplete, "", at(t0, 100))),
            None
        );
    }

    #[test]
    fn partial_while_speaking_is_barge_in() {
        let t0 = Utc::now();
        let mut d = detector(t0);
        d.set_speaking(true);

        match d.on_event(&event(RecognitionKind::Partial, "Attendez", at(t0, 100))) {
            Some(TurnSignal::BargeIn) => {}
            other => panic!("unexpected: {other:?}"),
        }
        // only one barge-in per speaking phase
        assert_eq!(
            d.on_event(&event(RecognitionKind::Partial, "Attendez une", at(t0, 200))),
            None
        );

        // the interrupting speech is collected for the next turn
        d.set_speaking(false);
        d.on_event(&event(RecognitionKind::Final, "Attendez une seconde", at(t0, 700)));
        match d.on_tick(at(t0, 1300)) {
            Some(TurnSignal::TurnEnded(text)) => assert_eq!(text, "Attendez une seconde"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn no_turn_end_while_speaking() {
        let t0 = Utc::now();
        let mut d = detector(t0);
        d.set_speaking(true);
        d.on_event(&event(RecognitionKind::Final, "stop", at(t0, 100)));
        // silence window passes, but the pipeline is still speaking
        assert_eq!(d.on_tick(at(t0, 2000)), None);
    }

    #[test]
    fn multiple_finals_accumulate_in_order() {
        let t0 = Utc::now();
        let mut d = detector(t0);
        d.on_event(&event(RecognitionKind::Final, "ma police", at(t0, 100)));
        d.on_event(&event(RecognitionKind::Final, "est B01371946", at(t0, 400)));
        match d.on_tick(at(t0, 1000)) {
            Some(TurnSignal::TurnEnded(text)) => assert_eq!(text, "ma police est B01371946"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn idle_warn_after_phone_silence() {
        let t0 = Utc::now();
        let mut d = detector(t0);
        assert_eq!(d.on_tick(at(t0, 19_000)), None);
        assert_eq!(d.on_tick(at(t0, 20_000)), Some(TurnSignal::IdleWarn));
        // timer restarts after the warn
        assert_eq!(d.on_tick(at(t0, 21_000)), None);
        assert_eq!(d.on_tick(at(t0, 40_000)), Some(TurnSignal::IdleWarn));
    }

    #[test]
    fn speech_resets_idle_clock() {
        let t0 = Utc::now();
        let mut d = detector(t0);
        d.on_event(&event(RecognitionKind::Partial, "euh", at(t0, 15_000)));
        // hypothesis pending, so no idle warn while the caller is mid-word
        assert_eq!(d.on_tick(at(t0, 36_000)), None);
    }

    #[test]
    fn thresholds_track_flags() {
        let mut flags = FlagSnapshot::default();
        flags.vad_silence_timeout_ms = 800;
        flags.phone_silence_timeout_sec = 10;
        let t = TurnThresholds::from_flags(&flags);
        assert_eq!(t.vad_silence, Duration::from_millis(800));
        assert_eq!(t.phone_silence, Duration::from_secs(10));
    }
}
