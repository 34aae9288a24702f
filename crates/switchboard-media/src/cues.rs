//! Pre-authored audio: looping cues and the small utterance set the
//! caller hears instead of raw error text.

use switchboard_core::types::LangTag;

/// Loopable background sounds controlled by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    /// Soft "mmm" loop while the model is thinking.
    ThinkingLoop,
    /// Gentle noise floor while waiting for the caller.
    NoiseFloor,
}

impl SoundCue {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoundCue::ThinkingLoop => "thinking_loop",
            SoundCue::NoiseFloor => "noise_floor",
        }
    }
}

/// The fixed utterance set. Callers never hear raw error text — one of
/// these plays instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utterance {
    Hello,
    Hold,
    StillWorking,
    ReEngage,
    Apology,
    TransferComing,
    Goodbye,
    SmsReceived,
    ClaimAcknowledged,
}

impl Utterance {
    /// Text for the given language; anything unrecognised falls back to
    /// English.
    pub fn text(&self, lang: &LangTag) -> &'static str {
        match lang.primary() {
            "fr" => self.fr(),
            _ => self.en(),
        }
    }

    fn fr(&self) -> &'static str {
        match self {
            Utterance::Hello => "Bonjour, je suis votre assistante. Comment puis-je vous aider ?",
            Utterance::Hold => "Un instant s'il vous plaît.",
            Utterance::StillWorking => "Je suis toujours là, encore un instant.",
            Utterance::ReEngage => "Êtes-vous toujours en ligne ? Je vous écoute.",
            Utterance::Apology => {
                "Je suis désolée, j'ai rencontré un problème. Pouvez-vous répéter ?"
            }
            Utterance::TransferComing => "Je vous transfère à un conseiller, ne quittez pas.",
            Utterance::Goodbye => "Merci pour votre appel, au revoir.",
            Utterance::SmsReceived => "J'ai bien reçu votre message.",
            Utterance::ClaimAcknowledged => "C'est noté.",
        }
    }

    fn en(&self) -> &'static str {
        match self {
            Utterance::Hello => "Hello, this is your assistant. How can I help you today?",
            Utterance::Hold => "One moment please.",
            Utterance::StillWorking => "I'm still here, just a moment longer.",
            Utterance::ReEngage => "Are you still on the line? I'm listening.",
            Utterance::Apology => "I'm sorry, I ran into a problem. Could you say that again?",
            Utterance::TransferComing => "I'm transferring you to an agent, please hold.",
            Utterance::Goodbye => "Thank you for calling, goodbye.",
            Utterance::SmsReceived => "I've received your message.",
            Utterance::ClaimAcknowledged => "Noted.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn french_and_fallback() {
        assert!(Utterance::Apology.text(&LangTag::new("fr-FR")).starts_with("Je suis désolée"));
        assert!(Utterance::Apology.text(&LangTag::new("de-DE")).starts_with("I'm sorry"));
    }
}
