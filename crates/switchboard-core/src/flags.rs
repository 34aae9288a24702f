//! Runtime-tunable parameters with bounded staleness.
//!
//! Flags live in the key-value config store and are served as an immutable
//! snapshot, re-read at most every `ttl_sec`. A call scope receives the
//! snapshot once at start; live updates only affect subsequent turns.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

/// Where flag values come from (the store crate provides the SQLite impl).
pub trait FlagSource: Send + Sync {
    fn load(&self) -> crate::error::Result<HashMap<String, String>>;
}

/// Immutable view of every tunable key, with defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagSnapshot {
    /// Hard abort for a turn with no full response (seconds).
    pub answer_hard_timeout_sec: u64,
    /// "Still working" cue threshold (seconds).
    pub answer_soft_timeout_sec: u64,
    /// Retention before a call is considered stale (hours).
    pub callback_timeout_hour: u64,
    /// Continuous-silence threshold before a re-engagement utterance.
    pub phone_silence_timeout_sec: u64,
    /// STT reconnect cap.
    pub recognition_retry_max: u32,
    /// Record media to the object store.
    pub recording_enabled: bool,
    /// Force the slow tier for conversational turns.
    pub slow_llm_for_chat: bool,
    /// Silence window closing a final recognition (milliseconds).
    pub vad_silence_timeout_ms: u64,
    /// Barge-in cancellation budget (milliseconds).
    pub vad_cutoff_timeout_ms: u64,
    /// VAD sensitivity, clamped to 0.1–1.0.
    pub vad_threshold: f64,
    /// Snapshot refresh interval (seconds).
    pub ttl_sec: u64,
}

impl Default for FlagSnapshot {
    fn default() -> Self {
        Self {
            answer_hard_timeout_sec: 15,
            answer_soft_timeout_sec: 4,
            callback_timeout_hour: 3,
            phone_silence_timeout_sec: 20,
            recognition_retry_max: 3,
            recording_enabled: false,
            slow_llm_for_chat: false,
            vad_silence_timeout_ms: 500,
            vad_cutoff_timeout_ms: 250,
            vad_threshold: 0.5,
            ttl_sec: 60,
        }
    }
}

impl FlagSnapshot {
    /// Build a snapshot from raw key/value pairs. Unknown keys are ignored;
    /// unparseable values keep their default and log a warning.
    pub fn from_values(values: &HashMap<String, String>) -> Self {
        let mut snap = Self::default();
        for (key, raw) in values {
            let ok = match key.as_str() {
                "answer_hard_timeout_sec" => parse_into(raw, &mut snap.answer_hard_timeout_sec),
                "answer_soft_timeout_sec" => parse_into(raw, &mut snap.answer_soft_timeout_sec),
                "callback_timeout_hour" => parse_into(raw, &mut snap.callback_timeout_hour),
                "phone_silence_timeout_sec" => parse_into(raw, &mut snap.phone_silence_timeout_sec),
                "recognition_retry_max" => parse_into(raw, &mut snap.recognition_retry_max),
                "recording_enabled" => parse_into(raw, &mut snap.recording_enabled),
                "slow_llm_for_chat" => parse_into(raw, &mut snap.slow_llm_for_chat),
                "vad_silence_timeout_ms" => parse_into(raw, &mut snap.vad_silence_timeout_ms),
                "vad_cutoff_timeout_ms" => parse_into(raw, &mut snap.vad_cutoff_timeout_ms),
                "vad_threshold" => parse_into(raw, &mut snap.vad_threshold),
                "ttl_sec" => parse_into(raw, &mut snap.ttl_sec),
                _ => continue,
            };
            if !ok {
                warn!(%key, value = %raw, "flag value unparseable, keeping default");
            }
        }
        snap.vad_threshold = snap.vad_threshold.clamp(0.1, 1.0);
        snap
    }
}

fn parse_into<T: std::str::FromStr>(raw: &str, slot: &mut T) -> bool {
    match raw.parse::<T>() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(_) => false,
    }
}

struct Cached {
    snapshot: Arc<FlagSnapshot>,
    loaded_at: Instant,
}

/// Serves [`FlagSnapshot`]s, refreshing from the source when the cached
/// copy is older than its own `ttl_sec`. A failed refresh keeps serving
/// the previous snapshot.
pub struct FlagService {
    source: Arc<dyn FlagSource>,
    cached: RwLock<Cached>,
}

impl FlagService {
    pub fn new(source: Arc<dyn FlagSource>) -> Self {
        let snapshot = Arc::new(Self::load_from(&*source));
        Self {
            source,
            cached: RwLock::new(Cached {
                snapshot,
                loaded_at: Instant::now(),
            }),
        }
    }

    /// Current snapshot, re-reading the source if the cache is stale.
    pub fn snapshot(&self) -> Arc<FlagSnapshot> {
        {
            let cached = self.cached.read().unwrap();
            if cached.loaded_at.elapsed() < Duration::from_secs(cached.snapshot.ttl_sec) {
                return cached.snapshot.clone();
            }
        }
        let fresh = Arc::new(Self::load_from(&*self.source));
        let mut cached = self.cached.write().unwrap();
        cached.snapshot = fresh.clone();
        cached.loaded_at = Instant::now();
        fresh
    }

    fn load_from(source: &dyn FlagSource) -> FlagSnapshot {
        match source.load() {
            Ok(values) => FlagSnapshot::from_values(&values),
            Err(e) => {
                warn!(err = %e, "flag source unavailable, using defaults");
                FlagSnapshot::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapSource(HashMap<String, String>);

    impl FlagSource for MapSource {
        fn load(&self) -> crate::error::Result<HashMap<String, String>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn defaults_are_the_documented_ones() {
        let snap = FlagSnapshot::default();
        assert_eq!(snap.answer_hard_timeout_sec, 15);
        assert_eq!(snap.answer_soft_timeout_sec, 4);
        assert_eq!(snap.phone_silence_timeout_sec, 20);
        assert_eq!(snap.vad_silence_timeout_ms, 500);
        assert_eq!(snap.vad_cutoff_timeout_ms, 250);
        assert!(!snap.recording_enabled);
        assert!(!snap.slow_llm_for_chat);
    }

    #[test]
    fn overrides_and_bad_values() {
        let mut values = HashMap::new();
        values.insert("answer_hard_timeout_sec".into(), "30".into());
        values.insert("slow_llm_for_chat".into(), "true".into());
        values.insert("vad_threshold".into(), "5.0".into());
        values.insert("phone_silence_timeout_sec".into(), "soon".into());
        let snap = FlagSnapshot::from_values(&values);
        assert_eq!(snap.answer_hard_timeout_sec, 30);
        assert!(snap.slow_llm_for_chat);
        // clamped into the documented range
        assert_eq!(snap.vad_threshold, 1.0);
        // unparseable keeps the default
        assert_eq!(snap.phone_silence_timeout_sec, 20);
    }

    #[test]
    fn service_serves_source_values() {
        let mut values = HashMap::new();
        values.insert("answer_soft_timeout_sec".into(), "2".into());
        let service = FlagService::new(Arc::new(MapSource(values)));
        assert_eq!(service.snapshot().answer_soft_timeout_sec, 2);
    }
}
