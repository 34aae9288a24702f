//! Serialized speech emission.
//!
//! All synthesis for a call funnels through one queue task so chunks
//! never overlap. Cancellation (barge-in) bumps a generation counter:
//! queued pieces from the old generation are discarded without being
//! synthesized, and the in-flight piece's scope is cancelled so the
//! next not-yet-played chunk is dropped rather than waited for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use switchboard_core::cancel::CancelScope;

use crate::tts::{SpeechPiece, SpeechSynthesizer};
use crate::Result;

struct QueuedPiece {
    piece: SpeechPiece,
    generation: u64,
    seq: u64,
}

#[derive(Clone)]
pub struct SpeakerHandle {
    tx: mpsc::Sender<QueuedPiece>,
    generation: Arc<AtomicU64>,
    enqueued: Arc<AtomicU64>,
    played: Arc<AtomicU64>,
    spoken_rx: watch::Receiver<u64>,
    inflight_cancel: Arc<std::sync::Mutex<CancelScope>>,
}

impl SpeakerHandle {
    /// Enqueue a piece. Blocks (cooperatively) when the queue is full —
    /// this is the backpressure that pauses sentence extraction upstream.
    pub async fn speak(&self, piece: SpeechPiece) -> Result<u64> {
        let seq = self.enqueued.fetch_add(1, Ordering::SeqCst) + 1;
        let queued = QueuedPiece {
            piece,
            generation: self.generation.load(Ordering::SeqCst),
            seq,
        };
        self.tx
            .send(queued)
            .await
            .map_err(|_| crate::MediaError::Synthesis("speaker queue closed".to_string()))?;
        Ok(seq)
    }

    /// Barge-in: discard everything queued and cut the in-flight piece.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inflight_cancel.lock().unwrap().cancel();
        debug!("speaker cancelled, pending pieces dropped");
    }

    /// Wait until every piece enqueued *so far* has been spoken or
    /// discarded. Used to detect "all sentences flushed".
    pub async fn drain(&self) {
        let target = self.enqueued.load(Ordering::SeqCst);
        let mut rx = self.spoken_rx.clone();
        while *rx.borrow() < target {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sequence number of the last piece fully processed.
    pub fn spoken_seq(&self) -> u64 {
        *self.spoken_rx.borrow()
    }

    /// Sequence number of the last piece that finished playing. A piece
    /// cut mid-synthesis by [`SpeakerHandle::cancel`] never counts.
    pub fn played_seq(&self) -> u64 {
        self.played.load(Ordering::SeqCst)
    }
}

pub struct SpeakerQueue;

impl SpeakerQueue {
    /// Spawn the emitter task for one call. `capacity` bounds the queue
    /// (sentence backpressure); the task exits when the handle is dropped
    /// or the call scope is cancelled.
    pub fn spawn(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        capacity: usize,
        call_scope: &CancelScope,
    ) -> SpeakerHandle {
        let (tx, mut rx) = mpsc::channel::<QueuedPiece>(capacity);
        let (spoken_tx, spoken_rx) = watch::channel(0u64);
        let generation = Arc::new(AtomicU64::new(0));
        let enqueued = Arc::new(AtomicU64::new(0));
        let played = Arc::new(AtomicU64::new(0));
        let inflight_cancel = Arc::new(std::sync::Mutex::new(call_scope.child()));

        let handle = SpeakerHandle {
            tx,
            generation: generation.clone(),
            enqueued: enqueued.clone(),
            played: played.clone(),
            spoken_rx,
            inflight_cancel: inflight_cancel.clone(),
        };

        let scope = call_scope.clone();
        tokio::spawn(async move {
            loop {
                let queued = tokio::select! {
                    q = rx.recv() => match q {
                        Some(q) => q,
                        None => return,
                    },
                    _ = scope.cancelled() => return,
                };

                let current_gen = generation.load(Ordering::SeqCst);
                if queued.generation < current_gen {
                    // Stale piece from before a barge-in — drop silently.
                    let _ = spoken_tx.send(queued.seq);
                    continue;
                }

                // Fresh scope per piece so a cancel only cuts this one.
                let piece_scope = scope.child();
                *inflight_cancel.lock().unwrap() = piece_scope.clone();

                match synthesizer.synthesize(&queued.piece, &piece_scope).await {
                    Ok(()) => {
                        played.store(queued.seq, Ordering::SeqCst);
                    }
                    Err(e) => warn!(err = %e, "synthesis cut or failed, piece skipped"),
                }
                let _ = spoken_tx.send(queued.seq);
            }
        });

        handle
    }
}
