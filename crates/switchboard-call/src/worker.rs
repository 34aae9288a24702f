//! Queue consumer: turns inbound events into live call sessions.
//!
//! One worker polls `call_events` and `sms_events`, acquires the call
//! lease, and spawns one [`CallSession`] per call. Events for calls that
//! are already live on this worker are routed into the session's mailbox.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use switchboard_core::cancel::CancelScope;
use switchboard_core::config::{ConversationConfig, CALL_LEASE_TTL_SECS, SCHEMA_LEASE_TTL_SECS};
use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::types::{CallId, LangTag, PhoneNumber};
use switchboard_queue::{CallEvent, Delivery, InboundSms, QueueName};
use switchboard_store::{Call, InitiateBlock, Message, MessageAction, Persona, StoreError, Style};

use crate::orchestrator::{CallRuntime, CallSession, SessionEvent};

/// Mailbox capacity per live session.
const SESSION_MAILBOX: usize = 32;
/// Extra visibility taken while a new call is being set up.
const SETUP_VISIBILITY: Duration = Duration::from_secs(60);

struct LiveSession {
    tx: mpsc::Sender<SessionEvent>,
    phone: PhoneNumber,
}

pub struct Worker {
    runtime: Arc<CallRuntime>,
    conversation: ConversationConfig,
    poll_interval: Duration,
    drain_deadline: Duration,
    live: Arc<DashMap<CallId, LiveSession>>,
}

impl Worker {
    pub fn new(
        runtime: Arc<CallRuntime>,
        conversation: ConversationConfig,
        poll_interval: Duration,
        drain_deadline: Duration,
    ) -> Self {
        Self {
            runtime,
            conversation,
            poll_interval,
            drain_deadline,
            live: Arc::new(DashMap::new()),
        }
    }

    /// Poll until the scope is cancelled, then drain in-flight calls.
    pub async fn run(&self, scope: CancelScope) {
        info!("worker started");
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if let Err(e) = self.poll_call_events(&scope, &mut sessions).await {
                warn!(err = %e, "call_events poll failed");
            }
            if let Err(e) = self.poll_sms_events().await {
                warn!(err = %e, "sms_events poll failed");
            }
            // Reap finished sessions without blocking.
            while sessions.try_join_next().is_some() {}
        }

        info!("worker draining");
        let drained = tokio::time::timeout(self.drain_deadline, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("drain deadline passed, aborting remaining sessions");
            sessions.abort_all();
        }
        info!("worker stopped");
    }

    async fn poll_call_events(
        &self,
        scope: &CancelScope,
        sessions: &mut JoinSet<()>,
    ) -> Result<()> {
        let deliveries: Vec<Delivery<CallEvent>> = self
            .runtime
            .queue
            .receive(QueueName::CallEvents, 8)
            .map_err(|e| SwitchboardError::Queue(e.to_string()))?;

        for delivery in deliveries {
            match &delivery.body {
                CallEvent::IncomingCall {
                    caller_phone,
                    correlation_id,
                    ..
                } => {
                    debug!(%caller_phone, %correlation_id, "incoming call event");
                    let _ = self
                        .runtime
                        .queue
                        .extend(&delivery, SETUP_VISIBILITY);
                    match self.start_call(caller_phone, scope, sessions).await {
                        Ok(()) => self.ack(&delivery),
                        Err(e) => {
                            warn!(err = %e, "incoming call not started, requeueing");
                            let _ = self.runtime.queue.nack(&delivery);
                        }
                    }
                }
                CallEvent::MediaEvent {
                    call_id,
                    event_id,
                    media,
                    payload,
                } => {
                    let routed = self
                        .route_media(call_id, event_id, *media, payload.clone())
                        .await;
                    match routed {
                        Ok(()) => self.ack(&delivery),
                        Err(e) => {
                            warn!(err = %e, %call_id, "media event not handled, requeueing");
                            let _ = self.runtime.queue.nack(&delivery);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn poll_sms_events(&self) -> Result<()> {
        let deliveries: Vec<Delivery<InboundSms>> = self
            .runtime
            .queue
            .receive(QueueName::SmsEvents, 8)
            .map_err(|e| SwitchboardError::Queue(e.to_string()))?;

        for delivery in deliveries {
            match self.route_sms(&delivery.body).await {
                Ok(()) => self.ack(&delivery),
                Err(e) => {
                    warn!(err = %e, "sms event not handled, requeueing");
                    let _ = self.runtime.queue.nack(&delivery);
                }
            }
        }
        Ok(())
    }

    /// Load-or-create the Call for an inbound call and spawn its session.
    async fn start_call(
        &self,
        caller_phone: &str,
        scope: &CancelScope,
        sessions: &mut JoinSet<()>,
    ) -> Result<()> {
        let phone = PhoneNumber::parse(caller_phone)
            .map_err(SwitchboardError::Invalid)?;

        // Reuse the previous claim schema for repeat callers, under the
        // per-phone schema lease so concurrent calls agree on it.
        let schema_lease = self
            .runtime
            .leases
            .acquire(
                &phone.schema_lease_key(),
                Duration::from_secs(SCHEMA_LEASE_TTL_SECS),
            )
            .ok();
        let prior = self
            .runtime
            .store
            .get_last(&phone)
            .map_err(|e| SwitchboardError::Store(e.to_string()))?;

        // A pristine prior record is the pre-created outbound call from
        // POST /call — adopt it instead of opening a second document,
        // unless it sat unclaimed past the callback retention window.
        let retention = chrono::Duration::hours(
            self.runtime.flags.snapshot().callback_timeout_hour as i64,
        );
        let adopted = prior
            .as_ref()
            .map(|p| {
                p.messages.is_empty()
                    && p.next.is_none()
                    && !p.in_progress
                    && chrono::Utc::now() - p.created_at < retention
            })
            .unwrap_or(false);
        let call = if adopted {
            prior.clone().expect("checked above")
        } else {
            Call::new(self.initiate_for(&phone, prior.as_ref()))
        };
        if let Some(lease) = schema_lease {
            let _ = self.runtime.leases.release(lease);
        }

        let lease = match self.runtime.leases.acquire(
            &call.call_id.lease_key(),
            Duration::from_secs(CALL_LEASE_TTL_SECS),
        ) {
            Ok(lease) => lease,
            Err(StoreError::LeaseBusy { .. }) => {
                debug!(call_id = %call.call_id, "call lease held elsewhere, skipping");
                return Ok(());
            }
            Err(e) => return Err(SwitchboardError::Store(e.to_string())),
        };
        if !adopted {
            self.runtime
                .store
                .create(&call)
                .map_err(|e| SwitchboardError::Store(e.to_string()))?;
        }

        self.spawn_session(call, lease, scope, sessions);
        Ok(())
    }

    fn spawn_session(
        &self,
        call: Call,
        lease: switchboard_store::Lease,
        scope: &CancelScope,
        sessions: &mut JoinSet<()>,
    ) {
        let call_id = call.call_id.clone();
        let phone = call.caller_phone().clone();
        let (tx, rx) = mpsc::channel(SESSION_MAILBOX);
        self.live.insert(call_id.clone(), LiveSession { tx, phone });

        let runtime = self.runtime.clone();
        let call_scope = scope.child();
        let live = self.live.clone();
        let id_for_cleanup = call_id.clone();
        sessions.spawn(async move {
            match CallSession::run(runtime, call, lease, rx, call_scope).await {
                Ok(outcome) => debug!(call_id = %outcome.call_id, closed = outcome.closed, "session finished"),
                Err(e) => warn!(err = %e, "session failed"),
            }
            live.remove(&id_for_cleanup);
        });
        info!(%call_id, "session spawned");
    }

    /// Forward a media event to its live session, or settle the call
    /// directly when no session holds it here.
    async fn route_media(
        &self,
        call_id: &CallId,
        event_id: &str,
        media: switchboard_queue::MediaEventKind,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        // Clone the sender out so no map guard is held across the await.
        let live_tx = self.live.get(call_id).map(|session| session.tx.clone());
        if let Some(tx) = live_tx {
            let event = SessionEvent::Media {
                event_id: event_id.to_string(),
                media,
                payload,
            };
            return tx
                .send(event)
                .await
                .map_err(|_| SwitchboardError::Internal("session mailbox closed".to_string()));
        }

        // No live session on this worker. A hangup for a resumable call is
        // settled directly under the lease; everything else is dropped.
        if media != switchboard_queue::MediaEventKind::Hangup {
            debug!(%call_id, ?media, "media event for inactive call dropped");
            return Ok(());
        }

        let Some(mut call) = self
            .runtime
            .store
            .get_by_id(call_id)
            .map_err(|e| SwitchboardError::Store(e.to_string()))?
        else {
            debug!(%call_id, "hangup for unknown call dropped");
            return Ok(());
        };

        let lease = self
            .runtime
            .leases
            .acquire(
                &call_id.lease_key(),
                Duration::from_secs(CALL_LEASE_TTL_SECS),
            )
            .map_err(|e| SwitchboardError::Store(e.to_string()))?;

        let fp = switchboard_core::types::EventFingerprint::new(call_id, event_id);
        if call.record_event(&fp) {
            call.append_message(Message::system(MessageAction::Hangup, "caller disconnected"));
            call.in_progress = false;
            if call.next.is_none() {
                let _ = call.set_next(switchboard_store::NextStep {
                    action: switchboard_store::NextAction::CaseClosed,
                    justification: "caller hung up".to_string(),
                });
            }
            self.runtime
                .store
                .save(&mut call)
                .map_err(|e| SwitchboardError::Store(e.to_string()))?;
            self.runtime
                .dispatcher
                .dispatch_closed(call_id, false)
                .map_err(|e| SwitchboardError::Queue(e.to_string()))?;
        }
        let _ = self.runtime.leases.release(lease);
        Ok(())
    }

    /// Route an inbound SMS to the live call for that number, or record
    /// it as an SMS-only document.
    async fn route_sms(&self, sms: &InboundSms) -> Result<()> {
        let phone = PhoneNumber::parse(&sms.from)
            .map_err(SwitchboardError::Invalid)?;

        let live_tx = self
            .live
            .iter()
            .find(|entry| entry.value().phone == phone)
            .map(|entry| entry.value().tx.clone());

        if let Some(tx) = live_tx {
            let event = SessionEvent::Sms {
                event_id: sms.event_id.clone(),
                body: sms.body.clone(),
                received_at: sms.received_at,
            };
            return tx
                .send(event)
                .await
                .map_err(|_| SwitchboardError::Internal("session mailbox closed".to_string()));
        }

        // SMS outside any call: a standalone record, no conversation.
        let mut call = Call::new(self.initiate_for(&phone, None));
        call.append_message(Message {
            created_at: sms.received_at,
            action: MessageAction::Sms,
            persona: Persona::Human,
            content: sms.body.clone(),
            style: Style::None,
            tool_calls: Vec::new(),
        });
        self.runtime
            .store
            .create(&call)
            .map_err(|e| SwitchboardError::Store(e.to_string()))?;
        info!(call_id = %call.call_id, "sms-only record created");
        Ok(())
    }

    /// Build the initiate block for a fresh inbound call, reusing the
    /// prior claim schema for repeat callers.
    fn initiate_for(&self, phone: &PhoneNumber, prior: Option<&Call>) -> InitiateBlock {
        let claim_schema = prior
            .map(|c| c.initiate.claim_schema.clone())
            .unwrap_or_default();
        let task_description = prior
            .map(|c| c.initiate.task_description.clone())
            .unwrap_or_else(|| "Assist the caller with their request".to_string());
        InitiateBlock {
            bot_name: self.conversation.bot_name.clone(),
            bot_company: self.conversation.bot_company.clone(),
            agent_phone_number: self.conversation.agent_phone_number.clone(),
            caller_phone_number: phone.clone(),
            lang_default: LangTag::new(&self.conversation.default_lang),
            languages_available: self
                .conversation
                .languages_available
                .iter()
                .map(|l| LangTag::new(l))
                .collect(),
            task_description,
            claim_schema,
            prompts_overrides: None,
        }
    }

    fn ack<T>(&self, delivery: &Delivery<T>) {
        if let Err(e) = self.runtime.queue.ack(delivery) {
            warn!(err = %e, "ack failed, message may redeliver");
        }
    }
}
