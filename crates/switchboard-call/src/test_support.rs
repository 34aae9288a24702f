//! Shared fixtures for session and worker tests: an in-memory runtime
//! with a scripted LLM, scripted recognizer, and recording synthesizer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::mpsc;

use switchboard_core::cancel::CancelScope;
use switchboard_core::flags::{FlagService, FlagSource};
use switchboard_core::types::{LangTag, PhoneNumber};
use switchboard_llm::driver::TieredDriver;
use switchboard_llm::provider::{CompletionRequest, LlmProvider, ProviderError};
use switchboard_llm::stream::CompletionEvent;
use switchboard_media::mock::{RecordingSynthesizer, ScriptStep, ScriptedRecognizer};
use switchboard_queue::{BackgroundDispatcher, WorkQueue};
use switchboard_store::{CallStore, ClaimField, ClaimFieldType, InitiateBlock, LeaseManager};
use switchboard_tools::{SmsOutbox, ToolDeps, ToolRegistry};

use crate::orchestrator::CallRuntime;

pub(crate) struct ScriptedLlm {
    turns: Mutex<VecDeque<Vec<CompletionEvent>>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Vec<CompletionEvent>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete_stream(
        &self,
        _req: &CompletionRequest,
        tx: mpsc::Sender<CompletionEvent>,
        _cancel: &CancelScope,
    ) -> Result<(), ProviderError> {
        let events = self.turns.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![
                CompletionEvent::TextDelta {
                    text: "Entendu.".to_string(),
                },
                CompletionEvent::Done {
                    finish_reason: "stop".to_string(),
                },
            ]
        });
        for event in events {
            if tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

struct EmptyFlags;

impl FlagSource for EmptyFlags {
    fn load(&self) -> switchboard_core::error::Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

struct NullOutbox;

#[async_trait]
impl SmsOutbox for NullOutbox {
    async fn enqueue(&self, _to: &PhoneNumber, _body: &str) -> Result<(), String> {
        Ok(())
    }
}

pub(crate) fn mem_runtime(
    llm_turns: Vec<Vec<CompletionEvent>>,
    recognizer_script: Vec<ScriptStep>,
) -> (Arc<CallRuntime>, Arc<RecordingSynthesizer>, Arc<WorkQueue>) {
    let synthesizer = Arc::new(RecordingSynthesizer::default());
    let queue = Arc::new(
        WorkQueue::new(Connection::open_in_memory().unwrap(), Duration::from_secs(30)).unwrap(),
    );
    let runtime = Arc::new(CallRuntime {
        store: Arc::new(CallStore::new(Connection::open_in_memory().unwrap()).unwrap()),
        leases: Arc::new(LeaseManager::new(Connection::open_in_memory().unwrap()).unwrap()),
        queue: queue.clone(),
        dispatcher: Arc::new(
            BackgroundDispatcher::new(queue.clone(), Connection::open_in_memory().unwrap())
                .unwrap(),
        ),
        driver: Arc::new(TieredDriver::new(
            Box::new(ScriptedLlm::new(llm_turns)),
            Box::new(ScriptedLlm::new(Vec::new())),
            1,
        )),
        registry: Arc::new(ToolRegistry::builtin()),
        tool_deps: ToolDeps {
            search: None,
            sms: Arc::new(NullOutbox),
        },
        recognizer: Arc::new(ScriptedRecognizer::new(recognizer_script)),
        synthesizer: synthesizer.clone(),
        translator: None,
        safety: None,
        flags: Arc::new(FlagService::new(Arc::new(EmptyFlags))),
        voice: "neutral-1".to_string(),
        voice_styles: HashMap::new(),
        pivot_lang: LangTag::new("fr-FR"),
        context_chars: 24_000,
    });
    (runtime, synthesizer, queue)
}

pub(crate) fn sample_initiate(phone: &str) -> InitiateBlock {
    InitiateBlock {
        bot_name: "Emma".to_string(),
        bot_company: "Contoso Assurance".to_string(),
        agent_phone_number: "+33100000000".to_string(),
        caller_phone_number: PhoneNumber::parse(phone).unwrap(),
        lang_default: LangTag::new("fr-FR"),
        languages_available: vec![LangTag::new("fr-FR"), LangTag::new("en-US")],
        task_description: "File an insurance claim".to_string(),
        claim_schema: vec![ClaimField {
            name: "policy_number".to_string(),
            field_type: ClaimFieldType::Text,
            description: None,
        }],
        prompts_overrides: None,
    }
}
