use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use aria::store::{SessionFilter, SessionStore};
use aria::types::{
    AgentState, ChatMessage, CronJob, MessageRole, PayloadType, Session, SessionStatus,
    SessionType,
};

fn session(agent_id: &str) -> Session {
    let now = Utc::now();
    Session {
        id: Uuid::new_v4(),
        agent_id: agent_id.to_string(),
        session_type: SessionType::Chat,
        title: None,
        model: None,
        temperature: 0.7,
        max_tokens: 4096,
        context_window: 50,
        system_prompt: None,
        status: SessionStatus::Active,
        message_count: 0,
        total_tokens: 0,
        total_cost: 0.0,
        created_at: now,
        updated_at: now,
        ended_at: None,
        metadata: serde_json::json!({"origin": "test"}),
    }
}

async fn store() -> SessionStore {
    SessionStore::connect("sqlite::memory:").await.unwrap()
}

#[tokio::test]
async fn session_round_trips_with_metadata() {
    let store = store().await;
    let created = session("main");
    store.create_session(&created).await.unwrap();

    let loaded = store.get_session(created.id).await.unwrap().unwrap();
    assert_eq!(loaded.agent_id, "main");
    assert_eq!(loaded.metadata["origin"], "test");
    assert_eq!(loaded.status, SessionStatus::Active);
}

#[tokio::test]
async fn messages_keep_tool_plumbing_and_order() {
    let store = store().await;
    let s = session("main");
    store.create_session(&s).await.unwrap();

    let mut assistant = ChatMessage::new(s.id, MessageRole::Assistant, "checking");
    assistant.tool_calls = vec![aria::types::ToolCall {
        id: "call_9".to_string(),
        name: "memory__search".to_string(),
        arguments: "{\"q\":\"x\"}".to_string(),
    }];
    let mut tool = ChatMessage::new(s.id, MessageRole::Tool, "{\"hits\":2}");
    tool.tool_call_id = Some("call_9".to_string());

    store.insert_message(&assistant).await.unwrap();
    store.insert_message(&tool).await.unwrap();

    let messages = store.get_messages(s.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].tool_calls[0].name, "memory__search");
    assert_eq!(messages[1].tool_call_id.as_deref(), Some("call_9"));
}

#[tokio::test]
async fn counters_update_in_their_own_transaction() {
    let store = store().await;
    let s = session("main");
    store.create_session(&s).await.unwrap();

    store
        .update_session_counters(s.id, 3, 120, 0.01)
        .await
        .unwrap();
    let loaded = store.get_session(s.id).await.unwrap().unwrap();
    assert_eq!(loaded.message_count, 3);
    assert_eq!(loaded.total_tokens, 120);
    assert!(loaded.updated_at >= loaded.created_at);
}

#[tokio::test]
async fn archive_round_trips_and_empties_the_working_set() {
    let store = store().await;
    let s = session("main");
    store.create_session(&s).await.unwrap();
    let message = ChatMessage::new(s.id, MessageRole::User, "keep this safe");
    store.insert_message(&message).await.unwrap();

    store.archive_session(s.id).await.unwrap();

    // Gone from the working tables.
    assert!(store.get_session(s.id).await.unwrap().is_none());
    assert!(store.get_messages(s.id).await.unwrap().is_empty());

    // Byte-equal where it matters in the archive.
    let (archived, messages) = store.get_archived_session(s.id).await.unwrap().unwrap();
    assert_eq!(archived.id, s.id);
    assert_eq!(archived.metadata, s.metadata);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "keep this safe");
    assert_eq!(messages[0].id, message.id);
}

#[tokio::test]
async fn archiving_a_missing_session_fails() {
    let store = store().await;
    assert!(store.archive_session(Uuid::new_v4()).await.is_err());
}

#[tokio::test]
async fn ghost_purge_only_eats_empty_sessions() {
    let store = store().await;
    let ghost = session("main");
    let live = session("main");
    store.create_session(&ghost).await.unwrap();
    store.create_session(&live).await.unwrap();
    store
        .insert_message(&ChatMessage::new(live.id, MessageRole::User, "hello"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let purged = store.purge_ghost_sessions(Duration::ZERO).await.unwrap();
    assert_eq!(purged, 1);
    assert!(store.get_session(ghost.id).await.unwrap().is_none());
    assert!(store.get_session(live.id).await.unwrap().is_some());
}

#[tokio::test]
async fn search_matches_titles_and_content() {
    let store = store().await;
    let mut titled = session("main");
    titled.title = Some("Docker deployment planning".to_string());
    let untitled = session("main");
    store.create_session(&titled).await.unwrap();
    store.create_session(&untitled).await.unwrap();
    store
        .insert_message(&ChatMessage::new(
            untitled.id,
            MessageRole::User,
            "the docker build is failing again",
        ))
        .await
        .unwrap();

    let hits = store
        .list_sessions(&SessionFilter {
            search: Some("DOCKER".to_string()),
            limit: 10,
            ..SessionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn list_filters_compose() {
    let store = store().await;
    let mut chat = session("main");
    chat.status = SessionStatus::Active;
    let mut other = session("aria-devops");
    other.session_type = SessionType::Cron;
    store.create_session(&chat).await.unwrap();
    store.create_session(&other).await.unwrap();

    let hits = store
        .list_sessions(&SessionFilter {
            agent_id: Some("main".to_string()),
            session_type: Some(SessionType::Chat),
            status: Some(SessionStatus::Active),
            limit: 10,
            ..SessionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, chat.id);
}

#[tokio::test]
async fn keyword_recall_finds_related_messages() {
    let store = store().await;
    store
        .upsert_agent(&AgentState::new("main", "Main", "m"))
        .await
        .unwrap();
    let s = session("main");
    store.create_session(&s).await.unwrap();
    store
        .insert_message(&ChatMessage::new(
            s.id,
            MessageRole::Assistant,
            "The deployment pipeline now gates on integration tests.",
        ))
        .await
        .unwrap();

    let hits = store
        .recall("main", None, "what is the deployment status", 500)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains("deployment pipeline"));
}

#[tokio::test]
async fn embedding_recall_ranks_by_cosine_and_respects_the_cutoff() {
    let store = store().await;
    store
        .upsert_agent(&AgentState::new("main", "Main", "m"))
        .await
        .unwrap();
    let s = session("main");
    store.create_session(&s).await.unwrap();

    let mut close = ChatMessage::new(s.id, MessageRole::Assistant, "close match");
    close.embedding = Some(vec![1.0, 0.0, 0.0]);
    let mut far = ChatMessage::new(s.id, MessageRole::Assistant, "far away");
    far.embedding = Some(vec![0.0, 1.0, 0.0]);
    store.insert_message(&close).await.unwrap();
    store.insert_message(&far).await.unwrap();

    let hits = store
        .recall("main", Some(&[1.0, 0.0, 0.0]), "", 500)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "close match");
    assert!(hits[0].similarity > 0.99);
}

#[tokio::test]
async fn recall_trims_to_the_token_budget() {
    let store = store().await;
    store
        .upsert_agent(&AgentState::new("main", "Main", "m"))
        .await
        .unwrap();
    let s = session("main");
    store.create_session(&s).await.unwrap();
    for i in 0..5 {
        store
            .insert_message(&ChatMessage::new(
                s.id,
                MessageRole::Assistant,
                format!("deployment note {} {}", i, "x".repeat(400)),
            ))
            .await
            .unwrap();
    }

    // Each message is ~100 tokens; a 250-token budget fits two.
    let hits = store.recall("main", None, "deployment", 250).await.unwrap();
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn exports_render_the_transcript() {
    let store = store().await;
    let mut s = session("main");
    s.title = Some("Export check".to_string());
    store.create_session(&s).await.unwrap();
    store
        .insert_message(&ChatMessage::new(s.id, MessageRole::User, "hello export"))
        .await
        .unwrap();

    let jsonl = store.export_jsonl(s.id).await.unwrap();
    assert_eq!(jsonl.lines().count(), 1);
    assert!(jsonl.contains("hello export"));

    let markdown = store.export_markdown(s.id).await.unwrap();
    assert!(markdown.starts_with("# Export check"));
    assert!(markdown.contains("hello export"));
}

#[tokio::test]
async fn cron_jobs_round_trip() {
    let store = store().await;
    let mut job = CronJob::new(
        "nightly-digest",
        "0 3 * * *",
        "main",
        PayloadType::Prompt,
        serde_json::json!({"prompt": "summarize the day"}),
    );
    job.retry_count = 2;
    store.upsert_job(&job).await.unwrap();

    let loaded = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "nightly-digest");
    assert_eq!(loaded.schedule, "0 3 * * *");
    assert_eq!(loaded.retry_count, 2);
    assert_eq!(loaded.payload["prompt"], "summarize the day");

    assert!(store.delete_job(job.id).await.unwrap());
    assert!(store.get_job(job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn stats_count_both_working_and_archive() {
    let store = store().await;
    let a = session("main");
    let b = session("main");
    store.create_session(&a).await.unwrap();
    store.create_session(&b).await.unwrap();
    store
        .insert_message(&ChatMessage::new(a.id, MessageRole::User, "x"))
        .await
        .unwrap();
    store.archive_session(b.id).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.archived_sessions, 1);
    assert_eq!(stats.total_messages, 1);
}
