//! Integration tests: collaboration and multi-agent loops with scripted model turns.

mod common;

use common::{RecordingRpc, ScriptedProvider};
use futures_util::StreamExt;
use loom_core::agents::{AgentJob, AgentOrchestrator, AgentSpec};
use loom_core::{
    channel, CanvasState, CollaborationJob, CollaborationOrchestrator, ContinuationToken, LoomError, ProgressEvent,
    ProjectStore, ProviderConfig, RequestContext, RetryPolicy, Role, RunOutcome, SequencedEvent, TurnStatus,
    UnitProcessor,
};
use std::sync::Arc;
use std::time::Duration;

const INSTRUCTIONS: &str = "Replace the placeholder heading with a real title";

fn collaboration(provider: Arc<ScriptedProvider>, max_iterations: u32, verify: bool) -> CollaborationOrchestrator {
    CollaborationOrchestrator::new(
        provider,
        ProviderConfig::resolve(Some("claude-sonnet-4-5"), None),
        RetryPolicy::new(3, Duration::from_millis(10)),
        max_iterations,
        verify,
    )
}

fn job(expected_edits: Option<usize>) -> CollaborationJob {
    CollaborationJob {
        collaboration_id: "collab-1".into(),
        instructions: INSTRUCTIONS.into(),
        expected_edits,
    }
}

fn turn(status: &str, ops: &str) -> Result<String, LoomError> {
    Ok(format!("{{\"status\": \"{}\", \"message\": \"turn\", \"operations\": [{}]}}", status, ops))
}

#[tokio::test]
async fn in_progress_turn_continues_with_history_not_original_prompt() {
    let provider = ScriptedProvider::queue(vec![
        turn("in_progress", r#"{"type": "edit_lines", "start_line": 1, "end_line": 1, "new_content": "Title"}"#),
        turn("completed", r#"{"type": "insert_lines", "after_line": 2, "new_content": "Outro"}"#),
    ]);
    let rpc = RecordingRpc::new();
    let ctx = RequestContext::new("p1", Some("tok".into()));
    let (emitter, stream) = channel(256, ctx.cancel.clone());
    let store = ProjectStore::new(rpc.as_ref(), &ctx);

    let (outcome, token) = collaboration(provider.clone(), 10, false)
        .run(
            &job(None),
            ContinuationToken::fresh("# TODO\nbody".to_string()),
            &store,
            rpc.as_ref(),
            &emitter,
            &ctx,
        )
        .await
        .unwrap();
    drop(emitter);

    assert_eq!(outcome, RunOutcome::Completed { iterations: 2 });
    assert_eq!(token.document, "Title\nbody\nOutro");
    assert_eq!(token.applied_edits, 2);

    let requests = provider.requests.lock().unwrap();
    let second = &requests[1].messages;
    assert_eq!(second.len(), 3);
    assert_eq!(second[1].role, Role::Assistant);
    let mentions = second.iter().filter(|m| m.content.contains(INSTRUCTIONS)).count();
    assert_eq!(mentions, 1, "original task must only appear in the replayed history");
    assert!(second[2].content.starts_with("Continue."));
    assert!(second[2].content.contains("1: Title"));

    let events: Vec<SequencedEvent> = stream.collect().await;
    let completes: Vec<TurnStatus> = events
        .iter()
        .filter_map(|e| match &e.event {
            ProgressEvent::IterationComplete { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(completes, vec![TurnStatus::InProgress, TurnStatus::Completed]);
    assert!(events.iter().any(|e| matches!(e.event, ProgressEvent::LlmDelta { .. })));
    assert_eq!(rpc.calls_named("update_collaboration_document_with_token").len(), 2);
    assert_eq!(rpc.calls_named("insert_collaboration_message_with_token").len(), 2);
}

#[tokio::test]
async fn resumed_token_sends_continuation_first() {
    let provider = ScriptedProvider::queue(vec![turn("completed", "")]);
    let rpc = RecordingRpc::new();
    let ctx = RequestContext::new("p1", None);
    let (emitter, _stream) = channel(256, ctx.cancel.clone());
    let store = ProjectStore::new(rpc.as_ref(), &ctx);

    let mut token = ContinuationToken::fresh("line".to_string());
    token.iteration = 4;
    token.conversation_history = vec![
        loom_core::ChatMessage::user(format!("Task:\n{}", INSTRUCTIONS)),
        loom_core::ChatMessage::assistant("{\"status\": \"in_progress\"}"),
    ];

    let (outcome, token) = collaboration(provider.clone(), 10, false)
        .run(&job(None), token, &store, rpc.as_ref(), &emitter, &ctx)
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed { iterations: 5 });
    assert_eq!(token.iteration, 5);
    let requests = provider.requests.lock().unwrap();
    assert!(requests[0].messages.last().unwrap().content.starts_with("Continue."));
}

#[tokio::test]
async fn verify_completion_ignores_premature_claim() {
    let provider = ScriptedProvider::queue(vec![
        turn("completed", r#"{"type": "edit_lines", "start_line": 1, "end_line": 1, "new_content": "A"}"#),
        turn("completed", r#"{"type": "edit_lines", "start_line": 2, "end_line": 2, "new_content": "B"}"#),
    ]);
    let rpc = RecordingRpc::new();
    let ctx = RequestContext::new("p1", None);
    let (emitter, _stream) = channel(256, ctx.cancel.clone());
    let store = ProjectStore::new(rpc.as_ref(), &ctx);

    let (outcome, token) = collaboration(provider.clone(), 10, true)
        .run(&job(Some(2)), ContinuationToken::fresh("a\nb".to_string()), &store, rpc.as_ref(), &emitter, &ctx)
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed { iterations: 2 });
    assert_eq!(token.document, "A\nB");
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn budget_exhaustion_stops_loop() {
    let provider = ScriptedProvider::responder(|_| turn("in_progress", ""));
    let rpc = RecordingRpc::new();
    let ctx = RequestContext::new("p1", None);
    let (emitter, _stream) = channel(256, ctx.cancel.clone());
    let store = ProjectStore::new(rpc.as_ref(), &ctx);

    let (outcome, _) = collaboration(provider.clone(), 3, false)
        .run(&job(None), ContinuationToken::fresh("x".to_string()), &store, rpc.as_ref(), &emitter, &ctx)
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::BudgetExhausted { iterations: 3 });
    assert_eq!(provider.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_iteration_still_emits_continuation() {
    let provider = ScriptedProvider::queue(vec![
        turn("in_progress", ""),
        Ok("garbage".into()),
        Ok("still garbage".into()),
        Ok("more garbage".into()),
    ]);
    let rpc = RecordingRpc::new();
    let ctx = RequestContext::new("p1", None);
    let (emitter, stream) = channel(256, ctx.cancel.clone());
    let store = ProjectStore::new(rpc.as_ref(), &ctx);

    let (outcome, token) = collaboration(provider.clone(), 10, false)
        .run(&job(None), ContinuationToken::fresh("x".to_string()), &store, rpc.as_ref(), &emitter, &ctx)
        .await
        .unwrap();
    drop(emitter);

    assert!(matches!(outcome, RunOutcome::Failed { iteration: 2, .. }));
    assert_eq!(token.iteration, 1);

    let events: Vec<SequencedEvent> = stream.collect().await;
    let last_complete = events
        .iter()
        .rev()
        .find_map(|e| match &e.event {
            ProgressEvent::IterationComplete { status, continuation, .. } => Some((*status, continuation.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_complete.0, TurnStatus::Failed);
    assert_eq!(last_complete.1["iteration"], 1);

    let mut attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match &e.event {
            ProgressEvent::LlmDelta { iteration: 2, attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    attempts.dedup();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn malformed_operation_is_skipped_while_valid_edits_apply() {
    let provider = ScriptedProvider::queue(vec![turn(
        "completed",
        r#"{"type": "edit_lines", "start_line": 1, "end_line": 1, "new_content": "Title"},
           {"type": "edit_lines", "start_line": -1, "end_line": 2, "new_content": "nope"}"#,
    )]);
    let rpc = RecordingRpc::new();
    let ctx = RequestContext::new("p1", None);
    let (emitter, stream) = channel(256, ctx.cancel.clone());
    let store = ProjectStore::new(rpc.as_ref(), &ctx);

    let (outcome, token) = collaboration(provider.clone(), 10, false)
        .run(&job(None), ContinuationToken::fresh("# TODO\nbody".to_string()), &store, rpc.as_ref(), &emitter, &ctx)
        .await
        .unwrap();
    drop(emitter);

    assert_eq!(outcome, RunOutcome::Completed { iterations: 1 });
    assert_eq!(provider.calls(), 1);
    assert_eq!(token.document, "Title\nbody");
    assert_eq!(token.applied_edits, 1);
    assert_eq!(token.pending_results[0]["index"], 1);

    let events: Vec<SequencedEvent> = stream.collect().await;
    let (applied, skipped) = events
        .iter()
        .find_map(|e| match &e.event {
            ProgressEvent::Operations { applied, skipped, .. } => Some((*applied, skipped.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(applied, 1);
    assert_eq!(skipped.len(), 1);
    assert!(skipped[0].reason.starts_with("malformed operation"));
}

#[tokio::test]
async fn persisted_document_survives_failed_message_insert() {
    let provider = ScriptedProvider::queue(vec![turn(
        "in_progress",
        r#"{"type": "edit_lines", "start_line": 1, "end_line": 1, "new_content": "Title"}"#,
    )]);
    let rpc = Arc::new(RecordingRpc {
        fail_on: Some("insert_collaboration_message_with_token"),
        ..Default::default()
    });
    let ctx = RequestContext::new("p1", None);
    let (emitter, _stream) = channel(256, ctx.cancel.clone());
    let store = ProjectStore::new(rpc.as_ref(), &ctx);

    let (outcome, token) = collaboration(provider, 10, false)
        .run(&job(None), ContinuationToken::fresh("# TODO\nbody".to_string()), &store, rpc.as_ref(), &emitter, &ctx)
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Failed { iteration: 1, .. }));
    let persisted = rpc.calls_named("update_collaboration_document_with_token");
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0]["p_content"], token.document);
    assert_eq!(token.document, "Title\nbody");
    assert_eq!(token.applied_edits, 1);
    assert_eq!(token.iteration, 0);
}

fn two_agents() -> AgentJob {
    AgentJob {
        session_id: "s1".into(),
        goal: "Design checkout".into(),
        agents: vec![
            AgentSpec {
                id: "a1".into(),
                name: "Architect".into(),
                role: String::new(),
                instructions: String::new(),
            },
            AgentSpec {
                id: "a2".into(),
                name: "Reviewer".into(),
                role: String::new(),
                instructions: String::new(),
            },
        ],
    }
}

#[tokio::test(start_paused = true)]
async fn failed_agent_keeps_earlier_agents_work_in_token() {
    let provider = ScriptedProvider::responder(|request| {
        let system = request.system.clone().unwrap_or_default();
        if system.starts_with("You are Architect") {
            return Ok(r#"{"status": "completed", "note": "Added API node",
                "operations": [{"type": "add_node", "node": {"id": "api", "label": "API"}}]}"#
                .into());
        }
        Ok("not json".into())
    });
    let rpc = RecordingRpc::new();
    let ctx = RequestContext::new("p1", None);
    let (emitter, _stream) = channel(256, ctx.cancel.clone());
    let store = ProjectStore::new(rpc.as_ref(), &ctx);
    let processor = UnitProcessor::new(
        provider.clone(),
        ProviderConfig::resolve(None, None),
        RetryPolicy::new(2, Duration::from_millis(1)),
    );

    let (outcome, token) = AgentOrchestrator::new(processor, 5)
        .run(&two_agents(), ContinuationToken::fresh(CanvasState::default()), &store, rpc.as_ref(), &emitter, &ctx)
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Failed { iteration: 1, .. }));
    let upserts = rpc.calls_named("upsert_canvas_node_with_token");
    assert_eq!(upserts.len(), 1);
    assert_eq!(token.document.nodes.len(), 1);
    assert_eq!(token.document.nodes[0].id, "api");
    assert_eq!(token.blackboard.len(), rpc.calls_named("insert_audit_blackboard_with_token").len());
    assert_eq!(token.applied_edits, 1);
    assert_eq!(token.iteration, 0);
    assert!(token.conversation_history.is_empty());
}

#[tokio::test]
async fn agents_edit_canvas_and_share_blackboard() {
    let provider = ScriptedProvider::responder(|request| {
        let system = request.system.clone().unwrap_or_default();
        let user = &request.messages.last().unwrap().content;
        if system.starts_with("You are Architect") {
            if user.contains("Iteration 1.") {
                return Ok(r#"{"status": "in_progress", "note": "Added API node",
                    "operations": [{"type": "add_node", "node": {"id": "api", "type": "service", "label": "API"}}]}"#
                    .into());
            }
            return Ok(r#"{"status": "completed", "operations": []}"#.into());
        }
        if user.contains("Iteration 1.") && user.contains("Added API node") {
            return Ok(r#"{"status": "completed", "note": "Looks fine",
                "operations": [{"type": "add_node", "node": {"id": "db", "label": "DB"}},
                               {"type": "add_edge", "edge": {"id": "e1", "source": "api", "target": "db"}}]}"#
                .into());
        }
        Ok(r#"{"status": "completed", "operations": []}"#.into())
    });
    let rpc = RecordingRpc::new();
    let ctx = RequestContext::new("p1", None);
    let (emitter, stream) = channel(256, ctx.cancel.clone());
    let store = ProjectStore::new(rpc.as_ref(), &ctx);

    let job = two_agents();
    let processor = UnitProcessor::new(
        provider.clone(),
        ProviderConfig::resolve(None, None),
        RetryPolicy::new(2, Duration::from_millis(1)),
    );

    let (outcome, token) = AgentOrchestrator::new(processor, 5)
        .run(&job, ContinuationToken::fresh(CanvasState::default()), &store, rpc.as_ref(), &emitter, &ctx)
        .await
        .unwrap();
    drop(emitter);

    assert_eq!(outcome, RunOutcome::Completed { iterations: 2 });
    assert_eq!(token.document.nodes.len(), 2);
    assert_eq!(token.document.edges.len(), 1);
    assert_eq!(token.blackboard.len(), 2);
    assert_eq!(token.applied_edits, 3);
    assert!(token.conversation_history.is_empty());
    assert_eq!(rpc.calls_named("upsert_canvas_node_with_token").len(), 2);
    assert_eq!(rpc.calls_named("upsert_canvas_edge_with_token").len(), 1);
    assert_eq!(rpc.calls_named("insert_audit_blackboard_with_token").len(), 2);

    let events: Vec<SequencedEvent> = stream.collect().await;
    let agent_results = events
        .iter()
        .filter(|e| matches!(e.event, ProgressEvent::AgentResult { .. }))
        .count();
    assert_eq!(agent_results, 4);
    assert!(events.iter().any(|e| matches!(e.event, ProgressEvent::Blackboard { .. })));
}
