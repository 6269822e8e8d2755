//! End-to-end SSE pipeline: a canned upstream chat provider streams a
//! response, the dispatcher drives it through the emitter chain, and a
//! subscriber socket in the task room sees the ordered wire events while
//! the subtask and its task mirror reach COMPLETED.

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tokio::sync::mpsc;

use tm_domain::config::Config;
use tm_domain::request::{BotSpec, UserRef};
use tm_domain::task::{SubtaskRole, SubtaskStatus};
use tm_domain::ExecutionRequest;
use tm_gateway::data::{DataService, MemoryDataService, NewSubtask};
use tm_gateway::state::AppState;
use tm_gateway::ws::rooms::ConnectedSocket;
use tm_protocol::Frame;

/// Canned upstream: two chunks, then done, then the ignored sentinel.
async fn canned_responses() -> impl IntoResponse {
    let body = concat!(
        "data: {\"type\":\"chunk\",\"content\":\"he\",\"offset\":0}\n\n",
        "data: {\"type\":\"chunk\",\"content\":\"llo\",\"offset\":2}\n\n",
        "data: {\"type\":\"done\",\"result\":{\"value\":\"hello\"}}\n\n",
        "data: [DONE]\n\n",
    );
    ([(axum::http::header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn spawn_upstream() -> String {
    let app = Router::new().route("/v1/responses", post(canned_responses));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn sse_happy_path_streams_to_room_and_completes_subtask() {
    let upstream = spawn_upstream().await;

    let mut config = Config::default();
    config.auth.jwt_secret = "test-secret".into();
    config.redis.url = "redis://127.0.0.1:1/".into();
    config.executors.chat_shell_url = upstream;
    config.executors.dispatch_timeout_secs = 5;

    let data = Arc::new(MemoryDataService::new());
    let state = AppState::build(Arc::new(config), data.clone()).unwrap();

    // Task 42's turn: user message_id 1, assistant message_id 2.
    data.add_user(UserRef {
        id: 1,
        name: "alice".into(),
        ..Default::default()
    });
    data.insert_task(tm_domain::task::TaskRecord::new(42, 1));
    data.insert_subtask({
        let mut user_turn = tm_domain::Subtask::new(6, 42, 1, SubtaskRole::User, 1);
        user_turn.prompt = Some("hi".into());
        user_turn
    });
    let assistant = data
        .create_subtask(NewSubtask {
            task_id: 42,
            role: SubtaskRole::Assistant,
            user_id: 1,
            prompt: None,
            parent_id: Some(1),
            bot_ids: vec![],
            team_id: None,
            metadata: None,
        })
        .await
        .unwrap();

    // A subscriber already in the task room.
    let (tx, mut rx) = mpsc::channel::<Frame>(32);
    state.rooms.register(ConnectedSocket {
        sid: "viewer".into(),
        user_id: 1,
        user_name: "alice".into(),
        sink: tx,
    });
    state.rooms.join("viewer", &tm_protocol::task_room(42));

    let mut request = ExecutionRequest::new(42, assistant.id);
    request.message_id = Some(assistant.message_id);
    request.prompt = "hi".into();
    request.bot = vec![BotSpec {
        shell_type: Some("Chat".into()),
        ..Default::default()
    }];
    request.user = Some(UserRef {
        id: 1,
        name: "alice".into(),
        ..Default::default()
    });

    state.dispatcher.dispatch(request, None, None).await;

    // Wire order: start, the two deltas, then done with the message_id.
    let start = rx.recv().await.unwrap();
    assert_eq!(start.event, "chat:start");
    assert_eq!(start.data["shell_type"], "Chat");
    assert_eq!(start.data["message_id"], assistant.message_id);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.event, "chat:chunk");
    assert_eq!(first.data["content"], "he");
    assert_eq!(first.data["offset"], 0);

    let second = rx.recv().await.unwrap();
    assert_eq!(second.event, "chat:chunk");
    assert_eq!(second.data["content"], "llo");
    assert_eq!(second.data["offset"], 2);

    let done = rx.recv().await.unwrap();
    assert_eq!(done.event, "chat:done");
    assert_eq!(done.data["message_id"], assistant.message_id);
    assert_eq!(done.data["result"]["value"], "hello");

    // Durable state: subtask COMPLETED with the full value, mirror follows.
    let subtask = data.get_subtask(assistant.id).await.unwrap().unwrap();
    assert_eq!(subtask.status, SubtaskStatus::Completed);
    assert_eq!(subtask.result_value(), "hello");

    let task = data.get_task(42).await.unwrap().unwrap();
    assert_eq!(task.status, Some(SubtaskStatus::Completed));
    assert_eq!(task.progress, 100);
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn sse_upstream_without_terminal_still_completes() {
    // An upstream that closes after one chunk: the dispatcher owes the
    // subscribers a terminal and synthesises done from the stream.
    async fn truncated() -> impl IntoResponse {
        (
            [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
            "data: {\"type\":\"chunk\",\"content\":\"partial\",\"offset\":0}\n\n",
        )
    }
    let app = Router::new().route("/v1/responses", post(truncated));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut config = Config::default();
    config.auth.jwt_secret = "test-secret".into();
    config.redis.url = "redis://127.0.0.1:1/".into();
    config.executors.chat_shell_url = format!("http://{addr}");
    config.executors.dispatch_timeout_secs = 5;

    let data = Arc::new(MemoryDataService::new());
    let state = AppState::build(Arc::new(config), data.clone()).unwrap();

    data.insert_task(tm_domain::task::TaskRecord::new(1, 1));
    let assistant = data
        .create_subtask(NewSubtask {
            task_id: 1,
            role: SubtaskRole::Assistant,
            user_id: 1,
            prompt: None,
            parent_id: None,
            bot_ids: vec![],
            team_id: None,
            metadata: None,
        })
        .await
        .unwrap();

    let mut request = ExecutionRequest::new(1, assistant.id);
    request.bot = vec![BotSpec {
        shell_type: Some("Chat".into()),
        ..Default::default()
    }];
    state.dispatcher.dispatch(request, None, None).await;

    let subtask = data.get_subtask(assistant.id).await.unwrap().unwrap();
    assert_eq!(subtask.status, SubtaskStatus::Completed);
    assert_eq!(subtask.result_value(), "partial");
}
