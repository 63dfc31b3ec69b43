//! Prompt bridge behavior under concurrency and cancellation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;

use llmodel_bridge::config::ModelConfig;
use llmodel_bridge::error::{Error, ErrorRecord};
use llmodel_bridge::inference::bridge::{FinishReason, PromptEvent, PromptRequest, PromptState};
use llmodel_bridge::inference::model::LlModel;
use llmodel_bridge::inference::native::PromptOptions;
use llmodel_bridge::inference::simulated::SimulatedEngine;

fn load(engine: Arc<SimulatedEngine>, max_queued_prompts: usize) -> (tempfile::TempDir, LlModel) {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().join("orca.gguf");
    std::fs::write(&path, b"GGUF fake weights").unwrap();
    let config = ModelConfig {
        model_path: path,
        max_queued_prompts,
        ..Default::default()
    };
    let model = LlModel::load(engine, &config).unwrap();
    (dir, model)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_prompts_run_one_at_a_time_in_order() {
    let engine = Arc::new(SimulatedEngine::new().with_token_delay(Duration::from_millis(10)));
    let (_dir, model) = load(engine.clone(), 8);

    let handles: Vec<_> = ["a1 a2 a3", "b1 b2 b3", "c1 c2 c3"]
        .into_iter()
        .map(|prompt| model.prompt(PromptRequest::new(prompt)).unwrap())
        .collect();

    let finished = Arc::new(Mutex::new(Vec::new()));
    let waiters: Vec<_> = handles
        .into_iter()
        .map(|handle| {
            let finished = finished.clone();
            tokio::spawn(async move {
                let completion = handle.finish().await.unwrap();
                finished.lock().push(completion.text);
            })
        })
        .collect();
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(engine.max_prompt_overlap(), 1);
    assert_eq!(
        *finished.lock(),
        vec!["a1 a2 a3 ", "b1 b2 b3 ", "c1 c2 c3 "]
    );
}

#[tokio::test]
async fn test_fragments_arrive_in_emission_order() {
    let reply: Vec<String> = (0..50).map(|i| format!("<{i}>")).collect();
    let engine = Arc::new(SimulatedEngine::new().with_reply(reply.clone()));
    let (_dir, model) = load(engine, 8);

    let options = PromptOptions {
        n_predict: 50,
        ..Default::default()
    };
    let events: Vec<PromptEvent> = model
        .prompt(PromptRequest::new("count").with_options(options))
        .unwrap()
        .into_stream()
        .collect()
        .await;

    let tokens: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            PromptEvent::Token(t) => Some(t.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tokens, reply);
    assert!(matches!(events.last(), Some(PromptEvent::Done(c)) if c.text == reply.concat()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_mid_stream_keeps_prefix() {
    let reply: Vec<String> = (0..40).map(|i| format!("w{i} ")).collect();
    let engine = Arc::new(
        SimulatedEngine::new()
            .with_reply(reply.clone())
            .with_token_delay(Duration::from_millis(5)),
    );
    let (_dir, model) = load(engine, 8);

    let options = PromptOptions {
        n_predict: 40,
        ..Default::default()
    };
    let mut handle = model
        .prompt(PromptRequest::new("go").with_options(options))
        .unwrap();

    let mut received = Vec::new();
    let mut completion = None;
    while let Some(event) = handle.next_event().await {
        match event {
            PromptEvent::Token(t) => {
                received.push(t);
                if received.len() == 3 {
                    handle.cancel();
                }
            }
            PromptEvent::Done(c) => completion = Some(c),
            PromptEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    let completion = completion.unwrap();
    assert_eq!(completion.finish_reason, FinishReason::Cancelled);
    assert!(received.len() >= 3 && received.len() < reply.len());
    assert_eq!(received[..], reply[..received.len()]);
    assert_eq!(completion.text, received.concat());
    assert_eq!(handle.state(), PromptState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_while_queued_never_starts() {
    let engine = Arc::new(
        SimulatedEngine::new()
            .with_reply(["x ", "y ", "z "])
            .with_token_delay(Duration::from_millis(20)),
    );
    let (_dir, model) = load(engine, 8);

    let first = model.prompt(PromptRequest::new("first")).unwrap();
    let second = model.prompt(PromptRequest::new("second")).unwrap();
    second.cancel();

    assert_eq!(second.finish().await, Err(Error::Cancelled));
    assert_eq!(first.finish().await.unwrap().completion_tokens, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_rejects_with_busy() {
    let engine = Arc::new(
        SimulatedEngine::new()
            .with_reply(["slow "])
            .with_token_delay(Duration::from_millis(50)),
    );
    let (_dir, model) = load(engine, 2);

    let a = model.prompt(PromptRequest::new("a")).unwrap();
    let b = model.prompt(PromptRequest::new("b")).unwrap();
    assert_eq!(
        model.prompt(PromptRequest::new("c")).unwrap_err(),
        Error::Busy { queued: 2 }
    );

    a.finish().await.unwrap();
    b.finish().await.unwrap();
    assert_eq!(model.pending_prompts(), 0);
    model.prompt(PromptRequest::new("d")).unwrap().finish().await.unwrap();
}

#[tokio::test]
async fn test_native_failure_delivered_after_tokens() {
    let engine = Arc::new(
        SimulatedEngine::new()
            .with_reply(["one ", "two ", "three "])
            .with_prompt_failure(2, ErrorRecord::new(-1, "context window exhausted")),
    );
    let (_dir, model) = load(engine, 8);

    let events: Vec<PromptEvent> = model
        .prompt(PromptRequest::new("go"))
        .unwrap()
        .into_stream()
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            PromptEvent::Token("one ".into()),
            PromptEvent::Token("two ".into()),
            PromptEvent::Error(Error::Native(ErrorRecord::new(-1, "context window exhausted"))),
        ]
    );
}

#[tokio::test]
async fn test_invalid_options_rejected_before_queueing() {
    let engine = Arc::new(SimulatedEngine::new());
    let (_dir, model) = load(engine.clone(), 8);

    let options = PromptOptions {
        top_p: 2.0,
        ..Default::default()
    };
    let err = model
        .prompt(PromptRequest::new("hi").with_options(options))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(matches!(
        model.prompt(PromptRequest::new("")),
        Err(Error::Validation(_))
    ));
    assert_eq!(model.pending_prompts(), 0);
    assert_eq!(engine.calls().len(), 1);
}
