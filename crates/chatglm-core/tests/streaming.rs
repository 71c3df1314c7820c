use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chatglm_core::{
    ChatGlmError, Engine, FinishReason, GenerateEvent, GenerationConfig, ScriptedBackend, Turn,
    build_prompt,
};
use tokio_stream::StreamExt;

fn reply_for(prompt: &str) -> Vec<String> {
    // Deterministic: the reply depends only on the prompt.
    let tail: String = prompt.chars().rev().take(6).collect();
    vec![
        "晚上".into(),
        String::new(),
        "睡不着".into(),
        format!("({tail})"),
        "\n".into(),
    ]
}

fn engine() -> Engine<ScriptedBackend> {
    Engine::new(ScriptedBackend::new(|prompt, _| reply_for(prompt)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_matches_sync_output() {
    let engine = engine();
    let handle = engine.load("chatglm-ggml.bin").unwrap();
    let history = [Turn::new("你好", "你好👋")];
    let prompt = build_prompt("晚上睡不着应该怎么办", &history);
    let config = GenerationConfig::default().with_do_sample(false);

    let mut stream = handle.stream_generate(&prompt, &config).unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    assert!(chunks.iter().all(|c| !c.is_empty()));
    assert_eq!(chunks.len(), 4);

    let handle_ref = &handle;
    let sync_out =
        tokio::task::block_in_place(|| handle_ref.generate(&prompt, &config)).unwrap();
    assert_eq!(chunks.concat(), sync_out);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminal_event_reports_success() {
    let engine = engine();
    let handle = engine.load("model.bin").unwrap();
    let mut stream = handle
        .stream_generate("q", &GenerationConfig::default())
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        events.push(event);
    }

    assert_eq!(
        events.last(),
        Some(&GenerateEvent::Done {
            finish_reason: FinishReason::Stop,
            chunks: 4,
        })
    );
    assert!(stream.next_event().await.is_none());
    assert!(engine.registry().is_empty());
    assert_eq!(engine.backend().live_configs(), 0);
}

#[tokio::test]
async fn engine_failure_is_yielded_as_error() {
    let engine = Engine::new(ScriptedBackend::echo().failing_after(2));
    let handle = engine.load("model.bin").unwrap();
    let stream = handle
        .stream_generate("one two three four", &GenerationConfig::default())
        .unwrap();

    let items: Vec<_> = stream.collect().await;
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_deref().unwrap(), "one ");
    assert_eq!(items[1].as_deref().unwrap(), "two ");
    assert!(matches!(items[2], Err(ChatGlmError::GenerationFailed(_))));
    assert!(!engine.registry().contains(handle.id()));
}

#[tokio::test]
async fn invalid_config_fails_the_stream() {
    let engine = engine();
    let handle = engine.load("model.bin").unwrap();
    let stream = handle
        .stream_generate("q", &GenerationConfig::default().with_top_p(2.0))
        .unwrap();

    let err = stream.collect_text().await.unwrap_err();
    assert!(err.to_string().contains("top_p"));
    assert_eq!(engine.backend().configs_created(), 0);
}

#[tokio::test]
async fn late_callback_after_end_is_dropped() {
    let engine = Engine::new(ScriptedBackend::echo().with_late_callback());
    let handle = engine.load("model.bin").unwrap();

    let text = handle
        .stream_generate("a b", &GenerationConfig::default())
        .unwrap()
        .collect_text()
        .await
        .unwrap();

    assert_eq!(text, "a b");
    assert_eq!(engine.registry().misses(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_handles_stream_concurrently_without_cross_talk() {
    let engine = Engine::new(ScriptedBackend::new(|prompt, _| {
        (0..20).map(|i| format!("{prompt}:{i};")).collect()
    }));

    let handles: Vec<_> = (0..4)
        .map(|i| engine.load(format!("model-{i}.bin")).unwrap())
        .collect();
    let streams: Vec<_> = handles
        .iter()
        .enumerate()
        .map(|(i, h)| {
            h.stream_generate(&format!("p{i}"), &GenerationConfig::default())
                .unwrap()
        })
        .collect();

    let mut tasks = Vec::new();
    for (i, stream) in streams.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            let text = stream.collect_text().await.unwrap();
            let expected: String = (0..20).map(|n| format!("p{i}:{n};")).collect();
            assert_eq!(text, expected);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert!(engine.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_handle_streams_are_serialized() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let (flight, seen) = (Arc::clone(&in_flight), Arc::clone(&max_seen));

    let backend = ScriptedBackend::new(move |prompt, _| {
        let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
        seen.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        flight.fetch_sub(1, Ordering::SeqCst);
        vec![prompt.to_string()]
    });
    let engine = Engine::new(backend);
    let handle = engine.load("model.bin").unwrap();

    let a = handle.stream_generate("a", &GenerationConfig::default()).unwrap();
    let b = handle.stream_generate("b", &GenerationConfig::default()).unwrap();

    let (a, b) = tokio::join!(a.collect_text(), b.collect_text());
    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_stream_cancels_delivery() {
    let engine = Engine::new(
        ScriptedBackend::new(|_, _| (0..200).map(|i| format!("{i} ")).collect())
            .with_chunk_delay(Duration::from_millis(1)),
    );
    let handle = engine.load("model.bin").unwrap();

    let mut stream = handle
        .stream_generate("q", &GenerationConfig::default())
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "0 ");
    drop(stream);

    // The handle is free again once the cancelled call unwinds.
    let handle_ref = &handle;
    let out = tokio::task::block_in_place(|| {
        handle_ref.generate("q", &GenerationConfig::default().with_max_length(8))
    })
    .unwrap();
    assert!(out.starts_with("0 1 2 "));
    assert_eq!(engine.backend().live_configs(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_ends_with_cancelled_reason() {
    let engine = Engine::new(
        ScriptedBackend::new(|_, _| (0..200).map(|i| format!("{i} ")).collect())
            .with_chunk_delay(Duration::from_millis(1)),
    );
    let handle = engine.load("model.bin").unwrap();
    let mut stream = handle
        .stream_generate("q", &GenerationConfig::default())
        .unwrap();

    stream.cancel();
    let mut last = None;
    while let Some(event) = stream.next_event().await {
        last = Some(event);
    }
    assert!(matches!(
        last,
        Some(GenerateEvent::Done {
            finish_reason: FinishReason::Cancelled,
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_waits_for_running_stream() {
    let engine = Engine::new(
        ScriptedBackend::echo().with_chunk_delay(Duration::from_millis(5)),
    );
    let handle = engine.load("model.bin").unwrap();
    let stream = handle
        .stream_generate("a b c", &GenerationConfig::default())
        .unwrap();

    handle.release();
    let text = stream.collect_text().await.unwrap();
    assert_eq!(text, "a b c");

    // The producer drops its reference right after the terminal event.
    for _ in 0..100 {
        if engine.backend().live_pipelines() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.backend().pipelines_destroyed(), 1);
}

#[test]
fn blocking_iterator_outside_runtime() {
    let engine = engine();
    let handle = engine.load("model.bin").unwrap();
    let chunks: Result<Vec<String>, _> = handle
        .stream_generate("q", &GenerationConfig::default())
        .unwrap()
        .blocking_iter()
        .collect();
    let chunks = chunks.unwrap();
    assert_eq!(chunks.concat(), handle.generate("q", &GenerationConfig::default()).unwrap());
}
