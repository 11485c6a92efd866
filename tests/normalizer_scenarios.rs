use std::sync::Arc;

use deltanorm::error::CanonicalError;
use deltanorm::protocol::canonical::{
    CanonicalEvent, Delta, FinishReason, ModelInfo, RawUsage, ToolCallFragment, UsageSnapshot,
};
use deltanorm::stream::{
    AssemblyMode, ManualClock, NormalizerOptions, NormalizerPhase, PerMillionPricing,
    ReasoningGate, StreamNormalizer, TagSpan, TagSplitter, UsageAccumulator,
};
use futures_util::{stream, StreamExt};
use serde_json::json;

fn accumulator(clock: &Arc<ManualClock>) -> UsageAccumulator {
    let model = ModelInfo {
        id: "test-model".to_string(),
        input_price: 1.0,
        output_price: 2.0,
        ..ModelInfo::default()
    };
    UsageAccumulator::new(model, Arc::new(PerMillionPricing), clock.clone())
}

fn build_normalizer(options: NormalizerOptions) -> (StreamNormalizer, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    (StreamNormalizer::new(options, accumulator(&clock)), clock)
}

fn think_options() -> NormalizerOptions {
    NormalizerOptions {
        reasoning_tag: Some("think".to_string()),
        ..NormalizerOptions::default()
    }
}

fn fragment(
    index: usize,
    id: Option<&str>,
    name: Option<&str>,
    args: Option<&str>,
) -> ToolCallFragment {
    ToolCallFragment {
        index,
        id: id.map(str::to_owned),
        name: name.map(str::to_owned),
        arguments: args.map(str::to_owned),
    }
}

fn usage(input: u64, output: u64) -> RawUsage {
    RawUsage {
        input_tokens: input,
        output_tokens: output,
        ..RawUsage::default()
    }
}

async fn normalize_all(
    options: NormalizerOptions,
    deltas: Vec<Result<Delta, CanonicalError>>,
) -> Vec<Result<CanonicalEvent, CanonicalError>> {
    let (normalizer, _clock) = build_normalizer(options);
    normalizer.normalize(stream::iter(deltas)).collect().await
}

fn ok_events(items: Vec<Result<CanonicalEvent, CanonicalError>>) -> Vec<CanonicalEvent> {
    items.into_iter().map(|item| item.expect("event")).collect()
}

fn usage_events(events: &[CanonicalEvent]) -> Vec<UsageSnapshot> {
    events
        .iter()
        .filter_map(|event| match event {
            CanonicalEvent::Usage(snapshot) => Some(*snapshot),
            _ => None,
        })
        .collect()
}

fn tool_ends(events: &[CanonicalEvent]) -> Vec<(usize, String, serde_json::Value)> {
    events
        .iter()
        .filter_map(|event| match event {
            CanonicalEvent::ToolCallEnd {
                index,
                name,
                arguments,
                ..
            } => Some((*index, name.clone(), arguments.clone())),
            _ => None,
        })
        .collect()
}

/// Split `s` into pieces of at most `size` bytes without cutting a code point.
fn chunk_str(s: &str, size: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end += 1;
        }
        pieces.push(&rest[..end]);
        rest = &rest[end..];
    }
    pieces
}

#[tokio::test]
async fn mixed_stream_scenario() {
    let deltas = vec![
        Delta::text("Sure, "),
        Delta::text("<think>analyzing</think>"),
        Delta::text("done"),
        Delta::tool_call(fragment(0, Some("a1"), Some("run"), Some("{\"x\":"))),
        Delta::tool_call(fragment(0, None, None, Some("1}")))
            .with_finish(FinishReason::ToolCalls),
        Delta::usage(usage(50, 12)),
    ];
    let events = ok_events(
        normalize_all(think_options(), deltas.into_iter().map(Ok).collect()).await,
    );

    assert_eq!(events.len(), 7, "{events:?}");
    assert_eq!(
        &events[..6],
        &[
            CanonicalEvent::text("Sure, "),
            CanonicalEvent::reasoning("analyzing"),
            CanonicalEvent::text("done"),
            CanonicalEvent::ToolCallPartial {
                index: 0,
                id: Some("a1".to_string()),
                name: Some("run".to_string()),
                arguments_fragment: Some("{\"x\":".to_string()),
            },
            CanonicalEvent::ToolCallPartial {
                index: 0,
                id: None,
                name: None,
                arguments_fragment: Some("1}".to_string()),
            },
            CanonicalEvent::ToolCallEnd {
                index: 0,
                id: "a1".to_string(),
                name: "run".to_string(),
                arguments: json!({"x": 1}),
            },
        ]
    );
    let CanonicalEvent::Usage(snapshot) = &events[6] else {
        panic!("last event must be usage");
    };
    assert_eq!(snapshot.input_tokens, 50);
    assert_eq!(snapshot.output_tokens, 12);
}

#[test]
fn tag_flush_is_chunking_independent() {
    let text = "before <think>step one, <b>bold</b> ü</think> after <thin <think>again</think>";

    let run = |size: usize| -> Vec<TagSpan> {
        let mut splitter = TagSplitter::new("think");
        let mut spans = Vec::new();
        for piece in chunk_str(text, size) {
            spans.extend(splitter.update(piece));
        }
        spans.extend(splitter.finish());
        // merge adjacent runs of the same kind
        let mut merged: Vec<TagSpan> = Vec::new();
        for span in spans {
            match merged.last_mut() {
                Some(last) if last.matched == span.matched => last.data.push_str(&span.data),
                _ => merged.push(span),
            }
        }
        merged
    };

    let whole = run(text.len());
    assert_eq!(
        whole,
        vec![
            TagSpan {
                matched: false,
                data: "before ".to_string(),
            },
            TagSpan {
                matched: true,
                data: "step one, <b>bold</b> ü".to_string(),
            },
            TagSpan {
                matched: false,
                data: " after <thin ".to_string(),
            },
            TagSpan {
                matched: true,
                data: "again".to_string(),
            },
        ]
    );
    for size in [1, 2, 3, 5, 7, 11] {
        assert_eq!(run(size), whole, "chunk size {size}");
    }
}

#[test]
fn partial_tag_waits_for_disambiguation() {
    let mut splitter = TagSplitter::new("think");
    assert!(splitter.update("<th").is_empty());
    assert_eq!(
        splitter.update("ink>hello</think>"),
        vec![TagSpan {
            matched: true,
            data: "hello".to_string()
        }]
    );
}

#[test]
fn tool_arguments_are_fragment_size_invariant() {
    let name = "list_directory";
    let arguments = r#"{"path":"/tmp/ünïcode","flags":["-l","-a"],"depth":3,"follow":null}"#;

    for pieces in [1, 2, 50] {
        let (mut normalizer, _clock) = build_normalizer(NormalizerOptions::default());
        let mut events = Vec::new();
        let size = arguments.len().div_ceil(pieces).max(1);
        let (name_head, name_tail) = name.split_at(4);

        normalizer.push_delta(
            Delta::tool_call(fragment(0, Some("call_x"), Some(name_head), None)),
            &mut events,
        );
        normalizer.push_delta(
            Delta::tool_call(fragment(0, None, Some(name_tail), None)),
            &mut events,
        );
        for piece in chunk_str(arguments, size) {
            normalizer.push_delta(
                Delta::tool_call(fragment(0, None, None, Some(piece))),
                &mut events,
            );
        }
        normalizer.push_delta(
            Delta::default().with_finish(FinishReason::ToolCalls),
            &mut events,
        );
        normalizer.finish(&mut events);

        assert_eq!(
            tool_ends(&events),
            vec![(
                0,
                name.to_string(),
                json!({"path": "/tmp/ünïcode", "flags": ["-l", "-a"], "depth": 3, "follow": null})
            )],
            "{pieces} pieces"
        );
    }
}

#[test]
fn interleaved_calls_finalize_in_open_order() {
    let options = NormalizerOptions {
        tool_call_mode: AssemblyMode::Interleaved,
        ..NormalizerOptions::default()
    };

    let (mut normalizer, _clock) = build_normalizer(options.clone());
    let mut events = Vec::new();
    for delta in [
        Delta::tool_call(fragment(0, Some("a"), Some("first"), Some("{\"n\":"))),
        Delta::tool_call(fragment(1, Some("b"), Some("second"), Some("{\"m\":"))),
        Delta::tool_call(fragment(1, None, None, Some("2}"))),
        Delta::tool_call(fragment(0, None, None, Some("1}"))),
        Delta::default().with_finish(FinishReason::ToolCalls),
    ] {
        normalizer.push_delta(delta, &mut events);
    }
    normalizer.finish(&mut events);
    assert_eq!(
        tool_ends(&events),
        vec![
            (0, "first".to_string(), json!({"n": 1})),
            (1, "second".to_string(), json!({"m": 2})),
        ]
    );

    let (mut normalizer, _clock) = build_normalizer(options);
    let mut events = Vec::new();
    for delta in [
        Delta::tool_call(fragment(1, Some("b"), Some("second"), None)),
        Delta::tool_call(fragment(0, Some("a"), Some("first"), None)),
        Delta::tool_call(fragment(0, None, None, Some("{}"))),
        Delta::tool_call(fragment(1, None, None, Some("{}"))),
    ] {
        normalizer.push_delta(delta, &mut events);
    }
    // no finish marker: end of stream finalizes
    normalizer.finish(&mut events);
    let order: Vec<usize> = tool_ends(&events)
        .into_iter()
        .map(|(index, ..)| index)
        .collect();
    assert_eq!(order, vec![1, 0]);
}

#[test]
fn usage_last_write_wins_with_latency() {
    let (mut normalizer, clock) = build_normalizer(NormalizerOptions::default());
    let mut events = Vec::new();
    normalizer.start_clock();

    clock.set(100);
    normalizer.push_delta(Delta::text("a"), &mut events);
    normalizer.push_delta(Delta::usage(usage(100, 10)), &mut events);
    clock.set(600);
    normalizer.push_delta(Delta::text("b"), &mut events);
    normalizer.push_delta(Delta::usage(usage(120, 15)), &mut events);
    clock.set(1_100);
    normalizer.finish(&mut events);

    let snapshots = usage_events(&events);
    assert_eq!(snapshots.len(), 1);
    let snapshot = snapshots[0];
    assert_eq!(snapshot.input_tokens, 120);
    assert_eq!(snapshot.output_tokens, 15);
    assert_eq!(snapshot.first_token_latency_ms, 100);
    assert_eq!(snapshot.total_latency_ms, 1_100);
    assert!((snapshot.tokens_per_second - 14.0).abs() < 1e-9);
    // 120 * $1/M + 15 * $2/M
    assert!((snapshot.cost - 0.000_15).abs() < 1e-12);
    assert_eq!(normalizer.phase(), NormalizerPhase::Closed);
}

#[test]
fn single_output_token_never_divides_by_zero() {
    for total in [0_u64, 1, 250] {
        let (mut normalizer, clock) = build_normalizer(NormalizerOptions::default());
        let mut events = Vec::new();
        normalizer.start_clock();
        normalizer.push_delta(Delta::text("x"), &mut events);
        normalizer.push_delta(Delta::usage(usage(5, 1)), &mut events);
        clock.set(total);
        normalizer.finish(&mut events);

        let snapshot = usage_events(&events)[0];
        let expected = if total == 0 { 0.0 } else { 1_000.0 / total as f64 };
        assert!(snapshot.tokens_per_second.is_finite());
        assert!(
            (snapshot.tokens_per_second - expected).abs() < 1e-9,
            "total {total}"
        );
    }
}

#[tokio::test]
async fn no_usage_event_without_usage_delta() {
    let events = ok_events(
        normalize_all(
            think_options(),
            vec![
                Ok(Delta::text("hi")),
                Ok(Delta::default().with_finish(FinishReason::Stop)),
            ],
        )
        .await,
    );
    assert_eq!(events, vec![CanonicalEvent::text("hi")]);
}

#[tokio::test]
async fn transport_failure_flushes_text_and_drops_usage() {
    let items = normalize_all(
        think_options(),
        vec![
            Ok(Delta::text("answer <think>half")),
            Ok(Delta::tool_call(fragment(0, Some("c"), Some("run"), Some("{")))),
            Ok(Delta::usage(usage(10, 3))),
            Err(CanonicalError::Transport("connection reset".to_string())),
            Ok(Delta::text("never seen")),
        ],
    )
    .await;

    let (last, events) = items.split_last().expect("items");
    assert!(matches!(last, Err(CanonicalError::Transport(_))));
    let events: Vec<&CanonicalEvent> = events
        .iter()
        .map(|item| item.as_ref().expect("event"))
        .collect();
    assert_eq!(events[0], &CanonicalEvent::text("answer "));
    assert_eq!(events[1], &CanonicalEvent::reasoning("half"));
    assert!(matches!(events[2], CanonicalEvent::ToolCallPartial { index: 0, .. }));
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn malformed_arguments_do_not_abort_the_stream() {
    let events = ok_events(
        normalize_all(
            NormalizerOptions::default(),
            vec![
                Ok(Delta::tool_call(fragment(0, Some("bad"), Some("run"), Some("{\"x\": tru")))
                    .with_finish(FinishReason::ToolCalls)),
                Ok(Delta::text("still here")),
            ],
        )
        .await,
    );

    let error = events
        .iter()
        .find_map(|event| match event {
            CanonicalEvent::ToolCallError(error) => Some(error),
            _ => None,
        })
        .expect("typed tool-call error");
    assert_eq!(error.id, "bad");
    assert_eq!(error.name, "run");
    assert_eq!(error.raw_arguments, "{\"x\": tru");
    assert_eq!(events.last(), Some(&CanonicalEvent::text("still here")));
}

#[tokio::test]
async fn side_channel_reasoning_gate() {
    let deltas = || {
        vec![
            Ok(Delta::reasoning("plan")),
            Ok(Delta::text("answer")),
            Ok(Delta::reasoning("late thought")),
        ]
    };

    let always = ok_events(normalize_all(NormalizerOptions::default(), deltas()).await);
    assert_eq!(always.len(), 3);

    let gated = ok_events(
        normalize_all(
            NormalizerOptions {
                reasoning_gate: ReasoningGate::BeforeVisibleOutput,
                ..NormalizerOptions::default()
            },
            deltas(),
        )
        .await,
    );
    assert_eq!(
        gated,
        vec![
            CanonicalEvent::reasoning("plan"),
            CanonicalEvent::text("answer"),
        ]
    );
}

#[tokio::test]
async fn unrecognized_deltas_are_ignored() {
    let events = ok_events(
        normalize_all(
            NormalizerOptions::default(),
            vec![
                Ok(Delta::default()),
                Ok(Delta::text("x")),
                Ok(Delta::default()),
            ],
        )
        .await,
    );
    assert_eq!(events, vec![CanonicalEvent::text("x")]);
}
