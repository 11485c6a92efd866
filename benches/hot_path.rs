use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use deltanorm::protocol::anthropic::stream::AnthropicStreamDecoder;
use deltanorm::protocol::canonical::{Delta, FinishReason, ModelInfo, RawUsage, ToolCallFragment};
use deltanorm::protocol::openai_chat::stream::OpenAiChatDecoder;
use deltanorm::protocol::DeltaDecoder;
use deltanorm::stream::{
    AssemblyMode, ManualClock, NoPricing, NormalizerOptions, SseEvent, SseParser,
    StreamNormalizer, TagSplitter, UsageAccumulator,
};

fn reasoning_text(len: usize) -> String {
    let mut text = String::with_capacity(len + 64);
    text.push_str("<think>");
    while text.len() < len / 2 {
        text.push_str("weighing the <options> carefully, ");
    }
    text.push_str("</think>");
    while text.len() < len {
        text.push_str("here is the answer with <b>markup</b>. ");
    }
    text
}

fn chunks(text: &str, size: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end += 1;
        }
        out.push(&rest[..end]);
        rest = &rest[end..];
    }
    out
}

fn openai_sse_body(content_chunks: usize) -> String {
    let mut body = String::new();
    for idx in 0..content_chunks {
        body.push_str("data: {\"id\":\"chatcmpl_b\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"token ");
        body.push_str(&idx.to_string());
        body.push_str(" \"},\"finish_reason\":null}]}\n\n");
    }
    body.push_str(
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":100,\"completion_tokens\":200}}\n\n",
    );
    body.push_str("data: [DONE]\n\n");
    body
}

fn usage_accumulator() -> UsageAccumulator {
    UsageAccumulator::new(
        ModelInfo::unpriced("bench"),
        Arc::new(NoPricing),
        Arc::new(ManualClock::new(0)),
    )
}

fn bench_tag_splitter(c: &mut Criterion) {
    let text = reasoning_text(4096);
    let small = chunks(&text, 4);
    let medium = chunks(&text, 64);

    c.bench_function("tag_splitter_4k_chunks_4b", |b| {
        b.iter(|| {
            let mut splitter = TagSplitter::new("think");
            let mut emitted = 0_usize;
            for piece in &small {
                emitted += splitter.update(black_box(piece)).len();
            }
            emitted += splitter.finish().len();
            black_box(emitted)
        });
    });

    c.bench_function("tag_splitter_4k_chunks_64b", |b| {
        b.iter(|| {
            let mut splitter = TagSplitter::new("think");
            let mut emitted = 0_usize;
            for piece in &medium {
                emitted += splitter.update(black_box(piece)).len();
            }
            emitted += splitter.finish().len();
            black_box(emitted)
        });
    });
}

fn bench_sse_parser(c: &mut Criterion) {
    let body = openai_sse_body(256);
    let pieces = chunks(&body, 512);

    c.bench_function("sse_parser_openai_256_frames", |b| {
        b.iter(|| {
            let mut parser = SseParser::new();
            let mut events = Vec::with_capacity(260);
            for piece in &pieces {
                parser.feed_into(black_box(piece), &mut events);
            }
            parser.finish(&mut events);
            black_box(events.len())
        });
    });
}

fn bench_decoders(c: &mut Criterion) {
    let openai_frame = SseEvent {
        data: "{\"id\":\"chatcmpl_b\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hello world\"},\"finish_reason\":null}]}".to_string(),
        ..SseEvent::default()
    };
    c.bench_function("decode_openai_content_chunk", |b| {
        let mut decoder = OpenAiChatDecoder::new();
        b.iter(|| black_box(decoder.decode(black_box(&openai_frame)).expect("decode")));
    });

    let anthropic_frame = SseEvent {
        event: Some("content_block_delta".to_string()),
        data: "{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hello world\"}}".to_string(),
        id: None,
    };
    c.bench_function("decode_anthropic_text_delta", |b| {
        let mut decoder = AnthropicStreamDecoder::new();
        b.iter(|| black_box(decoder.decode(black_box(&anthropic_frame)).expect("decode")));
    });
}

fn bench_normalizer(c: &mut Criterion) {
    let text = reasoning_text(2048);
    let content = chunks(&text, 16);
    let arguments = "{\"path\":\"/var/log\",\"pattern\":\"error\",\"limit\":100}";
    let argument_pieces = chunks(arguments, 4);

    let build_deltas = || {
        let mut deltas: Vec<Delta> = content.iter().map(|piece| Delta::text(*piece)).collect();
        for (idx, piece) in argument_pieces.iter().enumerate() {
            deltas.push(Delta::tool_call(ToolCallFragment {
                index: 0,
                id: (idx == 0).then(|| "call_bench".to_string()),
                name: (idx == 0).then(|| "grep".to_string()),
                arguments: Some((*piece).to_string()),
            }));
        }
        deltas.push(Delta::default().with_finish(FinishReason::ToolCalls));
        deltas.push(Delta::usage(RawUsage {
            input_tokens: 100,
            output_tokens: 200,
            ..RawUsage::default()
        }));
        deltas
    };

    for (label, mode) in [
        ("normalizer_2k_text_and_tool_sequential", AssemblyMode::Sequential),
        ("normalizer_2k_text_and_tool_interleaved", AssemblyMode::Interleaved),
    ] {
        let options = NormalizerOptions {
            reasoning_tag: Some("think".to_string()),
            tool_call_mode: mode,
            ..NormalizerOptions::default()
        };
        c.bench_function(label, |b| {
            b.iter_batched(
                build_deltas,
                |deltas| {
                    let mut normalizer =
                        StreamNormalizer::new(options.clone(), usage_accumulator());
                    let mut events = Vec::with_capacity(deltas.len() + 4);
                    for delta in deltas {
                        normalizer.push_delta(delta, &mut events);
                    }
                    normalizer.finish(&mut events);
                    black_box(events.len())
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
}

criterion_group!(
    benches,
    bench_tag_splitter,
    bench_sse_parser,
    bench_decoders,
    bench_normalizer
);
criterion_main!(benches);
