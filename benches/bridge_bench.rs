//! Benchmarks for the prompt bridge and handle ownership.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use llmodel_bridge::config::ModelConfig;
use llmodel_bridge::inference::bridge::PromptRequest;
use llmodel_bridge::inference::handle::HandleOwner;
use llmodel_bridge::inference::model::LlModel;
use llmodel_bridge::inference::native::{FragmentDecoder, PromptOptions};
use llmodel_bridge::inference::simulated::SimulatedEngine;

fn model_file() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.gguf");
    std::fs::write(&path, b"GGUF bench weights").unwrap();
    (dir, path)
}

fn bench_prompt_roundtrip(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let (_dir, path) = model_file();

    let reply: Vec<String> = (0..256).map(|i| format!("tok{i} ")).collect();
    let engine = Arc::new(SimulatedEngine::new().with_reply(reply));
    let config = ModelConfig {
        model_path: path,
        ..Default::default()
    };
    let model = LlModel::load(engine, &config).unwrap();
    let options = PromptOptions {
        n_predict: 256,
        ..Default::default()
    };

    c.bench_function("prompt_256_tokens", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let request = PromptRequest::new("bench").with_options(options.clone());
                let completion = model.prompt(request).unwrap().finish().await.unwrap();
                black_box(completion);
            })
        })
    });
}

fn bench_handle_access(c: &mut Criterion) {
    let (_dir, path) = model_file();
    let engine = Arc::new(SimulatedEngine::new());
    let owner = HandleOwner::acquire(engine, &path, "auto").unwrap();

    c.bench_function("with_handle_thread_count", |b| {
        b.iter(|| {
            let n = owner.with_handle(|engine, raw| Ok(engine.thread_count(raw))).unwrap();
            black_box(n);
        })
    });
}

fn bench_fragment_decoder(c: &mut Criterion) {
    // Multi-byte text split at every byte boundary.
    let text = "héllo wörld ☃ ".repeat(64);
    let bytes = text.as_bytes();

    c.bench_function("decoder_bytewise_1k", |b| {
        b.iter(|| {
            let mut decoder = FragmentDecoder::new();
            let mut out = String::with_capacity(bytes.len());
            for byte in bytes.chunks(1) {
                if let Some(piece) = decoder.push(black_box(byte)) {
                    out.push_str(&piece);
                }
            }
            black_box(out);
        })
    });
}

criterion_group!(benches, bench_prompt_roundtrip, bench_handle_access, bench_fragment_decoder);
criterion_main!(benches);
