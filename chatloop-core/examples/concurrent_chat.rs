//! Example: two conversations sharing one loaded graph
//!
//! Each thread owns its chat model and generation state; only the runtime is
//! shared, one forward pass at a time.
//!
//! Run with:
//!   cargo run --example concurrent_chat -- --model ./models/qwen-7b-chat
//!   cargo run --example concurrent_chat -- --model ./models/chatglm2-6b --max-tokens 64

use anyhow::Result;
use candle_core::Device;
use chatloop_core::graph::MANIFEST_FILE;
use chatloop_core::tokenizer::TOKENIZER_FILE;
use chatloop_core::{
    CandleRuntime, ChatModel, Conversation, GenerateOptions, GraphManifest, HfTokenizer, ModelRegistry,
    SharedEngine,
};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let model_dir = args
        .iter()
        .position(|a| a == "--model")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./models/qwen-7b-chat"));
    let max_tokens = args
        .iter()
        .position(|a| a == "--max-tokens")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    let manifest = GraphManifest::load(model_dir.join(MANIFEST_FILE))?;
    let adapter = ModelRegistry::new().resolve_tag(&manifest.family)?;
    let tokenizer = Arc::new(HfTokenizer::from_file(
        model_dir.join(TOKENIZER_FILE),
        &adapter.eos_candidates(),
    )?);
    let engine = SharedEngine::new(CandleRuntime::load(&model_dir, manifest, &Device::Cpu)?);

    let questions = ["请介绍一下上海？", "What is a key/value cache?"];
    let handles: Vec<_> = questions
        .into_iter()
        .enumerate()
        .map(|(i, question)| {
            let engine = engine.clone();
            let tokenizer = tokenizer.clone();
            let adapter = adapter.clone();
            thread::spawn(move || -> Result<String> {
                let mut model = ChatModel::new(engine, tokenizer, adapter)?;
                let options = GenerateOptions::default()
                    .with_max_tokens(max_tokens)
                    .with_seed(i as u64);
                let prompt = model.build_prompt(&Conversation::new(), question);
                let tokens = model.encode_prompt(&prompt, options.max_input_tokens)?;
                let mut updates = 0;
                let result = model.generate_streaming(&tokens, &options, |_| {
                    updates += 1;
                    ControlFlow::Continue(())
                })?;
                Ok(format!(
                    "[{i}] {question}\n{}\n({} updates, {:.1} tok/s)",
                    result.text, updates, result.tokens_per_second
                ))
            })
        })
        .collect();

    for handle in handles {
        match handle.join() {
            Ok(answer) => println!("{}\n", answer?),
            Err(_) => anyhow::bail!("generation thread panicked"),
        }
    }
    Ok(())
}
