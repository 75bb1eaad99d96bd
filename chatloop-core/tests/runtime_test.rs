mod common;

use candle_core::{Device, IndexOp, Tensor};
use chatloop_core::graph::{GraphManifest, INPUT_IDS, LOGITS, MANIFEST_FILE};
use chatloop_core::kv_cache::{past_name, present_name, CacheKind};
use chatloop_core::{
    load_model, CandleRuntime, ChatError, GenerateOptions, InferenceEngine, KvCache, ModelAdapter,
    ModelFamily, TensorMap, Tokenizer,
};
use tempfile::TempDir;

fn all_adapters() -> Vec<ModelAdapter> {
    ModelFamily::ALL.into_iter().map(ModelAdapter::for_family).collect()
}

fn load_runtime(dir: &TempDir) -> CandleRuntime {
    let manifest = GraphManifest::load(dir.path().join(MANIFEST_FILE)).unwrap();
    CandleRuntime::load(dir.path(), manifest, &Device::Cpu).unwrap()
}

fn ids(tokens: &[i64]) -> Tensor {
    Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
}

/// Run one pass over `tokens` after `past` cached positions
fn run_pass(
    runtime: &mut CandleRuntime,
    adapter: &ModelAdapter,
    tokens: &[i64],
    cache: &KvCache,
    past: usize,
) -> TensorMap {
    let bindings = chatloop_core::CacheBindings::from_ports(runtime.inputs(), runtime.outputs()).unwrap();
    let mut aux = adapter.aux_state();
    aux.advance(past);
    let mut inputs = TensorMap::new();
    inputs.insert(INPUT_IDS.to_string(), ids(tokens));
    inputs.insert(adapter.aux.name().to_string(), aux.tensor(tokens.len(), &Device::Cpu).unwrap());
    cache.bind(&bindings, &mut inputs);
    runtime.run(inputs).unwrap()
}

fn empty_cache(runtime: &CandleRuntime, adapter: &ModelAdapter) -> KvCache {
    let bindings = chatloop_core::CacheBindings::from_ports(runtime.inputs(), runtime.outputs()).unwrap();
    KvCache::empty(runtime.inputs(), &bindings, adapter.layout, 1, &Device::Cpu).unwrap()
}

#[test]
fn test_present_tensors_follow_family_layout() {
    for adapter in all_adapters() {
        let dir = TempDir::new().unwrap();
        common::write_model_dir(dir.path(), &adapter);
        let mut runtime = load_runtime(&dir);

        let cache = empty_cache(&runtime, &adapter);
        let outputs = run_pass(&mut runtime, &adapter, &[1, 2, 3], &cache, 0);

        let logits = &outputs[LOGITS];
        assert_eq!(logits.dims(), &[1, 3, common::VOCAB]);
        for layer in 0..2 {
            for kind in [CacheKind::Key, CacheKind::Value] {
                let present = &outputs[&present_name(layer, kind)];
                assert_eq!(present.dim(adapter.layout.seq_axis()).unwrap(), 3, "{}", adapter.family);
                assert_eq!(present.dim(adapter.layout.batch_axis()).unwrap(), 1);
                assert_eq!(present.rank(), 4);
            }
        }
        assert!(runtime.input(&past_name(1, CacheKind::Value)).is_some());
    }
}

#[test]
fn test_cached_decode_matches_full_prefill() {
    for adapter in all_adapters() {
        let dir = TempDir::new().unwrap();
        common::write_model_dir(dir.path(), &adapter);
        let mut runtime = load_runtime(&dir);
        let bindings = chatloop_core::CacheBindings::from_ports(runtime.inputs(), runtime.outputs()).unwrap();

        let empty = empty_cache(&runtime, &adapter);
        let full = run_pass(&mut runtime, &adapter, &[5, 6, 7, 8], &empty, 0);
        let full_last = full[LOGITS].i((0, 3)).unwrap();

        let mut prefix = run_pass(&mut runtime, &adapter, &[5, 6, 7], &empty, 0);
        let cache = KvCache::from_outputs(&mut prefix, &bindings, adapter.layout).unwrap();
        assert_eq!(cache.len(), 3);
        let step = run_pass(&mut runtime, &adapter, &[8], &cache, 3);
        let step_last = step[LOGITS].i((0, 0)).unwrap();

        let diff = (full_last - step_last)
            .unwrap()
            .abs()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-3, "{}: max diff {}", adapter.family, diff);
    }
}

#[test]
fn test_end_to_end_generation() {
    for adapter in all_adapters() {
        let dir = TempDir::new().unwrap();
        common::write_model_dir(dir.path(), &adapter);
        let mut model = load_model(dir.path(), None, &Device::Cpu).unwrap();
        assert_eq!(model.adapter().family, adapter.family);

        let options = GenerateOptions::default().with_max_tokens(4).with_seed(7);
        let result = model.generate_text("你好, world", &options).unwrap();
        assert!(!result.tokens.is_empty() && result.tokens.len() <= 5);
        assert_eq!(result.iterations, result.tokens.len());
        assert!(result.tokens.iter().all(|&t| (t as usize) < common::VOCAB));

        let again = model.generate_text("你好, world", &options).unwrap();
        assert_eq!(result.tokens, again.tokens, "same seed, same output");
    }
}

#[test]
fn test_end_to_end_streaming_matches_batch() {
    let adapter = ModelAdapter::qwen();
    let dir = TempDir::new().unwrap();
    common::write_model_dir(dir.path(), &adapter);
    let mut model = load_model(dir.path(), Some(ModelFamily::Qwen), &Device::Cpu).unwrap();

    let options = GenerateOptions::default().with_max_tokens(6).with_seed(3);
    let prompt = model.encode_prompt("hello", 2048).unwrap();
    let batch = model.generate(&prompt, &options).unwrap();

    let mut updates = 0;
    let streamed = model
        .generate_streaming(&prompt, &options, |_| {
            updates += 1;
            std::ops::ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(batch.tokens, streamed.tokens);
    assert_eq!(updates, streamed.tokens.len() - 1);
    assert_eq!(model.tokenizer().eos_token_id(), 257);
}

#[test]
fn test_unknown_family_is_unsupported() {
    let adapter = ModelAdapter::chatglm2();
    let dir = TempDir::new().unwrap();
    common::write_model_dir(dir.path(), &adapter);

    let mut manifest = GraphManifest::load(dir.path().join(MANIFEST_FILE)).unwrap();
    manifest.family = "llama".to_string();
    manifest.save(dir.path().join(MANIFEST_FILE)).unwrap();

    assert!(matches!(
        load_model(dir.path(), None, &Device::Cpu),
        Err(ChatError::UnsupportedModel(_))
    ));
    // an explicit family still loads
    assert!(load_model(dir.path(), Some(ModelFamily::ChatGlm2), &Device::Cpu).is_ok());
}

#[test]
fn test_missing_cache_input_is_engine_error() {
    let adapter = ModelAdapter::internlm();
    let dir = TempDir::new().unwrap();
    common::write_model_dir(dir.path(), &adapter);
    let mut runtime = load_runtime(&dir);

    let mut inputs = TensorMap::new();
    inputs.insert(INPUT_IDS.to_string(), ids(&[1, 2]));
    assert!(matches!(runtime.run(inputs), Err(ChatError::Engine(_))));
}
