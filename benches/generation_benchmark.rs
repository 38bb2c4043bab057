#[macro_use]
extern crate criterion;

use criterion::{black_box, Criterion};
use mt5_translator::mt5::{FeedForwardProj, MT5Config, MT5ForConditionalGeneration, MT5Generator};
use mt5_translator::pipelines::generation_utils::{GenerateConfig, LanguageGenerator};
use std::time::{Duration, Instant};
use tch::{nn, Device, Tensor};

fn create_generator(num_beams: i64) -> MT5Generator {
    let config = MT5Config {
        dropout_rate: 0.0,
        d_model: 64,
        d_ff: 128,
        d_kv: 16,
        num_heads: 4,
        num_layers: 2,
        num_decoder_layers: Some(2),
        vocab_size: 1024,
        feed_forward_proj: Some(FeedForwardProj::GatedGelu),
        ..Default::default()
    };
    let mut vs = nn::VarStore::new(Device::cuda_if_available());
    let model = MT5ForConditionalGeneration::new(vs.root(), &config);
    vs.freeze();
    let generate_config = GenerateConfig {
        max_length: 32,
        min_length: 32,
        num_beams,
        repetition_penalty: 2.5,
        length_penalty: 2.0,
        early_stopping: true,
        ..Default::default()
    };
    MT5Generator::from_parts(model, vs, &config, generate_config).unwrap()
}

fn generation_forward_pass(iters: u64, model: &MT5Generator, input_ids: &Tensor) -> Duration {
    let mut duration = Duration::new(0, 0);
    for _i in 0..iters {
        let start = Instant::now();
        let _ = model.generate_indices(input_ids, None, None, None);
        duration = duration.checked_add(start.elapsed()).unwrap();
    }
    duration
}

fn bench_generation(c: &mut Criterion) {
    unsafe {
        torch_sys::dummy_cuda_dependency();
    }
    let input_ids = Tensor::randint_low(2, 1024, [4, 48], (tch::Kind::Int64, Device::Cpu));

    let greedy = create_generator(1);
    c.bench_function("Greedy generation", |b| {
        b.iter_custom(|iters| black_box(generation_forward_pass(iters, &greedy, &input_ids)))
    });

    let beam_search = create_generator(8);
    c.bench_function("Beam search generation", |b| {
        b.iter_custom(|iters| black_box(generation_forward_pass(iters, &beam_search, &input_ids)))
    });
}

criterion_group! {
name = benches;
config = Criterion::default().sample_size(10);
targets = bench_generation
}

criterion_main!(benches);
