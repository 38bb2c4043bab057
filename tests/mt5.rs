mod common;

use common::{tiny_config, BYTE_VOCAB_SIZE, EOS_ID};
use mt5_translator::mt5::{MT5ForConditionalGeneration, MT5Generator, IGNORE_INDEX};
use mt5_translator::pipelines::generation_utils::{GenerateConfig, LanguageGenerator};
use tch::{nn, no_grad, Device, Kind, Tensor};

fn tiny_model(config: &mt5_translator::mt5::MT5Config) -> (MT5ForConditionalGeneration, nn::VarStore) {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = MT5ForConditionalGeneration::new(vs.root(), config);
    (model, vs)
}

fn source() -> (Tensor, Tensor) {
    let input_ids = Tensor::from_slice(&[40i64, 41, 42, 43, EOS_ID, 50, 51, EOS_ID, 0, 0]).view((2, 5));
    let attention_mask = input_ids.ne(0).to_kind(Kind::Int64);
    (input_ids, attention_mask)
}

#[test]
fn mt5_forward_pass_shapes() -> anyhow::Result<()> {
    let config = tiny_config();
    let (model, _vs) = tiny_model(&config);
    let (input_ids, attention_mask) = source();
    let decoder_input_ids = Tensor::from_slice(&[0i64, 60, 61, 0, 70, 71]).view((2, 3));

    let output = no_grad(|| {
        model.forward_t(
            Some(&input_ids),
            Some(&attention_mask),
            None,
            &decoder_input_ids,
            None,
            None,
            false,
        )
    })?;

    assert_eq!(output.decoder_output.size(), vec![2, 3, BYTE_VOCAB_SIZE]);
    let encoder_hidden_state = output
        .encoder_hidden_state
        .ok_or_else(|| anyhow::anyhow!("encoder output missing"))?;
    assert_eq!(encoder_hidden_state.size(), vec![2, 5, config.d_model]);
    let cache = output
        .next_cache
        .ok_or_else(|| anyhow::anyhow!("decoder cache missing"))?;
    assert_eq!(cache.len(), 2);
    Ok(())
}

#[test]
fn mt5_tied_embeddings() -> anyhow::Result<()> {
    let config = mt5_translator::mt5::MT5Config {
        tie_word_embeddings: Some(true),
        feed_forward_proj: Some(mt5_translator::mt5::FeedForwardProj::Relu),
        ..tiny_config()
    };
    let (model, vs) = tiny_model(&config);
    assert!(!vs.variables().keys().any(|name| name.starts_with("lm_head")));

    let (input_ids, attention_mask) = source();
    let decoder_input_ids = Tensor::from_slice(&[0i64, 0]).view((2, 1));
    let output = no_grad(|| {
        model.forward_t(
            Some(&input_ids),
            Some(&attention_mask),
            None,
            &decoder_input_ids,
            None,
            None,
            false,
        )
    })?;
    assert_eq!(output.decoder_output.size(), vec![2, 1, BYTE_VOCAB_SIZE]);
    Ok(())
}

#[test]
fn mt5_loss_skips_ignored_labels() -> anyhow::Result<()> {
    let config = tiny_config();
    let (model, _vs) = tiny_model(&config);
    let (input_ids, attention_mask) = source();
    let labels = Tensor::from_slice(&[60i64, 61, EOS_ID, 70, EOS_ID, IGNORE_INDEX]).view((2, 3));

    let output = no_grad(|| {
        model.forward_with_labels(&input_ids, Some(&attention_mask), &labels, None, false)
    })?;

    let log_probs = output.logits.log_softmax(-1, Kind::Float).view((6, -1));
    let targets = [60i64, 61, EOS_ID, 70, EOS_ID];
    let expected = -targets
        .iter()
        .enumerate()
        .map(|(position, &target)| log_probs.double_value(&[position as i64, target]))
        .sum::<f64>()
        / targets.len() as f64;
    let loss = output.loss.double_value(&[]);
    assert!((loss - expected).abs() < 1e-4, "{loss} != {expected}");
    Ok(())
}

#[test]
fn mt5_labels_are_shifted_right() -> anyhow::Result<()> {
    let config = tiny_config();
    let (model, _vs) = tiny_model(&config);
    let labels = Tensor::from_slice(&[60i64, 61, IGNORE_INDEX]).view((1, 3));
    let shifted = Vec::<i64>::try_from(&model.shift_right(&labels).view(-1))?;
    assert_eq!(shifted, vec![0, 60, 61]);
    Ok(())
}

#[test]
fn mt5_cached_decoding_matches_full_pass() -> anyhow::Result<()> {
    let config = tiny_config();
    let (model, _vs) = tiny_model(&config);
    let (input_ids, attention_mask) = source();
    let decoder_input_ids = Tensor::from_slice(&[0i64, 60, 61, 0, 70, 71]).view((2, 3));

    no_grad(|| -> anyhow::Result<()> {
        let encoder_output = model.encode(&input_ids, Some(&attention_mask))?;
        let full = model.forward_t(
            None,
            Some(&attention_mask),
            Some(&encoder_output),
            &decoder_input_ids,
            None,
            None,
            false,
        )?;
        let prefix = model.forward_t(
            None,
            Some(&attention_mask),
            Some(&encoder_output),
            &decoder_input_ids.narrow(1, 0, 2),
            None,
            None,
            false,
        )?;
        let step = model.forward_t(
            None,
            Some(&attention_mask),
            Some(&encoder_output),
            &decoder_input_ids.narrow(1, 2, 1),
            None,
            prefix.next_cache,
            false,
        )?;

        let expected = full.decoder_output.narrow(1, 2, 1);
        let difference = (step.decoder_output - expected)
            .abs()
            .max()
            .double_value(&[]);
        assert!(difference < 1e-4, "max difference {difference}");
        Ok(())
    })
}

fn generator(generate_config: GenerateConfig) -> anyhow::Result<MT5Generator> {
    let config = tiny_config();
    let (model, mut vs) = tiny_model(&config);
    vs.freeze();
    Ok(MT5Generator::from_parts(model, vs, &config, generate_config)?)
}

#[test]
fn mt5_greedy_generation() -> anyhow::Result<()> {
    let generator = generator(GenerateConfig {
        max_length: 8,
        ..Default::default()
    })?;
    let (input_ids, attention_mask) = source();

    let output = generator.generate_indices(&input_ids, Some(&attention_mask), None, None)?;
    let again = generator.generate_indices(&input_ids, Some(&attention_mask), None, None)?;

    assert_eq!(output.len(), 2);
    assert_eq!(output, again);
    for sequence in &output {
        assert!(sequence.len() <= 8);
        assert_eq!(sequence[0], 0);
        assert!(sequence.iter().all(|&id| (0..BYTE_VOCAB_SIZE).contains(&id)));
    }
    Ok(())
}

#[test]
fn mt5_min_length_delays_end_of_sequence() -> anyhow::Result<()> {
    let generator = generator(GenerateConfig {
        min_length: 6,
        max_length: 6,
        ..Default::default()
    })?;
    let (input_ids, attention_mask) = source();

    let output = generator.generate_indices(&input_ids, Some(&attention_mask), None, None)?;
    for sequence in &output {
        assert_eq!(sequence.len(), 6);
        assert!(!sequence.contains(&EOS_ID));
    }
    Ok(())
}

#[test]
fn mt5_beam_search_generation() -> anyhow::Result<()> {
    let generator = generator(GenerateConfig {
        max_length: 8,
        num_beams: 3,
        num_return_sequences: 2,
        length_penalty: 2.0,
        repetition_penalty: 2.5,
        no_repeat_ngram_size: 2,
        early_stopping: true,
        ..Default::default()
    })?;
    let (input_ids, attention_mask) = source();

    let output = generator.generate_indices(&input_ids, Some(&attention_mask), None, None)?;

    assert_eq!(output.len(), 4);
    for sequence in &output {
        assert!(sequence.len() <= 8);
        assert_eq!(sequence[0], 0);
    }
    Ok(())
}

#[test]
fn mt5_generation_rejects_short_max_length() -> anyhow::Result<()> {
    let generator = generator(GenerateConfig::default())?;
    let (input_ids, attention_mask) = source();
    assert!(generator
        .generate_indices(&input_ids, Some(&attention_mask), None, 1i64)
        .is_err());
    Ok(())
}

fn beam_generate_config() -> GenerateConfig {
    GenerateConfig {
        max_length: 8,
        num_beams: 4,
        num_return_sequences: 2,
        length_penalty: 2.0,
        ..Default::default()
    }
}

#[test]
fn mt5_beam_search_rows_are_independent() -> anyhow::Result<()> {
    let generator = generator(beam_generate_config())?;
    let (input_ids, attention_mask) = source();

    let batched = generator.generate_indices(&input_ids, Some(&attention_mask), None, None)?;
    assert_eq!(batched.len(), 4);

    for row in 0..2i64 {
        let alone = generator.generate_indices(
            &input_ids.narrow(0, row, 1),
            Some(&attention_mask.narrow(0, row, 1)),
            None,
            None,
        )?;
        let start = (row * 2) as usize;
        assert_eq!(alone, batched[start..start + 2].to_vec(), "input {row}");
    }
    Ok(())
}

/// Length-penalised score of a returned beam, recomputed with an uncached decoder pass.
fn beam_score(
    model: &MT5ForConditionalGeneration,
    input_ids: &Tensor,
    attention_mask: &Tensor,
    sequence: &[i64],
    config: &GenerateConfig,
) -> anyhow::Result<f64> {
    let length = sequence.len() as i64;
    let decoder_input_ids = Tensor::from_slice(&sequence[..sequence.len() - 1]).unsqueeze(0);
    let targets = Tensor::from_slice(&sequence[1..]).view((1, length - 1, 1));
    let output = no_grad(|| {
        model.forward_t(
            Some(input_ids),
            Some(attention_mask),
            None,
            &decoder_input_ids,
            None,
            None,
            false,
        )
    })?;
    let sum_log_probabilities = output
        .decoder_output
        .log_softmax(-1, Kind::Float)
        .gather(-1, &targets, false)
        .sum(Kind::Float)
        .double_value(&[]);
    // live beams never hold an end-of-sequence token: a final one was appended to a finished
    // hypothesis, scored but not counted in its length
    let scored_length = if sequence.last() == Some(&EOS_ID) {
        length - 1
    } else {
        length
    };
    Ok(sum_log_probabilities / (scored_length as f64).powf(config.length_penalty))
}

#[test]
fn mt5_beam_search_ranks_by_penalised_score() -> anyhow::Result<()> {
    let generate_config = beam_generate_config();
    let generator = generator(generate_config.clone())?;
    let (model, _vs) = tiny_model(&tiny_config());
    let (input_ids, attention_mask) = source();

    let output = generator.generate_indices(&input_ids, Some(&attention_mask), None, None)?;

    for (row, sequences) in output.chunks(2).enumerate() {
        let row_ids = input_ids.narrow(0, row as i64, 1);
        let row_mask = attention_mask.narrow(0, row as i64, 1);
        let scores = sequences
            .iter()
            .map(|sequence| beam_score(&model, &row_ids, &row_mask, sequence, &generate_config))
            .collect::<anyhow::Result<Vec<f64>>>()?;
        assert!(
            scores.windows(2).all(|pair| pair[0] + 1e-4 >= pair[1]),
            "input {row}: {scores:?}"
        );
    }
    Ok(())
}
