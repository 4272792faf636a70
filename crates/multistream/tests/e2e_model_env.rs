use multistream::model::ModelBundle;
use multistream::{GenConfig, LanguageModel, LmGen, TokenFrame, ZERO_TOKEN};

/// Optional integration test against real weights.
///
/// Run locally with:
/// `MULTISTREAM_MODEL_DIR=/path/to/model cargo test -p multistream --test e2e_model_env -- --nocapture`
#[test]
fn model_dir_env_smoke() {
    let Some(model_dir) = std::env::var_os("MULTISTREAM_MODEL_DIR") else {
        eprintln!("skipping: MULTISTREAM_MODEL_DIR is not set");
        return;
    };

    let bundle = ModelBundle::load_from_dir(&model_dir).expect("load bundle");
    let missing = bundle.missing_tensors();
    assert!(missing.is_empty(), "missing tensors: {missing:?}");

    let model = bundle.build_model().expect("build model");
    let cfg = model.config().clone();
    let gen_cfg = GenConfig {
        check: true,
        ..GenConfig::greedy()
    };
    let mut lm_gen = LmGen::new(&model, gen_cfg).expect("lm_gen");
    lm_gen.open_session(1).expect("open");

    let input = TokenFrame::filled(1, cfg.num_external_codebooks(), ZERO_TOKEN);
    let mut produced = 0;
    for _ in 0..cfg.max_delay() + 3 {
        if let Some(out) = lm_gen.step(&input).expect("step") {
            assert_eq!(out.tokens.codebooks(), cfg.dep_q + 1);
            assert!(out.text_logits.iter().all(|v| v.is_finite()));
            produced += 1;
        }
    }
    assert_eq!(produced, 3);
}
