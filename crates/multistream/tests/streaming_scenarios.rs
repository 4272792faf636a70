use std::cell::{Cell, RefCell};

use multistream::{
    Error, GenConfig, LanguageModel, LmConfig, LmGen, LmModel, LmNoStream, Result, TemporalOutput,
    Token, TokenFrame, ZERO_TOKEN,
};

/// Deterministic model: the text head peaks at a token derived from the
/// step index and batch row, and every depth step peaks at the previous
/// token plus one plus the codebook index.
struct ScriptedModel {
    cfg: LmConfig,
    temporal_calls: Cell<usize>,
    depth_calls: Cell<usize>,
    inputs: RefCell<Vec<TokenFrame>>,
    fail_at: Cell<Option<usize>>,
}

struct DepthCursor {
    next_cb: usize,
}

impl ScriptedModel {
    fn new(n_q: usize, dep_q: usize, delays: Vec<usize>) -> Self {
        Self {
            cfg: LmConfig::tiny(n_q, dep_q, delays),
            temporal_calls: Cell::new(0),
            depth_calls: Cell::new(0),
            inputs: RefCell::new(Vec::new()),
            fail_at: Cell::new(None),
        }
    }

    fn text_for(&self, step: usize, batch: usize) -> Token {
        ((7 + 5 * step + 3 * batch) % self.cfg.text_card) as Token
    }

    fn audio_after(&self, prev: Token, cb: usize) -> Token {
        ((prev as usize + 1 + cb) % self.cfg.card) as Token
    }

    /// `[text, audio_0, .., audio_{dep_q-1}]` generated at `step` for `batch`.
    fn generated(&self, step: usize, batch: usize) -> Vec<Token> {
        let mut out = vec![self.text_for(step, batch)];
        for cb in 0..self.cfg.dep_q {
            let prev = out[cb];
            out.push(self.audio_after(prev, cb));
        }
        out
    }

    fn input(&self, step: usize) -> TokenFrame {
        self.inputs.borrow()[step].clone()
    }
}

fn one_hot(width: usize, idx: usize) -> Vec<f32> {
    let mut v = vec![-4.0f32; width];
    v[idx] = 4.0;
    v
}

impl LanguageModel for ScriptedModel {
    type TemporalState = usize;
    type DepthState = DepthCursor;

    fn config(&self) -> &LmConfig {
        &self.cfg
    }

    fn init_temporal_state(&self, _batch_size: usize) -> usize {
        0
    }

    fn forward_text(&self, step: &mut usize, tokens: &TokenFrame) -> Result<TemporalOutput> {
        if self.fail_at.get() == Some(*step) {
            self.fail_at.set(None);
            return Err(Error::Configuration("injected failure".to_string()));
        }
        self.temporal_calls.set(self.temporal_calls.get() + 1);
        self.inputs.borrow_mut().push(tokens.clone());
        let batch = tokens.batch();
        let text_logits = (0..batch)
            .flat_map(|b| one_hot(self.cfg.text_out_vocab(), self.text_for(*step, b) as usize))
            .collect();
        let hidden = vec![*step as f32; batch * self.cfg.dim];
        *step += 1;
        Ok(TemporalOutput {
            hidden,
            text_logits,
        })
    }

    fn init_depth_state(&self, _batch_size: usize) -> DepthCursor {
        DepthCursor { next_cb: 0 }
    }

    fn forward_depformer(
        &self,
        state: &mut DepthCursor,
        cb_index: usize,
        prev_tokens: &[Token],
        hidden: &[f32],
    ) -> Result<Vec<f32>> {
        assert_eq!(state.next_cb, cb_index, "depth chain out of order or state reused");
        assert_eq!(hidden.len(), prev_tokens.len() * self.cfg.dim);
        state.next_cb += 1;
        self.depth_calls.set(self.depth_calls.get() + 1);
        Ok(prev_tokens
            .iter()
            .flat_map(|&p| one_hot(self.cfg.card, self.audio_after(p, cb_index) as usize))
            .collect())
    }
}

fn no_external(batch: usize) -> TokenFrame {
    TokenFrame::filled(batch, 0, ZERO_TOKEN)
}

#[test]
fn scenario_a_zero_delays_emit_every_step() {
    let model = ScriptedModel::new(8, 8, vec![0; 9]);
    let mut lm_gen = LmGen::new(&model, GenConfig::greedy()).expect("lm_gen");
    lm_gen.open_session(1).expect("open");

    for step in 0..10 {
        let out = lm_gen
            .step(&no_external(1))
            .expect("step")
            .expect("no warm-up with zero delays");
        assert_eq!(out.tokens.row(0), model.generated(step, 0).as_slice(), "step {step}");
        assert_eq!(out.text_tokens, vec![model.text_for(step, 0)]);
    }
    assert_eq!(model.temporal_calls.get(), 10);
    assert_eq!(model.depth_calls.get(), 80);
}

#[test]
fn scenario_b_text_leads_audio_by_one_step() {
    let model = ScriptedModel::new(8, 8, vec![0, 1, 1, 1, 1, 1, 1, 1, 1]);
    let cfg = model.config().clone();
    let mut lm_gen = LmGen::new(&model, GenConfig::greedy()).expect("lm_gen");
    lm_gen.open_session(1).expect("open");

    assert!(lm_gen.step(&no_external(1)).expect("step 0").is_none());
    for step in 1..12 {
        let out = lm_gen.step(&no_external(1)).expect("step").expect("output");
        let row = out.tokens.row(0);
        assert_eq!(row[0], model.generated(step - 1, 0)[0], "text at step {step}");
        assert_eq!(&row[1..], &model.generated(step, 0)[1..], "audio at step {step}");
    }

    let initial = cfg.initial_tokens();
    assert_eq!(model.input(0).row(0), initial.as_slice());
    // Audio is still warming up at offset 1; text already feeds back.
    let mut expected = initial.clone();
    expected[0] = model.text_for(0, 0);
    assert_eq!(model.input(1).row(0), expected.as_slice());
    assert_eq!(model.input(2).row(0), model.generated(1, 0).as_slice());
}

#[test]
fn scenario_c_out_of_range_external_fails_before_the_model_runs() {
    let model = ScriptedModel::new(4, 2, vec![0, 0, 0, 1, 1]);
    let card = model.config().card as Token;
    let gen_cfg = GenConfig {
        check: true,
        ..GenConfig::greedy()
    };
    let mut lm_gen = LmGen::new(&model, gen_cfg).expect("lm_gen");
    lm_gen.open_session(1).expect("open");

    let err = lm_gen
        .step(&TokenFrame::from_row(&[3, card + 1]))
        .expect_err("must be rejected");
    assert!(matches!(
        err,
        Error::ConsistencyViolation {
            codebook: 4,
            offset: 0,
            ..
        }
    ));
    assert_eq!(model.temporal_calls.get(), 0);
    assert_eq!(model.depth_calls.get(), 0);
}

#[test]
fn validation_accepts_zero_and_initial_tokens() {
    let model = ScriptedModel::new(4, 2, vec![0, 0, 0, 1, 1]);
    let card = model.config().card as Token;
    let gen_cfg = GenConfig {
        check: true,
        ..GenConfig::greedy()
    };
    let mut lm_gen = LmGen::new(&model, gen_cfg).expect("lm_gen");
    lm_gen.open_session(1).expect("open");
    for _ in 0..4 {
        lm_gen
            .step(&TokenFrame::from_row(&[ZERO_TOKEN, card]))
            .expect("valid step");
    }
    assert!(matches!(
        lm_gen.step(&TokenFrame::from_row(&[-2, 0])),
        Err(Error::ConsistencyViolation { .. })
    ));
}

#[test]
fn external_tokens_reach_the_model_after_their_delay() {
    let model = ScriptedModel::new(4, 2, vec![0, 0, 0, 2, 1]);
    let initial = model.config().initial_tokens();
    let mut lm_gen = LmGen::new(&model, GenConfig::greedy()).expect("lm_gen");
    lm_gen.open_session(1).expect("open");
    let ext = |step: usize| [10 + step as Token, 20 + step as Token];
    for step in 0..8 {
        lm_gen.step(&TokenFrame::from_row(&ext(step))).expect("step");
    }
    for step in 0..8 {
        let row = model.input(step).row(0).to_vec();
        let want3 = if step <= 2 { initial[3] } else { ext(step - 2)[0] };
        let want4 = if step <= 1 { initial[4] } else { ext(step - 1)[1] };
        assert_eq!((row[3], row[4]), (want3, want4), "step {step}");
    }
}

#[test]
fn warm_up_length_equals_max_delay() {
    for delays in [
        vec![0, 0, 0],
        vec![0, 1, 0],
        vec![0, 3, 1],
        vec![2, 0, 5],
    ] {
        let max_delay = delays.iter().copied().max().unwrap_or(0);
        let model = ScriptedModel::new(2, 2, delays.clone());
        let mut lm_gen = LmGen::new(&model, GenConfig::greedy()).expect("lm_gen");
        lm_gen.open_session(1).expect("open");
        let outputs: Vec<bool> = (0..max_delay + 4)
            .map(|_| lm_gen.step(&no_external(1)).expect("step").is_some())
            .collect();
        let silent = outputs.iter().take_while(|&&o| !o).count();
        assert_eq!(silent, max_delay, "delays {delays:?}");
        assert!(outputs[max_delay..].iter().all(|&o| o), "delays {delays:?}");
    }
}

#[test]
fn batch_rows_are_generated_independently() {
    let model = ScriptedModel::new(3, 3, vec![0, 1, 0, 1]);
    let mut lm_gen = LmGen::new(&model, GenConfig::greedy()).expect("lm_gen");
    let mut session = lm_gen.streaming(3).expect("streaming");
    assert!(session.step(&no_external(3)).expect("step 0").is_none());
    for step in 1..6 {
        let out = session.step(&no_external(3)).expect("step").expect("output");
        for b in 0..3 {
            let prev = model.generated(step - 1, b);
            let cur = model.generated(step, b);
            let want = [prev[0], cur[1], prev[2], cur[3]];
            assert_eq!(out.tokens.row(b), &want, "row {b} step {step}");
        }
    }
}

#[test]
fn failure_poisons_until_reset() {
    let model = ScriptedModel::new(2, 2, vec![0, 0, 1]);
    model.fail_at.set(Some(2));
    let mut lm_gen = LmGen::new(&model, GenConfig::greedy()).expect("lm_gen");
    lm_gen.open_session(1).expect("open");

    lm_gen.step(&no_external(1)).expect("step 0");
    lm_gen.step(&no_external(1)).expect("step 1");
    assert!(matches!(
        lm_gen.step(&no_external(1)),
        Err(Error::Configuration(_))
    ));
    assert!(matches!(
        lm_gen.step(&no_external(1)),
        Err(Error::SessionState(_))
    ));

    lm_gen.reset_session().expect("reset");
    assert_eq!(lm_gen.offset(), Some(0));
    assert!(lm_gen.step(&no_external(1)).expect("after reset").is_none());
}

#[test]
fn session_lifecycle() {
    let model = ScriptedModel::new(2, 2, vec![0, 0, 0]);
    let mut lm_gen = LmGen::new(&model, GenConfig::greedy()).expect("lm_gen");
    assert!(matches!(
        lm_gen.step(&no_external(1)),
        Err(Error::SessionState(_))
    ));
    {
        let mut session = lm_gen.streaming(1).expect("streaming");
        session.step(&no_external(1)).expect("step");
        assert_eq!(session.offset(), Some(1));
    }
    assert!(!lm_gen.is_active());
    assert!(matches!(
        lm_gen.step(&no_external(1)),
        Err(Error::SessionState(_))
    ));
}

fn random_model() -> LmModel {
    LmModel::random(LmConfig::tiny(4, 2, vec![0, 0, 1, 2, 1]), 1234).expect("model")
}

fn external_for(step: usize) -> [Token; 2] {
    [((step * 5 + 1) % 32) as Token, ((step * 11 + 3) % 32) as Token]
}

fn run_streaming(model: &LmModel, gen_cfg: GenConfig, steps: usize) -> Vec<Option<TokenFrame>> {
    let mut lm_gen = LmGen::new(model, gen_cfg).expect("lm_gen");
    lm_gen.open_session(1).expect("open");
    (0..steps)
        .map(|t| {
            lm_gen
                .step(&TokenFrame::from_row(&external_for(t)))
                .expect("step")
                .map(|out| out.tokens)
        })
        .collect()
}

#[test]
fn sampled_sessions_repeat_for_the_same_seed() {
    let model = random_model();
    let a = run_streaming(&model, GenConfig::default(), 10);
    let b = run_streaming(&model, GenConfig::default(), 10);
    assert_eq!(a, b);

    let mut lm_gen = LmGen::new(&model, GenConfig::default()).expect("lm_gen");
    lm_gen.open_session(1).expect("open");
    let first: Vec<_> = (0..10)
        .map(|t| lm_gen.step(&TokenFrame::from_row(&external_for(t))).expect("step").map(|o| o.tokens))
        .collect();
    lm_gen.reset_session().expect("reset");
    let second: Vec<_> = (0..10)
        .map(|t| lm_gen.step(&TokenFrame::from_row(&external_for(t))).expect("step").map(|o| o.tokens))
        .collect();
    assert_eq!(first, second);
    assert_eq!(first, a);
}

#[test]
fn validation_does_not_change_successful_outputs() {
    let model = random_model();
    for base in [GenConfig::default(), GenConfig::greedy()] {
        let checked = GenConfig {
            check: true,
            ..base.clone()
        };
        let unchecked = GenConfig {
            check: false,
            ..base
        };
        let a = run_streaming(&model, checked, 12);
        let b = run_streaming(&model, unchecked, 12);
        assert_eq!(a.iter().filter(|f| f.is_some()).count(), 12 - model.config().max_delay());
        assert_eq!(a, b);
    }
}

/// Drive the reference mode with inputs re-aligned by hand and compare its
/// samples against the streaming engine's delay-aligned output.
#[test]
fn streaming_matches_reference_once_delays_are_undone() {
    let model = random_model();
    let cfg = model.config().clone();
    let (dep_q, max_delay) = (cfg.dep_q, cfg.max_delay());
    let initial = cfg.initial_tokens();
    let steps = 14;

    let streamed = run_streaming(&model, GenConfig::greedy(), steps);

    let mut oracle = LmNoStream::new(&model, GenConfig::greedy(), 1).expect("oracle");
    let mut generated: Vec<Vec<Token>> = Vec::new();
    for t in 0..steps {
        let slice: Vec<Token> = (0..cfg.num_codebooks())
            .map(|k| {
                let delay = cfg.delays[k];
                if t <= delay {
                    initial[k]
                } else if k <= dep_q {
                    generated[t - 1][k]
                } else {
                    external_for(t - delay)[k - dep_q - 1]
                }
            })
            .collect();
        let out = oracle
            .step(
                &slice[..1],
                &TokenFrame::from_row(&slice[1..=dep_q]),
                &TokenFrame::from_row(&slice[dep_q + 1..]),
                None,
            )
            .expect("reference step");
        let mut row = out.text_tokens.clone();
        row.extend_from_slice(out.audio_tokens.row(0));
        generated.push(row);
    }

    for (t, frame) in streamed.iter().enumerate() {
        if t < max_delay {
            assert!(frame.is_none(), "step {t}");
            continue;
        }
        let frame = frame.as_ref().expect("output after warm-up");
        for k in 0..=dep_q {
            let src = t - max_delay + cfg.delays[k];
            assert_eq!(frame.get(0, k), generated[src][k], "codebook {k} at step {t}");
        }
    }
}
