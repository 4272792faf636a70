use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use multistream::model::ModelBundle;
use multistream::{GenConfig, LanguageModel, LmConfig, LmGen, LmModel, Token, TokenFrame, ZERO_TOKEN};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "multistream")]
#[command(about = "Streaming multi-codebook token generation", long_about = None)]
struct Args {
    /// Model directory with config.json / model.safetensors.
    #[arg(long, conflicts_with = "config")]
    model_dir: Option<PathBuf>,

    /// Model config.json, used with --random-init instead of real weights.
    #[arg(long, requires = "random_init")]
    config: Option<PathBuf>,

    /// Initialise weights randomly from this seed (needs --config).
    #[arg(long)]
    random_init: Option<u64>,

    /// Validate config and weights without generating.
    #[arg(long, default_value_t = false)]
    inspect_model: bool,

    /// External tokens, one line per step: batch * n_external integers.
    #[arg(long, conflicts_with = "stdin")]
    input: Option<PathBuf>,

    /// Read external tokens from stdin, same format as --input.
    #[arg(long, default_value_t = false)]
    stdin: bool,

    /// Maximum number of steps. Without an input source, feeds zero tokens.
    #[arg(long)]
    steps: Option<usize>,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Sampling seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Arg-max decoding instead of sampling.
    #[arg(long, default_value_t = false)]
    greedy: bool,

    #[arg(long)]
    temp: Option<f32>,

    #[arg(long)]
    temp_text: Option<f32>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_k_text: Option<usize>,

    /// Check every model input for sentinels and out-of-range tokens.
    #[arg(long, default_value_t = false)]
    check: bool,
}

#[derive(Debug, Serialize)]
struct FrameLine<'a> {
    step: usize,
    tokens: Vec<&'a [Token]>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multistream=info,multistream_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.inspect_model {
        let model_dir = args
            .model_dir
            .as_ref()
            .context("--inspect-model requires --model-dir")?;
        return inspect_model(model_dir);
    }

    let model = load_model(&args)?;
    let gen_cfg = gen_config(&args);
    run(&args, &model, gen_cfg)
}

fn inspect_model(model_dir: &Path) -> Result<()> {
    let bundle = ModelBundle::load_from_dir(model_dir).context("load model bundle")?;
    let cfg = &bundle.config;
    eprintln!(
        "model ok: n_q={} dep_q={} card={} text_card={} dim={} layers={} depformer_dim={} max_delay={}",
        cfg.n_q,
        cfg.dep_q,
        cfg.card,
        cfg.text_card,
        cfg.dim,
        cfg.num_layers,
        cfg.depformer_dim,
        cfg.max_delay()
    );
    let missing = bundle.missing_tensors();
    eprintln!(
        "weights: tensor_count={} missing={}",
        bundle.weights.len(),
        missing.len()
    );
    for name in &missing {
        eprintln!("  missing {name}");
    }
    if !missing.is_empty() {
        anyhow::bail!("{} expected tensors are missing", missing.len());
    }
    Ok(())
}

fn load_model(args: &Args) -> Result<LmModel> {
    if let Some(dir) = &args.model_dir {
        let bundle = ModelBundle::load_from_dir(dir)?;
        return bundle.build_model();
    }
    match (&args.config, args.random_init) {
        (Some(path), Some(seed)) => {
            let cfg = LmConfig::from_path(path).with_context(|| format!("load config {path:?}"))?;
            info!(seed, "initialising random weights");
            Ok(LmModel::random(cfg, seed)?)
        }
        _ => anyhow::bail!("choose a model: --model-dir, or --config with --random-init"),
    }
}

fn gen_config(args: &Args) -> GenConfig {
    let mut cfg = GenConfig {
        use_sampling: !args.greedy,
        check: args.check,
        ..GenConfig::default()
    };
    if let Some(seed) = args.seed {
        cfg.seed = seed;
    }
    if let Some(temp) = args.temp {
        cfg.temp = temp;
    }
    if let Some(temp) = args.temp_text {
        cfg.temp_text = temp;
    }
    if let Some(k) = args.top_k {
        cfg.top_k = k;
    }
    if let Some(k) = args.top_k_text {
        cfg.top_k_text = k;
    }
    cfg
}

/// Parse one input line into a `[batch, n_ext]` frame.
fn parse_frame(line: &str, batch: usize, n_ext: usize) -> Result<TokenFrame> {
    let values = line
        .split_whitespace()
        .map(|v| v.parse::<Token>().with_context(|| format!("bad token {v:?}")))
        .collect::<Result<Vec<_>>>()?;
    Ok(TokenFrame::new(batch, n_ext, values)?)
}

fn run(args: &Args, model: &LmModel, gen_cfg: GenConfig) -> Result<()> {
    let cfg = model.config();
    let batch = args.batch_size;
    let n_ext = cfg.num_external_codebooks();

    let mut lines: Option<Box<dyn Iterator<Item = std::io::Result<String>>>> =
        match (&args.input, args.stdin) {
            (Some(path), _) => {
                let file =
                    std::fs::File::open(path).with_context(|| format!("open input {path:?}"))?;
                Some(Box::new(BufReader::new(file).lines()))
            }
            (None, true) => Some(Box::new(std::io::stdin().lock().lines())),
            (None, false) => None,
        };
    if lines.is_none() && args.steps.is_none() {
        anyhow::bail!("without --input or --stdin, --steps is required");
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .context("install ctrl-c handler")?;
    }

    let mut lm_gen = LmGen::new(model, gen_cfg)?;
    let mut session = lm_gen.streaming(batch)?;
    info!(
        batch,
        n_ext,
        max_delay = cfg.max_delay(),
        "generation started"
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut step = 0usize;
    let mut emitted = 0usize;
    while running.load(Ordering::SeqCst) && args.steps.is_none_or(|n| step < n) {
        let input = match lines.as_mut() {
            Some(lines) => match lines.next() {
                Some(line) => {
                    let line = line.context("read input line")?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    parse_frame(&line, batch, n_ext)
                        .with_context(|| format!("input line for step {step}"))?
                }
                None => break,
            },
            None => TokenFrame::filled(batch, n_ext, ZERO_TOKEN),
        };

        if let Some(frame) = session.step(&input)? {
            let line = FrameLine {
                step,
                tokens: (0..frame.tokens.batch()).map(|b| frame.tokens.row(b)).collect(),
            };
            serde_json::to_writer(&mut out, &line)?;
            out.write_all(b"\n")?;
            emitted += 1;
        }
        step += 1;
    }
    out.flush()?;

    if !running.load(Ordering::SeqCst) {
        warn!(step, "interrupted");
    }
    info!(steps = step, frames = emitted, "generation finished");
    Ok(())
}
