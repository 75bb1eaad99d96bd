//! Chatloop CLI - run exported chat graphs from the command line

use anyhow::{bail, Context, Result};
use candle_core::Device;
use chatloop_core::graph::MANIFEST_FILE;
use chatloop_core::{
    load_model, Conversation, GenerateOptions, LoadedModel, ModelAdapter, ModelFamily, ModelRegistry,
    NetworkConfig, SamplingParams,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::{BufRead, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "chatloop")]
#[command(author, version, about = "Chat with exported ChatGLM2, Qwen, Baichuan2 and InternLM graphs", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum FamilyArg {
    Chatglm2,
    Qwen,
    Baichuan2,
    Internlm,
}

impl From<FamilyArg> for ModelFamily {
    fn from(arg: FamilyArg) -> Self {
        match arg {
            FamilyArg::Chatglm2 => ModelFamily::ChatGlm2,
            FamilyArg::Qwen => ModelFamily::Qwen,
            FamilyArg::Baichuan2 => ModelFamily::Baichuan2,
            FamilyArg::Internlm => ModelFamily::InternLm,
        }
    }
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Directory holding graph.json, model.safetensors and tokenizer.json
    #[arg(short = 'm', long, alias = "model_path")]
    model_path: PathBuf,

    /// Model family; detected from the graph or the path when omitted
    #[arg(long, value_enum)]
    family: Option<FamilyArg>,

    /// Device for inference (cpu, cuda[:N], metal)
    #[arg(short = 'd', long, default_value = "cpu")]
    device: String,

    /// Stop once more than this many tokens were generated
    #[arg(short = 'l', long, alias = "max_sequence_length", default_value_t = 128)]
    max_sequence_length: usize,

    /// Keep only the last N prompt tokens
    #[arg(long, alias = "max_input_tokens", default_value_t = 2048)]
    max_input_tokens: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Override the family's top-k
    #[arg(long, alias = "top_k")]
    top_k: Option<usize>,

    /// Override the family's top-p
    #[arg(long, alias = "top_p")]
    top_p: Option<f64>,

    /// Override the family's temperature
    #[arg(long)]
    temperature: Option<f64>,

    /// System prompt
    #[arg(long, default_value = "")]
    system: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single prompt
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(short = 'p', long, default_value = "请介绍一下上海？")]
        prompt: String,

        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
    },

    /// Interactive multi-turn chat on stdin
    Chat {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Write the graph manifest for a family from a HuggingFace config.json
    Export {
        #[arg(long, value_enum)]
        family: FamilyArg,

        /// HuggingFace-style config.json with the network hyperparameters
        #[arg(long)]
        config: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Record f16 weight storage
        #[arg(long = "compress-weight", alias = "compress_weight")]
        compress_weight: bool,
    },
}

fn parse_device(spec: &str) -> Result<Device> {
    let spec = spec.to_lowercase();
    let device = match spec.as_str() {
        "cpu" => Device::Cpu,
        "metal" => Device::new_metal(0)?,
        "cuda" | "gpu" => Device::new_cuda(0)?,
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => Device::new_cuda(ordinal.parse().context("invalid CUDA ordinal")?)?,
            None => bail!("unknown device {spec:?}"),
        },
    };
    Ok(device)
}

impl ModelArgs {
    fn load(&self) -> Result<LoadedModel> {
        if !self.model_path.join(MANIFEST_FILE).exists() {
            bail!("{:?} has no {}", self.model_path, MANIFEST_FILE);
        }
        let device = parse_device(&self.device)?;
        let family = self.family.map(ModelFamily::from);
        Ok(load_model(&self.model_path, family, &device)?)
    }

    fn options(&self, adapter: &ModelAdapter) -> GenerateOptions {
        let defaults = adapter.sampling;
        let sampling = SamplingParams::new(
            self.top_k.unwrap_or(defaults.top_k),
            self.top_p.unwrap_or(defaults.top_p),
            self.temperature.unwrap_or(defaults.temperature),
        );
        GenerateOptions {
            max_generated_tokens: self.max_sequence_length,
            max_input_tokens: self.max_input_tokens,
            sampling: Some(sampling),
            seed: self.seed,
        }
    }
}

/// Prints the part of each streamed update not printed yet.
///
/// Post-processing may rewrite text already on screen (punctuation next to a
/// later CJK character); the whole update is then printed again on a new line.
struct StreamPrinter {
    printed: String,
}

impl StreamPrinter {
    fn new() -> Self {
        Self {
            printed: String::new(),
        }
    }

    /// What to print so the screen shows `text`
    fn delta(&self, text: &str) -> Option<String> {
        if let Some(tail) = text.strip_prefix(self.printed.as_str()) {
            (!tail.is_empty()).then(|| tail.to_string())
        } else if self.printed.starts_with(text) {
            None
        } else {
            Some(format!("\n{text}"))
        }
    }

    fn update(&mut self, text: &str) -> ControlFlow<()> {
        if let Some(out) = self.delta(text) {
            print!("{out}");
            if std::io::stdout().flush().is_err() {
                return ControlFlow::Break(());
            }
            self.printed = text.to_string();
        }
        ControlFlow::Continue(())
    }

    fn finish(&mut self, text: &str) {
        let _ = self.update(text);
        println!();
    }
}

fn run_generate(args: &ModelArgs, prompt: &str, stream: bool) -> Result<()> {
    let mut model = args.load()?;
    let options = args.options(model.adapter());
    let conversation = Conversation::with_system(args.system.clone());
    let prompt = model.build_prompt(&conversation, prompt);
    let tokens = model.encode_prompt(&prompt, options.max_input_tokens)?;

    println!(" --- start generating --- ");
    let start = Instant::now();
    let result = if stream {
        let mut printer = StreamPrinter::new();
        let result = model.generate_streaming(&tokens, &options, |text| printer.update(text))?;
        printer.finish(&result.text);
        result
    } else {
        let result = model.generate(&tokens, &options)?;
        println!("{}", result.text);
        result
    };
    println!(
        "Generated {} tokens in {:.3} s",
        result.iterations,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn run_chat(args: &ModelArgs) -> Result<()> {
    let mut model = args.load()?;
    let options = args.options(model.adapter());
    let mut conversation = Conversation::with_system(args.system.clone());
    info!("Family {}; empty line or /exit quits, /reset clears history", model.adapter().family);

    let stdin = std::io::stdin();
    loop {
        print!("用户: ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let query = line.trim();
        match query {
            "" | "/exit" => break,
            "/reset" => {
                conversation.turns.clear();
                continue;
            }
            _ => {}
        }

        let prompt = model.build_prompt(&conversation, query);
        let tokens = model.encode_prompt(&prompt, options.max_input_tokens)?;
        print!("助手: ");
        let mut printer = StreamPrinter::new();
        let result = model.generate_streaming(&tokens, &options, |text| printer.update(text))?;
        printer.finish(&result.text);
        info!(
            "{} tokens, {:.1} tok/s, {:?}",
            result.generated_tokens, result.tokens_per_second, result.finish_reason
        );
        conversation.push(query, result.text);
    }
    Ok(())
}

fn run_export(family: FamilyArg, config: &Path, output: &Path, compress_weight: bool) -> Result<()> {
    let network = NetworkConfig::from_file(config)
        .with_context(|| format!("failed to read network config {config:?}"))?;
    let adapter = ModelRegistry::new().get(family.into())?;
    let manifest = adapter.export_manifest(network, compress_weight);
    if compress_weight {
        info!("Weights recorded as f16");
    }
    std::fs::create_dir_all(output)?;
    let path = output.join(MANIFEST_FILE);
    manifest.save(&path)?;
    info!(
        "Wrote {:?}: {} inputs, {} outputs",
        path,
        manifest.inputs.len(),
        manifest.outputs.len()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Generate { model, prompt, stream } => run_generate(model, prompt, *stream),
        Commands::Chat { model } => run_chat(model),
        Commands::Export {
            family,
            config,
            output,
            compress_weight,
        } => run_export(*family, config, output, *compress_weight),
    }
}
