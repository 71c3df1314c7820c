use std::io::{self, Write};

use chatglm_core::{Backend, EngineHandle, GenerateEvent, GenerationConfig};
use tracing::{debug, info};

use crate::cli::{GenerateArgs, GlobalArgs, engine, load_history, model_path};
use crate::config::AppConfig;

pub async fn execute(global: GlobalArgs, args: GenerateArgs) -> anyhow::Result<()> {
    let cfg = AppConfig::load_or_default()?;
    let model = model_path(&global, &cfg)?;
    let config = args.generation.resolve(&cfg.generation);
    config.validate()?;
    let prompt = render(&args)?;

    let engine = engine::open()?;
    info!(model = %model.display(), "Loading model…");
    let handle = engine.load(&model)?;

    let mut stdout = io::stdout();
    if args.stream {
        stream_to(&handle, &prompt, &config, &mut stdout).await?;
    } else {
        let text = tokio::task::block_in_place(|| handle.generate(&prompt, &config))?;
        writeln!(stdout, "{text}")?;
    }

    handle.release();
    Ok(())
}

/// The prompt sent to the engine for these arguments.
fn render(args: &GenerateArgs) -> anyhow::Result<String> {
    if args.raw {
        return Ok(args.prompt.clone());
    }
    let conversation = load_history(args.history.as_deref())?;
    Ok(conversation.prompt_for(&args.prompt))
}

/// Print chunks as they arrive; returns the full text.
async fn stream_to<B: Backend>(
    handle: &EngineHandle<B>,
    prompt: &str,
    config: &GenerationConfig,
    out: &mut impl Write,
) -> anyhow::Result<String> {
    let mut stream = handle.stream_generate(prompt, config)?;
    let mut text = String::new();

    while let Some(event) = stream.next_event().await {
        match event {
            GenerateEvent::Chunk(piece) => {
                write!(out, "{piece}")?;
                out.flush()?;
                text.push_str(&piece);
            }
            GenerateEvent::Done {
                finish_reason,
                chunks,
            } => {
                writeln!(out)?;
                debug!(%finish_reason, chunks, "Generation finished");
            }
            GenerateEvent::Error(e) => {
                writeln!(out)?;
                anyhow::bail!("Generation failed: {e}");
            }
        }
    }
    Ok(text)
}
