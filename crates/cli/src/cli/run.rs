use std::io::{self, BufRead, Write};

use chatglm_core::{Backend, Conversation, EngineHandle, GenerateEvent, GenerationConfig};
use tracing::{info, warn};

use crate::cli::{GlobalArgs, RunArgs, engine, load_history, model_path};
use crate::config::AppConfig;

pub async fn execute(global: GlobalArgs, args: RunArgs) -> anyhow::Result<()> {
    let cfg = AppConfig::load_or_default()?;
    let model = model_path(&global, &cfg)?;
    let config = args.generation.resolve(&cfg.generation);
    config.validate()?;
    let conversation = load_history(args.history.as_deref())?;

    let engine = engine::open()?;
    info!(model = %model.display(), "Loading model for interactive chat…");
    let handle = engine.load(&model)?;

    println!("Model loaded. Type your message (/clear to reset, Ctrl-D to quit).\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    chat_loop(&handle, &config, conversation, stdin.lock(), &mut stdout).await?;

    handle.release();
    Ok(())
}

/// Read queries line by line and stream each answer to `out`.
///
/// Returns the conversation as it stood when input ended.
pub async fn chat_loop<B: Backend>(
    handle: &EngineHandle<B>,
    config: &GenerationConfig,
    mut conversation: Conversation,
    mut input: impl BufRead,
    out: &mut impl Write,
) -> anyhow::Result<Conversation> {
    loop {
        write!(out, "> ")?;
        out.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(out)?;
            break; // EOF
        }
        let query = line.trim();
        match query {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                conversation.clear();
                writeln!(out, "History cleared.\n")?;
                continue;
            }
            _ => {}
        }

        let prompt = conversation.prompt_for(query);
        let mut stream = handle.stream_generate(&prompt, config)?;
        let mut answer = String::new();
        let mut completed = false;

        while let Some(event) = stream.next_event().await {
            match event {
                GenerateEvent::Chunk(piece) => {
                    write!(out, "{piece}")?;
                    out.flush()?;
                    answer.push_str(&piece);
                }
                GenerateEvent::Done {
                    finish_reason,
                    chunks,
                } => {
                    writeln!(out)?;
                    eprintln!("  [{finish_reason} | {chunks} chunks]");
                    completed = true;
                }
                GenerateEvent::Error(e) => {
                    writeln!(out)?;
                    eprintln!("Error: {e}");
                }
            }
        }

        // A failed round leaves no turn behind.
        if completed {
            conversation.record(query, answer);
        } else {
            warn!("Round discarded after a generation error");
        }
        writeln!(out)?;
    }

    Ok(conversation)
}
