pub mod config_cmd;
pub mod engine;
pub mod generate;
pub mod prompt;
pub mod run;

use std::path::{Path, PathBuf};

use chatglm_core::{Conversation, GenerateOption, GenerationConfig, Turn};
use clap::{Parser, Subcommand};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "chatglm",
    version,
    about = "Chat and text generation powered by chatglm.cpp"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, clap::Args, Clone)]
pub struct GlobalArgs {
    /// Path to a GGML model file (overrides the configured model).
    #[arg(short, long, global = true, env = "CHATGLM_MODEL")]
    pub model: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load a model and start an interactive chat.
    Run(RunArgs),

    /// Generate a single response.
    Generate(GenerateArgs),

    /// Print the rendered prompt for a query without loading a model.
    Prompt(PromptArgs),

    /// View / edit configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone)]
pub struct RunArgs {
    /// Start from the turns in this JSON file.
    #[arg(long)]
    pub history: Option<PathBuf>,

    #[command(flatten)]
    pub generation: GenerationArgs,
}

#[derive(Debug, clap::Args, Clone)]
pub struct GenerateArgs {
    /// The query (or the full prompt with `--raw`).
    pub prompt: String,

    /// Print chunks as they are produced.
    #[arg(long)]
    pub stream: bool,

    /// Send the prompt as-is instead of rendering the round template.
    #[arg(long, conflicts_with = "history")]
    pub raw: bool,

    /// Prior turns (JSON array of `{"question", "answer"}`).
    #[arg(long)]
    pub history: Option<PathBuf>,

    #[command(flatten)]
    pub generation: GenerationArgs,
}

#[derive(Debug, clap::Args, Clone)]
pub struct PromptArgs {
    pub query: String,

    /// Prior turns (JSON array of `{"question", "answer"}`).
    #[arg(long)]
    pub history: Option<PathBuf>,
}

/// Per-call overrides of the configured generation settings.
#[derive(Debug, clap::Args, Clone, Default)]
pub struct GenerationArgs {
    /// Maximum total length in tokens.
    #[arg(long)]
    pub max_length: Option<u32>,

    /// Maximum context length in tokens.
    #[arg(long)]
    pub max_context_length: Option<u32>,

    /// Sample (`true`) or decode greedily (`false`).
    #[arg(long)]
    pub do_sample: Option<bool>,

    /// Top-k (0 = disabled).
    #[arg(long)]
    pub top_k: Option<u32>,

    /// Top-p.
    #[arg(long)]
    pub top_p: Option<f32>,

    /// Temperature.
    #[arg(long)]
    pub temp: Option<f32>,

    /// Repetition penalty.
    #[arg(long)]
    pub repeat_penalty: Option<f32>,

    /// Threads (0 = engine default).
    #[arg(long)]
    pub threads: Option<u32>,
}

impl GenerationArgs {
    pub fn options(&self) -> Vec<GenerateOption> {
        let mut options = Vec::new();
        if let Some(v) = self.max_length {
            options.push(GenerateOption::MaxLength(v));
        }
        if let Some(v) = self.max_context_length {
            options.push(GenerateOption::MaxContextLength(v));
        }
        if let Some(v) = self.do_sample {
            options.push(GenerateOption::DoSample(v));
        }
        if let Some(v) = self.top_k {
            options.push(GenerateOption::TopK(v));
        }
        if let Some(v) = self.top_p {
            options.push(GenerateOption::TopP(v));
        }
        if let Some(v) = self.temp {
            options.push(GenerateOption::Temperature(v));
        }
        if let Some(v) = self.repeat_penalty {
            options.push(GenerateOption::RepetitionPenalty(v));
        }
        if let Some(v) = self.threads {
            options.push(GenerateOption::NumThreads(v));
        }
        options
    }

    /// `base` with the given flags applied on top.
    pub fn resolve(&self, base: &GenerationConfig) -> GenerationConfig {
        let mut config = base.clone();
        for option in self.options() {
            option.apply(&mut config);
        }
        config
    }
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the current configuration.
    Show,
    /// Set a configuration value.
    Set { key: String, value: String },
    /// Print the configuration file location.
    Path,
}

/// Model from the command line, else from the configuration file.
pub fn model_path(global: &GlobalArgs, cfg: &AppConfig) -> anyhow::Result<PathBuf> {
    global
        .model
        .clone()
        .or_else(|| cfg.model.clone())
        .ok_or_else(|| {
            anyhow::anyhow!("No model given; pass --model or run `chatglm config set model <path>`")
        })
}

/// Read prior turns from a JSON file, if one was given.
pub fn load_history(path: Option<&Path>) -> anyhow::Result<Conversation> {
    let Some(path) = path else {
        return Ok(Conversation::new());
    };
    let data = std::fs::read_to_string(path)?;
    let turns: Vec<Turn> = serde_json::from_str(&data)?;
    Ok(Conversation::from_turns(turns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_only_given_fields() {
        let base = GenerationConfig::default().with_top_k(7);
        let args = GenerationArgs {
            do_sample: Some(false),
            temp: Some(0.2),
            ..Default::default()
        };
        let resolved = args.resolve(&base);
        assert!(!resolved.do_sample);
        assert_eq!(resolved.temperature, 0.2);
        assert_eq!(resolved.top_k, 7);
        assert_eq!(resolved.max_length, 2048);
    }

    #[test]
    fn cli_parses_generate_flags() {
        let cli = Cli::try_parse_from([
            "chatglm",
            "--model",
            "m.bin",
            "generate",
            "你好",
            "--stream",
            "--do-sample",
            "false",
            "--max-length",
            "256",
        ])
        .unwrap();
        assert_eq!(cli.global.model, Some(PathBuf::from("m.bin")));
        match cli.command {
            Commands::Generate(args) => {
                assert_eq!(args.prompt, "你好");
                assert!(args.stream);
                assert_eq!(args.generation.max_length, Some(256));
                assert_eq!(
                    args.generation.options(),
                    vec![GenerateOption::MaxLength(256), GenerateOption::DoSample(false)]
                );
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn flag_can_turn_sampling_back_on() {
        let base = GenerationConfig::default().with_do_sample(false);
        let cli = Cli::try_parse_from(["chatglm", "run", "--do-sample", "true"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.generation.resolve(&base).do_sample);

        let cli = Cli::try_parse_from(["chatglm", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(!args.generation.resolve(&base).do_sample);
    }

    #[test]
    fn model_path_prefers_flag() {
        let cfg = AppConfig {
            model: Some(PathBuf::from("cfg.bin")),
            ..Default::default()
        };
        let flag = GlobalArgs {
            model: Some(PathBuf::from("flag.bin")),
        };
        assert_eq!(model_path(&flag, &cfg).unwrap(), PathBuf::from("flag.bin"));
        assert_eq!(
            model_path(&GlobalArgs { model: None }, &cfg).unwrap(),
            PathBuf::from("cfg.bin")
        );
        assert!(model_path(&GlobalArgs { model: None }, &AppConfig::default()).is_err());
    }

    #[test]
    fn history_file_is_loaded_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(
            &path,
            r#"[{"question":"你好","answer":"你好👋"},{"question":"a","answer":"b"}]"#,
        )
        .unwrap();

        let conv = load_history(Some(&path)).unwrap();
        assert_eq!(conv.turns()[0], Turn::new("你好", "你好👋"));
        assert_eq!(conv.len(), 2);
        assert!(load_history(None).unwrap().is_empty());
    }
}
