mod cli;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //  Logging (stderr keeps stdout for generated text)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,chatglm=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();

    match args.command {
        cli::Commands::Run(run_args) => cli::run::execute(args.global, run_args).await,
        cli::Commands::Generate(gen_args) => cli::generate::execute(args.global, gen_args).await,
        cli::Commands::Prompt(prompt_args) => cli::prompt::execute(prompt_args).await,
        cli::Commands::Config(c) => cli::config_cmd::execute(c).await,
    }
}
