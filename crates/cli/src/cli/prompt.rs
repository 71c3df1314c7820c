use crate::cli::{PromptArgs, load_history};

pub async fn execute(args: PromptArgs) -> anyhow::Result<()> {
    let conversation = load_history(args.history.as_deref())?;
    print!("{}", conversation.prompt_for(&args.query));
    Ok(())
}
