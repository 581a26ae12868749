use clap::Parser;
use deploy_hook::commands::{ServeArgs, ServeCommand};

/// Run the deploy command whenever a source-control webhook is received.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    serve: ServeArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    ServeCommand::execute(cli.serve).await
}
