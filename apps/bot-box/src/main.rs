use bot_box::cli::Cli;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = bot_box::app::run(cli).await {
        eprintln!("bot-box: {err:#}");
        std::process::exit(1);
    }
}
