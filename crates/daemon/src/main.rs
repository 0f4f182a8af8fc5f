use clap::Parser;
use owo_colors::OwoColorize;

mod cli;

use cli::{Cli, Op, OpContext};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    };
    vessel_daemon::logging::init(&config.log_level);

    let ctx = OpContext::new(config);
    match cli.command.execute(&ctx).await {
        Ok(output) => {
            let output = output.to_string();
            if !output.is_empty() {
                println!("{output}");
            }
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    }
}
