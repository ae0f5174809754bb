mod cli;
mod config;
mod error;
mod logging;
mod model;
mod providers;
mod retry;
mod state;
mod sync;
mod translate;
mod util;

use anyhow::Result;

use cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match cli::parse_args(&args)? {
        Command::Help => cli::print_help(),
        Command::Users(users) => cli::handle_users(users).await?,
        Command::Sync(sync) => {
            let code = cli::handle_sync(sync).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}
