use clap::Parser;
use conductor::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    // Logging may not be installed yet when configuration fails
    let code = match cli::execute(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("conductor: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
