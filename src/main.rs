// src/main.rs

use qa::{cli, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("qa error: {err:?}");
            std::process::exit(2);
        }
    }
}

/// `Ok(false)` when any test failed or errored.
async fn run_main() -> anyhow::Result<bool> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    let tally = run(args).await?;
    Ok(tally.passed())
}
