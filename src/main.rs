use noteharvest::{load_harvest_config, run_harvest};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn arg_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(session) = arg_value(&args, "--session") else {
        eprintln!("usage: noteharvest --session <id> --keyword <kw> --target <n>");
        std::process::exit(2);
    };
    let Some(keyword) = arg_value(&args, "--keyword") else {
        eprintln!("usage: noteharvest --session <id> --keyword <kw> --target <n>");
        std::process::exit(2);
    };
    let target: usize = match arg_value(&args, "--target").map(|t| t.parse()) {
        Some(Ok(n)) if n > 0 => n,
        _ => {
            eprintln!("--target must be a positive integer");
            std::process::exit(2);
        }
    };

    let cfg = load_harvest_config();
    info!(session = %session, keyword = %keyword, target, "starting harvest");

    let report = run_harvest(&cfg, &session, &keyword, target).await;
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("report serialization failed: {e}"),
    }
    if !report.success {
        std::process::exit(1);
    }
}
