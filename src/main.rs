use anyhow::Result;
use clap::Parser;
use pii_redact::config::Settings;
use pii_redact::evaluate::run_evaluation;
use pii_redact::llm::{format_history, ChatModel, LlmClient, ModelSpec};
use pii_redact::optimize::run_optimization;
use pii_redact::redactor::{Configuration, Redactor};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_TEXT: &str = "Call John Smith at 555-123-4567";

#[derive(Parser, Debug)]
#[command(
    name = "pii-redact",
    about = "Redact PII from text with an LLM, and tune or score the prompt",
    version
)]
struct Args {
    /// Text to redact
    #[arg(default_value = DEFAULT_TEXT)]
    text: String,

    /// Print the last LLM exchange
    #[arg(short, long)]
    verbose: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Optimize the instruction prompt against the training window
    #[arg(long, conflicts_with = "evaluate")]
    optimize: bool,

    /// Score the redactor on the held-out evaluation window
    #[arg(long)]
    evaluate: bool,

    /// Sample evaluation rows at random (EVALUATE_SEED for reproducibility)
    #[arg(long, requires = "evaluate")]
    randomize: bool,
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

async fn redact(settings: &Settings, text: &str, verbose: bool) -> Result<()> {
    let client = Arc::new(
        LlmClient::new(settings.require_api_key()?, ModelSpec::new(&settings.model))
            .with_endpoint(&settings.endpoint),
    );
    info!("Using model: {}", settings.model);

    let configuration = Configuration::resolve(&settings.optimized_config_path)?;
    debug!(configuration = configuration.kind(), "Loaded redactor configuration");
    let redactor = Redactor::new(client.clone(), configuration.redactor_config());

    debug!("Input: {}", text);
    let prediction = redactor.redact(text).await?;
    debug!("Entities: {:?}", prediction.entities);
    debug!("Redacted: {}", prediction.redacted_text);
    debug!("Cost: ${:.6}", client.total_cost());

    println!("{}", prediction.redacted_text);

    if verbose {
        println!("\n--- LLM History ---");
        print!("{}", format_history(&client.last_calls(1)));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);
    let settings = Settings::from_env();

    if args.optimize {
        let report = run_optimization(&settings).await?;
        let outcome = &report.outcome;
        println!(
            "Validation score: {:.2}% (baseline {:.2}%), {} of {} rounds accepted",
            outcome.val_score * 100.0,
            outcome.baseline_score * 100.0,
            outcome.accepted,
            outcome.rounds
        );
        println!("Saved to {}", report.saved_to.display());
        match report.reflection_cost {
            Some(reflection) => println!(
                "Cost: ${:.4} (student ${:.4}, reflection ${:.4})",
                report.total_cost(),
                report.student_cost,
                reflection
            ),
            None => println!("Cost: ${:.4}", report.total_cost()),
        }
        return Ok(());
    }

    if args.evaluate {
        let report = run_evaluation(&settings, args.randomize).await?;
        println!(
            "Score: {:.2}% over {} examples ({} failed)",
            report.score, report.examples, report.failed
        );
        println!("Cost: ${:.4}", report.cost);
        if let Some(path) = &report.log_path {
            println!("Log: {}", path.display());
        }
        return Ok(());
    }

    redact(&settings, &args.text, args.verbose).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_default_text() {
        let args = Args::try_parse_from(["pii-redact"]).unwrap();
        assert_eq!(args.text, DEFAULT_TEXT);
        assert!(!args.optimize && !args.evaluate);
    }

    #[test]
    fn test_randomize_requires_evaluate() {
        assert!(Args::try_parse_from(["pii-redact", "--randomize"]).is_err());
        let args = Args::try_parse_from(["pii-redact", "--evaluate", "--randomize"]).unwrap();
        assert!(args.randomize);
    }

    #[test]
    fn test_optimize_conflicts_with_evaluate() {
        assert!(Args::try_parse_from(["pii-redact", "--optimize", "--evaluate"]).is_err());
    }
}
