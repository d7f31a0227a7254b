use factor_hedge_orchestrator::{
    agent::HedgeOrchestrator, catalog::KalshiCatalog, config::EngineConfig, gemini::GeminiClient,
    models::Subject, HedgeError,
};
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Holding from `HEDGE_TICKER`, `HEDGE_MARKET_VALUE` and optional extras.
fn subject_from_env() -> Result<Subject, HedgeError> {
    let ticker = env::var("HEDGE_TICKER")
        .map_err(|_| HedgeError::ConfigError("HEDGE_TICKER not set".to_string()))?;

    let number = |key: &str| -> Result<Option<f64>, HedgeError> {
        match env::var(key) {
            Ok(raw) => raw
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| HedgeError::ConfigError(format!("{} is not a number: {}", key, raw))),
            Err(_) => Ok(None),
        }
    };

    let market_value = number("HEDGE_MARKET_VALUE")?.ok_or_else(|| {
        HedgeError::ConfigError("HEDGE_MARKET_VALUE not set".to_string())
    })?;

    let mut subject = Subject::new(ticker, market_value);
    subject.name = env::var("HEDGE_NAME").ok();
    subject.asset_type = env::var("HEDGE_ASSET_TYPE").ok();
    subject.quantity = number("HEDGE_QUANTITY")?;
    subject.cost_basis = number("HEDGE_COST_BASIS")?;
    subject.current_price = number("HEDGE_CURRENT_PRICE")?;

    Ok(subject)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Factor Hedge Orchestrator starting");

    let config = EngineConfig::from_env()?;
    let subject = subject_from_env()?;

    // Create components
    let knowledge = Arc::new(GeminiClient::from_env()?);
    let catalog = Arc::new(KalshiCatalog::from_env()?);

    let orchestrator = HedgeOrchestrator::new(knowledge, catalog, config);

    info!(ticker = %subject.ticker, "Running orchestrator");

    match orchestrator.run(subject).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Hedge run failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
