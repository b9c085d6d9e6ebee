use anyhow::{Context, Result};
use aviator_execution::{MemoryLedger, SqliteLedger};
use aviator_live_round::actor::{Clock, SystemClock};
use aviator_live_round::config::{Config, ValidatedConfig};
use aviator_live_round::gateway::{HttpGateway, PaymentGateway, SandboxGateway};
use aviator_live_round::{api, start, Store};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "aviator-live-round";

#[derive(Parser, Debug)]
#[command(author, version, about = "Live crash round service")]
struct Args {
    /// YAML config file. Every field has a default.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing(level: Level) -> Result<()> {
    let filter = || EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| SERVICE_NAME.to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer(SERVICE_NAME);
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(filter()))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<ValidatedConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            Config::from_yaml(&raw).with_context(|| format!("invalid config {}", path.display()))?
        }
        None => Config::default(),
    };
    config.apply_env().context("invalid environment override")?;
    Ok(config.validate()?)
}

fn build_gateway(config: &ValidatedConfig) -> Result<Arc<dyn PaymentGateway>> {
    match HttpGateway::from_config(&config.gateway).context("failed to build payment gateway")? {
        Some(gateway) => {
            info!(base_url = ?config.gateway.base_url.as_ref().map(|url| url.as_str()), "payment gateway configured");
            Ok(Arc::new(gateway))
        }
        None => {
            warn!("no gateway.base_url set, payments go to the local sandbox");
            Ok(Arc::new(SandboxGateway::new()))
        }
    }
}

async fn run<L: Store>(ledger: Arc<L>, config: ValidatedConfig, gateway: Arc<dyn PaymentGateway>) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (state, actor) = start(ledger, &config, gateway, clock)?;
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(addr = %config.listen, mode = ?config.withdrawal_mode, "live round service listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("axum server error")?;

    actor.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(config.log_level)?;

    let gateway = build_gateway(&config)?;
    match config.database.clone() {
        Some(path) => {
            let ledger = SqliteLedger::open(&path)
                .with_context(|| format!("failed to open ledger {}", path.display()))?
                .with_retry_attempts(config.ledger_retry_attempts);
            info!(path = %path.display(), "sqlite ledger opened");
            run(Arc::new(ledger), config, gateway).await
        }
        None => {
            warn!("no database configured, balances live in memory only");
            run(Arc::new(MemoryLedger::new()), config, gateway).await
        }
    }
}
