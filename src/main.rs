//! Admission Gate
//!
//! HTTP gateway that rate-limits requests per client and route.
//!
//! Usage:
//!   admission-gate [OPTIONS]
//!
//! Options:
//!   --port <PORT>              API port (default: 8080)
//!   --sweep-interval <MS>      Expired-window sweep period (default: 60000)
//!   --key-strategy <S>         ip | ip-route | subject (default: ip-route);
//!                              this binary has no auth layer, so `subject`
//!                              keys like ip-route
//!   --no-trust-forwarded       Ignore client-supplied forwarding headers
//!   --policy <RULE>            PREFIX=MAX/WINDOW_MS[:NAME], repeatable

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use admission_gate::{
    admission::AdmissionController,
    api::{self, events::AdmissionEvent, AppState},
    clock::current_time_ms,
    config::GatewayConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = GatewayConfig::from_env_args().context("invalid command line")?;
    let policies = config
        .build_policy_table()
        .context("invalid rate-limit policy")?;

    info!("Starting Admission Gate...");
    info!("  API Port: {}", config.api_port);
    info!("  Key Strategy: {:?}", config.key_strategy);
    info!("  Trust Forwarded Headers: {}", config.trust_forwarded);
    info!("  Sweep Interval: {}ms", config.sweep_interval_ms);
    let default = policies.default_rule();
    info!(
        "  Default Policy ({}): {} per {}ms",
        default.name,
        default.policy.max_requests(),
        default.policy.window_length_ms()
    );
    for rule in policies.rules() {
        info!(
            "  Policy {} ({}): {} per {}ms",
            rule.prefix,
            rule.name,
            rule.policy.max_requests(),
            rule.policy.window_length_ms()
        );
    }

    let policy_count = policies.rules().len() + 1;
    let controller = AdmissionController::new(policies, config.key_extractor());
    let state = AppState::new(controller);

    state
        .events
        .push(AdmissionEvent::GateStarted {
            timestamp: current_time_ms(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            policies: policy_count,
        })
        .await;

    let sweeper = api::spawn_sweeper(&state, config.sweep_interval());

    let addr = format!("0.0.0.0:{}", config.api_port);
    let served = api::start_server(state, &addr, shutdown_signal()).await;

    sweeper.stop().await;
    info!("Admission Gate stopped");

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
