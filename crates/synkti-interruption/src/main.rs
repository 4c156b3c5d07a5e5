//! Synkti interruption controller binary
//!
//! Commands:
//! - `run`: watch the interruption queue and remediate nodes
//! - `infra create|delete`: manage the queue and EventBridge rules
//! - `classify`: decode a notification body offline

use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use synkti_interruption::{
    Classification, ControllerArgs, ControllerSettings, EventBridgeRules, InfrastructureNames,
    InfrastructureReconciler, InterruptionController, KubeEventPublisher, KubeNodeClient, SqsQueue,
    classify, system_clock,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Synkti interruption controller
#[derive(Parser)]
#[command(name = "synkti-interruption")]
#[command(about = "Turns EC2 disruption notices into Kubernetes node actions", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "SYNKTI_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until SIGINT/SIGTERM
    Run {
        #[command(flatten)]
        args: ControllerArgs,
    },

    /// Interruption infrastructure management (queue and rules)
    Infra {
        #[command(flatten)]
        args: ControllerArgs,

        #[command(subcommand)]
        action: InfraAction,
    },

    /// Classify a notification body (reads stdin when no file is given)
    Classify {
        /// File holding one message body
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum InfraAction {
    /// Create or repair the queue and rules
    Create,

    /// Delete the rules and the queue
    Delete,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "synkti_interruption=info,info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    match cli.command {
        Commands::Run { args } => run_controller(args.into_settings()?).await,
        Commands::Infra { args, action } => handle_infra(args.into_settings()?, action).await,
        Commands::Classify { file } => classify_body(file),
    }
}

async fn load_aws_config(region: Option<String>) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_types::region::Region::new(region));
    }
    loader.load().await
}

async fn run_controller(settings: ControllerSettings) -> anyhow::Result<()> {
    let names = InfrastructureNames::from_settings(&settings);

    info!("========================================");
    info!("🚀 Synkti interruption controller starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("📦 Cluster: {}", settings.cluster_name);
    info!("📬 Queue: {}", names.queue);
    info!("========================================");

    let aws = load_aws_config(settings.region.clone()).await;
    let queue = Arc::new(SqsQueue::from_config(&aws, names.queue));
    let rules = Arc::new(EventBridgeRules::from_config(&aws));

    let client = kube::Client::try_default().await?;
    let nodes = Arc::new(KubeNodeClient::new(client.clone()));
    let events = Arc::new(KubeEventPublisher::new(client));

    let controller = InterruptionController::new(settings, queue, rules, nodes, events, system_clock());

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            info!("🛑 Shutting down...");
            token.cancel();
        }
    });

    controller.run(token).await?;
    info!("✅ Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("⚠️  Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("⚠️  Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn handle_infra(settings: ControllerSettings, action: InfraAction) -> anyhow::Result<()> {
    let names = InfrastructureNames::from_settings(&settings);
    let aws = load_aws_config(settings.region.clone()).await;
    let queue = Arc::new(SqsQueue::from_config(&aws, names.queue));
    let rules = Arc::new(EventBridgeRules::from_config(&aws));
    let reconciler = InfrastructureReconciler::new(queue, rules, &settings);

    match action {
        InfraAction::Create => {
            let status = reconciler.create_infrastructure().await?;
            info!("✅ Queue: {}", status.queue.url);
            info!("   ARN: {}", status.queue.arn);
            for rule in &status.rules {
                info!("   Rule: {}", rule);
            }
            if !status.updated_attributes.is_empty() {
                info!("   Updated attributes: {}", status.updated_attributes.join(", "));
            }
        }
        InfraAction::Delete => {
            reconciler.delete_infrastructure().await?;
            info!("✅ Interruption infrastructure deleted for cluster {}", settings.cluster_name);
        }
    }
    Ok(())
}

fn classify_body(file: Option<PathBuf>) -> anyhow::Result<()> {
    let body = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut body = String::new();
            std::io::stdin().read_to_string(&mut body)?;
            body
        }
    };

    match classify(&body) {
        Classification::Events(events) => {
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Classification::Ignored(reason) => println!("ignored: {reason}"),
        Classification::Invalid(reason) => {
            anyhow::bail!("invalid message: {reason}");
        }
    }
    Ok(())
}
