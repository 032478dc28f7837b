use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use agent_console::config::ConsoleConfig;
use agent_console::queue::QueueScheduler;
use agent_console::session::{ActiveSessions, CliEngine};
use agent_console::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; AGENT_CONSOLE_LOG_DIR switches output to a daily
    // rolling file. The guard must outlive main or buffered lines are lost.
    let _log_guard = match std::env::var("AGENT_CONSOLE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-console.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_target(false)
                .init();
            None
        }
    };

    let config = ConsoleConfig::from_env();

    eprintln!("🖥  Agent Console v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Engine: {}", config.engine.binary);
    eprintln!("   Projects: {}", config.engine.projects_root.display());
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Scheduler: every {}s, batch {}, {} retries\n",
        config.scheduler.poll_interval.as_secs(),
        config.scheduler.batch_size,
        config.scheduler.max_retries,
    );

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    let engine = Arc::new(CliEngine::new(config.engine.clone(), Arc::clone(&db)));
    let sessions = ActiveSessions::new(engine, Arc::clone(&db));

    let scheduler = QueueScheduler::new(
        config.scheduler.clone(),
        Arc::clone(&db),
        Arc::clone(&sessions),
    );
    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    eprintln!("Shutting down…");
    scheduler.stop();

    Ok(())
}
