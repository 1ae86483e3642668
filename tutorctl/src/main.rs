use clap::{CommandFactory, Parser};
use std::sync::Arc;
use tracing::info;
use tutorctl::{
    Config, Scheduler,
    clock::SystemClock,
    config::{Args, Command},
    store::PgStore,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;
    tracing::debug!("{:?}", args);

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let store = PgStore::connect(&config).await?;
    let scheduler = Scheduler::new(store.clone(), Arc::new(SystemClock), config.scheduling.clone());

    match command {
        Command::Migrate => {
            // Already applied on connect unless disabled
            if !config.run_migrations {
                tutorctl::migrator().run(store.pool()).await?;
            }
            info!("Database schema is up to date");
        }
        Command::ApplyTemplate {
            actor,
            template,
            week,
            dry_run,
        } => {
            let result = scheduler.templates().apply_template_to_week(actor, template, week, dry_run).await?;
            if dry_run {
                println!("Dry run, nothing was written.");
            } else {
                println!("Applied as {}", result.application.id);
            }
            println!("{}", serde_json::to_string_pretty(&result.stats)?);
        }
        Command::Rollback { actor, template, week } => {
            let result = scheduler.rollback().rollback_week_to_template(actor, week, template).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Balance { user } => {
            let user = scheduler.get_user(user).await?;
            let balance = scheduler.ledger().get_balance(user.id).await?;
            println!("{} ({}): {} credits", user.name, user.role, balance);
            for entry in scheduler.ledger().list_transactions(user.id, 0, 10).await? {
                println!(
                    "  {} {:?} {} -> {} ({})",
                    entry.created_at, entry.operation, entry.amount, entry.balance_after, entry.reason
                );
            }
        }
    }

    store.pool().close().await;
    Ok(())
}
