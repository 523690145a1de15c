use ast_orders_api::db::{establish_connection_with_config, DbConfig};
use ast_orders_api::migrator::Migrator;
use clap::{Parser, Subcommand};
use sea_orm_migration::prelude::*;
use tracing::info;

#[derive(Parser)]
#[command(name = "migration", about = "Apply or inspect the order store schema", version)]
struct Cli {
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "sqlite://ast_orders.db?mode=rwc",
        help = "Database connection URL"
    )]
    database_url: String,

    #[command(subcommand)]
    command: Option<MigrationCommand>,
}

#[derive(Subcommand)]
enum MigrationCommand {
    /// Apply pending migrations (default)
    Up,
    /// Roll back the most recent migrations
    Down {
        #[arg(long, default_value_t = 1, help = "Number of migrations to roll back")]
        steps: u32,
    },
    /// Print applied and pending migrations
    Status,
    /// Drop every table and re-apply all migrations
    Fresh,
}

#[tokio::main]
async fn main() -> Result<(), DbErr> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    let db_cfg = DbConfig {
        url: cli.database_url,
        max_connections: 2,
        min_connections: 1,
        ..Default::default()
    };
    let db = establish_connection_with_config(&db_cfg).await?;

    match cli.command.unwrap_or(MigrationCommand::Up) {
        MigrationCommand::Up => {
            Migrator::up(&db, None).await?;
            info!("Migrations applied");
        }
        MigrationCommand::Down { steps } => {
            Migrator::down(&db, Some(steps)).await?;
            info!(steps, "Migrations rolled back");
        }
        MigrationCommand::Status => Migrator::status(&db).await?,
        MigrationCommand::Fresh => {
            Migrator::fresh(&db).await?;
            info!("Schema recreated");
        }
    }

    Ok(())
}
