//! Runs pending SQLx migrations against the database.
//!
//! Migrations are embedded at compile time, so no migration files
//! are needed at runtime.

use anyhow::{Context, Result};

use brandlens_store::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    println!("Running database migrations...");

    let store = PgStore::connect(&database_url, 2).await?;
    store.migrate().await?;

    println!("Migrations completed successfully.");

    Ok(())
}
