//! Daily rollover for agent check-ins, run by an external scheduler shortly
//! after midnight business time.

use loan_crm::assignment_storage::AutoAssigner;
use loan_crm::config::Config;
use loan_crm::db::Database;
use loan_crm::obs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    obs::init_tracing();

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url).await?;

    let today = config.business_today();
    tracing::info!("Connected to database. Closing check-ins before {}...", today);

    let closed = AutoAssigner::new(db.pool.clone())
        .close_previous_days(today)
        .await?;

    tracing::info!("Rollover complete. Deactivated {} check-in(s).", closed);
    Ok(())
}
