use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use paysync::{
    open_source, Config, FormAutomator, MerchantRuleBook, SqliteLedger, SyncOrchestrator,
    SyncResult,
};

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The exit code stays 0 on failures; the logs are the report. A cron
    // wrapper should not treat a transient mailbox or UI hiccup as fatal.
    if let Err(err) = run() {
        error!(%err, "sync run failed");
    }
}

fn run() -> SyncResult<()> {
    let config = Config::from_env()?;

    let rules = match &config.rules_csv {
        Some(path) => MerchantRuleBook::load(path),
        None => MerchantRuleBook::default(),
    };
    let ledger = SqliteLedger::open(&config.ledger_db)?;
    let mail = open_source(&config.mail);
    let poster = FormAutomator::new(config.target.clone());

    let summary = SyncOrchestrator::new(mail, ledger, poster, rules).run()?;
    info!(
        appended = summary.appended,
        posted = summary.posted,
        post_failures = summary.post_failures,
        "run complete"
    );
    Ok(())
}
