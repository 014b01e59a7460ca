pub mod config;
pub mod error;
pub mod form_automator;
pub mod ledger_store;
pub mod mail_extract;
pub mod mail_source;
pub mod merchant_rules;
pub mod orchestrator;
pub mod reconcile;
pub mod snapshot;
pub mod transaction;

pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use form_automator::{FormAutomator, TransactionPoster};
pub use ledger_store::{LedgerStore, SqliteLedger};
pub use mail_source::{open_source, MailSource};
pub use merchant_rules::MerchantRuleBook;
pub use orchestrator::{RunSummary, SyncOrchestrator};
pub use transaction::{LedgerRow, Transaction};
