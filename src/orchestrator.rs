use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::form_automator::TransactionPoster;
use crate::ledger_store::LedgerStore;
use crate::mail_extract::extract_transaction;
use crate::mail_source::MailSource;
use crate::merchant_rules::MerchantRuleBook;
use crate::reconcile::{new_transactions, unposted_rows, watermark};
use crate::transaction::{LedgerRow, Transaction};

// Inter-write delay respecting the row store's rate limit.
const DEFAULT_APPEND_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub appended: usize,
    pub posted: usize,
    pub post_failures: usize,
}

/// Top-level control loop. Owns the failure policy: per-transaction
/// failures never abort the batch, authentication/navigation failures abort
/// the remaining batch, ledger read failures abort the run. Restarting a
/// run is always safe because rows are appended before posting and marked
/// posted one by one.
pub struct SyncOrchestrator<M, L, P> {
    mail: M,
    ledger: L,
    poster: P,
    rules: MerchantRuleBook,
    append_delay: Duration,
}

impl<M, L, P> SyncOrchestrator<M, L, P>
where
    M: MailSource,
    L: LedgerStore,
    P: TransactionPoster,
{
    pub fn new(mail: M, ledger: L, poster: P, rules: MerchantRuleBook) -> Self {
        SyncOrchestrator {
            mail,
            ledger,
            poster,
            rules,
            append_delay: DEFAULT_APPEND_DELAY,
        }
    }

    pub fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = delay;
        self
    }

    pub fn run(&mut self) -> SyncResult<RunSummary> {
        let run_id = Uuid::new_v4();
        let rows = self.ledger.list_rows()?;
        let cutoff = watermark(&rows);
        info!(%run_id, rows = rows.len(), %cutoff, "sync run started");

        let messages = match self.mail.fetch_since(cutoff.date()) {
            Ok(messages) => messages,
            Err(SyncError::SourceUnavailable(reason)) => {
                warn!(%reason, "mail source unavailable, continuing with zero candidates");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        info!(count = messages.len(), "mail candidates fetched");

        let candidates: Vec<Transaction> = messages
            .iter()
            .filter_map(|msg| extract_transaction(&msg.raw, &msg.id))
            .collect();

        let mut appended = 0;
        for tx in new_transactions(candidates, &rows) {
            if tx.amount <= 0 {
                warn!(
                    message_id = %tx.message_id,
                    "candidate without a positive amount, not a real transaction"
                );
                continue;
            }
            self.ledger.append(&tx)?;
            appended += 1;
            info!(
                email_date = %tx.email_date_str(),
                amount = tx.amount,
                store = %tx.store,
                "appended ledger row"
            );
            if let Err(err) = self.mail.mark_seen(&tx.message_id) {
                warn!(message_id = %tx.message_id, %err, "could not mark message seen");
            }
            std::thread::sleep(self.append_delay);
        }

        let rows = self.ledger.list_rows()?;
        let unposted = unposted_rows(&rows);
        if unposted.is_empty() {
            info!(appended, "every ledger row is already posted, no session needed");
            return Ok(RunSummary {
                appended,
                ..RunSummary::default()
            });
        }
        info!(count = unposted.len(), "posting unposted ledger rows");

        if let Err(err) = self.poster.open_session() {
            self.poster.close_session();
            return Err(err);
        }

        let mut summary = RunSummary {
            appended,
            ..RunSummary::default()
        };
        let outcome = self.post_batch(&unposted, &mut summary);
        // The session is released on every exit path, including errors.
        self.poster.close_session();
        outcome?;

        info!(
            appended = summary.appended,
            posted = summary.posted,
            post_failures = summary.post_failures,
            "sync run finished"
        );
        Ok(summary)
    }

    fn post_batch(
        &mut self,
        unposted: &[LedgerRow],
        summary: &mut RunSummary,
    ) -> SyncResult<()> {
        for row in unposted {
            match self.poster.post(row, self.rules.get(&row.store)) {
                // Marked immediately, not batched, so a mid-batch crash
                // leaves the finished rows marked and the rest resumable.
                Ok(()) => match self.ledger.mark_posted(row.sheet_row) {
                    Ok(()) => {
                        summary.posted += 1;
                        // Only successful writes are rate-limited; a failed
                        // row moves straight on to the next one.
                        std::thread::sleep(self.append_delay);
                    }
                    Err(SyncError::StoreConflict { sheet_row, reason }) => {
                        error!(sheet_row, %reason, "posted but could not mark row, not retrying");
                        summary.post_failures += 1;
                    }
                    Err(err) => return Err(err),
                },
                Err(SyncError::TransactionPost(reason)) => {
                    error!(sheet_row = row.sheet_row, %reason, "post failed, row left unposted");
                    summary.post_failures += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
