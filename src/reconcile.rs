use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime};

use crate::transaction::{LedgerRow, Transaction};

/// Query-window cutoff used when the ledger is empty.
pub fn default_cutoff() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 20)
        .expect("valid default cutoff date")
        .and_hms_opt(0, 0, 0)
        .expect("valid default cutoff time")
}

/// Candidates whose `email_date` is not already present in the ledger,
/// original (oldest-first) order preserved. Timestamp equality is exact.
pub fn new_transactions(candidates: Vec<Transaction>, existing: &[LedgerRow]) -> Vec<Transaction> {
    let seen: HashSet<NaiveDateTime> = existing.iter().map(|row| row.email_date).collect();
    candidates
        .into_iter()
        .filter(|tx| !seen.contains(&tx.email_date))
        .collect()
}

/// Rows not yet replayed into the target service, ledger order preserved.
pub fn unposted_rows(rows: &[LedgerRow]) -> Vec<LedgerRow> {
    rows.iter().filter(|row| !row.posted).cloned().collect()
}

/// The mail-source query cutoff: the last row's `email_date`, or the fixed
/// default for an empty ledger. The ledger is append-ordered by contract;
/// rows are never re-sorted here.
pub fn watermark(rows: &[LedgerRow]) -> NaiveDateTime {
    rows.last().map(|row| row.email_date).unwrap_or_else(default_cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, mo: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .expect("valid date")
            .and_hms_opt(10, 0, 0)
            .expect("valid time")
    }

    fn tx(email_date: NaiveDateTime, amount: i64) -> Transaction {
        Transaction {
            email_date,
            date_of_use: Some(email_date),
            amount,
            store: "CAFE X".to_string(),
            message_id: format!("m-{email_date}"),
        }
    }

    fn row(sheet_row: usize, email_date: NaiveDateTime, posted: bool) -> LedgerRow {
        LedgerRow {
            sheet_row,
            email_date,
            date_of_use: Some(email_date),
            amount: 1500,
            store: "CAFE X".to_string(),
            posted,
        }
    }

    #[test]
    fn dedup_filters_exact_timestamp_matches_only() {
        let existing = vec![row(2, dt(2024, 3, 20), true)];
        let candidates = vec![tx(dt(2024, 3, 20), 1500), tx(dt(2024, 3, 21), 1500)];
        let fresh = new_transactions(candidates, &existing);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].email_date, dt(2024, 3, 21));
    }

    #[test]
    fn dedup_is_idempotent_across_runs() {
        let existing = vec![
            row(2, dt(2024, 3, 20), true),
            row(3, dt(2024, 3, 21), false),
        ];
        let candidates = vec![tx(dt(2024, 3, 20), 1500), tx(dt(2024, 3, 21), 1500)];
        // Same candidate list against a ledger that already holds both.
        assert!(new_transactions(candidates.clone(), &existing).is_empty());
        assert!(new_transactions(candidates, &existing).is_empty());
    }

    #[test]
    fn dedup_preserves_candidate_order() {
        let candidates = vec![
            tx(dt(2024, 3, 21), 100),
            tx(dt(2024, 3, 22), 200),
            tx(dt(2024, 3, 23), 300),
        ];
        let fresh = new_transactions(candidates, &[]);
        let dates: Vec<_> = fresh.iter().map(|t| t.email_date).collect();
        assert_eq!(dates, vec![dt(2024, 3, 21), dt(2024, 3, 22), dt(2024, 3, 23)]);
    }

    #[test]
    fn unposted_rows_keep_ledger_order() {
        let rows = vec![
            row(2, dt(2024, 3, 20), true),
            row(3, dt(2024, 3, 21), false),
            row(4, dt(2024, 3, 22), false),
        ];
        let unposted = unposted_rows(&rows);
        assert_eq!(unposted.len(), 2);
        assert_eq!(unposted[0].sheet_row, 3);
        assert_eq!(unposted[1].sheet_row, 4);
    }

    #[test]
    fn watermark_of_empty_ledger_is_the_default_cutoff() {
        assert_eq!(watermark(&[]), default_cutoff());
    }

    #[test]
    fn watermark_is_the_last_rows_email_date() {
        let rows = vec![
            row(2, dt(2024, 3, 20), true),
            row(3, dt(2024, 3, 25), false),
        ];
        assert_eq!(watermark(&rows), dt(2024, 3, 25));
    }
}
