use chrono::NaiveDateTime;

/// Marker stored in the `mf` column once a row has been replayed into the
/// target service. Any other value (including empty) means "not posted yet".
pub const POSTED_MARKER: &str = "done";

/// Sheet row number of the first data row; row 1 is the header.
pub const FIRST_DATA_ROW: usize = 2;

const SHEET_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One card-usage notification extracted from a mail message.
///
/// `email_date` is the dedup key: unique per message within the source's
/// retention window. `amount == 0` marks a message that carried no usable
/// usage markers and must never be appended or posted.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub email_date: NaiveDateTime,
    pub date_of_use: Option<NaiveDateTime>,
    pub amount: i64,
    pub store: String,
    pub message_id: String,
}

impl Transaction {
    pub fn email_date_str(&self) -> String {
        self.email_date.format(SHEET_DATETIME_FORMAT).to_string()
    }

    pub fn date_of_use_str(&self) -> String {
        self.date_of_use
            .map(|dt| dt.format(SHEET_DATETIME_FORMAT).to_string())
            .unwrap_or_default()
    }
}

/// A durable ledger row. Superset of [`Transaction`] minus the mail handle,
/// plus its 1-based sheet position and the posted flag.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub sheet_row: usize,
    pub email_date: NaiveDateTime,
    pub date_of_use: Option<NaiveDateTime>,
    pub amount: i64,
    pub store: String,
    pub posted: bool,
}

pub fn parse_sheet_datetime(raw: &str) -> Option<NaiveDateTime> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(text, SHEET_DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y/%m/%d %H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .expect("valid date")
            .and_hms_opt(h, mi, s)
            .expect("valid time")
    }

    #[test]
    fn sheet_datetime_round_trips() {
        let tx = Transaction {
            email_date: dt(2023, 6, 28, 22, 46, 19),
            date_of_use: Some(dt(2023, 6, 28, 22, 46, 19)),
            amount: 44308,
            store: "SMOKEBEERFACTORY OTSUKATE".to_string(),
            message_id: "m1".to_string(),
        };
        assert_eq!(tx.email_date_str(), "2023-06-28 22:46:19");
        assert_eq!(
            parse_sheet_datetime(&tx.email_date_str()),
            Some(tx.email_date)
        );
    }

    #[test]
    fn missing_date_of_use_formats_empty() {
        let tx = Transaction {
            email_date: dt(2024, 3, 21, 9, 0, 0),
            date_of_use: None,
            amount: 0,
            store: String::new(),
            message_id: "m2".to_string(),
        };
        assert_eq!(tx.date_of_use_str(), "");
        assert_eq!(parse_sheet_datetime(""), None);
    }

    #[test]
    fn slash_datetime_variant_is_accepted() {
        assert_eq!(
            parse_sheet_datetime("2024/03/21 09:00:00"),
            Some(dt(2024, 3, 21, 9, 0, 0))
        );
    }
}
