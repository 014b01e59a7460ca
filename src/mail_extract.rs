use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime};
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use regex::Regex;
use scraper::Html;
use tracing::warn;

use crate::transaction::{parse_sheet_datetime, Transaction};

// Notification body layout:
//   ご利用日時：2023-06-28 22:46:19
//   ご利用金額：44,308円
//   ご利用店舗：SMOKEBEERFACTORY OTSUKATE
const USAGE_LINE_PREFIX: &str = "ご利用";
const FIELD_DELIMITER: char = '：';
const TIME_FIELD: &str = "ご利用日時";
const AMOUNT_FIELD: &str = "ご利用金額";
const STORE_FIELD: &str = "ご利用店舗";
const CURRENCY_SUFFIX: char = '円';

fn tz_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Trailing timezone-name comment in the Date header, e.g. " (JST)".
    RE.get_or_init(|| Regex::new(r"\s*\([A-Za-z ]+\)\s*$").expect("invalid tz comment regex"))
}

/// Parses the amount field value: thousands separators and the currency
/// suffix are stripped before integer conversion. `"44,308円"` -> `44308`.
pub fn parse_amount(raw: &str) -> Option<i64> {
    let cleaned = raw
        .trim()
        .trim_end_matches(CURRENCY_SUFFIX)
        .replace(',', "");
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse::<i64>().ok()
}

/// Parses a `Date` header value, stripping any trailing parenthesized
/// timezone-name comment first, keeping local wall-clock time.
pub fn parse_email_date(header_value: &str) -> Option<NaiveDateTime> {
    let stripped = tz_comment_re().replace(header_value.trim(), "");
    DateTime::parse_from_rfc2822(stripped.as_ref())
        .map(|dt| dt.naive_local())
        .ok()
}

/// Prefers the `text/plain` part; falls back to `text/html` flattened to
/// text. Returns `None` when the message carries neither.
fn extract_best_body(mail: &ParsedMail) -> Option<String> {
    fn walk(mail: &ParsedMail, mime: &str) -> Option<String> {
        if mail.ctype.mimetype.eq_ignore_ascii_case(mime) {
            if let Ok(body) = mail.get_body() {
                return Some(body);
            }
        }
        mail.subparts.iter().find_map(|part| walk(part, mime))
    }

    walk(mail, "text/plain").or_else(|| walk(mail, "text/html").map(|html| flatten_html(&html)))
}

fn flatten_html(html: &str) -> String {
    let doc = Html::parse_document(html);
    doc.root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extracts a transaction candidate from one raw message.
///
/// Returns `None` only when the `Date` header is missing or unparsable (no
/// dedup key). A body without the recognized usage markers still yields a
/// transaction with zero/empty defaults; callers must treat `amount == 0`
/// as "not a real transaction".
pub fn extract_transaction(raw: &[u8], message_id: &str) -> Option<Transaction> {
    let mail = match parse_mail(raw) {
        Ok(mail) => mail,
        Err(err) => {
            warn!(message_id, %err, "failed to parse mail message");
            return None;
        }
    };

    let email_date = mail
        .headers
        .get_first_value("Date")
        .and_then(|v| parse_email_date(&v))?;

    let mut tx = Transaction {
        email_date,
        date_of_use: None,
        amount: 0,
        store: String::new(),
        message_id: message_id.to_string(),
    };

    let body = extract_best_body(&mail).unwrap_or_default();
    for line in body.lines() {
        let line = line.trim();
        if !line.starts_with(USAGE_LINE_PREFIX) {
            continue;
        }
        let Some((key, value)) = line.split_once(FIELD_DELIMITER) else {
            continue;
        };
        match key {
            TIME_FIELD => tx.date_of_use = parse_sheet_datetime(value),
            AMOUNT_FIELD => match parse_amount(value) {
                Some(amount) => tx.amount = amount,
                None => warn!(message_id, value, "unparsable usage amount"),
            },
            STORE_FIELD => tx.store = value.trim().to_string(),
            _ => {}
        }
    }

    Some(tx)
}
