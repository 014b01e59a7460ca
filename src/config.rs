use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

const DEFAULT_MAIL_SENDER: &str = "payinfo@121.ana.co.jp";
const DEFAULT_MAIL_SUBJECT: &str = "ご利用のお知らせ";
const DEFAULT_MAILBOX: &str = "INBOX";
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_SIGN_IN_URL: &str = "https://id.moneyforward.com/sign_in";
const DEFAULT_ENTRY_URL: &str = "https://moneyforward.com/cf";
const DEFAULT_FUNDING_PREFIX: &str = "ANA Pay";
const DEFAULT_UI_TIMEOUT_SECS: u64 = 30;

/// Which mail adapter backs the fetch phase.
#[derive(Debug, Clone, PartialEq)]
pub enum MailBackend {
    Imap {
        host: String,
        port: u16,
        user: String,
        password: String,
        mailbox: String,
    },
    EmlDir {
        dir: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub backend: MailBackend,
    pub sender: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub email: String,
    pub password: String,
    pub sign_in_url: String,
    pub entry_url: String,
    pub funding_prefix: String,
    pub ui_timeout: Duration,
    pub strict_login: bool,
    pub screenshot_dir: Option<PathBuf>,
}

/// Whole-process configuration, sourced from environment variables only.
/// There are no CLI flags; a `.env` file stands in for them.
#[derive(Debug, Clone)]
pub struct Config {
    pub mail: MailConfig,
    pub ledger_db: PathBuf,
    pub rules_csv: Option<PathBuf>,
    pub target: TargetConfig,
}

fn required(name: &str) -> SyncResult<String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(SyncError::Config(format!("{name} is not set"))),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn flag(name: &str) -> bool {
    matches!(
        optional(name).as_deref().map(str::to_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

impl Config {
    /// Reads the full configuration, failing fast (before any I/O) when a
    /// required credential is missing.
    pub fn from_env() -> SyncResult<Config> {
        let backend = match optional("MAIL_BACKEND").as_deref() {
            Some("eml_dir") => MailBackend::EmlDir {
                dir: PathBuf::from(required("EML_DIR")?),
            },
            Some("imap") | None => MailBackend::Imap {
                host: required("IMAP_HOST")?,
                port: optional("IMAP_PORT")
                    .map(|v| {
                        v.parse::<u16>()
                            .map_err(|_| SyncError::Config(format!("IMAP_PORT is not a port: {v}")))
                    })
                    .transpose()?
                    .unwrap_or(DEFAULT_IMAP_PORT),
                user: required("IMAP_USER")?,
                password: required("IMAP_PASSWORD")?,
                mailbox: optional("MAILBOX").unwrap_or_else(|| DEFAULT_MAILBOX.to_string()),
            },
            Some(other) => {
                return Err(SyncError::Config(format!(
                    "MAIL_BACKEND must be imap or eml_dir, got {other}"
                )))
            }
        };

        let ui_timeout_secs = optional("UI_TIMEOUT_SECS")
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| SyncError::Config(format!("UI_TIMEOUT_SECS is not a number: {v}")))
            })
            .transpose()?
            .unwrap_or(DEFAULT_UI_TIMEOUT_SECS);

        Ok(Config {
            mail: MailConfig {
                backend,
                sender: optional("MAIL_SENDER").unwrap_or_else(|| DEFAULT_MAIL_SENDER.to_string()),
                subject: optional("MAIL_SUBJECT")
                    .unwrap_or_else(|| DEFAULT_MAIL_SUBJECT.to_string()),
            },
            ledger_db: PathBuf::from(required("LEDGER_DB")?),
            rules_csv: optional("RULES_CSV").map(PathBuf::from),
            target: TargetConfig {
                email: required("EMAIL")?,
                password: required("PASSWORD")?,
                sign_in_url: optional("SIGN_IN_URL")
                    .unwrap_or_else(|| DEFAULT_SIGN_IN_URL.to_string()),
                entry_url: optional("ENTRY_URL").unwrap_or_else(|| DEFAULT_ENTRY_URL.to_string()),
                funding_prefix: optional("FUNDING_SOURCE_PREFIX")
                    .unwrap_or_else(|| DEFAULT_FUNDING_PREFIX.to_string()),
                ui_timeout: Duration::from_secs(ui_timeout_secs),
                strict_login: flag("STRICT_LOGIN"),
                screenshot_dir: optional("SCREENSHOT_DIR").map(PathBuf::from),
            },
        })
    }
}
