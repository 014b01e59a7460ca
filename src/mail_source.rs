use std::net::TcpStream;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use mailparse::{parse_mail, MailHeaderMap};
use native_tls::TlsStream;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{MailBackend, MailConfig};
use crate::error::{SyncError, SyncResult};
use crate::mail_extract::parse_email_date;

/// One raw message plus the opaque handle used to mark it seen.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: String,
    pub raw: Vec<u8>,
}

/// A mailbox of card-usage notifications. Implementations apply the fixed
/// sender + subject allow-list and return messages oldest → newest.
pub trait MailSource {
    fn fetch_since(&mut self, cutoff: NaiveDate) -> SyncResult<Vec<RawMessage>>;
    fn mark_seen(&mut self, id: &str) -> SyncResult<()>;
}

impl MailSource for Box<dyn MailSource> {
    fn fetch_since(&mut self, cutoff: NaiveDate) -> SyncResult<Vec<RawMessage>> {
        (**self).fetch_since(cutoff)
    }

    fn mark_seen(&mut self, id: &str) -> SyncResult<()> {
        (**self).mark_seen(id)
    }
}

pub fn open_source(cfg: &MailConfig) -> Box<dyn MailSource> {
    match &cfg.backend {
        MailBackend::Imap {
            host,
            port,
            user,
            password,
            mailbox,
        } => Box::new(ImapSource::new(
            host.clone(),
            *port,
            user.clone(),
            password.clone(),
            mailbox.clone(),
            cfg.sender.clone(),
            cfg.subject.clone(),
        )),
        MailBackend::EmlDir { dir } => Box::new(EmlDirSource::new(
            dir.clone(),
            cfg.sender.clone(),
            cfg.subject.clone(),
        )),
    }
}

fn matches_allow_list(raw: &[u8], sender: &str, subject: &str) -> Option<NaiveDateTime> {
    let mail = parse_mail(raw).ok()?;
    let from = mail.headers.get_first_value("From").unwrap_or_default();
    if !from.contains(sender) {
        return None;
    }
    let subj = mail.headers.get_first_value("Subject").unwrap_or_default();
    if !subj.contains(subject) {
        return None;
    }
    mail.headers
        .get_first_value("Date")
        .and_then(|v| parse_email_date(&v))
}

// ---------------------------------------------------------------------------
// IMAP adapter
// ---------------------------------------------------------------------------

type ImapSession = imap::Session<TlsStream<TcpStream>>;

/// Raw-mailbox-protocol adapter. Connects lazily; connection and search
/// failures surface as `SourceUnavailable` so the orchestrator can degrade
/// the fetch phase instead of crashing.
pub struct ImapSource {
    host: String,
    port: u16,
    user: String,
    password: String,
    mailbox: String,
    sender: String,
    subject: String,
    session: Option<ImapSession>,
}

impl ImapSource {
    pub fn new(
        host: String,
        port: u16,
        user: String,
        password: String,
        mailbox: String,
        sender: String,
        subject: String,
    ) -> ImapSource {
        ImapSource {
            host,
            port,
            user,
            password,
            mailbox,
            sender,
            subject,
            session: None,
        }
    }

    fn session(&mut self) -> SyncResult<&mut ImapSession> {
        if self.session.is_none() {
            let tls = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| SyncError::SourceUnavailable(format!("tls setup failed: {e}")))?;
            let client = imap::connect((self.host.as_str(), self.port), self.host.as_str(), &tls)
                .map_err(|e| SyncError::SourceUnavailable(format!("imap connect failed: {e}")))?;
            let mut session = client
                .login(&self.user, &self.password)
                .map_err(|(e, _)| SyncError::SourceUnavailable(format!("imap login failed: {e}")))?;
            session
                .select(&self.mailbox)
                .map_err(|e| SyncError::SourceUnavailable(format!("mailbox select failed: {e}")))?;
            info!(host = %self.host, mailbox = %self.mailbox, "imap session opened");
            self.session = Some(session);
        }
        Ok(self.session.as_mut().expect("session just opened"))
    }
}

impl MailSource for ImapSource {
    fn fetch_since(&mut self, cutoff: NaiveDate) -> SyncResult<Vec<RawMessage>> {
        let sender = self.sender.clone();
        let subject = self.subject.clone();
        let query = format!("SINCE {} FROM \"{}\"", cutoff.format("%d-%b-%Y"), sender);
        let session = self.session()?;

        let uids = session
            .uid_search(&query)
            .map_err(|e| SyncError::SourceUnavailable(format!("imap search failed: {e}")))?;
        // Ascending UIDs approximate arrival order: oldest first.
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        debug!(count = uids.len(), %query, "imap search finished");

        let mut out = Vec::new();
        for uid in uids {
            let fetches = session
                .uid_fetch(uid.to_string(), "RFC822")
                .map_err(|e| SyncError::SourceUnavailable(format!("imap fetch failed: {e}")))?;
            let Some(fetch) = fetches.iter().next() else {
                continue;
            };
            let Some(raw) = fetch.body() else {
                warn!(uid, "fetched message without a body section");
                continue;
            };
            // FROM is matched server-side; the subject allow-list has to be
            // applied here because it is not ASCII-searchable.
            if matches_allow_list(raw, &sender, &subject).is_none() {
                continue;
            }
            out.push(RawMessage {
                id: uid.to_string(),
                raw: raw.to_vec(),
            });
        }
        Ok(out)
    }

    fn mark_seen(&mut self, id: &str) -> SyncResult<()> {
        let session = self.session()?;
        session
            .uid_store(id, "+FLAGS (\\Seen)")
            .map_err(|e| SyncError::SourceUnavailable(format!("imap store failed: {e}")))?;
        Ok(())
    }
}

impl Drop for ImapSource {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.logout();
        }
    }
}

// ---------------------------------------------------------------------------
// .eml directory adapter
// ---------------------------------------------------------------------------

const SEEN_SUFFIX: &str = ".seen";

/// File-backed adapter: a directory of `.eml` files stands in for the
/// mailbox. Marking a message seen renames it with a `.seen` suffix, which
/// removes it from later fetches.
pub struct EmlDirSource {
    dir: PathBuf,
    sender: String,
    subject: String,
}

impl EmlDirSource {
    pub fn new(dir: PathBuf, sender: String, subject: String) -> EmlDirSource {
        EmlDirSource {
            dir,
            sender,
            subject,
        }
    }

    fn collect_eml_files(&self) -> SyncResult<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Err(SyncError::SourceUnavailable(format!(
                "mail directory not found: {}",
                self.dir.display()
            )));
        }
        let mut files = WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|s| s.to_str())
                    .map(|s| s.eq_ignore_ascii_case("eml"))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }
}

impl MailSource for EmlDirSource {
    fn fetch_since(&mut self, cutoff: NaiveDate) -> SyncResult<Vec<RawMessage>> {
        let mut dated = Vec::new();
        for path in self.collect_eml_files()? {
            let raw = match std::fs::read(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable eml file");
                    continue;
                }
            };
            let Some(datetime) = matches_allow_list(&raw, &self.sender, &self.subject) else {
                continue;
            };
            if datetime.date() < cutoff {
                continue;
            }
            dated.push((
                datetime,
                RawMessage {
                    id: path.to_string_lossy().to_string(),
                    raw,
                },
            ));
        }
        // Full-timestamp sort so same-day messages keep time order, not
        // filename order.
        dated.sort_by_key(|(datetime, _)| *datetime);
        Ok(dated.into_iter().map(|(_, msg)| msg).collect())
    }

    fn mark_seen(&mut self, id: &str) -> SyncResult<()> {
        let path = Path::new(id);
        let mut seen = path.as_os_str().to_os_string();
        seen.push(SEEN_SUFFIX);
        std::fs::rename(path, &seen)
            .map_err(|e| SyncError::SourceUnavailable(format!("mark seen rename failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SENDER: &str = "payinfo@121.ana.co.jp";
    const SUBJECT: &str = "ご利用のお知らせ";

    fn temp_mail_dir() -> PathBuf {
        let unique = format!(
            "paysync_eml_test_{}_{}",
            std::process::id(),
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system time before epoch")
                .as_nanos()
        );
        let dir = std::env::temp_dir().join(unique);
        fs::create_dir_all(&dir).expect("create temp mail dir");
        dir
    }

    fn write_eml(dir: &Path, name: &str, from: &str, subject: &str, date: &str) -> PathBuf {
        let contents = format!(
            "Date: {date}\r\nFrom: {from}\r\nSubject: {subject}\r\n\r\n\
             ご利用金額：1,000円\r\n"
        );
        let path = dir.join(name);
        fs::write(&path, contents).expect("write eml");
        path
    }

    #[test]
    fn fetch_filters_by_allow_list_and_cutoff_and_orders_oldest_first() {
        let dir = temp_mail_dir();
        write_eml(&dir, "b.eml", SENDER, SUBJECT, "Fri, 22 Mar 2024 09:00:00 +0900");
        write_eml(&dir, "a.eml", SENDER, SUBJECT, "Thu, 21 Mar 2024 09:00:00 +0900");
        write_eml(&dir, "other_sender.eml", "spam@example.com", SUBJECT,
            "Fri, 22 Mar 2024 09:00:00 +0900");
        write_eml(&dir, "other_subject.eml", SENDER, "newsletter",
            "Fri, 22 Mar 2024 09:00:00 +0900");
        write_eml(&dir, "too_old.eml", SENDER, SUBJECT, "Mon, 01 Jan 2024 09:00:00 +0900");

        let mut source = EmlDirSource::new(dir.clone(), SENDER.to_string(), SUBJECT.to_string());
        let cutoff = NaiveDate::from_ymd_opt(2024, 3, 20).expect("date");
        let messages = source.fetch_since(cutoff).expect("fetch");

        let ids: Vec<_> = messages
            .iter()
            .map(|m| {
                Path::new(&m.id)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .expect("file name")
                    .to_string()
            })
            .collect();
        assert_eq!(ids, vec!["a.eml", "b.eml"]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn same_day_messages_are_ordered_by_time_not_filename() {
        let dir = temp_mail_dir();
        write_eml(&dir, "a.eml", SENDER, SUBJECT, "Thu, 21 Mar 2024 18:00:00 +0900");
        write_eml(&dir, "b.eml", SENDER, SUBJECT, "Thu, 21 Mar 2024 09:00:00 +0900");

        let mut source = EmlDirSource::new(dir.clone(), SENDER.to_string(), SUBJECT.to_string());
        let cutoff = NaiveDate::from_ymd_opt(2024, 3, 20).expect("date");
        let messages = source.fetch_since(cutoff).expect("fetch");

        let names: Vec<_> = messages
            .iter()
            .map(|m| {
                Path::new(&m.id)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .expect("file name")
                    .to_string()
            })
            .collect();
        assert_eq!(names, vec!["b.eml", "a.eml"]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn mark_seen_renames_and_excludes_from_later_fetches() {
        let dir = temp_mail_dir();
        let path = write_eml(&dir, "a.eml", SENDER, SUBJECT, "Thu, 21 Mar 2024 09:00:00 +0900");

        let mut source = EmlDirSource::new(dir.clone(), SENDER.to_string(), SUBJECT.to_string());
        let cutoff = NaiveDate::from_ymd_opt(2024, 3, 20).expect("date");
        let messages = source.fetch_since(cutoff).expect("fetch");
        assert_eq!(messages.len(), 1);

        source.mark_seen(&messages[0].id).expect("mark seen");
        assert!(!path.exists());
        assert!(source.fetch_since(cutoff).expect("refetch").is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_is_source_unavailable() {
        let mut source = EmlDirSource::new(
            PathBuf::from("/nonexistent/mails"),
            SENDER.to_string(),
            SUBJECT.to_string(),
        );
        let err = source
            .fetch_since(NaiveDate::from_ymd_opt(2024, 3, 20).expect("date"))
            .expect_err("unavailable");
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
    }
}
