use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use serde_json::json;
use tracing::{info, warn};

use crate::config::TargetConfig;
use crate::error::{SyncError, SyncResult};
use crate::merchant_rules::MerchantRule;
use crate::snapshot;
use crate::transaction::LedgerRow;

// Rendering-observable markers of the target UI. There is no API contract
// behind these; any markup change on the target site is an external
// interface break and lands here.
const EMAIL_FIELD: &str = "input[name='mfid_user[email]']";
const PASSWORD_FIELD: &str = "input[name='mfid_user[password]']";
const SIGN_IN_SUBMIT: &str = "#submitto";
const POST_LOGIN_MARKER: &str = "//div[contains(@class, 'container-large')]";
const ACCOUNT_SELECTION_HEADING: &str = "/html/body/main/div/div/div[2]/div/section/h1";
const ACCOUNT_SELECTION_HEADING_TEXT: &str = "アカウントを選択する";
const ACCOUNT_SELECTION_SUBMIT: &str =
    "/html/body/main/div/div/div[2]/div/section/div/div/form/button";
const MANUAL_ENTRY_BUTTON: &str = "//*[@id='kakeibo']/section/div[1]/div[1]/div/button";
const TOP_PAGE_HEADING: &str = "//*[@id='cf-manual-entry']/h2";
const TOP_PAGE_HEADING_TEXT: &str = "カンタン入力";
const DATE_FIELD: &str = "input[name='user_asset_act[updated_at]']";
const CALENDAR_DISMISS: &str = "//*[@id='important']/label";
const AMOUNT_FIELD: &str = "input[name='user_asset_act[amount]']";
const FUNDING_SELECT: &str = "select[name='user_asset_act[sub_account_id_hash]']";
const CONTENT_FIELD: &str = "input[name='user_asset_act[content]']";
const LARGE_CATEGORY_TOGGLE: &str = "#js-large-category-selected";
const MIDDLE_CATEGORY_TOGGLE: &str = "#js-middle-category-selected";
const MANUAL_ENTRY_LABEL: &str = "手入力";
const SAVE_LABEL: &str = "保存する";
const CONTINUE_LABEL: &str = "続けて入力する";

const ENTRY_DATE_FORMAT: &str = "%Y/%m/%d";

const SELECT_PREFIXED_OPTION_FN: &str = r#"
function (prefix) {
    const option = Array.from(this.options).find((o) => o.text.trim().startsWith(prefix));
    if (!option) {
        return false;
    }
    this.value = option.value;
    this.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
}
"#;

const CLEAR_VALUE_FN: &str = "function () { this.value = ''; }";

/// The posting side of a sync run: one authenticated session per batch,
/// one `post` call per unposted ledger row.
pub trait TransactionPoster {
    fn open_session(&mut self) -> SyncResult<()>;
    fn post(&mut self, row: &LedgerRow, rule: Option<&MerchantRule>) -> SyncResult<()>;
    fn close_session(&mut self);
}

/// Login flow for the target UI, modeled as explicit states. The UI is not
/// contractually stable across sessions, so the known variants are encoded
/// as named branches instead of silent catches; unknown future variants
/// should become new transitions here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginState {
    LoggedOut,
    CredentialsEntered,
    PasswordEntered,
    AccountSelection,
    Authenticated,
    TopPageRedirect,
    OnEntryForm,
}

struct Session {
    // Keeps the Chrome process alive; dropping the session kills it.
    _browser: Browser,
    tab: Arc<Tab>,
}

/// Drives the target web UI's manual transaction-entry form.
pub struct FormAutomator {
    cfg: TargetConfig,
    session: Option<Session>,
}

impl FormAutomator {
    pub fn new(cfg: TargetConfig) -> FormAutomator {
        FormAutomator { cfg, session: None }
    }

    fn snapshot(&self, tab: &Tab, label: &str) {
        snapshot::capture(tab, self.cfg.screenshot_dir.as_deref(), label);
    }

    fn launch(&self) -> anyhow::Result<Session> {
        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .window_size(Some((1920, 1080)))
            .args(vec![OsStr::new("--disable-gpu"), OsStr::new("--lang=ja-JP")])
            .idle_browser_timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| anyhow!("browser launch options: {e}"))?;
        let browser = Browser::new(options).context("launch browser")?;
        let tab = browser.new_tab().context("open tab")?;
        tab.set_default_timeout(self.cfg.ui_timeout);
        Ok(Session {
            _browser: browser,
            tab,
        })
    }

    fn login(&self) -> anyhow::Result<Session> {
        let session = self.launch()?;
        let tab = &session.tab;

        info!(url = %self.cfg.sign_in_url, "logging in to target ui");
        tab.navigate_to(&self.cfg.sign_in_url)
            .context("navigate to sign-in page")?;

        let mut state = LoginState::LoggedOut;
        while state != LoginState::OnEntryForm {
            state = self.advance(tab, state)?;
        }
        Ok(session)
    }

    /// One state-machine step. Timeouts that have a known recovery branch
    /// take it; the rest either degrade (fail-open, the default) or abort
    /// when `strict_login` is set.
    fn advance(&self, tab: &Tab, state: LoginState) -> anyhow::Result<LoginState> {
        match state {
            LoginState::LoggedOut => {
                let email = tab
                    .wait_for_element(EMAIL_FIELD)
                    .context("wait for identity field")?;
                email.type_into(&self.cfg.email).context("type identity")?;
                tab.find_element(SIGN_IN_SUBMIT)
                    .and_then(|btn| btn.click().map(|_| ()))
                    .context("submit identity")?;
                Ok(LoginState::CredentialsEntered)
            }

            LoginState::CredentialsEntered => {
                // The secret page never appearing is fatal for the batch.
                if tab.wait_for_element(PASSWORD_FIELD).is_err() {
                    self.snapshot(tab, "password_page_timeout");
                    bail!("secret page did not appear within the timeout");
                }
                Ok(LoginState::PasswordEntered)
            }

            LoginState::PasswordEntered => {
                let password = tab
                    .find_element(PASSWORD_FIELD)
                    .context("find secret field")?;
                password
                    .type_into(&self.cfg.password)
                    .context("type secret")?;
                tab.find_element(SIGN_IN_SUBMIT)
                    .and_then(|btn| btn.click().map(|_| ()))
                    .context("submit secret")?;

                if tab.wait_for_xpath(POST_LOGIN_MARKER).is_ok() {
                    return Ok(LoginState::Authenticated);
                }
                if self.heading_matches(
                    tab,
                    ACCOUNT_SELECTION_HEADING,
                    ACCOUNT_SELECTION_HEADING_TEXT,
                ) {
                    info!("account selection interstitial detected");
                    self.snapshot(tab, "account_selection");
                    return Ok(LoginState::AccountSelection);
                }
                if self.cfg.strict_login {
                    self.snapshot(tab, "after_login_timeout");
                    bail!("post-login marker did not appear and strict login is enabled");
                }
                warn!("post-login marker did not appear, continuing as authenticated");
                self.snapshot(tab, "after_login_timeout");
                Ok(LoginState::Authenticated)
            }

            LoginState::AccountSelection => {
                tab.find_element_by_xpath(ACCOUNT_SELECTION_SUBMIT)
                    .and_then(|btn| btn.click().map(|_| ()))
                    .context("select first account")?;
                let password = tab
                    .wait_for_element(PASSWORD_FIELD)
                    .context("wait for secret field after account selection")?;
                password
                    .type_into(&self.cfg.password)
                    .context("re-type secret")?;
                tab.find_element(SIGN_IN_SUBMIT)
                    .and_then(|btn| btn.click().map(|_| ()))
                    .context("re-submit secret")?;
                if tab.wait_for_xpath(POST_LOGIN_MARKER).is_err() {
                    if self.cfg.strict_login {
                        self.snapshot(tab, "account_selection_timeout");
                        bail!("post-login marker did not appear after account selection");
                    }
                    warn!("post-login marker missing after account selection, continuing");
                    self.snapshot(tab, "account_selection_timeout");
                }
                Ok(LoginState::Authenticated)
            }

            LoginState::Authenticated => {
                tab.navigate_to(&self.cfg.entry_url)
                    .context("navigate to entry page")?;
                // The service may prompt for the secret once more on its own
                // sign-in page; answer it when it does.
                if let Ok(password) = tab.wait_for_element(PASSWORD_FIELD) {
                    info!("entry page prompted for the secret again");
                    password
                        .type_into(&self.cfg.password)
                        .context("type secret on entry page")?;
                    tab.find_element(SIGN_IN_SUBMIT)
                        .and_then(|btn| btn.click().map(|_| ()))
                        .context("submit secret on entry page")?;
                }
                if self.heading_matches(tab, TOP_PAGE_HEADING, TOP_PAGE_HEADING_TEXT) {
                    info!("landed on the top page instead of the entry form");
                    self.snapshot(tab, "top_page_detected");
                    return Ok(LoginState::TopPageRedirect);
                }
                if tab.wait_for_xpath(MANUAL_ENTRY_BUTTON).is_err() {
                    warn!("manual-entry control not found, attempting entry regardless");
                    self.snapshot(tab, "manual_entry_not_found");
                }
                Ok(LoginState::OnEntryForm)
            }

            LoginState::TopPageRedirect => {
                // Re-navigate once; a second redirect is not retried.
                tab.navigate_to(&self.cfg.entry_url)
                    .context("re-navigate to entry page")?;
                if tab.wait_for_xpath(MANUAL_ENTRY_BUTTON).is_err() {
                    warn!("manual-entry control still missing after redirect, not retrying");
                    self.snapshot(tab, "manual_entry_not_found_after_redirect");
                }
                Ok(LoginState::OnEntryForm)
            }

            LoginState::OnEntryForm => Ok(LoginState::OnEntryForm),
        }
    }

    fn heading_matches(&self, tab: &Tab, xpath: &str, expected: &str) -> bool {
        tab.find_element_by_xpath(xpath)
            .and_then(|el| el.get_inner_text())
            .map(|text| text.trim() == expected)
            .unwrap_or(false)
    }

    fn fill_and_save(
        &self,
        tab: &Tab,
        row: &LedgerRow,
        rule: Option<&MerchantRule>,
    ) -> anyhow::Result<()> {
        // The confirmation control of the previous save doubles as the way
        // back to the form, so the entry dialog opener works for every
        // transaction of the batch.
        tab.wait_for_xpath(&text_control_xpath(MANUAL_ENTRY_LABEL))
            .and_then(|btn| btn.click().map(|_| ()))
            .context("open manual-entry dialog")?;

        let date = tab.wait_for_element(DATE_FIELD).context("find date field")?;
        clear_and_type(&date, &entry_date(row))?;
        // Typing opens a calendar overlay that swallows clicks until closed.
        tab.find_element_by_xpath(CALENDAR_DISMISS)
            .and_then(|el| el.click().map(|_| ()))
            .context("dismiss calendar overlay")?;

        let amount = tab.find_element(AMOUNT_FIELD).context("find amount field")?;
        clear_and_type(&amount, &row.amount.to_string())?;

        self.select_funding_source(tab)?;

        match rule {
            Some(rule) => {
                // Middle-category options depend on the large category, so
                // the large one has to be selected first.
                tab.find_element(LARGE_CATEGORY_TOGGLE)
                    .and_then(|el| el.click().map(|_| ()))
                    .context("open large-category menu")?;
                tab.wait_for_xpath(&category_option_xpath("l_c_name", &rule.large_category))
                    .and_then(|el| el.click().map(|_| ()))
                    .with_context(|| format!("select large category {}", rule.large_category))?;
                tab.find_element(MIDDLE_CATEGORY_TOGGLE)
                    .and_then(|el| el.click().map(|_| ()))
                    .context("open middle-category menu")?;
                tab.wait_for_xpath(&category_option_xpath("m_c_name", &rule.middle_category))
                    .and_then(|el| el.click().map(|_| ()))
                    .with_context(|| format!("select middle category {}", rule.middle_category))?;

                let content = tab
                    .find_element(CONTENT_FIELD)
                    .context("find content field")?;
                clear_and_type(&content, rule.display_name.as_deref().unwrap_or(&row.store))?;
            }
            None => {
                let content = tab
                    .find_element(CONTENT_FIELD)
                    .context("find content field")?;
                clear_and_type(&content, &row.store)?;
            }
        }

        tab.find_element_by_xpath(&text_control_xpath(SAVE_LABEL))
            .and_then(|btn| btn.click().map(|_| ()))
            .context("click save")?;

        // The save only counts once the continue control shows up; clicking
        // it readies the form for the next transaction.
        tab.wait_for_xpath(&text_control_xpath(CONTINUE_LABEL))
            .and_then(|btn| btn.click().map(|_| ()))
            .context("wait for save confirmation")?;

        info!(
            sheet_row = row.sheet_row,
            amount = row.amount,
            store = %row.store,
            "posted transaction to target ui"
        );
        Ok(())
    }

    fn select_funding_source(&self, tab: &Tab) -> anyhow::Result<()> {
        let select = tab
            .find_element(FUNDING_SELECT)
            .context("find funding-source dropdown")?;
        let result = select
            .call_js_fn(
                SELECT_PREFIXED_OPTION_FN,
                vec![json!(self.cfg.funding_prefix)],
                false,
            )
            .context("select funding source")?;
        if result.value != Some(json!(true)) {
            bail!(
                "no funding-source option starts with {:?}",
                self.cfg.funding_prefix
            );
        }
        Ok(())
    }
}

impl TransactionPoster for FormAutomator {
    fn open_session(&mut self) -> SyncResult<()> {
        if self.cfg.email.trim().is_empty() || self.cfg.password.trim().is_empty() {
            return Err(SyncError::Config(
                "target identity and secret must be non-empty".to_string(),
            ));
        }
        match self.login() {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(err) => Err(SyncError::UiTimeout(format!("login flow: {err:#}"))),
        }
    }

    fn post(&mut self, row: &LedgerRow, rule: Option<&MerchantRule>) -> SyncResult<()> {
        let tab = match &self.session {
            Some(session) => session.tab.clone(),
            None => {
                return Err(SyncError::TransactionPost(
                    "no active browser session".to_string(),
                ))
            }
        };
        self.fill_and_save(&tab, row, rule).map_err(|err| {
            self.snapshot(&tab, "add_record_error");
            SyncError::TransactionPost(format!("sheet row {}: {err:#}", row.sheet_row))
        })
    }

    fn close_session(&mut self) {
        if self.session.take().is_some() {
            info!("closed browser session");
        }
    }
}

impl Drop for FormAutomator {
    fn drop(&mut self) {
        self.close_session();
    }
}

fn clear_and_type(element: &Element, text: &str) -> anyhow::Result<()> {
    element
        .call_js_fn(CLEAR_VALUE_FN, vec![], false)
        .context("clear field")?;
    element.type_into(text).context("type into field")?;
    Ok(())
}

/// Date typed into the entry form; falls back to the mail arrival time when
/// the body carried no usage time.
fn entry_date(row: &LedgerRow) -> String {
    row.date_of_use
        .unwrap_or(row.email_date)
        .format(ENTRY_DATE_FORMAT)
        .to_string()
}

/// The target UI mixes buttons, anchors and submit inputs for its labeled
/// controls, so clicks go by visible label.
fn text_control_xpath(label: &str) -> String {
    format!(
        "//button[normalize-space(text())='{label}'] | \
         //a[normalize-space(text())='{label}'] | \
         //input[@value='{label}']"
    )
}

fn category_option_xpath(class: &str, name: &str) -> String {
    format!("//a[@class='{class}' and text()='{name}']")
}
