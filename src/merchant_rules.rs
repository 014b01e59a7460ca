use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

/// Category mapping for one store name, loaded once per run from the rule
/// table. Absence of a rule means: post with the raw store name and no
/// category selection.
#[derive(Debug, Clone, PartialEq)]
pub struct MerchantRule {
    pub large_category: String,
    pub middle_category: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MerchantRuleRecord {
    store: String,
    large_category: String,
    middle_category: String,
    #[serde(default)]
    display_name: String,
}

/// Read-only store-name → rule lookup.
#[derive(Debug, Default)]
pub struct MerchantRuleBook {
    rules: HashMap<String, MerchantRule>,
}

impl MerchantRuleBook {
    /// Loads the rule CSV (`store,large_category,middle_category,display_name`).
    /// A missing or unreadable file yields an empty book rather than an
    /// error; malformed rows are skipped.
    pub fn load(path: &Path) -> MerchantRuleBook {
        let mut rules = HashMap::new();
        let Ok(mut rdr) = csv::Reader::from_path(path) else {
            warn!(path = %path.display(), "merchant rule table not readable, posting raw store names");
            return MerchantRuleBook::default();
        };
        for record in rdr.deserialize::<MerchantRuleRecord>() {
            let record = match record {
                Ok(r) => r,
                Err(err) => {
                    warn!(%err, "skipping malformed merchant rule row");
                    continue;
                }
            };
            let store = record.store.trim().to_string();
            let large = record.large_category.trim().to_string();
            let middle = record.middle_category.trim().to_string();
            if store.is_empty() || large.is_empty() || middle.is_empty() {
                continue;
            }
            let display = record.display_name.trim();
            rules.insert(
                store,
                MerchantRule {
                    large_category: large,
                    middle_category: middle,
                    display_name: (!display.is_empty()).then(|| display.to_string()),
                },
            );
        }
        info!(count = rules.len(), "loaded merchant rules");
        MerchantRuleBook { rules }
    }

    pub fn get(&self, store: &str) -> Option<&MerchantRule> {
        self.rules.get(store)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_csv(contents: &str) -> PathBuf {
        let unique = format!(
            "paysync_rules_test_{}_{}.csv",
            std::process::id(),
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system time before epoch")
                .as_nanos()
        );
        let path = std::env::temp_dir().join(unique);
        fs::write(&path, contents).expect("write temp csv");
        path
    }

    #[test]
    fn loads_rules_and_optional_display_name() {
        let path = temp_csv(
            "store,large_category,middle_category,display_name\n\
             SMOKEBEERFACTORY OTSUKATE,食費,外食,スモークビアファクトリー\n\
             CAFE X,食費,カフェ,\n",
        );
        let book = MerchantRuleBook::load(&path);
        assert_eq!(book.len(), 2);
        let rule = book.get("SMOKEBEERFACTORY OTSUKATE").expect("rule");
        assert_eq!(rule.large_category, "食費");
        assert_eq!(rule.middle_category, "外食");
        assert_eq!(
            rule.display_name.as_deref(),
            Some("スモークビアファクトリー")
        );
        let cafe = book.get("CAFE X").expect("rule");
        assert_eq!(cafe.display_name, None);
        assert_eq!(book.get("UNKNOWN STORE"), None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_yields_empty_book() {
        let book = MerchantRuleBook::load(Path::new("/nonexistent/rules.csv"));
        assert!(book.is_empty());
    }

    #[test]
    fn incomplete_rows_are_skipped() {
        let path = temp_csv(
            "store,large_category,middle_category,display_name\n\
             NO CATEGORY,, ,\n\
             OK STORE,食費,外食,\n",
        );
        let book = MerchantRuleBook::load(&path);
        assert_eq!(book.len(), 1);
        assert!(book.get("OK STORE").is_some());
        let _ = fs::remove_file(&path);
    }
}
