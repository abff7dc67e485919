//! Keyword intent routing.
//!
//! The first configured rule with a keyword contained in the lower-cased
//! query wins and contributes its metadata filter to retrieval. No match
//! resolves to the `general` intent with an empty filter.

use campus_copilot_core::store::MetadataFilter;

use crate::config::IntentRule;

pub const GENERAL: &str = "general";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub name: String,
    pub filter: MetadataFilter,
}

impl Intent {
    pub fn general() -> Self {
        Self {
            name: GENERAL.to_string(),
            filter: MetadataFilter::none(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntentRouter {
    rules: Vec<IntentRule>,
}

impl IntentRouter {
    pub fn new(rules: Vec<IntentRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|mut r| {
                r.keywords = r.keywords.iter().map(|k| k.to_lowercase()).collect();
                r
            })
            .collect();
        Self { rules }
    }

    pub fn resolve(&self, query: &str) -> Intent {
        let lower = query.to_lowercase();
        self.rules
            .iter()
            .find(|r| r.keywords.iter().any(|k| lower.contains(k.as_str())))
            .map(|r| Intent {
                name: r.name.clone(),
                filter: r.filter.clone(),
            })
            .unwrap_or_else(Intent::general)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn router() -> IntentRouter {
        IntentRouter::new(Config::default().intents)
    }

    #[test]
    fn test_default_rules() {
        let r = router();
        assert_eq!(r.resolve("What's happening this weekend?").name, "events");
        assert_eq!(r.resolve("Dining hall MENU today").name, "dining");
        assert_eq!(r.resolve("What is the average cost of attendance?").name, "cost");
        assert_eq!(r.resolve("Tuition for grad students").name, "cost");
    }

    #[test]
    fn test_first_rule_wins() {
        assert_eq!(router().resolve("cost of the dining event").name, "events");
    }

    #[test]
    fn test_no_match_is_general() {
        let intent = router().resolve("prerequisites for CS101");
        assert_eq!(intent, Intent::general());
        assert!(intent.filter.is_empty());
    }

    #[test]
    fn test_filter_carried() {
        assert_eq!(
            router().resolve("dining").filter,
            MetadataFilter::eq("topic", "dining")
        );
    }
}
