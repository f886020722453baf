//! Link extraction, filtering, normalization and classification.
//!
//! Everything here is pure: a `LinkClassifier` is built once from
//! configuration and then shared (`Arc`) by every collector worker.
//!
//! Pipeline for a piece of text:
//! 1. Extract candidate URLs (with or without scheme)
//! 2. Normalize each candidate
//! 3. Drop blacklisted hosts and ignored patterns
//! 4. Tag with the first matching family
//! 5. De-duplicate on the normalized form

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use url::Url;

use crate::config::ClassifierConfig;
use crate::error::CollectorError;
use crate::schema::{AccountId, ChatId, LinkClass, LinkRecord};

/// Generic URL pattern. Besides `http(s)://` it recognizes the bare
/// forms people paste into chats (`t.me/…`, `www.…`, `wa.me/…`).
static CANDIDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:https?://|www\.|(?:t|telegram)\.me/|chat\.whatsapp\.com/|wa\.me/)[^\s<>"'{}|\\^`\[\]]+"#,
    )
    .expect("candidate pattern is valid")
});

const DEFAULT_TELEGRAM_PRIVATE: &str = r"^https://t\.me/(?:joinchat/|\+)[A-Za-z0-9_-]{5,}$";
const DEFAULT_TELEGRAM_PUBLIC: &str = r"^https://t\.me/[A-Za-z][A-Za-z0-9_]{3,31}$";
const DEFAULT_WHATSAPP_INVITE: &str = r"^https://chat\.whatsapp\.com/(?:invite/)?[A-Za-z0-9]{10,}$";

/// First path segments on t.me that are platform features, not chats.
const TELEGRAM_RESERVED: [&str; 12] = [
    "joinchat", "addstickers", "addemoji", "addtheme", "share", "proxy", "socks", "setlanguage",
    "login", "iv", "contact", "boost",
];

const TELEGRAM_ALIASES: [&str; 5] = [
    "t.me",
    "www.t.me",
    "telegram.me",
    "www.telegram.me",
    "telegram.dog",
];

/// Hosts that are always served over https and get their scheme pinned.
const HTTPS_ONLY_HOSTS: [&str; 3] = ["t.me", "chat.whatsapp.com", "wa.me"];

/// A link that survived filtering, before source attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedLink {
    pub raw: String,
    pub normalized: String,
    pub class: LinkClass,
}

impl ClassifiedLink {
    pub fn into_record(
        self,
        account_id: AccountId,
        chat_id: ChatId,
        discovered_at: DateTime<Utc>,
    ) -> LinkRecord {
        LinkRecord {
            raw_url: self.raw,
            normalized_url: self.normalized,
            class: self.class,
            account_id,
            chat_id,
            discovered_at,
        }
    }
}

pub struct LinkClassifier {
    blacklist: Vec<String>,
    ignored: Vec<Regex>,
    tracking: HashSet<String>,
    families: Vec<(LinkClass, Vec<Regex>)>,
    collect_other: bool,
}

impl LinkClassifier {
    /// Compile all configured patterns.
    ///
    /// Empty family lists fall back to the built-in patterns. Any
    /// invalid pattern is a configuration error.
    pub fn new(cfg: &ClassifierConfig) -> Result<Self, CollectorError> {
        let family = |class: LinkClass, configured: &[String], default: &str| {
            let patterns: Vec<&str> = if configured.is_empty() {
                vec![default]
            } else {
                configured.iter().map(String::as_str).collect()
            };
            compile_all(&patterns).map(|res| (class, res))
        };

        let families = vec![
            family(
                LinkClass::TelegramPrivateGroup,
                &cfg.families.telegram_private_group,
                DEFAULT_TELEGRAM_PRIVATE,
            )?,
            family(
                LinkClass::TelegramPublicGroup,
                &cfg.families.telegram_public_group,
                DEFAULT_TELEGRAM_PUBLIC,
            )?,
            family(
                LinkClass::WhatsappInvite,
                &cfg.families.whatsapp_invite,
                DEFAULT_WHATSAPP_INVITE,
            )?,
        ];

        let ignored: Vec<&str> = cfg.ignored_patterns.iter().map(String::as_str).collect();

        Ok(Self {
            blacklist: cfg
                .blacklisted_domains
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            ignored: compile_all(&ignored)?,
            tracking: cfg
                .tracking_params
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            families,
            collect_other: cfg.collect_other,
        })
    }

    /// Extract, filter and classify every link in `text`.
    ///
    /// Empty or whitespace-only text yields nothing. A link appearing
    /// several times (in any surface form that normalizes the same)
    /// yields a single entry, in first-seen order.
    pub fn classify(&self, text: &str) -> Vec<ClassifiedLink> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        CANDIDATE_RE
            .find_iter(text)
            .filter_map(|m| self.classify_url(m.as_str()))
            .filter(|link| seen.insert(link.normalized.clone()))
            .collect()
    }

    /// Filter and classify a single candidate URL.
    pub fn classify_url(&self, candidate: &str) -> Option<ClassifiedLink> {
        let raw = clean_candidate(candidate);
        if raw.is_empty() {
            return None;
        }

        let (normalized, host) = self.normalize_parts(&raw)?;

        if self.is_blacklisted(&host) || self.is_ignored(&raw, &normalized) {
            log::trace!("dropping filtered link {normalized}");
            return None;
        }

        let class = self.class_of(&normalized);
        if class == LinkClass::Other && !self.collect_other {
            return None;
        }

        Some(ClassifiedLink {
            raw,
            normalized,
            class,
        })
    }

    /// Canonical form used as the dedup key.
    pub fn normalize(&self, candidate: &str) -> Option<String> {
        self.normalize_parts(&clean_candidate(candidate))
            .map(|(normalized, _)| normalized)
    }

    /// Tag of an already normalized URL. First matching family wins.
    pub fn class_of(&self, normalized: &str) -> LinkClass {
        for (class, patterns) in &self.families {
            if patterns.iter().any(|re| re.is_match(normalized)) {
                if *class == LinkClass::TelegramPublicGroup && is_reserved_telegram_path(normalized)
                {
                    continue;
                }
                return *class;
            }
        }
        LinkClass::Other
    }

    fn is_blacklisted(&self, host: &str) -> bool {
        self.blacklist.iter().any(|d| {
            host == d
                || host
                    .strip_suffix(d.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    fn is_ignored(&self, raw: &str, normalized: &str) -> bool {
        self.ignored
            .iter()
            .any(|re| re.is_match(normalized) || re.is_match(raw))
    }

    /// Returns the normalized URL together with its host.
    ///
    /// Normalization:
    /// - scheme added when missing, lower-cased
    /// - host lower-cased, telegram aliases folded into `t.me`
    /// - default port, user info and fragment dropped
    /// - tracking query parameters (`utm_*` + configured) dropped
    /// - trailing slashes stripped
    fn normalize_parts(&self, raw: &str) -> Option<(String, String)> {
        let lower = raw.to_ascii_lowercase();
        let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
            raw.to_string()
        } else if lower.contains("://") {
            return None;
        } else {
            format!("https://{raw}")
        };

        let url = Url::parse(&with_scheme).ok()?;
        let mut scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return None;
        }

        let mut host = url.host_str()?.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }
        if TELEGRAM_ALIASES.contains(&host.as_str()) {
            host = "t.me".to_string();
        }
        if HTTPS_ONLY_HOSTS.contains(&host.as_str()) {
            scheme = "https".to_string();
        }

        let port = match url.port() {
            Some(443) if scheme == "https" => String::new(),
            Some(80) if scheme == "http" => String::new(),
            Some(p) => format!(":{p}"),
            None => String::new(),
        };

        let path = url.path().trim_end_matches('/');

        let query = url
            .query()
            .map(|q| {
                q.split('&')
                    .filter(|pair| !pair.is_empty() && !self.is_tracking_param(pair))
                    .collect::<Vec<_>>()
                    .join("&")
            })
            .filter(|q| !q.is_empty())
            .map(|q| format!("?{q}"))
            .unwrap_or_default();

        let normalized = format!("{scheme}://{host}{port}{path}{query}");
        Some((normalized, host))
    }

    fn is_tracking_param(&self, pair: &str) -> bool {
        let key = pair.split('=').next().unwrap_or_default().to_ascii_lowercase();
        key.starts_with("utm_") || self.tracking.contains(&key)
    }
}

/// Strip decoration people put around links in chat text
/// (markdown emphasis, brackets, sentence punctuation, quotes).
fn clean_candidate(candidate: &str) -> String {
    let without_stars: String = candidate.chars().filter(|c| *c != '*').collect();
    without_stars
        .trim()
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .trim_end_matches(|c: char| {
            matches!(
                c,
                '.' | ',' | ';' | ':' | '!' | '?' | ')' | ']' | '}' | '>' | '\'' | '"' | '»' | '”' | '’'
            )
        })
        .to_string()
}

fn is_reserved_telegram_path(normalized: &str) -> bool {
    let Some(rest) = normalized.strip_prefix("https://t.me/") else {
        return false;
    };
    let first = rest.split(['/', '?']).next().unwrap_or_default().to_ascii_lowercase();
    TELEGRAM_RESERVED.contains(&first.as_str()) || first.ends_with("bot")
}

fn compile_all(patterns: &[&str]) -> Result<Vec<Regex>, CollectorError> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| CollectorError::Config(format!("invalid pattern '{p}': {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FamilyPatterns;

    fn classifier() -> LinkClassifier {
        LinkClassifier::new(&ClassifierConfig::default()).unwrap()
    }

    fn classifier_with(f: impl FnOnce(&mut ClassifierConfig)) -> LinkClassifier {
        let mut cfg = ClassifierConfig::default();
        f(&mut cfg);
        LinkClassifier::new(&cfg).unwrap()
    }

    #[test]
    fn cosmetic_variants_normalize_identically() {
        let c = classifier();
        let variants = [
            "https://example.com/x",
            "https://example.com/x/",
            "https://example.com/x///",
            "HTTPS://EXAMPLE.com:443/x",
            "https://example.com/x?utm_source=y",
            "https://example.com/x?utm_source=y&utm_medium=chat",
            "https://example.com/x?fbclid=abc",
            "https://example.com/x#section",
            "example.com/x",
        ];
        let expected = "https://example.com/x";
        for v in variants {
            assert_eq!(c.normalize(v).as_deref(), Some(expected), "variant {v}");
        }
    }

    #[test]
    fn non_tracking_query_is_kept_in_order() {
        let c = classifier();
        assert_eq!(
            c.normalize("http://Example.com:80/watch?v=1&utm_campaign=z&t=30").as_deref(),
            Some("http://example.com/watch?v=1&t=30")
        );
        assert_eq!(
            c.normalize("http://example.com:8080/").as_deref(),
            Some("http://example.com:8080")
        );
    }

    #[test]
    fn telegram_aliases_fold_into_t_me() {
        let c = classifier();
        for v in [
            "http://telegram.me/joinchat/ABC123",
            "https://www.t.me/joinchat/ABC123/",
            "t.me/joinchat/ABC123",
            "https://telegram.dog/joinchat/ABC123",
        ] {
            assert_eq!(
                c.normalize(v).as_deref(),
                Some("https://t.me/joinchat/ABC123"),
                "variant {v}"
            );
        }
    }

    #[test]
    fn families_are_detected() {
        let c = classifier();
        assert_eq!(c.class_of("https://t.me/joinchat/ABC123"), LinkClass::TelegramPrivateGroup);
        assert_eq!(c.class_of("https://t.me/+AbCdEf_12"), LinkClass::TelegramPrivateGroup);
        assert_eq!(c.class_of("https://t.me/rust_lang_group"), LinkClass::TelegramPublicGroup);
        assert_eq!(
            c.class_of("https://chat.whatsapp.com/KpQ1a2b3c4d5e6"),
            LinkClass::WhatsappInvite
        );
        assert_eq!(c.class_of("https://example.com/x"), LinkClass::Other);
    }

    #[test]
    fn telegram_feature_paths_and_bots_are_not_groups() {
        let c = classifier();
        assert_eq!(c.class_of("https://t.me/addstickers"), LinkClass::Other);
        assert_eq!(c.class_of("https://t.me/share"), LinkClass::Other);
        assert_eq!(c.class_of("https://t.me/SomeHelperBot"), LinkClass::Other);
        assert_eq!(c.class_of("https://t.me/rust_lang_group/1234"), LinkClass::Other);
    }

    #[test]
    fn earlier_family_wins_when_two_match() {
        let c = classifier_with(|cfg| {
            cfg.families = FamilyPatterns {
                telegram_private_group: vec![r"t\.me/".into()],
                telegram_public_group: vec![r"t\.me/".into()],
                whatsapp_invite: vec![r".*".into()],
            };
        });
        for _ in 0..10 {
            assert_eq!(
                c.class_of("https://t.me/rust_lang_group"),
                LinkClass::TelegramPrivateGroup
            );
        }
        assert_eq!(c.class_of("https://example.com"), LinkClass::WhatsappInvite);
    }

    #[test]
    fn empty_text_yields_nothing() {
        let c = classifier();
        assert!(c.classify("").is_empty());
        assert!(c.classify("   \n\t ").is_empty());
        assert!(c.classify("no links in here").is_empty());
    }

    #[test]
    fn duplicates_in_one_text_collapse() {
        let c = classifier();
        let links = c.classify(
            "join https://t.me/joinchat/ABC123 or t.me/joinchat/ABC123/ or **https://T.ME/joinchat/ABC123**",
        );
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].normalized, "https://t.me/joinchat/ABC123");
        assert_eq!(links[0].raw, "https://t.me/joinchat/ABC123");
    }

    #[test]
    fn private_invite_and_tracked_link_in_one_message() {
        let c = classifier();
        let links = c.classify(
            "groups: https://t.me/joinchat/ABC123 and (https://example.com/x?utm_source=y).",
        );
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].class, LinkClass::TelegramPrivateGroup);
        assert_eq!(links[1].class, LinkClass::Other);
        assert_eq!(links[1].normalized, "https://example.com/x");
        assert_ne!(links[0].normalized, links[1].normalized);
    }

    #[test]
    fn blacklisted_hosts_and_subdomains_are_dropped() {
        let c = classifier_with(|cfg| cfg.blacklisted_domains = vec!["Example.com".into()]);
        assert!(c.classify_url("https://example.com/x").is_none());
        assert!(c.classify_url("https://cdn.EXAMPLE.com/x").is_none());
        assert!(c.classify_url("https://notexample.com/x").is_some());
    }

    #[test]
    fn ignore_patterns_are_case_insensitive() {
        let c = classifier_with(|cfg| cfg.ignored_patterns = vec![r"/joinchat/spam".into()]);
        assert!(c.classify_url("https://t.me/JOINCHAT/SPAM123").is_none());
        assert!(c.classify_url("https://t.me/joinchat/ABC123").is_some());
    }

    #[test]
    fn other_links_can_be_switched_off() {
        let c = classifier_with(|cfg| cfg.collect_other = false);
        let links = c.classify("https://example.com/a https://t.me/joinchat/ABC123");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].class, LinkClass::TelegramPrivateGroup);
    }

    #[test]
    fn bare_words_ending_in_t_are_not_telegram() {
        let c = classifier();
        assert!(c.classify("read about.me/someone for details").is_empty());
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let mut cfg = ClassifierConfig::default();
        cfg.ignored_patterns = vec!["(".into()];
        assert!(matches!(
            LinkClassifier::new(&cfg),
            Err(CollectorError::Config(_))
        ));
    }
}
