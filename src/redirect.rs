use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::chain::{Next, Stage};
use crate::config::RedirectConfig;
use crate::context::QueryContext;
use crate::error::{ConfigError, Result};
use crate::message::{Record, RecordClass};

const MEMO_TTL: Duration = Duration::from_secs(300);

/// Name-rewrite lookup, a collaborator of the redirect stage.
pub trait NameMatcher: Send + Sync {
    /// Rewrite target for a case-normalized name, if any.
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Rule-backed matcher with exact and suffix semantics. Rules are
/// `pattern target` lines; a pattern is exact by default (or with a
/// `full:` prefix) and matches a whole-label suffix with `domain:`.
pub struct RuleTable {
    exact: HashMap<String, String>,
    suffixes: Vec<(String, String)>,
}

impl RuleTable {
    pub fn parse(rules: &[String]) -> std::result::Result<Self, ConfigError> {
        let mut exact = HashMap::new();
        let mut suffixes = Vec::new();
        for rule in rules {
            let fields: Vec<&str> = rule.split_whitespace().collect();
            if fields.len() != 2 {
                return Err(ConfigError::InvalidRule(format!(
                    "redirect rule must have 2 fields, got {}: {rule:?}",
                    fields.len()
                )));
            }
            let target = normalize(fields[1]);
            if let Some(suffix) = fields[0].strip_prefix("domain:") {
                suffixes.push((normalize(suffix), target));
            } else {
                let pattern = fields[0].strip_prefix("full:").unwrap_or(fields[0]);
                exact.insert(normalize(pattern), target);
            }
        }
        Ok(RuleTable { exact, suffixes })
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NameMatcher for RuleTable {
    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(target) = self.exact.get(name) {
            return Some(target.clone());
        }
        self.suffixes
            .iter()
            .find(|(suffix, _)| suffix_matches(name, suffix))
            .map(|(_, target)| target.clone())
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Whole-label suffix match: `a.example.com` matches `example.com`,
/// `badexample.com` does not.
fn suffix_matches(name: &str, suffix: &str) -> bool {
    name == suffix
        || (name.len() > suffix.len()
            && name.ends_with(suffix)
            && name.as_bytes()[name.len() - suffix.len() - 1] == b'.')
}

/// Rewrites matching question names before delegation, restores the
/// original name in the response afterwards and prepends a synthetic
/// CNAME linking original to rewritten. A small memo cache avoids
/// re-matching hot names; entries expire by deferred removal.
pub struct RedirectStage {
    matcher: Arc<dyn NameMatcher>,
    memo: Arc<DashMap<String, String>>,
    memo_ttl: Duration,
}

impl RedirectStage {
    pub fn new(matcher: Arc<dyn NameMatcher>) -> Self {
        RedirectStage {
            matcher,
            memo: Arc::new(DashMap::new()),
            memo_ttl: MEMO_TTL,
        }
    }

    pub fn from_rules(cfg: &RedirectConfig) -> std::result::Result<Self, ConfigError> {
        let table = RuleTable::parse(&cfg.rules)?;
        debug!(rules = table.len(), "redirect rules loaded");
        Ok(Self::new(Arc::new(table)))
    }

    fn target_for(&self, name: &str) -> Option<String> {
        if let Some(target) = self.memo.get(name) {
            return Some(target.clone());
        }
        let target = self.matcher.lookup(name)?;
        self.memo.insert(name.to_string(), target.clone());

        // Deferred per-entry expiry, no scanning.
        let memo = Arc::clone(&self.memo);
        let key = name.to_string();
        let ttl = self.memo_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            memo.remove(&key);
        });
        Some(target)
    }
}

#[async_trait]
impl Stage for RedirectStage {
    async fn execute(&self, ctx: &mut QueryContext, next: Next) -> Result<()> {
        let rewrite = match ctx.query().question() {
            Some(q) if ctx.query().questions.len() == 1 && q.qclass == RecordClass::IN => {
                let original = q.name();
                self.target_for(&original).map(|target| (original, target))
            }
            _ => None,
        };
        let Some((original, target)) = rewrite else {
            return next.run(ctx).await;
        };

        debug!(%original, %target, "redirecting query");
        ctx.query_mut().questions[0].set_name(&target);
        let result = next.run(ctx).await;
        // Restore the query's own question even when delegation failed.
        ctx.query_mut().questions[0].set_name(&original);

        if let Some(resp) = ctx.response_mut() {
            for question in &mut resp.questions {
                if question.name() == target {
                    question.set_name(&original);
                }
            }
            resp.answers
                .insert(0, Record::cname(&original, &target, 1));
        }
        result
    }
}
