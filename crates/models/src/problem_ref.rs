use crate::{PipelineError, PipelineResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A raw problem reference normalized to `(source_adapter, short_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemRef {
    pub source: String,
    pub short_id: String,
    pub raw: String,
}

impl ProblemRef {
    /// Stable workspace key, e.g. `cf_1234A`.
    pub fn normalized_pid(&self) -> String {
        format!("{}_{}", self.source, self.short_id)
    }

    /// Short id shown to users.
    pub fn display(&self) -> &str {
        &self.short_id
    }
}

struct UrlRule {
    host: &'static str,
    adapter: &'static str,
    path: Regex,
}

fn url_rules() -> &'static [UrlRule] {
    static RULES: OnceLock<Vec<UrlRule>> = OnceLock::new();
    RULES
        .get_or_init(|| {
            let rule = |host, adapter, pattern: &str| UrlRule {
                host,
                adapter,
                path: Regex::new(pattern).unwrap(),
            };
            vec![
                rule("aicoders.cn", "aicoders", r"/problem/(\d+)"),
                rule("shsoj", "shsoj", r"/problem/(\d+)"),
                rule("shsbnu", "shsoj", r"/problem/(\d+)"),
                rule("codeforces.com", "cf", r"/problem/(\d+)/([A-Z]\d?)"),
                rule("atcoder.jp", "atcoder", r"/tasks/([^/?]+)"),
                rule("luogu.com", "luogu", r"/problem/([A-Z]?\d+)"),
                rule("hydro", "hydrooj", r"/([^/?]+)/?(?:\?.*)?$"),
            ]
        })
        .as_slice()
}

fn bare_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES
        .get_or_init(|| {
            vec![
                (Regex::new(r"^[PBTU]\d+$").unwrap(), "luogu"),
                (Regex::new(r"^\d+[A-Z]$").unwrap(), "cf"),
                (Regex::new(r"^\d+$").unwrap(), "shsoj"),
            ]
        })
        .as_slice()
}

/// Normalize a raw problem reference. An explicit `source_override` accepts
/// the id verbatim and skips auto-detection; otherwise URL rules are tried
/// first, then bare-id rules, in declaration order.
pub fn normalize(raw: &str, source_override: Option<&str>) -> PipelineResult<ProblemRef> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Parse("empty problem reference".into()));
    }

    if let Some(source) = source_override {
        return Ok(ProblemRef {
            source: source.to_string(),
            short_id: trimmed.to_string(),
            raw: raw.to_string(),
        });
    }

    if trimmed.contains("://") || trimmed.contains('/') {
        for rule in url_rules() {
            if !trimmed.contains(rule.host) {
                continue;
            }
            let caps = rule.path.captures(trimmed).ok_or_else(|| {
                PipelineError::Parse(format!("unrecognized {} problem path: {trimmed}", rule.adapter))
            })?;
            let short_id = if rule.adapter == "cf" {
                format!("{}{}", &caps[1], &caps[2])
            } else {
                caps[1].to_string()
            };
            return Ok(ProblemRef {
                source: rule.adapter.to_string(),
                short_id,
                raw: raw.to_string(),
            });
        }
        return Err(PipelineError::Parse(format!(
            "no adapter matches url: {trimmed}"
        )));
    }

    for (re, adapter) in bare_rules() {
        if re.is_match(trimmed) {
            return Ok(ProblemRef {
                source: adapter.to_string(),
                short_id: trimmed.to_string(),
                raw: raw.to_string(),
            });
        }
    }

    Err(PipelineError::Parse(format!(
        "unrecognized problem reference: {trimmed}"
    )))
}
