//! Pattern extraction over raw tool output.
//!
//! Each rule is a named regular expression applied independently to the
//! captured stdout. The resulting `Summary` is a total mapping: every
//! declared field is present, with an empty match list when the pattern
//! found nothing. Summaries are derived caches and never authoritative;
//! they can be recomputed from the raw artifact at any time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::RunId;

pub struct ExtractionRule {
    pub field: &'static str,
    pub pattern: &'static str,
}

/// Fields recognized in sqlmap-style output.
pub const RULES: &[ExtractionRule] = &[
    ExtractionRule {
        field: "parameter",
        pattern: r"(?m)^Parameter:\s*(.+?)\s*$",
    },
    ExtractionRule {
        field: "technique",
        pattern: r"(?m)^\s*Type:\s*(.+?)\s*$",
    },
    ExtractionRule {
        field: "dbms",
        pattern: r"(?m)back-end DBMS:\s*(.+?)\s*$",
    },
    ExtractionRule {
        field: "database",
        pattern: r"(?im)^Database:\s*(\S+)",
    },
    ExtractionRule {
        field: "table",
        pattern: r"(?im)^Table:\s*(\S+)",
    },
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub run_id: RunId,
    pub generated_at: DateTime<Utc>,
    pub fields: BTreeMap<String, Vec<String>>,
}

impl Summary {
    /// A summary with every declared field present and empty.
    pub fn empty(run_id: &RunId) -> Self {
        let fields = RULES
            .iter()
            .map(|rule| (rule.field.to_string(), Vec::new()))
            .collect();
        Self {
            run_id: run_id.clone(),
            generated_at: Utc::now(),
            fields,
        }
    }

    pub fn first(&self, field: &str) -> Option<&str> {
        self.fields.get(field)?.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(Vec::is_empty)
    }
}

/// Applies every declared rule to the given text. Pure function of its
/// inputs apart from the generation timestamp.
pub fn extract_summary(run_id: &RunId, text: &str) -> Summary {
    let mut summary = Summary::empty(run_id);
    for rule in RULES {
        let re = match Regex::new(rule.pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!("extraction rule '{}' failed to compile: {}", rule.field, e);
                continue;
            }
        };
        let values = summary
            .fields
            .get_mut(rule.field)
            .expect("declared field missing from summary");
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                let value = m.as_str().trim().to_string();
                if !value.is_empty() && !values.contains(&value) {
                    values.push(value);
                }
            }
        }
    }
    summary
}
