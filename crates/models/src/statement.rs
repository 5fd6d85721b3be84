use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sample input/output pair shipped with a problem statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sample {
    pub input: String,
    pub output: String,
}

/// Resource limits declared by the source judge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    pub time_ms: u64,
    pub memory_mb: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time_ms: 1000,
            memory_mb: 256,
        }
    }
}

/// An image embedded in a statement body. OCR runs only for images without
/// a text alternative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub url: String,
    #[serde(default)]
    pub alt: Option<String>,
}

/// Canonical problem statement as persisted in `statement.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Statement {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub input_format: String,
    #[serde(default)]
    pub output_format: String,
    #[serde(default)]
    pub samples: Vec<Sample>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

impl Statement {
    /// Images that need OCR: present in the body with no text alternative.
    pub fn images_needing_ocr(&self) -> impl Iterator<Item = &ImageRef> {
        self.images
            .iter()
            .filter(|i| i.alt.as_deref().map_or(true, str::is_empty))
    }
}

/// Collapse runs of whitespace to a single space and trim the ends.
/// Comparison stays case-sensitive.
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Proof-of-upload artifact binding a workspace + adapter to a target id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub adapter: String,
    pub real_id: String,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_whitespace_collapses() {
        assert_eq!(
            normalize_title("P1001  A+B\tProblem "),
            "P1001 A+B Problem"
        );
        assert_eq!(normalize_title("  x  "), "x");
    }

    #[test]
    fn ocr_targets_only_untagged_images() {
        let s = Statement {
            title: "t".into(),
            body: String::new(),
            input_format: String::new(),
            output_format: String::new(),
            samples: vec![],
            limits: Limits::default(),
            tags: vec![],
            notes: None,
            images: vec![
                ImageRef {
                    url: "a.png".into(),
                    alt: Some("figure one".into()),
                },
                ImageRef {
                    url: "b.png".into(),
                    alt: None,
                },
            ],
        };
        let need: Vec<_> = s.images_needing_ocr().map(|i| i.url.as_str()).collect();
        assert_eq!(need, vec!["b.png"]);
    }
}
