//! Label-file backend.
//!
//! Serves classification results from a JSONL file, one line per frame:
//!
//! ```text
//! {"frame": "12-00-04.jpg", "result": {"entitiesPresent": true, "entities": [...], "confidence": 0.9}}
//! {"frame": "12-00-34.jpg", "error": "deadline exceeded"}
//! ```
//!
//! Used to replay hand-labelled ground truth or cached model output without
//! calling a live model, which makes replay runs deterministic.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use crate::classify::backend::{Classifier, ClassifyRequest};
use crate::classify::result::ClassificationResult;

#[derive(Debug, Deserialize)]
struct LabelLine {
    frame: String,
    #[serde(default)]
    result: Option<ClassificationResult>,
    #[serde(default)]
    error: Option<String>,
}

pub struct LabelFileClassifier {
    labels: HashMap<String, std::result::Result<ClassificationResult, String>>,
}

impl LabelFileClassifier {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("open label file {}", path.display()))?;
        Self::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("load label file {}", path.display()))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut labels = HashMap::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LabelLine = serde_json::from_str(&line)
                .map_err(|e| anyhow!("line {}: {}", idx + 1, e))?;
            let value = match (entry.result, entry.error) {
                (Some(result), None) => Ok(result),
                (None, Some(error)) => Err(error),
                _ => {
                    return Err(anyhow!(
                        "line {}: exactly one of 'result' or 'error' is required",
                        idx + 1
                    ))
                }
            };
            labels.insert(entry.frame, value);
        }
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Classifier for LabelFileClassifier {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn classify(&mut self, request: &ClassifyRequest) -> Result<ClassificationResult> {
        match self.labels.get(&request.reference) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(error)) => Err(anyhow!("{}: {}", request.reference, error)),
            None => Err(anyhow!("no label for frame {}", request.reference)),
        }
    }
}
