use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::time::Duration;

use crate::classify::backend::{Classifier, ClassifyRequest};
use crate::classify::result::ClassificationResult;

/// Scripted backend for testing. Replays canned results in order.
#[derive(Default)]
pub struct ScriptedClassifier {
    script: VecDeque<std::result::Result<ClassificationResult, String>>,
    latency: Duration,
    calls: u64,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, result: ClassificationResult) -> Self {
        self.script.push_back(Ok(result));
        self
    }

    pub fn then_fail(mut self, message: &str) -> Self {
        self.script.push_back(Err(message.to_string()));
        self
    }

    /// Simulated per-call latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Classifier for ScriptedClassifier {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn classify(&mut self, request: &ClassifyRequest) -> Result<ClassificationResult> {
        self.calls += 1;
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        match self.script.pop_front() {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(anyhow!("{} ({})", message, request.reference)),
            None => Err(anyhow!("script exhausted at {}", request.reference)),
        }
    }
}
