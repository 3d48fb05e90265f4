use serde::{Deserialize, Serialize};

use crate::{validate_entity_id, Activity, EntityObservation, FrameRef, Observation, Timestamp};

/// Structured result returned by the classification port.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    /// Whether any tracked entity is visible at all.
    #[serde(alias = "entities_present")]
    pub entities_present: bool,
    #[serde(default)]
    pub entities: Vec<ClassifiedEntity>,
    /// Overall confidence of the call.
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedEntity {
    #[serde(alias = "name")]
    pub id: String,
    #[serde(alias = "activity", alias = "activity_label")]
    pub activity_label: String,
    #[serde(default)]
    pub confidence: f32,
}

impl ClassificationResult {
    /// Nothing recognised in the frame.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder-style helper used by tests and label files.
    pub fn with_entity(mut self, id: &str, activity: &str, confidence: f32) -> Self {
        self.entities_present = true;
        self.entities.push(ClassifiedEntity {
            id: id.to_string(),
            activity_label: activity.to_string(),
            confidence,
        });
        self.confidence = self.confidence.max(confidence);
        self
    }

    /// Convert into a tracker observation.
    ///
    /// Entities with an invalid id, an unknown activity label, or a confidence
    /// below `min_confidence` are dropped individually; the rest of the
    /// observation is unaffected.
    pub fn to_observation(&self, reference: &str, at: Timestamp, min_confidence: f32) -> Observation {
        let mut observation = Observation::new(at);
        if !self.entities_present {
            return observation;
        }
        for entity in &self.entities {
            let id = match validate_entity_id(&entity.id) {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("dropping entity from {}: {}", reference, e);
                    continue;
                }
            };
            let activity: Activity = match entity.activity_label.parse() {
                Ok(activity) => activity,
                Err(e) => {
                    log::warn!("dropping {} from {}: {}", id, reference, e);
                    continue;
                }
            };
            if entity.confidence < min_confidence {
                log::debug!(
                    "dropping {} {} from {}: confidence {:.2} < {:.2}",
                    id,
                    activity,
                    reference,
                    entity.confidence,
                    min_confidence
                );
                continue;
            }
            observation.entities.push(EntityObservation {
                entity: id,
                activity,
                frame: FrameRef::new(reference, at, entity.confidence),
            });
        }
        observation
    }

    /// `name:activity` list for log lines, `(none)` when empty.
    pub fn describe(&self) -> String {
        if self.entities.is_empty() {
            return "(none)".to_string();
        }
        self.entities
            .iter()
            .map(|e| format!("{}:{}", e.id, e.activity_label))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_and_snake_case_payloads() {
        let camel: ClassificationResult = serde_json::from_str(
            r#"{"entitiesPresent":true,"entities":[{"id":"Mochi","activityLabel":"eating","confidence":0.9}],"confidence":0.9}"#,
        )
        .unwrap();
        let snake: ClassificationResult = serde_json::from_str(
            r#"{"entities_present":true,"entities":[{"name":"Mochi","activity":"eating","confidence":0.9}],"confidence":0.9}"#,
        )
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.entities[0].activity_label, "eating");
    }

    #[test]
    fn absent_entities_yield_empty_observation() {
        let mut result = ClassificationResult::empty().with_entity("Mochi", "eating", 0.9);
        result.entities_present = false;
        assert!(result.to_observation("f.jpg", 10.0, 0.0).is_empty());
    }

    #[test]
    fn bad_entities_are_dropped_individually() {
        let result = ClassificationResult::empty()
            .with_entity("Mochi", "eating", 0.9)
            .with_entity("Luna", "sleeping", 0.9)
            .with_entity("bad/id", "eating", 0.9)
            .with_entity("小黑", "Drinking", 0.4)
            .with_entity("松花", "present", 0.8);

        let obs = result.to_observation("f.jpg", 42.0, 0.5);
        let kept: Vec<(&str, Activity)> = obs
            .entities
            .iter()
            .map(|e| (e.entity.as_str(), e.activity))
            .collect();
        assert_eq!(kept, vec![("Mochi", Activity::Eating), ("松花", Activity::Present)]);
        assert_eq!(obs.timestamp, 42.0);
        assert_eq!(obs.entities[0].frame, FrameRef::new("f.jpg", 42.0, 0.9));
    }

    #[test]
    fn describe_lists_entities() {
        assert_eq!(ClassificationResult::empty().describe(), "(none)");
        let r = ClassificationResult::empty()
            .with_entity("A", "eating", 1.0)
            .with_entity("B", "present", 1.0);
        assert_eq!(r.describe(), "A:eating, B:present");
    }
}
