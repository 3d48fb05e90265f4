//! Classification port.
//!
//! The classifier is an opaque, slow (seconds) and fallible collaborator:
//! given a still image it reports which entities are visible and what each is
//! doing. This module defines the port, converts its results into tracker
//! `Observation`s, and runs calls off the frame loop with a deadline.

mod backend;
mod backends;
mod dispatch;
mod result;

pub use backend::{Classifier, ClassifyRequest, FrameImage};
#[cfg(feature = "classify-http")]
pub use backends::HttpClassifier;
pub use backends::{LabelFileClassifier, ScriptedClassifier};
pub use dispatch::{ClassifyDispatcher, ClassifyOutcome};
pub use result::{ClassificationResult, ClassifiedEntity};
