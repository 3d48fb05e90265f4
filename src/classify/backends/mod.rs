#[cfg(feature = "classify-http")]
pub mod http;
pub mod labels;
pub mod scripted;

#[cfg(feature = "classify-http")]
pub use http::HttpClassifier;
pub use labels::LabelFileClassifier;
pub use scripted::ScriptedClassifier;
