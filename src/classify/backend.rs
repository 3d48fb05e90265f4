use anyhow::Result;

use crate::classify::result::ClassificationResult;
use crate::frame::Frame;
use crate::Timestamp;

/// Image payload handed to a classifier.
#[derive(Clone, Debug)]
pub enum FrameImage {
    /// Already-encoded JPEG (archive frames).
    Jpeg(Vec<u8>),
    /// Decoded live frame; backends encode as needed.
    Raw(Frame),
}

/// One classification call.
#[derive(Clone, Debug)]
pub struct ClassifyRequest {
    /// Frame reference recorded in sessions (archive filename or live label).
    pub reference: String,
    pub captured_at: Timestamp,
    pub image: FrameImage,
}

impl ClassifyRequest {
    pub fn from_frame(frame: Frame) -> Self {
        Self {
            reference: frame.reference(),
            captured_at: frame.captured_at,
            image: FrameImage::Raw(frame),
        }
    }
}

/// Classification backend trait.
///
/// Implementations may block for seconds and may fail; callers bound them with
/// a deadline (see `ClassifyDispatcher`) and treat any error as "no observation".
/// A backend must be called at most once per gated frame.
pub trait Classifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn classify(&mut self, request: &ClassifyRequest) -> Result<ClassificationResult>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn classify(&mut self, request: &ClassifyRequest) -> Result<ClassificationResult> {
        (**self).classify(request)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
