use crate::error::RecognitionError;
use crate::raster::NormalizedImage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Axis-aligned box in pixel coordinates of the normalized image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Builds a box from two opposite corners in any order. Negative
    /// coordinates are clamped to zero; non-finite input yields `None`.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Option<Self> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return None;
        }
        let left = x1.min(x2).max(0.0).floor();
        let top = y1.min(y2).max(0.0).floor();
        let right = x1.max(x2).max(0.0).ceil();
        let bottom = y1.max(y2).max(0.0).ceil();
        Some(Self {
            x: saturate(left),
            y: saturate(top),
            width: saturate(right - left),
            height: saturate(bottom - top),
        })
    }

    /// Smallest box covering every point, e.g. a rotated quadrilateral.
    pub fn from_points(points: &[[f64; 2]]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first[0], first[1], first[0], first[1]);
        for [x, y] in rest {
            min_x = min_x.min(*x);
            min_y = min_y.min(*y);
            max_x = max_x.max(*x);
            max_y = max_y.max(*y);
        }
        Self::from_corners(min_x, min_y, max_x, max_y)
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection with `[0, width) x [0, height)`; `None` when nothing remains.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<Self> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let right = self.right().min(width as u64) as u32;
        let bottom = self.bottom().min(height as u64) as u32;
        let clipped = Self::new(self.x, self.y, right - self.x, bottom - self.y);
        (!clipped.is_empty()).then_some(clipped)
    }
}

fn saturate(value: f64) -> u32 {
    // `as` saturates for floats
    value as u32
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl Token {
    pub fn new(text: impl Into<String>, bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            text: text.into(),
            bbox,
            confidence,
        }
    }
}

/// Shared buffer a backend pushes tokens into while it works.
///
/// The caller keeps a clone, so whatever was pushed before a failure or a
/// deadline is still readable afterwards.
#[derive(Debug, Clone, Default)]
pub struct TokenSink {
    tokens: Arc<Mutex<Vec<Token>>>,
}

impl TokenSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, token: Token) {
        self.tokens.lock().push(token);
    }

    pub fn extend(&self, tokens: impl IntoIterator<Item = Token>) {
        self.tokens.lock().extend(tokens);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    pub fn take(&self) -> Vec<Token> {
        std::mem::take(&mut *self.tokens.lock())
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub language: String,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl RecognitionRequest {
    pub fn new(language: impl Into<String>, deadline: Instant) -> Self {
        Self {
            language: language.into(),
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A recognition backend.
///
/// Implementations must be safe to call concurrently, must give up once
/// `request.deadline` passes or `request.cancel` fires, and push every
/// recognized token into `sink`.
#[async_trait]
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when tokens reach the sink while recognition is still running,
    /// which makes a partial result meaningful after a failure.
    fn reports_partial(&self) -> bool {
        false
    }

    async fn warm_up(&self) -> Result<(), RecognitionError> {
        Ok(())
    }

    async fn recognize(
        &self,
        image: Arc<NormalizedImage>,
        request: RecognitionRequest,
        sink: TokenSink,
    ) -> Result<(), RecognitionError>;
}

/// Recognizes nothing. Useful to smoke test a deployment without an engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecognizer;

#[async_trait]
impl Recognizer for NoopRecognizer {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn recognize(
        &self,
        _image: Arc<NormalizedImage>,
        request: RecognitionRequest,
        _sink: TokenSink,
    ) -> Result<(), RecognitionError> {
        if request.cancel.is_cancelled() {
            return Err(RecognitionError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{ColorMode, SourceFormat};

    #[test]
    fn corners_are_normalized() {
        let bbox = BoundingBox::from_corners(30.4, 20.0, 10.0, 5.6).unwrap();
        assert_eq!(bbox, BoundingBox::new(10, 5, 21, 15));
        assert!(BoundingBox::from_corners(f64::NAN, 0.0, 1.0, 1.0).is_none());
        assert_eq!(
            BoundingBox::from_corners(-5.0, -5.0, 4.0, 4.0),
            Some(BoundingBox::new(0, 0, 4, 4))
        );
    }

    #[test]
    fn quadrilateral_points_become_enclosing_box() {
        let bbox = BoundingBox::from_points(&[[12.0, 8.0], [52.0, 10.0], [50.0, 30.0], [10.0, 28.0]])
            .unwrap();
        assert_eq!(bbox, BoundingBox::new(10, 8, 42, 22));
        assert!(BoundingBox::from_points(&[]).is_none());
    }

    #[test]
    fn clipping() {
        let bbox = BoundingBox::new(90, 40, 20, 20);
        assert_eq!(bbox.clip_to(100, 50), Some(BoundingBox::new(90, 40, 10, 10)));
        assert_eq!(bbox.clip_to(90, 50), None);
        assert_eq!(BoundingBox::new(0, 0, 100, 50).clip_to(100, 50), Some(BoundingBox::new(0, 0, 100, 50)));
    }

    #[test]
    fn sink_clones_share_tokens() {
        let sink = TokenSink::new();
        let writer = sink.clone();
        writer.push(Token::new("a", BoundingBox::new(0, 0, 1, 1), 0.5));
        writer.extend([Token::new("b", BoundingBox::new(1, 0, 1, 1), 0.7)]);
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.take().len(), 2);
        assert!(writer.is_empty());
    }

    #[tokio::test]
    async fn noop_recognizer_returns_no_tokens() {
        let image = NormalizedImage::new(vec![0; 4], 2, 2, ColorMode::Luma8, SourceFormat::Png)
            .unwrap();
        let sink = TokenSink::new();
        let request = RecognitionRequest::new("eng", Instant::now() + Duration::from_secs(1));
        NoopRecognizer
            .recognize(Arc::new(image), request, sink.clone())
            .await
            .unwrap();
        assert!(sink.is_empty());
    }
}
