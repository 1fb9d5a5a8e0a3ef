pub mod error;
pub mod layout;
pub mod normalize;
pub mod paddle;
pub mod pdf;
mod preprocess;
pub mod raster;
pub mod recognizer;
#[cfg(feature = "remote")]
pub mod remote;

pub use error::{NormalizeError, RecognitionError};
pub use normalize::{ImageNormalizer, NormalizeOptions, NormalizerLimits};
pub use paddle::{PaddleOptions, PaddleRecognizer};
pub use raster::{ColorMode, NormalizedImage, SourceFormat};
pub use recognizer::{
    BoundingBox, NoopRecognizer, RecognitionRequest, Recognizer, Token, TokenSink,
};
#[cfg(feature = "remote")]
pub use remote::{RemoteOptions, RemoteRecognizer};
