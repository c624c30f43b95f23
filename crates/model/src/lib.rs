pub mod config;
pub mod encoder;
pub mod head;
pub mod model;

pub use config::{ClassifierHeadKind, EncoderConfig, HeadConfig, ModelConfig, ModelKind};
pub use encoder::{EmbeddingEncoder, Encoder};
pub use head::{ClassifierHead, HeadOutput, RepresentationHead};
pub use model::{ContrastiveModel, Head, ENCODER_PREFIX, HEAD_PREFIX};
