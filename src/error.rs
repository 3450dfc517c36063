// Error surface for the whole crate. Decoder failures are fatal and
// surfaced to the caller; the animation sentinels are matchable constants.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  // Bitstream format errors
  #[error("bad VP8 signature")]
  BadSignature,
  #[error("frame has zero width or height")]
  ZeroDimension,
  #[error("bad partition layout: {0}")]
  BadPartition(&'static str),
  #[error("bitstream truncated mid-decode")]
  PrematureEof,
  #[error("invalid intra 4x4 mode index {0}")]
  InvalidMode(u8),
  #[error("unknown alpha compression method {0}")]
  UnknownAlphaMethod(u8),
  #[error("alpha plane size mismatch: got {got}, want {want}")]
  AlphaSizeMismatch { got: usize, want: usize },
  #[error("not a RIFF/WEBP container")]
  BadContainer,
  #[error("image too large")]
  TooLarge,

  // Animation sentinels
  #[error("animation has no frames")]
  NoFrames,
  #[error("first frame has neither pixels nor bitstream data")]
  NilImage,
  #[error("no frame decoder back-end installed")]
  NoDecoder,
  #[error("no frame encoder back-end installed")]
  NoEncoder,
  #[error("animation encoder already closed")]
  ClosedEncoder,

  // Encoder-side configuration problems
  #[error("invalid encoder configuration: {0}")]
  BadConfig(&'static str),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}
