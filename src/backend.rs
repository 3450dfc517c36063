// Capability seams toward the codecs this crate does not implement
// itself. The animation encoder and the alpha plane route through these
// traits; a missing back-end surfaces as NoEncoder/NoDecoder.

use crate::array2d::RgbaImage;
use crate::config::EncoderConfig;
use crate::error::{Error, Result};

// The external lossless (VP8L) codec, also used as the alpha back-end
pub trait Vp8lCodec {
  fn encode_argb(&self, width: usize, height: usize, argb: &[u32]) -> Result<Vec<u8>>;
  fn decode(&self, payload: &[u8]) -> Result<RgbaImage>;
}

// Produces the payload of one still frame (VP8 or VP8L bitstream,
// without any ALPH prefix)
pub trait StillEncoder {
  fn encode_frame(&self, image: &RgbaImage, lossless: bool, quality: f32) -> Result<Vec<u8>>;

  // Complete RIFF file for the single-frame collapse
  fn encode_simple(&self, image: &RgbaImage, lossless: bool, quality: f32) -> Result<Vec<u8>>;
}

// Materializes pixels out of a frame payload
pub trait FrameDecoder {
  fn decode_frame(&self, payload: &[u8], alpha: Option<&[u8]>) -> Result<RgbaImage>;
}

// The built-in lossy path: VP8 encode/decode from this crate, raw alpha,
// no VP8L
pub struct LossyBackend {
  pub config: EncoderConfig,
}

impl StillEncoder for LossyBackend {
  fn encode_frame(&self, image: &RgbaImage, lossless: bool, quality: f32) -> Result<Vec<u8>> {
    if lossless {
      return Err(Error::NoEncoder);
    }
    let mut cfg = self.config.clone();
    cfg.quality = quality;
    let mut enc = crate::encoder::Vp8Encoder::from_rgba(image, cfg)?;
    enc.encode_frame()
  }

  fn encode_simple(&self, image: &RgbaImage, lossless: bool, quality: f32) -> Result<Vec<u8>> {
    let vp8 = self.encode_frame(image, lossless, quality)?;
    Ok(crate::riff::assemble_riff(&vp8))
  }
}

impl FrameDecoder for LossyBackend {
  fn decode_frame(&self, payload: &[u8], alpha: Option<&[u8]>) -> Result<RgbaImage> {
    let frame = crate::decoder::decode_frame(payload)?;
    let mut img = RgbaImage::new_with(frame.height, frame.width, |y, x| {
      let yy = frame.y[y * frame.y_stride + x];
      let u = frame.u[(y / 2) * frame.uv_stride + x / 2];
      let v = frame.v[(y / 2) * frame.uv_stride + x / 2];
      let [r, g, b] = crate::yuv::yuv_to_rgb(yy, u, v);
      [r, g, b, 255]
    });
    if let Some(plane) = alpha {
      if plane.len() != frame.width * frame.height {
        return Err(Error::AlphaSizeMismatch {
          got: plane.len(),
          want: frame.width * frame.height,
        });
      }
      for y in 0..frame.height {
        for x in 0..frame.width {
          img[y][x][3] = plane[y * frame.width + x];
        }
      }
    }
    Ok(img)
  }
}
