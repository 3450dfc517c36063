// tinywebp: a pure-Rust lossy WebP codec.
//
// The crate covers the VP8 keyframe encoder and decoder, the ALPH alpha
// plane, the animated-WebP canvas engine with its optimizing encoder,
// and just enough RIFF plumbing to read and write complete files. The
// lossless (VP8L) bitstream is reachable only through the back-end
// traits in `backend`.

#![allow(non_upper_case_globals)]

pub mod alpha;
pub mod analysis;
pub mod anim;
pub mod anim_encoder;
pub mod array2d;
pub mod backend;
mod bitcode;
pub mod config;
mod consts;
pub mod costs;
pub mod decoder;
pub mod dsp;
pub mod encoder;
pub mod entropycode;
pub mod enums;
pub mod error;
pub mod frame;
pub mod hls;
pub mod loopfilter;
pub mod proba;
pub mod quant;
pub mod ratectrl;
pub mod rdo;
pub mod residual;
pub mod riff;
pub mod tokens;
pub mod util;
pub mod y4m;
pub mod yuv;

pub use anim::{AnimFrame, Animation, AnimationDecoder, Blend, Dispose};
pub use anim_encoder::AnimEncoder;
pub use array2d::RgbaImage;
pub use backend::{FrameDecoder, LossyBackend, StillEncoder, Vp8lCodec};
pub use config::{AnimEncoderOptions, EncoderConfig};
pub use decoder::{decode_frame, DecodedFrame, Vp8Decoder};
pub use encoder::{new_encoder_from_rgba, new_encoder_from_yuv, EncoderStats, Vp8Encoder};
pub use error::{Error, Result};
pub use riff::assemble_riff;

use backend::FrameDecoder as _;

/// Encode an RGBA image into a complete WebP file. An alpha channel, if
/// present, travels in an ALPH chunk next to the lossy bitstream.
pub fn encode(img: &RgbaImage, cfg: EncoderConfig) -> Result<Vec<u8>> {
  let mut enc = Vp8Encoder::from_rgba(img, cfg)?;
  let vp8 = enc.encode_frame()?;
  if !yuv::has_alpha(img) {
    return Ok(assemble_riff(&vp8));
  }
  let plane = yuv::extract_alpha(img);
  let alph = alpha::alpha_encode(&plane, img.cols(), img.rows(), &alpha::AlphaConfig::default())?;
  let mut w = riff::RiffWriter::new();
  w.push_chunk(&riff::FOURCC_VP8X, &riff::pack_vp8x(riff::FLAG_ALPHA, img.cols(), img.rows()));
  w.push_chunk(&riff::FOURCC_ALPH, &alph);
  w.push_chunk(&riff::FOURCC_VP8, &vp8);
  Ok(w.finalize())
}

/// Decode a still WebP file (plain or extended layout) into RGBA.
pub fn decode(data: &[u8]) -> Result<RgbaImage> {
  let chunks = riff::parse_container(data)?;
  let mut vp8: Option<&[u8]> = None;
  let mut alph: Option<&[u8]> = None;
  for c in &chunks {
    match c.id {
      riff::FOURCC_VP8 => vp8 = Some(c.payload),
      riff::FOURCC_ALPH => alph = Some(c.payload),
      riff::FOURCC_VP8L => return Err(Error::NoDecoder),
      _ => {}
    }
  }
  let vp8 = vp8.ok_or(Error::BadContainer)?;
  let backend = LossyBackend { config: EncoderConfig::default() };
  let alpha_plane = match alph {
    Some(data) => {
      let frame = decoder::decode_frame(vp8)?;
      Some(alpha::alpha_decode(data, frame.width, frame.height)?)
    }
    None => None,
  };
  backend.decode_frame(vp8, alpha_plane.as_deref())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_decode_still_file() {
    let img = RgbaImage::new_with(32, 32, |y, x| {
      [(x * 8) as u8, (y * 8) as u8, 200, 255]
    });
    let file = encode(&img, EncoderConfig::default()).unwrap();
    assert_eq!(&file[0..4], b"RIFF");
    assert_eq!(&file[8..12], b"WEBP");
    let back = decode(&file).unwrap();
    assert_eq!(back.cols(), 32);
    assert_eq!(back.rows(), 32);
  }

  #[test]
  fn alpha_survives_the_container() {
    let img = RgbaImage::new_with(16, 16, |y, _| [50, 100, 150, (y * 16) as u8]);
    let file = encode(&img, EncoderConfig::default()).unwrap();
    let back = decode(&file).unwrap();
    for y in 0..16 {
      assert_eq!(back[y][3][3], (y * 16) as u8);
    }
  }
}
