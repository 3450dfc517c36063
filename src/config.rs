// Encoder and animation-encoder configuration.

use crate::error::{Error, Result};

/// Still-frame encoder configuration.
///
/// Controls quality, effort and the bitstream layout knobs of the VP8
/// encoder. `validate()` clamps the soft ranges and rejects the
/// nonsensical combinations.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
  /// Quality factor (0 = smallest, 100 = best).
  pub quality: f32,

  /// Quality/speed tradeoff (0 = fast, 6 = slower but better).
  /// Methods 3+ enable full rate-distortion selection, 4+ add trellis
  /// quantization and chroma DC error diffusion.
  pub method: u8,

  /// Route frames to an external lossless encoder instead of VP8.
  pub lossless: bool,

  /// Target file size in bytes (0 = disabled). Takes precedence over
  /// `target_psnr` when both are set.
  pub target_size: u32,

  /// Target PSNR in dB (0 = disabled).
  pub target_psnr: f32,

  /// Number of entropy-analysis passes (1..10).
  pub pass: u8,

  /// Maximum number of segments (1..4).
  pub segments: u8,

  /// Spatial noise shaping strength (0..100).
  pub sns_strength: u8,

  /// Deblocking filter strength (0..100).
  pub filter_strength: u8,

  /// Deblocking filter sharpness (0..7).
  pub filter_sharpness: u8,

  /// Filter type: 0 = simple, 1 = complex.
  pub filter_type: u8,

  /// RGB->YUV dithering amplitude (0.0..1.0).
  pub dithering: f32,

  /// log2 of the number of token partitions (0..3).
  pub partitions: u8,

  /// Quality clamps for the target-size/PSNR search.
  pub qmin: u8,
  pub qmax: u8,

  /// Bit 0 enables segment-map smoothing during analysis.
  pub preprocessing: u8,
}

impl Default for EncoderConfig {
  fn default() -> Self {
    Self {
      quality: 75.0,
      method: 4,
      lossless: false,
      target_size: 0,
      target_psnr: 0.0,
      pass: 1,
      segments: 4,
      sns_strength: 50,
      filter_strength: 60,
      filter_sharpness: 0,
      filter_type: 1,
      dithering: 0.0,
      partitions: 0,
      qmin: 0,
      qmax: 100,
      preprocessing: 0,
    }
  }
}

impl EncoderConfig {
  // Clamp soft ranges in place and reject hard errors
  pub fn validate(&mut self) -> Result<()> {
    self.quality = self.quality.clamp(0.0, 100.0);
    self.target_psnr = self.target_psnr.max(0.0);
    self.dithering = self.dithering.clamp(0.0, 1.0);
    if self.method > 6 {
      self.method = 6;
    }
    if self.pass < 1 {
      self.pass = 1;
    }
    if self.pass > 10 {
      self.pass = 10;
    }
    if self.segments < 1 {
      self.segments = 1;
    }
    if self.segments > 4 {
      return Err(Error::BadConfig("segments must be 1..4"));
    }
    if self.sns_strength > 100 {
      self.sns_strength = 100;
    }
    if self.filter_strength > 100 {
      self.filter_strength = 100;
    }
    // out-of-range sharpness saturates on the last filter table row
    if self.filter_sharpness > 7 {
      self.filter_sharpness = 7;
    }
    if self.filter_type > 1 {
      self.filter_type = 1;
    }
    if self.partitions > 3 {
      return Err(Error::BadConfig("partitions must be 0..3 (log2)"));
    }
    if self.qmin > 100 {
      self.qmin = 100;
    }
    if self.qmax > 100 {
      self.qmax = 100;
    }
    if self.qmin > self.qmax {
      return Err(Error::BadConfig("qmin must not exceed qmax"));
    }
    Ok(())
  }
}

/// Options of the animation encoder, on top of the per-frame settings.
#[derive(Debug, Clone)]
pub struct AnimEncoderOptions {
  /// Number of animation loops; 0 means forever. Clamped to 16 bits.
  pub loop_count: i64,

  /// Canvas background color (RGBA), stored in the container only.
  pub background_color: [u8; 4],

  /// Minimum and maximum keyframe spacing. kmax == 0 disables
  /// keyframes, kmax == 1 makes every frame a keyframe.
  pub kmin: u32,
  pub kmax: u32,

  /// Allow trying both lossy and lossless per sub-frame.
  pub allow_mixed: bool,

  /// Settings for the per-frame encodes.
  pub frame_config: EncoderConfig,
}

impl Default for AnimEncoderOptions {
  fn default() -> Self {
    Self {
      loop_count: 0,
      background_color: [255, 255, 255, 255],
      kmin: 9,
      kmax: 17,
      allow_mixed: false,
      frame_config: EncoderConfig::default(),
    }
  }
}

pub fn clamp_loop_count(count: i64) -> u16 {
  count.clamp(0, 0xffff) as u16
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn loop_count_saturates() {
    assert_eq!(clamp_loop_count(-5), 0);
    assert_eq!(clamp_loop_count(0x10000), 0xffff);
    assert_eq!(clamp_loop_count(10), 10);
    // monotone
    let mut prev = 0;
    for v in [-3i64, 0, 1, 100, 0xffff, 0x7fffffff] {
      let c = clamp_loop_count(v);
      assert!(c >= prev);
      prev = c;
    }
  }

  #[test]
  fn validate_clamps_and_rejects() {
    let mut cfg = EncoderConfig::default();
    cfg.quality = 150.0;
    cfg.method = 9;
    cfg.filter_sharpness = 11;
    cfg.validate().unwrap();
    assert_eq!(cfg.quality, 100.0);
    assert_eq!(cfg.method, 6);
    assert_eq!(cfg.filter_sharpness, 7);

    let mut bad = EncoderConfig::default();
    bad.qmin = 80;
    bad.qmax = 20;
    assert!(bad.validate().is_err());
  }
}
