// Encoder analysis pass: estimate the "susceptibility" of every
// macroblock from the shape of its DCT coefficient histogram, cluster
// the values into up to four segments with a small k-means, then derive
// each segment's quantizer, lambdas and filter strength.

use log::debug;

use crate::consts::*;
use crate::dsp;
use crate::dsp::PredCtx;
use crate::enums::NUM_MB_SEGMENTS;
use crate::frame::YuvFrame;
use crate::quant::Segment;
use crate::util::{abs, clamp, max, min};

const MAX_ALPHA: i32 = 255;
const ALPHA_SCALE: i32 = 2 * 255;
const MAX_ITERS_K_MEANS: usize = 6;
const DISPLACEMENT_LIMIT: i32 = 5;

pub struct AnalysisResult {
  pub mb_segments: Vec<u8>,
  pub mb_alphas: Vec<u8>,
  pub centers: [i32; NUM_MB_SEGMENTS],
  pub num_segments: usize,
  pub uv_alpha: i32,
}

struct Histogram {
  distribution: [u32; 32],
}

impl Histogram {
  fn new() -> Self {
    Self { distribution: [0; 32] }
  }

  fn collect_block(&mut self, src: &[u8], src_off: usize, pred: &[u8], pred_off: usize) {
    let mut out = [0i16; 16];
    dsp::ftransform(src, src_off, pred, pred_off, &mut out);
    for v in out {
      let bin = min(abs(v as i32) >> 3, 31) as usize;
      self.distribution[bin] += 1;
    }
  }

  fn alpha(&self) -> i32 {
    let mut max_value = 0i32;
    let mut last_non_zero = 1i32;
    for (k, &v) in self.distribution.iter().enumerate() {
      if v > 0 {
        if v as i32 > max_value {
          max_value = v as i32;
        }
        last_non_zero = k as i32;
      }
    }
    if max_value > 1 {
      ALPHA_SCALE * last_non_zero / max_value
    } else {
      0
    }
  }
}

// Copy one macroblock's luma into a BPS-strided scratch with room for
// the whole 16x16 area
fn import_luma(frame: &YuvFrame, mb_x: usize, mb_y: usize, dst: &mut [u8]) {
  for i in 0..16 {
    let src = (mb_y * 16 + i) * frame.y.stride + mb_x * 16;
    dst[i * BPS..i * BPS + 16].copy_from_slice(&frame.y.data[src..src + 16]);
  }
}

fn import_chroma(frame: &YuvFrame, mb_x: usize, mb_y: usize, du: &mut [u8], dv: &mut [u8]) {
  for i in 0..8 {
    let src = (mb_y * 8 + i) * frame.u.stride + mb_x * 8;
    du[i * BPS..i * BPS + 8].copy_from_slice(&frame.u.data[src..src + 8]);
    dv[i * BPS..i * BPS + 8].copy_from_slice(&frame.v.data[src..src + 8]);
  }
}

// Prediction context straight from the source plane; during analysis
// the source stands in for the reconstruction
fn source_ctx<'a>(
  plane_data: &[u8],
  stride: usize,
  bx: usize,
  by: usize,
  size: usize,
  left_buf: &'a mut [u8; 16],
  top_buf: &'a mut [u8; 16],
) -> (Option<&'a [u8]>, Option<&'a [u8]>, u8) {
  let x0 = bx * size;
  let y0 = by * size;
  let left = if bx > 0 {
    for i in 0..size {
      left_buf[i] = plane_data[(y0 + i) * stride + x0 - 1];
    }
    Some(&left_buf[..size])
  } else {
    None
  };
  let top = if by > 0 {
    top_buf[..size].copy_from_slice(&plane_data[(y0 - 1) * stride + x0..(y0 - 1) * stride + x0 + size]);
    Some(&top_buf[..size])
  } else {
    None
  };
  let top_left = if bx > 0 && by > 0 {
    plane_data[(y0 - 1) * stride + x0 - 1]
  } else if by > 0 {
    dsp::TOP_DEFAULT
  } else {
    dsp::LEFT_DEFAULT
  };
  (left, top, top_left)
}

fn mb_luma_alpha(frame: &YuvFrame, mb_x: usize, mb_y: usize, scratch: &mut [u8], pred: &mut [u8]) -> i32 {
  import_luma(frame, mb_x, mb_y, scratch);
  let mut best = 0;
  let mut left_buf = [0u8; 16];
  let mut top_buf = [0u8; 16];
  let (left, top, top_left) =
    source_ctx(&frame.y.data, frame.y.stride, mb_x, mb_y, 16, &mut left_buf, &mut top_buf);
  for mode in [crate::enums::DC_PRED, crate::enums::TM_PRED] {
    let ctx = PredCtx { left: left, top: top, top_left: top_left };
    dsp::pred_block(pred, 0, mode, &ctx, 16);
    let mut histo = Histogram::new();
    for k in 0..16 {
      let off = (k / 4) * 4 * BPS + (k % 4) * 4;
      histo.collect_block(scratch, off, pred, off);
    }
    best = max(best, histo.alpha());
  }
  best
}

fn mb_uv_alpha(frame: &YuvFrame, mb_x: usize, mb_y: usize, su: &mut [u8], sv: &mut [u8], pred: &mut [u8]) -> i32 {
  import_chroma(frame, mb_x, mb_y, su, sv);
  let mut histo = Histogram::new();
  let mut left_buf = [0u8; 16];
  let mut top_buf = [0u8; 16];
  for (plane, scratch) in [(&frame.u, &mut *su), (&frame.v, &mut *sv)] {
    let (left, top, top_left) =
      source_ctx(&plane.data, plane.stride, mb_x, mb_y, 8, &mut left_buf, &mut top_buf);
    let ctx = PredCtx { left: left, top: top, top_left: top_left };
    dsp::pred_block(pred, 0, crate::enums::DC_PRED, &ctx, 8);
    for b in 0..4 {
      let off = (b / 2) * 4 * BPS + (b % 2) * 4;
      histo.collect_block(scratch, off, pred, off);
    }
  }
  histo.alpha()
}

// K-means over the 256-bin histogram of per-macroblock alphas
fn assign_segments(
  alphas_histo: &[u32; 256],
  nb: usize,
  mb_alphas: &mut [u8],
  mb_segments: &mut [u8],
) -> ([i32; NUM_MB_SEGMENTS], i32) {
  let mut centers = [0i32; NUM_MB_SEGMENTS];
  let mut map = [0u8; 256];

  let mut min_a = 0;
  while min_a < 255 && alphas_histo[min_a] == 0 {
    min_a += 1;
  }
  let mut max_a = 255;
  while max_a > min_a && alphas_histo[max_a] == 0 {
    max_a -= 1;
  }
  let range_a = (max_a - min_a) as i32;

  for k in 0..nb {
    centers[k] = min_a as i32 + ((2 * k as i32 + 1) * range_a) / (2 * nb as i32);
  }

  let mut weighted_average = 0i64;
  for _ in 0..MAX_ITERS_K_MEANS {
    let mut accum = [0i64; NUM_MB_SEGMENTS];
    let mut dist_accum = [0i64; NUM_MB_SEGMENTS];
    let mut n = 0usize;
    for a in min_a..=max_a {
      if alphas_histo[a] == 0 {
        continue;
      }
      while n + 1 < nb && abs(a as i32 - centers[n + 1]) < abs(a as i32 - centers[n]) {
        n += 1;
      }
      map[a] = n as u8;
      dist_accum[n] += a as i64 * alphas_histo[a] as i64;
      accum[n] += alphas_histo[a] as i64;
    }
    let mut displaced = 0i32;
    weighted_average = 0;
    let mut total_weight = 0i64;
    for k in 0..nb {
      if accum[k] == 0 {
        continue;
      }
      let new_center = ((dist_accum[k] + accum[k] / 2) / accum[k]) as i32;
      displaced += abs(centers[k] - new_center);
      centers[k] = new_center;
      weighted_average += new_center as i64 * accum[k];
      total_weight += accum[k];
    }
    if total_weight > 0 {
      weighted_average = (weighted_average + total_weight / 2) / total_weight;
    }
    if displaced < DISPLACEMENT_LIMIT {
      break;
    }
  }

  for i in 0..mb_alphas.len() {
    let s = map[mb_alphas[i] as usize];
    mb_segments[i] = s;
    mb_alphas[i] = centers[s as usize] as u8;
  }
  (centers, weighted_average as i32)
}

// 3x3 majority vote over the segment map
fn smooth_segment_map(mb_segments: &mut [u8], mb_w: usize, mb_h: usize) {
  if mb_w <= 2 || mb_h <= 2 {
    return;
  }
  let mut smoothed = mb_segments.to_vec();
  for y in 1..mb_h - 1 {
    for x in 1..mb_w - 1 {
      let mut counts = [0u8; NUM_MB_SEGMENTS];
      for dy in 0..3 {
        for dx in 0..3 {
          counts[mb_segments[(y + dy - 1) * mb_w + (x + dx - 1)] as usize] += 1;
        }
      }
      let (mut majority, mut best) = (mb_segments[y * mb_w + x], 0);
      for s in 0..NUM_MB_SEGMENTS {
        if counts[s] > best {
          best = counts[s];
          majority = s as u8;
        }
      }
      if best >= 5 {
        smoothed[y * mb_w + x] = majority;
      }
    }
  }
  mb_segments.copy_from_slice(&smoothed);
}

pub fn analyze(frame: &YuvFrame, max_segments: usize, smooth: bool) -> AnalysisResult {
  let (mb_w, mb_h) = (frame.mb_w, frame.mb_h);
  let nb = clamp(max_segments, 1, NUM_MB_SEGMENTS);
  let mut mb_alphas = vec![0u8; mb_w * mb_h];
  let mut mb_segments = vec![0u8; mb_w * mb_h];
  let mut alphas_histo = [0u32; 256];
  let mut uv_alpha_sum = 0i64;

  let mut scratch = vec![0u8; SCRATCH_BYTES];
  let mut su = vec![0u8; SCRATCH_BYTES];
  let mut sv = vec![0u8; SCRATCH_BYTES];
  let mut pred = vec![0u8; SCRATCH_BYTES];

  for mb_y in 0..mb_h {
    for mb_x in 0..mb_w {
      let luma = mb_luma_alpha(frame, mb_x, mb_y, &mut scratch, &mut pred);
      let uv = mb_uv_alpha(frame, mb_x, mb_y, &mut su, &mut sv, &mut pred);
      uv_alpha_sum += uv as i64;
      let mixed = (3 * luma + uv + 2) >> 2;
      let alpha = clamp(MAX_ALPHA - mixed, 0, MAX_ALPHA) as u8;
      mb_alphas[mb_y * mb_w + mb_x] = alpha;
      alphas_histo[alpha as usize] += 1;
    }
  }
  let uv_alpha = (uv_alpha_sum / (mb_w * mb_h) as i64) as i32;

  let (centers, _mid) = assign_segments(&alphas_histo, nb, &mut mb_alphas, &mut mb_segments);
  if smooth && nb > 1 {
    smooth_segment_map(&mut mb_segments, mb_w, mb_h);
  }
  debug!("analysis: {} segments, centers {:?}, uv_alpha {}", nb, &centers[..nb], uv_alpha);
  AnalysisResult {
    mb_segments: mb_segments,
    mb_alphas: mb_alphas,
    centers: centers,
    num_segments: nb,
    uv_alpha: uv_alpha,
  }
}

const SCRATCH_BYTES: usize = 16 * BPS;

// ---------------------------------------------------------------------------
// Segment parameter derivation

fn quality_to_compression(quality: f64) -> f64 {
  let linear_c = if quality < 0.75 { quality * (2.0 / 3.0) } else { 2.0 * quality - 1.0 };
  linear_c.powf(1.0 / 3.0)
}

fn ilevel(sharpness: i32, mut level: i32) -> i32 {
  if sharpness > 0 {
    level >>= if sharpness > 4 { 2 } else { 1 };
    if level > 9 - sharpness {
      level = 9 - sharpness;
    }
  }
  max(level, 1)
}

// Smallest filter level whose threshold covers a quantization step of
// `delta`; the generated map saturates at 63
pub fn strength_from_delta(sharpness: i32, delta: i32) -> i32 {
  let target = 3 * min(delta, 63);
  for level in 0..64 {
    if 2 * level + ilevel(sharpness, level) >= target {
      return level;
    }
  }
  63
}

pub struct SegmentParamsCfg {
  pub quality: f64, // 0..100
  pub sns_strength: i32,
  pub method: i32,
  pub filter_strength: i32,
  pub filter_sharpness: i32,
}

// Derive each segment's quantizer index, lambdas and filter strength
// from the analysis result and the configuration
pub fn set_segment_params(
  res: &AnalysisResult,
  segments: &mut [Segment; NUM_MB_SEGMENTS],
  cfg: &SegmentParamsCfg,
) {
  let nb = res.num_segments;
  // scale the per-segment complexity into alpha (-127..127, around the
  // weighted mean) and beta (0..255, above the minimum)
  let mut lo = res.centers[0];
  let mut hi = res.centers[0];
  let mut mid = 0i64;
  for k in 0..nb {
    lo = min(lo, res.centers[k]);
    hi = max(hi, res.centers[k]);
    mid += res.centers[k] as i64;
  }
  let mid = (mid / nb as i64) as i32;
  let span = if hi == lo { 1 } else { hi - lo };
  for k in 0..nb {
    segments[k].alpha = clamp(255 * (res.centers[k] - mid) / span, -127, 127);
    segments[k].beta = clamp(255 * (res.centers[k] - lo) / span, 0, 255);
  }

  let amp = 0.9 * cfg.sns_strength as f64 / 100.0 / 128.0;
  let c_base = quality_to_compression(cfg.quality / 100.0);
  for k in 0..nb {
    let expn = 1.0 - amp * segments[k].alpha as f64;
    assert!(expn > 0.0);
    let c = c_base.powf(expn);
    segments[k].quant = clamp((127.0 * (1.0 - c)) as i32, 0, 127);
  }

  let dq_uv_ac = clamp(
    (res.uv_alpha - 64) * 10 / 70 * cfg.sns_strength / 100,
    -4,
    6,
  );
  let dq_uv_dc = clamp(-4 * cfg.sns_strength / 100, -15, 15);
  let sd_scale = if cfg.method >= 4 { cfg.sns_strength } else { 0 };

  let level0 = 5 * cfg.filter_strength;
  for k in 0..nb {
    segments[k].setup_matrices(dq_uv_dc, dq_uv_ac, sd_scale);
    let qstep = k_ac_table[clamp(segments[k].quant, 0, 127) as usize] as i32 >> 2;
    let base_strength = strength_from_delta(cfg.filter_sharpness, qstep);
    let f = base_strength * level0 / (256 + segments[k].beta);
    segments[k].fstrength = if f < 2 { 0 } else { min(f, 63) };
  }
}

// Merge segments that ended up with identical coding parameters.
// Returns the new segment count.
pub fn simplify_segments(
  segments: &mut [Segment; NUM_MB_SEGMENTS],
  num_segments: usize,
  mb_segments: &mut [u8],
) -> usize {
  let mut map = [0usize; NUM_MB_SEGMENTS];
  let mut num_final = 1usize;
  for s1 in 1..num_segments {
    let mut found = None;
    for s2 in 0..num_final {
      if segments[s2].quant == segments[s1].quant && segments[s2].fstrength == segments[s1].fstrength {
        found = Some(s2);
        break;
      }
    }
    match found {
      Some(s2) => map[s1] = s2,
      None => {
        if num_final != s1 {
          segments[num_final] = segments[s1].clone();
        }
        map[s1] = num_final;
        num_final += 1;
      }
    }
  }
  if num_final < num_segments {
    for s in mb_segments.iter_mut() {
      *s = map[*s as usize] as u8;
    }
  }
  num_final
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::array2d::RgbaImage;
  use crate::yuv::import_rgba;

  #[test]
  fn flat_image_is_low_complexity() {
    let img = RgbaImage::new_with(64, 64, |_, _| [90, 90, 90, 255]);
    let frame = import_rgba(&img, 0.0);
    let res = analyze(&frame, 4, false);
    // flat content: every macroblock ends up maximally "easy"
    assert!(res.mb_alphas.iter().all(|&a| a >= 250));
  }

  #[test]
  fn noisy_region_separates_from_flat() {
    let img = RgbaImage::new_with(64, 64, |y, x| {
      if x < 32 {
        [128, 128, 128, 255]
      } else {
        let v = ((x * 37 + y * 101) % 256) as u8;
        [v, 255 - v, v ^ 0x55, 255]
      }
    });
    let frame = import_rgba(&img, 0.0);
    let res = analyze(&frame, 4, false);
    let (mb_w, _) = (frame.mb_w, frame.mb_h);
    let flat_seg = res.mb_segments[0];
    let noisy_seg = res.mb_segments[mb_w - 1];
    assert_ne!(flat_seg, noisy_seg);
  }

  #[test]
  fn quality_monotone_in_quant() {
    let res = AnalysisResult {
      mb_segments: vec![0],
      mb_alphas: vec![128],
      centers: [128, 0, 0, 0],
      num_segments: 1,
      uv_alpha: 64,
    };
    let mut q_prev = 128;
    for quality in [10.0, 40.0, 75.0, 95.0] {
      let mut segs: [Segment; 4] = Default::default();
      set_segment_params(
        &res,
        &mut segs,
        &SegmentParamsCfg {
          quality: quality,
          sns_strength: 50,
          method: 4,
          filter_strength: 60,
          filter_sharpness: 0,
        },
      );
      assert!(segs[0].quant < q_prev, "quant must fall as quality rises");
      q_prev = segs[0].quant;
    }
  }

  #[test]
  fn identical_segments_merge() {
    let mut segs: [Segment; 4] = Default::default();
    for s in segs.iter_mut() {
      s.quant = 33;
      s.fstrength = 7;
    }
    let mut ids = vec![0u8, 1, 2, 3, 3, 2, 1, 0];
    let n = simplify_segments(&mut segs, 4, &mut ids);
    assert_eq!(n, 1);
    assert!(ids.iter().all(|&s| s == 0));
  }

  #[test]
  fn strength_from_delta_monotone() {
    for s in 0..8 {
      let mut prev = 0;
      for d in 0..64 {
        let v = strength_from_delta(s, d);
        assert!(v >= prev);
        assert!(v <= 63);
        prev = v;
      }
    }
  }
}
