// Quantization: the QFIX=17 fixed-point quantizer with per-type bias and
// sharpening, segment quantizer matrices with their rate-distortion
// lambdas, and the chroma DC error diffusion used at high effort levels.

use crate::consts::*;
use crate::util::clamp;

pub const QFIX: u32 = 17;
pub const MAX_LEVEL: i32 = 2047;

// (DC, AC) bias pairs per matrix type, stored pre-shifted by QFIX-8
const k_bias_matrices: [[u32; 2]; 3] = [
  [96 << 9, 110 << 9], // Y1
  [96 << 9, 108 << 9], // Y2
  [110 << 9, 115 << 9], // UV
];

pub const TYPE_MTX_Y1: usize = 0;
pub const TYPE_MTX_Y2: usize = 1;
pub const TYPE_MTX_UV: usize = 2;

#[derive(Clone, Default)]
pub struct Matrix {
  pub q: [u16; 16],
  pub iq: [u32; 16],
  pub bias: [u32; 16],
  pub zthresh: [u32; 16],
  pub sharpen: [u16; 16],
}

fn quantdiv(coeff: u32, iq: u32, bias: u32) -> i32 {
  ((coeff as u64 * iq as u64 + bias as u64) >> QFIX) as i32
}

impl Matrix {
  // Expand a (dc, ac) pair into the full 16-coefficient matrix and
  // return the average quantizer step (1 part DC, 15 parts AC)
  pub fn expand(dc: u16, ac: u16, mtx_type: usize) -> (Matrix, i32) {
    let mut m = Matrix::default();
    for i in 0..2 {
      let q = if i == 0 { dc } else { ac } as u32;
      m.q[i] = q as u16;
      m.iq[i] = (1 << QFIX) / q;
      m.bias[i] = k_bias_matrices[mtx_type][i];
      m.zthresh[i] = ((1 << QFIX) - 1 - m.bias[i]) / m.iq[i];
    }
    for i in 2..16 {
      m.q[i] = m.q[1];
      m.iq[i] = m.iq[1];
      m.bias[i] = m.bias[1];
      m.zthresh[i] = m.zthresh[1];
    }
    if mtx_type == TYPE_MTX_Y1 {
      for i in 0..16 {
        m.sharpen[i] = ((k_freq_sharpening[i] as u32 * m.q[i] as u32) >> 11) as u16;
      }
    }
    let avg = (m.q[0] as i32 + 15 * m.q[1] as i32 + 8) >> 4;
    (m, avg)
  }
}

// Quantize one 4x4 block. `coeffs` holds the raster-order transform
// output and is replaced by the dequantized reconstruction; `out`
// receives the quantized levels in zigzag order. Returns one past the
// last non-zero zigzag position (so 0 means the block is empty).
// With first == 1 the DC coefficient is skipped and out[0] left at zero.
pub fn quantize_block(coeffs: &mut [i16; 16], out: &mut [i16; 16], mtx: &Matrix, first: usize) -> usize {
  let mut last: i32 = -1;
  for i in 0..first {
    out[i] = 0;
  }
  for n in first..16 {
    let j = k_zigzag[n];
    let sign = coeffs[j] < 0;
    let coeff = (if sign { -coeffs[j] } else { coeffs[j] }) as u32 + mtx.sharpen[j] as u32;
    if coeff > mtx.zthresh[j] {
      let mut level = quantdiv(coeff, mtx.iq[j], mtx.bias[j]);
      if level > MAX_LEVEL {
        level = MAX_LEVEL;
      }
      if sign {
        level = -level;
      }
      coeffs[j] = (level * mtx.q[j] as i32) as i16;
      out[n] = level as i16;
      if level != 0 {
        last = n as i32;
      }
    } else {
      out[n] = 0;
      coeffs[j] = 0;
    }
  }
  (last + 1) as usize
}

// Quantize only the DC coefficient, returning the (scaled-down)
// rounding error. Used by the chroma error diffusion below.
fn quantize_single(v: &mut i16, mtx: &Matrix) -> i32 {
  let mut val = *v as i32;
  let sign = val < 0;
  if sign {
    val = -val;
  }
  if val as u32 > mtx.zthresh[0] {
    let qv = quantdiv(val as u32, mtx.iq[0], mtx.bias[0]) * mtx.q[0] as i32;
    let err = val - qv;
    *v = (if sign { -qv } else { qv }) as i16;
    return (if sign { -err } else { err }) >> DSCALE;
  }
  *v = 0;
  (if sign { -val } else { val }) >> DSCALE
}

// Chroma DC error diffusion (method >= 3).
//
//         | top[0] | top[1]
// --------+--------+--------
// left[0] | blk 0    blk 1      ->  err0 err1
// left[1] | blk 2    blk 3          err2 err3
//
// err1/err2/err3 are kept in `derr` and become the neighbour state of
// the macroblocks to the right and below.
const C1: i32 = 7; // fraction of error sent to the block below
const C2: i32 = 8; // fraction of error sent to the block on the right
const DSHIFT: i32 = 4;
const DSCALE: i32 = 1;

pub fn correct_dc_values(
  uv_coeffs: &mut [[i16; 16]; 8],
  mtx: &Matrix,
  top_derr: &[[i8; 2]; 2],
  left_derr: &[[i8; 2]; 2],
  derr: &mut [[i8; 3]; 2],
) {
  for ch in 0..2 {
    let top = &top_derr[ch];
    let left = &left_derr[ch];
    let base = ch * 4;
    let c0 = (C1 * top[0] as i32 + C2 * left[0] as i32) >> (DSHIFT - DSCALE);
    uv_coeffs[base][0] = uv_coeffs[base][0].wrapping_add(c0 as i16);
    let err0 = quantize_single(&mut uv_coeffs[base][0], mtx);
    let c1 = (C1 * top[1] as i32 + C2 * err0) >> (DSHIFT - DSCALE);
    uv_coeffs[base + 1][0] = uv_coeffs[base + 1][0].wrapping_add(c1 as i16);
    let err1 = quantize_single(&mut uv_coeffs[base + 1][0], mtx);
    let c2 = (C1 * err0 + C2 * left[1] as i32) >> (DSHIFT - DSCALE);
    uv_coeffs[base + 2][0] = uv_coeffs[base + 2][0].wrapping_add(c2 as i16);
    let err2 = quantize_single(&mut uv_coeffs[base + 2][0], mtx);
    let c3 = (C1 * err1 + C2 * err2) >> (DSHIFT - DSCALE);
    uv_coeffs[base + 3][0] = uv_coeffs[base + 3][0].wrapping_add(c3 as i16);
    let err3 = quantize_single(&mut uv_coeffs[base + 3][0], mtx);
    // the error is bounded by the DC quantizer step, so it fits an i8
    // once scaled down by DSCALE
    derr[ch][0] = err1 as i8;
    derr[ch][1] = err2 as i8;
    derr[ch][2] = err3 as i8;
  }
}

pub fn store_diffusion_errors(
  top_derr: &mut [[i8; 2]; 2],
  left_derr: &mut [[i8; 2]; 2],
  derr: &[[i8; 3]; 2],
) {
  for ch in 0..2 {
    left_derr[ch][0] = derr[ch][0];
    left_derr[ch][1] = (3 * derr[ch][2] as i32 >> 2) as i8;
    top_derr[ch][0] = derr[ch][1];
    top_derr[ch][1] = (3 * derr[ch][2] as i32 >> 2) as i8;
  }
}

// ---------------------------------------------------------------------------
// Per-segment quantizers and lambdas

#[derive(Clone, Default)]
pub struct Segment {
  pub quant: i32, // quantizer index, 0..127
  pub y1: Matrix,
  pub y2: Matrix,
  pub uv: Matrix,
  // rate-distortion multipliers
  pub lambda_i4: i32,
  pub lambda_i16: i32,
  pub lambda_uv: i32,
  pub lambda_mode: i32,
  pub tlambda_i4: i32,
  pub tlambda_i16: i32,
  pub tlambda_uv: i32,
  pub tlambda_sd: i32,
  pub fstrength: i32, // deblocking strength, 0..63
  // complexity of the segment, from the analysis pass
  pub alpha: i32,
  pub beta: i32,
}

impl Segment {
  // Build the three quantizer matrices and the lambdas for this
  // segment. `sd_scale` is the SNS strength when texture distortion is
  // active (method >= 4), zero otherwise.
  pub fn setup_matrices(&mut self, dq_uv_dc: i32, dq_uv_ac: i32, sd_scale: i32) {
    let q = self.quant;
    let (y1, q_i4) = Matrix::expand(
      k_dc_table[clamp(q, 0, 127) as usize],
      k_ac_table[clamp(q, 0, 127) as usize],
      TYPE_MTX_Y1,
    );
    let (y2, q_i16) = Matrix::expand(
      k_dc_table[clamp(q, 0, 127) as usize] * 2,
      ac_table2(clamp(q, 0, 127) as usize),
      TYPE_MTX_Y2,
    );
    let (uv, q_uv) = Matrix::expand(
      k_dc_table[clamp(q + dq_uv_dc, 0, 117) as usize],
      k_ac_table[clamp(q + dq_uv_ac, 0, 127) as usize],
      TYPE_MTX_UV,
    );
    self.y1 = y1;
    self.y2 = y2;
    self.uv = uv;
    self.lambda_i4 = crate::util::max(1, (3 * q_i4 * q_i4) >> 7);
    self.lambda_i16 = crate::util::max(1, 3 * q_i16 * q_i16);
    self.lambda_uv = crate::util::max(1, (3 * q_uv * q_uv) >> 6);
    self.lambda_mode = crate::util::max(1, (q_i4 * q_i4) >> 7);
    self.tlambda_i4 = (7 * q_i4 * q_i4) >> 3;
    self.tlambda_i16 = (q_i16 * q_i16) >> 2;
    self.tlambda_uv = 2 * q_uv * q_uv;
    self.tlambda_sd = (sd_scale * q_i4) >> 5;
  }
}

// Dequantization factors used by the decoder, already expanded from the
// frame-header quantizer indices
#[derive(Clone, Copy, Default)]
pub struct DequantFactors {
  pub y1_dc: i32,
  pub y1_ac: i32,
  pub y2_dc: i32,
  pub y2_ac: i32,
  pub uv_dc: i32,
  pub uv_ac: i32,
}

impl DequantFactors {
  pub fn new(base_q: i32, dq_y1_dc: i32, dq_y2_dc: i32, dq_y2_ac: i32, dq_uv_dc: i32, dq_uv_ac: i32) -> Self {
    Self {
      y1_dc: k_dc_table[clamp(base_q + dq_y1_dc, 0, 127) as usize] as i32,
      y1_ac: k_ac_table[clamp(base_q, 0, 127) as usize] as i32,
      y2_dc: k_dc_table[clamp(base_q + dq_y2_dc, 0, 127) as usize] as i32 * 2,
      y2_ac: ac_table2(clamp(base_q + dq_y2_ac, 0, 127) as usize) as i32,
      uv_dc: k_dc_table[clamp(base_q + dq_uv_dc, 0, 117) as usize] as i32,
      uv_ac: k_ac_table[clamp(base_q + dq_uv_ac, 0, 127) as usize] as i32,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_matrix() -> Matrix {
    Matrix::expand(8, 17, TYPE_MTX_UV).0
  }

  #[test]
  fn quantize_zero_is_exact() {
    let mtx = test_matrix();
    let mut coeffs = [0i16; 16];
    let mut out = [0i16; 16];
    assert_eq!(quantize_block(&mut coeffs, &mut out, &mtx, 0), 0);
    assert_eq!(coeffs, [0i16; 16]);
    assert_eq!(out, [0i16; 16]);
  }

  #[test]
  fn quantize_returns_zigzag_last() {
    let mtx = test_matrix();
    let mut coeffs = [0i16; 16];
    // place a value at raster 8, which is zigzag position 3
    coeffs[8] = 100;
    let mut out = [0i16; 16];
    let n = quantize_block(&mut coeffs, &mut out, &mtx, 0);
    assert_eq!(n, 4);
    for m in n..16 {
      assert_eq!(coeffs[k_zigzag[m]], 0);
    }
    assert!(out[3] != 0);
  }

  #[test]
  fn quantize_ac_only_leaves_dc() {
    let mtx = test_matrix();
    let mut coeffs = [200i16; 16];
    let mut out = [0i16; 16];
    quantize_block(&mut coeffs, &mut out, &mtx, 1);
    assert_eq!(out[0], 0);
    // the DC coefficient is skipped, not zeroed; the caller replaces it
    // with the WHT-derived value
    assert_eq!(coeffs[0], 200);
  }

  #[test]
  fn dequant_matches_level_times_step() {
    let mtx = test_matrix();
    let mut coeffs = [0i16; 16];
    coeffs[0] = 77;
    coeffs[1] = -33;
    let mut out = [0i16; 16];
    quantize_block(&mut coeffs, &mut out, &mtx, 0);
    assert_eq!(coeffs[0] as i32, out[0] as i32 * mtx.q[0] as i32);
    assert_eq!(coeffs[1] as i32, out[1] as i32 * mtx.q[1] as i32);
  }

  #[test]
  fn level_clamped_at_max() {
    let (mtx, _) = Matrix::expand(4, 4, TYPE_MTX_Y1);
    let mut coeffs = [0i16; 16];
    coeffs[0] = i16::MAX;
    let mut out = [0i16; 16];
    quantize_block(&mut coeffs, &mut out, &mtx, 0);
    assert!(out[0] as i32 <= MAX_LEVEL);
  }

  #[test]
  fn segment_lambdas_are_positive() {
    let mut s = Segment::default();
    s.quant = 40;
    s.setup_matrices(0, 0, 50);
    assert!(s.lambda_i4 >= 1 && s.lambda_i16 >= 1);
    assert!(s.lambda_uv >= 1 && s.lambda_mode >= 1);
    assert!(s.y2.q[0] == 2 * s.y1.q[0]);
  }
}
