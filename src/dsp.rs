// Copyright (c) 2024-2025, The tinywebp contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause/

// The DSP kernels: forward/inverse 4x4 DCT, the Walsh-Hadamard transform
// of the luma DCs, the intra predictors, and the pixel metrics used by
// the mode search.
//
// Pixel buffers here are BPS-strided scratch areas; a (buffer, offset)
// pair addresses the top-left corner of the block being worked on.

use crate::consts::BPS;
use crate::util::*;

// Pixel value used for a missing top row / left column during prediction
pub const TOP_DEFAULT: u8 = 127;
pub const LEFT_DEFAULT: u8 = 129;

// ---------------------------------------------------------------------------
// Transforms

// Forward 4x4 DCT of (src - pred), both BPS-strided
pub fn ftransform(src: &[u8], src_off: usize, pred: &[u8], pred_off: usize, out: &mut [i16; 16]) {
  let mut tmp = [0i32; 16];
  for i in 0..4 {
    let s = src_off + i * BPS;
    let p = pred_off + i * BPS;
    let d0 = src[s] as i32 - pred[p] as i32;
    let d1 = src[s + 1] as i32 - pred[p + 1] as i32;
    let d2 = src[s + 2] as i32 - pred[p + 2] as i32;
    let d3 = src[s + 3] as i32 - pred[p + 3] as i32;
    let a0 = d0 + d3;
    let a1 = d1 + d2;
    let a2 = d1 - d2;
    let a3 = d0 - d3;
    tmp[0 + i * 4] = (a0 + a1) * 8;
    tmp[2 + i * 4] = (a0 - a1) * 8;
    tmp[1 + i * 4] = (a2 * 2217 + a3 * 5352 + 1812) >> 9;
    tmp[3 + i * 4] = (a3 * 2217 - a2 * 5352 + 937) >> 9;
  }
  for i in 0..4 {
    let a0 = tmp[0 + i] + tmp[12 + i];
    let a1 = tmp[4 + i] + tmp[8 + i];
    let a2 = tmp[4 + i] - tmp[8 + i];
    let a3 = tmp[0 + i] - tmp[12 + i];
    out[0 + i] = ((a0 + a1 + 7) >> 4) as i16;
    out[8 + i] = ((a0 - a1 + 7) >> 4) as i16;
    out[4 + i] = (((a2 * 2217 + a3 * 5352 + 12000) >> 16) + (a3 != 0) as i32) as i16;
    out[12 + i] = ((a3 * 2217 - a2 * 5352 + 51000) >> 16) as i16;
  }
}

fn mul1(a: i32) -> i32 {
  ((a * 20091) >> 16) + a
}

fn mul2(a: i32) -> i32 {
  (a * 35468) >> 16
}

// Inverse 4x4 DCT, added onto the prediction already present in `dst`
pub fn itransform_add(dst: &mut [u8], off: usize, coeffs: &[i16; 16]) {
  let mut tmp = [0i32; 16];
  for i in 0..4 {
    // vertical pass
    let a = coeffs[i] as i32 + coeffs[8 + i] as i32;
    let b = coeffs[i] as i32 - coeffs[8 + i] as i32;
    let c = mul2(coeffs[4 + i] as i32) - mul1(coeffs[12 + i] as i32);
    let d = mul1(coeffs[4 + i] as i32) + mul2(coeffs[12 + i] as i32);
    tmp[0 + i] = a + d;
    tmp[12 + i] = a - d;
    tmp[4 + i] = b + c;
    tmp[8 + i] = b - c;
  }
  for i in 0..4 {
    // horizontal pass
    let dc = tmp[0 + i * 4] + 4;
    let a = dc + tmp[2 + i * 4];
    let b = dc - tmp[2 + i * 4];
    let c = mul2(tmp[1 + i * 4]) - mul1(tmp[3 + i * 4]);
    let d = mul1(tmp[1 + i * 4]) + mul2(tmp[3 + i * 4]);
    let row = off + i * BPS;
    dst[row] = clip_u8(dst[row] as i32 + ((a + d) >> 3));
    dst[row + 1] = clip_u8(dst[row + 1] as i32 + ((b + c) >> 3));
    dst[row + 2] = clip_u8(dst[row + 2] as i32 + ((b - c) >> 3));
    dst[row + 3] = clip_u8(dst[row + 3] as i32 + ((a - d) >> 3));
  }
}

// DC-only inverse: every output pixel moves by the same rounded amount
pub fn itransform_add_dc(dst: &mut [u8], off: usize, dc: i16) {
  let v = (dc as i32 + 4) >> 3;
  for i in 0..4 {
    for j in 0..4 {
      let p = off + i * BPS + j;
      dst[p] = clip_u8(dst[p] as i32 + v);
    }
  }
}

// Forward Walsh-Hadamard transform of the 16 luma DC coefficients
pub fn ftransform_wht(dcs: &[i16; 16], out: &mut [i16; 16]) {
  let mut tmp = [0i32; 16];
  for i in 0..4 {
    let a0 = dcs[0 + i * 4] as i32 + dcs[2 + i * 4] as i32;
    let a1 = dcs[1 + i * 4] as i32 + dcs[3 + i * 4] as i32;
    let a2 = dcs[1 + i * 4] as i32 - dcs[3 + i * 4] as i32;
    let a3 = dcs[0 + i * 4] as i32 - dcs[2 + i * 4] as i32;
    tmp[0 + i * 4] = a0 + a1;
    tmp[1 + i * 4] = a3 + a2;
    tmp[2 + i * 4] = a3 - a2;
    tmp[3 + i * 4] = a0 - a1;
  }
  for i in 0..4 {
    let a0 = tmp[0 + i] + tmp[8 + i];
    let a1 = tmp[4 + i] + tmp[12 + i];
    let a2 = tmp[4 + i] - tmp[12 + i];
    let a3 = tmp[0 + i] - tmp[8 + i];
    let b0 = a0 + a1;
    let b1 = a3 + a2;
    let b2 = a3 - a2;
    let b3 = a0 - a1;
    out[0 + i] = (b0 >> 1) as i16;
    out[4 + i] = (b1 >> 1) as i16;
    out[8 + i] = (b2 >> 1) as i16;
    out[12 + i] = (b3 >> 1) as i16;
  }
}

// Inverse WHT; returns the 16 per-block DC values
pub fn itransform_wht(coeffs: &[i16; 16]) -> [i16; 16] {
  let mut tmp = [0i32; 16];
  let mut out = [0i16; 16];
  for i in 0..4 {
    let a0 = coeffs[0 + i] as i32 + coeffs[12 + i] as i32;
    let a1 = coeffs[4 + i] as i32 + coeffs[8 + i] as i32;
    let a2 = coeffs[4 + i] as i32 - coeffs[8 + i] as i32;
    let a3 = coeffs[0 + i] as i32 - coeffs[12 + i] as i32;
    tmp[0 + i] = a0 + a1;
    tmp[8 + i] = a0 - a1;
    tmp[4 + i] = a3 + a2;
    tmp[12 + i] = a3 - a2;
  }
  for i in 0..4 {
    let dc = tmp[0 + i * 4] + 3;
    let a0 = dc + tmp[3 + i * 4];
    let a1 = tmp[1 + i * 4] + tmp[2 + i * 4];
    let a2 = tmp[1 + i * 4] - tmp[2 + i * 4];
    let a3 = dc - tmp[3 + i * 4];
    out[0 + i * 4] = ((a0 + a1) >> 3) as i16;
    out[1 + i * 4] = ((a3 + a2) >> 3) as i16;
    out[2 + i * 4] = ((a0 - a1) >> 3) as i16;
    out[3 + i * 4] = ((a3 - a2) >> 3) as i16;
  }
  out
}

// ---------------------------------------------------------------------------
// Intra prediction, 16x16 and 8x8

// Neighbouring pixels of a macroblock-sized prediction. A missing side
// takes the fixed edge value (127 above, 129 left).
pub struct PredCtx<'a> {
  pub left: Option<&'a [u8]>,
  pub top: Option<&'a [u8]>,
  pub top_left: u8,
}

fn fill(dst: &mut [u8], off: usize, size: usize, value: u8) {
  for i in 0..size {
    dst[off + i * BPS..off + i * BPS + size].fill(value);
  }
}

fn vertical_pred(dst: &mut [u8], off: usize, top: Option<&[u8]>, size: usize) {
  match top {
    Some(t) => {
      for i in 0..size {
        dst[off + i * BPS..off + i * BPS + size].copy_from_slice(&t[..size]);
      }
    }
    None => fill(dst, off, size, TOP_DEFAULT),
  }
}

fn horizontal_pred(dst: &mut [u8], off: usize, left: Option<&[u8]>, size: usize) {
  match left {
    Some(l) => {
      for i in 0..size {
        dst[off + i * BPS..off + i * BPS + size].fill(l[i]);
      }
    }
    None => fill(dst, off, size, LEFT_DEFAULT),
  }
}

fn true_motion(dst: &mut [u8], off: usize, ctx: &PredCtx, size: usize) {
  match (ctx.left, ctx.top) {
    (Some(l), Some(t)) => {
      for i in 0..size {
        for j in 0..size {
          dst[off + i * BPS + j] = clip_u8(l[i] as i32 + t[j] as i32 - ctx.top_left as i32);
        }
      }
    }
    (Some(_), None) => horizontal_pred(dst, off, ctx.left, size),
    (None, Some(_)) => vertical_pred(dst, off, ctx.top, size),
    (None, None) => fill(dst, off, size, LEFT_DEFAULT),
  }
}

fn dc_pred(dst: &mut [u8], off: usize, ctx: &PredCtx, size: usize) {
  let dc = match (ctx.left, ctx.top) {
    (Some(l), Some(t)) => {
      let mut sum = 0u32;
      for i in 0..size {
        sum += l[i] as u32 + t[i] as u32;
      }
      (sum + size as u32) / (2 * size as u32)
    }
    (Some(l), None) => {
      let mut sum = 0u32;
      for i in 0..size {
        sum += l[i] as u32;
      }
      (sum + size as u32 / 2) / size as u32
    }
    (None, Some(t)) => {
      let mut sum = 0u32;
      for i in 0..size {
        sum += t[i] as u32;
      }
      (sum + size as u32 / 2) / size as u32
    }
    (None, None) => 128,
  };
  fill(dst, off, size, dc as u8);
}

// One of {DC, V, H, TM} over a square block of `size` 16 or 8
pub fn pred_block(dst: &mut [u8], off: usize, mode: u8, ctx: &PredCtx, size: usize) {
  use crate::enums::*;
  match mode {
    DC_PRED => dc_pred(dst, off, ctx, size),
    V_PRED => vertical_pred(dst, off, ctx.top, size),
    H_PRED => horizontal_pred(dst, off, ctx.left, size),
    TM_PRED => true_motion(dst, off, ctx, size),
    _ => unreachable!("bad whole-block prediction mode"),
  }
}

// ---------------------------------------------------------------------------
// Intra prediction, 4x4

// The full neighbourhood of one 4x4 sub-block. top_right carries the
// four pixels above-right; for the rightmost sub-blocks they come from
// the row above the macroblock, per the bitstream's reconstruction rule.
#[derive(Clone, Copy)]
pub struct I4Ctx {
  pub top_left: u8,
  pub top: [u8; 4],
  pub top_right: [u8; 4],
  pub left: [u8; 4],
}

pub fn pred_i4(dst: &mut [u8], off: usize, mode: u8, ctx: &I4Ctx) {
  use crate::enums::*;
  let x = ctx.top_left;
  let [a, b, c, d] = ctx.top;
  let [e, f, g, h] = ctx.top_right;
  let [i, j, k, l] = ctx.left;
  let mut set = |xx: usize, yy: usize, v: u8| {
    dst[off + yy * BPS + xx] = v;
  };
  match mode {
    B_DC_PRED => {
      let mut sum = 4u32;
      for v in ctx.top.iter().chain(ctx.left.iter()) {
        sum += *v as u32;
      }
      let dc = (sum >> 3) as u8;
      for yy in 0..4 {
        for xx in 0..4 {
          set(xx, yy, dc);
        }
      }
    }
    B_TM_PRED => {
      for (yy, lv) in ctx.left.iter().enumerate() {
        for (xx, tv) in ctx.top.iter().enumerate() {
          set(xx, yy, clip_u8(*lv as i32 + *tv as i32 - x as i32));
        }
      }
    }
    B_VE_PRED => {
      let vals = [avg3(x, a, b), avg3(a, b, c), avg3(b, c, d), avg3(c, d, e)];
      for yy in 0..4 {
        for xx in 0..4 {
          set(xx, yy, vals[xx]);
        }
      }
    }
    B_HE_PRED => {
      let vals = [avg3(x, i, j), avg3(i, j, k), avg3(j, k, l), avg3(k, l, l)];
      for yy in 0..4 {
        for xx in 0..4 {
          set(xx, yy, vals[yy]);
        }
      }
    }
    B_RD_PRED => {
      set(0, 3, avg3(j, k, l));
      let v = avg3(i, j, k);
      set(1, 3, v);
      set(0, 2, v);
      let v = avg3(x, i, j);
      set(2, 3, v);
      set(1, 2, v);
      set(0, 1, v);
      let v = avg3(a, x, i);
      set(3, 3, v);
      set(2, 2, v);
      set(1, 1, v);
      set(0, 0, v);
      let v = avg3(b, a, x);
      set(3, 2, v);
      set(2, 1, v);
      set(1, 0, v);
      let v = avg3(c, b, a);
      set(3, 1, v);
      set(2, 0, v);
      set(3, 0, avg3(d, c, b));
    }
    B_VR_PRED => {
      let v = avg2(x, a);
      set(0, 0, v);
      set(1, 2, v);
      let v = avg2(a, b);
      set(1, 0, v);
      set(2, 2, v);
      let v = avg2(b, c);
      set(2, 0, v);
      set(3, 2, v);
      set(3, 0, avg2(c, d));
      set(0, 3, avg3(k, j, i));
      set(0, 2, avg3(j, i, x));
      let v = avg3(i, x, a);
      set(0, 1, v);
      set(1, 3, v);
      let v = avg3(x, a, b);
      set(1, 1, v);
      set(2, 3, v);
      let v = avg3(a, b, c);
      set(2, 1, v);
      set(3, 3, v);
      set(3, 1, avg3(b, c, d));
    }
    B_LD_PRED => {
      set(0, 0, avg3(a, b, c));
      let v = avg3(b, c, d);
      set(1, 0, v);
      set(0, 1, v);
      let v = avg3(c, d, e);
      set(2, 0, v);
      set(1, 1, v);
      set(0, 2, v);
      let v = avg3(d, e, f);
      set(3, 0, v);
      set(2, 1, v);
      set(1, 2, v);
      set(0, 3, v);
      let v = avg3(e, f, g);
      set(3, 1, v);
      set(2, 2, v);
      set(1, 3, v);
      let v = avg3(f, g, h);
      set(3, 2, v);
      set(2, 3, v);
      set(3, 3, avg3(g, h, h));
    }
    B_VL_PRED => {
      set(0, 0, avg2(a, b));
      let v = avg2(b, c);
      set(1, 0, v);
      set(0, 2, v);
      let v = avg2(c, d);
      set(2, 0, v);
      set(1, 2, v);
      let v = avg2(d, e);
      set(3, 0, v);
      set(2, 2, v);
      set(0, 1, avg3(a, b, c));
      let v = avg3(b, c, d);
      set(1, 1, v);
      set(0, 3, v);
      let v = avg3(c, d, e);
      set(2, 1, v);
      set(1, 3, v);
      let v = avg3(d, e, f);
      set(3, 1, v);
      set(2, 3, v);
      set(3, 2, avg3(e, f, g));
      set(3, 3, avg3(f, g, h));
    }
    B_HD_PRED => {
      let v = avg2(i, x);
      set(0, 0, v);
      set(2, 1, v);
      let v = avg2(j, i);
      set(0, 1, v);
      set(2, 2, v);
      let v = avg2(k, j);
      set(0, 2, v);
      set(2, 3, v);
      set(0, 3, avg2(l, k));
      let v = avg3(i, x, a);
      set(1, 0, v);
      set(3, 1, v);
      set(2, 0, avg3(x, a, b));
      set(3, 0, avg3(a, b, c));
      let v = avg3(x, i, j);
      set(1, 1, v);
      set(3, 2, v);
      let v = avg3(i, j, k);
      set(1, 2, v);
      set(3, 3, v);
      set(1, 3, avg3(j, k, l));
    }
    B_HU_PRED => {
      set(0, 0, avg2(i, j));
      let v = avg2(j, k);
      set(2, 0, v);
      set(0, 1, v);
      let v = avg2(k, l);
      set(2, 1, v);
      set(0, 2, v);
      set(1, 0, avg3(i, j, k));
      let v = avg3(j, k, l);
      set(3, 0, v);
      set(1, 1, v);
      let v = avg3(k, l, l);
      set(3, 1, v);
      set(1, 2, v);
      set(2, 2, l);
      set(3, 2, l);
      set(0, 3, l);
      set(1, 3, l);
      set(2, 3, l);
      set(3, 3, l);
    }
    _ => unreachable!("bad 4x4 prediction mode"),
  }
}

// ---------------------------------------------------------------------------
// Metrics

fn sse(a: &[u8], a_off: usize, b: &[u8], b_off: usize, w: usize, h: usize) -> u64 {
  let mut sum = 0u64;
  for i in 0..h {
    for j in 0..w {
      let d = a[a_off + i * BPS + j] as i64 - b[b_off + i * BPS + j] as i64;
      sum += (d * d) as u64;
    }
  }
  sum
}

pub fn sse16x16(a: &[u8], a_off: usize, b: &[u8], b_off: usize) -> u64 {
  sse(a, a_off, b, b_off, 16, 16)
}

pub fn sse16x8(a: &[u8], a_off: usize, b: &[u8], b_off: usize) -> u64 {
  sse(a, a_off, b, b_off, 16, 8)
}

pub fn sse4x4(a: &[u8], a_off: usize, b: &[u8], b_off: usize) -> u64 {
  sse(a, a_off, b, b_off, 4, 4)
}

// Hadamard transform of a 4x4 block, with per-frequency weighting
fn ttransform(input: &[u8], off: usize, w: &[u16; 16]) -> i32 {
  let mut tmp = [0i32; 16];
  for i in 0..4 {
    let p = off + i * BPS;
    let a0 = input[p] as i32 + input[p + 2] as i32;
    let a1 = input[p + 1] as i32 + input[p + 3] as i32;
    let a2 = input[p + 1] as i32 - input[p + 3] as i32;
    let a3 = input[p] as i32 - input[p + 2] as i32;
    tmp[0 + i * 4] = a0 + a1;
    tmp[1 + i * 4] = a3 + a2;
    tmp[2 + i * 4] = a3 - a2;
    tmp[3 + i * 4] = a0 - a1;
  }
  let mut sum = 0i32;
  for i in 0..4 {
    let a0 = tmp[0 + i] + tmp[8 + i];
    let a1 = tmp[4 + i] + tmp[12 + i];
    let a2 = tmp[4 + i] - tmp[12 + i];
    let a3 = tmp[0 + i] - tmp[8 + i];
    sum += w[i] as i32 * abs(a0 + a1);
    sum += w[4 + i] as i32 * abs(a3 + a2);
    sum += w[8 + i] as i32 * abs(a3 - a2);
    sum += w[12 + i] as i32 * abs(a0 - a1);
  }
  sum
}

// Texture distortion: how much the frequency-domain "texture" of two
// blocks differs, used as a secondary distortion term
pub fn tdisto4x4(a: &[u8], a_off: usize, b: &[u8], b_off: usize, w: &[u16; 16]) -> i64 {
  let s1 = ttransform(a, a_off, w);
  let s2 = ttransform(b, b_off, w);
  (abs(s2 - s1) >> 5) as i64
}

pub fn tdisto16x16(a: &[u8], a_off: usize, b: &[u8], b_off: usize, w: &[u16; 16]) -> i64 {
  let mut d = 0i64;
  for y in (0..16).step_by(4) {
    for x in (0..16).step_by(4) {
      d += tdisto4x4(a, a_off + y * BPS + x, b, b_off + y * BPS + x, w);
    }
  }
  d
}

// True when every pixel of a 16x16 source block has the same value
pub fn is_flat_source16(src: &[u8], off: usize) -> bool {
  let v = src[off];
  for i in 0..16 {
    for j in 0..16 {
      if src[off + i * BPS + j] != v {
        return false;
      }
    }
  }
  true
}

// True when the quantized AC levels of `num_blocks` blocks carry at most
// `thresh` non-zero values in total
pub fn is_flat(levels: &[[i16; 16]], thresh: i32) -> bool {
  let mut score = 0;
  for block in levels {
    for i in 1..16 {
      score += (block[i] != 0) as i32;
      if score > thresh {
        return false;
      }
    }
  }
  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::BPS;

  fn buf_with(f: impl Fn(usize, usize) -> u8) -> Vec<u8> {
    let mut b = vec![0u8; BPS * 16];
    for i in 0..16 {
      for j in 0..16 {
        b[i * BPS + j] = f(i, j);
      }
    }
    b
  }

  #[test]
  fn fdct_idct_roundtrip() {
    let src = buf_with(|i, j| (i * 13 + j * 7 + 31) as u8);
    let pred = buf_with(|_, _| 128);
    let mut coeffs = [0i16; 16];
    ftransform(&src, 0, &pred, 0, &mut coeffs);
    let mut recon = pred.clone();
    itransform_add(&mut recon, 0, &coeffs);
    // the integer transform pair is near-lossless on smooth content
    for i in 0..4 {
      for j in 0..4 {
        let d = recon[i * BPS + j] as i32 - src[i * BPS + j] as i32;
        assert!(d.abs() <= 1, "drift {} at ({},{})", d, i, j);
      }
    }
  }

  #[test]
  fn wht_roundtrip_dc_values() {
    let mut dcs = [0i16; 16];
    for i in 0..16 {
      dcs[i] = (i as i16 - 8) * 10;
    }
    let mut coeffs = [0i16; 16];
    ftransform_wht(&dcs, &mut coeffs);
    let back = itransform_wht(&coeffs);
    for i in 0..16 {
      let d = (back[i] - dcs[i]).abs();
      assert!(d <= 1, "wht drift {} at {}", d, i);
    }
  }

  #[test]
  fn dc_pred_flat_block() {
    let mut dst = vec![0u8; BPS * 16];
    let left = [100u8; 16];
    let top = [50u8; 16];
    let ctx = PredCtx { left: Some(&left), top: Some(&top), top_left: 70 };
    pred_block(&mut dst, 0, crate::enums::DC_PRED, &ctx, 16);
    assert_eq!(dst[0], 75);
    assert_eq!(dst[15 * BPS + 15], 75);
  }

  #[test]
  fn dc_pred_no_context_is_128() {
    let mut dst = vec![0u8; BPS * 16];
    let ctx = PredCtx { left: None, top: None, top_left: 0 };
    pred_block(&mut dst, 0, crate::enums::DC_PRED, &ctx, 16);
    assert_eq!(dst[5 * BPS + 5], 128);
  }

  #[test]
  fn tm_pred_gradient() {
    let mut dst = vec![0u8; BPS * 16];
    let left: Vec<u8> = (0..16).map(|i| 100 + i as u8).collect();
    let top: Vec<u8> = (0..16).map(|j| 100 + j as u8).collect();
    let ctx = PredCtx { left: Some(&left), top: Some(&top), top_left: 100 };
    pred_block(&mut dst, 0, crate::enums::TM_PRED, &ctx, 16);
    assert_eq!(dst[0], 100);
    assert_eq!(dst[3 * BPS + 5], 108);
  }

  #[test]
  fn i4_predictors_cover_all_modes() {
    let ctx = I4Ctx {
      top_left: 120,
      top: [100, 110, 120, 130],
      top_right: [140, 150, 160, 170],
      left: [90, 80, 70, 60],
    };
    for mode in 0..crate::enums::NUM_BMODES as u8 {
      let mut dst = vec![0u8; BPS * 4];
      pred_i4(&mut dst, 0, mode, &ctx);
      // every pixel of the 4x4 block must have been written
      for i in 0..4 {
        for j in 0..4 {
          assert!(dst[i * BPS + j] != 0, "mode {} left ({},{}) unset", mode, i, j);
        }
      }
    }
  }

  #[test]
  fn sse_counts_differences() {
    let a = buf_with(|_, _| 10);
    let b = buf_with(|_, _| 12);
    assert_eq!(sse16x16(&a, 0, &b, 0), 4 * 256);
    assert_eq!(sse4x4(&a, 0, &b, 0), 4 * 16);
  }

  #[test]
  fn flatness_probes() {
    let flat = buf_with(|_, _| 99);
    assert!(is_flat_source16(&flat, 0));
    let not_flat = buf_with(|i, j| (i + j) as u8);
    assert!(!is_flat_source16(&not_flat, 0));
    let levels = [[0i16; 16]; 4];
    assert!(is_flat(&levels, 3));
    let mut noisy = [[0i16; 16]; 4];
    for b in noisy.iter_mut() {
      b[1] = 1;
      b[2] = 1;
    }
    assert!(!is_flat(&noisy, 3));
  }
}
