// Copyright (c) 2024-2025, The tinywebp contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause/

// Rate-distortion mode selection. Scores are 256*distortion + lambda*rate
// with rate in 1/256-bit units; the intra-16, intra-4 and chroma searches
// each run against their segment's lambda, and the final intra-16 vs
// intra-4 arbitration is re-scored with the mode lambda.

use crate::consts::*;
use crate::costs::{bit_cost, residual_cost, CostModel, Residual};
use crate::dsp;
use crate::dsp::{I4Ctx, PredCtx};
use crate::enums::*;
use crate::proba::{Proba, PROBA_IS_I16};
use crate::quant::Segment;
use crate::residual::*;

const FLATNESS_LIMIT_I16: i32 = 10;
const FLATNESS_LIMIT_I4: i32 = 3;
const FLATNESS_PENALTY: u64 = 140;
// empirical per-macroblock budget for intra-4 mode signaling
const MAX_I4_HEADER_BITS: u64 = 15000;

// Neighbouring pixels and modes of the macroblock under decision
pub struct MbBorders {
  pub x: usize,
  pub y: usize,
  pub mb_w: usize,
  pub y_left: [u8; 16],
  pub u_left: [u8; 8],
  pub v_left: [u8; 8],
  pub y_top: [u8; 20], // 16 pixels plus the 4 top-right ones
  pub u_top: [u8; 8],
  pub v_top: [u8; 8],
  pub y_top_left: u8,
  pub u_top_left: u8,
  pub v_top_left: u8,
  pub top_modes: [u8; 4],
  pub left_modes: [u8; 4],
}

pub struct RdParams<'a> {
  pub seg: &'a Segment,
  pub costs: &'a CostModel,
  pub proba: &'a Proba,
  pub method: i32,
  pub quality: i32,
  pub top_nz: [u8; 9],
  pub left_nz: [u8; 9],
  pub left_dc: u8,
  pub top_derr: [[i8; 2]; 2],
  pub left_derr: [[i8; 2]; 2],
}

// Everything the later stages need to emit this macroblock. When
// `pred_cached` is set the reconstruction already sits in the caller's
// output scratch and the level arrays are valid; otherwise the residual
// stage must recompute them from the chosen modes.
pub struct ModeScore {
  pub is_i4: bool,
  pub mode_i16: u8,
  pub modes_i4: [u8; 16],
  pub mode_uv: u8,
  pub levels_y: [[i16; 16]; 16],
  pub levels_dc: [i16; 16],
  pub levels_uv: [[i16; 16]; 8],
  pub counts_y: [u8; 16],
  pub counts_uv: [u8; 8],
  pub count_dc: u8,
  pub nz: u32,
  pub derr: [[i8; 3]; 2],
  pub pred_cached: bool,
  pub i4_cached: bool,
}

impl ModeScore {
  fn new() -> Self {
    Self {
      is_i4: false,
      mode_i16: DC_PRED,
      modes_i4: [B_DC_PRED; 16],
      mode_uv: DC_PRED,
      levels_y: [[0; 16]; 16],
      levels_dc: [0; 16],
      levels_uv: [[0; 16]; 8],
      counts_y: [0; 16],
      counts_uv: [0; 8],
      count_dc: 0,
      nz: 0,
      derr: [[0; 3]; 2],
      pred_cached: false,
      i4_cached: false,
    }
  }
}

pub fn build_nz(is_i4: bool, counts_y: &[u8; 16], counts_uv: &[u8; 8], count_dc: u8) -> u32 {
  let first = if is_i4 { 0 } else { 1 };
  let mut nz = 0u32;
  for k in 0..16 {
    nz |= ((counts_y[k] > first) as u32) << k;
  }
  for b in 0..8 {
    nz |= ((counts_uv[b] > 0) as u32) << (16 + b);
  }
  if !is_i4 {
    nz |= ((count_dc > 0) as u32) << 24;
  }
  nz
}

fn rd_score(lambda: i64, r: u64, h: u64, d: i64, sd: i64) -> i64 {
  (r + h) as i64 * lambda + 256 * (d + sd)
}

// Token cost of the 16 luma AC blocks plus the WHT block
fn cost_luma16(score: &ModeScore, p: &RdParams) -> u64 {
  let mut cost = 0u64;
  let ctx_dc = (p.top_nz[8] + p.left_dc) as usize;
  cost += residual_cost(
    &Residual { coeff_type: TYPE_Y2, first: 0, last: score.count_dc as i32 - 1, coeffs: &score.levels_dc },
    ctx_dc,
    p.costs,
    p.proba,
  );
  let mut tnz = p.top_nz;
  let mut lnz = p.left_nz;
  for k in 0..16 {
    let (by, bx) = (k / 4, k % 4);
    let ctx = (tnz[bx] + lnz[by]) as usize;
    cost += residual_cost(
      &Residual {
        coeff_type: TYPE_Y_AFTER_Y2,
        first: 1,
        last: score.counts_y[k] as i32 - 1,
        coeffs: &score.levels_y[k],
      },
      ctx,
      p.costs,
      p.proba,
    );
    let nz = (score.counts_y[k] > 1) as u8;
    tnz[bx] = nz;
    lnz[by] = nz;
  }
  cost
}

fn cost_uv(levels_uv: &[[i16; 16]; 8], counts_uv: &[u8; 8], p: &RdParams) -> u64 {
  let mut cost = 0u64;
  let mut tnz = p.top_nz;
  let mut lnz = p.left_nz;
  for ch in [0usize, 2] {
    for y in 0..2 {
      for x in 0..2 {
        let b = 2 * ch + y * 2 + x;
        let ctx = (tnz[4 + ch + x] + lnz[4 + ch + y]) as usize;
        cost += residual_cost(
          &Residual { coeff_type: TYPE_UV, first: 0, last: counts_uv[b] as i32 - 1, coeffs: &levels_uv[b] },
          ctx,
          p.costs,
          p.proba,
        );
        let nz = (counts_uv[b] > 0) as u8;
        tnz[4 + ch + x] = nz;
        lnz[4 + ch + y] = nz;
      }
    }
  }
  cost
}

fn mult_8b(a: i64, b: i64) -> i64 {
  (a * b + 128) >> 8
}

// Candidate intra-16 modes given the frame borders. Modes whose context
// row or column does not exist are not probed.
fn i16_candidates(x: usize, y: usize) -> &'static [u8] {
  match (x > 0, y > 0) {
    (true, true) => &[DC_PRED, V_PRED, H_PRED, TM_PRED],
    (false, true) => &[DC_PRED, V_PRED],
    (true, false) => &[DC_PRED, H_PRED],
    (false, false) => &[DC_PRED],
  }
}

fn pick_best_intra16(
  src: &[u8; SCRATCH_SIZE],
  out: &mut [u8; SCRATCH_SIZE],
  borders: &MbBorders,
  p: &RdParams,
  score: &mut ModeScore,
  trellis: Option<&TrellisParams>,
) -> i64 {
  let seg = p.seg;
  let flat_src = dsp::is_flat_source16(src, Y_OFF);
  let forced: [u8; 1];
  // border flatness override against checkerboarding; the predictors
  // fall back to the edge constants where context is missing
  let candidates: &[u8] = if flat_src && (borders.x == 0 || borders.y == 0) {
    forced = [if borders.x == 0 { DC_PRED } else { V_PRED }];
    &forced
  } else {
    i16_candidates(borders.x, borders.y)
  };

  let mut pred = [0u8; SCRATCH_SIZE];
  let mut trial = [0u8; SCRATCH_SIZE];
  let mut best_score = i64::MAX;
  let mut best = ModeScore::new();

  for &mode in candidates {
    let ctx = PredCtx {
      left: if borders.x > 0 { Some(&borders.y_left) } else { None },
      top: if borders.y > 0 { Some(&borders.y_top[..16]) } else { None },
      top_left: borders.y_top_left,
    };
    dsp::pred_block(&mut pred, Y_OFF, mode, &ctx, 16);
    let mut cur = ModeScore::new();
    cur.mode_i16 = mode;
    cur.count_dc = reconstruct_i16(
      src,
      &pred,
      Y_OFF,
      &mut trial,
      seg,
      &(p.top_nz, p.left_nz),
      &mut cur.levels_y,
      &mut cur.levels_dc,
      &mut cur.counts_y,
      trellis,
    );
    let mut d = dsp::sse16x16(src, Y_OFF, &trial, Y_OFF) as i64;
    let mut sd = if seg.tlambda_sd > 0 {
      mult_8b(seg.tlambda_sd as i64, dsp::tdisto16x16(src, Y_OFF, &trial, Y_OFF, &k_weight_y))
    } else {
      0
    };
    if flat_src && dsp::is_flat(&cur.levels_y, FLATNESS_LIMIT_I16) {
      // for very flat content, double down on distortion
      d *= 2;
      sd *= 2;
    }
    let h = p.costs.cost_i16[mode as usize] as u64;
    let r = cost_luma16(&cur, p);
    let s = rd_score(seg.lambda_i16 as i64, r, h, d, sd);
    if s < best_score {
      best_score = s;
      best = cur;
      best.pred_cached = true;
      for i in 0..16 {
        out[Y_OFF + i * BPS..Y_OFF + i * BPS + 16]
          .copy_from_slice(&trial[Y_OFF + i * BPS..Y_OFF + i * BPS + 16]);
      }
    }
  }
  // re-score the winner with the arbitration lambda for the i4 duel
  let h = p.costs.cost_i16[best.mode_i16 as usize] as u64;
  let r = cost_luma16(&best, p);
  let d = dsp::sse16x16(src, Y_OFF, out, Y_OFF) as i64;
  let mode_score = rd_score(seg.lambda_mode as i64, r, h, d, 0);
  score.is_i4 = false;
  score.mode_i16 = best.mode_i16;
  score.levels_y = best.levels_y;
  score.levels_dc = best.levels_dc;
  score.counts_y = best.counts_y;
  score.count_dc = best.count_dc;
  score.pred_cached = true;
  mode_score
}

// Assemble the 4x4 context out of the bordered working buffer, with the
// macroblock's own top row feeding every rightmost sub-block
fn i4_ctx_from(yb: &[u8; BPS * 17], k: usize) -> I4Ctx {
  let (by, bx) = (k / 4, k % 4);
  let row = by * 4;
  let col = 1 + bx * 4;
  let mut ctx = I4Ctx { top_left: yb[row * BPS + col - 1], top: [0; 4], top_right: [0; 4], left: [0; 4] };
  for j in 0..4 {
    ctx.top[j] = yb[row * BPS + col + j];
  }
  if bx == 3 {
    for j in 0..4 {
      ctx.top_right[j] = yb[17 + j];
    }
  } else {
    for j in 0..4 {
      ctx.top_right[j] = yb[row * BPS + col + 4 + j];
    }
  }
  for i in 0..4 {
    ctx.left[i] = yb[(1 + by * 4 + i) * BPS + col - 1];
  }
  ctx
}

fn pick_best_intra4(
  src: &[u8; SCRATCH_SIZE],
  out: &mut [u8; SCRATCH_SIZE],
  borders: &MbBorders,
  p: &RdParams,
  score: &mut ModeScore,
  i16_mode_score: i64,
  trellis: Option<&TrellisParams>,
) -> bool {
  let seg = p.seg;
  // bordered working buffer seeded like the decoder's reconstruction
  let mut yb = [0u8; BPS * 17];
  yb[0] = borders.y_top_left;
  for j in 0..16 {
    yb[1 + j] = if borders.y > 0 { borders.y_top[j] } else { dsp::TOP_DEFAULT };
  }
  for j in 0..4 {
    yb[17 + j] = if borders.y > 0 { borders.y_top[16 + j] } else { dsp::TOP_DEFAULT };
  }
  for i in 0..16 {
    yb[(1 + i) * BPS] = if borders.x > 0 { borders.y_left[i] } else { dsp::LEFT_DEFAULT };
  }

  let num_candidates = if p.quality >= 50 { 3 } else { 2 };
  let mut sum_h: u64 = bit_cost(0, PROBA_IS_I16);
  let mut sum_r: u64 = 0;
  let mut sum_d: i64 = 0;

  let mut modes = [B_DC_PRED; 16];
  let mut levels = [[0i16; 16]; 16];
  let mut counts = [0u8; 16];
  let mut tnz = p.top_nz;
  let mut lnz = p.left_nz;

  for k in 0..16 {
    let (by, bx) = (k / 4, k % 4);
    let src_off = Y_OFF + y_blk_off(k);
    let ctx = i4_ctx_from(&yb, k);
    let top_mode = if by == 0 { borders.top_modes[bx] } else { modes[(by - 1) * 4 + bx] };
    let left_mode = if bx == 0 { borders.left_modes[by] } else { modes[by * 4 + bx - 1] };
    let nz_ctx = (tnz[bx] + lnz[by]) as usize;

    // cheap pre-screen on prediction error, full RD on the survivors
    let mut order: [(u64, u8); NUM_BMODES] = [(0, 0); NUM_BMODES];
    let mut pred_strip = [0u8; BPS * 8];
    for m in 0..NUM_BMODES {
      let off = (m / 8) * 4 * BPS + (m % 8) * 4;
      dsp::pred_i4(&mut pred_strip, off, m as u8, &ctx);
      order[m] = (dsp::sse4x4(src, src_off, &pred_strip, off), m as u8);
    }
    order.sort_by_key(|&(e, _)| e);

    let mut best_block: Option<(i64, u8, [i16; 16], usize, [u8; BPS * 4])> = None;
    for &(_, mode) in order.iter().take(num_candidates) {
      let m = mode as usize;
      let off = (m / 8) * 4 * BPS + (m % 8) * 4;
      let mut tmp_dst = [0u8; BPS * 4];
      for i in 0..4 {
        for j in 0..4 {
          tmp_dst[i * BPS + j] = pred_strip[off + i * BPS + j];
        }
      }
      let mut blk_levels = [0i16; 16];
      let n = reconstruct_i4(src, src_off, &mut tmp_dst, 0, seg, nz_ctx, &mut blk_levels, trellis);
      let d = dsp::sse4x4(src, src_off, &tmp_dst, 0) as i64;
      let sd = if seg.tlambda_sd > 0 {
        mult_8b(seg.tlambda_sd as i64, dsp::tdisto4x4(src, src_off, &tmp_dst, 0, &k_weight_y))
      } else {
        0
      };
      let mut r = residual_cost(
        &Residual { coeff_type: TYPE_Y_NO_Y2, first: 0, last: n as i32 - 1, coeffs: &blk_levels },
        nz_ctx,
        p.costs,
        p.proba,
      );
      if mode > 0 && dsp::is_flat(std::slice::from_ref(&blk_levels), FLATNESS_LIMIT_I4) {
        r += FLATNESS_PENALTY;
      }
      let h = p.costs.cost_i4[top_mode as usize][left_mode as usize][m] as u64;
      let s = rd_score(seg.lambda_i4 as i64, r + h, 0, d + sd, 0);
      if best_block.as_ref().map_or(true, |&(bs, ..)| s < bs) {
        best_block = Some((s, mode, blk_levels, n, tmp_dst));
      }
    }

    let (_, mode, blk_levels, n, tmp_dst) = best_block.unwrap();
    let m = mode as usize;
    modes[k] = mode;
    levels[k] = blk_levels;
    counts[k] = n as u8;
    sum_h += p.costs.cost_i4[top_mode as usize][left_mode as usize][m] as u64;
    sum_r += residual_cost(
      &Residual { coeff_type: TYPE_Y_NO_Y2, first: 0, last: n as i32 - 1, coeffs: &blk_levels },
      nz_ctx,
      p.costs,
      p.proba,
    );
    sum_d += dsp::sse4x4(src, src_off, &tmp_dst, 0) as i64;

    // early out: the accumulated intra-4 score already lost to intra-16
    let total = rd_score(seg.lambda_mode as i64, sum_r, sum_h, sum_d, 0);
    if total >= i16_mode_score || sum_h > MAX_I4_HEADER_BITS {
      return false;
    }

    // commit the winner into the working buffer for later contexts
    let dst_off = (1 + by * 4) * BPS + 1 + bx * 4;
    for i in 0..4 {
      for j in 0..4 {
        yb[dst_off + i * BPS + j] = tmp_dst[i * BPS + j];
      }
    }
    let nz = (n > 0) as u8;
    tnz[bx] = nz;
    lnz[by] = nz;
  }

  // intra-4 wins: move the reconstruction and decisions out
  for i in 0..16 {
    for j in 0..16 {
      out[Y_OFF + i * BPS + j] = yb[(1 + i) * BPS + 1 + j];
    }
  }
  score.is_i4 = true;
  score.modes_i4 = modes;
  score.levels_y = levels;
  score.counts_y = counts;
  score.count_dc = 0;
  score.levels_dc = [0; 16];
  score.i4_cached = true;
  score.pred_cached = true;
  true
}

fn pick_best_uv(
  src: &[u8; SCRATCH_SIZE],
  out: &mut [u8; SCRATCH_SIZE],
  borders: &MbBorders,
  p: &RdParams,
  score: &mut ModeScore,
  do_diffusion: bool,
  trellis: Option<&TrellisParams>,
) {
  let seg = p.seg;
  let mut pred = [0u8; SCRATCH_SIZE];
  let mut trial = [0u8; SCRATCH_SIZE];
  let mut best_score = i64::MAX;

  for &mode in i16_candidates(borders.x, borders.y) {
    let ctx_u = PredCtx {
      left: if borders.x > 0 { Some(&borders.u_left) } else { None },
      top: if borders.y > 0 { Some(&borders.u_top) } else { None },
      top_left: borders.u_top_left,
    };
    let ctx_v = PredCtx {
      left: if borders.x > 0 { Some(&borders.v_left) } else { None },
      top: if borders.y > 0 { Some(&borders.v_top) } else { None },
      top_left: borders.v_top_left,
    };
    dsp::pred_block(&mut pred, U_OFF, mode, &ctx_u, 8);
    dsp::pred_block(&mut pred, V_OFF, mode, &ctx_v, 8);
    let mut levels_uv = [[0i16; 16]; 8];
    let mut counts_uv = [0u8; 8];
    let mut derr = [[0i8; 3]; 2];
    let diffusion = if do_diffusion {
      Some((&p.top_derr, &p.left_derr, &mut derr))
    } else {
      None
    };
    reconstruct_uv(
      src,
      &pred,
      U_OFF,
      V_OFF,
      &mut trial,
      seg,
      &(p.top_nz, p.left_nz),
      &mut levels_uv,
      &mut counts_uv,
      diffusion,
      trellis,
    );
    let d = dsp::sse16x8(src, U_OFF, &trial, U_OFF) as i64;
    let h = p.costs.cost_uv[mode as usize] as u64;
    let r = cost_uv(&levels_uv, &counts_uv, p);
    let s = rd_score(seg.lambda_uv as i64, r, h, d, 0);
    if s < best_score {
      best_score = s;
      score.mode_uv = mode;
      score.levels_uv = levels_uv;
      score.counts_uv = counts_uv;
      score.derr = derr;
      for i in 0..8 {
        out[U_OFF + i * BPS..U_OFF + i * BPS + 8]
          .copy_from_slice(&trial[U_OFF + i * BPS..U_OFF + i * BPS + 8]);
        out[V_OFF + i * BPS..V_OFF + i * BPS + 8]
          .copy_from_slice(&trial[V_OFF + i * BPS..V_OFF + i * BPS + 8]);
      }
    }
  }
}

// Fast path for the low methods: modes from prediction error alone, no
// residual reconstruction (the residual stage recomputes from scratch)
fn pick_fast(src: &[u8; SCRATCH_SIZE], borders: &MbBorders, score: &mut ModeScore) {
  let mut pred = [0u8; SCRATCH_SIZE];
  let mut best = u64::MAX;
  for &mode in i16_candidates(borders.x, borders.y) {
    let ctx = PredCtx {
      left: if borders.x > 0 { Some(&borders.y_left) } else { None },
      top: if borders.y > 0 { Some(&borders.y_top[..16]) } else { None },
      top_left: borders.y_top_left,
    };
    dsp::pred_block(&mut pred, Y_OFF, mode, &ctx, 16);
    let e = dsp::sse16x16(src, Y_OFF, &pred, Y_OFF);
    if e < best {
      best = e;
      score.mode_i16 = mode;
    }
  }
  best = u64::MAX;
  for &mode in i16_candidates(borders.x, borders.y) {
    let ctx_u = PredCtx {
      left: if borders.x > 0 { Some(&borders.u_left) } else { None },
      top: if borders.y > 0 { Some(&borders.u_top) } else { None },
      top_left: borders.u_top_left,
    };
    let ctx_v = PredCtx {
      left: if borders.x > 0 { Some(&borders.v_left) } else { None },
      top: if borders.y > 0 { Some(&borders.v_top) } else { None },
      top_left: borders.v_top_left,
    };
    dsp::pred_block(&mut pred, U_OFF, mode, &ctx_u, 8);
    dsp::pred_block(&mut pred, V_OFF, mode, &ctx_v, 8);
    let e = dsp::sse16x8(src, U_OFF, &pred, U_OFF);
    if e < best {
      best = e;
      score.mode_uv = mode;
    }
  }
  score.is_i4 = false;
  score.pred_cached = false;
  score.i4_cached = false;
}

// Decide every mode of one macroblock. With pred_cached set in the
// result, `out` holds the final reconstruction.
pub fn pick_modes(
  src: &[u8; SCRATCH_SIZE],
  out: &mut [u8; SCRATCH_SIZE],
  borders: &MbBorders,
  p: &RdParams,
) -> ModeScore {
  let mut score = ModeScore::new();
  if p.method <= 1 {
    pick_fast(src, borders, &mut score);
    return score;
  }
  let trellis_params = TrellisParams { costs: p.costs, proba: p.proba };
  let trellis = if p.method >= 4 { Some(&trellis_params) } else { None };

  let i16_mode_score = pick_best_intra16(src, out, borders, p, &mut score, trellis);
  if p.method >= 3 {
    let flat_forced = dsp::is_flat_source16(src, Y_OFF) && (borders.x == 0 || borders.y == 0);
    if !flat_forced {
      pick_best_intra4(src, out, borders, p, &mut score, i16_mode_score, trellis);
    }
  }
  let do_diffusion = p.method >= 3;
  pick_best_uv(src, out, borders, p, &mut score, do_diffusion, trellis);
  score.nz = build_nz(score.is_i4, &score.counts_y, &score.counts_uv, score.count_dc);
  score
}

pub fn is_skippable(score: &ModeScore) -> bool {
  score.nz == 0
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::quant::Segment;

  fn borders_for_origin() -> MbBorders {
    MbBorders {
      x: 0,
      y: 0,
      mb_w: 4,
      y_left: [0; 16],
      u_left: [0; 8],
      v_left: [0; 8],
      y_top: [0; 20],
      u_top: [0; 8],
      v_top: [0; 8],
      y_top_left: 0,
      u_top_left: 0,
      v_top_left: 0,
      top_modes: [B_DC_PRED; 4],
      left_modes: [B_DC_PRED; 4],
    }
  }

  fn params<'a>(seg: &'a Segment, costs: &'a CostModel, proba: &'a Proba, method: i32) -> RdParams<'a> {
    RdParams {
      seg: seg,
      costs: costs,
      proba: proba,
      method: method,
      quality: 75,
      top_nz: [0; 9],
      left_nz: [0; 9],
      left_dc: 0,
      top_derr: [[0; 2]; 2],
      left_derr: [[0; 2]; 2],
    }
  }

  fn flat_src(v: u8) -> [u8; SCRATCH_SIZE] {
    [v; SCRATCH_SIZE]
  }

  #[test]
  fn flat_macroblock_is_skippable() {
    let mut seg = Segment::default();
    seg.quant = 60;
    seg.setup_matrices(0, 0, 0);
    let proba = Proba::new();
    let costs = CostModel::new(&proba);
    let p = params(&seg, &costs, &proba, 3);
    // at the origin every predictor defaults; a flat 128 source matches
    // the DC fallback exactly
    let src = flat_src(128);
    let mut out = [0u8; SCRATCH_SIZE];
    let score = pick_modes(&src, &mut out, &borders_for_origin(), &p);
    assert!(!score.is_i4);
    assert!(is_skippable(&score), "nz = {:x}", score.nz);
    assert_eq!(out[Y_OFF], 128);
  }

  #[test]
  fn fast_path_leaves_residuals_uncached() {
    let mut seg = Segment::default();
    seg.quant = 40;
    seg.setup_matrices(0, 0, 0);
    let proba = Proba::new();
    let costs = CostModel::new(&proba);
    let p = params(&seg, &costs, &proba, 0);
    let src = flat_src(77);
    let mut out = [0u8; SCRATCH_SIZE];
    let score = pick_modes(&src, &mut out, &borders_for_origin(), &p);
    assert!(!score.pred_cached);
  }

  #[test]
  fn textured_block_prefers_i4_or_produces_coeffs() {
    let mut seg = Segment::default();
    seg.quant = 20;
    seg.setup_matrices(0, 0, 0);
    let proba = Proba::new();
    let costs = CostModel::new(&proba);
    let p = params(&seg, &costs, &proba, 4);
    let mut src = flat_src(100);
    for i in 0..16 {
      for j in 0..16 {
        src[Y_OFF + i * BPS + j] = (100 + 60 * ((i / 4 + j / 4) % 2)) as u8;
      }
    }
    let mut out = [0u8; SCRATCH_SIZE];
    let score = pick_modes(&src, &mut out, &borders_for_origin(), &p);
    assert!(score.nz != 0);
    assert!(score.pred_cached);
  }
}
