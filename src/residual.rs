// Residual coding for the encoder: forward transform + quantization +
// reconstruction for the three block families, and the trellis-based
// level optimization used at the highest effort settings.
//
// Macroblock scratch buffers hold Y at column 0, U at column 16 and V
// at column 24 of a 16-row BPS-strided area.

use crate::consts::*;
use crate::costs::CostModel;
use crate::dsp;
use crate::quant::QFIX;
use crate::enums::*;
use crate::proba::{k_bands, Proba};
use crate::quant::{quantize_block, Matrix, Segment, MAX_LEVEL};
use crate::util::{abs, min};

pub const Y_OFF: usize = 0;
pub const U_OFF: usize = 16;
pub const V_OFF: usize = 24;
pub const SCRATCH_SIZE: usize = 16 * BPS;

// Offset of luma sub-block k inside the scratch area
pub fn y_blk_off(k: usize) -> usize {
  Y_OFF + (k / 4) * 4 * BPS + (k % 4) * 4
}

// Offset of chroma block b (0..3 U, 4..7 V)
pub fn uv_blk_off(b: usize) -> usize {
  let base = if b < 4 { U_OFF } else { V_OFF };
  let i = b & 3;
  base + (i / 2) * 4 * BPS + (i % 2) * 4
}

// ---------------------------------------------------------------------------
// Trellis quantization

const NUM_CTXS: usize = 3;

#[derive(Clone, Copy)]
struct Node {
  level: i16,
  prev_ctx: i8, // -1 marks "unreachable"
}

// Viterbi search over the levels of one block. Candidate levels per
// position are the neutral-bias quantization result and its decrement
// (and zero, which models runs). Returns the scan-order EOB count;
// `coeffs` is left holding the dequantized reconstruction and `out`
// the chosen zigzag levels.
pub fn trellis_quantize_block(
  coeffs: &mut [i16; 16],
  out: &mut [i16; 16],
  mtx: &Matrix,
  first: usize,
  ctx0: usize,
  coeff_type: usize,
  lambda: i64,
  costs: &CostModel,
  proba: &Proba,
) -> usize {
  // neutral-bias pre-scan
  let neutral_bias: u64 = 1 << (QFIX - 1);
  let mut base_levels = [0i32; 16];
  let mut signs = [false; 16];
  let mut abs_coeffs = [0i32; 16];
  let mut last0: i32 = -1;
  for n in first..16 {
    let j = k_zigzag[n];
    let c = coeffs[j] as i32;
    signs[n] = c < 0;
    let a = abs(c) + mtx.sharpen[j] as i32;
    abs_coeffs[n] = abs(c);
    let l = min(
      ((a as u64 * mtx.iq[j] as u64 + neutral_bias) >> QFIX) as i32,
      MAX_LEVEL,
    );
    base_levels[n] = l;
    if l != 0 {
      last0 = n as i32;
    }
  }
  if last0 < 0 {
    for n in first..16 {
      coeffs[k_zigzag[n]] = 0;
      out[n] = 0;
    }
    return 0;
  }
  let last0 = last0 as usize;
  for i in 0..first {
    out[i] = 0;
  }

  let t = coeff_type;
  let mut nodes = [[Node { level: 0, prev_ctx: -1 }; NUM_CTXS]; 16];

  // score accumulated per reachable context, position by position
  let mut cur: [Option<i64>; NUM_CTXS] = [None; NUM_CTXS];
  cur[ctx0] = Some(0);
  // account for the missing first-position continuation bit of ctx 0
  let base_rate: i64 = if ctx0 == 0 {
    crate::costs::bit_cost(1, proba.coeffs[t][k_bands[first]][ctx0][0]) as i64
  } else {
    0
  };

  let mut best_end: Option<(usize, usize, i64)> = None; // (pos, ctx, score)

  for n in first..=last0 {
    let l0 = base_levels[n];
    let q = mtx.q[k_zigzag[n]] as i64;
    let w = k_weight_trellis[n] as i64;
    let c = abs_coeffs[n] as i64;
    let band = k_bands[n];
    let mut next: [Option<i64>; NUM_CTXS] = [None; NUM_CTXS];
    let mut cand = [0i32; 3];
    let mut ncand = 1;
    if l0 >= 1 {
      cand[ncand] = l0;
      ncand += 1;
      if l0 >= 2 {
        cand[ncand] = l0 - 1;
        ncand += 1;
      } else if l0 == 1 {
        // zero already included
      }
    }
    for ci in 0..ncand {
      let level = cand[ci];
      let err = c - level as i64 * q;
      let delta_disto = w * (err * err - c * c);
      let new_ctx = min(level, 2) as usize;
      for prev in 0..NUM_CTXS {
        let Some(prev_score) = cur[prev] else { continue };
        let rate = costs.level_cost(t, band, prev, level) as i64;
        let score = prev_score + lambda * rate + 256 * delta_disto;
        let slot = &mut next[new_ctx];
        let better = match *slot {
          None => true,
          Some(s) => score < s,
        };
        if better {
          *slot = Some(score);
          nodes[n][new_ctx] = Node { level: level as i16, prev_ctx: prev as i8 };
        }
      }
      // a non-zero level here is a candidate end of block
      if level != 0 {
        if let Some(score) = next[new_ctx] {
          let eob: i64 = if n < 15 {
            crate::costs::bit_cost(0, proba.coeffs[t][k_bands[n + 1]][new_ctx][0]) as i64
          } else {
            0
          };
          let total = score + lambda * eob;
          if best_end.map_or(true, |(_, _, s)| total < s) {
            best_end = Some((n, new_ctx, total));
          }
        }
      }
    }
    cur = next;
  }

  // compare against dropping the block entirely
  let empty_rate = crate::costs::bit_cost(0, proba.coeffs[t][k_bands[first]][ctx0][0]) as i64;
  let empty_score = lambda * empty_rate;
  let keep = match best_end {
    Some((_, _, s)) => lambda * base_rate + s < empty_score,
    None => false,
  };
  for n in first..16 {
    out[n] = 0;
    coeffs[k_zigzag[n]] = 0;
  }
  if !keep {
    return 0;
  }
  let (end_pos, end_ctx, _) = best_end.unwrap();
  // backtrack the chosen levels
  let mut pos = end_pos as i32;
  let mut ctx = end_ctx as i8;
  while pos >= first as i32 {
    let node = nodes[pos as usize][ctx as usize];
    let n = pos as usize;
    let level = if signs[n] { -node.level } else { node.level };
    out[n] = level;
    coeffs[k_zigzag[n]] = (level as i32 * mtx.q[k_zigzag[n]] as i32) as i16;
    ctx = node.prev_ctx;
    pos -= 1;
    if ctx < 0 {
      break;
    }
  }
  end_pos + 1
}

// ---------------------------------------------------------------------------
// Whole-macroblock reconstruction

// Everything trellis needs, bundled so reconstruction calls stay short
pub struct TrellisParams<'a> {
  pub costs: &'a CostModel,
  pub proba: &'a Proba,
}

fn quantize_one(
  coeffs: &mut [i16; 16],
  out: &mut [i16; 16],
  mtx: &Matrix,
  first: usize,
  ctx: usize,
  coeff_type: usize,
  lambda: i64,
  trellis: Option<&TrellisParams>,
) -> usize {
  match trellis {
    Some(tp) => trellis_quantize_block(coeffs, out, mtx, first, ctx, coeff_type, lambda, tp.costs, tp.proba),
    None => quantize_block(coeffs, out, mtx, first),
  }
}

// Reconstruct a whole 16x16 intra-16 luma prediction + residual.
// `pred` points at the prediction inside `pred_buf`; the reconstruction
// lands at Y_OFF of `dst`. Returns per-block EOB counts (luma then WHT).
pub fn reconstruct_i16(
  src: &[u8],
  pred_buf: &[u8],
  pred_off: usize,
  dst: &mut [u8],
  seg: &Segment,
  ctxs: &([u8; 9], [u8; 9]),
  levels_y: &mut [[i16; 16]; 16],
  levels_dc: &mut [i16; 16],
  counts_y: &mut [u8; 16],
  trellis: Option<&TrellisParams>,
) -> u8 {
  let (top_nz, left_nz) = ctxs;
  let mut tmp = [[0i16; 16]; 16];
  for k in 0..16 {
    dsp::ftransform(src, Y_OFF + y_blk_off(k), pred_buf, pred_off + y_blk_off(k), &mut tmp[k]);
  }
  // aggregate the DCs into the WHT block
  let mut dcs = [0i16; 16];
  for k in 0..16 {
    dcs[k] = tmp[k][0];
  }
  let mut wht = [0i16; 16];
  dsp::ftransform_wht(&dcs, &mut wht);
  let count_dc = quantize_block(&mut wht, levels_dc, &seg.y2, 0) as u8;

  // AC quantization with running non-zero contexts
  let mut tnz = *top_nz;
  let mut lnz = *left_nz;
  for k in 0..16 {
    let (by, bx) = (k / 4, k % 4);
    let ctx = (tnz[bx] + lnz[by]) as usize;
    let n = quantize_one(
      &mut tmp[k],
      &mut levels_y[k],
      &seg.y1,
      1,
      ctx,
      TYPE_Y_AFTER_Y2,
      seg.tlambda_i16 as i64,
      trellis,
    );
    counts_y[k] = n as u8;
    let nz = (n > 1) as u8;
    tnz[bx] = nz;
    lnz[by] = nz;
  }

  // distribute the dequantized WHT back into the block DCs
  let dcs_out = dsp::itransform_wht(&wht);
  for i in 0..16 {
    for j in 0..16 {
      dst[Y_OFF + i * BPS + j] = pred_buf[pred_off + i * BPS + j];
    }
  }
  for k in 0..16 {
    tmp[k][0] = dcs_out[k];
    let has_ac = counts_y[k] > 1;
    if has_ac {
      dsp::itransform_add(dst, Y_OFF + y_blk_off(k), &tmp[k]);
    } else if tmp[k][0] != 0 {
      dsp::itransform_add_dc(dst, Y_OFF + y_blk_off(k), tmp[k][0]);
    }
  }
  count_dc
}

// Reconstruct one 4x4 sub-block in place. The prediction must already
// sit at `off` of `dst`.
pub fn reconstruct_i4(
  src: &[u8],
  src_off: usize,
  dst: &mut [u8],
  off: usize,
  seg: &Segment,
  ctx: usize,
  levels: &mut [i16; 16],
  trellis: Option<&TrellisParams>,
) -> usize {
  let mut tmp = [0i16; 16];
  dsp::ftransform(src, src_off, dst, off, &mut tmp);
  let n = quantize_one(
    &mut tmp,
    levels,
    &seg.y1,
    0,
    ctx,
    TYPE_Y_NO_Y2,
    seg.tlambda_i4 as i64,
    trellis,
  );
  if n > 1 {
    dsp::itransform_add(dst, off, &tmp);
  } else if tmp[0] != 0 {
    dsp::itransform_add_dc(dst, off, tmp[0]);
  }
  n
}

// Reconstruct both 8x8 chroma planes. Optional DC error diffusion
// (method >= 3) corrects the DC values before quantization and leaves
// the propagated errors in `derr`.
pub fn reconstruct_uv(
  src: &[u8],
  pred_buf: &[u8],
  pred_off_u: usize,
  pred_off_v: usize,
  dst: &mut [u8],
  seg: &Segment,
  ctxs: &([u8; 9], [u8; 9]),
  levels_uv: &mut [[i16; 16]; 8],
  counts_uv: &mut [u8; 8],
  diffusion: Option<(&[[i8; 2]; 2], &[[i8; 2]; 2], &mut [[i8; 3]; 2])>,
  trellis: Option<&TrellisParams>,
) {
  let (top_nz, left_nz) = ctxs;
  let mut tmp = [[0i16; 16]; 8];
  for b in 0..8 {
    let (pred_base, col_base) = if b < 4 { (pred_off_u, U_OFF) } else { (pred_off_v, V_OFF) };
    let pred_off = pred_base + (uv_blk_off(b) - col_base);
    dsp::ftransform(src, uv_blk_off(b), pred_buf, pred_off, &mut tmp[b]);
  }
  if let Some((top_derr, left_derr, derr)) = diffusion {
    crate::quant::correct_dc_values(&mut tmp, &seg.uv, top_derr, left_derr, derr);
  }
  let mut tnz = *top_nz;
  let mut lnz = *left_nz;
  for ch in [0usize, 2] {
    for y in 0..2 {
      for x in 0..2 {
        let b = 2 * ch + y * 2 + x;
        let ctx = (tnz[4 + ch + x] + lnz[4 + ch + y]) as usize;
        let n = quantize_one(
          &mut tmp[b],
          &mut levels_uv[b],
          &seg.uv,
          0,
          ctx,
          TYPE_UV,
          seg.tlambda_uv as i64,
          trellis,
        );
        counts_uv[b] = n as u8;
        let nz = (n > 0) as u8;
        tnz[4 + ch + x] = nz;
        lnz[4 + ch + y] = nz;
      }
    }
  }
  for i in 0..8 {
    for j in 0..8 {
      dst[U_OFF + i * BPS + j] = pred_buf[pred_off_u + i * BPS + j];
      dst[V_OFF + i * BPS + j] = pred_buf[pred_off_v + i * BPS + j];
    }
  }
  for b in 0..8 {
    let off = uv_blk_off(b);
    if counts_uv[b] > 1 {
      dsp::itransform_add(dst, off, &tmp[b]);
    } else if tmp[b][0] != 0 {
      dsp::itransform_add_dc(dst, off, tmp[b][0]);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::quant::Segment;

  fn test_segment(q: i32) -> Segment {
    let mut s = Segment::default();
    s.quant = q;
    s.setup_matrices(0, 0, 0);
    s
  }

  #[test]
  fn block_offsets_are_disjoint() {
    let mut seen = std::collections::HashSet::new();
    for k in 0..16 {
      assert!(seen.insert(y_blk_off(k)));
    }
    for b in 0..8 {
      assert!(seen.insert(uv_blk_off(b)));
    }
  }

  #[test]
  fn i4_reconstruction_tracks_source() {
    let seg = test_segment(10);
    let mut src = vec![0u8; SCRATCH_SIZE];
    let mut dst = vec![0u8; SCRATCH_SIZE];
    for i in 0..4 {
      for j in 0..4 {
        src[i * BPS + j] = (100 + 10 * i + j) as u8;
        dst[i * BPS + j] = 100; // flat prediction
      }
    }
    let mut levels = [0i16; 16];
    let n = reconstruct_i4(&src, 0, &mut dst, 0, &seg, 0, &mut levels, None);
    assert!(n > 0);
    for i in 0..4 {
      for j in 0..4 {
        let d = dst[i * BPS + j] as i32 - src[i * BPS + j] as i32;
        assert!(d.abs() <= 12, "drift {} at ({},{})", d, i, j);
      }
    }
  }

  #[test]
  fn trellis_never_worse_than_empty() {
    let seg = test_segment(60);
    let proba = Proba::new();
    let costs = CostModel::new(&proba);
    let mut coeffs = [0i16; 16];
    // tiny residual that greedy quantization would drop anyway
    coeffs[5] = 3;
    let mut out = [0i16; 16];
    let n = trellis_quantize_block(
      &mut coeffs, &mut out, &seg.y1, 0, 0, TYPE_Y_NO_Y2, seg.tlambda_i4 as i64, &costs, &proba,
    );
    assert_eq!(n, 0);
    assert_eq!(out, [0i16; 16]);
    assert_eq!(coeffs, [0i16; 16]);
  }

  #[test]
  fn trellis_keeps_strong_coefficients() {
    let seg = test_segment(10);
    let proba = Proba::new();
    let costs = CostModel::new(&proba);
    let mut coeffs = [0i16; 16];
    coeffs[0] = 900;
    coeffs[1] = -350;
    let mut out = [0i16; 16];
    let n = trellis_quantize_block(
      &mut coeffs, &mut out, &seg.y1, 0, 0, TYPE_Y_NO_Y2, seg.tlambda_i4 as i64, &costs, &proba,
    );
    assert!(n >= 2);
    assert!(out[0] > 0);
    assert!(out[1] < 0);
    // reconstruction must stay close to the input
    assert!((coeffs[0] as i32 - 900).abs() < seg.y1.q[0] as i32);
  }
}
