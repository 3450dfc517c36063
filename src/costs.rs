// Rate estimation: entropy costs of boolean decisions, per-level token
// costs, mode signaling costs derived from the trees, and the
// statistics-driven re-estimation of the coefficient probabilities.
//
// Costs are expressed in 1/256th-of-a-bit units throughout.

use crate::enums::*;
use crate::proba::*;
use crate::util::{abs, min};

pub const MAX_VARIABLE_LEVEL: usize = 67;

// round(log2(x) * 256) for x in [1, 255], by iterated squaring
const fn log2_fix8(x: u32) -> u32 {
  let mut int_part = 0;
  let mut y = x;
  while y >= 2 {
    y >>= 1;
    int_part += 1;
  }
  // normalize to [1, 2) in 16.16 fixed point, then extract 8 fraction bits
  let mut z = ((x as u64) << 16) >> int_part;
  let mut result = int_part << 8;
  let mut i = 0;
  while i < 8 {
    z = (z * z) >> 16;
    if z >= 2 << 16 {
      result += 1 << (7 - i);
      z >>= 1;
    }
    i += 1;
  }
  result
}

const fn build_entropy_cost() -> [u16; 256] {
  let mut t = [0u16; 256];
  t[0] = 2047; // proba 0 never codes a zero bit; cap the cost
  let mut p = 1;
  while p < 256 {
    let c = 2048 - log2_fix8(p as u32);
    t[p] = if c == 0 { 1 } else { c as u16 };
    p += 1;
  }
  t
}

// k_entropy_cost[p] is the cost of coding a 0-bit at probability p
pub const k_entropy_cost: [u16; 256] = build_entropy_cost();

pub fn bit_cost(bit: u32, proba: u8) -> u64 {
  let idx = if bit != 0 { 255 - proba as usize } else { proba as usize };
  k_entropy_cost[idx] as u64
}

fn branch_cost(nb: u64, total: u64, proba: u8) -> u64 {
  nb * bit_cost(1, proba) + (total - nb) * bit_cost(0, proba)
}

// ---------------------------------------------------------------------------
// Level costs

// Cost of the fixed-probability magnitude bits (plus the sign bit) of a
// quantized level. The context-probability part lives in LevelCosts.
fn fixed_level_cost(v: i32) -> u64 {
  let v = v as usize;
  if v == 0 {
    return 0;
  }
  let sign = 256u64;
  match v {
    1..=4 => sign,
    5..=6 => sign + bit_cost((v != 5) as u32, 159),
    7..=10 => {
      let residue = (v - 7) as u32;
      sign + bit_cost(residue >> 1, 165) + bit_cost(residue & 1, 145)
    }
    _ => {
      let cat = match v {
        11..=18 => 0,
        19..=34 => 1,
        35..=66 => 2,
        _ => 3,
      };
      let probs = cat_probs(cat);
      let mut residue = (v as i32 - cat_base(cat)) as u32;
      if cat == 3 && residue > 2047 {
        residue = 2047;
      }
      let mut cost = sign;
      let nbits = probs.len();
      for (i, &p) in probs.iter().enumerate() {
        cost += bit_cost((residue >> (nbits - 1 - i)) & 1, p);
      }
      cost
    }
  }
}

// Cost of the context-probability bits selecting level `v`, for one
// probability row. Covers p[2..] of the value tree.
fn variable_level_cost(v: usize, p: &[u8; NUM_PROBAS]) -> u64 {
  if v == 1 {
    return bit_cost(0, p[2]);
  }
  let mut cost = bit_cost(1, p[2]);
  match v {
    2 => cost += bit_cost(0, p[3]) + bit_cost(0, p[4]),
    3 | 4 => cost += bit_cost(0, p[3]) + bit_cost(1, p[4]) + bit_cost((v == 4) as u32, p[5]),
    5 | 6 => cost += bit_cost(1, p[3]) + bit_cost(0, p[6]) + bit_cost(0, p[7]),
    7..=10 => cost += bit_cost(1, p[3]) + bit_cost(0, p[6]) + bit_cost(1, p[7]),
    _ => {
      let cat = match v {
        11..=18 => 0,
        19..=34 => 1,
        35..=66 => 2,
        _ => 3,
      } as u32;
      cost += bit_cost(1, p[3]) + bit_cost(1, p[6]);
      cost += bit_cost(cat >> 1, p[8]) + bit_cost(cat & 1, p[9 + (cat >> 1) as usize]);
    }
  }
  cost
}

pub type LevelCostsTable = [[[[u16; MAX_VARIABLE_LEVEL + 1]; NUM_CTX]; NUM_BANDS]; NUM_TYPES];

// All cost tables the rate estimation needs, refreshed whenever the
// coefficient probabilities change
pub struct CostModel {
  pub level_costs: Box<LevelCostsTable>,
  pub fixed_costs: Box<[u16; 2048]>,
  pub cost_i16: [u16; NUM_PRED_MODES],
  pub cost_uv: [u16; NUM_PRED_MODES],
  pub cost_i4: Box<[[[u16; NUM_BMODES]; NUM_BMODES]; NUM_BMODES]>,
}

// Cost of the mode trees, derived once from their fixed probabilities

fn i16_mode_cost(mode: u8) -> u16 {
  // selector bit says "not intra-4x4"
  let mut c = bit_cost(1, PROBA_IS_I16);
  c += bit_cost((mode == TM_PRED || mode == H_PRED) as u32, 156);
  c += if mode == TM_PRED || mode == H_PRED {
    bit_cost((mode == TM_PRED) as u32, 128)
  } else {
    bit_cost((mode == V_PRED) as u32, 163)
  };
  c as u16
}

fn uv_mode_cost(mode: u8) -> u16 {
  let mut c = bit_cost((mode != DC_PRED) as u32, 142);
  if mode != DC_PRED {
    c += bit_cost((mode != V_PRED) as u32, 114);
    if mode != V_PRED {
      c += bit_cost((mode != H_PRED) as u32, 183);
    }
  }
  c as u16
}

fn i4_mode_cost(probs: &[u8; 9], mode: u8) -> u16 {
  let mut c = bit_cost((mode != B_DC_PRED) as u32, probs[0]);
  if mode == B_DC_PRED {
    return c as u16;
  }
  c += bit_cost((mode != B_TM_PRED) as u32, probs[1]);
  if mode == B_TM_PRED {
    return c as u16;
  }
  c += bit_cost((mode != B_VE_PRED) as u32, probs[2]);
  if mode == B_VE_PRED {
    return c as u16;
  }
  c += bit_cost((mode >= B_LD_PRED) as u32, probs[3]);
  if mode < B_LD_PRED {
    c += bit_cost((mode != B_HE_PRED) as u32, probs[4]);
    if mode != B_HE_PRED {
      c += bit_cost((mode != B_RD_PRED) as u32, probs[5]);
    }
  } else {
    c += bit_cost((mode != B_LD_PRED) as u32, probs[6]);
    if mode != B_LD_PRED {
      c += bit_cost((mode != B_VL_PRED) as u32, probs[7]);
      if mode != B_VL_PRED {
        c += bit_cost((mode != B_HD_PRED) as u32, probs[8]);
      }
    }
  }
  c as u16
}

impl CostModel {
  pub fn new(proba: &Proba) -> Self {
    let mut fixed = Box::new([0u16; 2048]);
    for v in 0..2048 {
      fixed[v] = fixed_level_cost(v as i32) as u16;
    }
    let mut cost_i4 = Box::new([[[0u16; NUM_BMODES]; NUM_BMODES]; NUM_BMODES]);
    for top in 0..NUM_BMODES {
      for left in 0..NUM_BMODES {
        for mode in 0..NUM_BMODES {
          cost_i4[top][left][mode] = i4_mode_cost(&k_bmodes_proba[top][left], mode as u8);
        }
      }
    }
    let mut m = Self {
      level_costs: Box::new([[[[0; MAX_VARIABLE_LEVEL + 1]; NUM_CTX]; NUM_BANDS]; NUM_TYPES]),
      fixed_costs: fixed,
      cost_i16: [
        i16_mode_cost(0),
        i16_mode_cost(1),
        i16_mode_cost(2),
        i16_mode_cost(3),
      ],
      cost_uv: [
        uv_mode_cost(0),
        uv_mode_cost(1),
        uv_mode_cost(2),
        uv_mode_cost(3),
      ],
      cost_i4: cost_i4,
    };
    m.refresh(proba);
    m
  }

  // Rebuild the per-position level cost tables from the current probas
  pub fn refresh(&mut self, proba: &Proba) {
    for t in 0..NUM_TYPES {
      for b in 0..NUM_BANDS {
        for c in 0..NUM_CTX {
          let p = &proba.coeffs[t][b][c];
          let ctx0_cost = if c > 0 { bit_cost(1, p[0]) } else { 0 };
          let cost_base = bit_cost(1, p[1]) + ctx0_cost;
          let row = &mut self.level_costs[t][b][c];
          row[0] = (bit_cost(0, p[1]) + ctx0_cost) as u16;
          for v in 1..=MAX_VARIABLE_LEVEL {
            row[v] = (cost_base + variable_level_cost(v, p)) as u16;
          }
        }
      }
    }
  }

  pub fn level_cost(&self, t: usize, b: usize, c: usize, v: i32) -> u64 {
    let v = v as usize;
    let capped = if v > MAX_VARIABLE_LEVEL { MAX_VARIABLE_LEVEL } else { v };
    let fixed = if v < 2048 { self.fixed_costs[v] } else { self.fixed_costs[2047] };
    fixed as u64 + self.level_costs[t][b][c][capped] as u64
  }
}

// ---------------------------------------------------------------------------
// Residual rate estimation

// One coded block: levels in zigzag order, `last` pointing at the last
// non-zero one (-1 when the block is empty)
pub struct Residual<'a> {
  pub coeff_type: usize,
  pub first: usize,
  pub last: i32,
  pub coeffs: &'a [i16; 16],
}

// Simulate the token tree over the block and accumulate the entropy
// cost, starting from non-zero context `ctx0`
pub fn residual_cost(res: &Residual, ctx0: usize, costs: &CostModel, proba: &Proba) -> u64 {
  let t = res.coeff_type;
  let mut n = res.first;
  let p0 = proba.coeffs[t][k_bands[n]][ctx0][0];
  let mut cost: u64 = if ctx0 == 0 { bit_cost(1, p0) } else { 0 };
  if res.last < 0 {
    return bit_cost(0, p0);
  }
  let (mut band, mut ctx) = (k_bands[n], ctx0);
  while (n as i32) < res.last {
    let v = abs(res.coeffs[n] as i32);
    cost += costs.level_cost(t, band, ctx, v);
    band = k_bands[n + 1];
    ctx = min(v, 2) as usize;
    n += 1;
  }
  let v = abs(res.coeffs[res.last as usize] as i32);
  cost += costs.level_cost(t, band, ctx, v);
  if res.last < 15 {
    let b = k_bands[res.last as usize + 1];
    let c = min(v, 2) as usize;
    cost += bit_cost(0, proba.coeffs[t][b][c][0]);
  }
  cost
}

// ---------------------------------------------------------------------------
// Recorded statistics and probability re-estimation

// Each counter packs (total << 16 | ones), halved on overflow
pub type Stats = [[[[u32; NUM_PROBAS]; NUM_CTX]; NUM_BANDS]; NUM_TYPES];

pub fn new_stats() -> Box<Stats> {
  Box::new([[[[0; NUM_PROBAS]; NUM_CTX]; NUM_BANDS]; NUM_TYPES])
}

pub fn record_stat(bit: u32, stat: &mut u32) {
  let mut p = *stat;
  if p >= 0xffff_0000 {
    p = ((p + 1) >> 1) & 0x7fff_7fff;
  }
  *stat = p + 0x0001_0000 + bit;
}

fn calc_token_proba(nb: u64, total: u64) -> u8 {
  if nb == 0 {
    255
  } else {
    let p = 255 - nb * 255 / total;
    if p < 1 { 1 } else { p as u8 }
  }
}

// Re-derive the coefficient probas from the recorded statistics. Each
// position keeps the default unless switching pays for the 8-bit update.
// Returns (estimated header cost, whether anything changed).
pub fn finalize_token_probas(proba: &mut Proba, stats: &Stats) -> (u64, bool) {
  let mut dirty = false;
  let mut size: u64 = 0;
  for t in 0..NUM_TYPES {
    for b in 0..NUM_BANDS {
      for c in 0..NUM_CTX {
        for p in 0..NUM_PROBAS {
          let stat = stats[t][b][c][p];
          let nb = (stat & 0xffff) as u64;
          let total = (stat >> 16) as u64;
          let update_proba = k_coeff_update_probas[t][b][c][p];
          let old_p = k_coeff_probas_default[t][b][c][p];
          let new_p = calc_token_proba(nb, total);
          let old_cost = branch_cost(nb, total, old_p) + bit_cost(0, update_proba);
          let new_cost = branch_cost(nb, total, new_p) + bit_cost(1, update_proba) + 8 * 256;
          let use_new = old_cost > new_cost;
          size += bit_cost(use_new as u32, update_proba);
          if use_new {
            if proba.coeffs[t][b][c][p] != new_p {
              dirty = true;
            }
            proba.coeffs[t][b][c][p] = new_p;
            size += 8 * 256;
          } else {
            if proba.coeffs[t][b][c][p] != old_p {
              dirty = true;
            }
            proba.coeffs[t][b][c][p] = old_p;
          }
        }
      }
    }
  }
  (size, dirty)
}

const SKIP_PROBA_THRESHOLD: u8 = 250;

// Returns (skip_proba, use_skip, signaling cost)
pub fn finalize_skip_proba(nb_skipped: u64, nb_mbs: u64) -> (u8, bool, u64) {
  let proba = if nb_mbs == 0 {
    255
  } else {
    ((nb_mbs - nb_skipped) * 255 / nb_mbs) as u8
  };
  let use_skip = proba < SKIP_PROBA_THRESHOLD;
  let mut size = 256;
  if use_skip {
    size += nb_skipped * bit_cost(1, proba) + (nb_mbs - nb_skipped) * bit_cost(0, proba);
    size += 8 * 256;
  }
  (proba, use_skip, size)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn entropy_cost_shape() {
    // one full bit at even odds
    assert_eq!(k_entropy_cost[128], 256);
    // nearly-certain bits are nearly free, unlikely ones expensive
    assert_eq!(k_entropy_cost[255], 1);
    assert!(k_entropy_cost[1] > 1800);
    for p in 1..256 {
      assert!(k_entropy_cost[p] <= k_entropy_cost[p - 1]);
    }
  }

  #[test]
  fn i4_selector_cost_matches_table() {
    // the intra-4 selector is a 0-bit at proba 145
    let c = bit_cost(0, PROBA_IS_I16);
    assert!((c as i64 - 211).abs() <= 2, "selector cost {}", c);
  }

  #[test]
  fn empty_residual_costs_one_eob() {
    let proba = Proba::new();
    let costs = CostModel::new(&proba);
    let coeffs = [0i16; 16];
    let res = Residual { coeff_type: TYPE_Y_NO_Y2, first: 0, last: -1, coeffs: &coeffs };
    let c = residual_cost(&res, 0, &costs, &proba);
    assert_eq!(c, bit_cost(0, proba.coeffs[TYPE_Y_NO_Y2][0][0][0]));
  }

  #[test]
  fn larger_levels_cost_more() {
    let proba = Proba::new();
    let costs = CostModel::new(&proba);
    let mut prev = 0;
    for v in [1, 2, 5, 11, 40, 100, 500] {
      let c = costs.level_cost(TYPE_UV, 1, 0, v);
      assert!(c > prev, "cost not increasing at {}", v);
      prev = c;
    }
  }

  #[test]
  fn stats_drive_probas() {
    let mut stats = new_stats();
    // heavily biased toward zero at one position
    for _ in 0..4000 {
      record_stat(0, &mut stats[0][1][0][0]);
    }
    let mut proba = Proba::new();
    let (_, dirty) = finalize_token_probas(&mut proba, &stats);
    // all-zero observations must push the proba up toward 255
    assert!(proba.coeffs[0][1][0][0] >= k_coeff_probas_default[0][1][0][0]);
    let _ = dirty;
  }

  #[test]
  fn skip_proba_thresholds() {
    let (p, use_skip, _) = finalize_skip_proba(900, 1000);
    assert!(use_skip);
    assert!(p < 50);
    let (_, use_skip, _) = finalize_skip_proba(0, 1000);
    assert!(!use_skip);
  }
}
