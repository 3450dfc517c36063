// Token recording and emission. During the encode loop every boolean
// decision of the coefficient tree is appended to a token buffer along
// with the address of its probability; the final bitstream pass replays
// the tokens through the arithmetic writer with whatever probabilities
// ended up in the frame header. Statistics are gathered on the same
// walk so the probabilities can be re-estimated mid-stream.

use crate::costs::{record_stat, Stats};
use crate::entropycode::EntropyWriter;
use crate::enums::*;
use crate::proba::*;

// A token packs the emitted bit, a "fixed probability" flag and either
// a proba table address or the literal probability value
const TOKEN_BIT: u32 = 1 << 31;
const TOKEN_FIXED: u32 = 1 << 30;

fn ctx_token(bit: u32, addr: u16) -> u32 {
  (if bit != 0 { TOKEN_BIT } else { 0 }) | addr as u32
}

fn fixed_token(bit: u32, proba: u8) -> u32 {
  (if bit != 0 { TOKEN_BIT } else { 0 }) | TOKEN_FIXED | proba as u32
}

pub struct TokenBuffer {
  tokens: Vec<u32>,
  // token range per macroblock, in raster order
  ranges: Vec<(u32, u32)>,
}

impl TokenBuffer {
  pub fn new() -> Self {
    Self {
      tokens: Vec::new(),
      ranges: Vec::new(),
    }
  }

  pub fn clear(&mut self) {
    self.tokens.clear();
    self.ranges.clear();
  }

  pub fn begin_mb(&mut self) {
    self.ranges.push((self.tokens.len() as u32, self.tokens.len() as u32));
  }

  fn end_mb(&mut self) {
    let last = self.ranges.last_mut().unwrap();
    last.1 = self.tokens.len() as u32;
  }

  pub fn num_tokens(&self) -> usize {
    self.tokens.len()
  }

  // Replay the tokens of one macroblock into the arithmetic writer
  pub fn emit_mb(&self, mb_index: usize, w: &mut EntropyWriter, proba: &Proba) {
    let (start, end) = self.ranges[mb_index];
    for &tok in &self.tokens[start as usize..end as usize] {
      let bit = (tok & TOKEN_BIT != 0) as u32;
      let p = if tok & TOKEN_FIXED != 0 {
        (tok & 0xff) as u8
      } else {
        proba.at_addr((tok & 0xffff) as u16)
      };
      w.put_bit(bit, p);
    }
  }
}

// ---------------------------------------------------------------------------
// Non-zero context plumbing
//
// Each macroblock stores a packed non-zero mask: bits 0..15 the luma
// blocks in raster order, 16..19 U, 20..23 V, 24 the WHT block. The
// walk below unpacks the relevant neighbour bits into 9-entry context
// arrays (4 luma columns/rows, 2 U, 2 V, 1 DC).

fn bit(nz: u32, n: u32) -> u8 {
  ((nz >> n) & 1) as u8
}

pub fn nz_to_ctx(top_nz_mask: u32, left_nz_mask: u32) -> ([u8; 9], [u8; 9]) {
  let mut top = [0u8; 9];
  let mut left = [0u8; 9];
  top[0] = bit(top_nz_mask, 12);
  top[1] = bit(top_nz_mask, 13);
  top[2] = bit(top_nz_mask, 14);
  top[3] = bit(top_nz_mask, 15);
  top[4] = bit(top_nz_mask, 18);
  top[5] = bit(top_nz_mask, 19);
  top[6] = bit(top_nz_mask, 22);
  top[7] = bit(top_nz_mask, 23);
  top[8] = bit(top_nz_mask, 24);
  left[0] = bit(left_nz_mask, 3);
  left[1] = bit(left_nz_mask, 7);
  left[2] = bit(left_nz_mask, 11);
  left[3] = bit(left_nz_mask, 15);
  left[4] = bit(left_nz_mask, 17);
  left[5] = bit(left_nz_mask, 19);
  left[6] = bit(left_nz_mask, 21);
  left[7] = bit(left_nz_mask, 23);
  // the left DC context is carried separately by the caller
  (top, left)
}

pub fn ctx_to_nz(top: &[u8; 9], left: &[u8; 9]) -> u32 {
  let mut nz = 0u32;
  nz |= (top[0] as u32) << 12 | (top[1] as u32) << 13;
  nz |= (top[2] as u32) << 14 | (top[3] as u32) << 15;
  nz |= (top[4] as u32) << 18 | (top[5] as u32) << 19;
  nz |= (top[6] as u32) << 22 | (top[7] as u32) << 23;
  nz |= (top[8] as u32) << 24;
  nz |= (left[0] as u32) << 3 | (left[1] as u32) << 7;
  nz |= (left[2] as u32) << 11;
  nz |= (left[4] as u32) << 17 | (left[6] as u32) << 21;
  nz
}

// ---------------------------------------------------------------------------
// Recording

struct Sink<'a> {
  tokens: Option<&'a mut TokenBuffer>,
  stats: Option<&'a mut Stats>,
}

impl<'a> Sink<'a> {
  fn ctx_bit(&mut self, bit: u32, t: usize, b: usize, c: usize, p: usize) {
    if let Some(stats) = self.stats.as_deref_mut() {
      record_stat(bit, &mut stats[t][b][c][p]);
    }
    if let Some(tok) = self.tokens.as_deref_mut() {
      tok.tokens.push(ctx_token(bit, Proba::addr(t, b, c, p)));
    }
  }

  fn fixed_bit(&mut self, bit: u32, proba: u8) {
    if let Some(tok) = self.tokens.as_deref_mut() {
      tok.tokens.push(fixed_token(bit, proba));
    }
  }
}

// Emit the magnitude bits of a value >= 2, mirroring the decoder's tree
fn record_large_value(sink: &mut Sink, v: i32, t: usize, b: usize, c: usize) {
  debug_assert!(v >= 2);
  if v <= 4 {
    sink.ctx_bit(0, t, b, c, 3);
    if v == 2 {
      sink.ctx_bit(0, t, b, c, 4);
    } else {
      sink.ctx_bit(1, t, b, c, 4);
      sink.ctx_bit((v == 4) as u32, t, b, c, 5);
    }
  } else if v <= 10 {
    sink.ctx_bit(1, t, b, c, 3);
    sink.ctx_bit(0, t, b, c, 6);
    if v <= 6 {
      sink.ctx_bit(0, t, b, c, 7);
      sink.fixed_bit((v == 6) as u32, 159);
    } else {
      sink.ctx_bit(1, t, b, c, 7);
      let residue = (v - 7) as u32;
      sink.fixed_bit(residue >> 1, 165);
      sink.fixed_bit(residue & 1, 145);
    }
  } else {
    let cat: usize = match v {
      11..=18 => 0,
      19..=34 => 1,
      35..=66 => 2,
      _ => 3,
    };
    sink.ctx_bit(1, t, b, c, 3);
    sink.ctx_bit(1, t, b, c, 6);
    let bit1 = (cat >> 1) as u32;
    sink.ctx_bit(bit1, t, b, c, 8);
    sink.ctx_bit((cat & 1) as u32, t, b, c, 9 + bit1 as usize);
    let probs = cat_probs(cat);
    let residue = (v - cat_base(cat)) as u32;
    let nbits = probs.len();
    for (i, &p) in probs.iter().enumerate() {
      sink.fixed_bit((residue >> (nbits - 1 - i)) & 1, p);
    }
  }
}

// Record one block. `levels` are zigzag-ordered; `count` is the
// scan-order EOB (0 for an empty block, matching the quantizer return).
// Returns whether the block had any coefficient.
fn record_block(
  sink: &mut Sink,
  t: usize,
  ctx0: usize,
  first: usize,
  levels: &[i16; 16],
  count: usize,
) -> bool {
  if count <= first {
    sink.ctx_bit(0, t, k_bands[first], ctx0, 0);
    return false;
  }
  let mut n = first;
  let mut ctx = ctx0;
  loop {
    sink.ctx_bit(1, t, k_bands[n], ctx, 0); // not end-of-block
    // run of zeros up to the next non-zero coefficient
    while levels[n] == 0 {
      sink.ctx_bit(0, t, k_bands[n], ctx, 1);
      n += 1;
      ctx = 0;
    }
    sink.ctx_bit(1, t, k_bands[n], ctx, 1);
    let v = levels[n].unsigned_abs() as i32;
    if v == 1 {
      sink.ctx_bit(0, t, k_bands[n], ctx, 2);
    } else {
      sink.ctx_bit(1, t, k_bands[n], ctx, 2);
      record_large_value(sink, v, t, k_bands[n], ctx);
    }
    sink.fixed_bit((levels[n] < 0) as u32, 128);
    let next_ctx = if v == 1 { 1 } else { 2 };
    n += 1;
    ctx = next_ctx;
    if n >= count {
      break;
    }
  }
  if n < 16 {
    sink.ctx_bit(0, t, k_bands[n], ctx, 0); // end-of-block
  }
  true
}

// The per-macroblock residual layout shared by recording and costing
pub struct MbResiduals<'a> {
  pub is_i4: bool,
  pub levels: &'a [i16; 400],
  pub counts_y: &'a [u8; 16],
  pub counts_uv: &'a [u8; 8],
  pub count_dc: u8,
}

fn block_levels(levels: &[i16; 400], k: usize) -> &[i16; 16] {
  levels[k * 16..k * 16 + 16].try_into().unwrap()
}

// Walk the whole macroblock, updating the 9-entry context arrays in
// place. `left_dc` is the ninth left context, carried across the row.
pub fn record_mb(
  tokens: Option<&mut TokenBuffer>,
  stats: Option<&mut Stats>,
  res: &MbResiduals,
  top_nz: &mut [u8; 9],
  left_nz: &mut [u8; 9],
  left_dc: &mut u8,
) {
  let mut sink = Sink { tokens: tokens, stats: stats };
  if let Some(tok) = sink.tokens.as_deref_mut() {
    tok.begin_mb();
  }
  let (y_type, first) = if res.is_i4 {
    (TYPE_Y_NO_Y2, 0)
  } else {
    let ctx = (top_nz[8] + *left_dc) as usize;
    let nz = record_block(
      &mut sink,
      TYPE_Y2,
      ctx,
      0,
      block_levels(res.levels, 24),
      res.count_dc as usize,
    );
    top_nz[8] = nz as u8;
    *left_dc = nz as u8;
    (TYPE_Y_AFTER_Y2, 1)
  };
  for y in 0..4 {
    for x in 0..4 {
      let k = y * 4 + x;
      let ctx = (top_nz[x] + left_nz[y]) as usize;
      let nz = record_block(
        &mut sink,
        y_type,
        ctx,
        first,
        block_levels(res.levels, k),
        res.counts_y[k] as usize,
      );
      top_nz[x] = nz as u8;
      left_nz[y] = nz as u8;
    }
  }
  for ch in [0usize, 2] {
    for y in 0..2 {
      for x in 0..2 {
        let k = 16 + 2 * ch + y * 2 + x;
        let ctx = (top_nz[4 + ch + x] + left_nz[4 + ch + y]) as usize;
        let nz = record_block(
          &mut sink,
          TYPE_UV,
          ctx,
          0,
          block_levels(res.levels, k),
          res.counts_uv[2 * ch + y * 2 + x] as usize,
        );
        top_nz[4 + ch + x] = nz as u8;
        left_nz[4 + ch + y] = nz as u8;
      }
    }
  }
  if let Some(tok) = sink.tokens.as_deref_mut() {
    tok.end_mb();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::k_zigzag;
  use crate::entropycode::EntropyReader;

  // Decode one block with unit dequantization, mirroring decoder.rs
  fn decode_block_raw(r: &mut EntropyReader, proba: &Proba, t: usize, ctx: usize, first: usize) -> [i16; 16] {
    let mut out = [0i16; 16];
    let mut n = first;
    let probs = &proba.coeffs;
    let mut p: &[u8; NUM_PROBAS] = &probs[t][k_bands[n]][ctx];
    while n < 16 {
      if r.read_bit(p[0]) == 0 {
        return out;
      }
      while r.read_bit(p[1]) == 0 {
        n += 1;
        if n == 16 {
          return out;
        }
        p = &probs[t][k_bands[n]][0];
      }
      let v;
      let next_ctx;
      if r.read_bit(p[2]) == 0 {
        v = 1;
        next_ctx = 1;
      } else {
        v = decode_large(r, p);
        next_ctx = 2;
      }
      let signed = if r.read_bit(128) != 0 { -v } else { v };
      out[k_zigzag[n]] = signed as i16;
      n += 1;
      if n == 16 {
        return out;
      }
      p = &probs[t][k_bands[n]][next_ctx];
    }
    out
  }

  fn decode_large(r: &mut EntropyReader, p: &[u8; NUM_PROBAS]) -> i32 {
    if r.read_bit(p[3]) == 0 {
      if r.read_bit(p[4]) == 0 { 2 } else { 3 + r.read_bit(p[5]) as i32 }
    } else if r.read_bit(p[6]) == 0 {
      if r.read_bit(p[7]) == 0 {
        5 + r.read_bit(159) as i32
      } else {
        7 + 2 * r.read_bit(165) as i32 + r.read_bit(145) as i32
      }
    } else {
      let bit1 = r.read_bit(p[8]) as usize;
      let bit0 = r.read_bit(p[9 + bit1]) as usize;
      let cat = 2 * bit1 + bit0;
      let mut v = 0i32;
      for &pp in cat_probs(cat) {
        v = 2 * v + r.read_bit(pp) as i32;
      }
      v + cat_base(cat)
    }
  }

  fn roundtrip_one_block(zz_levels: [i16; 16], first: usize) {
    let proba = Proba::new();
    let mut tokens = TokenBuffer::new();
    tokens.begin_mb();
    let mut sink = Sink { tokens: Some(&mut tokens), stats: None };
    let count = (0..16).rev().find(|&i| zz_levels[i] != 0).map_or(0, |i| i + 1);
    record_block(&mut sink, TYPE_Y_NO_Y2, 0, first, &zz_levels, count);
    tokens.end_mb();

    let mut w = EntropyWriter::new();
    tokens.emit_mb(0, &mut w, &proba);
    let data = w.finalize();
    let mut r = EntropyReader::new(&data);
    let decoded = decode_block_raw(&mut r, &proba, TYPE_Y_NO_Y2, 0, first);
    for n in first..16 {
      assert_eq!(decoded[k_zigzag[n]], zz_levels[n], "zigzag position {}", n);
    }
  }

  #[test]
  fn block_roundtrips() {
    roundtrip_one_block([0; 16], 0);
    let mut lv = [0i16; 16];
    lv[0] = 5;
    roundtrip_one_block(lv, 0);
    lv = [0; 16];
    lv[0] = -1;
    lv[3] = 2;
    lv[9] = -70;
    roundtrip_one_block(lv, 0);
    // every value-coding branch
    lv = [1, -2, 3, 4, -5, 6, 7, 10, 11, 18, 19, 34, 35, 66, 67, -800];
    roundtrip_one_block(lv, 0);
    // ac-only block
    lv = [0, 4, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, -1];
    roundtrip_one_block(lv, 1);
  }

  #[test]
  fn nz_mask_roundtrip() {
    let (top, left) = nz_to_ctx(0x01ff_ffff, 0);
    assert_eq!(top, [1; 9]);
    assert_eq!(left, [0; 9]);
    let mask = ctx_to_nz(&[1; 9], &[1; 9]);
    let (top2, _) = nz_to_ctx(mask, mask);
    assert_eq!(top2, [1; 9]);
  }
}
