// Copyright (c) 2024-2025, The tinywebp contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause/

// VP8 keyframe decoder: frame tag and picture header, partition-0
// subsections, token partition split, then per-row mode parsing,
// coefficient decoding, reconstruction and loop filtering.

use log::debug;

use crate::consts::*;
use crate::dsp;
use crate::dsp::{I4Ctx, PredCtx};
use crate::entropycode::EntropyReader;
use crate::enums::*;
use crate::error::{Error, Result};
use crate::frame::YuvFrame;
use crate::loopfilter;
use crate::loopfilter::FilterInfo;
use crate::proba::*;
use crate::quant::DequantFactors;
use crate::util::clamp;

pub const VP8_MAGIC: [u8; 3] = [0x9d, 0x01, 0x2a];

// Decoded planes handed back to the caller. The planes stay padded to
// whole macroblocks; width/height give the visible crop.
pub struct DecodedFrame {
  pub width: usize,
  pub height: usize,
  pub y: Vec<u8>,
  pub y_stride: usize,
  pub u: Vec<u8>,
  pub v: Vec<u8>,
  pub uv_stride: usize,
}

#[derive(Default)]
struct SegmentHeader {
  use_segment: bool,
  update_map: bool,
  absolute: bool,
  quant: [i32; NUM_MB_SEGMENTS],
  filter: [i32; NUM_MB_SEGMENTS],
  tree_probs: [u8; 3],
}

#[derive(Default)]
struct FilterHeader {
  simple: bool,
  level: i32,
  sharpness: i32,
  use_lf_delta: bool,
  ref_deltas: [i32; 4],
  mode_deltas: [i32; 4],
}

// Modes of one macroblock
#[derive(Clone)]
struct MbModes {
  segment: u8,
  is_i4: bool,
  ymode: u8,
  uv_mode: u8,
  i4: [u8; 16],
}

// Coefficients of one macroblock: 16 luma blocks, 4 U, 4 V, then the
// WHT block at offset 384. counts[k] is the scan-order EOB of block k.
struct MbData {
  coeffs: [i16; 400],
  counts: [u8; 25],
}

const BLOCK_Y2: usize = 24;

fn i16_to_bmode(mode: u8) -> u8 {
  match mode {
    DC_PRED => B_DC_PRED,
    V_PRED => B_VE_PRED,
    H_PRED => B_HE_PRED,
    _ => B_TM_PRED,
  }
}

pub struct Vp8Decoder {
  // pooled output frame, reused while the size stays the same
  frame: Option<YuvFrame>,
}

pub fn decode_frame(data: &[u8]) -> Result<DecodedFrame> {
  Vp8Decoder::new().decode(data)
}

impl Vp8Decoder {
  pub fn new() -> Self {
    Self { frame: None }
  }

  pub fn decode(&mut self, data: &[u8]) -> Result<DecodedFrame> {
    if data.len() < 10 {
      return Err(Error::BadSignature);
    }
    let tag = data[0] as u32 | (data[1] as u32) << 8 | (data[2] as u32) << 16;
    let keyframe = tag & 1 == 0;
    let profile = (tag >> 1) & 7;
    let show = (tag >> 4) & 1;
    let p0_len = (tag >> 5) as usize;
    if !keyframe || profile > 3 {
      return Err(Error::BadSignature);
    }
    if data[3..6] != VP8_MAGIC {
      return Err(Error::BadSignature);
    }
    let w16 = data[6] as usize | (data[7] as usize) << 8;
    let h16 = data[8] as usize | (data[9] as usize) << 8;
    let width = w16 & 0x3fff;
    let height = h16 & 0x3fff;
    if width == 0 || height == 0 {
      return Err(Error::ZeroDimension);
    }
    debug!(
      "frame tag: {}x{} show={} partition0={}B",
      width, height, show, p0_len
    );

    let rest = &data[10..];
    if p0_len == 0 || p0_len > rest.len() {
      return Err(Error::BadPartition("partition 0 length out of range"));
    }
    let mut br0 = EntropyReader::new(&rest[..p0_len]);

    // keyframe-only colorspace and clamp bits
    let _color_space = br0.read_flag();
    let _clamp_type = br0.read_flag();

    let seg_hdr = parse_segment_header(&mut br0);
    let filt_hdr = parse_filter_header(&mut br0);

    // token partition layout
    let log2_parts = br0.read_value(2) as usize;
    let num_parts = 1usize << log2_parts;
    let parts_area = &rest[p0_len..];
    let sizes_len = 3 * (num_parts - 1);
    if parts_area.len() < sizes_len {
      return Err(Error::BadPartition("missing partition size table"));
    }
    let mut partitions: Vec<&[u8]> = Vec::with_capacity(num_parts);
    let mut body = &parts_area[sizes_len..];
    for p in 0..num_parts - 1 {
      let sz = parts_area[3 * p] as usize
        | (parts_area[3 * p + 1] as usize) << 8
        | (parts_area[3 * p + 2] as usize) << 16;
      if sz > body.len() {
        return Err(Error::BadPartition("partition size out of range"));
      }
      partitions.push(&body[..sz]);
      body = &body[sz..];
    }
    // the last partition runs to the end of input and may be empty;
    // exhaustion is only reported if coefficients are actually read
    partitions.push(body);

    // quantizer indices
    let base_q = br0.read_value(7) as i32;
    let dq_y1_dc = read_cond_signed(&mut br0, 4);
    let dq_y2_dc = read_cond_signed(&mut br0, 4);
    let dq_y2_ac = read_cond_signed(&mut br0, 4);
    let dq_uv_dc = read_cond_signed(&mut br0, 4);
    let dq_uv_ac = read_cond_signed(&mut br0, 4);

    let mut dequants = [DequantFactors::default(); NUM_MB_SEGMENTS];
    for s in 0..NUM_MB_SEGMENTS {
      let q = if seg_hdr.use_segment {
        if seg_hdr.absolute {
          seg_hdr.quant[s]
        } else {
          base_q + seg_hdr.quant[s]
        }
      } else {
        base_q
      };
      dequants[s] = DequantFactors::new(clamp(q, 0, 127), dq_y1_dc, dq_y2_dc, dq_y2_ac, dq_uv_dc, dq_uv_ac);
    }

    let _refresh = br0.read_flag(); // always zero for keyframes
    let mut proba = Proba::new();
    proba.segments = seg_hdr.tree_probs;
    proba.parse_updates(&mut br0);
    if br0.is_eof() {
      return Err(Error::PrematureEof);
    }

    let mb_w = (width + 15) / 16;
    let mb_h = (height + 15) / 16;
    match &self.frame {
      Some(f) if f.crop_width == width && f.crop_height == height => {}
      _ => self.frame = Some(YuvFrame::new(width, height)),
    }
    let mut frame = self.frame.take().unwrap();

    let mut token_readers: Vec<EntropyReader> =
      partitions.iter().map(|p| EntropyReader::new(p)).collect();

    // per-(segment, is_i4) filter parameters
    let mut filter_infos = [[FilterInfo::default(); 2]; NUM_MB_SEGMENTS];
    if filt_hdr.level > 0 {
      for s in 0..NUM_MB_SEGMENTS {
        let base = if seg_hdr.use_segment {
          if seg_hdr.absolute {
            seg_hdr.filter[s]
          } else {
            filt_hdr.level + seg_hdr.filter[s]
          }
        } else {
          filt_hdr.level
        };
        for i4 in 0..2 {
          let mut level = base;
          if filt_hdr.use_lf_delta {
            level += filt_hdr.ref_deltas[0];
            if i4 == 1 {
              level += filt_hdr.mode_deltas[0];
            }
          }
          filter_infos[s][i4] = loopfilter::compute_filter_info(clamp(level, 0, 63), filt_hdr.sharpness);
        }
      }
    }

    // context rows
    let mut top_bmodes = vec![B_DC_PRED; mb_w * 4];
    let mut top_nz_y = vec![0u8; mb_w * 4];
    let mut top_nz_u = vec![0u8; mb_w * 2];
    let mut top_nz_v = vec![0u8; mb_w * 2];
    let mut top_nz_dc = vec![0u8; mb_w];
    let mut top_y = vec![0u8; mb_w * 16];
    let mut top_u = vec![0u8; mb_w * 8];
    let mut top_v = vec![0u8; mb_w * 8];

    let mut row_filter: Vec<(u8, bool, bool)> = vec![(0, false, false); mb_w];

    for mb_y in 0..mb_h {
      let mut left_bmodes = [B_DC_PRED; 4];
      let mut left_nz_y = [0u8; 4];
      let mut left_nz_u = [0u8; 2];
      let mut left_nz_v = [0u8; 2];
      let mut left_nz_dc = 0u8;
      let mut left_y = [0u8; 16];
      let mut left_u = [0u8; 8];
      let mut left_v = [0u8; 8];
      let mut corner_y = 0u8;
      let mut corner_u = 0u8;
      let mut corner_v = 0u8;

      let token_br = &mut token_readers[mb_y & (num_parts - 1)];

      for mb_x in 0..mb_w {
        let (modes, skipped) = parse_mb_modes(
          &mut br0,
          &seg_hdr,
          &proba,
          mb_x,
          &mut top_bmodes,
          &mut left_bmodes,
        )?;
        if br0.is_eof() {
          return Err(Error::PrematureEof);
        }

        let mut data = MbData { coeffs: [0; 400], counts: [0; 25] };
        let dq = &dequants[modes.segment as usize];
        let mut any_nz = false;
        if !skipped {
          any_nz = decode_mb_coeffs(
            token_br,
            &proba,
            &modes,
            dq,
            &mut data,
            mb_x,
            &mut top_nz_y,
            &mut top_nz_u,
            &mut top_nz_v,
            &mut top_nz_dc,
            &mut left_nz_y,
            &mut left_nz_u,
            &mut left_nz_v,
            &mut left_nz_dc,
          );
          if token_br.is_eof() {
            return Err(Error::PrematureEof);
          }
        } else {
          // a skipped macroblock clears its contexts; the WHT context
          // only exists for intra-16 macroblocks
          for i in 0..4 {
            top_nz_y[mb_x * 4 + i] = 0;
            left_nz_y[i] = 0;
          }
          for i in 0..2 {
            top_nz_u[mb_x * 2 + i] = 0;
            left_nz_u[i] = 0;
            top_nz_v[mb_x * 2 + i] = 0;
            left_nz_v[i] = 0;
          }
          if !modes.is_i4 {
            top_nz_dc[mb_x] = 0;
            left_nz_dc = 0;
          }
        }

        reconstruct_mb(
          &mut frame,
          mb_x,
          mb_y,
          mb_w,
          &modes,
          &data,
          &mut top_y,
          &mut top_u,
          &mut top_v,
          &mut left_y,
          &mut left_u,
          &mut left_v,
          &mut corner_y,
          &mut corner_u,
          &mut corner_v,
        );

        row_filter[mb_x] = (modes.segment, modes.is_i4, any_nz || modes.is_i4);
      }

      if filt_hdr.level > 0 {
        for mb_x in 0..mb_w {
          let (seg, is_i4, inner) = row_filter[mb_x];
          let info = &filter_infos[seg as usize][is_i4 as usize];
          if filt_hdr.simple {
            loopfilter::filter_mb_simple(&mut frame.y, mb_x, mb_y, info, inner);
          } else {
            loopfilter::filter_mb_complex(
              &mut frame.y, &mut frame.u, &mut frame.v, mb_x, mb_y, info, inner,
            );
          }
        }
      }
    }

    let out = DecodedFrame {
      width: width,
      height: height,
      y: frame.y.data.clone(),
      y_stride: frame.y.stride,
      u: frame.u.data.clone(),
      v: frame.v.data.clone(),
      uv_stride: frame.u.stride,
    };
    self.frame = Some(frame);
    Ok(out)
  }
}

fn read_cond_signed(r: &mut EntropyReader, nbits: u32) -> i32 {
  if r.read_flag() {
    r.read_signed_value(nbits)
  } else {
    0
  }
}

fn parse_segment_header(r: &mut EntropyReader) -> SegmentHeader {
  let mut h = SegmentHeader::default();
  h.tree_probs = [255; 3];
  h.use_segment = r.read_flag();
  if !h.use_segment {
    return h;
  }
  h.update_map = r.read_flag();
  let update_data = r.read_flag();
  if update_data {
    h.absolute = r.read_flag();
    for s in 0..NUM_MB_SEGMENTS {
      h.quant[s] = read_cond_signed(r, 7);
    }
    for s in 0..NUM_MB_SEGMENTS {
      h.filter[s] = read_cond_signed(r, 6);
    }
  }
  if h.update_map {
    for i in 0..3 {
      h.tree_probs[i] = if r.read_flag() { r.read_value(8) as u8 } else { 255 };
    }
  }
  h
}

fn parse_filter_header(r: &mut EntropyReader) -> FilterHeader {
  let mut h = FilterHeader::default();
  h.simple = r.read_flag();
  h.level = r.read_value(6) as i32;
  h.sharpness = r.read_value(3) as i32;
  h.use_lf_delta = r.read_flag();
  if h.use_lf_delta {
    if r.read_flag() {
      for i in 0..4 {
        h.ref_deltas[i] = read_cond_signed(r, 6);
      }
      for i in 0..4 {
        h.mode_deltas[i] = read_cond_signed(r, 6);
      }
    }
  }
  h
}

fn parse_mb_modes(
  r: &mut EntropyReader,
  seg_hdr: &SegmentHeader,
  proba: &Proba,
  mb_x: usize,
  top_bmodes: &mut [u8],
  left_bmodes: &mut [u8; 4],
) -> Result<(MbModes, bool)> {
  let segment = if seg_hdr.use_segment && seg_hdr.update_map {
    read_segment_id(r, &proba.segments)
  } else {
    0
  };
  let skipped = proba.use_skip && r.read_bit(proba.skip_proba) != 0;
  let is_i4 = r.read_bit(PROBA_IS_I16) == 0;
  let mut modes = MbModes {
    segment: segment,
    is_i4: is_i4,
    ymode: DC_PRED,
    uv_mode: DC_PRED,
    i4: [B_DC_PRED; 16],
  };
  if is_i4 {
    for by in 0..4 {
      for bx in 0..4 {
        let top = if by == 0 {
          top_bmodes[mb_x * 4 + bx]
        } else {
          modes.i4[(by - 1) * 4 + bx]
        };
        let left = if bx == 0 { left_bmodes[by] } else { modes.i4[by * 4 + bx - 1] };
        let mode = read_i4_mode(r, top, left);
        if mode >= NUM_BMODES as u8 {
          return Err(Error::InvalidMode(mode));
        }
        modes.i4[by * 4 + bx] = mode;
      }
    }
    for bx in 0..4 {
      top_bmodes[mb_x * 4 + bx] = modes.i4[12 + bx];
    }
    for by in 0..4 {
      left_bmodes[by] = modes.i4[by * 4 + 3];
    }
  } else {
    modes.ymode = read_i16_mode(r);
    let b = i16_to_bmode(modes.ymode);
    for bx in 0..4 {
      top_bmodes[mb_x * 4 + bx] = b;
    }
    *left_bmodes = [b; 4];
  }
  modes.uv_mode = read_uv_mode(r);
  Ok((modes, skipped))
}

// Decode one block's coefficients. Returns the scan-order EOB position.
fn decode_block(
  r: &mut EntropyReader,
  probs: &CoeffProbas,
  t: usize,
  ctx0: usize,
  first: usize,
  dq_dc: i32,
  dq_ac: i32,
  out: &mut [i16],
) -> usize {
  let mut n = first;
  let mut p: &[u8; NUM_PROBAS] = &probs[t][k_bands[n]][ctx0];
  while n < 16 {
    if r.read_bit(p[0]) == 0 {
      return n;
    }
    // zero run
    while r.read_bit(p[1]) == 0 {
      n += 1;
      if n == 16 {
        return 16;
      }
      p = &probs[t][k_bands[n]][0];
    }
    // non-zero value
    let v;
    let next_ctx;
    if r.read_bit(p[2]) == 0 {
      v = 1;
      next_ctx = 1;
    } else {
      v = decode_large_value(r, p);
      next_ctx = 2;
    }
    let signed = if r.read_bit(128) != 0 { -v } else { v };
    let dq = if n > 0 { dq_ac } else { dq_dc };
    out[k_zigzag[n]] = (signed * dq) as i16;
    n += 1;
    if n == 16 {
      return 16;
    }
    p = &probs[t][k_bands[n]][next_ctx];
  }
  16
}

fn decode_large_value(r: &mut EntropyReader, p: &[u8; NUM_PROBAS]) -> i32 {
  if r.read_bit(p[3]) == 0 {
    if r.read_bit(p[4]) == 0 {
      2
    } else {
      3 + r.read_bit(p[5]) as i32
    }
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

fn decode_mb_coeffs(
  r: &mut EntropyReader,
  proba: &Proba,
  modes: &MbModes,
  dq: &DequantFactors,
  data: &mut MbData,
  mb_x: usize,
  top_nz_y: &mut [u8],
  top_nz_u: &mut [u8],
  top_nz_v: &mut [u8],
  top_nz_dc: &mut [u8],
  left_nz_y: &mut [u8; 4],
  left_nz_u: &mut [u8; 2],
  left_nz_v: &mut [u8; 2],
  left_nz_dc: &mut u8,
) -> bool {
  let probs = &proba.coeffs;
  let mut any_nz = false;

  let (y_type, first) = if modes.is_i4 {
    (TYPE_Y_NO_Y2, 0)
  } else {
    // the WHT block comes first
    let ctx = (top_nz_dc[mb_x] + *left_nz_dc) as usize;
    let n = decode_block(
      r,
      probs,
      TYPE_Y2,
      ctx,
      0,
      dq.y2_dc,
      dq.y2_ac,
      &mut data.coeffs[BLOCK_Y2 * 16..BLOCK_Y2 * 16 + 16],
    );
    data.counts[BLOCK_Y2] = n as u8;
    let nz = (n > 0) as u8;
    top_nz_dc[mb_x] = nz;
    *left_nz_dc = nz;
    any_nz |= nz != 0;
    (TYPE_Y_AFTER_Y2, 1)
  };

  for by in 0..4 {
    let mut l = left_nz_y[by];
    for bx in 0..4 {
      let k = by * 4 + bx;
      let ctx = (l + top_nz_y[mb_x * 4 + bx]) as usize;
      let n = decode_block(
        r,
        probs,
        y_type,
        ctx,
        first,
        dq.y1_dc,
        dq.y1_ac,
        &mut data.coeffs[k * 16..k * 16 + 16],
      );
      data.counts[k] = n as u8;
      let nz = (n > first) as u8;
      l = nz;
      top_nz_y[mb_x * 4 + bx] = nz;
      any_nz |= nz != 0;
    }
    left_nz_y[by] = l;
  }

  for (ch, (top_nz, left_nz)) in [(0usize, (&mut *top_nz_u, &mut *left_nz_u)), (1, (&mut *top_nz_v, &mut *left_nz_v))] {
    for by in 0..2 {
      let mut l = left_nz[by];
      for bx in 0..2 {
        let k = 16 + ch * 4 + by * 2 + bx;
        let ctx = (l + top_nz[mb_x * 2 + bx]) as usize;
        let n = decode_block(
          r,
          probs,
          TYPE_UV,
          ctx,
          0,
          dq.uv_dc,
          dq.uv_ac,
          &mut data.coeffs[k * 16..k * 16 + 16],
        );
        data.counts[k] = n as u8;
        let nz = (n > 0) as u8;
        l = nz;
        top_nz[mb_x * 2 + bx] = nz;
        any_nz |= nz != 0;
      }
      left_nz[by] = l;
    }
  }
  any_nz
}

// Apply one block's inverse transform, choosing the cheap DC-only path
// when the block has no AC coefficients
fn apply_block(dst: &mut [u8], off: usize, coeffs: &[i16; 16], has_ac: bool) {
  if has_ac {
    dsp::itransform_add(dst, off, coeffs);
  } else if coeffs[0] != 0 {
    dsp::itransform_add_dc(dst, off, coeffs[0]);
  }
}

fn reconstruct_mb(
  frame: &mut YuvFrame,
  mb_x: usize,
  mb_y: usize,
  mb_w: usize,
  modes: &MbModes,
  data: &MbData,
  top_y: &mut Vec<u8>,
  top_u: &mut Vec<u8>,
  top_v: &mut Vec<u8>,
  left_y: &mut [u8; 16],
  left_u: &mut [u8; 8],
  left_v: &mut [u8; 8],
  corner_y: &mut u8,
  corner_u: &mut u8,
  corner_v: &mut u8,
) {
  // bordered luma scratch: row 0 and column 0 hold the context pixels
  let mut yb = [0u8; BPS * 17];
  {
    yb[0] = if mb_y == 0 {
      dsp::TOP_DEFAULT
    } else if mb_x == 0 {
      dsp::LEFT_DEFAULT
    } else {
      *corner_y
    };
    for j in 0..16 {
      yb[1 + j] = if mb_y == 0 { dsp::TOP_DEFAULT } else { top_y[mb_x * 16 + j] };
    }
    for j in 0..4 {
      yb[17 + j] = if mb_y == 0 {
        dsp::TOP_DEFAULT
      } else if mb_x + 1 < mb_w {
        top_y[(mb_x + 1) * 16 + j]
      } else {
        top_y[mb_x * 16 + 15]
      };
    }
    for i in 0..16 {
      yb[(1 + i) * BPS] = if mb_x == 0 { dsp::LEFT_DEFAULT } else { left_y[i] };
    }
  }

  if modes.is_i4 {
    for k in 0..16 {
      let (by, bx) = (k / 4, k % 4);
      let row = by * 4; // border row of this block inside yb
      let col = 1 + bx * 4;
      let mut ctx = I4Ctx {
        top_left: yb[row * BPS + col - 1],
        top: [0; 4],
        top_right: [0; 4],
        left: [0; 4],
      };
      for j in 0..4 {
        ctx.top[j] = yb[row * BPS + col + j];
      }
      if bx == 3 {
        // rightmost sub-blocks always take their top-right pixels from
        // the row above the macroblock
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
      let off = (1 + by * 4) * BPS + col;
      dsp::pred_i4(&mut yb, off, modes.i4[k], &ctx);
      let mut block = [0i16; 16];
      block.copy_from_slice(&data.coeffs[k * 16..k * 16 + 16]);
      apply_block(&mut yb, off, &block, data.counts[k] > 1);
    }
  } else {
    let top_arr: [u8; 16] = yb[1..17].try_into().unwrap();
    let left_arr: [u8; 16] = {
      let mut a = [0u8; 16];
      for i in 0..16 {
        a[i] = yb[(1 + i) * BPS];
      }
      a
    };
    let ctx = PredCtx {
      left: if mb_x > 0 { Some(&left_arr) } else { None },
      top: if mb_y > 0 { Some(&top_arr) } else { None },
      top_left: yb[0],
    };
    dsp::pred_block(&mut yb, BPS + 1, modes.ymode, &ctx, 16);

    let mut wht = [0i16; 16];
    wht.copy_from_slice(&data.coeffs[BLOCK_Y2 * 16..BLOCK_Y2 * 16 + 16]);
    let dcs = dsp::itransform_wht(&wht);
    for k in 0..16 {
      let (by, bx) = (k / 4, k % 4);
      let mut block = [0i16; 16];
      block.copy_from_slice(&data.coeffs[k * 16..k * 16 + 16]);
      block[0] = dcs[k];
      let off = (1 + by * 4) * BPS + 1 + bx * 4;
      apply_block(&mut yb, off, &block, data.counts[k] > 1);
    }
  }

  // chroma, both planes through the same bordered path
  let mut ub = [0u8; BPS * 9];
  let mut vb = [0u8; BPS * 9];
  for (plane, border, top, left, corner) in [
    (0usize, &mut ub, &mut *top_u, &mut *left_u, *corner_u),
    (1, &mut vb, &mut *top_v, &mut *left_v, *corner_v),
  ] {
    border[0] = if mb_y == 0 {
      dsp::TOP_DEFAULT
    } else if mb_x == 0 {
      dsp::LEFT_DEFAULT
    } else {
      corner
    };
    for j in 0..8 {
      border[1 + j] = if mb_y == 0 { dsp::TOP_DEFAULT } else { top[mb_x * 8 + j] };
    }
    for i in 0..8 {
      border[(1 + i) * BPS] = if mb_x == 0 { dsp::LEFT_DEFAULT } else { left[i] };
    }
    let top_arr: [u8; 8] = border[1..9].try_into().unwrap();
    let left_arr: [u8; 8] = {
      let mut a = [0u8; 8];
      for i in 0..8 {
        a[i] = border[(1 + i) * BPS];
      }
      a
    };
    let ctx = PredCtx {
      left: if mb_x > 0 { Some(&left_arr) } else { None },
      top: if mb_y > 0 { Some(&top_arr) } else { None },
      top_left: border[0],
    };
    dsp::pred_block(&mut border[..], BPS + 1, modes.uv_mode, &ctx, 8);
    for b in 0..4 {
      let k = 16 + plane * 4 + b;
      let (by, bx) = (b / 2, b % 2);
      let mut block = [0i16; 16];
      block.copy_from_slice(&data.coeffs[k * 16..k * 16 + 16]);
      let off = (1 + by * 4) * BPS + 1 + bx * 4;
      apply_block(&mut border[..], off, &block, data.counts[k] > 1);
    }
  }

  // commit to the frame and rotate the prediction contexts
  for i in 0..16 {
    let dst = (mb_y * 16 + i) * frame.y.stride + mb_x * 16;
    frame.y.data[dst..dst + 16].copy_from_slice(&yb[(1 + i) * BPS + 1..(1 + i) * BPS + 17]);
  }
  for i in 0..8 {
    let dst = (mb_y * 8 + i) * frame.u.stride + mb_x * 8;
    frame.u.data[dst..dst + 8].copy_from_slice(&ub[(1 + i) * BPS + 1..(1 + i) * BPS + 9]);
    frame.v.data[dst..dst + 8].copy_from_slice(&vb[(1 + i) * BPS + 1..(1 + i) * BPS + 9]);
  }

  *corner_y = top_y[mb_x * 16 + 15];
  *corner_u = top_u[mb_x * 8 + 7];
  *corner_v = top_v[mb_x * 8 + 7];
  for j in 0..16 {
    top_y[mb_x * 16 + j] = yb[16 * BPS + 1 + j];
  }
  for i in 0..16 {
    left_y[i] = yb[(1 + i) * BPS + 16];
  }
  for j in 0..8 {
    top_u[mb_x * 8 + j] = ub[8 * BPS + 1 + j];
    top_v[mb_x * 8 + j] = vb[8 * BPS + 1 + j];
  }
  for i in 0..8 {
    left_u[i] = ub[(1 + i) * BPS + 8];
    left_v[i] = vb[(1 + i) * BPS + 8];
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_short_input() {
    assert!(matches!(decode_frame(&[0u8; 4]), Err(Error::BadSignature)));
  }

  #[test]
  fn rejects_bad_magic() {
    let mut data = vec![0u8; 32];
    data[0] = 0x10; // keyframe, some partition length
    data[3] = 0x9d;
    data[4] = 0x01;
    data[5] = 0x2b; // wrong last magic byte
    assert!(matches!(decode_frame(&data), Err(Error::BadSignature)));
  }

  #[test]
  fn rejects_zero_dimensions() {
    let mut data = vec![0u8; 32];
    data[0] = 1 << 5; // partition0 length = 1
    data[3] = 0x9d;
    data[4] = 0x01;
    data[5] = 0x2a;
    // width = height = 0
    assert!(matches!(decode_frame(&data), Err(Error::ZeroDimension)));
  }

  #[test]
  fn rejects_partition_overflow() {
    let mut data = vec![0u8; 12];
    let p0_len = 1000u32; // far larger than the buffer
    let tag = p0_len << 5;
    data[0] = tag as u8;
    data[1] = (tag >> 8) as u8;
    data[2] = (tag >> 16) as u8;
    data[3] = 0x9d;
    data[4] = 0x01;
    data[5] = 0x2a;
    data[6] = 16;
    data[8] = 16;
    assert!(matches!(decode_frame(&data), Err(Error::BadPartition(_))));
  }
}
