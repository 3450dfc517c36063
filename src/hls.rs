// High-level syntax: partition 0 (headers plus per-macroblock modes),
// token partition assembly, and the final frame layout of tag, picture
// header, size table and partitions.

use crate::bitcode::BitWriter;
use crate::encoder::MbInfo;
use crate::entropycode::EntropyWriter;
use crate::enums::*;
use crate::error::{Error, Result};
use crate::proba::*;
use crate::quant::Segment;

pub struct FrameHeaderParams<'a> {
  pub mb_w: usize,
  pub mb_h: usize,
  pub segments: &'a [Segment; NUM_MB_SEGMENTS],
  pub num_segments: usize,
  pub update_map: bool,
  pub proba: &'a Proba,
  pub filter_simple: bool,
  pub filter_level: i32,
  pub filter_sharpness: i32,
  pub base_q: i32,
  pub dq_uv_dc: i32,
  pub dq_uv_ac: i32,
  pub num_parts: usize,
}

// Derive the segment-tree probabilities from the id histogram; 255
// marks a branch that is never taken
pub fn segment_probas(counts: &[usize; NUM_MB_SEGMENTS]) -> [u8; 3] {
  fn get_proba(a: usize, b: usize) -> u8 {
    if a + b > 0 {
      (255 * a / (a + b)) as u8
    } else {
      255
    }
  }
  [
    get_proba(counts[0] + counts[1], counts[2] + counts[3]),
    get_proba(counts[0], counts[1]),
    get_proba(counts[2], counts[3]),
  ]
}

fn put_segment_header(w: &mut EntropyWriter, p: &FrameHeaderParams) {
  if w.put_flag(p.num_segments > 1) {
    w.put_flag(p.update_map);
    let update_data = true;
    w.put_flag(update_data);
    // absolute values, not deltas against the frame quantizer
    w.put_flag(true);
    for s in 0..NUM_MB_SEGMENTS {
      w.put_signed_bits(p.segments[s].quant, 7);
    }
    for s in 0..NUM_MB_SEGMENTS {
      w.put_signed_bits(p.segments[s].fstrength, 6);
    }
    if p.update_map {
      for s in 0..3 {
        if w.put_flag(p.proba.segments[s] != 255) {
          w.put_bits(p.proba.segments[s] as u32, 8);
        }
      }
    }
  }
}

fn put_filter_header(w: &mut EntropyWriter, p: &FrameHeaderParams) {
  w.put_flag(p.filter_simple);
  w.put_bits(p.filter_level as u32, 6);
  w.put_bits(p.filter_sharpness as u32, 3);
  w.put_flag(false); // no loop-filter deltas
}

fn put_quant_params(w: &mut EntropyWriter, p: &FrameHeaderParams) {
  w.put_bits(p.base_q as u32, 7);
  w.put_signed_bits(0, 4); // y1 dc
  w.put_signed_bits(0, 4); // y2 dc
  w.put_signed_bits(0, 4); // y2 ac
  w.put_signed_bits(p.dq_uv_dc, 4);
  w.put_signed_bits(p.dq_uv_ac, 4);
}

fn put_mb_modes(w: &mut EntropyWriter, p: &FrameHeaderParams, infos: &[MbInfo]) {
  let mut top_bmodes = vec![B_DC_PRED; p.mb_w * 4];
  for mb_y in 0..p.mb_h {
    let mut left_bmodes = [B_DC_PRED; 4];
    for mb_x in 0..p.mb_w {
      let info = &infos[mb_y * p.mb_w + mb_x];
      if p.num_segments > 1 && p.update_map {
        write_segment_id(w, &p.proba.segments, info.segment);
      }
      if p.proba.use_skip {
        w.put_bit(info.skip as u32, p.proba.skip_proba);
      }
      if w.put_bit(!info.is_i4 as u32, PROBA_IS_I16) != 0 {
        write_i16_mode(w, info.ymode);
        let b = match info.ymode {
          DC_PRED => B_DC_PRED,
          V_PRED => B_VE_PRED,
          H_PRED => B_HE_PRED,
          _ => B_TM_PRED,
        };
        for bx in 0..4 {
          top_bmodes[mb_x * 4 + bx] = b;
        }
        left_bmodes = [b; 4];
      } else {
        for by in 0..4 {
          for bx in 0..4 {
            let mode = info.i4_modes[by * 4 + bx];
            let top = if by == 0 {
              top_bmodes[mb_x * 4 + bx]
            } else {
              info.i4_modes[(by - 1) * 4 + bx]
            };
            let left = if bx == 0 { left_bmodes[by] } else { info.i4_modes[by * 4 + bx - 1] };
            write_i4_mode(w, mode, top, left);
          }
        }
        for bx in 0..4 {
          top_bmodes[mb_x * 4 + bx] = info.i4_modes[12 + bx];
        }
        for by in 0..4 {
          left_bmodes[by] = info.i4_modes[by * 4 + 3];
        }
      }
      write_uv_mode(w, info.uv_mode);
    }
  }
}

// Assemble partition 0: the two keyframe bits, all sub-headers, the
// probability updates and the per-macroblock modes
pub fn generate_partition0(p: &FrameHeaderParams, infos: &[MbInfo]) -> Vec<u8> {
  let mut w = EntropyWriter::new();
  w.put_flag(false); // color space
  w.put_flag(false); // clamp type
  put_segment_header(&mut w, p);
  put_filter_header(&mut w, p);
  let log2: u32 = match p.num_parts {
    1 => 0,
    2 => 1,
    4 => 2,
    8 => 3,
    _ => unreachable!("partition count must be 1, 2, 4 or 8"),
  };
  w.put_bits(log2, 2);
  put_quant_params(&mut w, p);
  w.put_flag(false); // no proba refresh across frames
  p.proba.write_updates(&mut w);
  put_mb_modes(&mut w, p, infos);
  w.finalize()
}

// The 3-byte frame tag plus the 7-byte picture header
fn frame_tag(width: usize, height: usize, partition0_len: usize) -> Vec<u8> {
  let mut w = BitWriter::new();
  w.write_bits(0, 1); // keyframe
  w.write_bits(0, 3); // profile
  w.write_bits(1, 1); // show frame
  w.write_bits(partition0_len as u32, 19);
  let mut bytes = w.finalize();
  bytes.extend_from_slice(&crate::decoder::VP8_MAGIC);
  bytes.push((width & 0xff) as u8);
  bytes.push(((width >> 8) & 0x3f) as u8); // scale bits zero
  bytes.push((height & 0xff) as u8);
  bytes.push(((height >> 8) & 0x3f) as u8);
  bytes
}

// Glue everything into the final VP8 frame payload
pub fn assemble_frame(
  width: usize,
  height: usize,
  partition0: &[u8],
  partitions: &[Vec<u8>],
) -> Result<Vec<u8>> {
  if width == 0 || height == 0 {
    return Err(Error::ZeroDimension);
  }
  assert!(width < (1 << 14) && height < (1 << 14));
  if partition0.len() >= (1 << 19) {
    return Err(Error::BadPartition("partition 0 too large"));
  }
  let mut out = frame_tag(width, height, partition0.len());
  out.extend_from_slice(partition0);
  for part in &partitions[..partitions.len() - 1] {
    let sz = part.len();
    assert!(sz < (1 << 24));
    out.push((sz & 0xff) as u8);
    out.push(((sz >> 8) & 0xff) as u8);
    out.push(((sz >> 16) & 0xff) as u8);
  }
  for part in partitions {
    out.extend_from_slice(part);
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_tag_fields() {
    let tag = frame_tag(320, 240, 77);
    assert_eq!(tag.len(), 10);
    let bits = tag[0] as u32 | (tag[1] as u32) << 8 | (tag[2] as u32) << 16;
    assert_eq!(bits & 1, 0);
    assert_eq!((bits >> 1) & 7, 0);
    assert_eq!((bits >> 4) & 1, 1);
    assert_eq!(bits >> 5, 77);
    assert_eq!(&tag[3..6], &crate::decoder::VP8_MAGIC);
    assert_eq!(tag[6] as usize | ((tag[7] as usize) << 8), 320);
    assert_eq!(tag[8] as usize | ((tag[9] as usize) << 8), 240);
  }

  #[test]
  fn segment_probas_from_histogram() {
    // all macroblocks in segment 0: every branch resolves to "left"
    assert_eq!(segment_probas(&[100, 0, 0, 0]), [255, 255, 255]);
    // an even split keeps the tree balanced
    let p = segment_probas(&[25, 25, 25, 25]);
    assert_eq!(p[0], 127);
    assert_eq!(p[1], 127);
  }
}
