// Animated WebP: the frame model, the canvas reconstruction state
// machine (blend x dispose over a dual canvas), the keyframe predicate,
// and muxing/demuxing of the animation chunks.

use log::debug;

use crate::array2d::RgbaImage;
use crate::backend::FrameDecoder;
use crate::config::clamp_loop_count;
use crate::error::{Error, Result};
use crate::riff;
use crate::riff::{AnmfHeader, Chunk};

pub const MAX_DURATION_MS: u32 = 0xff_ffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Blend {
  Alpha,
  None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispose {
  None,
  Background,
}

#[derive(Clone)]
pub struct AnimFrame {
  pub offset_x: usize,
  pub offset_y: usize,
  pub width: usize,
  pub height: usize,
  pub duration_ms: u32,
  pub blend: Blend,
  pub dispose: Dispose,
  // VP8 or VP8L bitstream
  pub payload: Vec<u8>,
  pub is_lossless: bool,
  // standalone ALPH payload, lossy frames only
  pub alpha: Option<Vec<u8>>,
  pub has_alpha: bool,
  // decoded pixels, when already materialized
  pub image: Option<RgbaImage>,
}

#[derive(Clone)]
pub struct Animation {
  pub canvas_width: usize,
  pub canvas_height: usize,
  // stored in the container; never used for canvas initialization
  pub background_color: [u8; 4],
  pub loop_count: u16,
  pub frames: Vec<AnimFrame>,
  pub icc: Option<Vec<u8>>,
  pub exif: Option<Vec<u8>>,
  pub xmp: Option<Vec<u8>>,
}

// The alpha bit of a VP8L bitstream header
pub fn vp8l_has_alpha(payload: &[u8]) -> bool {
  if payload.len() < 5 || payload[0] != 0x2f {
    return false;
  }
  let bits = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
  (bits >> 28) & 1 != 0
}

impl Animation {
  pub fn new(canvas_width: usize, canvas_height: usize) -> Self {
    Self {
      canvas_width: canvas_width,
      canvas_height: canvas_height,
      background_color: [0; 4],
      loop_count: 0,
      frames: Vec::new(),
      icc: None,
      exif: None,
      xmp: None,
    }
  }

  // Frame 0 is always a keyframe. Later frames are keyframes when they
  // repaint the whole canvas opaquely, or when the previous frame left
  // the whole canvas transparent behind itself. Out-of-range indices
  // are simply not keyframes.
  pub fn is_keyframe(&self, i: usize) -> bool {
    if i >= self.frames.len() {
      return false;
    }
    if i == 0 {
      return true;
    }
    let f = &self.frames[i];
    let full = f.offset_x == 0
      && f.offset_y == 0
      && f.width == self.canvas_width
      && f.height == self.canvas_height;
    if full && (f.blend == Blend::None || !f.has_alpha) {
      return true;
    }
    let prev = &self.frames[i - 1];
    let prev_full = prev.offset_x == 0
      && prev.offset_y == 0
      && prev.width == self.canvas_width
      && prev.height == self.canvas_height;
    prev_full && prev.dispose == Dispose::Background
  }

  // Materialize every frame through the canvas engine
  pub fn decode_frames(&self, decoder: &dyn FrameDecoder) -> Result<Vec<(RgbaImage, u32)>> {
    let mut out = Vec::with_capacity(self.frames.len());
    let mut dec = AnimationDecoder::new(self)?;
    while dec.has_more() {
      out.push(dec.next_frame(Some(decoder))?);
    }
    Ok(out)
  }

  pub fn from_bytes(data: &[u8]) -> Result<Animation> {
    let chunks = riff::parse_container(data)?;
    if chunks.is_empty() {
      return Err(Error::BadContainer);
    }
    // a plain still file becomes a one-frame animation
    if chunks[0].id == riff::FOURCC_VP8 || chunks[0].id == riff::FOURCC_VP8L {
      let payload = chunks[0].payload.to_vec();
      let lossless = chunks[0].id == riff::FOURCC_VP8L;
      let (w, h) = still_dimensions(&chunks[0])?;
      let mut anim = Animation::new(w, h);
      anim.frames.push(AnimFrame {
        offset_x: 0,
        offset_y: 0,
        width: w,
        height: h,
        duration_ms: 0,
        blend: Blend::None,
        dispose: Dispose::None,
        has_alpha: lossless && vp8l_has_alpha(&payload),
        is_lossless: lossless,
        payload: payload,
        alpha: None,
        image: None,
      });
      return Ok(anim);
    }
    if chunks[0].id != riff::FOURCC_VP8X {
      return Err(Error::BadContainer);
    }
    let (_flags, w, h) = riff::parse_vp8x(chunks[0].payload)?;
    let mut anim = Animation::new(w, h);
    for chunk in &chunks[1..] {
      match chunk.id {
        riff::FOURCC_ANIM => {
          let (bg, loops) = riff::parse_anim(chunk.payload)?;
          anim.background_color = bg;
          anim.loop_count = loops;
        }
        riff::FOURCC_ANMF => anim.frames.push(parse_anmf(chunk.payload)?),
        riff::FOURCC_ICCP => anim.icc = Some(chunk.payload.to_vec()),
        riff::FOURCC_EXIF => anim.exif = Some(chunk.payload.to_vec()),
        riff::FOURCC_XMP => anim.xmp = Some(chunk.payload.to_vec()),
        _ => debug!("ignoring chunk {:?}", std::str::from_utf8(&chunk.id).unwrap_or("?")),
      }
    }
    Ok(anim)
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    let mut w = riff::RiffWriter::new();
    let mut flags = riff::FLAG_ANIM;
    if self.frames.iter().any(|f| f.has_alpha) {
      flags |= riff::FLAG_ALPHA;
    }
    if self.icc.is_some() {
      flags |= riff::FLAG_ICCP;
    }
    if self.exif.is_some() {
      flags |= riff::FLAG_EXIF;
    }
    if self.xmp.is_some() {
      flags |= riff::FLAG_XMP;
    }
    w.push_chunk(&riff::FOURCC_VP8X, &riff::pack_vp8x(flags, self.canvas_width, self.canvas_height));
    if let Some(icc) = &self.icc {
      w.push_chunk(&riff::FOURCC_ICCP, icc);
    }
    w.push_chunk(
      &riff::FOURCC_ANIM,
      &riff::pack_anim(self.background_color, clamp_loop_count(self.loop_count as i64)),
    );
    for f in &self.frames {
      let mut payload = riff::pack_anmf_header(&AnmfHeader {
        offset_x: f.offset_x,
        offset_y: f.offset_y,
        width: f.width,
        height: f.height,
        duration_ms: f.duration_ms,
        blend_none: f.blend == Blend::None,
        dispose_background: f.dispose == Dispose::Background,
      });
      if let Some(alpha) = &f.alpha {
        append_chunk(&mut payload, &riff::FOURCC_ALPH, alpha);
      }
      let id = if f.is_lossless { riff::FOURCC_VP8L } else { riff::FOURCC_VP8 };
      append_chunk(&mut payload, &id, &f.payload);
      w.push_chunk(&riff::FOURCC_ANMF, &payload);
    }
    if let Some(exif) = &self.exif {
      w.push_chunk(&riff::FOURCC_EXIF, exif);
    }
    if let Some(xmp) = &self.xmp {
      w.push_chunk(&riff::FOURCC_XMP, xmp);
    }
    w.finalize()
  }
}

fn append_chunk(dst: &mut Vec<u8>, id: &[u8; 4], payload: &[u8]) {
  dst.extend_from_slice(id);
  dst.extend_from_slice(&(payload.len() as u32).to_le_bytes());
  dst.extend_from_slice(payload);
  if payload.len() & 1 != 0 {
    dst.push(0);
  }
}

fn still_dimensions(chunk: &Chunk) -> Result<(usize, usize)> {
  if chunk.id == riff::FOURCC_VP8 {
    let d = crate::decoder::decode_frame(chunk.payload)?;
    Ok((d.width, d.height))
  } else {
    let p = chunk.payload;
    if p.len() < 5 || p[0] != 0x2f {
      return Err(Error::BadContainer);
    }
    let bits = u32::from_le_bytes([p[1], p[2], p[3], p[4]]);
    Ok((((bits & 0x3fff) + 1) as usize, (((bits >> 14) & 0x3fff) + 1) as usize))
  }
}

fn parse_anmf(payload: &[u8]) -> Result<AnimFrame> {
  let h = riff::parse_anmf_header(payload)?;
  let mut frame = AnimFrame {
    offset_x: h.offset_x,
    offset_y: h.offset_y,
    width: h.width,
    height: h.height,
    duration_ms: h.duration_ms,
    blend: if h.blend_none { Blend::None } else { Blend::Alpha },
    dispose: if h.dispose_background { Dispose::Background } else { Dispose::None },
    payload: Vec::new(),
    is_lossless: false,
    alpha: None,
    has_alpha: false,
    image: None,
  };
  let mut pos = riff::ANMF_HEADER_LEN;
  while pos + 8 <= payload.len() {
    let mut id = [0u8; 4];
    id.copy_from_slice(&payload[pos..pos + 4]);
    let size = u32::from_le_bytes([payload[pos + 4], payload[pos + 5], payload[pos + 6], payload[pos + 7]]) as usize;
    pos += 8;
    if pos + size > payload.len() {
      return Err(Error::BadContainer);
    }
    let body = &payload[pos..pos + size];
    match id {
      riff::FOURCC_ALPH => {
        frame.alpha = Some(body.to_vec());
        frame.has_alpha = true;
      }
      riff::FOURCC_VP8 => frame.payload = body.to_vec(),
      riff::FOURCC_VP8L => {
        frame.payload = body.to_vec();
        frame.is_lossless = true;
        frame.has_alpha |= vp8l_has_alpha(body);
      }
      _ => {}
    }
    pos += size + (size & 1);
  }
  Ok(frame)
}

// ---------------------------------------------------------------------------
// Canvas reconstruction

// The C formula: composite src over dst in non-premultiplied space
pub fn blend_pixel(dst: [u8; 4], src: [u8; 4]) -> [u8; 4] {
  let src_a = src[3] as u32;
  let dst_factor = (dst[3] as u32 * (256 - src_a)) >> 8;
  let blend_a = src_a + dst_factor;
  if blend_a == 0 {
    return [0, 0, 0, 0];
  }
  let scale = (1u64 << 24) / blend_a as u64;
  let mut out = [0u8; 4];
  for c in 0..3 {
    let v = (src[c] as u64 * src_a as u64 + dst[c] as u64 * dst_factor as u64) * scale >> 24;
    out[c] = if v > 255 { 255 } else { v as u8 };
  }
  out[3] = blend_a as u8;
  out
}

pub struct AnimationDecoder<'a> {
  anim: &'a Animation,
  current: RgbaImage,
  prev_disposed: RgbaImage,
  index: usize,
}

impl<'a> AnimationDecoder<'a> {
  pub fn new(anim: &'a Animation) -> Result<Self> {
    if anim.frames.is_empty() {
      return Err(Error::NoFrames);
    }
    let f0 = &anim.frames[0];
    if f0.image.is_none() && f0.payload.is_empty() {
      return Err(Error::NilImage);
    }
    Ok(Self {
      anim: anim,
      current: RgbaImage::zeroed(anim.canvas_height, anim.canvas_width),
      prev_disposed: RgbaImage::zeroed(anim.canvas_height, anim.canvas_width),
      index: 0,
    })
  }

  pub fn has_more(&self) -> bool {
    self.index < self.anim.frames.len()
  }

  // Reconstruct the next canvas state and return a snapshot of it plus
  // the frame duration
  pub fn next_frame(&mut self, decoder: Option<&dyn FrameDecoder>) -> Result<(RgbaImage, u32)> {
    if !self.has_more() {
      return Err(Error::NoFrames);
    }
    let frame = &self.anim.frames[self.index];
    if self.index == 0 {
      // both canvases start fully transparent; the ANIM background
      // color is container metadata only
      self.current.fill_region(0, 0, self.anim.canvas_height, self.anim.canvas_width, &[0, 0, 0, 0]);
      self
        .prev_disposed
        .fill_region(0, 0, self.anim.canvas_height, self.anim.canvas_width, &[0, 0, 0, 0]);
    }
    self.current.copy_region(
      0,
      0,
      &self.prev_disposed,
      0,
      0,
      self.anim.canvas_height,
      self.anim.canvas_width,
    );

    let owned;
    let pixels: &RgbaImage = match &frame.image {
      Some(img) => img,
      None => {
        let dec = decoder.ok_or(Error::NoDecoder)?;
        let alpha_plane = match &frame.alpha {
          Some(alph) => Some(crate::alpha::alpha_decode(alph, frame.width, frame.height)?),
          None => None,
        };
        owned = dec.decode_frame(&frame.payload, alpha_plane.as_deref())?;
        &owned
      }
    };
    if pixels.rows() != frame.height || pixels.cols() != frame.width {
      return Err(Error::BadContainer);
    }

    for y in 0..frame.height {
      for x in 0..frame.width {
        let (cy, cx) = (frame.offset_y + y, frame.offset_x + x);
        let src = pixels[y][x];
        self.current[cy][cx] = match frame.blend {
          Blend::None => src,
          Blend::Alpha => blend_pixel(self.current[cy][cx], src),
        };
      }
    }

    let snapshot = self.current.clone();

    self.prev_disposed.copy_region(
      0,
      0,
      &self.current,
      0,
      0,
      self.anim.canvas_height,
      self.anim.canvas_width,
    );
    if frame.dispose == Dispose::Background {
      // cleared to transparent, never to the background color
      self
        .prev_disposed
        .fill_region(frame.offset_y, frame.offset_x, frame.height, frame.width, &[0, 0, 0, 0]);
    }

    let duration = frame.duration_ms;
    self.index += 1;
    Ok((snapshot, duration))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn solid(w: usize, h: usize, px: [u8; 4]) -> RgbaImage {
    RgbaImage::new_with(h, w, |_, _| px)
  }

  fn frame_with_image(x: usize, y: usize, img: RgbaImage, blend: Blend, dispose: Dispose) -> AnimFrame {
    AnimFrame {
      offset_x: x,
      offset_y: y,
      width: img.cols(),
      height: img.rows(),
      duration_ms: 40,
      blend: blend,
      dispose: dispose,
      payload: vec![0],
      is_lossless: false,
      alpha: None,
      has_alpha: true,
      image: Some(img),
    }
  }

  #[test]
  fn empty_animation_is_rejected() {
    let anim = Animation::new(4, 4);
    assert!(matches!(AnimationDecoder::new(&anim), Err(Error::NoFrames)));
  }

  #[test]
  fn first_frame_without_data_is_rejected() {
    let mut anim = Animation::new(4, 4);
    let mut f = frame_with_image(0, 0, solid(4, 4, [1, 2, 3, 4]), Blend::None, Dispose::None);
    f.image = None;
    f.payload = Vec::new();
    anim.frames.push(f);
    assert!(matches!(AnimationDecoder::new(&anim), Err(Error::NilImage)));
  }

  #[test]
  fn blend_formula_values() {
    // 50% red over opaque blue
    let out = blend_pixel([0, 0, 255, 255], [128, 0, 0, 128]);
    assert_eq!(out[3], 255);
    assert!((out[0] as i32 - 128).abs() <= 7, "r = {}", out[0]);
    assert!((out[2] as i32 - 127).abs() <= 7, "b = {}", out[2]);
    // blending onto nothing keeps the source
    assert_eq!(blend_pixel([0, 0, 0, 0], [9, 8, 7, 200]), [9, 8, 7, 200]);
    assert_eq!(blend_pixel([5, 5, 5, 77], [0, 0, 0, 0])[3], 77);
  }

  #[test]
  fn keyframe_rules() {
    let mut anim = Animation::new(8, 8);
    anim.frames.push(frame_with_image(0, 0, solid(8, 8, [255, 0, 0, 255]), Blend::None, Dispose::Background));
    anim.frames.push(frame_with_image(2, 2, solid(2, 2, [0, 255, 0, 255]), Blend::Alpha, Dispose::None));
    anim.frames.push(frame_with_image(0, 0, solid(8, 8, [0, 0, 255, 255]), Blend::None, Dispose::None));
    assert!(anim.is_keyframe(0));
    // frame 1 is small, but the previous full-canvas frame disposes to
    // background, so the canvas restarts from transparent
    assert!(anim.is_keyframe(1));
    assert!(anim.is_keyframe(2)); // full canvas, no blending
    assert!(!anim.is_keyframe(99)); // out of range must not panic
  }

  #[test]
  fn mux_demux_roundtrip() {
    let mut anim = Animation::new(16, 16);
    anim.loop_count = 3;
    anim.background_color = [1, 2, 3, 4];
    anim.xmp = Some(vec![7, 7, 7]);
    let mut f = frame_with_image(2, 4, solid(4, 4, [9, 9, 9, 255]), Blend::Alpha, Dispose::Background);
    f.image = None;
    f.payload = vec![0xaa; 11];
    f.duration_ms = 500;
    f.has_alpha = false;
    anim.frames.push(f);
    let bytes = anim.to_bytes();
    let back = Animation::from_bytes(&bytes).unwrap();
    assert_eq!(back.canvas_width, 16);
    assert_eq!(back.loop_count, 3);
    assert_eq!(back.background_color, [1, 2, 3, 4]);
    assert_eq!(back.xmp.as_deref(), Some(&[7u8, 7, 7][..]));
    assert_eq!(back.frames.len(), 1);
    let bf = &back.frames[0];
    assert_eq!((bf.offset_x, bf.offset_y), (2, 4));
    assert_eq!((bf.width, bf.height), (4, 4));
    assert_eq!(bf.duration_ms, 500);
    assert_eq!(bf.blend, Blend::Alpha);
    assert_eq!(bf.dispose, Dispose::Background);
    assert_eq!(bf.payload, vec![0xaa; 11]);
  }
}
