// The optimizing animation encoder: identical frames merge into longer
// durations, each new frame is reduced to its changed sub-rectangle,
// two disposal candidates compete on coded size, and a single-frame
// animation collapses into a plain still file on close.

use log::debug;

use crate::alpha::{alpha_encode, AlphaConfig};
use crate::anim::{blend_pixel, AnimFrame, Animation, Blend, Dispose, MAX_DURATION_MS};
use crate::array2d::{same_pixels, RgbaImage};
use crate::backend::StillEncoder;
use crate::config::{clamp_loop_count, AnimEncoderOptions};
use crate::error::{Error, Result};
use crate::yuv;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
  pub x: usize,
  pub y: usize,
  pub w: usize,
  pub h: usize,
}

impl Rect {
  pub fn is_empty(&self) -> bool {
    self.w == 0 || self.h == 0
  }
}

// Bounding box of the pixels that differ between two same-sized images
pub fn find_changed_rect(a: &RgbaImage, b: &RgbaImage) -> Rect {
  assert!(a.rows() == b.rows() && a.cols() == b.cols());
  let (mut x0, mut y0) = (a.cols(), a.rows());
  let (mut x1, mut y1) = (0usize, 0usize);
  for y in 0..a.rows() {
    for x in 0..a.cols() {
      if a[y][x] != b[y][x] {
        x0 = x0.min(x);
        y0 = y0.min(y);
        x1 = x1.max(x + 1);
        y1 = y1.max(y + 1);
      }
    }
  }
  if x1 <= x0 || y1 <= y0 {
    Rect { x: 0, y: 0, w: 0, h: 0 }
  } else {
    Rect { x: x0, y: y0, w: x1 - x0, h: y1 - y0 }
  }
}

// The VP8 bitstream can only address even frame offsets
fn snap_to_even(mut r: Rect) -> Rect {
  if r.x & 1 != 0 {
    r.x -= 1;
    r.w += 1;
  }
  if r.y & 1 != 0 {
    r.y -= 1;
    r.h += 1;
  }
  r
}

fn crop(img: &RgbaImage, r: &Rect) -> RgbaImage {
  let mut out = RgbaImage::zeroed(r.h, r.w);
  out.copy_region(0, 0, img, r.y, r.x, r.h, r.w);
  out
}

// Sanitized keyframe spacing. kmax == 0 disables keyframes entirely;
// kmax == 1 makes every frame one.
fn sanitize_kparams(kmin: u32, kmax: u32) -> (u32, u32) {
  if kmax == 0 {
    return (u32::MAX - 1, u32::MAX);
  }
  if kmax == 1 {
    return (0, 0);
  }
  let mut kmin = kmin;
  if kmin >= kmax {
    kmin = kmax - 1;
  } else {
    let limit = kmax / 2 + 1;
    if kmin < limit && kmax > 2 {
      kmin = limit;
    }
  }
  (kmin, kmax)
}

fn blend_allowed_lossless(prev: &RgbaImage, src: &RgbaImage, r: &Rect) -> bool {
  for y in 0..r.h {
    for x in 0..r.w {
      let p = prev[r.y + y][r.x + x];
      let s = src[y][x];
      if p[3] != 0xff && s != p {
        return false;
      }
    }
  }
  true
}

fn blend_allowed_lossy(prev: &RgbaImage, src: &RgbaImage, r: &Rect, quality: f32) -> bool {
  let v = (quality / 100.0).clamp(0.0, 1.0);
  let max_diff = (31.0 * (1.0 - v) + v).round() as i32;
  for y in 0..r.h {
    for x in 0..r.w {
      let p = prev[r.y + y][r.x + x];
      let s = src[y][x];
      if (p[3] as i32 - s[3] as i32).abs() > max_diff {
        return false;
      }
      if s[3] < 255 {
        // compositing must land close to the intended pixel
        let blended = blend_pixel(p, s);
        for c in 0..3 {
          if (blended[c] as i32 - s[c] as i32).abs() > max_diff {
            return false;
          }
        }
      }
    }
  }
  true
}

struct EncodedCandidate {
  payload: Vec<u8>,
  alpha: Option<Vec<u8>>,
  is_lossless: bool,
  has_alpha: bool,
  rect: Rect,
}

impl EncodedCandidate {
  fn coded_size(&self) -> usize {
    self.payload.len() + self.alpha.as_ref().map_or(0, |a| a.len())
  }
}

pub struct AnimEncoder {
  options: AnimEncoderOptions,
  kmin: u32,
  kmax: u32,
  anim: Animation,
  backend: Box<dyn StillEncoder>,
  // last submitted source frame, full canvas size
  working: Option<RgbaImage>,
  // rectangle of the last emitted frame, for the dispose candidate
  prev_rect: Option<Rect>,
  frames_since_key: u32,
  first_frame_src: Option<RgbaImage>,
  closed: bool,
  output: Option<Vec<u8>>,
}

impl AnimEncoder {
  pub fn new(
    canvas_width: usize,
    canvas_height: usize,
    mut options: AnimEncoderOptions,
    backend: Box<dyn StillEncoder>,
  ) -> Result<Self> {
    if canvas_width == 0 || canvas_height == 0 {
      return Err(Error::ZeroDimension);
    }
    if canvas_width * canvas_height >= (1 << 28) {
      return Err(Error::TooLarge);
    }
    options.frame_config.validate()?;
    let (kmin, kmax) = sanitize_kparams(options.kmin, options.kmax);
    let mut anim = Animation::new(canvas_width, canvas_height);
    anim.background_color = options.background_color;
    anim.loop_count = clamp_loop_count(options.loop_count);
    Ok(Self {
      options: options,
      kmin: kmin,
      kmax: kmax,
      anim: anim,
      backend: backend,
      working: None,
      prev_rect: None,
      frames_since_key: 0,
      first_frame_src: None,
      closed: false,
      output: None,
    })
  }

  // Append a pre-encoded frame without any optimization
  pub fn add_raw_frame(&mut self, mut frame: AnimFrame) -> Result<()> {
    if self.closed {
      return Err(Error::ClosedEncoder);
    }
    frame.duration_ms = frame.duration_ms.min(MAX_DURATION_MS);
    if frame.offset_x & 1 != 0
      || frame.offset_y & 1 != 0
      || frame.offset_x + frame.width > self.anim.canvas_width
      || frame.offset_y + frame.height > self.anim.canvas_height
    {
      return Err(Error::BadConfig("frame rectangle invalid for canvas"));
    }
    self.anim.frames.push(frame);
    Ok(())
  }

  fn encode_sub_image(&self, sub: &RgbaImage, lossless: bool) -> Result<(Vec<u8>, Option<Vec<u8>>, bool)> {
    let quality = self.options.frame_config.quality;
    let payload = self.backend.encode_frame(sub, lossless, quality)?;
    if lossless {
      let has_alpha = crate::anim::vp8l_has_alpha(&payload);
      return Ok((payload, None, has_alpha));
    }
    if yuv::has_alpha(sub) {
      let plane = yuv::extract_alpha(sub);
      let alph = alpha_encode(&plane, sub.cols(), sub.rows(), &AlphaConfig::default())?;
      Ok((payload, Some(alph), true))
    } else {
      Ok((payload, None, false))
    }
  }

  // Encode one sub-rectangle, trying the alternate codec under
  // AllowMixed and keeping whichever result is smaller
  fn encode_candidate(&self, img: &RgbaImage, rect: Rect) -> Result<EncodedCandidate> {
    let sub = crop(img, &rect);
    let primary_lossless = self.options.frame_config.lossless;
    let (payload, alpha, has_alpha) = self.encode_sub_image(&sub, primary_lossless)?;
    let mut best = EncodedCandidate {
      payload: payload,
      alpha: alpha,
      is_lossless: primary_lossless,
      has_alpha: has_alpha,
      rect: rect,
    };
    if self.options.allow_mixed {
      // alternate codec failures are not errors; the primary result stands
      if let Ok((payload, alpha, has_alpha)) = self.encode_sub_image(&sub, !primary_lossless) {
        let alt_size = payload.len() + alpha.as_ref().map_or(0, |a| a.len());
        if alt_size < best.coded_size() {
          best = EncodedCandidate {
            payload: payload,
            alpha: alpha,
            is_lossless: !primary_lossless,
            has_alpha: has_alpha,
            rect: rect,
          };
        }
      }
    }
    Ok(best)
  }

  fn push_encoded(&mut self, cand: EncodedCandidate, duration_ms: u32, blend: Blend) {
    self.anim.frames.push(AnimFrame {
      offset_x: cand.rect.x,
      offset_y: cand.rect.y,
      width: cand.rect.w,
      height: cand.rect.h,
      duration_ms: duration_ms,
      blend: blend,
      dispose: Dispose::None,
      payload: cand.payload,
      is_lossless: cand.is_lossless,
      alpha: cand.alpha,
      has_alpha: cand.has_alpha,
      image: None,
    });
  }

  pub fn add_frame(&mut self, img: &RgbaImage, duration_ms: u32) -> Result<()> {
    if self.closed {
      return Err(Error::ClosedEncoder);
    }
    if img.cols() != self.anim.canvas_width || img.rows() != self.anim.canvas_height {
      return Err(Error::BadConfig("frame size must match the canvas"));
    }

    // merge runs of identical frames into one longer frame
    let identical = self.working.as_ref().map_or(false, |w| same_pixels(w, img));
    if identical && !self.anim.frames.is_empty() {
      let total = self.anim.frames.last().unwrap().duration_ms as u64 + duration_ms as u64;
      if total <= MAX_DURATION_MS as u64 {
        self.anim.frames.last_mut().unwrap().duration_ms = total as u32;
        return Ok(());
      }
      // cap the run and spill the remainder into a 1x1 filler frame
      let remainder = (total - MAX_DURATION_MS as u64) as u32;
      self.anim.frames.last_mut().unwrap().duration_ms = MAX_DURATION_MS;
      let filler_rect = Rect { x: 0, y: 0, w: 1, h: 1 };
      let cand = self.encode_candidate(img, filler_rect)?;
      self.push_encoded(cand, remainder, Blend::None);
      self.frames_since_key += 1;
      return Ok(());
    }

    let force_key = self.working.is_none() || self.frames_since_key >= self.kmax;
    let (cand, blend, dispose_prev) = if force_key {
      let full = Rect { x: 0, y: 0, w: self.anim.canvas_width, h: self.anim.canvas_height };
      (self.encode_candidate(img, full)?, Blend::None, false)
    } else {
      self.pick_sub_frame(img)?
    };

    if dispose_prev {
      if let Some(last) = self.anim.frames.last_mut() {
        last.dispose = Dispose::Background;
      }
    }

    self.push_encoded(cand, duration_ms, blend);
    // a frame that naturally qualifies as a keyframe resets the spacing
    // counter, but only once the minimum distance has passed
    let last_idx = self.anim.frames.len() - 1;
    let natural_key = self.frames_since_key >= self.kmin && self.anim.is_keyframe(last_idx);
    self.frames_since_key = if force_key || natural_key { 0 } else { self.frames_since_key + 1 };
    if self.first_frame_src.is_none() {
      self.first_frame_src = Some(img.clone());
    }
    self.working = Some(img.clone());
    self.prev_rect = Some(Rect {
      x: self.anim.frames.last().unwrap().offset_x,
      y: self.anim.frames.last().unwrap().offset_y,
      w: self.anim.frames.last().unwrap().width,
      h: self.anim.frames.last().unwrap().height,
    });
    Ok(())
  }

  // Try both disposal interpretations of the previous frame and keep
  // the cheaper encoding. Returns (candidate, blend, dispose_previous).
  fn pick_sub_frame(&mut self, img: &RgbaImage) -> Result<(EncodedCandidate, Blend, bool)> {
    let working = self.working.as_ref().unwrap().clone();

    // candidate A: previous frame stays (DisposeNone)
    let mut rect_a = find_changed_rect(&working, img);
    if rect_a.is_empty() {
      rect_a = Rect { x: 0, y: 0, w: 1, h: 1 };
    }
    let rect_a = snap_to_even(rect_a);
    let cand_a = self.encode_candidate(img, rect_a)?;

    // candidate B: previous frame's rectangle cleared to transparent
    let cand_b = match self.prev_rect {
      Some(prev) if !prev.is_empty() => {
        let mut cleared = working.clone();
        cleared.fill_region(prev.y, prev.x, prev.h, prev.w, &[0, 0, 0, 0]);
        let mut rect_b = find_changed_rect(&cleared, img);
        if rect_b.is_empty() {
          rect_b = Rect { x: 0, y: 0, w: 1, h: 1 };
        }
        let rect_b = snap_to_even(rect_b);
        Some((self.encode_candidate(img, rect_b)?, cleared))
      }
      _ => None,
    };

    let (winner, base_canvas, dispose_prev) = match cand_b {
      Some((b, cleared)) if b.coded_size() < cand_a.coded_size() => {
        debug!(
          "dispose-background candidate wins: {} < {} bytes",
          b.coded_size(),
          cand_a.coded_size()
        );
        (b, cleared, true)
      }
      _ => (cand_a, working, false),
    };

    let sub = crop(img, &winner.rect);
    let allowed = if winner.is_lossless {
      blend_allowed_lossless(&base_canvas, &sub, &winner.rect)
    } else {
      blend_allowed_lossy(&base_canvas, &sub, &winner.rect, self.options.frame_config.quality)
    };
    let blend = if allowed { Blend::Alpha } else { Blend::None };
    Ok((winner, blend, dispose_prev))
  }

  // Finish the stream. Subsequent calls are no-ops returning the same
  // bytes.
  pub fn close(&mut self) -> Result<Vec<u8>> {
    if self.closed {
      return Ok(self.output.clone().unwrap_or_default());
    }
    if self.anim.frames.is_empty() {
      return Err(Error::NoFrames);
    }
    let animated = self.anim.to_bytes();
    let mut best = animated;
    if self.anim.frames.len() == 1 {
      if let Some(src) = &self.first_frame_src {
        // a one-frame animation is better off as a plain still file,
        // when that actually comes out smaller
        let lossless = self.options.frame_config.lossless;
        let quality = self.options.frame_config.quality;
        if let Ok(simple) = self.backend.encode_simple(src, lossless, quality) {
          if simple.len() < best.len() {
            debug!("single-frame collapse: {} < {} bytes", simple.len(), best.len());
            best = simple;
          }
        }
      }
    }
    self.closed = true;
    self.output = Some(best.clone());
    Ok(best)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn changed_rect_laws() {
    let a = RgbaImage::new_with(8, 8, |y, x| [(x * 9) as u8, (y * 7) as u8, 0, 255]);
    assert!(find_changed_rect(&a, &a).is_empty());
    let mut b = a.clone();
    b[3][5] = [0, 0, 0, 0];
    let r = find_changed_rect(&a, &b);
    assert_eq!(r, Rect { x: 5, y: 3, w: 1, h: 1 });
  }

  #[test]
  fn even_snapping() {
    let r = snap_to_even(Rect { x: 5, y: 3, w: 1, h: 1 });
    assert_eq!(r, Rect { x: 4, y: 2, w: 2, h: 2 });
    let r = snap_to_even(Rect { x: 4, y: 2, w: 3, h: 5 });
    assert_eq!(r, Rect { x: 4, y: 2, w: 3, h: 5 });
  }

  #[test]
  fn kparam_sanitizing() {
    assert_eq!(sanitize_kparams(9, 0), (u32::MAX - 1, u32::MAX));
    assert_eq!(sanitize_kparams(5, 1), (0, 0));
    // kmin is pulled up to above half of kmax
    assert_eq!(sanitize_kparams(1, 10), (6, 10));
    assert_eq!(sanitize_kparams(12, 10), (9, 10));
  }

  #[test]
  fn lossless_blend_rule() {
    let prev = RgbaImage::new_with(2, 2, |_, _| [10, 10, 10, 255]);
    let src = RgbaImage::new_with(2, 2, |_, _| [20, 20, 20, 128]);
    let r = Rect { x: 0, y: 0, w: 2, h: 2 };
    assert!(blend_allowed_lossless(&prev, &src, &r));
    let prev_transparent = RgbaImage::new_with(2, 2, |_, _| [10, 10, 10, 0]);
    assert!(!blend_allowed_lossless(&prev_transparent, &src, &r));
    // transparent background is fine when the pixels match exactly
    assert!(blend_allowed_lossless(&prev_transparent, &prev_transparent, &r));
  }
}
