// Copyright (c) 2024-2025, The tinywebp contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause/

// The VP8 encoder driver: analysis, per-macroblock mode decision and
// reconstruction, token recording with mid-stream probability refresh,
// multi-pass rate control, and the row-pipelined parallel path.
//
// In parallel mode, phase A distributes rows over workers; a worker may
// start macroblock (x, y) once (x+1, y-1) is complete, so the top and
// top-right contexts it reads are final. Phase B replays the rows in
// raster order on the main thread to record tokens and statistics.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use log::debug;

use crate::analysis::{self, AnalysisResult, SegmentParamsCfg};
use crate::array2d::RgbaImage;
use crate::config::EncoderConfig;
use crate::consts::BPS;
use crate::costs::{self, CostModel, Stats};
use crate::dsp;
use crate::dsp::PredCtx;
use crate::enums::*;
use crate::error::{Error, Result};
use crate::frame::YuvFrame;
use crate::hls;
use crate::proba::Proba;
use crate::quant::{store_diffusion_errors, Segment};
use crate::ratectrl::{psnr_from_sse, PassStats};
use crate::rdo::{self, MbBorders, ModeScore, RdParams};
use crate::residual::{reconstruct_i16, reconstruct_uv, SCRATCH_SIZE, U_OFF, V_OFF, Y_OFF};
use crate::tokens::{nz_to_ctx, MbResiduals, TokenBuffer};
use crate::yuv;

// Per-macroblock state left behind by the mode decision, consumed by
// token recording and the header emitter
#[derive(Clone)]
pub struct MbInfo {
  pub segment: u8,
  pub skip: bool,
  pub is_i4: bool,
  pub ymode: u8,
  pub i4_modes: [u8; 16],
  pub uv_mode: u8,
  pub alpha: u8,
  pub nz: u32,
  // 16 luma blocks, 4 U, 4 V, and the WHT block at offset 384
  pub levels: [i16; 400],
  pub counts_y: [u8; 16],
  pub counts_uv: [u8; 8],
  pub count_dc: u8,
}

impl MbInfo {
  fn new() -> Self {
    Self {
      segment: 0,
      skip: false,
      is_i4: false,
      ymode: DC_PRED,
      i4_modes: [B_DC_PRED; 16],
      uv_mode: DC_PRED,
      alpha: 0,
      nz: 0,
      levels: [0; 400],
      counts_y: [0; 16],
      counts_uv: [0; 8],
      count_dc: 0,
    }
  }
}

#[derive(Clone, Default)]
pub struct EncoderStats {
  pub coded_size: usize,
  pub header_size: usize,
  pub residual_size: usize,
  pub proba_size: usize,
  // Y, U, V, all, alpha
  pub psnr: [f64; 5],
}

// Shared mutable grids of the parallel phase A. Disjointness is
// enforced by the row protocol: a cell indexed by macroblock x is
// written only by the worker owning the row that completed x, and read
// only by the worker of the row below after the done-counter handshake.
struct Cells {
  top_y: Vec<u8>,
  top_u: Vec<u8>,
  top_v: Vec<u8>,
  top_bmodes: Vec<u8>,
  top_nz: Vec<u32>,
  top_derr: Vec<[[i8; 2]; 2]>,
  mb_info: Vec<MbInfo>,
  recon: YuvFrame,
}

struct RowSync {
  done: AtomicUsize,
  waiters: AtomicUsize,
  lock: Mutex<()>,
  cond: Condvar,
}

impl RowSync {
  fn new() -> Self {
    Self {
      done: AtomicUsize::new(0),
      waiters: AtomicUsize::new(0),
      lock: Mutex::new(()),
      cond: Condvar::new(),
    }
  }

  fn wait_for(&self, count: usize) {
    // fast path: a handful of relaxed-ish probes
    for _ in 0..64 {
      if self.done.load(Ordering::Acquire) >= count {
        return;
      }
      std::hint::spin_loop();
    }
    self.waiters.fetch_add(1, Ordering::SeqCst);
    let mut guard = self.lock.lock().unwrap();
    while self.done.load(Ordering::Acquire) < count {
      guard = self.cond.wait(guard).unwrap();
    }
    drop(guard);
    self.waiters.fetch_sub(1, Ordering::SeqCst);
  }

  fn mark_done(&self) {
    self.done.fetch_add(1, Ordering::Release);
    if self.waiters.load(Ordering::SeqCst) > 0 {
      let _guard = self.lock.lock().unwrap();
      self.cond.notify_all();
    }
  }
}

struct Shared<'a> {
  mb_w: usize,
  mb_h: usize,
  source: &'a YuvFrame,
  segments: &'a [Segment; NUM_MB_SEGMENTS],
  mb_segments: &'a [u8],
  mb_alphas: &'a [u8],
  method: i32,
  quality: i32,
  next_row: AtomicUsize,
  rows: Vec<RowSync>,
  cells: UnsafeCell<Cells>,
}

// SAFETY: every Cells region is written by exactly one worker at a time
// and read by at most one other, with a release/acquire handshake on
// the row done-counters in between (see the module comment).
unsafe impl<'a> Sync for Shared<'a> {}

// Per-worker (or serial-loop) private left-edge state
struct LeftState {
  y: [u8; 16],
  u: [u8; 8],
  v: [u8; 8],
  corner_y: u8,
  corner_u: u8,
  corner_v: u8,
  modes: [u8; 4],
  nz: u32,
  left_dc: u8,
  derr: [[i8; 2]; 2],
}

impl LeftState {
  fn new() -> Self {
    Self {
      y: [0; 16],
      u: [0; 8],
      v: [0; 8],
      corner_y: 0,
      corner_u: 0,
      corner_v: 0,
      modes: [B_DC_PRED; 4],
      nz: 0,
      left_dc: 0,
      derr: [[0; 2]; 2],
    }
  }
}

fn import_mb(source: &YuvFrame, x: usize, y: usize, dst: &mut [u8; SCRATCH_SIZE]) {
  for i in 0..16 {
    let src = (y * 16 + i) * source.y.stride + x * 16;
    dst[Y_OFF + i * BPS..Y_OFF + i * BPS + 16].copy_from_slice(&source.y.data[src..src + 16]);
  }
  for i in 0..8 {
    let src = (y * 8 + i) * source.u.stride + x * 8;
    dst[U_OFF + i * BPS..U_OFF + i * BPS + 8].copy_from_slice(&source.u.data[src..src + 8]);
    dst[V_OFF + i * BPS..V_OFF + i * BPS + 8].copy_from_slice(&source.v.data[src..src + 8]);
  }
}

fn build_borders(cells: &Cells, mb_w: usize, x: usize, y: usize, left: &LeftState) -> MbBorders {
  let mut b = MbBorders {
    x: x,
    y: y,
    mb_w: mb_w,
    y_left: left.y,
    u_left: left.u,
    v_left: left.v,
    y_top: [dsp::TOP_DEFAULT; 20],
    u_top: [dsp::TOP_DEFAULT; 8],
    v_top: [dsp::TOP_DEFAULT; 8],
    y_top_left: if y == 0 {
      dsp::TOP_DEFAULT
    } else if x == 0 {
      dsp::LEFT_DEFAULT
    } else {
      left.corner_y
    },
    u_top_left: if y == 0 {
      dsp::TOP_DEFAULT
    } else if x == 0 {
      dsp::LEFT_DEFAULT
    } else {
      left.corner_u
    },
    v_top_left: if y == 0 {
      dsp::TOP_DEFAULT
    } else if x == 0 {
      dsp::LEFT_DEFAULT
    } else {
      left.corner_v
    },
    top_modes: [B_DC_PRED; 4],
    left_modes: left.modes,
  };
  if y > 0 {
    b.y_top[..16].copy_from_slice(&cells.top_y[x * 16..x * 16 + 16]);
    for j in 0..4 {
      b.y_top[16 + j] = if x + 1 < mb_w {
        cells.top_y[(x + 1) * 16 + j]
      } else {
        cells.top_y[x * 16 + 15]
      };
    }
    b.u_top.copy_from_slice(&cells.top_u[x * 8..x * 8 + 8]);
    b.v_top.copy_from_slice(&cells.top_v[x * 8..x * 8 + 8]);
    b.top_modes.copy_from_slice(&cells.top_bmodes[x * 4..x * 4 + 4]);
  }
  if x == 0 {
    b.left_modes = [B_DC_PRED; 4];
  }
  b
}

// Residual pass for modes picked without reconstruction (fast methods):
// predict the chosen modes and quantize for real
fn finalize_uncached(
  src: &[u8; SCRATCH_SIZE],
  out: &mut [u8; SCRATCH_SIZE],
  borders: &MbBorders,
  seg: &Segment,
  score: &mut ModeScore,
) {
  let mut pred = [0u8; SCRATCH_SIZE];
  let ctx = PredCtx {
    left: if borders.x > 0 { Some(&borders.y_left) } else { None },
    top: if borders.y > 0 { Some(&borders.y_top[..16]) } else { None },
    top_left: borders.y_top_left,
  };
  dsp::pred_block(&mut pred, Y_OFF, score.mode_i16, &ctx, 16);
  score.count_dc = reconstruct_i16(
    src,
    &pred,
    Y_OFF,
    out,
    seg,
    &([0; 9], [0; 9]),
    &mut score.levels_y,
    &mut score.levels_dc,
    &mut score.counts_y,
    None,
  );
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
  dsp::pred_block(&mut pred, U_OFF, score.mode_uv, &ctx_u, 8);
  dsp::pred_block(&mut pred, V_OFF, score.mode_uv, &ctx_v, 8);
  reconstruct_uv(
    src,
    &pred,
    U_OFF,
    V_OFF,
    out,
    seg,
    &([0; 9], [0; 9]),
    &mut score.levels_uv,
    &mut score.counts_uv,
    None,
    None,
  );
  score.nz = rdo::build_nz(false, &score.counts_y, &score.counts_uv, score.count_dc);
  score.pred_cached = true;
}

// Process one macroblock: decide, reconstruct, commit contexts.
fn process_mb(
  shared: &Shared,
  cells: &mut Cells,
  x: usize,
  y: usize,
  left: &mut LeftState,
  diffusion: bool,
  proba: &Proba,
  costs: &CostModel,
) {
  let idx = y * shared.mb_w + x;
  let seg_id = shared.mb_segments[idx];
  let seg = &shared.segments[seg_id as usize];
  let mut src = [0u8; SCRATCH_SIZE];
  import_mb(shared.source, x, y, &mut src);
  let borders = build_borders(cells, shared.mb_w, x, y, left);

  let top_nz_mask = if y > 0 { cells.top_nz[x] } else { 0 };
  let (top_nz, left_nz) = nz_to_ctx(top_nz_mask, left.nz);
  let params = RdParams {
    seg: seg,
    costs: costs,
    proba: proba,
    method: shared.method,
    quality: shared.quality,
    top_nz: top_nz,
    left_nz: left_nz,
    left_dc: left.left_dc,
    top_derr: if y > 0 { cells.top_derr[x] } else { [[0; 2]; 2] },
    left_derr: left.derr,
  };
  let mut out = [0u8; SCRATCH_SIZE];
  let mut score = rdo::pick_modes(&src, &mut out, &borders, &params);
  if !score.pred_cached {
    finalize_uncached(&src, &mut out, &borders, seg, &mut score);
  }
  let skip = score.nz == 0;

  // commit reconstruction
  for i in 0..16 {
    let dst = (y * 16 + i) * cells.recon.y.stride + x * 16;
    cells.recon.y.data[dst..dst + 16].copy_from_slice(&out[Y_OFF + i * BPS..Y_OFF + i * BPS + 16]);
  }
  for i in 0..8 {
    let dst = (y * 8 + i) * cells.recon.u.stride + x * 8;
    cells.recon.u.data[dst..dst + 8].copy_from_slice(&out[U_OFF + i * BPS..U_OFF + i * BPS + 8]);
    cells.recon.v.data[dst..dst + 8].copy_from_slice(&out[V_OFF + i * BPS..V_OFF + i * BPS + 8]);
  }

  // persist the macroblock record
  let info = &mut cells.mb_info[idx];
  info.segment = seg_id;
  info.skip = skip;
  info.is_i4 = score.is_i4;
  info.ymode = score.mode_i16;
  info.i4_modes = score.modes_i4;
  info.uv_mode = score.mode_uv;
  info.alpha = shared.mb_alphas[idx];
  info.nz = score.nz;
  info.counts_y = score.counts_y;
  info.counts_uv = score.counts_uv;
  info.count_dc = score.count_dc;
  for k in 0..16 {
    info.levels[k * 16..k * 16 + 16].copy_from_slice(&score.levels_y[k]);
  }
  for b in 0..8 {
    info.levels[(16 + b) * 16..(16 + b) * 16 + 16].copy_from_slice(&score.levels_uv[b]);
  }
  info.levels[384..400].copy_from_slice(&score.levels_dc);

  // rotate contexts: save the corners before overwriting the top rows
  if y > 0 {
    left.corner_y = cells.top_y[x * 16 + 15];
    left.corner_u = cells.top_u[x * 8 + 7];
    left.corner_v = cells.top_v[x * 8 + 7];
  }
  for j in 0..16 {
    cells.top_y[x * 16 + j] = out[Y_OFF + 15 * BPS + j];
  }
  for j in 0..8 {
    cells.top_u[x * 8 + j] = out[U_OFF + 7 * BPS + j];
    cells.top_v[x * 8 + j] = out[V_OFF + 7 * BPS + j];
  }
  for i in 0..16 {
    left.y[i] = out[Y_OFF + i * BPS + 15];
  }
  for i in 0..8 {
    left.u[i] = out[U_OFF + i * BPS + 7];
    left.v[i] = out[V_OFF + i * BPS + 7];
  }
  let bottom_modes: [u8; 4] = if score.is_i4 {
    [score.modes_i4[12], score.modes_i4[13], score.modes_i4[14], score.modes_i4[15]]
  } else {
    let b = match score.mode_i16 {
      DC_PRED => B_DC_PRED,
      V_PRED => B_VE_PRED,
      H_PRED => B_HE_PRED,
      _ => B_TM_PRED,
    };
    [b; 4]
  };
  cells.top_bmodes[x * 4..x * 4 + 4].copy_from_slice(&bottom_modes);
  left.modes = if score.is_i4 {
    [score.modes_i4[3], score.modes_i4[7], score.modes_i4[11], score.modes_i4[15]]
  } else {
    bottom_modes
  };
  cells.top_nz[x] = score.nz;
  left.nz = score.nz;
  left.left_dc = ((score.nz >> 24) & 1) as u8;
  if diffusion {
    store_diffusion_errors(&mut cells.top_derr[x], &mut left.derr, &score.derr);
  }
}

fn worker_loop(shared: &Shared, proba: &Proba, costs: &CostModel) {
  loop {
    let y = shared.next_row.fetch_add(1, Ordering::Relaxed);
    if y >= shared.mb_h {
      break;
    }
    let mut left = LeftState::new();
    let diffusion = shared.method >= 3;
    for x in 0..shared.mb_w {
      if y > 0 {
        let need = std::cmp::min(x + 2, shared.mb_w);
        shared.rows[y - 1].wait_for(need);
      }
      // SAFETY: the wait above guarantees every cell this macroblock
      // reads has been published, and no other worker touches the cells
      // it writes until our own done-counter advances past them.
      let cells = unsafe { &mut *shared.cells.get() };
      process_mb(shared, cells, x, y, &mut left, diffusion, proba, costs);
      shared.rows[y].mark_done();
    }
  }
}

// ---------------------------------------------------------------------------

pub struct Vp8Encoder {
  cfg: EncoderConfig,
  source: YuvFrame,
  analysis: Option<AnalysisResult>,
  segments: [Segment; NUM_MB_SEGMENTS],
  num_segments: usize,
  dq_uv_dc: i32,
  dq_uv_ac: i32,
  prev_stats: Option<Box<Stats>>,
  stats: EncoderStats,
  // pooled across encodes of the same geometry
  recon_pool: Option<YuvFrame>,
  info_pool: Option<Vec<MbInfo>>,
}

impl Vp8Encoder {
  pub fn from_rgba(img: &RgbaImage, mut cfg: EncoderConfig) -> Result<Self> {
    cfg.validate()?;
    let (w, h) = (img.cols(), img.rows());
    if w == 0 || h == 0 {
      return Err(Error::ZeroDimension);
    }
    if w >= (1 << 14) || h >= (1 << 14) {
      return Err(Error::TooLarge);
    }
    let source = yuv::import_rgba(img, cfg.dithering);
    Ok(Self::from_frame(source, cfg))
  }

  // `yuv420` holds the Y plane followed by U then V at half resolution
  pub fn from_yuv(yuv420: &[u8], width: usize, height: usize, mut cfg: EncoderConfig) -> Result<Self> {
    cfg.validate()?;
    if width == 0 || height == 0 {
      return Err(Error::ZeroDimension);
    }
    if width >= (1 << 14) || height >= (1 << 14) {
      return Err(Error::TooLarge);
    }
    let uv_w = (width + 1) / 2;
    let uv_h = (height + 1) / 2;
    let want = width * height + 2 * uv_w * uv_h;
    if yuv420.len() < want {
      return Err(Error::BadConfig("yuv buffer too small"));
    }
    let mut source = YuvFrame::new(width, height);
    for y in 0..height {
      source.y.row_mut(y)[..width].copy_from_slice(&yuv420[y * width..y * width + width]);
    }
    let u_base = width * height;
    let v_base = u_base + uv_w * uv_h;
    for y in 0..uv_h {
      source.u.row_mut(y)[..uv_w].copy_from_slice(&yuv420[u_base + y * uv_w..u_base + (y + 1) * uv_w]);
      source.v.row_mut(y)[..uv_w].copy_from_slice(&yuv420[v_base + y * uv_w..v_base + (y + 1) * uv_w]);
    }
    source.replicate_borders();
    Ok(Self::from_frame(source, cfg))
  }

  fn from_frame(source: YuvFrame, cfg: EncoderConfig) -> Self {
    Self {
      cfg: cfg,
      source: source,
      analysis: None,
      segments: Default::default(),
      num_segments: 1,
      dq_uv_dc: 0,
      dq_uv_ac: 0,
      prev_stats: None,
      stats: EncoderStats::default(),
      recon_pool: None,
      info_pool: None,
    }
  }

  pub fn stats(&self) -> &EncoderStats {
    &self.stats
  }

  pub fn encode_frame(&mut self) -> Result<Vec<u8>> {
    // segment-map smoothing runs whenever more than one segment is in
    // play, independent of the preprocessing bit and the method
    let smooth = self.cfg.segments > 1;
    if self.analysis.is_none() {
      self.analysis = Some(analysis::analyze(&self.source, self.cfg.segments as usize, smooth));
    }
    let res = self.analysis.take().unwrap();
    let out = self.run_passes(&res);
    self.analysis = Some(res);
    out
  }

  fn run_passes(&mut self, res: &AnalysisResult) -> Result<Vec<u8>> {
    let search = self.cfg.target_size > 0 || self.cfg.target_psnr > 0.0;
    if !search {
      let mut out = Vec::new();
      let passes = self.cfg.pass.max(1);
      for _ in 0..passes {
        out = self.encode_once(self.cfg.quality as f64, res)?;
      }
      return Ok(out);
    }

    // multi-pass secant search over quality
    let max_passes = std::cmp::max(3, self.cfg.pass as usize);
    let mut s = PassStats::new(
      self.cfg.target_size,
      self.cfg.target_psnr as f64,
      self.cfg.qmin as f64,
      self.cfg.qmax as f64,
      self.cfg.quality as f64,
    );
    let mut out = Vec::new();
    for pass in 0..max_passes {
      let q = s.q;
      out = self.encode_once(q, res)?;
      s.value = if s.do_size_search {
        out.len() as f64
      } else {
        self.stats.psnr[3]
      };
      debug!("pass {}: q={:.2} value={:.2} target={:.2}", pass, q, s.value, s.target);
      s.compute_next_q();
      if s.converged() {
        break;
      }
    }
    Ok(out)
  }

  fn encode_once(&mut self, quality: f64, res: &AnalysisResult) -> Result<Vec<u8>> {
    let params_cfg = SegmentParamsCfg {
      quality: quality,
      sns_strength: self.cfg.sns_strength as i32,
      method: self.cfg.method as i32,
      filter_strength: self.cfg.filter_strength as i32,
      filter_sharpness: self.cfg.filter_sharpness as i32,
    };
    analysis::set_segment_params(res, &mut self.segments, &params_cfg);
    self.dq_uv_ac = crate::util::clamp(
      (res.uv_alpha - 64) * 10 / 70 * self.cfg.sns_strength as i32 / 100,
      -4,
      6,
    );
    self.dq_uv_dc = crate::util::clamp(-4 * self.cfg.sns_strength as i32 / 100, -15, 15);
    let mut mb_segments = res.mb_segments.clone();
    self.num_segments = analysis::simplify_segments(&mut self.segments, res.num_segments, &mut mb_segments);

    let (mb_w, mb_h) = (self.source.mb_w, self.source.mb_h);
    let num_mbs = mb_w * mb_h;

    let mut proba = Proba::new();
    if let Some(prev) = &self.prev_stats {
      // feed last pass's statistics into this pass's rate estimates
      let _ = costs::finalize_token_probas(&mut proba, prev);
    }
    let mut cost_model = CostModel::new(&proba);

    let recon = match self.recon_pool.take() {
      Some(f) if f.mb_w == mb_w && f.mb_h == mb_h => f,
      _ => YuvFrame::new(self.source.crop_width, self.source.crop_height),
    };
    let mut mb_info = match self.info_pool.take() {
      Some(v) if v.len() == num_mbs => v,
      _ => vec![MbInfo::new(); num_mbs],
    };
    for info in mb_info.iter_mut() {
      *info = MbInfo::new();
    }

    let mut tokens = TokenBuffer::new();
    let mut stats = costs::new_stats();

    let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let search = self.cfg.target_size > 0 || self.cfg.target_psnr > 0.0;
    let parallel = self.cfg.method >= 3 && threads > 1 && mb_h >= 4 && !search;

    let cells = Cells {
      top_y: vec![0; mb_w * 16],
      top_u: vec![0; mb_w * 8],
      top_v: vec![0; mb_w * 8],
      top_bmodes: vec![B_DC_PRED; mb_w * 4],
      top_nz: vec![0; mb_w],
      top_derr: vec![[[0; 2]; 2]; mb_w],
      mb_info: mb_info,
      recon: recon,
    };
    let shared = Shared {
      mb_w: mb_w,
      mb_h: mb_h,
      source: &self.source,
      segments: &self.segments,
      mb_segments: &mb_segments,
      mb_alphas: &res.mb_alphas,
      method: self.cfg.method as i32,
      quality: quality as i32,
      next_row: AtomicUsize::new(0),
      rows: (0..mb_h).map(|_| RowSync::new()).collect(),
      cells: UnsafeCell::new(cells),
    };

    if parallel {
      let num_workers = std::cmp::min(threads, std::cmp::max(2, mb_h / 2));
      let (proba_ref, costs_ref) = (&proba, &cost_model);
      std::thread::scope(|scope| {
        for _ in 0..num_workers {
          scope.spawn(|| worker_loop(&shared, proba_ref, costs_ref));
        }
        // phase B: serial token recording, overlapped row by row.
        // mid-stream refresh stays off here so workers can keep reading
        // the probas; the final re-estimation below compensates.
        let mut nz_row = vec![0u32; mb_w];
        for y in 0..mb_h {
          shared.rows[y].wait_for(mb_w);
          // SAFETY: the full row is complete, its mb_info entries are
          // final and no worker writes them again
          let cells = unsafe { &*shared.cells.get() };
          record_row(&cells.mb_info, mb_w, y, &mut nz_row, &mut tokens, &mut stats);
        }
      });
    } else {
      let max_count = std::cmp::max(num_mbs >> 3, 96);
      let mut refresh_countdown = max_count;
      let mut nz_row = vec![0u32; mb_w];
      for y in 0..mb_h {
        let mut left = LeftState::new();
        let mut left_mask = 0u32;
        let mut left_dc = 0u8;
        for x in 0..mb_w {
          let cells = unsafe { &mut *shared.cells.get() };
          process_mb(&shared, cells, x, y, &mut left, self.cfg.method >= 3, &proba, &cost_model);
          record_one(
            &cells.mb_info[y * mb_w + x],
            x,
            &mut nz_row,
            &mut left_mask,
            &mut left_dc,
            &mut tokens,
            &mut stats,
          );
          refresh_countdown -= 1;
          if refresh_countdown == 0 {
            // mid-stream probability refresh from the stats so far
            let (_, dirty) = costs::finalize_token_probas(&mut proba, &stats);
            if dirty {
              cost_model.refresh(&proba);
            }
            refresh_countdown = max_count;
          }
        }
      }
    }

    // the shared structure is done; take the cells back
    let Cells { mb_info, recon, .. } = shared.cells.into_inner();

    // final probability re-estimation and skip decision
    let num_skipped = mb_info.iter().filter(|i| i.skip).count() as u64;
    let (skip_proba, use_skip, skip_size) = costs::finalize_skip_proba(num_skipped, num_mbs as u64);
    proba.use_skip = use_skip;
    proba.skip_proba = skip_proba;
    let (proba_size, _) = costs::finalize_token_probas(&mut proba, &stats);

    let mut seg_counts = [0usize; NUM_MB_SEGMENTS];
    for info in &mb_info {
      seg_counts[info.segment as usize] += 1;
    }
    proba.segments = hls::segment_probas(&seg_counts);
    let update_map = self.num_segments > 1 && proba.segments.iter().any(|&p| p != 255);

    let num_parts = 1usize << self.cfg.partitions;
    let header = hls::FrameHeaderParams {
      mb_w: mb_w,
      mb_h: mb_h,
      segments: &self.segments,
      num_segments: self.num_segments,
      update_map: update_map,
      proba: &proba,
      filter_simple: self.cfg.filter_type == 0,
      filter_level: if self.cfg.filter_strength > 0 { self.segments[0].fstrength } else { 0 },
      filter_sharpness: self.cfg.filter_sharpness as i32,
      base_q: self.segments[0].quant,
      dq_uv_dc: self.dq_uv_dc,
      dq_uv_ac: self.dq_uv_ac,
      num_parts: num_parts,
    };
    let partition0 = hls::generate_partition0(&header, &mb_info);

    let mut partitions: Vec<Vec<u8>> = Vec::with_capacity(num_parts);
    for p in 0..num_parts {
      let mut w = crate::entropycode::EntropyWriter::new();
      for y in (0..mb_h).filter(|y| y & (num_parts - 1) == p) {
        for x in 0..mb_w {
          let idx = y * mb_w + x;
          if use_skip && mb_info[idx].skip {
            continue;
          }
          tokens.emit_mb(idx, &mut w, &proba);
        }
      }
      partitions.push(w.finalize());
    }

    let out = hls::assemble_frame(self.source.crop_width, self.source.crop_height, &partition0, &partitions)?;

    // statistics
    let sse_y = plane_sse(&self.source.y.data, &recon.y.data);
    let sse_u = plane_sse(&self.source.u.data, &recon.u.data);
    let sse_v = plane_sse(&self.source.v.data, &recon.v.data);
    let y_px = (mb_w * mb_h * 256) as u64;
    let uv_px = (mb_w * mb_h * 64) as u64;
    self.stats = EncoderStats {
      coded_size: out.len(),
      header_size: 10 + partition0.len(),
      residual_size: partitions.iter().map(|p| p.len()).sum(),
      proba_size: ((proba_size + skip_size) / (8 * 256)) as usize,
      psnr: [
        psnr_from_sse(sse_y, y_px),
        psnr_from_sse(sse_u, uv_px),
        psnr_from_sse(sse_v, uv_px),
        psnr_from_sse(sse_y + sse_u + sse_v, (mb_w * mb_h * 384) as u64),
        99.0,
      ],
    };
    debug!(
      "encoded {} bytes ({} header, {} tokens), psnr {:.2}",
      out.len(),
      self.stats.header_size,
      self.stats.residual_size,
      self.stats.psnr[3]
    );

    self.prev_stats = Some(stats);
    self.recon_pool = Some(recon);
    self.info_pool = Some(mb_info);
    Ok(out)
  }
}

fn plane_sse(a: &[u8], b: &[u8]) -> u64 {
  let mut sum = 0u64;
  for (&x, &y) in a.iter().zip(b.iter()) {
    let d = x as i64 - y as i64;
    sum += (d * d) as u64;
  }
  sum
}

fn record_one(
  info: &MbInfo,
  x: usize,
  nz_row: &mut [u32],
  left_mask: &mut u32,
  left_dc: &mut u8,
  tokens: &mut TokenBuffer,
  stats: &mut Stats,
) {
  let above = nz_row[x];
  let (mut top9, mut left9) = nz_to_ctx(above, *left_mask);
  let res = MbResiduals {
    is_i4: info.is_i4,
    levels: &info.levels,
    counts_y: &info.counts_y,
    counts_uv: &info.counts_uv,
    count_dc: info.count_dc,
  };
  crate::tokens::record_mb(Some(tokens), Some(stats), &res, &mut top9, &mut left9, left_dc);
  nz_row[x] = info.nz;
  *left_mask = info.nz;
}

fn record_row(
  mb_info: &[MbInfo],
  mb_w: usize,
  y: usize,
  nz_row: &mut [u32],
  tokens: &mut TokenBuffer,
  stats: &mut Stats,
) {
  let mut left_mask = 0u32;
  let mut left_dc = 0u8;
  for x in 0..mb_w {
    record_one(&mb_info[y * mb_w + x], x, &mut nz_row[..], &mut left_mask, &mut left_dc, tokens, stats);
  }
}

// Convenience wrappers mirroring the public constructor names
pub fn new_encoder_from_rgba(img: &RgbaImage, cfg: EncoderConfig) -> Result<Vp8Encoder> {
  Vp8Encoder::from_rgba(img, cfg)
}

pub fn new_encoder_from_yuv(yuv420: &[u8], width: usize, height: usize, cfg: EncoderConfig) -> Result<Vp8Encoder> {
  Vp8Encoder::from_yuv(yuv420, width, height, cfg)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::array2d::RgbaImage;

  fn gradient(w: usize, h: usize) -> RgbaImage {
    RgbaImage::new_with(h, w, |y, x| {
      [(x * 255 / w) as u8, (y * 255 / h) as u8, 128, 255]
    })
  }

  #[test]
  fn produces_a_valid_frame_tag() {
    let img = gradient(64, 48);
    let mut enc = Vp8Encoder::from_rgba(&img, EncoderConfig::default()).unwrap();
    let data = enc.encode_frame().unwrap();
    assert!(data.len() > 20);
    assert_eq!(data[0] & 1, 0); // keyframe
    assert_eq!(&data[3..6], &crate::decoder::VP8_MAGIC);
    let w = data[6] as usize | ((data[7] as usize & 0x3f) << 8);
    let h = data[8] as usize | ((data[9] as usize & 0x3f) << 8);
    assert_eq!((w, h), (64, 48));
  }

  #[test]
  fn quality_scales_size() {
    let img = gradient(96, 96);
    let mut lo_cfg = EncoderConfig::default();
    lo_cfg.quality = 10.0;
    let mut hi_cfg = EncoderConfig::default();
    hi_cfg.quality = 95.0;
    let lo = Vp8Encoder::from_rgba(&img, lo_cfg).unwrap().encode_frame().unwrap();
    let hi = Vp8Encoder::from_rgba(&img, hi_cfg).unwrap().encode_frame().unwrap();
    assert!(hi.len() >= lo.len());
  }

  #[test]
  fn rejects_oversized_input() {
    let r = Vp8Encoder::from_yuv(&[0u8; 16], 1 << 14, 8, EncoderConfig::default());
    assert!(matches!(r, Err(Error::TooLarge)));
  }

  #[test]
  fn target_size_search_moves_toward_target() {
    let img = gradient(64, 64);
    let mut cfg = EncoderConfig::default();
    cfg.method = 2; // keep the search fast
    let baseline = Vp8Encoder::from_rgba(&img, cfg.clone()).unwrap().encode_frame().unwrap();
    let mut small_cfg = cfg.clone();
    small_cfg.target_size = (baseline.len() / 2) as u32;
    let small = Vp8Encoder::from_rgba(&img, small_cfg).unwrap().encode_frame().unwrap();
    assert!(small.len() < baseline.len());
  }
}
