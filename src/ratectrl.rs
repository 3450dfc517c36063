// Multi-pass rate control: a secant search over the quality value,
// driven either by a byte-size target or a PSNR target.

use crate::util::clamp;

const DQ_LIMIT: f64 = 0.4;

pub struct PassStats {
  pub q: f64,
  pub last_q: f64,
  pub value: f64,
  pub last_value: f64,
  pub target: f64,
  pub dq: f64,
  pub qmin: f64,
  pub qmax: f64,
  pub do_size_search: bool,
  is_first: bool,
}

impl PassStats {
  pub fn new(target_size: u32, target_psnr: f64, qmin: f64, qmax: f64, quality: f64) -> Self {
    let do_size_search = target_size != 0;
    Self {
      q: clamp(quality, qmin, qmax),
      last_q: clamp(quality, qmin, qmax),
      value: 0.0,
      last_value: 0.0,
      target: if do_size_search {
        target_size as f64
      } else if target_psnr > 0.0 {
        target_psnr
      } else {
        40.0
      },
      dq: 10.0,
      qmin: qmin,
      qmax: qmax,
      do_size_search: do_size_search,
      is_first: true,
    }
  }

  // One secant step from the measured `value`; returns the next quality
  pub fn compute_next_q(&mut self) -> f64 {
    let dq = if self.is_first {
      self.is_first = false;
      if self.value > self.target {
        -self.dq
      } else {
        self.dq
      }
    } else if self.value != self.last_value {
      let slope = (self.target - self.value) / (self.last_value - self.value);
      slope * (self.last_q - self.q)
    } else {
      0.0
    };
    self.dq = clamp(dq, -30.0, 30.0);
    self.last_q = self.q;
    self.last_value = self.value;
    self.q = clamp(self.q + self.dq, self.qmin, self.qmax);
    self.q
  }

  pub fn converged(&self) -> bool {
    !self.is_first && self.dq.abs() <= DQ_LIMIT
  }
}

pub fn psnr_from_sse(sse: u64, num_pixels: u64) -> f64 {
  if sse > 0 && num_pixels > 0 {
    10.0 * (255.0 * 255.0 * num_pixels as f64 / sse as f64).log10()
  } else {
    99.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn size_search_converges_on_monotone_model() {
    // synthetic model: size grows linearly with quality
    let model = |q: f64| 100.0 + 40.0 * q;
    let mut s = PassStats::new(2500, 0.0, 0.0, 100.0, 75.0);
    for _ in 0..20 {
      s.value = model(s.q);
      s.compute_next_q();
      if s.converged() {
        break;
      }
    }
    assert!(s.converged());
    assert!((model(s.q) - 2500.0).abs() < 200.0, "q = {}", s.q);
  }

  #[test]
  fn first_step_direction() {
    let mut s = PassStats::new(1000, 0.0, 0.0, 100.0, 50.0);
    s.value = 5000.0; // too big: quality must drop
    s.compute_next_q();
    assert!(s.q < 50.0);
    let mut s = PassStats::new(1000, 0.0, 0.0, 100.0, 50.0);
    s.value = 100.0; // too small: quality must rise
    s.compute_next_q();
    assert!(s.q > 50.0);
  }

  #[test]
  fn psnr_scale() {
    // an all-zero error is reported as the 99 dB ceiling
    assert_eq!(psnr_from_sse(0, 1000), 99.0);
    let noisy = psnr_from_sse(1000 * 25, 1000);
    let clean = psnr_from_sse(1000, 1000);
    assert!(clean > noisy);
    assert!((psnr_from_sse(1000 * 255 * 255, 1000) - 0.0).abs() < 1e-9);
  }
}
