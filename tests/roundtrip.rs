// Encode/decode round trips of the VP8 layer on synthetic content.

use tinywebp::config::EncoderConfig;
use tinywebp::decoder::decode_frame;
use tinywebp::encoder::Vp8Encoder;
use tinywebp::riff;
use tinywebp::RgbaImage;

fn gradient(w: usize, h: usize) -> RgbaImage {
  RgbaImage::new_with(h, w, |y, x| {
    [
      (x * 255 / w.max(1)) as u8,
      (y * 255 / h.max(1)) as u8,
      ((x + y) * 127 / (w + h)) as u8,
      255,
    ]
  })
}

fn checker(w: usize, h: usize, cell: usize) -> RgbaImage {
  RgbaImage::new_with(h, w, |y, x| {
    if (x / cell + y / cell) % 2 == 0 {
      [230, 230, 230, 255]
    } else {
      [30, 30, 30, 255]
    }
  })
}

fn encode_with(img: &RgbaImage, cfg: EncoderConfig) -> Vec<u8> {
  Vp8Encoder::from_rgba(img, cfg).unwrap().encode_frame().unwrap()
}

fn luma_mean_abs_error(img: &RgbaImage, cfg: EncoderConfig) -> f64 {
  let data = encode_with(img, cfg);
  let dec = decode_frame(&data).unwrap();
  assert_eq!(dec.width, img.cols());
  assert_eq!(dec.height, img.rows());
  // compare in luma space against a fresh import of the source
  let src = tinywebp::yuv::import_rgba(img, 0.0);
  let mut err = 0u64;
  for y in 0..dec.height {
    for x in 0..dec.width {
      let a = src.y.at(x, y) as i64;
      let b = dec.y[y * dec.y_stride + x] as i64;
      err += (a - b).unsigned_abs();
    }
  }
  err as f64 / (dec.width * dec.height) as f64
}

#[test]
fn smooth_image_decodes_accurately() {
  for (w, h) in [(64, 64), (80, 48), (33, 17)] {
    let img = gradient(w, h);
    let mut cfg = EncoderConfig::default();
    cfg.quality = 90.0;
    let mae = luma_mean_abs_error(&img, cfg);
    assert!(mae < 6.0, "{}x{} mean abs error {}", w, h, mae);
  }
}

#[test]
fn quality_controls_fidelity() {
  let img = checker(64, 64, 8);
  let mut lo = EncoderConfig::default();
  lo.quality = 5.0;
  let mut hi = EncoderConfig::default();
  hi.quality = 95.0;
  let mae_lo = luma_mean_abs_error(&img, lo);
  let mae_hi = luma_mean_abs_error(&img, hi);
  assert!(mae_hi <= mae_lo, "hi {} vs lo {}", mae_hi, mae_lo);
}

#[test]
fn every_method_roundtrips() {
  let img = gradient(48, 48);
  for method in 0..=6u8 {
    let mut cfg = EncoderConfig::default();
    cfg.method = method;
    let data = encode_with(&img, cfg);
    let dec = decode_frame(&data).unwrap();
    assert_eq!((dec.width, dec.height), (48, 48), "method {}", method);
  }
}

#[test]
fn token_partitions_decode_identically() {
  let img = checker(96, 80, 5);
  let mut reference: Option<Vec<u8>> = None;
  for log2 in 0..=3u8 {
    let mut cfg = EncoderConfig::default();
    cfg.partitions = log2;
    cfg.method = 2;
    let data = encode_with(&img, cfg);
    let dec = decode_frame(&data).unwrap();
    match &reference {
      None => reference = Some(dec.y.clone()),
      Some(r) => assert_eq!(r, &dec.y, "partitions=2^{}", log2),
    }
  }
}

#[test]
fn reencoding_is_stable() {
  let img = gradient(64, 64);
  let cfg = EncoderConfig::default();
  let first = encode_with(&img, cfg.clone());
  let dec = decode_frame(&first).unwrap();
  let decoded_img = RgbaImage::new_with(64, 64, |y, x| {
    let yy = dec.y[y * dec.y_stride + x];
    let u = dec.u[(y / 2) * dec.uv_stride + x / 2];
    let v = dec.v[(y / 2) * dec.uv_stride + x / 2];
    let [r, g, b] = tinywebp::yuv::yuv_to_rgb(yy, u, v);
    [r, g, b, 255]
  });
  let second = encode_with(&decoded_img, cfg);
  // re-quantizing already-quantized content must stay in the same ballpark
  let ratio = second.len() as f64 / first.len() as f64;
  assert!(ratio > 0.5 && ratio < 1.6, "size ratio {}", ratio);
}

#[test]
fn segments_and_filter_roundtrip() {
  // two very different regions exercise multi-segment coding and the
  // loop filter path
  let img = RgbaImage::new_with(96, 96, |y, x| {
    if x < 48 {
      [120, 120, 120, 255]
    } else {
      let v = ((x * 31 + y * 57) % 256) as u8;
      [v, v ^ 0xff, v.wrapping_mul(3), 255]
    }
  });
  let mut cfg = EncoderConfig::default();
  cfg.segments = 4;
  cfg.filter_strength = 80;
  let data = encode_with(&img, cfg);
  let dec = decode_frame(&data).unwrap();
  // the flat half must stay flat after deblocking
  let base = dec.y[10 * dec.y_stride + 10];
  for x in 5..40 {
    let v = dec.y[10 * dec.y_stride + x];
    assert!((v as i32 - base as i32).abs() < 12, "x={} v={} base={}", x, v, base);
  }
}

#[test]
fn riff_wrapping_preserves_bitstream() {
  let img = gradient(32, 32);
  let vp8 = encode_with(&img, EncoderConfig::default());
  let file = riff::assemble_riff(&vp8);
  let chunks = riff::parse_container(&file).unwrap();
  assert_eq!(chunks.len(), 1);
  assert_eq!(chunks[0].id, riff::FOURCC_VP8);
  assert_eq!(chunks[0].payload, &vp8[..]);
  // and the payload still decodes
  assert!(decode_frame(chunks[0].payload).is_ok());
}

#[test]
fn truncated_stream_is_detected() {
  let img = gradient(64, 64);
  let data = encode_with(&img, EncoderConfig::default());
  // cut deep inside the token partition
  let cut = &data[..data.len() * 2 / 3];
  assert!(decode_frame(cut).is_err());
}
