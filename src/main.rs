// Command-line front end: encode a Y4M frame into a WebP file, or
// decode a WebP file back to Y4M.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use tinywebp::encoder::Vp8Encoder;
use tinywebp::frame::YuvFrame;
use tinywebp::y4m::{Y4mReader, Y4mWriter};
use tinywebp::EncoderConfig;

#[derive(Parser)]
#[command(name = "tinywebp", about = "Lossy WebP encoder/decoder")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Encode the first frame of a Y4M file into a WebP file
  Encode {
    input: String,
    output: String,
    /// Quality, 0..100
    #[arg(short, long, default_value_t = 75.0)]
    quality: f32,
    /// Effort, 0..6
    #[arg(short, long, default_value_t = 4)]
    method: u8,
    /// Target size in bytes (0 = off)
    #[arg(long, default_value_t = 0)]
    target_size: u32,
    /// Number of segments, 1..4
    #[arg(long, default_value_t = 4)]
    segments: u8,
    /// Spatial noise shaping, 0..100
    #[arg(long, default_value_t = 50)]
    sns: u8,
    /// Deblocking strength, 0..100
    #[arg(long, default_value_t = 60)]
    filter_strength: u8,
    /// log2 of the token partition count, 0..3
    #[arg(long, default_value_t = 0)]
    partitions: u8,
  },
  /// Decode a WebP file into a single-frame Y4M file
  Decode { input: String, output: String },
}

fn run() -> Result<(), String> {
  let cli = Cli::parse();
  match cli.command {
    Command::Encode {
      input,
      output,
      quality,
      method,
      target_size,
      segments,
      sns,
      filter_strength,
      partitions,
    } => {
      let mut reader = Y4mReader::new(BufReader::new(
        File::open(&input).map_err(|e| format!("{}: {}", input, e))?,
      ))
      .map_err(|e| e.to_string())?;
      let frame = reader
        .read_frame()
        .map_err(|e| e.to_string())?
        .ok_or("input contains no frames")?;
      let mut cfg = EncoderConfig::default();
      cfg.quality = quality;
      cfg.method = method;
      cfg.target_size = target_size;
      cfg.segments = segments;
      cfg.sns_strength = sns;
      cfg.filter_strength = filter_strength;
      cfg.partitions = partitions;

      // flatten the planes into the raw-YUV entry point
      let (w, h) = (reader.width, reader.height);
      let uv_w = (w + 1) / 2;
      let uv_h = (h + 1) / 2;
      let mut raw = Vec::with_capacity(w * h + 2 * uv_w * uv_h);
      for y in 0..h {
        raw.extend_from_slice(&frame.y.row(y)[..w]);
      }
      for y in 0..uv_h {
        raw.extend_from_slice(&frame.u.row(y)[..uv_w]);
      }
      for y in 0..uv_h {
        raw.extend_from_slice(&frame.v.row(y)[..uv_w]);
      }
      let mut enc = Vp8Encoder::from_yuv(&raw, w, h, cfg).map_err(|e| e.to_string())?;
      let vp8 = enc.encode_frame().map_err(|e| e.to_string())?;
      let webp = tinywebp::assemble_riff(&vp8);
      File::create(&output)
        .and_then(|mut f| f.write_all(&webp))
        .map_err(|e| format!("{}: {}", output, e))?;
      let stats = enc.stats();
      eprintln!(
        "{}: {} bytes ({} header), psnr {:.2} dB",
        output,
        webp.len(),
        stats.header_size,
        stats.psnr[3]
      );
      Ok(())
    }
    Command::Decode { input, output } => {
      let mut data = Vec::new();
      File::open(&input)
        .and_then(|mut f| f.read_to_end(&mut data))
        .map_err(|e| format!("{}: {}", input, e))?;
      let chunks = tinywebp::riff::parse_container(&data).map_err(|e| e.to_string())?;
      let vp8 = chunks
        .iter()
        .find(|c| c.id == tinywebp::riff::FOURCC_VP8)
        .ok_or("no VP8 chunk in input")?;
      let decoded = tinywebp::decode_frame(vp8.payload).map_err(|e| e.to_string())?;
      let mut frame = YuvFrame::new(decoded.width, decoded.height);
      let y_width = frame.y.width;
      for y in 0..frame.y.height {
        let src = y * decoded.y_stride;
        frame.y.row_mut(y).copy_from_slice(&decoded.y[src..src + y_width]);
      }
      let u_width = frame.u.width;
      let v_width = frame.v.width;
      for y in 0..frame.u.height {
        let src = y * decoded.uv_stride;
        frame.u.row_mut(y).copy_from_slice(&decoded.u[src..src + u_width]);
        frame.v.row_mut(y).copy_from_slice(&decoded.v[src..src + v_width]);
      }
      let out = File::create(&output).map_err(|e| format!("{}: {}", output, e))?;
      let mut writer = Y4mWriter::new(BufWriter::new(out), decoded.width, decoded.height)
        .map_err(|e| e.to_string())?;
      writer.write_frame(&frame).map_err(|e| e.to_string())?;
      Ok(())
    }
  }
}

fn main() -> ExitCode {
  env_logger::init();
  match run() {
    Ok(()) => ExitCode::SUCCESS,
    Err(msg) => {
      eprintln!("error: {}", msg);
      ExitCode::FAILURE
    }
  }
}
