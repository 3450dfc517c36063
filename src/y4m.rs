// Minimal Y4M (YUV4MPEG2) reader/writer for the command-line tool.
// Only 4:2:0 with 8-bit samples is handled.

use std::io;
use std::io::prelude::*;

use byteorder::ReadBytesExt;

use crate::frame::YuvFrame;

const Y4M_FILE_MAGIC: &str = "YUV4MPEG2";
const Y4M_FRAME_MAGIC: &str = "FRAME";

pub struct Y4mReader<R> {
  inner: R,
  pub width: usize,
  pub height: usize,
}

pub struct Y4mWriter<W> {
  inner: W,
  width: usize,
  height: usize,
}

fn bad_data(msg: &str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn read_decimal<R: Read>(r: &mut R) -> io::Result<(usize, u8)> {
  let mut v = 0usize;
  loop {
    let byte = r.read_u8()?;
    match byte {
      b'0'..=b'9' => v = 10 * v + (byte - b'0') as usize,
      _ => return Ok((v, byte)),
    }
  }
}

impl<R: Read> Y4mReader<R> {
  pub fn new(mut inner: R) -> io::Result<Self> {
    let mut magic = [0u8; 9];
    inner.read_exact(&mut magic)?;
    if magic != Y4M_FILE_MAGIC.as_bytes() {
      return Err(bad_data("not a Y4M file"));
    }
    let mut width = 0;
    let mut height = 0;
    // parameter list, terminated by a newline
    loop {
      let tag = inner.read_u8()?;
      match tag {
        b'\n' => break,
        b' ' => continue,
        b'W' => width = read_decimal(&mut inner)?.0,
        b'H' => height = read_decimal(&mut inner)?.0,
        b'C' => {
          let (subsampling, _) = read_decimal(&mut inner)?;
          if subsampling != 420 {
            return Err(bad_data("only C420 input is supported"));
          }
        }
        _ => {
          // skip the value of any parameter we don't care about
          loop {
            let b = inner.read_u8()?;
            if b == b' ' || b == b'\n' {
              if b == b'\n' {
                return finish_header(inner, width, height);
              }
              break;
            }
          }
        }
      }
    }
    finish_header(inner, width, height)
  }

  pub fn read_frame(&mut self) -> io::Result<Option<YuvFrame>> {
    let mut magic = [0u8; 5];
    match self.inner.read_exact(&mut magic) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
      Err(e) => return Err(e),
    }
    if magic != Y4M_FRAME_MAGIC.as_bytes() {
      return Err(bad_data("missing FRAME marker"));
    }
    // frame parameters up to the newline
    loop {
      if self.inner.read_u8()? == b'\n' {
        break;
      }
    }
    let mut frame = YuvFrame::new(self.width, self.height);
    for y in 0..self.height {
      self.inner.read_exact(&mut frame.y.row_mut(y)[..self.width])?;
    }
    let uv_w = (self.width + 1) / 2;
    let uv_h = (self.height + 1) / 2;
    for y in 0..uv_h {
      self.inner.read_exact(&mut frame.u.row_mut(y)[..uv_w])?;
    }
    for y in 0..uv_h {
      self.inner.read_exact(&mut frame.v.row_mut(y)[..uv_w])?;
    }
    frame.replicate_borders();
    Ok(Some(frame))
  }
}

fn finish_header<R: Read>(inner: R, width: usize, height: usize) -> io::Result<Y4mReader<R>> {
  if width == 0 || height == 0 {
    return Err(bad_data("missing Y4M dimensions"));
  }
  Ok(Y4mReader { inner: inner, width: width, height: height })
}

impl<W: Write> Y4mWriter<W> {
  pub fn new(mut inner: W, width: usize, height: usize) -> io::Result<Self> {
    write!(inner, "{} W{} H{} F25:1 Ip A1:1 C420\n", Y4M_FILE_MAGIC, width, height)?;
    Ok(Self { inner: inner, width: width, height: height })
  }

  pub fn write_frame(&mut self, frame: &YuvFrame) -> io::Result<()> {
    write!(self.inner, "{}\n", Y4M_FRAME_MAGIC)?;
    for y in 0..self.height {
      self.inner.write_all(&frame.y.row(y)[..self.width])?;
    }
    let uv_w = (self.width + 1) / 2;
    let uv_h = (self.height + 1) / 2;
    for y in 0..uv_h {
      self.inner.write_all(&frame.u.row(y)[..uv_w])?;
    }
    for y in 0..uv_h {
      self.inner.write_all(&frame.v.row(y)[..uv_w])?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn header_and_frame_roundtrip() {
    let mut frame = YuvFrame::new(6, 4);
    for y in 0..4 {
      for x in 0..6 {
        frame.y.row_mut(y)[x] = (y * 6 + x) as u8;
      }
    }
    let mut buf = Vec::new();
    {
      let mut w = Y4mWriter::new(&mut buf, 6, 4).unwrap();
      w.write_frame(&frame).unwrap();
    }
    let mut r = Y4mReader::new(Cursor::new(&buf)).unwrap();
    assert_eq!((r.width, r.height), (6, 4));
    let back = r.read_frame().unwrap().unwrap();
    assert_eq!(back.y.row(2)[..6], frame.y.row(2)[..6]);
  }
}
