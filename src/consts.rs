// Fixed tables of the VP8 bitstream: scan order, dequantization lookups,
// and the few encoder-side weighting tables that go with them.

// Buffer pitch stride of the prediction/reconstruction scratch areas.
// 32 leaves room for a macroblock plus its top/left/top-right context.
pub const BPS: usize = 32;

// Zigzag scan: n-th coefficient in scan order -> raster position
pub const k_zigzag: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

// Raster position -> scan order, the inverse of k_zigzag
pub const k_reverse_zigzag: [usize; 16] = [0, 1, 5, 6, 2, 4, 7, 12, 3, 8, 11, 13, 9, 10, 14, 15];

// DC dequantization factors, indexed by quantizer index 0..127
pub const k_dc_table: [u16; 128] = [
  4, 5, 6, 7, 8, 9, 10, 10, 11, 12, 13, 14, 15, 16, 17, 17,
  18, 19, 20, 20, 21, 21, 22, 22, 23, 23, 24, 25, 25, 26, 27, 28,
  29, 30, 31, 32, 33, 34, 35, 36, 37, 37, 38, 39, 40, 41, 42, 43,
  44, 45, 46, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58,
  59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74,
  75, 76, 76, 77, 78, 79, 80, 81, 82, 83, 84, 85, 86, 87, 88, 89,
  91, 93, 95, 96, 98, 100, 101, 102, 104, 106, 108, 110, 112, 114, 116, 118,
  122, 124, 126, 128, 130, 132, 134, 136, 138, 140, 143, 145, 148, 151, 154, 157,
];

// AC dequantization factors
pub const k_ac_table: [u16; 128] = [
  4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19,
  20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35,
  36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51,
  52, 53, 54, 55, 56, 57, 58, 60, 62, 64, 66, 68, 70, 72, 74, 76,
  78, 80, 82, 84, 86, 88, 90, 92, 94, 96, 98, 100, 102, 104, 106, 108,
  110, 112, 114, 116, 119, 122, 125, 128, 131, 134, 137, 140, 143, 146, 149, 152,
  155, 158, 161, 164, 167, 170, 173, 177, 181, 185, 189, 193, 197, 201, 205, 209,
  213, 217, 221, 225, 229, 234, 239, 245, 249, 254, 259, 264, 269, 274, 279, 284,
];

// The Y2 (WHT) AC factor is the plain AC factor scaled by ~1.55, floored at 8
pub fn ac_table2(q: usize) -> u16 {
  let v = (k_ac_table[q] as u32 * 101581) >> 16;
  if v < 8 { 8 } else { v as u16 }
}

// Frequency-dependent sharpening added before quantization (Y1 only).
// Stored values get scaled by the quantizer: sharpen = (f * q) >> 11
pub const k_freq_sharpening: [u16; 16] = [
  0, 30, 60, 90, 30, 60, 90, 90, 60, 90, 90, 90, 90, 90, 90, 90,
];

// Distortion weights per zigzag position used by the trellis search
pub const k_weight_trellis: [u16; 16] = [
  30, 27, 19, 11, 27, 24, 17, 10, 19, 17, 12, 8, 11, 10, 8, 6,
];

// Distortion weights for the texture metric (TDisto), raster order
pub const k_weight_y: [u16; 16] = [
  38, 32, 20, 9, 32, 28, 17, 7, 20, 17, 10, 4, 9, 7, 4, 2,
];

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zigzag_tables_are_inverse() {
    for n in 0..16 {
      assert_eq!(k_reverse_zigzag[k_zigzag[n]], n);
    }
  }

  #[test]
  fn quant_tables_are_monotone() {
    for q in 1..128 {
      assert!(k_dc_table[q] >= k_dc_table[q - 1]);
      assert!(k_ac_table[q] >= k_ac_table[q - 1]);
      assert!(ac_table2(q) >= ac_table2(q - 1));
    }
    assert_eq!(ac_table2(0), 8);
  }
}
