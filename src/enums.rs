// Prediction mode numbering, as coded in the bitstream

// 16x16 luma and 8x8 chroma share the same four modes
pub const DC_PRED: u8 = 0;
pub const V_PRED: u8 = 1;
pub const H_PRED: u8 = 2;
pub const TM_PRED: u8 = 3;
pub const NUM_PRED_MODES: usize = 4;

// 4x4 luma sub-block modes
pub const B_DC_PRED: u8 = 0;
pub const B_TM_PRED: u8 = 1;
pub const B_VE_PRED: u8 = 2;
pub const B_HE_PRED: u8 = 3;
pub const B_RD_PRED: u8 = 4;
pub const B_VR_PRED: u8 = 5;
pub const B_LD_PRED: u8 = 6;
pub const B_VL_PRED: u8 = 7;
pub const B_HD_PRED: u8 = 8;
pub const B_HU_PRED: u8 = 9;
pub const NUM_BMODES: usize = 10;

// Coefficient plane types, indexing the probability tables
pub const TYPE_Y_AFTER_Y2: usize = 0; // luma AC, DC carried by the Y2 block
pub const TYPE_Y2: usize = 1; // WHT of the 16 luma DCs
pub const TYPE_UV: usize = 2;
pub const TYPE_Y_NO_Y2: usize = 3; // luma of an intra-4x4 macroblock
pub const NUM_TYPES: usize = 4;

pub const MAX_LEVEL: i32 = 2047;
pub const NUM_MB_SEGMENTS: usize = 4;
