// 该文件是 Qianli （千里眼） 项目的一部分。
// src/palette.rs - 类别配色
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::Rgba;

const STROKE_WIDTH: f32 = 8.0;
const TEXT_SIZE: f32 = 48.0;

// 20 种易区分颜色，外加灰、白、黑
const COLORS: [[u8; 3]; 22] = [
  [230, 25, 75],
  [60, 180, 75],
  [255, 225, 25],
  [0, 130, 200],
  [245, 130, 48],
  [145, 30, 180],
  [70, 240, 240],
  [240, 50, 230],
  [210, 245, 60],
  [250, 190, 190],
  [0, 128, 128],
  [230, 190, 255],
  [170, 110, 40],
  [255, 250, 200],
  [128, 0, 0],
  [170, 255, 195],
  [128, 128, 0],
  [255, 215, 180],
  [0, 0, 128],
  [128, 128, 128],
  [255, 255, 255],
  [0, 0, 0],
];

pub const PALETTE_SIZE: usize = COLORS.len();

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Paint {
  pub color: Rgba<u8>,
  pub stroke_width: f32,
  pub text_size: f32,
}

const fn paint(rgb: [u8; 3]) -> Paint {
  Paint {
    color: Rgba([rgb[0], rgb[1], rgb[2], 0xff]),
    stroke_width: STROKE_WIDTH,
    text_size: TEXT_SIZE,
  }
}

/// 按类别下标取画笔，下标对调色板大小取模
pub fn paint_for_index(index: usize) -> Paint {
  paint(COLORS[index % PALETTE_SIZE])
}
