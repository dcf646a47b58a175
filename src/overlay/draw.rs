// 该文件是 Qianli （千里眼） 项目的一部分。
// src/overlay/draw.rs - 检测框与标签绘制
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::RgbaImage;
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::model::Detection;
use crate::overlay::OverlayRect;
use crate::palette::Paint;

// 标签基线位于框顶上方的距离
const LABEL_BASELINE_GAP: f32 = 10.0;

/// 以画笔宽度绘制空心框，线宽以边为中心向两侧展开
pub fn draw_box(canvas: &mut RgbaImage, rect: &OverlayRect, paint: &Paint) {
  let left = rect.left.round() as i32;
  let top = rect.top.round() as i32;
  let width = (rect.right - rect.left).round() as i32;
  let height = (rect.bottom - rect.top).round() as i32;

  let half = (paint.stroke_width / 2.0).round().max(1.0) as i32;
  for offset in -half..half {
    let (w, h) = (width - 2 * offset, height - 2 * offset);
    // 框太小时内侧描边退化
    if w <= 0 || h <= 0 {
      continue;
    }
    let outline = Rect::at(left + offset, top + offset).of_size(w as u32, h as u32);
    draw_hollow_rect_mut(canvas, outline, paint.color);
  }
}

/// 在框的左上角上方绘制标签
pub fn draw_label(
  canvas: &mut RgbaImage,
  rect: &OverlayRect,
  paint: &Paint,
  font: &FontArc,
  label: &str,
) {
  // imageproc 以文字左上角定位，这里换算成基线
  let y = rect.top - LABEL_BASELINE_GAP - paint.text_size;
  draw_text_mut(
    canvas,
    paint.color,
    rect.left.round() as i32,
    y.round() as i32,
    PxScale::from(paint.text_size),
    font,
    label,
  );
}

/// 把检测结果写成与图像同名的文本文件
pub struct Record {
  pub label_with_name: bool,
}

impl Record {
  pub fn format(&self, detections: &[Detection]) -> String {
    detections
      .iter()
      .map(|d| {
        let name = if self.label_with_name {
          d.label.to_string()
        } else {
          d.class_index.to_string()
        };
        format!(
          "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
          name, d.confidence, d.left, d.top, d.right, d.bottom
        )
      })
      .collect::<Vec<_>>()
      .join("\n")
  }

  pub fn record(&self, detections: &[Detection], path: &Path) -> Result<(), std::io::Error> {
    std::fs::write(path.with_extension("txt"), self.format(detections))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use image::Rgba;

  use super::*;
  use crate::palette::paint_for_index;

  #[test]
  fn stroke_spans_both_sides_of_the_edge() {
    let mut canvas = RgbaImage::new(64, 64);
    let paint = paint_for_index(3);
    let rect = OverlayRect {
      left: 20.0,
      top: 20.0,
      right: 44.0,
      bottom: 44.0,
    };
    draw_box(&mut canvas, &rect, &paint);

    assert_eq!(*canvas.get_pixel(16, 30), paint.color);
    assert_eq!(*canvas.get_pixel(23, 30), paint.color);
    assert_eq!(*canvas.get_pixel(15, 30), Rgba([0, 0, 0, 0]));
    assert_eq!(*canvas.get_pixel(32, 32), Rgba([0, 0, 0, 0]));
  }

  #[test]
  fn degenerate_box_does_not_panic() {
    let mut canvas = RgbaImage::new(16, 16);
    let rect = OverlayRect {
      left: 8.0,
      top: 8.0,
      right: 8.0,
      bottom: 8.0,
    };
    draw_box(&mut canvas, &rect, &paint_for_index(0));
  }

  #[test]
  fn record_lines() {
    let detections = [Detection {
      left: 0.1,
      top: 0.2,
      right: 0.3,
      bottom: 0.4,
      confidence: 0.5,
      class_index: 14,
      label: Arc::from("person"),
    }];
    let by_name = Record {
      label_with_name: true,
    };
    let by_id = Record {
      label_with_name: false,
    };
    assert_eq!(
      by_name.format(&detections),
      "person, 0.5000, 0.1000, 0.2000, 0.3000, 0.4000"
    );
    assert!(by_id.format(&detections).starts_with("14, "));
  }
}
