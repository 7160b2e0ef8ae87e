// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output/draw.rs - 在图像上绘制检测框
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

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::normalize::Detection;

const BOX_THICKNESS: i32 = 2;

// 按类别编号轮换使用
const PALETTE: [[u8; 3]; 6] = [
  [0, 0, 255],
  [255, 0, 0],
  [0, 200, 0],
  [255, 160, 0],
  [200, 0, 200],
  [0, 200, 200],
];

pub struct Draw {
  thickness: i32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      thickness: BOX_THICKNESS,
    }
  }
}

impl Draw {
  pub fn with_thickness(mut self, thickness: i32) -> Self {
    self.thickness = thickness.max(1);
    self
  }

  pub fn color_of(label_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[label_id as usize % PALETTE.len()])
  }

  /// `detections` 的坐标是相对 `image` 的 [0, 1] 值
  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
    for det in detections {
      self.draw_bbox(image, det, Self::color_of(det.label_id));
    }
  }

  fn draw_bbox(&self, image: &mut RgbImage, det: &Detection, color: Rgb<u8>) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    if w < 1.0 || h < 1.0 {
      return;
    }

    let x_min = ((det.x * w).floor() as i32).clamp(0, w as i32 - 1);
    let y_min = ((det.y * h).floor() as i32).clamp(0, h as i32 - 1);
    let x_max = (((det.x + det.w) * w).ceil() as i32).clamp(0, w as i32 - 1);
    let y_max = (((det.y + det.h) * h).ceil() as i32).clamp(0, h as i32 - 1);

    for t in 0..self.thickness {
      let width = x_max - x_min - 2 * t + 1;
      let height = y_max - y_min - 2 * t + 1;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn det(x: f32, y: f32, w: f32, h: f32) -> Detection {
    Detection {
      x,
      y,
      w,
      h,
      label: "person".to_string(),
      label_id: 0,
      score: 0.9,
    }
  }

  #[test]
  fn draws_border_not_interior() {
    let mut image = RgbImage::new(100, 100);
    Draw::default().draw_detections(&mut image, &[det(0.1, 0.1, 0.5, 0.5)]);

    let color = Draw::color_of(0);
    assert_eq!(*image.get_pixel(10, 10), color);
    assert_eq!(*image.get_pixel(11, 30), color);
    assert_eq!(*image.get_pixel(30, 30), Rgb([0, 0, 0]));
    assert_eq!(*image.get_pixel(5, 5), Rgb([0, 0, 0]));
  }

  #[test]
  fn degenerate_box_is_harmless() {
    let mut image = RgbImage::new(10, 10);
    Draw::default().draw_detections(&mut image, &[det(1.0, 1.0, 0.0, 0.0), det(0.0, 0.0, 1.0, 1.0)]);
    assert_eq!(*image.get_pixel(0, 0), Draw::color_of(0));
    assert_eq!(*image.get_pixel(9, 9), Draw::color_of(0));
  }
}
