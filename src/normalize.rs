// 该文件是 Tanjing （探镜） 项目的一部分。
// src/normalize.rs - 坐标归一化
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

use serde::Serialize;

use crate::{
  frame::Letterbox,
  model::{Candidate, Labels},
};

const UNKNOWN_LABEL: &str = "unknown";

/// 对外输出的检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  /// 边界框左上角 x，相对模型输入 [0, 1]
  pub x: f32,
  /// 边界框左上角 y
  pub y: f32,
  /// 边界框宽度
  pub w: f32,
  /// 边界框高度
  pub h: f32,
  /// 类别名称
  pub label: String,
  /// 类别编号
  pub label_id: u32,
  /// 置信度
  pub score: f32,
}

/// 一帧的检测结果以及该帧的 letterbox 参数
#[derive(Debug, Clone)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
  pub letterbox: Letterbox,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  /// 映射到原始帧坐标系
  pub fn to_source(&self) -> Vec<Detection> {
    self
      .items
      .iter()
      .map(|d| self.letterbox.to_source(d))
      .collect()
  }
}

fn unit(v: f32) -> f32 {
  if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }
}

/// 把模型输入像素坐标除以输入尺寸并裁剪到 [0, 1]
pub fn normalize(candidates: &[Candidate], input_size: u32, labels: &Labels) -> Vec<Detection> {
  let size = input_size.max(1) as f32;
  candidates
    .iter()
    .map(|c| {
      let x1 = unit(c.bbox.x / size);
      let y1 = unit(c.bbox.y / size);
      let x2 = unit(c.bbox.x2() / size);
      let y2 = unit(c.bbox.y2() / size);
      Detection {
        x: x1,
        y: y1,
        w: (x2 - x1).max(0.0),
        h: (y2 - y1).max(0.0),
        label: labels.name(c.label).unwrap_or(UNKNOWN_LABEL).to_string(),
        label_id: c.label,
        score: unit(c.score),
      }
    })
    .collect()
}

impl Letterbox {
  /// 把相对模型输入的检测框映射为相对原始帧的 [0, 1] 坐标
  pub fn to_source(&self, det: &Detection) -> Detection {
    let size = self.input_size as f32;
    let src_w = self.source_width.max(1) as f32;
    let src_h = self.source_height.max(1) as f32;
    let roi_w = self.roi.width.max(1) as f32;
    let roi_h = self.roi.height.max(1) as f32;

    let width_ratio = src_w / roi_w;
    let height_ratio = src_h / roi_h;

    let x1 = (det.x * size - self.roi.x as f32) * width_ratio;
    let y1 = (det.y * size - self.roi.y as f32) * height_ratio;
    let x2 = ((det.x + det.w) * size - self.roi.x as f32) * width_ratio;
    let y2 = ((det.y + det.h) * size - self.roi.y as f32) * height_ratio;

    let x1 = x1.clamp(0.0, src_w);
    let y1 = y1.clamp(0.0, src_h);
    let x2 = x2.clamp(0.0, src_w);
    let y2 = y2.clamp(0.0, src_h);

    Detection {
      x: x1 / src_w,
      y: y1 / src_h,
      w: (x2 - x1).max(0.0) / src_w,
      h: (y2 - y1).max(0.0) / src_h,
      ..det.clone()
    }
  }
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;
  use crate::model::BoundingBox;

  fn cand(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
    Candidate {
      bbox: BoundingBox::new(x, y, w, h),
      label: 2,
      score,
    }
  }

  #[test]
  fn divides_by_input_size() {
    let dets = normalize(&[cand(104.0, 208.0, 52.0, 26.0, 0.7)], 416, &Labels::coco());
    let d = &dets[0];
    assert!((d.x - 0.25).abs() < 1e-6);
    assert!((d.y - 0.5).abs() < 1e-6);
    assert!((d.w - 0.125).abs() < 1e-6);
    assert!((d.h - 0.0625).abs() < 1e-6);
    assert_eq!(d.label, "car");
    assert_eq!(d.label_id, 2);
  }

  #[test]
  fn clamps_overshoot_and_bad_values() {
    let dets = normalize(
      &[
        cand(-10.0, 400.0, 50.0, 50.0, 1.2),
        cand(f32::NAN, 0.0, 10.0, 10.0, f32::INFINITY),
      ],
      416,
      &Labels::coco(),
    );
    for d in &dets {
      for v in [d.x, d.y, d.w, d.h, d.score] {
        assert!((0.0..=1.0).contains(&v));
      }
      assert!(d.x + d.w <= 1.0 + 1e-6);
      assert!(d.y + d.h <= 1.0 + 1e-6);
    }
    assert_eq!(dets[0].x, 0.0);
    assert_eq!(dets[0].score, 1.0);
    assert_eq!(dets[1].score, 0.0);
  }

  #[test]
  fn unknown_label_falls_back() {
    let dets = normalize(&[cand(0.0, 0.0, 1.0, 1.0, 0.5)], 416, &Labels::new(["a"]));
    assert_eq!(dets[0].label, UNKNOWN_LABEL);
  }

  #[test]
  fn maps_back_through_letterbox() {
    // 640x480 -> 416：roi (0, 52, 416, 312)
    let lb = Letterbox::compute(640, 480, 416);
    let det = Detection {
      x: 0.0,
      y: 52.0 / 416.0,
      w: 208.0 / 416.0,
      h: 156.0 / 416.0,
      label: "person".to_string(),
      label_id: 0,
      score: 0.9,
    };
    let src = lb.to_source(&det);
    assert!(src.x.abs() < 1e-5);
    assert!(src.y.abs() < 1e-5);
    assert!((src.w - 0.5).abs() < 1e-5);
    assert!((src.h - 0.5).abs() < 1e-5);
    assert_eq!(src.label, "person");
  }

  #[test]
  fn padding_area_clamps_to_frame() {
    let lb = Letterbox::compute(640, 480, 416);
    let det = Detection {
      x: 0.0,
      y: 0.0,
      w: 1.0,
      h: 0.05,
      label: "person".to_string(),
      label_id: 0,
      score: 0.9,
    };
    let src = lb.to_source(&det);
    assert_eq!(src.y, 0.0);
    assert_eq!(src.h, 0.0);
  }

  fn coord() -> impl Strategy<Value = f32> {
    prop_oneof![
      8 => -1e6f32..1e6,
      1 => Just(f32::NAN),
      1 => Just(f32::INFINITY),
      1 => Just(f32::NEG_INFINITY),
    ]
  }

  proptest! {
    #[test]
    fn normalized_boxes_fit_unit_square(
      raw in prop::collection::vec((coord(), coord(), coord(), coord(), coord()), 1..100),
      size in 1u32..2048,
    ) {
      let candidates: Vec<Candidate> = raw
        .iter()
        .map(|&(x, y, w, h, score)| cand(x, y, w, h, score))
        .collect();
      let dets = normalize(&candidates, size, &Labels::coco());
      prop_assert_eq!(dets.len(), candidates.len());
      for d in &dets {
        for v in [d.x, d.y, d.w, d.h, d.score] {
          prop_assert!((0.0..=1.0).contains(&v), "{:?}", d);
        }
        prop_assert!(d.x + d.w <= 1.0 + 1e-6, "{:?}", d);
        prop_assert!(d.y + d.h <= 1.0 + 1e-6, "{:?}", d);
      }
    }
  }
}
