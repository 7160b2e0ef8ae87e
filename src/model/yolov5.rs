// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model/yolov5.rs - YOLOv5 锚框输出解码
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

use tracing::debug;

use crate::{
  engine::RawOutput,
  model::{
    BoundingBox, Candidate, DecodeShapeError, Decoder, argmax, grid_size, lens_of, sigmoid,
  },
};

const YOLOV5_LEVELS: [(u32, [(f32, f32); 3]); 3] = [
  (8, [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)]),
  (16, [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)]),
  (32, [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)]),
];

/// YOLOv5 检测头（未经 Detect 层解码的原始输出）
///
/// 每层元素按 锚框 → 行 → 列 → `(tx, ty, tw, th, obj, cls...)` 排列；
/// 可以是三层拼接成的一个张量，也可以是每层一个张量。
#[derive(Debug, Clone)]
pub struct YoloV5Decoder {
  input_size: u32,
  num_classes: usize,
  /// 每层的步长及其锚框
  levels: Vec<(u32, Vec<(f32, f32)>)>,
}

impl YoloV5Decoder {
  pub fn new(input_size: u32, num_classes: usize) -> Self {
    Self {
      input_size,
      num_classes,
      levels: YOLOV5_LEVELS
        .iter()
        .map(|(stride, anchors)| (*stride, anchors.to_vec()))
        .collect(),
    }
  }

  /// 自定义各层步长与锚框（像素单位）
  pub fn with_anchors(mut self, levels: Vec<(u32, Vec<(f32, f32)>)>) -> Self {
    self.levels = levels;
    self
  }

  fn channels(&self) -> usize {
    5 + self.num_classes
  }

  fn level_len(&self, level: usize) -> usize {
    let (stride, anchors) = &self.levels[level];
    let n = grid_size(self.input_size, *stride);
    anchors.len() * n * n * self.channels()
  }

  pub fn expected_len(&self) -> usize {
    (0..self.levels.len()).map(|l| self.level_len(l)).sum()
  }

  /// 按层切分输出
  fn split_levels<'a>(&self, output: &'a RawOutput) -> Vec<&'a [f32]> {
    let tensors = output.tensors();
    if tensors.len() == 1 {
      let mut rest = tensors[0].data.as_slice();
      let mut levels = Vec::with_capacity(self.levels.len());
      for level in 0..self.levels.len() {
        let (head, tail) = rest.split_at(self.level_len(level));
        levels.push(head);
        rest = tail;
      }
      levels
    } else {
      tensors.iter().map(|t| t.data.as_slice()).collect()
    }
  }
}

impl Decoder for YoloV5Decoder {
  fn num_classes(&self) -> usize {
    self.num_classes
  }

  fn check_layout(&self, lens: &[usize]) -> Result<(), DecodeShapeError> {
    if lens.len() == 1 {
      let expected = self.expected_len();
      if lens[0] != expected {
        return Err(DecodeShapeError::ElementCount {
          index: 0,
          expected,
          actual: lens[0],
        });
      }
      return Ok(());
    }

    if lens.len() != self.levels.len() {
      return Err(DecodeShapeError::TensorCountOneOf {
        expected: vec![1, self.levels.len()],
        actual: lens.len(),
      });
    }
    for (index, &actual) in lens.iter().enumerate() {
      let expected = self.level_len(index);
      if actual != expected {
        return Err(DecodeShapeError::ElementCount {
          index,
          expected,
          actual,
        });
      }
    }
    Ok(())
  }

  fn decode(&self, output: &RawOutput, floor: f32) -> Result<Vec<Candidate>, DecodeShapeError> {
    self.check_layout(&lens_of(output))?;

    let channels = self.channels();
    let size = self.input_size as f32;
    let mut items = Vec::new();

    for ((stride, anchors), data) in self.levels.iter().zip(self.split_levels(output)) {
      let n = grid_size(self.input_size, *stride);
      let stride = *stride as f32;

      let mut offset = 0usize;
      for &(anchor_w, anchor_h) in anchors {
        for gy in 0..n {
          for gx in 0..n {
            let row = &data[offset..offset + channels];
            offset += channels;

            // 分数不会超过目标置信度，先行过滤
            let objectness = sigmoid(row[4]);
            if objectness.is_nan() || objectness <= floor {
              continue;
            }
            let (class_id, max_logit) = argmax(&row[5..]);
            let score = objectness * sigmoid(max_logit);
            if score.is_nan() || score <= floor {
              continue;
            }

            let cx = (sigmoid(row[0]) * 2.0 - 0.5 + gx as f32) * stride;
            let cy = (sigmoid(row[1]) * 2.0 - 0.5 + gy as f32) * stride;
            let w = (sigmoid(row[2]) * 2.0).powi(2) * anchor_w;
            let h = (sigmoid(row[3]) * 2.0).powi(2) * anchor_h;

            let x1 = (cx - w / 2.0).clamp(0.0, size);
            let y1 = (cy - h / 2.0).clamp(0.0, size);
            let x2 = (cx + w / 2.0).clamp(0.0, size);
            let y2 = (cy + h / 2.0).clamp(0.0, size);

            items.push(Candidate {
              bbox: BoundingBox::from_corners(x1, y1, x2, y2),
              label: class_id as u32,
              score,
            });
          }
        }
      }
    }

    debug!("YOLOv5 解码得到 {} 个候选框", items.len());
    Ok(items)
  }
}
