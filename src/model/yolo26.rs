// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model/yolo26.rs - YOLO26 输出解码
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

use tracing::{debug, error};

use crate::{
  engine::RawOutput,
  model::{
    BoundingBox, Candidate, DecodeShapeError, Decoder, argmax, grid_size, lens_of, sigmoid,
  },
};

const YOLO26_STRIDES: [u32; 3] = [8, 16, 32];

/// YOLO26 检测头：每个步长两个输出，回归 `4×H×W` 与分类 `C×H×W`，
/// 两者顺序不固定。
#[derive(Debug, Clone)]
pub struct Yolo26Decoder {
  input_size: u32,
  num_classes: usize,
}

impl Yolo26Decoder {
  pub fn new(input_size: u32, num_classes: usize) -> Self {
    Self {
      input_size,
      num_classes,
    }
  }

  fn head_sizes(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
    YOLO26_STRIDES
      .iter()
      .map(|&s| (grid_size(self.input_size, s), s as f32))
  }
}

/// 根据张量大小匹配回归和分类输出
/// 返回 (回归下标, 分类下标)
fn match_reg_cls(
  lens: &[usize],
  head_idx: usize,
  reg_expected: usize,
  cls_expected: usize,
) -> Result<(usize, usize), DecodeShapeError> {
  let idx1 = head_idx * 2;
  let idx2 = idx1 + 1;
  let (len1, len2) = (lens[idx1], lens[idx2]);

  if len1 == reg_expected && len2 == cls_expected {
    Ok((idx1, idx2))
  } else if len1 == cls_expected && len2 == reg_expected {
    debug!(
      "检测头 {}: 输出顺序交换 - 索引 {} 是分类，索引 {} 是回归",
      head_idx, idx1, idx2
    );
    Ok((idx2, idx1))
  } else {
    error!(
      "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 期望回归: {}, 期望分类: {}",
      head_idx, len1, len2, reg_expected, cls_expected
    );
    let (index, actual) = if len1 != reg_expected && len1 != cls_expected {
      (idx1, len1)
    } else {
      (idx2, len2)
    };
    Err(DecodeShapeError::ElementCount {
      index,
      expected: if index == idx1 { reg_expected } else { cls_expected },
      actual,
    })
  }
}

impl Decoder for Yolo26Decoder {
  fn num_classes(&self) -> usize {
    self.num_classes
  }

  fn check_layout(&self, lens: &[usize]) -> Result<(), DecodeShapeError> {
    let expected = YOLO26_STRIDES.len() * 2;
    if lens.len() != expected {
      return Err(DecodeShapeError::TensorCount {
        expected,
        actual: lens.len(),
      });
    }
    for (head_idx, (map, _)) in self.head_sizes().enumerate() {
      let spatial = map * map;
      match_reg_cls(lens, head_idx, 4 * spatial, self.num_classes * spatial)?;
    }
    Ok(())
  }

  fn decode(&self, output: &RawOutput, floor: f32) -> Result<Vec<Candidate>, DecodeShapeError> {
    let lens = lens_of(output);
    self.check_layout(&lens)?;

    let size = self.input_size as f32;
    let mut items = Vec::new();

    for (head_idx, (map, stride)) in self.head_sizes().enumerate() {
      let spatial = map * map;
      let (reg_idx, cls_idx) =
        match_reg_cls(&lens, head_idx, 4 * spatial, self.num_classes * spatial)?;
      let reg = &output.tensors()[reg_idx].data;
      let cls = &output.tensors()[cls_idx].data;

      let mut logits = vec![0.0f32; self.num_classes];
      for h in 0..map {
        for w in 0..map {
          let idx = h * map + w;

          for (c, logit) in logits.iter_mut().enumerate() {
            *logit = cls[c * spatial + idx];
          }
          let (class_id, max_logit) = argmax(&logits);
          let score = sigmoid(max_logit);
          if score.is_nan() || score <= floor {
            continue;
          }

          let l = reg[idx];
          let t = reg[spatial + idx];
          let r = reg[2 * spatial + idx];
          let b = reg[3 * spatial + idx];

          let grid_x = (w as f32) + 0.5;
          let grid_y = (h as f32) + 0.5;

          let xmin = ((grid_x - l) * stride).clamp(0.0, size);
          let ymin = ((grid_y - t) * stride).clamp(0.0, size);
          let xmax = ((grid_x + r) * stride).clamp(0.0, size);
          let ymax = ((grid_y + b) * stride).clamp(0.0, size);

          items.push(Candidate {
            bbox: BoundingBox::from_corners(xmin, ymin, xmax, ymax),
            label: class_id as u32,
            score,
          });
        }
      }
    }

    debug!("YOLO26 解码得到 {} 个候选框", items.len());
    Ok(items)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::OutputTensor;

  // 64x64 输入：8x8、4x4、2x2 三个检测头
  const SIZE: u32 = 64;
  const CLASSES: usize = 2;

  fn zeros(swap_first_head: bool) -> Vec<OutputTensor> {
    let mut tensors = Vec::new();
    for (head, map) in [8usize, 4, 2].into_iter().enumerate() {
      let spatial = map * map;
      let reg = OutputTensor::new(vec![1, 4, map, map], vec![0.0; 4 * spatial]);
      let cls = OutputTensor::new(
        vec![1, CLASSES, map, map],
        vec![-10.0; CLASSES * spatial],
      );
      if head == 0 && swap_first_head {
        tensors.push(cls);
        tensors.push(reg);
      } else {
        tensors.push(reg);
        tensors.push(cls);
      }
    }
    tensors
  }

  #[test]
  fn decodes_cell_relative_distances() {
    let mut tensors = zeros(false);
    // 步长 16 的检测头，格子 (1, 2)
    let (spatial, idx) = (16usize, 2 * 4 + 1);
    let reg = &mut tensors[2].data;
    reg[idx] = 0.5;
    reg[spatial + idx] = 0.5;
    reg[2 * spatial + idx] = 1.5;
    reg[3 * spatial + idx] = 0.5;
    tensors[3].data[spatial + idx] = 3.0;

    let items = Yolo26Decoder::new(SIZE, CLASSES)
      .decode(&RawOutput::new(tensors), 0.5)
      .unwrap();
    assert_eq!(items.len(), 1);
    let c = items[0];
    assert_eq!(c.label, 1);
    assert!((c.score - sigmoid(3.0)).abs() < 1e-6);
    // 中心 (1.5, 2.5) * 16
    assert!((c.bbox.x - 16.0).abs() < 1e-4);
    assert!((c.bbox.y - 32.0).abs() < 1e-4);
    assert!((c.bbox.w - 32.0).abs() < 1e-4);
    assert!((c.bbox.h - 16.0).abs() < 1e-4);
  }

  #[test]
  fn accepts_swapped_head_order() {
    let mut tensors = zeros(true);
    tensors[0].data[0] = 5.0; // 交换后第 0 个是分类
    let items = Yolo26Decoder::new(SIZE, CLASSES)
      .decode(&RawOutput::new(tensors), 0.5)
      .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].label, 0);
  }

  #[test]
  fn rejects_wrong_tensor_count() {
    let mut tensors = zeros(false);
    tensors.pop();
    assert!(matches!(
      Yolo26Decoder::new(SIZE, CLASSES).decode(&RawOutput::new(tensors), 0.5),
      Err(DecodeShapeError::TensorCount { expected: 6, actual: 5 })
    ));
  }

  #[test]
  fn rejects_truncated_head() {
    let mut tensors = zeros(false);
    tensors[1].data.pop();
    assert_eq!(
      Yolo26Decoder::new(SIZE, CLASSES)
        .decode(&RawOutput::new(tensors), 0.5)
        .unwrap_err(),
      DecodeShapeError::ElementCount {
        index: 1,
        expected: CLASSES * 64,
        actual: CLASSES * 64 - 1
      }
    );
  }
}
