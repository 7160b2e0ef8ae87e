// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model/nanodet.rs - NanoDet-Plus 输出解码
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
  model::{BoundingBox, Candidate, DecodeShapeError, Decoder, argmax, grid_size, lens_of},
};

const NANODET_STRIDES: [u32; 4] = [8, 16, 32, 64];
const NANODET_REG_MAX: usize = 7;

/// NanoDet-Plus 检测头
///
/// 单个输出 `[points, classes + 4 * (reg_max + 1)]`，各点先按步长、
/// 再按行优先排列。类别分数已经过 sigmoid；每条边的距离是
/// `reg_max + 1` 个分箱上 softmax 分布的期望。
#[derive(Debug, Clone)]
pub struct NanoDetDecoder {
  input_size: u32,
  num_classes: usize,
  reg_max: usize,
  strides: Vec<u32>,
}

impl NanoDetDecoder {
  pub fn new(input_size: u32, num_classes: usize) -> Self {
    Self {
      input_size,
      num_classes,
      reg_max: NANODET_REG_MAX,
      strides: NANODET_STRIDES.to_vec(),
    }
  }

  pub fn with_strides(mut self, strides: &[u32]) -> Self {
    self.strides = strides.to_vec();
    self
  }

  pub fn with_reg_max(mut self, reg_max: usize) -> Self {
    self.reg_max = reg_max;
    self
  }

  pub fn num_points(&self) -> usize {
    self
      .strides
      .iter()
      .map(|&s| grid_size(self.input_size, s).pow(2))
      .sum()
  }

  pub fn channels(&self) -> usize {
    self.num_classes + 4 * (self.reg_max + 1)
  }

  pub fn expected_len(&self) -> usize {
    self.num_points() * self.channels()
  }
}

/// 分布回归的期望值
fn integral(bins: &[f32]) -> f32 {
  let max = bins.iter().copied().fold(f32::MIN, f32::max);
  let mut sum = 0.0f32;
  let mut weighted = 0.0f32;
  for (i, &v) in bins.iter().enumerate() {
    let e = (v - max).exp();
    sum += e;
    weighted += e * i as f32;
  }
  if sum > 0.0 { weighted / sum } else { 0.0 }
}

impl Decoder for NanoDetDecoder {
  fn num_classes(&self) -> usize {
    self.num_classes
  }

  fn check_layout(&self, lens: &[usize]) -> Result<(), DecodeShapeError> {
    if lens.len() != 1 {
      return Err(DecodeShapeError::TensorCount {
        expected: 1,
        actual: lens.len(),
      });
    }
    let expected = self.expected_len();
    if lens[0] != expected {
      return Err(DecodeShapeError::ElementCount {
        index: 0,
        expected,
        actual: lens[0],
      });
    }
    Ok(())
  }

  fn decode(&self, output: &RawOutput, floor: f32) -> Result<Vec<Candidate>, DecodeShapeError> {
    self.check_layout(&lens_of(output))?;
    let data = &output.tensors()[0].data;

    let channels = self.channels();
    let bins = self.reg_max + 1;
    let size = self.input_size as f32;
    let mut items = Vec::new();
    let mut point = 0usize;

    for &stride in &self.strides {
      let n = grid_size(self.input_size, stride);
      let stride = stride as f32;
      for y in 0..n {
        for x in 0..n {
          let row = &data[point * channels..(point + 1) * channels];
          point += 1;

          let (scores, reg) = row.split_at(self.num_classes);
          let (label, score) = argmax(scores);
          if score.is_nan() || score <= floor {
            continue;
          }

          let mut dist = [0.0f32; 4];
          for (side, d) in dist.iter_mut().enumerate() {
            *d = integral(&reg[side * bins..(side + 1) * bins]) * stride;
          }

          let cx = x as f32 * stride;
          let cy = y as f32 * stride;
          let x1 = (cx - dist[0]).max(0.0);
          let y1 = (cy - dist[1]).max(0.0);
          let x2 = (cx + dist[2]).min(size);
          let y2 = (cy + dist[3]).min(size);

          items.push(Candidate {
            bbox: BoundingBox::from_corners(x1, y1, x2, y2),
            label: label as u32,
            score: score.min(1.0),
          });
        }
      }
    }

    debug!("NanoDet 解码得到 {} 个候选框", items.len());
    Ok(items)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::OutputTensor;

  // 32x32 输入、步长 16/32：4 + 1 个点
  fn decoder() -> NanoDetDecoder {
    NanoDetDecoder::new(32, 2)
      .with_strides(&[16, 32])
      .with_reg_max(1)
  }

  fn output(points: &[[f32; 10]]) -> RawOutput {
    let data = points.iter().flatten().copied().collect::<Vec<_>>();
    RawOutput::new(vec![OutputTensor::new(vec![1, points.len(), 10], data)])
  }

  #[test]
  fn layout_counts_points_over_strides() {
    let d = decoder();
    assert_eq!(d.num_points(), 5);
    assert_eq!(d.channels(), 10);
    assert_eq!(d.expected_len(), 50);
    assert!(d.check_layout(&[50]).is_ok());
  }

  #[test]
  fn default_nanodet_416_layout() {
    let d = NanoDetDecoder::new(416, 80);
    // 52² + 26² + 13² + 7²
    assert_eq!(d.num_points(), 3598);
    assert_eq!(d.channels(), 112);
  }

  #[test]
  fn integral_of_uniform_bins_is_midpoint() {
    assert!((integral(&[0.0, 0.0]) - 0.5).abs() < 1e-6);
    assert!((integral(&[0.0, 0.0, 0.0]) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn decodes_confident_point_only() {
    let mut points = [[0.0f32; 10]; 5];
    // 第 4 个点：步长 16 下的 (1, 1)，类别 1
    // 每边两个分箱，分布集中在第 1 箱，距离 = 1 * 16
    points[3] = [0.1, 0.8, -20.0, 20.0, -20.0, 20.0, -20.0, 20.0, -20.0, 20.0];

    let items = decoder().decode(&output(&points), 0.25).unwrap();
    assert_eq!(items.len(), 1);
    let c = items[0];
    assert_eq!(c.label, 1);
    assert!((c.score - 0.8).abs() < 1e-6);
    assert!((c.bbox.x - 0.0).abs() < 1e-3);
    assert!((c.bbox.y - 0.0).abs() < 1e-3);
    assert!((c.bbox.w - 32.0).abs() < 1e-3);
    assert!((c.bbox.h - 32.0).abs() < 1e-3);
  }

  #[test]
  fn floor_is_exclusive() {
    let mut points = [[0.0f32; 10]; 5];
    points[0][0] = 0.25;
    let items = decoder().decode(&output(&points), 0.25).unwrap();
    assert!(items.is_empty());
  }

  #[test]
  fn wrong_element_count_is_a_shape_error() {
    let raw = RawOutput::new(vec![OutputTensor::new(vec![49], vec![0.0; 49])]);
    assert_eq!(
      decoder().decode(&raw, 0.25).unwrap_err(),
      DecodeShapeError::ElementCount {
        index: 0,
        expected: 50,
        actual: 49
      }
    );
  }

  #[test]
  fn extra_tensor_is_a_shape_error() {
    let t = OutputTensor::new(vec![50], vec![0.0; 50]);
    let raw = RawOutput::new(vec![t.clone(), t]);
    assert!(matches!(
      decoder().decode(&raw, 0.25),
      Err(DecodeShapeError::TensorCount { expected: 1, actual: 2 })
    ));
  }
}
