// 该文件是 Tanjing （探镜） 项目的一部分。
// src/engine.rs - 推理引擎绑定
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

use thiserror::Error;

use crate::frame::{InputTensor, TensorLayout};

#[cfg(feature = "backend-tract")]
mod tract;
#[cfg(feature = "backend-tract")]
pub use self::tract::TractEngine;

#[cfg(feature = "backend-rknpu")]
mod rknpu;
#[cfg(feature = "backend-rknpu")]
pub use self::rknpu::RknpuEngine;

#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型加载错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型数据无效: {0}")]
  Malformed(String),
  #[error("模型不兼容: {0}")]
  Incompatible(String),
  #[error("模型路径错误: {0}")]
  ModelPath(String),
  #[error("未知的模型类型: {0}")]
  UnknownFamily(String),
  #[error("推理后端未启用: {0}")]
  BackendUnavailable(String),
  #[error("检测器配置错误: {0}")]
  Config(String),
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("输入张量形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("推理引擎错误: {0}")]
  Engine(String),
  #[error("推理引擎锁已失效")]
  Poisoned,
}

/// 模型加载后确定的输入输出描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
  pub input_size: u32,
  pub input_layout: TensorLayout,
  pub output_shapes: Vec<Vec<usize>>,
}

impl ModelInfo {
  pub fn input_shape(&self) -> Vec<usize> {
    let s = self.input_size as usize;
    match self.input_layout {
      TensorLayout::Nchw => vec![1, 3, s, s],
      TensorLayout::Nhwc => vec![1, s, s, 3],
    }
  }

  /// 张量形状与模型声明不一致时报错
  pub fn check_input(&self, tensor: &InputTensor) -> Result<(), InferenceError> {
    let expected = self.input_shape();
    let actual = tensor.shape().to_vec();
    let len: usize = expected.iter().product();
    if expected != actual || tensor.as_slice().len() != len {
      return Err(InferenceError::ShapeMismatch { expected, actual });
    }
    Ok(())
  }
}

/// 浮点后端的输入归一化：`(v - mean) / std`，按张量通道顺序给出
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
  pub mean: [f32; 3],
  pub std: [f32; 3],
}

impl Normalization {
  pub const UNIT: Normalization = Normalization {
    mean: [0.0; 3],
    std: [255.0; 3],
  };

  pub fn apply(&self, channel: usize, value: u8) -> f32 {
    (value as f32 - self.mean[channel]) / self.std[channel]
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl OutputTensor {
  pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
    Self { shape, data }
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

/// 一次推理的全部输出张量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOutput {
  tensors: Vec<OutputTensor>,
}

impl RawOutput {
  pub fn new(tensors: Vec<OutputTensor>) -> Self {
    Self { tensors }
  }

  pub fn len(&self) -> usize {
    self.tensors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tensors.is_empty()
  }

  pub fn get(&self, idx: usize) -> Option<&OutputTensor> {
    self.tensors.get(idx)
  }

  pub fn tensors(&self) -> &[OutputTensor] {
    &self.tensors
  }
}

/// 持有已加载网络的推理引擎
///
/// `run` 需要 `&mut self`：并不是所有后端都支持在同一张图上并发推理，
/// 调用方通过 [`crate::model::Model`] 内部的互斥锁串行化调用。
pub trait InferenceEngine: Send {
  fn name(&self) -> &'static str;
  fn info(&self) -> &ModelInfo;
  fn run(&mut self, tensor: &InputTensor) -> Result<RawOutput, InferenceError>;
}

/// 可选的推理后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
  Tract,
  Rknpu,
}

impl Default for Backend {
  fn default() -> Self {
    if cfg!(feature = "backend-tract") || !cfg!(feature = "backend-rknpu") {
      Backend::Tract
    } else {
      Backend::Rknpu
    }
  }
}

impl Backend {
  pub fn name(&self) -> &'static str {
    match self {
      Backend::Tract => "tract",
      Backend::Rknpu => "rknpu",
    }
  }
}

impl std::str::FromStr for Backend {
  type Err = ModelLoadError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tract" => Ok(Backend::Tract),
      "rknpu" => Ok(Backend::Rknpu),
      other => Err(ModelLoadError::BackendUnavailable(other.to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{ChannelOrder, Frame, FrameAdapter, PixelFormat};

  fn tensor(size: u32, layout: TensorLayout) -> InputTensor {
    let data = vec![0u8; 16];
    let frame = Frame::new(&data, 2, 2, PixelFormat::Bgra8).unwrap();
    FrameAdapter::new(size, layout, ChannelOrder::Rgb)
      .prepare(&frame)
      .unwrap()
  }

  #[test]
  fn check_input_accepts_declared_shape() {
    let info = ModelInfo {
      input_size: 4,
      input_layout: TensorLayout::Nchw,
      output_shapes: vec![],
    };
    assert!(info.check_input(&tensor(4, TensorLayout::Nchw)).is_ok());
  }

  #[test]
  fn check_input_rejects_size_and_layout() {
    let info = ModelInfo {
      input_size: 4,
      input_layout: TensorLayout::Nchw,
      output_shapes: vec![],
    };
    assert!(matches!(
      info.check_input(&tensor(8, TensorLayout::Nchw)),
      Err(InferenceError::ShapeMismatch { .. })
    ));
    assert!(matches!(
      info.check_input(&tensor(4, TensorLayout::Nhwc)),
      Err(InferenceError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn backend_parses_names() {
    assert_eq!("tract".parse::<Backend>().unwrap(), Backend::Tract);
    assert_eq!("rknpu".parse::<Backend>().unwrap(), Backend::Rknpu);
    assert!("coreml".parse::<Backend>().is_err());
  }
}
