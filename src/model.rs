// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model.rs - 模型与输出解码
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

use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  engine::{
    Backend, InferenceEngine, InferenceError, ModelInfo, ModelLoadError, Normalization, RawOutput,
  },
  frame::{ChannelOrder, InputTensor},
};

mod labels;
mod nanodet;
mod yolo26;
mod yolov5;

pub use self::labels::{COCO_CLASSES, Labels};
pub use self::nanodet::NanoDetDecoder;
pub use self::yolo26::Yolo26Decoder;
pub use self::yolov5::YoloV5Decoder;

pub trait Infer {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeShapeError {
  #[error("输出张量数量不匹配: 期望 {expected}, 实际 {actual}")]
  TensorCount { expected: usize, actual: usize },
  #[error("输出张量数量不匹配: 期望 {expected:?} 之一, 实际 {actual}")]
  TensorCountOneOf { expected: Vec<usize>, actual: usize },
  #[error("输出张量 {index} 元素数量不匹配: 期望 {expected}, 实际 {actual}")]
  ElementCount {
    index: usize,
    expected: usize,
    actual: usize,
  },
}

/// 边界框，左上角加宽高
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
}

impl BoundingBox {
  pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
    Self { x, y, w, h }
  }

  pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self {
      x: x1,
      y: y1,
      w: (x2 - x1).max(0.0),
      h: (y2 - y1).max(0.0),
    }
  }

  pub fn x2(&self) -> f32 {
    self.x + self.w
  }

  pub fn y2(&self) -> f32 {
    self.y + self.h
  }

  pub fn area(&self) -> f32 {
    self.w.max(0.0) * self.h.max(0.0)
  }

  /// 交并比，并集为零时返回 0
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let x1 = self.x.max(other.x);
    let y1 = self.y.max(other.y);
    let x2 = self.x2().min(other.x2());
    let y2 = self.y2().min(other.y2());

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

/// 解码得到、尚未抑制的候选框，坐标位于模型输入像素空间
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub bbox: BoundingBox,
  pub label: u32,
  pub score: f32,
}

/// 输出头解码策略
pub trait Decoder: Send + Sync + std::fmt::Debug {
  fn num_classes(&self) -> usize;

  /// 按各输出张量的元素数量检查布局
  fn check_layout(&self, lens: &[usize]) -> Result<(), DecodeShapeError>;

  /// 丢弃 `score <= floor` 的候选框
  fn decode(&self, output: &RawOutput, floor: f32) -> Result<Vec<Candidate>, DecodeShapeError>;
}

pub(crate) fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 返回最大值及其下标，相同取首个
pub(crate) fn argmax(values: &[f32]) -> (usize, f32) {
  let mut best = (0usize, f32::MIN);
  for (idx, &v) in values.iter().enumerate() {
    if v > best.1 {
      best = (idx, v);
    }
  }
  best
}

pub(crate) fn lens_of(output: &RawOutput) -> Vec<usize> {
  output.tensors().iter().map(|t| t.len()).collect()
}

/// 特征图边长
pub(crate) fn grid_size(input_size: u32, stride: u32) -> usize {
  input_size.div_ceil(stride) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
  /// NanoDet-Plus：无锚框，分布回归
  NanoDetPlus,
  /// YOLO26：无锚框，按检测头拆分输出
  Yolo26,
  /// YOLOv5：基于锚框
  YoloV5,
}

impl ModelFamily {
  pub fn scheme(&self) -> &'static str {
    match self {
      ModelFamily::NanoDetPlus => "nanodet",
      ModelFamily::Yolo26 => "yolo26",
      ModelFamily::YoloV5 => "yolov5",
    }
  }

  pub fn from_scheme(scheme: &str) -> Result<Self, ModelLoadError> {
    match scheme {
      "nanodet" => Ok(ModelFamily::NanoDetPlus),
      "yolo26" => Ok(ModelFamily::Yolo26),
      "yolov5" => Ok(ModelFamily::YoloV5),
      other => Err(ModelLoadError::UnknownFamily(other.to_string())),
    }
  }

  pub fn default_input_size(&self) -> u32 {
    match self {
      ModelFamily::NanoDetPlus => 416,
      ModelFamily::Yolo26 | ModelFamily::YoloV5 => 640,
    }
  }

  pub fn channel_order(&self) -> ChannelOrder {
    match self {
      ModelFamily::NanoDetPlus => ChannelOrder::Bgr,
      ModelFamily::Yolo26 | ModelFamily::YoloV5 => ChannelOrder::Rgb,
    }
  }

  pub fn normalization(&self) -> Normalization {
    match self {
      ModelFamily::NanoDetPlus => Normalization {
        mean: [103.53, 116.28, 123.675],
        std: [57.375, 57.12, 58.395],
      },
      ModelFamily::Yolo26 | ModelFamily::YoloV5 => Normalization::UNIT,
    }
  }

  pub fn decoder(&self, input_size: u32, num_classes: usize) -> Box<dyn Decoder> {
    match self {
      ModelFamily::NanoDetPlus => Box::new(NanoDetDecoder::new(input_size, num_classes)),
      ModelFamily::Yolo26 => Box::new(Yolo26Decoder::new(input_size, num_classes)),
      ModelFamily::YoloV5 => Box::new(YoloV5Decoder::new(input_size, num_classes)),
    }
  }
}

impl std::fmt::Display for ModelFamily {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.scheme())
  }
}

/// 已加载的模型：推理引擎加上按模型类型选定的解码策略
///
/// 加载后不可变。引擎放在互斥锁里，多个线程共享同一模型时推理串行执行，
/// 前后处理不受影响。
pub struct Model {
  name: String,
  family: ModelFamily,
  info: ModelInfo,
  labels: Labels,
  decoder: Box<dyn Decoder>,
  engine: Mutex<Box<dyn InferenceEngine>>,
}

impl std::fmt::Debug for Model {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Model")
      .field("name", &self.name)
      .field("family", &self.family)
      .field("info", &self.info)
      .field("decoder", &self.decoder)
      .finish()
  }
}

impl Model {
  pub fn load(
    name: &str,
    family: ModelFamily,
    labels: Labels,
    model_data: &[u8],
    input_size: u32,
    backend: Backend,
  ) -> Result<Self, ModelLoadError> {
    info!("加载模型 {} ({}, 后端 {:?})", name, family, backend);
    if model_data.is_empty() {
      return Err(ModelLoadError::Malformed("模型数据为空".to_string()));
    }

    let engine = match backend {
      Backend::Tract => load_tract(model_data, input_size, family)?,
      Backend::Rknpu => load_rknpu(model_data, input_size)?,
    };
    Self::from_engine(name, family, labels, engine)
  }

  /// 使用调用方提供的推理引擎
  pub fn from_engine(
    name: impl Into<String>,
    family: ModelFamily,
    labels: Labels,
    engine: Box<dyn InferenceEngine>,
  ) -> Result<Self, ModelLoadError> {
    let info = engine.info().clone();
    if info.input_size == 0 {
      return Err(ModelLoadError::Incompatible("模型输入尺寸为 0".to_string()));
    }
    if labels.is_empty() {
      return Err(ModelLoadError::Incompatible("标签列表为空".to_string()));
    }

    let decoder = family.decoder(info.input_size, labels.len());
    if !info.output_shapes.is_empty() {
      let lens: Vec<usize> = info
        .output_shapes
        .iter()
        .map(|shape| shape.iter().product())
        .collect();
      decoder
        .check_layout(&lens)
        .map_err(|e| ModelLoadError::Incompatible(e.to_string()))?;
    }

    debug!(
      "模型 {} 使用 {} 后端, 输入 {}, 输出 {:?}",
      family,
      engine.name(),
      info.input_size,
      info.output_shapes
    );

    Ok(Self {
      name: name.into(),
      family,
      info,
      labels,
      decoder,
      engine: Mutex::new(engine),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn family(&self) -> ModelFamily {
    self.family
  }

  pub fn info(&self) -> &ModelInfo {
    &self.info
  }

  pub fn input_size(&self) -> u32 {
    self.info.input_size
  }

  pub fn labels(&self) -> &Labels {
    &self.labels
  }

  pub fn run(&self, tensor: &InputTensor) -> Result<RawOutput, InferenceError> {
    let mut engine = self.engine.lock().map_err(|_| InferenceError::Poisoned)?;
    engine.run(tensor)
  }

  pub fn decode(&self, output: &RawOutput, floor: f32) -> Result<Vec<Candidate>, DecodeShapeError> {
    self.decoder.decode(output, floor)
  }
}

#[cfg(feature = "backend-tract")]
fn load_tract(
  model_data: &[u8],
  input_size: u32,
  family: ModelFamily,
) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
  let engine = crate::engine::TractEngine::load(model_data, input_size, family.normalization())?;
  Ok(Box::new(engine))
}

#[cfg(not(feature = "backend-tract"))]
fn load_tract(
  _model_data: &[u8],
  _input_size: u32,
  _family: ModelFamily,
) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
  Err(ModelLoadError::BackendUnavailable("tract".to_string()))
}

#[cfg(feature = "backend-rknpu")]
fn load_rknpu(
  model_data: &[u8],
  input_size: u32,
) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
  let engine = crate::engine::RknpuEngine::load(model_data, input_size)?;
  Ok(Box::new(engine))
}

#[cfg(not(feature = "backend-rknpu"))]
fn load_rknpu(
  _model_data: &[u8],
  _input_size: u32,
) -> Result<Box<dyn InferenceEngine>, ModelLoadError> {
  Err(ModelLoadError::BackendUnavailable("rknpu".to_string()))
}
