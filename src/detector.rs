// 该文件是 Tanjing （探镜） 项目的一部分。
// src/detector.rs - 目标检测器
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

use std::{
  path::PathBuf,
  str::FromStr,
  sync::{
    Arc,
    Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
  },
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl,
  cache::ModelCache,
  engine::{Backend, InferenceEngine, InferenceError, ModelLoadError},
  frame::{Frame, FrameAdapter, FrameBuffer, InvalidFrameError},
  model::{DecodeShapeError, Infer, Labels, Model, ModelFamily},
  nms::{DEFAULT_IOU_THRESHOLD, suppress},
  normalize::{DetectResult, Detection, normalize},
};

pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.25;

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("输入帧无效: {0}")]
  InvalidFrame(#[from] InvalidFrameError),
  #[error("推理失败: {0}")]
  Inference(#[from] InferenceError),
  #[error("输出解码失败: {0}")]
  DecodeShape(#[from] DecodeShapeError),
}

/// 检测阈值与后处理参数
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
  /// 解码阶段的最低置信度，分数不超过该值的候选框被丢弃
  pub confidence_floor: f32,
  /// NMS 的 IoU 阈值
  pub iou_threshold: f32,
  /// 为真时不同类别之间也互相抑制
  pub class_agnostic: bool,
  /// NMS 之后最多保留的数量
  pub max_detections: Option<usize>,
  /// letterbox 填充值
  pub fill: u8,
  /// `try_detect` 两次开始之间的最短间隔
  pub min_interval: Option<Duration>,
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      class_agnostic: false,
      max_detections: None,
      fill: 0,
      min_interval: None,
    }
  }
}

impl DetectorConfig {
  pub fn validate(&self) -> Result<(), ModelLoadError> {
    if !(0.0..=1.0).contains(&self.confidence_floor) {
      return Err(ModelLoadError::Config(format!(
        "置信度下限必须在 [0, 1] 内, 实际为 {}",
        self.confidence_floor
      )));
    }
    if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
      return Err(ModelLoadError::Config(format!(
        "IoU 阈值必须在 (0, 1] 内, 实际为 {}",
        self.iou_threshold
      )));
    }
    Ok(())
  }
}

enum ModelSource {
  Path(PathBuf),
  Bytes {
    name: String,
    data: Vec<u8>,
  },
  Engine {
    name: String,
    engine: Box<dyn InferenceEngine>,
  },
}

impl ModelSource {
  fn name(&self) -> String {
    match self {
      ModelSource::Path(path) => path.display().to_string(),
      ModelSource::Bytes { name, .. } | ModelSource::Engine { name, .. } => name.clone(),
    }
  }
}

pub struct DetectorBuilder {
  family: ModelFamily,
  source: ModelSource,
  input_size: Option<u32>,
  backend: Backend,
  labels: Labels,
  labels_path: Option<PathBuf>,
  config: DetectorConfig,
  cache: Option<Arc<ModelCache>>,
  warmup: bool,
}

impl FromUrl for DetectorBuilder {
  type Error = ModelLoadError;

  /// `nanodet:///models/nanodet-plus-m_416.onnx?confidence=0.3&iou=0.5`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let family = ModelFamily::from_scheme(url.scheme())?;
    let path = urlencoding::decode(url.path())
      .map_err(|e| ModelLoadError::ModelPath(format!("{}: {}", url.path(), e)))?;
    if path.is_empty() {
      return Err(ModelLoadError::ModelPath("模型路径为空".to_string()));
    }

    let mut builder = DetectorBuilder::new(family, path.into_owned());
    for (key, value) in url.query_pairs() {
      match &*key {
        "size" => builder.input_size = Some(parse_param(&key, &value)?),
        "confidence" => builder.config.confidence_floor = parse_param(&key, &value)?,
        "iou" => builder.config.iou_threshold = parse_param(&key, &value)?,
        "agnostic" => builder.config.class_agnostic = parse_flag(&key, &value)?,
        "max" => builder.config.max_detections = Some(parse_param(&key, &value)?),
        "fill" => builder.config.fill = parse_param(&key, &value)?,
        "interval" => {
          builder.config.min_interval = Some(Duration::from_millis(parse_param(&key, &value)?))
        }
        "backend" => builder.backend = value.parse()?,
        "labels" => builder.labels_path = Some(PathBuf::from(value.into_owned())),
        "warmup" => builder.warmup = parse_flag(&key, &value)?,
        other => {
          return Err(ModelLoadError::ModelPath(format!("未知的模型参数: {}", other)));
        }
      }
    }

    Ok(builder)
  }
}

fn parse_param<T: FromStr>(key: &str, value: &str) -> Result<T, ModelLoadError> {
  value
    .parse()
    .map_err(|_| ModelLoadError::ModelPath(format!("参数 {} 的值无效: {}", key, value)))
}

/// 只写参数名视为开启
fn parse_flag(key: &str, value: &str) -> Result<bool, ModelLoadError> {
  if value.is_empty() {
    Ok(true)
  } else {
    parse_param(key, value)
  }
}

impl DetectorBuilder {
  pub fn new(family: ModelFamily, model_path: impl Into<PathBuf>) -> Self {
    Self::with_source(family, ModelSource::Path(model_path.into()))
  }

  /// 由调用方直接提供模型数据
  pub fn from_bytes(family: ModelFamily, name: impl Into<String>, data: Vec<u8>) -> Self {
    Self::with_source(
      family,
      ModelSource::Bytes {
        name: name.into(),
        data,
      },
    )
  }

  /// 使用已创建好的推理引擎，输入尺寸以引擎为准
  ///
  /// 配合 [`DetectorBuilder::cache`] 使用时，若缓存中已有相同的模型，
  /// 传入的引擎会被直接丢弃。
  pub fn from_engine(
    family: ModelFamily,
    name: impl Into<String>,
    engine: Box<dyn InferenceEngine>,
  ) -> Self {
    Self::with_source(
      family,
      ModelSource::Engine {
        name: name.into(),
        engine,
      },
    )
  }

  fn with_source(family: ModelFamily, source: ModelSource) -> Self {
    Self {
      family,
      source,
      input_size: None,
      backend: Backend::default(),
      labels: Labels::default(),
      labels_path: None,
      config: DetectorConfig::default(),
      cache: None,
      warmup: false,
    }
  }

  pub fn input_size(mut self, size: u32) -> Self {
    self.input_size = Some(size);
    self
  }

  pub fn backend(mut self, backend: Backend) -> Self {
    self.backend = backend;
    self
  }

  pub fn labels(mut self, labels: Labels) -> Self {
    self.labels = labels;
    self.labels_path = None;
    self
  }

  pub fn config(mut self, config: DetectorConfig) -> Self {
    self.config = config;
    self
  }

  pub fn confidence_floor(mut self, floor: f32) -> Self {
    self.config.confidence_floor = floor;
    self
  }

  pub fn iou_threshold(mut self, threshold: f32) -> Self {
    self.config.iou_threshold = threshold;
    self
  }

  pub fn class_agnostic(mut self, agnostic: bool) -> Self {
    self.config.class_agnostic = agnostic;
    self
  }

  pub fn max_detections(mut self, max: usize) -> Self {
    self.config.max_detections = Some(max);
    self
  }

  pub fn min_interval(mut self, interval: Duration) -> Self {
    self.config.min_interval = Some(interval);
    self
  }

  /// 共享模型缓存
  ///
  /// 缓存键由模型类型、模型名、输入尺寸、推理后端和类别列表共同决定，
  /// 任一项不同都会加载新的模型。命中时不会再读取模型数据或使用传入的引擎。
  pub fn cache(mut self, cache: Arc<ModelCache>) -> Self {
    self.cache = Some(cache);
    self
  }

  /// 构建时先用全黑帧跑一次检测，避免首帧延迟
  pub fn warmup(mut self, warmup: bool) -> Self {
    self.warmup = warmup;
    self
  }

  pub fn build(self) -> Result<Detector, ModelLoadError> {
    self.config.validate()?;

    let labels = match &self.labels_path {
      Some(path) => Labels::from_file(path)?,
      None => self.labels,
    };
    let family = self.family;
    let backend = self.backend;
    let input_size = self
      .input_size
      .unwrap_or_else(|| family.default_input_size());
    let name = self.source.name();
    let (key_size, key_backend) = match &self.source {
      ModelSource::Engine { engine, .. } => (engine.info().input_size, engine.name()),
      _ => (input_size, backend.name()),
    };
    let key = format!(
      "{}:{}@{}:{}:{:016x}",
      family,
      name,
      key_size,
      key_backend,
      labels.fingerprint()
    );
    let source = self.source;

    let load = move || -> Result<Model, ModelLoadError> {
      match source {
        ModelSource::Path(path) => {
          info!("加载模型文件: {}", path.display());
          let data = std::fs::read(&path)?;
          Model::load(&name, family, labels, &data, input_size, backend)
        }
        ModelSource::Bytes { name, data } => {
          Model::load(&name, family, labels, &data, input_size, backend)
        }
        ModelSource::Engine { name, engine } => Model::from_engine(name, family, labels, engine),
      }
    };

    let model = match &self.cache {
      Some(cache) => cache.get_or_load(&key, load)?,
      None => Arc::new(load()?),
    };

    let detector = Detector::new(model, self.config);
    if self.warmup {
      detector
        .warmup()
        .map_err(|e| ModelLoadError::Incompatible(format!("模型预热失败: {}", e)))?;
    }
    info!(
      "检测器就绪: {} ({}), 输入尺寸 {}",
      detector.model.name(),
      family,
      detector.input_size()
    );
    Ok(detector)
  }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// 完整的检测流水线：预处理、推理、解码、抑制、归一化
///
/// 所有阶段都在调用线程上同步完成。多个线程可以共享同一个检测器，
/// 只有推理这一步在模型内部串行。
pub struct Detector {
  model: Arc<Model>,
  adapter: FrameAdapter,
  config: DetectorConfig,
  busy: AtomicBool,
  last_start: Mutex<Option<Instant>>,
}

impl Detector {
  pub fn new(model: Arc<Model>, config: DetectorConfig) -> Self {
    let adapter = FrameAdapter::new(
      model.input_size(),
      model.info().input_layout,
      model.family().channel_order(),
    )
    .with_fill(config.fill);

    Self {
      model,
      adapter,
      config,
      busy: AtomicBool::new(false),
      last_start: Mutex::new(None),
    }
  }

  pub fn input_size(&self) -> u32 {
    self.model.input_size()
  }

  pub fn model(&self) -> &Arc<Model> {
    &self.model
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.config
  }

  pub fn detect(&self, frame: &Frame<'_>) -> Result<Vec<Detection>, DetectError> {
    self
      .infer_frame(frame)
      .map(|result| result.items.into_vec())
  }

  pub fn infer_frame(&self, frame: &Frame<'_>) -> Result<DetectResult, DetectError> {
    let tensor = self.adapter.prepare(frame)?;

    let now = Instant::now();
    let output = self.model.run(&tensor)?;
    debug!("推理耗时: {:.2?}", now.elapsed());

    let candidates = self.model.decode(&output, self.config.confidence_floor)?;
    let mut kept = suppress(
      candidates,
      self.config.iou_threshold,
      self.config.class_agnostic,
    );
    if let Some(max) = self.config.max_detections {
      kept.truncate(max);
    }

    let items = normalize(&kept, self.input_size(), self.model.labels());
    debug!("检测到 {} 个物体", items.len());

    Ok(DetectResult {
      items: items.into_boxed_slice(),
      letterbox: *tensor.letterbox(),
    })
  }

  /// 已有一次 `try_detect` 在进行时直接返回 `None`，丢弃当前帧
  ///
  /// 设置了 `min_interval` 时，距上一次开始不足该间隔的帧同样被丢弃。
  pub fn try_detect(&self, frame: &Frame<'_>) -> Result<Option<DetectResult>, DetectError> {
    if self
      .busy
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      debug!("检测进行中，丢弃当前帧");
      return Ok(None);
    }
    let _guard = BusyGuard(&self.busy);

    if let Some(interval) = self.config.min_interval {
      let mut last = self.last_start.lock().unwrap_or_else(PoisonError::into_inner);
      let now = Instant::now();
      if let Some(prev) = *last {
        if now.duration_since(prev) < interval {
          debug!("距上次检测不足 {:?}，丢弃当前帧", interval);
          return Ok(None);
        }
      }
      *last = Some(now);
    }

    self.infer_frame(frame).map(Some)
  }

  pub fn warmup(&self) -> Result<(), DetectError> {
    let size = self.input_size();
    let blank = FrameBuffer::blank(size, size);
    let now = Instant::now();
    self.infer_frame(&blank.as_frame()?)?;
    info!("模型预热完成，耗时: {:.2?}", now.elapsed());
    Ok(())
  }
}

impl Infer for Detector {
  type Input = FrameBuffer;
  type Output = DetectResult;
  type Error = DetectError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.infer_frame(&input.as_frame()?)
  }
}
