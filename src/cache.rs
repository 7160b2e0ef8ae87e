// 该文件是 Tanjing （探镜） 项目的一部分。
// src/cache.rs - 模型缓存
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
  collections::HashMap,
  sync::{Arc, Mutex, PoisonError, Weak},
};

use tracing::debug;

use crate::{engine::ModelLoadError, model::Model};

/// 在多个检测器之间共享已加载的模型
///
/// 缓存只持有弱引用：最后一个使用某模型的检测器释放后，模型随之释放，
/// 下次请求时重新加载。由调用方创建并注入，不存在进程级的全局缓存。
#[derive(Debug, Default)]
pub struct ModelCache {
  entries: Mutex<HashMap<String, Weak<Model>>>,
}

impl ModelCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// 命中时返回已有模型，否则调用 `load` 并记录结果
  ///
  /// 加载过程持有缓存锁，同一个键不会被并发加载两次。
  pub fn get_or_load<F>(&self, key: &str, load: F) -> Result<Arc<Model>, ModelLoadError>
  where
    F: FnOnce() -> Result<Model, ModelLoadError>,
  {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(model) = entries.get(key).and_then(Weak::upgrade) {
      debug!("模型缓存命中: {}", key);
      return Ok(model);
    }

    debug!("模型缓存未命中: {}", key);
    let model = Arc::new(load()?);
    entries.insert(key.to_string(), Arc::downgrade(&model));
    entries.retain(|_, weak| weak.strong_count() > 0);
    Ok(model)
  }

  /// 仍然存活的模型数量
  pub fn len(&self) -> usize {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .filter(|weak| weak.strong_count() > 0)
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    engine::{InferenceEngine, InferenceError, ModelInfo, RawOutput},
    frame::{InputTensor, TensorLayout},
    model::{Labels, ModelFamily},
  };

  struct NullEngine(ModelInfo);

  impl InferenceEngine for NullEngine {
    fn name(&self) -> &'static str {
      "null"
    }

    fn info(&self) -> &ModelInfo {
      &self.0
    }

    fn run(&mut self, _tensor: &InputTensor) -> Result<RawOutput, InferenceError> {
      Ok(RawOutput::default())
    }
  }

  fn load() -> Result<Model, ModelLoadError> {
    let info = ModelInfo {
      input_size: 32,
      input_layout: TensorLayout::Nchw,
      output_shapes: vec![],
    };
    Model::from_engine("null", ModelFamily::YoloV5, Labels::coco(), Box::new(NullEngine(info)))
  }

  #[test]
  fn hit_returns_same_model() {
    let cache = ModelCache::new();
    let a = cache.get_or_load("yolov5:null", load).unwrap();
    let b = cache
      .get_or_load("yolov5:null", || panic!("不应重新加载"))
      .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn dropped_model_is_reloaded() {
    let cache = ModelCache::new();
    let a = cache.get_or_load("k", load).unwrap();
    drop(a);
    assert!(cache.is_empty());

    let mut loaded = false;
    let _b = cache
      .get_or_load("k", || {
        loaded = true;
        load()
      })
      .unwrap();
    assert!(loaded);
  }

  #[test]
  fn failed_load_is_not_cached() {
    let cache = ModelCache::new();
    let result = cache.get_or_load("k", || Err(ModelLoadError::Malformed("坏数据".to_string())));
    assert!(result.is_err());
    assert!(cache.is_empty());
    assert!(cache.get_or_load("k", load).is_ok());
  }
}
