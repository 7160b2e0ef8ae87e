// 该文件是 Tanjing （探镜） 项目的一部分。
// src/engine/tract.rs - 基于 tract 的 ONNX 推理后端
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

use std::io::Cursor;

use tracing::{debug, info};
use tract_onnx::prelude::*;

use crate::{
  engine::{
    InferenceEngine, InferenceError, ModelInfo, ModelLoadError, Normalization, OutputTensor,
    RawOutput,
  },
  frame::{InputTensor, TensorLayout},
};

/// 在 CPU 上运行 ONNX 模型
///
/// 输入固定为 `[1, 3, size, size]` 的 f32 张量，由 `u8` 张量按
/// [`Normalization`] 转换而来。
pub struct TractEngine {
  plan: TypedRunnableModel<TypedModel>,
  info: ModelInfo,
  normalization: Normalization,
}

impl TractEngine {
  pub fn load(
    model_data: &[u8],
    input_size: u32,
    normalization: Normalization,
  ) -> Result<Self, ModelLoadError> {
    info!("创建 tract 推理图, 输入尺寸 {}", input_size);
    let size = input_size as usize;

    let plan = tract_onnx::onnx()
      .model_for_read(&mut Cursor::new(model_data))
      .map_err(|e| ModelLoadError::Malformed(format!("{e:#}")))?
      .with_input_fact(
        0,
        InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
      )
      .map_err(|e| ModelLoadError::Incompatible(format!("{e:#}")))?
      .into_optimized()
      .map_err(|e| ModelLoadError::Incompatible(format!("{e:#}")))?
      .into_runnable()
      .map_err(|e| ModelLoadError::Incompatible(format!("{e:#}")))?;

    let output_shapes = {
      let model = plan.model();
      let outlets = model
        .output_outlets()
        .map_err(|e| ModelLoadError::Incompatible(format!("{e:#}")))?;
      let mut shapes = Vec::with_capacity(outlets.len());
      for outlet in outlets {
        let fact = model
          .outlet_fact(*outlet)
          .map_err(|e| ModelLoadError::Incompatible(format!("{e:#}")))?;
        let shape = fact.shape.as_concrete().ok_or_else(|| {
          ModelLoadError::Incompatible(format!("输出 {:?} 的形状不是常量", outlet))
        })?;
        shapes.push(shape.to_vec());
      }
      shapes
    };

    debug!("模型输出数量: {}", output_shapes.len());
    debug!("模型输出形状: {:?}", output_shapes);

    Ok(Self {
      plan,
      info: ModelInfo {
        input_size,
        input_layout: TensorLayout::Nchw,
        output_shapes,
      },
      normalization,
    })
  }

  fn build_input(&self, tensor: &InputTensor) -> Tensor {
    let size = self.info.input_size as usize;
    let norm = self.normalization;
    tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
      norm.apply(c, tensor.value(c, y, x))
    })
    .into_tensor()
  }
}

impl InferenceEngine for TractEngine {
  fn name(&self) -> &'static str {
    "tract"
  }

  fn info(&self) -> &ModelInfo {
    &self.info
  }

  fn run(&mut self, tensor: &InputTensor) -> Result<RawOutput, InferenceError> {
    self.info.check_input(tensor)?;

    let input = self.build_input(tensor);
    let outputs = self
      .plan
      .run(tvec!(input.into()))
      .map_err(|e| InferenceError::Engine(format!("{e:#}")))?;

    let mut tensors = Vec::with_capacity(outputs.len());
    for output in outputs.iter() {
      let view = output
        .to_array_view::<f32>()
        .map_err(|e| InferenceError::Engine(format!("输出张量不是 f32: {e:#}")))?;
      tensors.push(OutputTensor::new(
        view.shape().to_vec(),
        view.iter().copied().collect(),
      ));
    }

    Ok(RawOutput::new(tensors))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn malformed_bytes_fail_to_load() {
    let result = TractEngine::load(b"not an onnx graph", 416, Normalization::UNIT);
    assert!(matches!(result, Err(ModelLoadError::Malformed(_))));
  }
}
