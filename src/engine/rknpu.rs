// 该文件是 Tanjing （探镜） 项目的一部分。
// src/engine/rknpu.rs - RKNPU 推理后端
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

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use crate::{
  engine::{InferenceEngine, InferenceError, ModelInfo, ModelLoadError, OutputTensor, RawOutput},
  frame::{InputTensor, TensorLayout},
};

const RKNPU_NUM_INPUTS: u32 = 1;

/// Rockchip NPU 上的推理上下文
///
/// 归一化已编译进 RKNN 模型，输入直接使用 `u8` NHWC。
pub struct RknpuEngine {
  context: Context,
  info: ModelInfo,
}

fn invalid(msg: &str, e: rknpu::Error) -> ModelLoadError {
  ModelLoadError::Incompatible(format!("{}: {}", msg, e))
}

impl RknpuEngine {
  pub fn load(model_data: &[u8], input_size: u32) -> Result<Self, ModelLoadError> {
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(model_data, InitFlags::default())
      .map_err(|e| ModelLoadError::Malformed(e.to_string()))?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| invalid("无法获取输出数量", e))?;

    if num_inputs != RKNPU_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        RKNPU_NUM_INPUTS, num_inputs
      );
      return Err(ModelLoadError::Incompatible(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        RKNPU_NUM_INPUTS, num_inputs
      )));
    }

    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    let mut engine = Self {
      context,
      info: ModelInfo {
        input_size,
        input_layout: TensorLayout::Nhwc,
        output_shapes: Vec::new(),
      },
    };

    // 输出属性无法直接查询，用一次全零输入探测各输出的长度
    let zeros = vec![0u8; engine.info.input_shape().iter().product()];
    let output = engine
      .invoke(&zeros)
      .map_err(|e| ModelLoadError::Incompatible(e.to_string()))?;
    if output.len() != num_outputs as usize {
      return Err(ModelLoadError::Incompatible(format!(
        "预期模型输出数量为 {}, 实际为 {}",
        num_outputs,
        output.len()
      )));
    }
    engine.info.output_shapes = output.tensors().iter().map(|t| t.shape.clone()).collect();
    info!("模型加载完成");

    Ok(engine)
  }

  fn invoke(&mut self, data: &[u8]) -> Result<RawOutput, InferenceError> {
    let engine_err = |e: rknpu::Error| InferenceError::Engine(e.to_string());

    self
      .context
      .set_input(0, data, TensorFormat::NHWC, TensorType::UInt8)
      .map_err(engine_err)?;
    self.context.run().map_err(engine_err)?;

    let output = self.context.get_outputs().map_err(engine_err)?;
    let count = self.context.num_outputs().map_err(engine_err)? as usize;
    let mut tensors = Vec::with_capacity(count);
    for idx in 0..count {
      let data = output.get_f32(idx).map_err(engine_err)?;
      tensors.push(OutputTensor::new(vec![data.len()], data.to_vec()));
    }

    Ok(RawOutput::new(tensors))
  }
}

impl InferenceEngine for RknpuEngine {
  fn name(&self) -> &'static str {
    "rknpu"
  }

  fn info(&self) -> &ModelInfo {
    &self.info
  }

  fn run(&mut self, tensor: &InputTensor) -> Result<RawOutput, InferenceError> {
    self.info.check_input(tensor)?;
    debug!("执行模型推理");
    self.invoke(tensor.as_slice())
  }
}
