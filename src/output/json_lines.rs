// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output/json_lines.rs - 以 JSON Lines 记录检测结果
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
  fs::File,
  io::{BufWriter, Write},
  sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
};

use chrono::Local;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::FrameBuffer,
  input::url_path,
  normalize::{DetectResult, Detection},
  output::Render,
};

const STDOUT_PATH: &str = "-";

#[derive(Error, Debug)]
pub enum JsonLinesOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("路径解码失败: {0}")]
  PathDecode(#[from] std::string::FromUtf8Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// 每帧一行 JSON
#[derive(Serialize)]
struct FrameRecord<'a> {
  timestamp: String,
  frame: u64,
  width: u32,
  height: u32,
  /// 相对模型输入的坐标
  detections: &'a [Detection],
  /// 相对原始帧的坐标
  source: Vec<Detection>,
}

pub struct JsonLinesOutput {
  writer: Mutex<Box<dyn Write + Send>>,
  frame_counter: AtomicU64,
}

impl FromUrlWithScheme for JsonLinesOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonLinesOutput {
  type Error = JsonLinesOutputError;

  /// `json:-` 写到标准输出，`json:///path/result.jsonl` 写到文件
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonLinesOutputError::SchemeMismatch);
    }

    if url.path() == STDOUT_PATH {
      info!("检测结果输出到标准输出");
      return Ok(Self::from_writer(Box::new(std::io::stdout())));
    }

    let path = url_path(url)?;
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let file = File::create(&path)?;
    info!("检测结果输出到文件: {}", path.display());
    Ok(Self::from_writer(Box::new(BufWriter::new(file))))
  }
}

impl JsonLinesOutput {
  pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
    Self {
      writer: Mutex::new(writer),
      frame_counter: AtomicU64::new(0),
    }
  }
}

impl Render<FrameBuffer, DetectResult> for JsonLinesOutput {
  type Error = JsonLinesOutputError;

  fn render_result(&self, frame: &FrameBuffer, result: &DetectResult) -> Result<(), Self::Error> {
    let record = FrameRecord {
      timestamp: Local::now().to_rfc3339(),
      frame: self.frame_counter.fetch_add(1, Ordering::Relaxed),
      width: frame.width(),
      height: frame.height(),
      detections: &result.items,
      source: result.to_source(),
    };

    let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
    serde_json::to_writer(&mut *writer, &record)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    debug!("写入第 {} 帧的 {} 个检测结果", record.frame, result.len());
    Ok(())
  }
}
