// 该文件是 Tanjing （探镜） 项目的一部分。
// src/output/save_image_file.rs - 保存绘制结果到图像文件
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{FrameBuffer, InvalidFrameError},
  input::url_path,
  normalize::DetectResult,
  output::{Render, draw::Draw},
};

pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Draw,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("输入帧无效: {0}")]
  InvalidFrame(#[from] InvalidFrameError),
  #[error("路径解码失败: {0}")]
  PathDecode(#[from] std::string::FromUtf8Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      error!("URI 方案不匹配: {}", uri.scheme());
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: url_path(uri)?,
      draw: Draw::default(),
    })
  }
}

impl SaveImageFileOutput {
  fn save_image(&self, image: image::RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&self.path)?;
    info!("保存图像到文件: {}", self.path.display());

    Ok(())
  }
}

impl Render<FrameBuffer, DetectResult> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  /// 检测框映射回原始帧后绘制
  fn render_result(&self, frame: &FrameBuffer, result: &DetectResult) -> Result<(), Self::Error> {
    let mut image = frame.as_frame()?.to_rgb_image();
    self.draw.draw_detections(&mut image, &result.to_source());
    self.save_image(image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{frame::Letterbox, normalize::Detection};

  #[test]
  fn saves_frame_at_source_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("result.png");
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();

    let frame = FrameBuffer::blank(64, 48);
    let result = DetectResult {
      items: vec![Detection {
        x: 0.25,
        y: 0.25,
        w: 0.5,
        h: 0.5,
        label: "cat".to_string(),
        label_id: 15,
        score: 0.8,
      }]
      .into_boxed_slice(),
      letterbox: Letterbox::compute(64, 48, 32),
    };
    output.render_result(&frame, &result).unwrap();

    let saved = image::open(&path).unwrap();
    assert_eq!((saved.width(), saved.height()), (64, 48));
  }
}
