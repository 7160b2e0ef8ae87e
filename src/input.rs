// 该文件是 Tanjing （探镜） 项目的一部分。
// src/input.rs - 输入来源
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

use std::path::{Path, PathBuf};

use image::ImageReader;
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::FrameBuffer};

mod read_directory;
mod read_image_file;

pub use self::read_directory::{DirectoryInput, DirectoryInputError};
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[error("目录输入错误: {0}")]
  DirectoryInputError(#[from] DirectoryInputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum InputWrapper {
  ReadImageFile(ImageFileInput),
  ReadDirectory(DirectoryInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ImageFileInput::SCHEME => Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?)),
      DirectoryInput::SCHEME => Ok(InputWrapper::ReadDirectory(DirectoryInput::from_url(url)?)),
      other => Err(InputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Iterator for InputWrapper {
  type Item = FrameBuffer;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapper::ReadImageFile(input) => input.next(),
      InputWrapper::ReadDirectory(input) => input.next(),
    }
  }
}

/// URL 路径解码为本地文件路径
pub(crate) fn url_path(url: &Url) -> Result<PathBuf, std::string::FromUtf8Error> {
  urlencoding::decode(url.path()).map(|path| PathBuf::from(path.into_owned()))
}

/// 读取图像文件并转为 RGBA 帧
pub(crate) fn load_frame(path: &Path) -> Result<FrameBuffer, image::ImageError> {
  let image = ImageReader::open(path)?.decode()?;
  Ok(FrameBuffer::from(image.to_rgba8()))
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use image::{Rgba, RgbaImage};

  pub(crate) fn write_png(path: &Path, width: u32, height: u32, value: u8) {
    RgbaImage::from_pixel(width, height, Rgba([value, value, value, 255]))
      .save(path)
      .unwrap();
  }

  #[test]
  fn wrapper_dispatches_on_scheme() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.png");
    write_png(&file, 8, 6, 10);

    let url = Url::parse(&format!("image://{}", file.display())).unwrap();
    let mut input = InputWrapper::from_url(&url).unwrap();
    let frame = input.next().unwrap();
    assert_eq!((frame.width(), frame.height()), (8, 6));
    assert!(input.next().is_none());

    let url = Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let input = InputWrapper::from_url(&url).unwrap();
    assert_eq!(input.count(), 1);
  }

  #[test]
  fn wrapper_rejects_unknown_scheme() {
    let url = Url::parse("rtsp://camera.local/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn url_path_is_percent_decoded() {
    let url = Url::parse("image:///data/my%20photos/a.png").unwrap();
    assert_eq!(url_path(&url).unwrap(), PathBuf::from("/data/my photos/a.png"));
  }
}
