// 该文件是 Tanjing （探镜） 项目的一部分。
// src/frame.rs - 相机帧与输入张量
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

use image::{Rgb, RgbImage, RgbaImage, imageops};
use thiserror::Error;
use tracing::debug;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidFrameError {
  #[error("帧尺寸为空: {width}x{height}")]
  Empty { width: u32, height: u32 },
  #[error("不支持的像素格式: {0}")]
  UnsupportedFormat(String),
  #[error("行跨度过小: 期望至少 {expected}, 实际 {actual}")]
  StrideTooSmall { expected: usize, actual: usize },
  #[error("像素缓冲区过小: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  BufferTooSmall { expected: usize, actual: usize },
}

/// 相机帧的像素排布
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
  /// 每像素 4 字节，B G R A（移动端相机的默认输出）
  #[default]
  Bgra8,
  Rgba8,
  Bgr8,
  Rgb8,
}

impl PixelFormat {
  pub fn bytes_per_pixel(&self) -> usize {
    match self {
      PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
      PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
    }
  }

  /// 由 FourCC 解析像素格式，例如 `BGRA`、`RGB3`
  pub fn from_fourcc(fourcc: &str) -> Result<Self, InvalidFrameError> {
    match fourcc {
      "BGRA" => Ok(PixelFormat::Bgra8),
      "RGBA" => Ok(PixelFormat::Rgba8),
      "BGR3" => Ok(PixelFormat::Bgr8),
      "RGB3" => Ok(PixelFormat::Rgb8),
      other => Err(InvalidFrameError::UnsupportedFormat(other.to_string())),
    }
  }

  fn rgb(&self, px: &[u8]) -> [u8; 3] {
    match self {
      PixelFormat::Bgra8 | PixelFormat::Bgr8 => [px[2], px[1], px[0]],
      PixelFormat::Rgba8 | PixelFormat::Rgb8 => [px[0], px[1], px[2]],
    }
  }
}

/// 调用方持有的一帧像素数据，流水线只在一次调用内借用它
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
  data: &'a [u8],
  width: u32,
  height: u32,
  stride: usize,
  format: PixelFormat,
}

impl<'a> Frame<'a> {
  pub fn new(
    data: &'a [u8],
    width: u32,
    height: u32,
    format: PixelFormat,
  ) -> Result<Self, InvalidFrameError> {
    let stride = width as usize * format.bytes_per_pixel();
    Self::with_stride(data, width, height, stride, format)
  }

  /// 带行跨度的帧，相机缓冲区每行末尾可能有对齐填充
  pub fn with_stride(
    data: &'a [u8],
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
  ) -> Result<Self, InvalidFrameError> {
    if width == 0 || height == 0 {
      return Err(InvalidFrameError::Empty { width, height });
    }

    let row_bytes = width as usize * format.bytes_per_pixel();
    if stride < row_bytes {
      return Err(InvalidFrameError::StrideTooSmall {
        expected: row_bytes,
        actual: stride,
      });
    }

    let expected = stride * (height as usize - 1) + row_bytes;
    if data.len() < expected {
      return Err(InvalidFrameError::BufferTooSmall {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data,
      width,
      height,
      stride,
      format,
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  /// 以 RGB 顺序读取一个像素
  pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
    let bpp = self.format.bytes_per_pixel();
    let offset = y as usize * self.stride + x as usize * bpp;
    self.format.rgb(&self.data[offset..offset + bpp])
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    RgbImage::from_fn(self.width, self.height, |x, y| Rgb(self.rgb_at(x, y)))
  }
}

/// 自有像素数据的帧，用于文件输入与预热
#[derive(Debug, Clone)]
pub struct FrameBuffer {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  format: PixelFormat,
}

impl FrameBuffer {
  pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
    Self {
      data: data.into_boxed_slice(),
      width,
      height,
      format,
    }
  }

  /// 全黑 BGRA 帧
  pub fn blank(width: u32, height: u32) -> Self {
    let format = PixelFormat::Bgra8;
    let size = width as usize * height as usize * format.bytes_per_pixel();
    Self::new(vec![0u8; size], width, height, format)
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn as_frame(&self) -> Result<Frame<'_>, InvalidFrameError> {
    Frame::new(&self.data, self.width, self.height, self.format)
  }
}

impl From<RgbaImage> for FrameBuffer {
  fn from(image: RgbaImage) -> Self {
    let (width, height) = image.dimensions();
    FrameBuffer::new(image.into_raw(), width, height, PixelFormat::Rgba8)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
  Nchw,
  Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
  Rgb,
  Bgr,
}

/// 正方形输入中有效图像所在的区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

/// 等比缩放加填充（letterbox）的几何参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub input_size: u32,
  pub source_width: u32,
  pub source_height: u32,
  pub scale: f32,
  pub roi: Roi,
}

impl Letterbox {
  /// 长边对齐到 `input_size`，短边向下取整并居中
  pub fn compute(source_width: u32, source_height: u32, input_size: u32) -> Self {
    let dst = input_size as f64;
    let (sw, sh) = (source_width as f64, source_height as f64);

    let (width, height) = if source_width > source_height {
      (input_size, ((dst / sw) * sh).floor().max(1.0) as u32)
    } else if source_width < source_height {
      (((dst / sh) * sw).floor().max(1.0) as u32, input_size)
    } else {
      (input_size, input_size)
    };

    let scale = (dst / sw.max(sh)) as f32;

    Self {
      input_size,
      source_width,
      source_height,
      scale,
      roi: Roi {
        x: (input_size - width) / 2,
        y: (input_size - height) / 2,
        width,
        height,
      },
    }
  }
}

/// 送入推理引擎的定长正方形张量
#[derive(Debug, Clone)]
pub struct InputTensor {
  data: Box<[u8]>,
  size: u32,
  layout: TensorLayout,
  order: ChannelOrder,
  letterbox: Letterbox,
}

impl InputTensor {
  pub fn size(&self) -> u32 {
    self.size
  }

  pub fn layout(&self) -> TensorLayout {
    self.layout
  }

  pub fn channel_order(&self) -> ChannelOrder {
    self.order
  }

  pub fn letterbox(&self) -> &Letterbox {
    &self.letterbox
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.data
  }

  pub fn shape(&self) -> [usize; 4] {
    let s = self.size as usize;
    match self.layout {
      TensorLayout::Nchw => [1, RGB_CHANNELS, s, s],
      TensorLayout::Nhwc => [1, s, s, RGB_CHANNELS],
    }
  }

  /// 按 (通道, 行, 列) 读取，与内存排布无关
  pub fn value(&self, c: usize, y: usize, x: usize) -> u8 {
    let s = self.size as usize;
    match self.layout {
      TensorLayout::Nchw => self.data[c * s * s + y * s + x],
      TensorLayout::Nhwc => self.data[(y * s + x) * RGB_CHANNELS + c],
    }
  }
}

/// 把相机帧转换为模型输入张量
#[derive(Debug, Clone)]
pub struct FrameAdapter {
  size: u32,
  layout: TensorLayout,
  order: ChannelOrder,
  fill: u8,
}

impl FrameAdapter {
  pub fn new(size: u32, layout: TensorLayout, order: ChannelOrder) -> Self {
    Self {
      size,
      layout,
      order,
      fill: 0,
    }
  }

  pub fn with_fill(mut self, fill: u8) -> Self {
    self.fill = fill;
    self
  }

  pub fn size(&self) -> u32 {
    self.size
  }

  pub fn prepare(&self, frame: &Frame<'_>) -> Result<InputTensor, InvalidFrameError> {
    if self.size == 0 {
      return Err(InvalidFrameError::Empty {
        width: self.size,
        height: self.size,
      });
    }

    let letterbox = Letterbox::compute(frame.width(), frame.height(), self.size);
    let roi = letterbox.roi;
    debug!(
      "预处理: {}x{} -> {}x{}, 填充偏移 ({}, {})",
      frame.width(),
      frame.height(),
      roi.width,
      roi.height,
      roi.x,
      roi.y
    );

    let order = self.order;
    let source = RgbImage::from_fn(frame.width(), frame.height(), |x, y| {
      let [r, g, b] = frame.rgb_at(x, y);
      match order {
        ChannelOrder::Rgb => Rgb([r, g, b]),
        ChannelOrder::Bgr => Rgb([b, g, r]),
      }
    });

    let resized = if (roi.width, roi.height) == source.dimensions() {
      source
    } else {
      imageops::resize(
        &source,
        roi.width,
        roi.height,
        imageops::FilterType::Triangle,
      )
    };

    let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([self.fill; 3]));
    imageops::replace(&mut canvas, &resized, roi.x as i64, roi.y as i64);

    let data = match self.layout {
      TensorLayout::Nhwc => canvas.into_raw(),
      TensorLayout::Nchw => {
        let plane = (self.size * self.size) as usize;
        let mut planar = vec![0u8; plane * RGB_CHANNELS];
        for (idx, pixel) in canvas.pixels().enumerate() {
          for c in 0..RGB_CHANNELS {
            planar[c * plane + idx] = pixel[c];
          }
        }
        planar
      }
    };

    Ok(InputTensor {
      data: data.into_boxed_slice(),
      size: self.size,
      layout: self.layout,
      order: self.order,
      letterbox,
    })
  }
}
