// 该文件是 Tanjing （探镜） 项目的一部分。
// src/model/labels.rs - 类别标签
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
  hash::{DefaultHasher, Hash, Hasher},
  path::Path,
  sync::Arc,
};

use crate::engine::ModelLoadError;

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 模型训练时的类别列表，下标即类别编号
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Arc<[String]>);

impl Labels {
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(names.into_iter().map(Into::into).collect())
  }

  pub fn coco() -> Self {
    Self::new(COCO_CLASSES)
  }

  /// 每行一个类别名，忽略空行
  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModelLoadError> {
    let text = std::fs::read_to_string(path)?;
    Ok(Self::new(
      text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty()),
    ))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// 类别列表的摘要，用于区分缓存中的模型
  pub fn fingerprint(&self) -> u64 {
    let mut hasher = DefaultHasher::new();
    self.hash(&mut hasher);
    hasher.finish()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn name(&self, id: u32) -> Option<&str> {
    self.0.get(id as usize).map(String::as_str)
  }
}

impl Default for Labels {
  fn default() -> Self {
    Self::coco()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn coco_has_eighty_classes() {
    let labels = Labels::coco();
    assert_eq!(labels.len(), 80);
    assert_eq!(labels.name(0), Some("person"));
    assert_eq!(labels.name(79), Some("toothbrush"));
    assert_eq!(labels.name(80), None);
  }

  #[test]
  fn reads_label_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "cat\n\n  dog  \n").unwrap();

    let labels = Labels::from_file(&path).unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels.name(1), Some("dog"));
  }

  #[test]
  fn fingerprint_follows_content() {
    assert_eq!(Labels::coco().fingerprint(), Labels::new(COCO_CLASSES).fingerprint());
    assert_ne!(Labels::coco().fingerprint(), Labels::new(["only"]).fingerprint());
    assert_ne!(
      Labels::new(["a", "b"]).fingerprint(),
      Labels::new(["b", "a"]).fingerprint()
    );
  }
}
