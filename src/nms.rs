// 该文件是 Tanjing （探镜） 项目的一部分。
// src/nms.rs - 非极大值抑制
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

use tracing::debug;

use crate::model::Candidate;

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// 贪心非极大值抑制
///
/// 按分数降序处理，分数相同时下标小者优先；被接受的框会抑制与之
/// IoU ≥ `iou_threshold` 的其余候选（非类别无关时只抑制同类）。
/// 结果按分数降序排列。
pub fn suppress(candidates: Vec<Candidate>, iou_threshold: f32, class_agnostic: bool) -> Vec<Candidate> {
  if candidates.is_empty() {
    return candidates;
  }

  let mut order: Vec<usize> = (0..candidates.len()).collect();
  // 稳定排序保证同分时先出现者在前
  order.sort_by(|&a, &b| candidates[b].score.total_cmp(&candidates[a].score));

  let mut suppressed = vec![false; candidates.len()];
  let mut kept = Vec::new();

  for (rank, &i) in order.iter().enumerate() {
    if suppressed[i] {
      continue;
    }
    let best = candidates[i];
    kept.push(best);

    for &j in &order[rank + 1..] {
      if suppressed[j] {
        continue;
      }
      let other = &candidates[j];
      if !class_agnostic && other.label != best.label {
        continue;
      }
      if best.bbox.iou(&other.bbox) >= iou_threshold {
        suppressed[j] = true;
      }
    }
  }

  debug!("NMS: {} 个候选框保留 {} 个", candidates.len(), kept.len());
  kept
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;
  use crate::model::BoundingBox;

  fn cand(x: f32, y: f32, w: f32, h: f32, label: u32, score: f32) -> Candidate {
    Candidate {
      bbox: BoundingBox::new(x, y, w, h),
      label,
      score,
    }
  }

  #[test]
  fn empty_input_yields_empty_output() {
    assert!(suppress(Vec::new(), DEFAULT_IOU_THRESHOLD, false).is_empty());
  }

  #[test]
  fn keeps_higher_score_of_overlapping_pair() {
    // IoU = 90 / 100 = 0.9
    let a = cand(0.0, 0.0, 10.0, 10.0, 3, 0.8);
    let b = cand(0.0, 0.0, 10.0, 9.0, 3, 0.9);
    assert!((a.bbox.iou(&b.bbox) - 0.9).abs() < 1e-6);

    let kept = suppress(vec![a, b], DEFAULT_IOU_THRESHOLD, false);
    assert_eq!(kept, vec![b]);
  }

  #[test]
  fn different_labels_survive_unless_agnostic() {
    let a = cand(0.0, 0.0, 10.0, 10.0, 0, 0.9);
    let b = cand(1.0, 1.0, 10.0, 10.0, 1, 0.8);

    assert_eq!(suppress(vec![a, b], 0.45, false).len(), 2);
    assert_eq!(suppress(vec![a, b], 0.45, true), vec![a]);
  }

  #[test]
  fn equal_scores_prefer_first_seen() {
    let a = cand(0.0, 0.0, 10.0, 10.0, 0, 0.7);
    let b = cand(0.5, 0.0, 10.0, 10.0, 0, 0.7);
    assert_eq!(suppress(vec![a, b], 0.45, false), vec![a]);
    assert_eq!(suppress(vec![b, a], 0.45, false), vec![b]);
  }

  #[test]
  fn threshold_is_inclusive() {
    // IoU = 50 / 150 = 1/3
    let a = cand(0.0, 0.0, 10.0, 10.0, 0, 0.9);
    let b = cand(5.0, 0.0, 10.0, 10.0, 0, 0.8);
    let iou = a.bbox.iou(&b.bbox);
    assert_eq!(suppress(vec![a, b], iou, false), vec![a]);
    assert_eq!(suppress(vec![a, b], iou + 1e-4, false).len(), 2);
  }

  #[test]
  fn suppressed_box_does_not_suppress_others() {
    // b 被 a 抑制；c 只和 b 重叠，应当保留
    let a = cand(0.0, 0.0, 10.0, 10.0, 0, 0.9);
    let b = cand(4.0, 0.0, 10.0, 10.0, 0, 0.8);
    let c = cand(9.0, 0.0, 10.0, 10.0, 0, 0.7);
    assert_eq!(suppress(vec![c, b, a], 0.4, false), vec![a, c]);
  }

  #[test]
  fn output_is_sorted_and_idempotent() {
    let input = vec![
      cand(0.0, 0.0, 10.0, 10.0, 0, 0.3),
      cand(50.0, 50.0, 10.0, 10.0, 1, 0.9),
      cand(1.0, 1.0, 10.0, 10.0, 0, 0.6),
      cand(80.0, 0.0, 5.0, 5.0, 0, 0.6),
      cand(51.0, 50.0, 10.0, 10.0, 1, 0.5),
    ];
    let once = suppress(input, 0.45, false);
    let twice = suppress(once.clone(), 0.45, false);
    assert_eq!(once, twice);
    assert!(once.windows(2).all(|w| w[0].score >= w[1].score));
    for (i, a) in once.iter().enumerate() {
      for b in &once[i + 1..] {
        if a.label == b.label {
          assert!(a.bbox.iou(&b.bbox) < 0.45);
        }
      }
    }
  }

  fn candidate() -> impl Strategy<Value = Candidate> {
    (0f32..600.0, 0f32..600.0, 1f32..200.0, 1f32..200.0, 0u32..3, 0f32..1.0)
      .prop_map(|(x, y, w, h, label, score)| cand(x, y, w, h, label, score))
  }

  proptest! {
    #[test]
    fn kept_boxes_are_sorted_separated_and_stable(
      input in prop::collection::vec(candidate(), 0..200),
      iou in 0.01f32..=1.0,
      agnostic in any::<bool>(),
    ) {
      let once = suppress(input.clone(), iou, agnostic);
      prop_assert!(once.len() <= input.len());
      prop_assert!(once.windows(2).all(|w| w[0].score >= w[1].score));
      for (i, a) in once.iter().enumerate() {
        for b in &once[i + 1..] {
          if agnostic || a.label == b.label {
            prop_assert!(a.bbox.iou(&b.bbox) < iou);
          }
        }
      }

      let twice = suppress(once.clone(), iou, agnostic);
      prop_assert_eq!(once, twice);
    }

    #[test]
    fn highest_score_always_survives(
      input in prop::collection::vec(candidate(), 1..200),
      iou in 0.01f32..=1.0,
    ) {
      let best = input
        .iter()
        .map(|c| c.score)
        .fold(f32::NEG_INFINITY, f32::max);
      let kept = suppress(input, iou, false);
      prop_assert_eq!(kept[0].score, best);
    }
  }
}
