//! SCRFD face detector provider
//!
//! Decodes the multi-stride SCRFD output format into bounding boxes and
//! 5-point landmarks. Results are reported in the coordinate space of the
//! frame this provider was handed; the internal letterbox onto the network
//! canvas never leaks to callers.

use anyhow::Result;
use image::{DynamicImage, GenericImageView};
use openvino::InferRequest;

use super::preprocess::{letterbox, to_detection_tensor, LetterboxInfo, DETECTOR_INPUT_SIZE};
use super::registry::{Detect, FaceBox};
use super::runtime::{read_tensor_f32, set_input, SafeCompiledModel};

pub struct ScrfdDetector {
    model: SafeCompiledModel,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdDetector {
    pub fn new(model: SafeCompiledModel, confidence_threshold: f32) -> Self {
        Self {
            model,
            confidence_threshold,
            nms_threshold: 0.4,
        }
    }

    /// SCRFD variants differ in stride count, anchor count, and whether
    /// keypoint heads are present; the output tensor count identifies which.
    fn model_layout(output_count: usize) -> (usize, bool, usize) {
        match output_count {
            6 => (3, false, 2),
            9 => (3, true, 2),
            10 => (5, false, 1),
            15 => (5, true, 1),
            n => {
                tracing::warn!("Unknown SCRFD output count: {}, assuming 9-output layout", n);
                (3, true, 2)
            }
        }
    }

    fn parse_outputs(&self, request: &InferRequest, info: &LetterboxInfo) -> Result<Vec<FaceBox>> {
        let mut output_count = 0;
        for i in 0..20 {
            if request.get_output_tensor_by_index(i).is_ok() {
                output_count += 1;
            } else {
                break;
            }
        }

        let (fmc, use_kps, num_anchors) = Self::model_layout(output_count);
        let strides: &[i32] = if fmc == 3 {
            &[8, 16, 32]
        } else {
            &[8, 16, 32, 64, 128]
        };

        let (input_w, input_h) = (DETECTOR_INPUT_SIZE.0 as i32, DETECTOR_INPUT_SIZE.1 as i32);
        let mut all_boxes = Vec::new();

        for (idx, &stride) in strides.iter().enumerate() {
            let scores = read_tensor_f32(&request.get_output_tensor_by_index(idx)?)?;
            let bboxes = read_tensor_f32(&request.get_output_tensor_by_index(idx + fmc)?)?;
            let kps = if use_kps {
                Some(read_tensor_f32(
                    &request.get_output_tensor_by_index(idx + fmc * 2)?,
                )?)
            } else {
                None
            };

            let feat_h = input_h / stride;
            let feat_w = input_w / stride;

            let mut anchor_centers = Vec::with_capacity((feat_h * feat_w) as usize * num_anchors);
            for y in 0..feat_h {
                for x in 0..feat_w {
                    for _ in 0..num_anchors {
                        anchor_centers.push((x as f32 * stride as f32, y as f32 * stride as f32));
                    }
                }
            }

            for (i, &(cx, cy)) in anchor_centers.iter().enumerate() {
                let Some(&score) = scores.get(i) else { continue };
                if score < self.confidence_threshold {
                    continue;
                }

                let bbox_idx = i * 4;
                if bbox_idx + 3 >= bboxes.len() {
                    continue;
                }

                // Distance format: left, top, right, bottom from the anchor.
                let x1 = cx - bboxes[bbox_idx] * stride as f32;
                let y1 = cy - bboxes[bbox_idx + 1] * stride as f32;
                let x2 = cx + bboxes[bbox_idx + 2] * stride as f32;
                let y2 = cy + bboxes[bbox_idx + 3] * stride as f32;

                let landmarks = kps.as_ref().and_then(|kps_data| {
                    let kps_idx = i * 10;
                    if kps_idx + 9 >= kps_data.len() {
                        return None;
                    }
                    let mut points = [(0.0f32, 0.0f32); 5];
                    for (j, point) in points.iter_mut().enumerate() {
                        let lx = cx + kps_data[kps_idx + j * 2] * stride as f32;
                        let ly = cy + kps_data[kps_idx + j * 2 + 1] * stride as f32;
                        *point = info.to_frame(lx, ly);
                    }
                    Some(points)
                });

                let (fx1, fy1) = info.to_frame(x1, y1);
                let (fx2, fy2) = info.to_frame(x2, y2);

                let max_w = info.frame_width as f32;
                let max_h = info.frame_height as f32;

                all_boxes.push(FaceBox {
                    x1: fx1.clamp(0.0, max_w),
                    y1: fy1.clamp(0.0, max_h),
                    x2: fx2.clamp(0.0, max_w),
                    y2: fy2.clamp(0.0, max_h),
                    confidence: score,
                    landmarks,
                });
            }
        }

        Ok(all_boxes)
    }

    fn nms(&self, mut boxes: Vec<FaceBox>) -> Vec<FaceBox> {
        if boxes.is_empty() {
            return boxes;
        }

        boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut keep = Vec::new();
        let mut suppressed = vec![false; boxes.len()];

        for i in 0..boxes.len() {
            if suppressed[i] {
                continue;
            }
            keep.push(boxes[i].clone());
            for j in (i + 1)..boxes.len() {
                if !suppressed[j] && iou(&boxes[i], &boxes[j]) > self.nms_threshold {
                    suppressed[j] = true;
                }
            }
        }

        keep
    }
}

impl Detect for ScrfdDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let (frame_w, frame_h) = image.dimensions();
        let info = LetterboxInfo::new((frame_w, frame_h), DETECTOR_INPUT_SIZE);

        let canvas = letterbox(image, DETECTOR_INPUT_SIZE.0, DETECTOR_INPUT_SIZE.1);
        let input = to_detection_tensor(&canvas);

        let mut request = self.model.create_infer_request()?;
        set_input(&mut request, &input)?;
        request.infer()?;

        let detections = self.parse_outputs(&request, &info)?;
        let kept = self.nms(detections);

        tracing::debug!("Detected {} faces after NMS", kept.len());
        Ok(kept)
    }
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceBox {
        FaceBox {
            x1,
            y1,
            x2,
            y2,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn iou_of_partial_overlap() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = face(5.0, 5.0, 15.0, 15.0, 0.8);
        // Intersection 25, union 175.
        assert!((iou(&a, &b) - 25.0 / 175.0).abs() < 1e-4);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = face(20.0, 20.0, 30.0, 30.0, 0.8);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn layout_for_known_output_counts() {
        assert_eq!(ScrfdDetector::model_layout(9), (3, true, 2));
        assert_eq!(ScrfdDetector::model_layout(6), (3, false, 2));
        assert_eq!(ScrfdDetector::model_layout(15), (5, true, 1));
    }
}
