//! Attribute and emotion providers
//!
//! Gender/age comes from the InsightFace genderage network; emotion from a
//! FER+ classifier. Both are optional capabilities: either may be absent
//! for a deployment, and per-call failures leave the fields absent.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use image::{imageops, DynamicImage};
use ndarray::Array4;

use crate::service::types::{Emotion, FaceAttributes, Gender};
use crate::utils::math::{argmax, softmax};

use super::registry::{ClassifyEmotion, ExtractAttributes};
use super::runtime::{read_output_f32, set_input, SafeCompiledModel};

/// Input side length for the genderage network.
const GENDER_AGE_INPUT: u32 = 96;

/// Input side length for the FER+ emotion network.
const EMOTION_INPUT: u32 = 64;

pub struct GenderAgeExtractor {
    model: SafeCompiledModel,
}

impl GenderAgeExtractor {
    pub fn new(model: SafeCompiledModel) -> Self {
        Self { model }
    }

    /// NCHW RGB tensor with (x - 127.5) / 128 scaling.
    fn to_tensor(face: &DynamicImage) -> Array4<f32> {
        let rgb = face
            .resize_exact(GENDER_AGE_INPUT, GENDER_AGE_INPUT, imageops::FilterType::Triangle)
            .to_rgb8();
        let side = GENDER_AGE_INPUT as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - 127.5) / 128.0;
            }
        }
        tensor
    }

    /// The genderage family comes in two output layouts:
    /// `[female_logit, male_logit, age_scale]` and `[gender_logit, age]`.
    fn parse(output: &[f32]) -> Result<(u32, Gender, f32)> {
        match output.len() {
            3 => {
                let (female_logit, male_logit, age_scale) = (output[0], output[1], output[2]);
                let probs = softmax(&[female_logit, male_logit]);
                let (gender, confidence) = if male_logit > female_logit {
                    (Gender::Male, probs[1])
                } else {
                    (Gender::Female, probs[0])
                };
                let age = (age_scale * 100.0).round().clamp(1.0, 100.0) as u32;
                Ok((age, gender, confidence))
            }
            2 => {
                let (gender_val, age_factor) = (output[0], output[1]);
                let sigmoid = 1.0 / (1.0 + (-gender_val).exp());
                let (gender, confidence) = if sigmoid > 0.5 {
                    (Gender::Female, sigmoid)
                } else {
                    (Gender::Male, 1.0 - sigmoid)
                };
                let age = if age_factor > 1.0 && age_factor < 120.0 {
                    age_factor.round()
                } else {
                    (age_factor * 100.0).round()
                };
                Ok((age.clamp(1.0, 100.0) as u32, gender, confidence))
            }
            n => bail!("unexpected genderage output length: {}", n),
        }
    }
}

impl ExtractAttributes for GenderAgeExtractor {
    fn attributes(&self, face: &DynamicImage) -> Result<FaceAttributes> {
        let input = Self::to_tensor(face);

        let mut request = self.model.create_infer_request()?;
        set_input(&mut request, &input)?;
        request.infer()?;

        let output = read_output_f32(&request)?;
        let (age, gender, confidence) = Self::parse(&output)?;

        // This network carries no pose head; the fields stay absent.
        Ok(FaceAttributes {
            age: Some(age),
            gender: Some(gender),
            gender_confidence: Some(confidence),
            ..Default::default()
        })
    }
}

pub struct FerEmotionClassifier {
    model: SafeCompiledModel,
}

impl FerEmotionClassifier {
    pub fn new(model: SafeCompiledModel) -> Self {
        Self { model }
    }

    /// FER+ takes raw grayscale pixel values in [0, 255], unscaled.
    fn to_tensor(face: &DynamicImage) -> Array4<f32> {
        let gray = face
            .resize_exact(EMOTION_INPUT, EMOTION_INPUT, imageops::FilterType::Triangle)
            .to_luma8();
        let side = EMOTION_INPUT as usize;
        let mut tensor = Array4::<f32>::zeros((1, 1, side, side));
        for (x, y, pixel) in gray.enumerate_pixels() {
            tensor[[0, 0, y as usize, x as usize]] = pixel[0] as f32;
        }
        tensor
    }
}

impl ClassifyEmotion for FerEmotionClassifier {
    fn classify(&self, face: &DynamicImage) -> Result<(Emotion, BTreeMap<Emotion, f32>)> {
        let input = Self::to_tensor(face);

        let mut request = self.model.create_infer_request()?;
        set_input(&mut request, &input)?;
        request.infer()?;

        let output = read_output_f32(&request)?;
        if output.len() != Emotion::ALL.len() {
            bail!("unexpected emotion output length: {}", output.len());
        }

        let probs = softmax(&output);
        let scores: BTreeMap<Emotion, f32> = Emotion::ALL
            .iter()
            .zip(probs.iter())
            .map(|(&label, &p)| (label, p))
            .collect();

        let top = Emotion::ALL[argmax(&probs)];
        Ok((top, scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_three_output_layout() {
        // Male logit dominates, age scale 0.31.
        let (age, gender, confidence) = GenderAgeExtractor::parse(&[0.1, 2.3, 0.31]).unwrap();
        assert_eq!(age, 31);
        assert_eq!(gender, Gender::Male);
        assert!(confidence > 0.5);
    }

    #[test]
    fn parse_two_output_layout_with_plain_age() {
        let (age, gender, _) = GenderAgeExtractor::parse(&[3.0, 42.0]).unwrap();
        assert_eq!(age, 42);
        assert_eq!(gender, Gender::Female);
    }

    #[test]
    fn parse_rejects_unknown_layout() {
        assert!(GenderAgeExtractor::parse(&[1.0]).is_err());
    }
}
