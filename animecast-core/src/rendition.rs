use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenditionError {
    #[error("no valid qualities were provided")]
    EmptyRequest,
    #[error("unsupported quality: {0}")]
    UnsupportedQuality(String),
    #[error("no eligible quality remains for source {width}x{height}")]
    NoEligibleQuality { width: u32, height: u32 },
}

pub type RenditionResult<T> = Result<T, RenditionError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPreset {
    pub token: String,
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// Constant rate factor handed to the encoder.
    pub crf: u8,
}

impl QualityPreset {
    pub fn new(token: &str, label: &str, width: u32, height: u32, crf: u8) -> Self {
        Self {
            token: token.to_string(),
            label: label.to_string(),
            width,
            height,
            crf,
        }
    }

    pub fn standard_ladder() -> Vec<QualityPreset> {
        vec![
            QualityPreset::new("2160", "2160p", 3840, 2160, 18),
            QualityPreset::new("1080", "1080p", 1920, 1080, 20),
            QualityPreset::new("720", "720p", 1280, 720, 22),
            QualityPreset::new("480", "480p", 854, 480, 24),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionPlan {
    /// Encode order; the first entry becomes the primary rendition.
    pub eligible: Vec<QualityPreset>,
    /// Tokens dropped because they would upscale the source.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RenditionPlanner {
    presets: Vec<QualityPreset>,
}

impl Default for RenditionPlanner {
    fn default() -> Self {
        Self::new(QualityPreset::standard_ladder())
    }
}

impl RenditionPlanner {
    pub fn new(presets: Vec<QualityPreset>) -> Self {
        Self { presets }
    }

    pub fn presets(&self) -> &[QualityPreset] {
        &self.presets
    }

    pub fn preset(&self, token: &str) -> Option<&QualityPreset> {
        self.presets.iter().find(|preset| preset.token == token)
    }

    /// Resolves every requested token, rejecting the whole request on the first unknown one.
    pub fn parse_request(&self, requested: &str) -> RenditionResult<Vec<QualityPreset>> {
        let tokens = parse_quality_tokens(requested);
        if tokens.is_empty() {
            return Err(RenditionError::EmptyRequest);
        }
        tokens
            .iter()
            .map(|token| {
                self.preset(token)
                    .cloned()
                    .ok_or_else(|| RenditionError::UnsupportedQuality(token.clone()))
            })
            .collect()
    }

    pub fn plan(
        &self,
        requested: &str,
        source_width: u32,
        source_height: u32,
    ) -> RenditionResult<RenditionPlan> {
        let (eligible, skipped): (Vec<_>, Vec<_>) = self
            .parse_request(requested)?
            .into_iter()
            .partition(|preset| preset.height <= source_height);
        if eligible.is_empty() {
            return Err(RenditionError::NoEligibleQuality {
                width: source_width,
                height: source_height,
            });
        }
        Ok(RenditionPlan {
            eligible,
            skipped: skipped.into_iter().map(|preset| preset.token).collect(),
        })
    }
}

/// Splits a free-form list such as `"1080p, 720,,1080"` into unique digit tokens.
pub fn parse_quality_tokens(requested: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for raw in requested.split(',') {
        let token: String = raw.chars().filter(char::is_ascii_digit).collect();
        if !token.is_empty() && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_cleaned_and_deduplicated() {
        assert_eq!(
            parse_quality_tokens(" 1080p, 720 ,,1080,480x"),
            vec!["1080", "720", "480"]
        );
        assert!(parse_quality_tokens(" , p ,").is_empty());
    }

    #[test]
    fn plan_skips_upscaling_and_keeps_order() {
        let planner = RenditionPlanner::default();
        let plan = planner.plan("720,1080,480", 1280, 720).unwrap();
        let labels: Vec<_> = plan.eligible.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["720p", "480p"]);
        assert_eq!(plan.skipped, vec!["1080"]);
    }

    #[test]
    fn standard_ladder_plans_4k_but_never_upscales_to_it() {
        let ladder = QualityPreset::standard_ladder();
        let tokens: Vec<_> = ladder.iter().map(|preset| preset.token.as_str()).collect();
        assert_eq!(tokens, vec!["2160", "1080", "720", "480"]);

        let planner = RenditionPlanner::default();
        let plan = planner.plan("2160,1080", 1920, 1080).unwrap();
        assert_eq!(plan.skipped, vec!["2160"]);
        let uhd = planner.plan("2160", 3840, 2160).unwrap();
        assert_eq!(uhd.eligible[0].crf, 18);
    }

    #[test]
    fn unsupported_token_rejects_whole_request() {
        let planner = RenditionPlanner::default();
        assert_eq!(
            planner.plan("1080,360", 1920, 1080),
            Err(RenditionError::UnsupportedQuality("360".into()))
        );
        assert_eq!(planner.parse_request(""), Err(RenditionError::EmptyRequest));
    }

    #[test]
    fn no_eligible_quality_when_source_is_small() {
        let planner = RenditionPlanner::default();
        assert_eq!(
            planner.plan("1080,720", 640, 360),
            Err(RenditionError::NoEligibleQuality {
                width: 640,
                height: 360
            })
        );
    }

    #[test]
    fn skipped_and_eligible_never_overlap() {
        let planner = RenditionPlanner::default();
        for height in [360u32, 480, 719, 720, 1079, 1080, 2160] {
            match planner.plan("1080,720,480", 1920, height) {
                Ok(plan) => {
                    for preset in &plan.eligible {
                        assert!(preset.height <= height);
                        assert!(!plan.skipped.contains(&preset.token));
                    }
                    for token in &plan.skipped {
                        assert!(planner.preset(token).unwrap().height > height);
                    }
                    assert_eq!(plan.eligible.len() + plan.skipped.len(), 3);
                }
                Err(err) => {
                    assert!(height < 480);
                    assert!(matches!(err, RenditionError::NoEligibleQuality { .. }));
                }
            }
        }
    }
}
