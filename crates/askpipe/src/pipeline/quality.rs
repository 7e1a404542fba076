use super::ask_model;
use super::parse::{decode_json, Decoded};
use crate::config::PipelineConfig;
use askpipe_core::{Answer, LlmClient, LlmTask, Mode, QaVerdict};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct QaReply {
    needs_more_data: bool,
    should_reformat: bool,
    quality_score: f64,
    #[serde(default)]
    refined_query: Option<String>,
    #[serde(default)]
    missing_aspects: Vec<String>,
    #[serde(default)]
    improvement_suggestions: Vec<String>,
}

impl From<QaReply> for QaVerdict {
    fn from(r: QaReply) -> Self {
        QaVerdict {
            needs_more_data: r.needs_more_data,
            should_reformat: r.should_reformat,
            quality_score: r.quality_score,
            refined_query: r.refined_query.filter(|s| !s.trim().is_empty()),
            missing_aspects: r.missing_aspects,
            improvement_suggestions: r.improvement_suggestions,
        }
    }
}

/// Verdict used when the evaluation call fails: adequate, no reformat.
pub fn fallback_verdict(reason: &str) -> QaVerdict {
    QaVerdict {
        needs_more_data: false,
        should_reformat: false,
        quality_score: 0.6,
        refined_query: None,
        missing_aspects: Vec::new(),
        improvement_suggestions: vec![format!("quality evaluation failed: {reason}")],
    }
}

/// Mode rules layered over whatever the evaluator said.
///
/// Fast: never more data, always reformat. Thorough: an answer under the word minimum
/// asks for more data when sources are thin, otherwise for a reformat.
pub fn apply_mode_policy(
    mut v: QaVerdict,
    answer_text: &str,
    source_count: usize,
    mode: Mode,
    cfg: &PipelineConfig,
) -> QaVerdict {
    v.quality_score = if v.quality_score.is_finite() {
        v.quality_score.clamp(0.0, 1.0)
    } else {
        0.0
    };
    match mode {
        Mode::Fast => {
            v.needs_more_data = false;
            v.should_reformat = true;
        }
        Mode::Thorough => {
            let words = answer_text.split_whitespace().count();
            if words < cfg.thorough_min_words {
                tracing::info!(words, min = cfg.thorough_min_words, "answer below thorough length");
                if source_count < cfg.thin_source_threshold {
                    v.needs_more_data = true;
                } else {
                    v.should_reformat = true;
                }
            }
        }
    }
    v
}

fn prompt(query: &str, intent: &str, answer: &Answer, source_count: usize, mode: Mode) -> String {
    format!(
        "Evaluate the completeness and quality of a response.\n\n\
         User query: {query}\nElaborated intent: {intent}\nMode: {mode}\n\
         Available sources: {source_count} with {} citations\n\nResponse:\n{}\n\n\
         Respond with JSON: {{\"needs_more_data\": bool, \"missing_aspects\": [..], \"quality_score\": 0.0-1.0, \
         \"improvement_suggestions\": [..], \"refined_query\": \"query for more data or null\", \
         \"should_reformat\": bool}}\n\
         Set needs_more_data only when information is missing that reformatting cannot fix.",
        answer.cited_urls.len(),
        answer.text
    )
}

pub async fn evaluate(
    llm: &dyn LlmClient,
    query: &str,
    intent: &str,
    answer: &Answer,
    source_count: usize,
    mode: Mode,
    cfg: &PipelineConfig,
) -> Decoded<QaVerdict> {
    let reply = ask_model(
        llm,
        LlmTask::QualityCheck,
        prompt(query, intent, answer, source_count, mode),
        cfg.llm_timeout_ms,
    )
    .await;
    let decoded = match decode_json::<QaReply, _>(reply, || QaReply {
        needs_more_data: false,
        should_reformat: false,
        quality_score: 0.0,
        refined_query: None,
        missing_aspects: Vec::new(),
        improvement_suggestions: Vec::new(),
    }) {
        Decoded::Parsed(r) => Decoded::Parsed(QaVerdict::from(r)),
        Decoded::FallbackUsed { reason, .. } => {
            tracing::warn!(stage = "quality", query, error = %reason, "quality check fell back");
            Decoded::FallbackUsed {
                value: fallback_verdict(&reason),
                reason,
            }
        }
    };
    let decoded = decoded.map(|v| apply_mode_policy(v, &answer.text, source_count, mode, cfg));
    let v = decoded.value();
    tracing::info!(
        needs_more_data = v.needs_more_data,
        should_reformat = v.should_reformat,
        quality_score = v.quality_score,
        "quality verdict"
    );
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adequate() -> QaVerdict {
        QaVerdict {
            quality_score: 0.9,
            ..QaVerdict::default()
        }
    }

    #[test]
    fn fast_mode_forces_reformat_and_no_more_data() {
        let cfg = PipelineConfig::default();
        let v = QaVerdict {
            needs_more_data: true,
            ..adequate()
        };
        let v = apply_mode_policy(v, "short", 1, Mode::Fast, &cfg);
        assert!(!v.needs_more_data);
        assert!(v.should_reformat);
    }

    #[test]
    fn thorough_mode_short_answers_branch_on_source_count() {
        let cfg = PipelineConfig::default();
        let thin = apply_mode_policy(adequate(), "short answer", 3, Mode::Thorough, &cfg);
        assert!(thin.needs_more_data);
        assert!(!thin.should_reformat);

        let rich = apply_mode_policy(adequate(), "short answer", 4, Mode::Thorough, &cfg);
        assert!(!rich.needs_more_data);
        assert!(rich.should_reformat);

        let long = "word ".repeat(cfg.thorough_min_words);
        let ok = apply_mode_policy(adequate(), &long, 1, Mode::Thorough, &cfg);
        assert!(!ok.needs_more_data && !ok.should_reformat);
    }

    #[test]
    fn scores_are_clamped() {
        let cfg = PipelineConfig::default();
        let v = QaVerdict {
            quality_score: 3.0,
            ..QaVerdict::default()
        };
        assert_eq!(apply_mode_policy(v, "x", 0, Mode::Fast, &cfg).quality_score, 1.0);
        let v = QaVerdict {
            quality_score: f64::NAN,
            ..QaVerdict::default()
        };
        assert_eq!(apply_mode_policy(v, "x", 0, Mode::Fast, &cfg).quality_score, 0.0);
    }

    #[test]
    fn fallback_verdict_is_adequate() {
        let v = fallback_verdict("boom");
        assert!(!v.needs_more_data && !v.should_reformat);
        assert_eq!(v.quality_score, 0.6);
    }
}
