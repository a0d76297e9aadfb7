//! Rule-driven classifiers for tests and demos.

use std::sync::Arc;

use super::{check_frame_len, ClassifierFactory, Sensitivity, VadDecision, VoiceActivityClassifier};
use crate::buffering::frame::{AudioFrame, SampleRate};
use crate::error::{ParleyError, Result};

type Rule = Arc<dyn Fn(&AudioFrame) -> bool + Send + Sync>;

/// Builds classifiers whose verdict is an arbitrary function of the frame.
/// Lets tests drive the classifier and the energy gate independently.
#[derive(Clone)]
pub struct ScriptedFactory {
    rule: Option<Rule>,
}

impl ScriptedFactory {
    pub fn from_fn(rule: impl Fn(&AudioFrame) -> bool + Send + Sync + 'static) -> Self {
        Self {
            rule: Some(Arc::new(rule)),
        }
    }

    pub fn always(speech: bool) -> Self {
        Self::from_fn(move |_| speech)
    }

    /// Speech when the first sample equals `level`. Pairs with
    /// `frames_from_levels` to tag individual frames as "voiced".
    pub fn voiced_level(level: i16) -> Self {
        Self::from_fn(move |f| f.samples().first() == Some(&level))
    }

    /// Every `create` fails: simulates a backend that cannot initialise.
    pub fn unavailable() -> Self {
        Self { rule: None }
    }
}

impl std::fmt::Debug for ScriptedFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedFactory")
            .field("available", &self.rule.is_some())
            .finish()
    }
}

impl ClassifierFactory for ScriptedFactory {
    fn create(
        &self,
        rate: SampleRate,
        _sensitivity: Sensitivity,
    ) -> Result<Box<dyn VoiceActivityClassifier>> {
        let rule = self
            .rule
            .clone()
            .ok_or_else(|| ParleyError::ClassifierUnavailable("scripted backend offline".into()))?;
        Ok(Box::new(ScriptedClassifier { rule, rate }))
    }
}

struct ScriptedClassifier {
    rule: Rule,
    rate: SampleRate,
}

impl VoiceActivityClassifier for ScriptedClassifier {
    fn classify(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
        check_frame_len(frame, self.rate)?;
        Ok(if (self.rule)(frame) {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
