//! AI text helper seam.
//!
//! The surrounding application offers assisted writing (rewrite a report
//! professionally, classify a safety-deviation risk, summarize dashboard
//! counts, generate a product image for a stock item). The engine treats the
//! provider as an opaque, possibly-unavailable remote call behind the
//! [`TextAssist`] trait; the degradation helpers encode the one contract that
//! matters here: **any failure degrades to the original input** (or a neutral
//! default), never to an error the caller has to handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum AssistError {
    #[error("assist provider is not configured")]
    Unavailable,
    #[error("assist provider error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub suggestion: String,
    pub risk_level: RiskLevel,
}

impl RiskAssessment {
    /// The assessment returned when no provider is reachable.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            suggestion: "N/A".to_string(),
            risk_level: RiskLevel::Medium,
        }
    }
}

/// An external AI text/image helper.
#[async_trait]
pub trait TextAssist: Send + Sync {
    /// Rewrite `text` to be more professional and concise for `context`.
    async fn improve_text(&self, text: &str, context: &str) -> Result<String, AssistError>;

    /// Suggest a corrective action and risk level for a safety report.
    async fn assess_risk(&self, description: &str) -> Result<RiskAssessment, AssistError>;

    /// Brief operational summary of pre-aggregated dashboard counts.
    async fn summarize(&self, data_context: &str) -> Result<String, AssistError>;

    /// Generate a product image, returned as a data-URL payload.
    async fn generate_product_image(
        &self,
        product_name: &str,
        details: Option<&str>,
    ) -> Result<Option<String>, AssistError>;
}

/// The unconfigured provider: every call fails as `Unavailable`.
pub struct NoAssist;

#[async_trait]
impl TextAssist for NoAssist {
    async fn improve_text(&self, _: &str, _: &str) -> Result<String, AssistError> {
        Err(AssistError::Unavailable)
    }
    async fn assess_risk(&self, _: &str) -> Result<RiskAssessment, AssistError> {
        Err(AssistError::Unavailable)
    }
    async fn summarize(&self, _: &str) -> Result<String, AssistError> {
        Err(AssistError::Unavailable)
    }
    async fn generate_product_image(
        &self,
        _: &str,
        _: Option<&str>,
    ) -> Result<Option<String>, AssistError> {
        Err(AssistError::Unavailable)
    }
}

/// Improve `text`, falling back to the original on any failure.
pub async fn improve_or_original(assist: &dyn TextAssist, text: &str, context: &str) -> String {
    match assist.improve_text(text, context).await {
        Ok(improved) => improved,
        Err(e) => {
            warn!(error = %e, "Text assist failed; keeping original text");
            text.to_string()
        }
    }
}

/// Assess risk, falling back to the neutral default on any failure.
pub async fn assess_or_default(assist: &dyn TextAssist, description: &str) -> RiskAssessment {
    match assist.assess_risk(description).await {
        Ok(assessment) => assessment,
        Err(e) => {
            warn!(error = %e, "Risk assessment failed; using neutral default");
            RiskAssessment::unavailable()
        }
    }
}
