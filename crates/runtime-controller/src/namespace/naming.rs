//! Namespace name computation from the configured template

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{dns_label, Subject};

pub const PLACEHOLDER_USERNAME: &str = "<username>";
pub const PLACEHOLDER_USERID: &str = "<userid>";
pub const PLACEHOLDER_WORKSPACEID: &str = "<workspaceid>";

const MAX_NAME_LEN: usize = 63;
const SUFFIX_LEN: usize = 8;

/// Everything a namespace name may be derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceResolutionContext {
    pub subject: Subject,
    pub workspace_id: Option<String>,
}

impl NamespaceResolutionContext {
    #[must_use]
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            workspace_id: None,
        }
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }
}

/// Evaluate `template` for the context. Pure and deterministic.
///
/// Names that only change case when sanitized are used as is. Any other
/// loss (replaced characters, truncation) appends a hash of the unsanitized
/// name, so different users never share a sanitized name.
pub fn evaluate_template(template: &str, ctx: &NamespaceResolutionContext) -> Result<String> {
    let mut name = template
        .replace(PLACEHOLDER_USERNAME, &ctx.subject.user_name)
        .replace(PLACEHOLDER_USERID, &ctx.subject.user_id);

    if name.contains(PLACEHOLDER_WORKSPACEID) {
        let workspace_id = ctx.workspace_id.as_deref().ok_or_else(|| {
            Error::Internal(format!(
                "Namespace template '{template}' needs a workspace id to be resolved"
            ))
        })?;
        name = name.replace(PLACEHOLDER_WORKSPACEID, workspace_id);
    }

    let label = dns_label(&name);
    if label.is_empty() {
        return Err(Error::Internal(format!(
            "Namespace template '{template}' evaluates to an empty name for user '{}'",
            ctx.subject.user_name
        )));
    }
    if label == name.to_lowercase() {
        return Ok(label);
    }

    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let head: String = label.chars().take(MAX_NAME_LEN - SUFFIX_LEN - 1).collect();
    Ok(format!(
        "{}-{}",
        head.trim_end_matches('-'),
        &digest[..SUFFIX_LEN]
    ))
}
