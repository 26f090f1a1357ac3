use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use tera::Tera;

/// Maximum template file size (1MB)
const MAX_TEMPLATE_SIZE: u64 = 1024 * 1024;

/// Variables that custom templates commonly use but may leave out
const OPTIONAL_VARIABLES: &[&str] = &["language", "location", "donor", "extra_fields"];

/// Validates custom prompt templates
pub(crate) struct TemplateValidator;

impl TemplateValidator {
    /// Validates a custom template file
    ///
    /// Performs the following checks:
    /// 1. File exists and is a regular file
    /// 2. File size is within limits
    /// 3. Template is not blank
    /// 4. Template syntax is valid (can be compiled by Tera)
    /// 5. Template references every variable in `required`
    ///
    /// # Errors
    ///
    /// Returns an error if any check fails.
    pub(crate) fn validate_template(path: &Path, required: &[&str]) -> Result<()> {
        if !path.exists() {
            return Err(Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "Template file not found"),
            ));
        }

        if !path.is_file() {
            return Err(Error::template_validation(
                path.to_string_lossy(),
                "Path is not a file",
            ));
        }

        let metadata = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        if metadata.len() > MAX_TEMPLATE_SIZE {
            return Err(Error::template_validation(
                path.to_string_lossy(),
                format!(
                    "Template file too large: {} bytes (max: {} bytes)",
                    metadata.len(),
                    MAX_TEMPLATE_SIZE
                ),
            ));
        }

        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

        if content.trim().is_empty() {
            return Err(Error::template_validation(
                path.to_string_lossy(),
                "Template file is empty",
            ));
        }

        let mut temp_tera = Tera::default();
        temp_tera
            .add_raw_template("validation", &content)
            .map_err(|e| {
                Error::template_validation(
                    path.to_string_lossy(),
                    format!("Template syntax error: {e}"),
                )
            })?;

        Self::check_required_variables(&content, path, required)?;
        Self::check_optional_variables(&content);

        Ok(())
    }

    /// Checks if the template references the required variables
    ///
    /// Searches for `ctx.<name>` in the template text. Good enough to catch
    /// a template written against the wrong context.
    fn check_required_variables(content: &str, path: &Path, required: &[&str]) -> Result<()> {
        let missing: Vec<&str> = required
            .iter()
            .filter(|var| !content.contains(&format!("ctx.{var}")))
            .copied()
            .collect();

        if !missing.is_empty() {
            return Err(Error::template_validation(
                path.to_string_lossy(),
                format!(
                    "Template may be missing required variables: {}. \n\
                    Templates should access: {}. \n\
                    See built-in templates for reference.",
                    missing.join(", "),
                    required
                        .iter()
                        .map(|var| format!("ctx.{var}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Checks for optional variables and logs debug information
    fn check_optional_variables(content: &str) {
        for var in OPTIONAL_VARIABLES {
            if !content.contains(&format!("ctx.{var}")) {
                tracing::debug!("Template does not use optional variable: {}", var);
            }
        }
    }
}
