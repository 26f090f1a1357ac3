use crate::{
    budget::{DEFAULT_CURRENCY, DEFAULT_EXCHANGE_RATE, budget_schema},
    chunk::Chunk,
    config::Config,
    donor::DonorStandards,
    error::{Error, Result},
    project::ProjectMetadata,
    template_validator::TemplateValidator,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tera::{Context, Tera, Value};
use tracing::debug;

/// Template rendering one chunk for the extraction phase.
pub const EXTRACTION_TEMPLATE: &str = "extraction.tera";
/// Template rendering the final narrative request.
pub const NARRATIVE_TEMPLATE: &str = "narrative.tera";
/// Template rendering the final budget request.
pub const BUDGET_TEMPLATE: &str = "budget.tera";
/// Shared project information block included by the other templates.
pub const PROJECT_TEMPLATE: &str = "project.tera";

/// Project fields rendered by the project block itself; every other field
/// is listed as additional information.
const KNOWN_FIELDS: &[&str] = &[
    "title",
    "country",
    "department",
    "municipality",
    "community",
    "coverage_type",
    "donor",
    "duration_months",
    "budget_cap",
    "beneficiaries_direct",
    "beneficiaries_indirect",
    "demographic_focus",
    "org_profile",
    "language",
];

/// Budget duration assumed when the project does not state one.
const DEFAULT_DURATION_MONTHS: f64 = 24.0;

/// Final artifact a run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Free-text proposal narrative (prose client)
    Narrative,
    /// Structured line-item budget (structured client)
    Budget,
}

impl TaskKind {
    /// Returns the ID string for this task.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Narrative => "narrative",
            Self::Budget => "budget",
        }
    }

    /// Returns all task kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Narrative, Self::Budget]
    }

    /// Returns the synthesis template for this task.
    #[must_use]
    pub const fn template_name(self) -> &'static str {
        match self {
            Self::Narrative => NARRATIVE_TEMPLATE,
            Self::Budget => BUDGET_TEMPLATE,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|task| task.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::config(format!("Unknown task kind: {s}")))
    }
}

#[derive(Serialize)]
struct PromptContext<'a> {
    language: &'static str,
    project: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    extra_fields: Vec<ExtraField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    donor: Option<DonorStandards>,
    #[serde(skip_serializing_if = "Option::is_none")]
    indirect_percent: Option<String>,
    content: &'a str,
    is_consolidated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk: Option<ChunkView<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<String>,
    currency: &'static str,
    exchange_rate: f64,
    duration_months: String,
}

#[derive(Serialize)]
struct ExtraField {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct ChunkView<'a> {
    index: String,
    section: &'a str,
    position: usize,
    total: usize,
    tokens_estimated: usize,
}

/// Renders extraction and synthesis prompts.
///
/// Rendering is pure: the same inputs always yield the same prompt.
pub struct PromptBuilder {
    tera: Tera,
    donor_standards: bool,
}

impl PromptBuilder {
    /// Creates a prompt builder from configuration.
    ///
    /// Templates found in `config.template_dir` replace the built-in ones
    /// with the same name after validation.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in template fails to compile or a custom
    /// template fails validation.
    pub fn new(config: &Config) -> Result<Self> {
        let mut tera = Tera::default();

        Self::register_builtin_templates(&mut tera)?;

        if let Some(dir) = &config.template_dir {
            Self::register_custom_templates(&mut tera, dir)?;
        }

        Self::register_filters(&mut tera);

        Ok(Self {
            tera,
            donor_standards: config.donor_standards,
        })
    }

    fn register_builtin_templates(tera: &mut Tera) -> Result<()> {
        tera.add_raw_templates(vec![
            (PROJECT_TEMPLATE, include_str!("../templates/project.tera")),
            (EXTRACTION_TEMPLATE, include_str!("../templates/extraction.tera")),
            (NARRATIVE_TEMPLATE, include_str!("../templates/narrative.tera")),
            (BUDGET_TEMPLATE, include_str!("../templates/budget.tera")),
        ])
        .map_err(|e| Error::template("built-in", &e))
    }

    fn register_custom_templates(tera: &mut Tera, dir: &Path) -> Result<()> {
        for name in [PROJECT_TEMPLATE, EXTRACTION_TEMPLATE, NARRATIVE_TEMPLATE, BUDGET_TEMPLATE] {
            let path = dir.join(name);
            if !path.is_file() {
                continue;
            }

            TemplateValidator::validate_template(&path, required_variables(name))?;
            tera.add_template_file(&path, Some(name))
                .map_err(|e| Error::template(name, &e))?;
            debug!("Using custom template {}", path.display());
        }
        Ok(())
    }

    fn register_filters(tera: &mut Tera) {
        tera.register_filter("thousands", Self::thousands_filter);
    }

    /// Groups the digits of whole numbers: `250000` becomes `250,000`.
    /// Anything else passes through unchanged.
    fn thousands_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
        let number = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };

        match number {
            Some(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Ok(Value::String(group_digits(n as i64)))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Renders the per-chunk extraction prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if template rendering fails.
    pub fn build_extraction_prompt(
        &self,
        chunk: &Chunk,
        total_chunks: usize,
        project: &ProjectMetadata,
    ) -> Result<String> {
        let mut context = self.base_context(&chunk.content, project, false);
        context.donor = None;
        context.indirect_percent = None;
        context.chunk = Some(ChunkView {
            index: chunk.index.to_string(),
            section: &chunk.section,
            position: chunk.position,
            total: total_chunks,
            tokens_estimated: chunk.tokens_estimated,
        });

        self.render(EXTRACTION_TEMPLATE, &context)
    }

    /// Renders the final prompt from the consolidated extraction text.
    ///
    /// # Errors
    ///
    /// Returns an error if template rendering fails.
    pub fn build_synthesis_prompt(
        &self,
        consolidated: &str,
        project: &ProjectMetadata,
        task: TaskKind,
    ) -> Result<String> {
        self.render_task(consolidated, project, task, true)
    }

    /// Renders the final prompt directly from source text, for documents
    /// that fit in a single chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if template rendering fails.
    pub fn build_direct_prompt(
        &self,
        content: &str,
        project: &ProjectMetadata,
        task: TaskKind,
    ) -> Result<String> {
        self.render_task(content, project, task, false)
    }

    fn render_task(
        &self,
        content: &str,
        project: &ProjectMetadata,
        task: TaskKind,
        is_consolidated: bool,
    ) -> Result<String> {
        let mut context = self.base_context(content, project, is_consolidated);
        if task == TaskKind::Budget {
            context.schema = Some(serde_json::to_string_pretty(&budget_schema())?);
        }

        self.render(task.template_name(), &context)
    }

    fn base_context<'a>(
        &self,
        content: &'a str,
        project: &ProjectMetadata,
        is_consolidated: bool,
    ) -> PromptContext<'a> {
        let fields = project.display_fields();
        let donor = self
            .donor_standards
            .then(|| DonorStandards::for_donor(project.donor().as_deref()));

        let location = ["community", "municipality", "department"]
            .iter()
            .filter_map(|key| fields.get(*key).map(String::as_str))
            .collect::<Vec<_>>()
            .join(", ");

        let extra_fields = fields
            .iter()
            .filter(|(key, _)| !KNOWN_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| ExtraField {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        let duration = project.duration_months().unwrap_or(DEFAULT_DURATION_MONTHS);

        PromptContext {
            language: project.language().code(),
            location: (!location.is_empty()).then_some(location),
            extra_fields,
            indirect_percent: donor
                .as_ref()
                .and_then(|d| d.indirect_rate)
                .map(|rate| format!("{:.0}", rate * 100.0)),
            donor,
            project: fields,
            content,
            is_consolidated,
            chunk: None,
            schema: None,
            currency: DEFAULT_CURRENCY,
            exchange_rate: DEFAULT_EXCHANGE_RATE,
            duration_months: format_months(duration),
        }
    }

    fn render(&self, template_name: &str, context: &PromptContext<'_>) -> Result<String> {
        let mut tera_context = Context::new();
        tera_context.insert("ctx", context);

        let rendered = self
            .tera
            .render(template_name, &tera_context)
            .map_err(|e| Error::template(template_name, &e))?;

        debug!("Rendered {} ({} chars)", template_name, rendered.len());
        Ok(rendered)
    }
}

/// Variables each template must reference.
pub(crate) fn required_variables(template_name: &str) -> &'static [&'static str] {
    match template_name {
        EXTRACTION_TEMPLATE => &["chunk", "content"],
        BUDGET_TEMPLATE => &["content", "schema"],
        PROJECT_TEMPLATE => &["project"],
        _ => &["content"],
    }
}

fn format_months(months: f64) -> String {
    if months.fract() == 0.0 {
        format!("{months:.0}")
    } else {
        format!("{months}")
    }
}

fn group_digits(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        grouped.push('-');
    }
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}
