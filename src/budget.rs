//! Structured budget produced by the budget synthesis pass.
//!
//! Model output is loose: numbers may arrive as strings, totals may be
//! missing or inconsistent. [`Budget::normalize`] recomputes every derived
//! figure from the line items so that
//! `total == subtotal + administrative_cost + contingency_amount` and
//! `subtotal == sum(item.total_cost)` always hold.

use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Currency requested from the structured client.
pub const DEFAULT_CURRENCY: &str = "USD";

/// GTQ per USD used in budget prompts.
pub const DEFAULT_EXCHANGE_RATE: f64 = 7.75;

/// Category used for items the model left uncategorized.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Relative tolerance of the totals invariant.
const TOLERANCE: f64 = 1e-6;

/// One budget line.
///
/// Amounts are read leniently: `"1,200.50"`, `"Q 1.200,50"` and `"$300"`
/// all parse. A numeric field the model filled with text that is not an
/// amount reads as zero and is listed in `unreadable`, so
/// [`Budget::normalize`] can flag the line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawBudgetItem")]
pub struct BudgetItem {
    /// Line code (`X.Y.Z`)
    pub code: String,
    /// Activity code (`AX.Y`)
    pub activity_code: String,
    /// Cost category
    pub category: String,
    /// Line description
    pub description: String,
    /// Unit of measure
    pub unit: String,
    /// Number of units
    pub quantity: f64,
    /// Cost per unit
    pub unit_cost: f64,
    /// Months the cost recurs
    pub months: f64,
    /// Line total; computed when absent
    pub total_cost: Option<f64>,
    /// Why the line is needed
    pub justification: String,
    /// Numeric fields that could not be read, as `field = raw`
    #[serde(skip)]
    pub unreadable: Vec<String>,
}

/// Wire shape of a budget line before its amounts are read.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBudgetItem {
    code: String,
    activity_code: String,
    category: String,
    description: String,
    unit: String,
    quantity: Value,
    unit_cost: Value,
    months: Value,
    total_cost: Value,
    justification: String,
}

impl From<RawBudgetItem> for BudgetItem {
    fn from(raw: RawBudgetItem) -> Self {
        let mut unreadable = Vec::new();
        let mut read = |field: &str, value: &Value| {
            let amount = parse_number(value);
            if amount.is_none() && !value.is_null() {
                unreadable.push(format!("{field} = {value}"));
            }
            amount
        };

        let quantity = read("quantity", &raw.quantity).unwrap_or(0.0);
        let unit_cost = read("unit_cost", &raw.unit_cost).unwrap_or(0.0);
        let months = read("months", &raw.months).unwrap_or(0.0);
        let total_cost = read("total_cost", &raw.total_cost);

        Self {
            code: raw.code,
            activity_code: raw.activity_code,
            category: raw.category,
            description: raw.description,
            unit: raw.unit,
            quantity,
            unit_cost,
            months,
            total_cost,
            justification: raw.justification,
            unreadable,
        }
    }
}

impl BudgetItem {
    /// Returns the line total, computing it from quantities when absent.
    #[must_use]
    pub fn line_total(&self) -> f64 {
        self.total_cost
            .filter(|total| total.is_finite())
            .unwrap_or_else(|| self.quantity * self.unit_cost * self.months.max(1.0))
    }

    fn category_or_default(&self) -> &str {
        let category = self.category.trim();
        if category.is_empty() { UNCATEGORIZED } else { category }
    }

    fn label(&self, position: usize) -> String {
        [&self.description, &self.code]
            .into_iter()
            .map(|text| text.trim())
            .find(|text| !text.is_empty())
            .map_or_else(|| format!("#{}", position + 1), str::to_string)
    }
}

/// Financial totals of a budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinancialTotals {
    /// Sum of all line totals
    #[serde(deserialize_with = "lenient_f64")]
    pub subtotal: f64,
    /// Administrative (indirect) cost
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub administrative_cost: Option<f64>,
    /// Contingency reserve
    #[serde(deserialize_with = "lenient_opt_f64")]
    pub contingency_amount: Option<f64>,
    /// Grand total
    #[serde(deserialize_with = "lenient_f64")]
    pub total: f64,
}

/// Rates used to fill missing administrative and contingency amounts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetRates {
    /// Administrative cost as a fraction of the subtotal
    pub administrative: f64,
    /// Contingency as a fraction of the subtotal
    pub contingency: f64,
    /// Donor ceiling on indirect costs, if any
    pub indirect_limit: Option<f64>,
    /// Categories the donor expects every budget to carry
    pub required_categories: &'static [&'static str],
}

impl Default for BudgetRates {
    fn default() -> Self {
        Self {
            administrative: 0.08,
            contingency: 0.05,
            indirect_limit: None,
            required_categories: &[],
        }
    }
}

/// Rating of the cost per direct beneficiary against benchmarks for rural
/// development projects in Guatemala.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostRating {
    /// Up to 200 per beneficiary
    Excellent,
    /// Up to 400
    VeryGood,
    /// Up to 600
    Good,
    /// Up to 1000
    Acceptable,
    /// Above 1000
    NeedsJustification,
}

impl CostRating {
    /// Rates a cost per direct beneficiary.
    #[must_use]
    pub fn for_cost(cost_per_beneficiary: f64) -> Self {
        match cost_per_beneficiary {
            c if c <= 200.0 => Self::Excellent,
            c if c <= 400.0 => Self::VeryGood,
            c if c <= 600.0 => Self::Good,
            c if c <= 1000.0 => Self::Acceptable,
            _ => Self::NeedsJustification,
        }
    }
}

/// Cost efficiency of a budget relative to the people it reaches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEffectiveness {
    /// Grand total per direct beneficiary
    pub cost_per_direct_beneficiary: f64,
    /// Grand total per direct plus indirect beneficiary
    pub cost_per_total_beneficiary: f64,
    /// Benchmark rating of the direct cost
    pub rating: CostRating,
}

/// A line-item budget.
///
/// A failed run still yields a `Budget`: empty, zero totals, with `error`
/// set. Unknown fields returned by the model are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    /// Currency code
    pub currency: String,
    /// Local currency per unit of `currency`
    #[serde(deserialize_with = "lenient_f64")]
    pub exchange_rate: f64,
    /// Project duration
    #[serde(deserialize_with = "lenient_opt_f64", skip_serializing_if = "Option::is_none")]
    pub project_duration_months: Option<f64>,
    /// Line items
    pub items: Vec<BudgetItem>,
    /// Sum of line totals per category
    pub summary_by_category: BTreeMap<String, f64>,
    /// Derived totals
    pub financial_totals: FinancialTotals,
    /// Costing assumptions
    pub assumptions: Vec<String>,
    /// Donor compliance notes
    pub compliance_notes: Vec<String>,
    /// Cost per beneficiary, when the project states its beneficiaries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_effectiveness: Option<CostEffectiveness>,
    /// Error message of a failed run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification of a failed run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Run statistics attached to a failed run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_stats: Option<Value>,
    /// Creation time of a failed run (RFC 3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            currency: DEFAULT_CURRENCY.to_string(),
            exchange_rate: DEFAULT_EXCHANGE_RATE,
            project_duration_months: None,
            items: Vec::new(),
            summary_by_category: BTreeMap::new(),
            financial_totals: FinancialTotals::default(),
            assumptions: Vec::new(),
            compliance_notes: Vec::new(),
            cost_effectiveness: None,
            error: None,
            error_type: None,
            processing_stats: None,
            generated_at: None,
            extra: BTreeMap::new(),
        }
    }
}

impl Budget {
    /// Builds the error-shaped budget of a failed run.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            assumptions: vec![format!("Generation error: {message}")],
            error: Some(message),
            error_type: Some("generation_failure".to_string()),
            generated_at: Some(chrono::Local::now().to_rfc3339()),
            ..Self::default()
        }
    }

    /// Parses the structured client's JSON value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the value is not a budget object.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Returns true if this is the error shape.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Returns the grand total.
    #[must_use]
    pub const fn total(&self) -> f64 {
        self.financial_totals.total
    }

    /// Recomputes every derived figure from the line items.
    ///
    /// Line totals missing from the model output are computed as
    /// `quantity * unit_cost * max(months, 1)`. Administrative and
    /// contingency amounts the model supplied are kept; missing ones are
    /// filled from `rates`. Lines with unreadable amounts become assumption
    /// notes; donor ceiling and category gaps become compliance notes.
    pub fn normalize(&mut self, rates: &BudgetRates) {
        let mut subtotal = 0.0;
        let mut by_category = BTreeMap::new();
        let mut unreadable_notes = Vec::new();

        for (position, item) in self.items.iter_mut().enumerate() {
            if !item.unreadable.is_empty() {
                unreadable_notes.push(format!(
                    "Line '{}' has amounts that could not be read ({}); they count as 0",
                    item.label(position),
                    item.unreadable.join(", ")
                ));
            }
            let line_total = item.line_total();
            item.total_cost = Some(line_total);
            subtotal += line_total;
            *by_category
                .entry(item.category_or_default().to_string())
                .or_insert(0.0) += line_total;
        }

        let totals = &mut self.financial_totals;
        let administrative = *totals
            .administrative_cost
            .get_or_insert(subtotal * rates.administrative);
        let contingency = *totals
            .contingency_amount
            .get_or_insert(subtotal * rates.contingency);
        totals.subtotal = subtotal;
        totals.total = subtotal + administrative + contingency;
        self.summary_by_category = by_category;

        for note in unreadable_notes {
            push_unique(&mut self.assumptions, note);
        }

        if let Some(limit) = rates.indirect_limit {
            if subtotal > 0.0 && administrative / subtotal > limit + TOLERANCE {
                let note = format!(
                    "Indirect cost rate {:.1}% exceeds donor limit of {:.1}%",
                    administrative / subtotal * 100.0,
                    limit * 100.0
                );
                push_unique(&mut self.compliance_notes, note);
            }
        }

        let missing = self.missing_categories(rates.required_categories);
        if !missing.is_empty() {
            let note = format!("Missing required budget categories: {}", missing.join(", "));
            push_unique(&mut self.compliance_notes, note);
        }
    }

    /// Returns the `required` categories no line item carries, compared
    /// case-insensitively.
    #[must_use]
    pub fn missing_categories<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        let present: Vec<String> = self
            .items
            .iter()
            .map(|item| item.category.trim().to_lowercase())
            .collect();

        required
            .iter()
            .copied()
            .filter(|category| !present.contains(&category.to_lowercase()))
            .collect()
    }

    /// Computes cost per beneficiary from the grand total.
    ///
    /// Without direct beneficiaries there is nothing to rate and the field
    /// is cleared.
    pub fn assess_cost_effectiveness(&mut self, direct: u64, indirect: u64) {
        self.cost_effectiveness = (direct > 0).then(|| {
            let per_direct = self.total() / direct as f64;
            CostEffectiveness {
                cost_per_direct_beneficiary: per_direct,
                cost_per_total_beneficiary: self.total() / direct.saturating_add(indirect) as f64,
                rating: CostRating::for_cost(per_direct),
            }
        });
    }

    /// Returns true if the totals agree with the items.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let totals = &self.financial_totals;
        let items_sum: f64 = self.items.iter().map(BudgetItem::line_total).sum();
        let category_sum: f64 = self.summary_by_category.values().sum();
        let expected_total = totals.subtotal
            + totals.administrative_cost.unwrap_or(0.0)
            + totals.contingency_amount.unwrap_or(0.0);

        approx_eq(items_sum, totals.subtotal)
            && approx_eq(category_sum, totals.subtotal)
            && approx_eq(expected_total, totals.total)
    }
}

fn push_unique(notes: &mut Vec<String>, note: String) {
    if !notes.contains(&note) {
        notes.push(note);
    }
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

/// JSON schema passed to the structured client and rendered into budget
/// prompts.
#[must_use]
pub fn budget_schema() -> Value {
    let number = json!({ "type": "number" });
    let string = json!({ "type": "string" });

    json!({
        "type": "object",
        "required": ["currency", "items", "summary_by_category", "financial_totals"],
        "properties": {
            "currency": { "type": "string", "default": DEFAULT_CURRENCY },
            "exchange_rate": { "type": "number", "default": DEFAULT_EXCHANGE_RATE },
            "project_duration_months": number,
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["category", "description", "quantity", "unit_cost", "total_cost"],
                    "properties": {
                        "code": { "type": "string", "description": "X.Y.Z" },
                        "activity_code": { "type": "string", "description": "AX.Y" },
                        "category": string,
                        "description": string,
                        "unit": string,
                        "quantity": number,
                        "unit_cost": number,
                        "months": number,
                        "total_cost": number,
                        "justification": string
                    }
                }
            },
            "summary_by_category": {
                "type": "object",
                "additionalProperties": number
            },
            "financial_totals": {
                "type": "object",
                "properties": {
                    "subtotal": number,
                    "administrative_cost": number,
                    "contingency_amount": number,
                    "total": number
                }
            },
            "assumptions": { "type": "array", "items": string },
            "compliance_notes": { "type": "array", "items": string }
        }
    })
}

fn lenient_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(parse_number(&Value::deserialize(deserializer)?))
}

fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_f64(deserializer)?.unwrap_or(0.0))
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Reads an amount the way models write them: `1200`, `"1,200.50"`,
/// `"Q 1.200,50"`, `"$300"`, `"1 200 USD"`.
///
/// Currency symbols and upper-case currency codes around the number are
/// ignored. When both `.` and `,` appear, the last one is the decimal mark.
/// A lone `,` followed by one or two digits is a decimal mark; otherwise
/// `,` groups thousands. A lone `.` is a decimal mark and repeated `.`
/// group thousands. Text such as `"300 por mes"` is not an amount.
fn parse_amount(text: &str) -> Option<f64> {
    let is_currency = |c: char| c.is_whitespace() || c.is_uppercase() || matches!(c, '$' | '€' | '£');

    let trimmed = text.trim_matches(is_currency);
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start_matches(is_currency)),
        None => (false, trimmed),
    };

    let compact: String = unsigned.chars().filter(|c| !c.is_whitespace()).collect();
    if !compact.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let amount: f64 = if compact.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | ',')) {
        resolve_separators(&compact)?.parse().ok()?
    } else {
        compact.parse().ok()?
    };

    let amount = if negative { -amount } else { amount };
    amount.is_finite().then_some(amount)
}

/// Rewrites digits with `.`/`,` separators into a plain decimal literal.
fn resolve_separators(digits: &str) -> Option<String> {
    match (digits.rfind('.'), digits.rfind(',')) {
        (Some(dot), Some(comma)) => {
            let (decimal, group) = if dot > comma { ('.', ',') } else { (',', '.') };
            let (int, frac) = digits.rsplit_once(decimal)?;
            Some(format!("{}.{frac}", ungroup(int, group)?))
        }
        (None, Some(_)) => resolve_single(digits, ','),
        (Some(_), None) => resolve_single(digits, '.'),
        (None, None) => Some(digits.to_string()),
    }
}

fn resolve_single(digits: &str, separator: char) -> Option<String> {
    let (int, frac) = digits.rsplit_once(separator)?;
    let is_decimal = digits.matches(separator).count() == 1
        && (separator == '.' || (1..=2).contains(&frac.len()));

    if is_decimal {
        Some(format!("{int}.{frac}"))
    } else {
        ungroup(digits, separator)
    }
}

/// Removes thousands separators, requiring groups of three digits after a
/// leading group of one to three.
fn ungroup(int: &str, separator: char) -> Option<String> {
    if !int.contains(separator) {
        return Some(int.to_string());
    }

    let mut groups = int.split(separator);
    let leading = groups.next()?;
    let valid = (1..=3).contains(&leading.len())
        && leading.chars().all(|c| c.is_ascii_digit())
        && groups.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()));

    valid.then(|| int.replace(separator, ""))
}
