//! Donor standards injected into proposal prompts.
//!
//! Each supported donor has a results framework, a methodological approach,
//! an indicator system, cross-cutting requirements and (for most) a ceiling
//! on indirect costs and a list of expected budget categories. Unknown
//! donors fall back to BID.

use serde::{Deserialize, Serialize};

/// Supported donor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DonorKind {
    /// United States Agency for International Development
    Usaid,
    /// Banco Interamericano de Desarrollo (IDB)
    #[default]
    Bid,
    /// Deutsche Gesellschaft für Internationale Zusammenarbeit
    Giz,
    /// Agencia Española de Cooperación Internacional para el Desarrollo
    Aecid,
}

impl DonorKind {
    /// Returns the ID string for this donor.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Usaid => "USAID",
            Self::Bid => "BID",
            Self::Giz => "GIZ",
            Self::Aecid => "AECID",
        }
    }

    /// Returns all supported donors.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Usaid, Self::Bid, Self::Giz, Self::Aecid]
    }

    /// Parses a donor name case-insensitively.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "USAID" => Some(Self::Usaid),
            "BID" | "IDB" | "IADB" => Some(Self::Bid),
            "GIZ" => Some(Self::Giz),
            "AECID" => Some(Self::Aecid),
            _ => None,
        }
    }
}

/// Standards a proposal for a given donor should follow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DonorStandards {
    /// Donor these standards belong to
    pub kind: DonorKind,
    /// Results or programming framework
    pub framework: &'static str,
    /// Methodological approach
    pub approach: &'static str,
    /// Indicator system
    pub indicators: &'static str,
    /// Cross-cutting requirements
    pub requirements: &'static str,
    /// Ceiling on indirect costs as a fraction of direct costs
    pub indirect_rate: Option<f64>,
    /// Budget categories the donor expects to see
    pub budget_categories: &'static [&'static str],
}

impl DonorStandards {
    /// Creates the standards for the given donor.
    #[must_use]
    pub const fn for_kind(kind: DonorKind) -> Self {
        match kind {
            DonorKind::Usaid => Self::usaid(),
            DonorKind::Bid => Self::bid(),
            DonorKind::Giz => Self::giz(),
            DonorKind::Aecid => Self::aecid(),
        }
    }

    /// Resolves a free-form donor name, falling back to BID.
    #[must_use]
    pub fn for_donor(name: Option<&str>) -> Self {
        Self::for_kind(name.and_then(DonorKind::from_name).unwrap_or_default())
    }

    const fn usaid() -> Self {
        Self {
            kind: DonorKind::Usaid,
            framework: "USAID Program Cycle",
            approach: "Results Framework, Theory of Change, CLA (Collaborating, Learning & Adapting)",
            indicators: "USAID Standard Indicators, custom indicators aligned with Country Development Cooperation Strategy",
            requirements: "Gender integration, environmental compliance, sustainability planning",
            indirect_rate: Some(0.10),
            budget_categories: &[
                "Personnel",
                "Fringe Benefits",
                "Travel",
                "Equipment",
                "Supplies",
                "Contractual",
                "Other Direct Costs",
                "Indirect Costs",
            ],
        }
    }

    const fn bid() -> Self {
        Self {
            kind: DonorKind::Bid,
            framework: "Marco de Efectividad en el Desarrollo (DEF)",
            approach: "Enfoque de Gestión por Resultados, Teoría del Cambio robusta",
            indicators: "Indicadores SMART alineados con ODS y marcos nacionales",
            requirements: "Salvaguardas ambientales y sociales, análisis de género, sostenibilidad fiscal",
            indirect_rate: Some(0.08),
            budget_categories: &[
                "Recursos Humanos",
                "Consultorías",
                "Viajes y Viáticos",
                "Equipamiento",
                "Materiales e Insumos",
                "Servicios",
                "Gastos de Funcionamiento",
                "Auditorías",
            ],
        }
    }

    const fn giz() -> Self {
        Self {
            kind: DonorKind::Giz,
            framework: "Capacity WORKS, Results-Based Monitoring",
            approach: "Enfoque por competencias, desarrollo de capacidades sostenibles",
            indicators: "Indicadores de impacto, outcome y output con líneas base",
            requirements: "Do No Harm, análisis de conflicto, enfoque sistémico",
            indirect_rate: Some(0.07),
            budget_categories: &[
                "Personal",
                "Viajes",
                "Material/Equipos",
                "Servicios Externos",
                "Costos Operativos",
                "Overhead Institucional",
            ],
        }
    }

    const fn aecid() -> Self {
        Self {
            kind: DonorKind::Aecid,
            framework: "Marco de Asociación País, Enfoque Basado en Derechos Humanos",
            approach: "Teoría del Cambio participativa, enfoque territorial",
            indicators: "Indicadores alineados con Agenda 2030 y prioridades nacionales",
            requirements: "Pertinencia cultural, apropiación nacional, complementariedad",
            indirect_rate: None,
            budget_categories: &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_donors_resolve() {
        for kind in DonorKind::all() {
            assert_eq!(DonorKind::from_name(kind.id()), Some(*kind));
            assert_eq!(DonorStandards::for_kind(*kind).kind, *kind);
        }
    }

    #[test]
    fn test_unknown_donor_falls_back_to_bid() {
        assert_eq!(DonorStandards::for_donor(Some("Fundación X")).kind, DonorKind::Bid);
        assert_eq!(DonorStandards::for_donor(None).kind, DonorKind::Bid);
    }

    #[test]
    fn test_aliases_and_case() {
        assert_eq!(DonorKind::from_name("usaid"), Some(DonorKind::Usaid));
        assert_eq!(DonorKind::from_name(" IDB "), Some(DonorKind::Bid));
    }

    #[test]
    fn test_indirect_rates() {
        assert_eq!(DonorStandards::for_kind(DonorKind::Usaid).indirect_rate, Some(0.10));
        assert_eq!(DonorStandards::for_kind(DonorKind::Giz).indirect_rate, Some(0.07));
        assert_eq!(DonorStandards::for_kind(DonorKind::Aecid).indirect_rate, None);
    }

    #[test]
    fn test_budget_categories() {
        let usaid = DonorStandards::for_kind(DonorKind::Usaid);
        assert_eq!(usaid.budget_categories.len(), 8);
        assert!(usaid.budget_categories.contains(&"Indirect Costs"));
        assert!(DonorStandards::for_kind(DonorKind::Giz).budget_categories.contains(&"Personal"));
        assert!(DonorStandards::for_kind(DonorKind::Aecid).budget_categories.is_empty());
    }
}
