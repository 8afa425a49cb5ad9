//! Registry of per-stage output contracts.
//!
//! Every analysis stage maps to a [`StageKind`], and every kind owns a
//! [`StageSchema`]: the mandatory top-level keys its JSON must carry and the
//! minimum content length below which the validator warns. Stage titles
//! from configuration are matched to kinds by a normalized identifier;
//! explicit per-stage overrides in configuration win over the built-ins.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::StageConfig;

/// Known analysis stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    ProcessOverview,
    Parties,
    Strategy,
    Risks,
    FinancialBalance,
    Deadlines,
    Evidence,
    Conclusions,
    Generic,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::ProcessOverview => "process_overview",
            StageKind::Parties => "parties",
            StageKind::Strategy => "strategy",
            StageKind::Risks => "risks",
            StageKind::FinancialBalance => "financial_balance",
            StageKind::Deadlines => "deadlines",
            StageKind::Evidence => "evidence",
            StageKind::Conclusions => "conclusions",
            StageKind::Generic => "generic",
        }
    }

    /// Parse an explicit kind identifier from configuration.
    pub fn from_identifier(id: &str) -> Option<Self> {
        let kind = match id {
            "process_overview" => StageKind::ProcessOverview,
            "parties" => StageKind::Parties,
            "strategy" => StageKind::Strategy,
            "risks" => StageKind::Risks,
            "financial_balance" => StageKind::FinancialBalance,
            "deadlines" => StageKind::Deadlines,
            "evidence" => StageKind::Evidence,
            "conclusions" => StageKind::Conclusions,
            "generic" => StageKind::Generic,
            _ => return None,
        };
        Some(kind)
    }

    /// Infer the kind from a human stage title ("Visão Geral do Processo",
    /// "Riscos e Alertas", "Balanço Financeiro", ...).
    pub fn infer(title: &str) -> Self {
        let id = normalize_identifier(title);
        let has = |needle: &str| id.contains(needle);

        if has("visao_geral") || has("overview") || has("resumo") {
            StageKind::ProcessOverview
        } else if has("partes") || has("parties") {
            StageKind::Parties
        } else if has("estrategi") || has("strategy") {
            StageKind::Strategy
        } else if has("risco") || has("risk") {
            StageKind::Risks
        } else if has("financeir") || has("financial") || has("balanco") {
            StageKind::FinancialBalance
        } else if has("prazo") || has("deadline") {
            StageKind::Deadlines
        } else if has("prova") || has("evidence") {
            StageKind::Evidence
        } else if has("conclus") {
            StageKind::Conclusions
        } else {
            StageKind::Generic
        }
    }

    pub fn schema(&self) -> StageSchema {
        let (keys, min_length): (&[&str], Option<usize>) = match self {
            StageKind::ProcessOverview => (&["process_summary", "parties", "timeline"], Some(800)),
            StageKind::Parties => (&["parties"], Some(300)),
            StageKind::Strategy => (&["strategy", "recommendations"], Some(600)),
            StageKind::Risks => (&["risks"], Some(500)),
            StageKind::FinancialBalance => (&["financial_balance", "amounts"], Some(400)),
            StageKind::Deadlines => (&["deadlines"], Some(200)),
            StageKind::Evidence => (&["evidence"], Some(300)),
            StageKind::Conclusions => (&["conclusions"], Some(300)),
            StageKind::Generic => (&[], None),
        };
        StageSchema {
            kind: *self,
            mandatory_keys: keys.iter().map(|k| k.to_string()).collect(),
            min_length,
        }
    }
}

/// Output contract for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSchema {
    pub kind: StageKind,
    pub mandatory_keys: Vec<String>,
    /// Soft floor: shorter output only produces a warning.
    pub min_length: Option<usize>,
}

impl StageSchema {
    pub fn generic() -> Self {
        StageKind::Generic.schema()
    }

    pub fn with_keys<I, S>(kind: StageKind, keys: I, min_length: Option<usize>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            mandatory_keys: keys.into_iter().map(Into::into).collect(),
            min_length,
        }
    }
}

/// Schemas keyed by normalized stage identifier.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    schemas: HashMap<String, StageSchema>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configured stages, applying per-stage overrides.
    pub fn from_stages(stages: &[StageConfig]) -> Self {
        let mut registry = Self::new();
        for stage in stages {
            let kind = stage
                .kind
                .as_deref()
                .and_then(StageKind::from_identifier)
                .unwrap_or_else(|| StageKind::infer(&stage.title));
            let mut schema = kind.schema();
            if let Some(keys) = &stage.mandatory_keys {
                schema.mandatory_keys = keys.clone();
            }
            if stage.min_length.is_some() {
                schema.min_length = stage.min_length;
            }
            registry.register(&stage.title, schema);
        }
        registry
    }

    pub fn register(&mut self, title: &str, schema: StageSchema) {
        self.schemas.insert(normalize_identifier(title), schema);
    }

    /// Schema for a stage title: registered entry, else inferred kind.
    pub fn lookup(&self, title: &str) -> StageSchema {
        self.schemas
            .get(&normalize_identifier(title))
            .cloned()
            .unwrap_or_else(|| StageKind::infer(title).schema())
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Lowercase ASCII identifier with accents folded and separators collapsed to `_`.
pub fn normalize_identifier(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_sep = true;
    for c in title.chars().flat_map(char::to_lowercase) {
        let folded = match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        };
        if folded.is_ascii_alphanumeric() {
            out.push(folded);
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
