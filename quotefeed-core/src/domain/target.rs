//! Targets: the indices and holdings a refresh keeps up to date.

use serde::{Deserialize, Serialize};

/// What kind of thing a target is, with the metadata that comes with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetKind {
    /// A market index from the configured index list.
    Index,
    /// A holding from the user's holdings list.
    Holding {
        cost_basis: Option<f64>,
        quantity: Option<f64>,
    },
}

impl TargetKind {
    /// Short lowercase label used in logs and the run log.
    pub fn label(&self) -> &'static str {
        match self {
            TargetKind::Index => "index",
            TargetKind::Holding { .. } => "holding",
        }
    }
}

/// A logical entity whose daily series is kept up to date.
///
/// `id` is the Yahoo-style exchange-suffixed symbol (e.g. `600519.SS`) and
/// doubles as the stable file key in the output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub display_name: String,
    #[serde(flatten)]
    pub kind: TargetKind,
}

impl Target {
    pub fn index(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            kind: TargetKind::Index,
        }
    }

    /// A holding with no cost metadata; the display name defaults to the id.
    pub fn holding(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind: TargetKind::Holding {
                cost_basis: None,
                quantity: None,
            },
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self.kind, TargetKind::Index)
    }

    pub fn is_holding(&self) -> bool {
        matches!(self.kind, TargetKind::Holding { .. })
    }

    /// The exchange suffix of the id (`SS`, `SZ`, ...), upper-cased.
    pub fn exchange_suffix(&self) -> Option<String> {
        self.id
            .rsplit_once('.')
            .map(|(_, suffix)| suffix.to_ascii_uppercase())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holding_defaults_display_name_to_id() {
        let t = Target::holding("600519.SS");
        assert_eq!(t.display_name, "600519.SS");
        assert!(t.is_holding());
        assert!(!t.is_index());
    }

    #[test]
    fn exchange_suffix_is_uppercased() {
        assert_eq!(Target::holding("000001.sz").exchange_suffix().as_deref(), Some("SZ"));
        assert_eq!(Target::holding("AAPL").exchange_suffix(), None);
        assert_eq!(Target::holding("BAD.").exchange_suffix(), None);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(Target::index("000300.SS", "沪深300").kind.label(), "index");
        assert_eq!(Target::holding("600519.SS").kind.label(), "holding");
    }
}
