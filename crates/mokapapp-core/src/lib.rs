use std::collections::BTreeSet;

mod panel;
mod reconcile;
mod version;

pub use panel::{
    derive_panel, derive_panels, hgnc_ids, panel_key, panel_name, Colour, DerivedPanel, PanelGene,
    RawGene, RawPanel,
};
pub use reconcile::{
    apply, reconcile, verify, ItemCategory, MutationSet, PanelAction, PanelGateway, PanelRows,
    RunStats, TargetState,
};
pub use version::compare_versions;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PanelError {
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unknown confidence level {0:?}: expected a value in 0-4")]
    UnknownConfidence(String),
    #[error("HGNC ids missing from reference table: {}", join_ids(.0))]
    MissingHgncIds(BTreeSet<String>),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

fn join_ids(ids: &BTreeSet<String>) -> String {
    ids.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}
