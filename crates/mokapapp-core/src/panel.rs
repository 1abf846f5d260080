use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::PanelError;

/// Confidence band derived from a registry gene confidence level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Colour {
    Green,
    Amber,
    Red,
}

impl Colour {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Green => "Green",
            Self::Amber => "Amber",
            Self::Red => "Red",
        }
    }

    /// Parses a colour name in any letter case (`amber`, `AMBER`, `Amber`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "green" => Some(Self::Green),
            "amber" => Some(Self::Amber),
            "red" => Some(Self::Red),
            _ => None,
        }
    }

    /// Maps a registry confidence level to its colour band.
    ///
    /// # Errors
    /// Returns [`PanelError::UnknownConfidence`] for anything outside `0..=4`.
    pub fn from_confidence(level: &str) -> Result<Self, PanelError> {
        match level.trim() {
            "4" | "3" => Ok(Self::Green),
            "2" => Ok(Self::Amber),
            "1" | "0" => Ok(Self::Red),
            other => Err(PanelError::UnknownConfidence(other.to_string())),
        }
    }
}

impl Display for Colour {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawGene {
    pub hgnc_id: String,
    pub symbol: String,
    pub confidence: String,
}

/// A registry panel enriched with its gene list.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawPanel {
    pub id: Option<u64>,
    pub name: String,
    pub version: String,
    pub genes: Vec<RawGene>,
    pub signed_off: bool,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PanelGene {
    pub hgnc_id: String,
    pub symbol: String,
}

/// One (registry panel, colour) pair in Moka form.
///
/// Only built through [`derive_panel`], which guarantees a non-empty gene
/// list and a `"{panel_id}_{Colour}"` key.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct DerivedPanel {
    key: String,
    name: String,
    version: String,
    genes: Vec<PanelGene>,
    colour: Colour,
    signed_off: bool,
}

impl DerivedPanel {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn genes(&self) -> &[PanelGene] {
        &self.genes
    }

    #[must_use]
    pub fn colour(&self) -> Colour {
        self.colour
    }

    #[must_use]
    pub fn signed_off(&self) -> bool {
        self.signed_off
    }
}

impl Display for DerivedPanel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {}. No Genes: {}", self.key, self.name, self.genes.len())
    }
}

#[must_use]
pub fn panel_key(panel_id: u64, colour: Colour) -> String {
    format!("{panel_id}_{colour}")
}

/// Moka display name. Downstream reporting parses this string, so the layout
/// is fixed: `"{name} (Panel App {SO }{Colour} v{version})"`.
#[must_use]
pub fn panel_name(name: &str, colour: Colour, version: &str, signed_off: bool) -> String {
    let clean_name = name.replace('_', "-");
    let so_prefix = if signed_off { "SO " } else { "" };
    format!("{clean_name} (Panel App {so_prefix}{colour} v{version})")
}

/// Builds the Moka panel for one colour of a registry panel.
///
/// Returns `Ok(None)` when the panel has no id or no genes in that colour.
///
/// # Errors
/// Returns [`PanelError::UnknownConfidence`] if any gene carries a confidence
/// level outside the colour map.
pub fn derive_panel(raw: &RawPanel, colour: Colour) -> Result<Option<DerivedPanel>, PanelError> {
    let mut genes = Vec::new();
    for gene in &raw.genes {
        if Colour::from_confidence(&gene.confidence)? == colour {
            genes.push(PanelGene {
                hgnc_id: gene.hgnc_id.clone(),
                symbol: gene.symbol.clone(),
            });
        }
    }

    let Some(panel_id) = raw.id else {
        debug!(name = %raw.name, %colour, "skipping panel without registry id");
        return Ok(None);
    };
    if genes.is_empty() {
        debug!(panel_id, name = %raw.name, %colour, "skipping panel with no genes in colour");
        return Ok(None);
    }

    Ok(Some(DerivedPanel {
        key: panel_key(panel_id, colour),
        name: panel_name(&raw.name, colour, &raw.version, raw.signed_off),
        version: raw.version.clone(),
        genes,
        colour,
        signed_off: raw.signed_off,
    }))
}

/// Derives every (colour, panel) combination, colour-major.
///
/// A panel id seen twice keeps its first occurrence only; the source adapter
/// yields signed-off panels first, so that is the one retained.
///
/// # Errors
/// Propagates [`PanelError::UnknownConfidence`] from [`derive_panel`].
pub fn derive_panels(
    raw_panels: &[RawPanel],
    colours: &BTreeSet<Colour>,
) -> Result<Vec<DerivedPanel>, PanelError> {
    let mut seen_ids = BTreeSet::new();
    let unique = raw_panels
        .iter()
        .filter(|raw| match raw.id {
            Some(id) if !seen_ids.insert(id) => {
                debug!(panel_id = id, name = %raw.name, "dropping duplicate registry panel");
                false
            }
            _ => true,
        })
        .collect::<Vec<_>>();

    let mut derived = Vec::new();
    for colour in colours {
        for raw in &unique {
            if let Some(panel) = derive_panel(raw, *colour)? {
                debug!(%panel, "derived panel");
                derived.push(panel);
            }
        }
    }
    Ok(derived)
}

#[must_use]
pub fn hgnc_ids(panels: &[DerivedPanel]) -> BTreeSet<String> {
    let ids = panels
        .iter()
        .flat_map(|panel| panel.genes.iter().map(|gene| gene.hgnc_id.clone()))
        .collect::<BTreeSet<_>>();
    debug!(
        hgnc_count = ids.len(),
        panel_count = panels.len(),
        "collected HGNC ids from derived panels"
    );
    ids
}
