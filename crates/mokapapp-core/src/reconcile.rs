use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::panel::{hgnc_ids, DerivedPanel};
use crate::version::compare_versions;
use crate::PanelError;

/// Version string -> active flag, for every row of one panel key.
pub type PanelRows = BTreeMap<String, bool>;

/// Which item category a dictionary entry belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ItemCategory {
    PanelKey,
    PanelVersion,
}

/// Read and mutation surface of the target panel database.
///
/// Key and version comparisons are case-sensitive. Every mutation commits on
/// its own; callers get no multi-call transaction.
pub trait PanelGateway {
    #[allow(clippy::missing_errors_doc)]
    fn known_keys(&self) -> Result<BTreeSet<String>, PanelError>;

    #[allow(clippy::missing_errors_doc)]
    fn known_versions(&self) -> Result<BTreeSet<String>, PanelError>;

    #[allow(clippy::missing_errors_doc)]
    fn known_hgnc_ids(&self) -> Result<BTreeSet<String>, PanelError>;

    /// All registry-sourced panel rows, grouped by key.
    #[allow(clippy::missing_errors_doc)]
    fn panel_rows(&self) -> Result<BTreeMap<String, PanelRows>, PanelError>;

    #[allow(clippy::missing_errors_doc)]
    fn is_active(&self, key: &str) -> Result<bool, PanelError>;

    #[allow(clippy::missing_errors_doc)]
    fn is_active_version(&self, key: &str, version: &str) -> Result<bool, PanelError>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_items(
        &mut self,
        items: &BTreeSet<String>,
        category: ItemCategory,
    ) -> Result<(), PanelError>;

    /// Inserts an active row for the panel plus its gene memberships. Other
    /// versions of the key are left untouched.
    #[allow(clippy::missing_errors_doc)]
    fn insert_row(&mut self, panel: &DerivedPanel) -> Result<(), PanelError>;

    #[allow(clippy::missing_errors_doc)]
    fn deactivate_all(&mut self, key: &str) -> Result<(), PanelError>;

    /// Marks `version` as the only active row of `key`.
    #[allow(clippy::missing_errors_doc)]
    fn activate_only(&mut self, key: &str, version: &str) -> Result<(), PanelError>;
}

/// Snapshot of the target database taken before reconciliation.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TargetState {
    pub known_keys: BTreeSet<String>,
    pub known_versions: BTreeSet<String>,
    pub known_hgnc_ids: BTreeSet<String>,
    pub panels: BTreeMap<String, PanelRows>,
}

impl TargetState {
    /// Reads the full snapshot through the gateway.
    ///
    /// # Errors
    /// Propagates any gateway read failure.
    pub fn load<G: PanelGateway + ?Sized>(gateway: &G) -> Result<Self, PanelError> {
        let state = Self {
            known_keys: gateway.known_keys()?,
            known_versions: gateway.known_versions()?,
            known_hgnc_ids: gateway.known_hgnc_ids()?,
            panels: gateway.panel_rows()?,
        };
        info!(
            known_keys = state.known_keys.len(),
            known_versions = state.known_versions.len(),
            known_hgnc_ids = state.known_hgnc_ids.len(),
            panel_keys_with_rows = state.panels.len(),
            "loaded target state"
        );
        Ok(state)
    }

    #[must_use]
    pub fn has_rows(&self, key: &str) -> bool {
        self.panels.get(key).is_some_and(|rows| !rows.is_empty())
    }

    #[must_use]
    pub fn has_version(&self, key: &str, version: &str) -> bool {
        self.panels
            .get(key)
            .is_some_and(|rows| rows.contains_key(version))
    }

    #[must_use]
    pub fn is_active(&self, key: &str) -> bool {
        self.panels
            .get(key)
            .is_some_and(|rows| rows.values().any(|active| *active))
    }

    #[must_use]
    pub fn is_active_version(&self, key: &str, version: &str) -> bool {
        self.panels
            .get(key)
            .and_then(|rows| rows.get(version))
            .copied()
            .unwrap_or(false)
    }

    /// Highest active version of `key`. More than one active row only happens
    /// after outside edits; the highest is reported.
    #[must_use]
    pub fn active_version(&self, key: &str) -> Option<&str> {
        self.panels.get(key).and_then(|rows| {
            rows.iter()
                .filter(|(_, active)| **active)
                .map(|(version, _)| version.as_str())
                .max_by(|lhs, rhs| compare_versions(lhs, rhs))
        })
    }

    pub fn active_keys(&self) -> impl Iterator<Item = &str> {
        self.panels
            .iter()
            .filter(|(_, rows)| rows.values().any(|active| *active))
            .map(|(key, _)| key.as_str())
    }
}

/// What to do with one derived panel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PanelAction {
    /// Key has no rows yet: insert an active row.
    Insert(DerivedPanel),
    /// Key exists without this version: insert it, then make it the only
    /// active version.
    Update {
        panel: DerivedPanel,
        previous: Option<String>,
    },
    /// Row for this version already exists: re-assert it as the only active one.
    SetActiveOnly { key: String, version: String },
}

impl PanelAction {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Insert(panel) | Self::Update { panel, .. } => panel.key(),
            Self::SetActiveOnly { key, .. } => key,
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        match self {
            Self::Insert(panel) | Self::Update { panel, .. } => panel.version(),
            Self::SetActiveOnly { version, .. } => version,
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MutationSet {
    pub new_keys: BTreeSet<String>,
    pub new_versions: BTreeSet<String>,
    pub actions: Vec<PanelAction>,
    pub to_deactivate: BTreeSet<String>,
}

impl MutationSet {
    /// Panels that need a fresh row (new keys and new versions).
    pub fn to_insert(&self) -> impl Iterator<Item = &DerivedPanel> {
        self.actions.iter().filter_map(|action| match action {
            PanelAction::Insert(panel) | PanelAction::Update { panel, .. } => Some(panel),
            PanelAction::SetActiveOnly { .. } => None,
        })
    }

    /// `(key, version)` pairs whose siblings must be deactivated.
    pub fn to_activate_only(&self) -> impl Iterator<Item = (&str, &str)> {
        self.actions.iter().filter_map(|action| match action {
            PanelAction::Insert(_) => None,
            PanelAction::Update { .. } | PanelAction::SetActiveOnly { .. } => {
                Some((action.key(), action.version()))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct RunStats {
    pub new_keys: usize,
    pub new_versions: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deactivated: usize,
}

/// Computes the mutations that bring `state` in line with `derived`.
///
/// # Errors
/// Returns [`PanelError::MissingHgncIds`] when any derived gene is absent from
/// the reference table, and [`PanelError::Invariant`] when two derived panels
/// share a key. Nothing is computed past either failure.
pub fn reconcile(derived: &[DerivedPanel], state: &TargetState) -> Result<MutationSet, PanelError> {
    let mut derived_keys = BTreeSet::new();
    for panel in derived {
        if !derived_keys.insert(panel.key().to_string()) {
            return Err(PanelError::Invariant(format!(
                "derived panel key {} appears more than once",
                panel.key()
            )));
        }
    }

    let missing_hgnc = hgnc_ids(derived)
        .difference(&state.known_hgnc_ids)
        .cloned()
        .collect::<BTreeSet<_>>();
    if !missing_hgnc.is_empty() {
        error!(
            missing = missing_hgnc.len(),
            "derived panels reference HGNC ids absent from the reference table"
        );
        return Err(PanelError::MissingHgncIds(missing_hgnc));
    }
    info!("all HGNC ids present in reference table");

    let new_keys = derived_keys
        .difference(&state.known_keys)
        .cloned()
        .collect::<BTreeSet<_>>();
    let new_versions = derived
        .iter()
        .map(|panel| panel.version().to_string())
        .filter(|version| !state.known_versions.contains(version))
        .collect::<BTreeSet<_>>();

    let mut actions = Vec::with_capacity(derived.len());
    for panel in derived {
        let key = panel.key();
        let version = panel.version();

        let action = if !state.has_rows(key) {
            debug!(key, version, "new panel");
            PanelAction::Insert(panel.clone())
        } else if state.has_version(key, version) {
            if !state.is_active_version(key, version) {
                warn!(key, version, "panel version present but inactive; reactivating");
            }
            PanelAction::SetActiveOnly {
                key: key.to_string(),
                version: version.to_string(),
            }
        } else {
            let previous = state.active_version(key).map(ToString::to_string);
            if let Some(current) = previous.as_deref() {
                if compare_versions(version, current) == Ordering::Less {
                    warn!(key, current, incoming = version, "registry version is older than active version");
                }
            }
            debug!(key, version, previous = ?previous, "updated panel");
            PanelAction::Update {
                panel: panel.clone(),
                previous,
            }
        };
        actions.push(action);
    }

    let to_deactivate = state
        .active_keys()
        .filter(|key| !derived_keys.contains(*key))
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>();

    Ok(MutationSet {
        new_keys,
        new_versions,
        actions,
        to_deactivate,
    })
}

/// Applies a mutation set, key by key, stopping at the first failure.
///
/// Dictionary items go in first. For updates the new row is inserted before
/// its siblings are deactivated, so the key is never left without an active
/// version. Mutations already applied are not rolled back on failure.
///
/// # Errors
/// Returns the first gateway failure, tagged with the key being applied.
pub fn apply<G: PanelGateway + ?Sized>(
    mutations: &MutationSet,
    gateway: &mut G,
) -> Result<RunStats, PanelError> {
    let mut stats = RunStats::default();

    if mutations.new_keys.is_empty() {
        info!("no new panel keys to insert");
    } else {
        info!(count = mutations.new_keys.len(), "inserting new panel keys");
        gateway.insert_items(&mutations.new_keys, ItemCategory::PanelKey)?;
    }
    stats.new_keys = mutations.new_keys.len();

    if mutations.new_versions.is_empty() {
        info!("no new panel versions to insert");
    } else {
        info!(count = mutations.new_versions.len(), "inserting new panel versions");
        gateway.insert_items(&mutations.new_versions, ItemCategory::PanelVersion)?;
    }
    stats.new_versions = mutations.new_versions.len();

    for action in &mutations.actions {
        let key = action.key();
        match action {
            PanelAction::Insert(panel) => {
                info!(%panel, "new panel; inserting");
                gateway.insert_row(panel).map_err(|err| for_key(key, err))?;
                stats.inserted += 1;
            }
            PanelAction::Update { panel, previous } => {
                info!(%panel, previous = ?previous, "updated panel; inserting and setting active");
                gateway.insert_row(panel).map_err(|err| for_key(key, err))?;
                gateway
                    .activate_only(key, panel.version())
                    .map_err(|err| for_key(key, err))?;
                stats.updated += 1;
            }
            PanelAction::SetActiveOnly { version, .. } => {
                debug!(key, version = %version, "panel unchanged; setting only active version");
                gateway
                    .activate_only(key, version)
                    .map_err(|err| for_key(key, err))?;
                stats.unchanged += 1;
            }
        }
    }

    for key in &mutations.to_deactivate {
        info!(key = %key, "panel absent from registry; deactivating");
        gateway.deactivate_all(key).map_err(|err| for_key(key, err))?;
        stats.deactivated += 1;
    }

    Ok(stats)
}

/// Checks the single-active-version invariant after [`apply`].
///
/// # Errors
/// Returns [`PanelError::Invariant`] naming the first key that is not in its
/// expected state, or any gateway read failure.
pub fn verify<G: PanelGateway + ?Sized>(
    mutations: &MutationSet,
    gateway: &G,
) -> Result<(), PanelError> {
    let rows = gateway.panel_rows()?;

    for action in &mutations.actions {
        let (key, version) = (action.key(), action.version());
        if !gateway.is_active_version(key, version)? {
            return Err(PanelError::Invariant(format!(
                "{key} version {version} is not active after import"
            )));
        }
        let active_count = rows
            .get(key)
            .map_or(0, |versions| versions.values().filter(|active| **active).count());
        if active_count != 1 {
            return Err(PanelError::Invariant(format!(
                "{key} has {active_count} active versions after import"
            )));
        }
    }

    for key in &mutations.to_deactivate {
        if gateway.is_active(key)? {
            return Err(PanelError::Invariant(format!(
                "{key} is still active after deactivation"
            )));
        }
    }

    info!(panels = mutations.actions.len(), "verified single active version per panel key");
    Ok(())
}

fn for_key(key: &str, err: PanelError) -> PanelError {
    match err {
        PanelError::Persistence(message) => PanelError::Persistence(format!("{key}: {message}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::{derive_panels, Colour, RawGene, RawPanel};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    /// In-memory stand-in for the Moka tables.
    #[derive(Debug, Default)]
    struct MemoryGateway {
        keys: BTreeSet<String>,
        versions: BTreeSet<String>,
        hgnc: BTreeSet<String>,
        rows: BTreeMap<String, PanelRows>,
        calls: Vec<String>,
        fail_on_insert: Option<String>,
    }

    impl MemoryGateway {
        fn with_hgnc(ids: &[&str]) -> Self {
            Self {
                hgnc: ids.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        fn seed_row(&mut self, key: &str, version: &str, active: bool) {
            self.keys.insert(key.to_string());
            self.versions.insert(version.to_string());
            self.rows
                .entry(key.to_string())
                .or_default()
                .insert(version.to_string(), active);
        }
    }

    impl PanelGateway for MemoryGateway {
        fn known_keys(&self) -> Result<BTreeSet<String>, PanelError> {
            Ok(self.keys.clone())
        }

        fn known_versions(&self) -> Result<BTreeSet<String>, PanelError> {
            Ok(self.versions.clone())
        }

        fn known_hgnc_ids(&self) -> Result<BTreeSet<String>, PanelError> {
            Ok(self.hgnc.clone())
        }

        fn panel_rows(&self) -> Result<BTreeMap<String, PanelRows>, PanelError> {
            Ok(self.rows.clone())
        }

        fn is_active(&self, key: &str) -> Result<bool, PanelError> {
            Ok(self
                .rows
                .get(key)
                .is_some_and(|rows| rows.values().any(|active| *active)))
        }

        fn is_active_version(&self, key: &str, version: &str) -> Result<bool, PanelError> {
            Ok(self
                .rows
                .get(key)
                .and_then(|rows| rows.get(version))
                .copied()
                .unwrap_or(false))
        }

        fn insert_items(
            &mut self,
            items: &BTreeSet<String>,
            category: ItemCategory,
        ) -> Result<(), PanelError> {
            let target = match category {
                ItemCategory::PanelKey => &mut self.keys,
                ItemCategory::PanelVersion => &mut self.versions,
            };
            target.extend(items.iter().cloned());
            self.calls.push(format!("items {category:?} {}", items.len()));
            Ok(())
        }

        fn insert_row(&mut self, panel: &DerivedPanel) -> Result<(), PanelError> {
            if self.fail_on_insert.as_deref() == Some(panel.key()) {
                return Err(PanelError::Persistence("constraint violation".to_string()));
            }
            if !self.keys.contains(panel.key()) || !self.versions.contains(panel.version()) {
                return Err(PanelError::Persistence("missing item".to_string()));
            }
            self.rows
                .entry(panel.key().to_string())
                .or_default()
                .insert(panel.version().to_string(), true);
            self.calls
                .push(format!("insert {} {}", panel.key(), panel.version()));
            Ok(())
        }

        fn deactivate_all(&mut self, key: &str) -> Result<(), PanelError> {
            if let Some(rows) = self.rows.get_mut(key) {
                rows.values_mut().for_each(|active| *active = false);
            }
            self.calls.push(format!("deactivate {key}"));
            Ok(())
        }

        fn activate_only(&mut self, key: &str, version: &str) -> Result<(), PanelError> {
            if let Some(rows) = self.rows.get_mut(key) {
                for (candidate, active) in rows.iter_mut() {
                    *active = candidate == version;
                }
            }
            self.calls.push(format!("activate_only {key} {version}"));
            Ok(())
        }
    }

    fn raw(id: u64, version: &str, genes: &[(&str, &str)]) -> RawPanel {
        RawPanel {
            id: Some(id),
            name: format!("Panel_{id}"),
            version: version.to_string(),
            genes: genes
                .iter()
                .map(|(hgnc_id, confidence)| RawGene {
                    hgnc_id: (*hgnc_id).to_string(),
                    symbol: format!("SYM{hgnc_id}"),
                    confidence: (*confidence).to_string(),
                })
                .collect(),
            signed_off: false,
        }
    }

    fn amber(raw_panels: &[RawPanel]) -> Vec<DerivedPanel> {
        let colours = [Colour::Amber].into_iter().collect();
        must_ok(derive_panels(raw_panels, &colours))
    }

    #[test]
    fn active_version_is_set_active_only() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        gateway.seed_row("34_Amber", "1.2", true);
        let derived = amber(&[raw(34, "1.2", &[("HGNC:5", "2")])]);

        let state = must_ok(TargetState::load(&gateway));
        let mutations = must_ok(reconcile(&derived, &state));

        assert!(mutations.new_keys.is_empty());
        assert!(mutations.new_versions.is_empty());
        assert_eq!(
            mutations.actions,
            vec![PanelAction::SetActiveOnly {
                key: "34_Amber".to_string(),
                version: "1.2".to_string(),
            }]
        );
        assert_eq!(mutations.to_insert().count(), 0);
        assert_eq!(
            mutations.to_activate_only().collect::<Vec<_>>(),
            vec![("34_Amber", "1.2")]
        );
    }

    #[test]
    fn unknown_key_is_new_and_inserted() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        gateway.seed_row("34_Amber", "1.2", true);
        let derived = amber(&[raw(99999, "9.9999", &[("HGNC:5", "2")])]);

        let state = must_ok(TargetState::load(&gateway));
        let mutations = must_ok(reconcile(&derived, &state));

        assert!(mutations.new_keys.contains("99999_Amber"));
        assert!(mutations.new_versions.contains("9.9999"));
        assert!(matches!(mutations.actions[0], PanelAction::Insert(_)));
    }

    #[test]
    fn new_version_of_known_key_is_update_with_previous() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        gateway.seed_row("34_Amber", "1.2", false);
        gateway.seed_row("34_Amber", "1.10", true);
        let derived = amber(&[raw(34, "1.26", &[("HGNC:5", "2")])]);

        let state = must_ok(TargetState::load(&gateway));
        let mutations = must_ok(reconcile(&derived, &state));

        match &mutations.actions[0] {
            PanelAction::Update { panel, previous } => {
                assert_eq!(panel.version(), "1.26");
                assert_eq!(previous.as_deref(), Some("1.10"));
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(mutations.to_insert().count(), 1);
        assert_eq!(mutations.to_activate_only().count(), 1);
    }

    #[test]
    fn inactive_existing_version_is_reactivated_not_duplicated() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        gateway.seed_row("34_Amber", "1.2", false);
        gateway.seed_row("34_Amber", "1.3", true);
        let derived = amber(&[raw(34, "1.2", &[("HGNC:5", "2")])]);

        let state = must_ok(TargetState::load(&gateway));
        let mutations = must_ok(reconcile(&derived, &state));
        assert!(matches!(
            mutations.actions[0],
            PanelAction::SetActiveOnly { .. }
        ));

        let stats = must_ok(apply(&mutations, &mut gateway));
        assert_eq!(stats.unchanged, 1);
        assert!(must_ok(gateway.is_active_version("34_Amber", "1.2")));
        assert!(!must_ok(gateway.is_active_version("34_Amber", "1.3")));
    }

    #[test]
    fn active_keys_absent_from_registry_are_deactivated() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        gateway.seed_row("34_Amber", "1.2", true);
        gateway.seed_row("12_Amber", "0.5", true);
        gateway.seed_row("13_Amber", "0.5", false);
        let derived = amber(&[raw(34, "1.2", &[("HGNC:5", "2")])]);

        let state = must_ok(TargetState::load(&gateway));
        let mutations = must_ok(reconcile(&derived, &state));
        assert_eq!(
            mutations.to_deactivate.iter().collect::<Vec<_>>(),
            vec!["12_Amber"]
        );

        let stats = must_ok(apply(&mutations, &mut gateway));
        assert_eq!(stats.deactivated, 1);
        assert!(!must_ok(gateway.is_active("12_Amber")));
        assert!(gateway.rows.contains_key("12_Amber"));
    }

    #[test]
    fn missing_hgnc_id_blocks_every_mutation() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        gateway.seed_row("12_Amber", "0.5", true);
        let derived = amber(&[
            raw(34, "1.2", &[("HGNC:5", "2")]),
            raw(35, "1.2", &[("HGNC:FAKE", "2")]),
        ]);

        let state = must_ok(TargetState::load(&gateway));
        let result = reconcile(&derived, &state);

        let expected = ["HGNC:FAKE".to_string()].into_iter().collect();
        assert_eq!(result, Err(PanelError::MissingHgncIds(expected)));
        assert!(gateway.calls.is_empty());
    }

    #[test]
    fn duplicate_derived_keys_are_rejected() {
        let gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        let mut derived = amber(&[raw(34, "1.2", &[("HGNC:5", "2")])]);
        derived.push(derived[0].clone());

        let state = must_ok(TargetState::load(&gateway));
        assert!(matches!(
            reconcile(&derived, &state),
            Err(PanelError::Invariant(_))
        ));
    }

    #[test]
    fn apply_inserts_items_before_rows_and_rows_before_isolation() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        gateway.seed_row("34_Amber", "1.2", true);
        let derived = amber(&[
            raw(34, "1.3", &[("HGNC:5", "2")]),
            raw(40, "2.0", &[("HGNC:5", "2")]),
        ]);

        let state = must_ok(TargetState::load(&gateway));
        let mutations = must_ok(reconcile(&derived, &state));
        let stats = must_ok(apply(&mutations, &mut gateway));

        assert_eq!(
            gateway.calls,
            vec![
                "items PanelKey 1".to_string(),
                "items PanelVersion 2".to_string(),
                "insert 34_Amber 1.3".to_string(),
                "activate_only 34_Amber 1.3".to_string(),
                "insert 40_Amber 2.0".to_string(),
            ]
        );
        assert_eq!(
            stats,
            RunStats {
                new_keys: 1,
                new_versions: 2,
                inserted: 1,
                updated: 1,
                unchanged: 0,
                deactivated: 0,
            }
        );
        must_ok(verify(&mutations, &gateway));
    }

    #[test]
    fn apply_stops_at_first_failure_without_rollback() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        gateway.fail_on_insert = Some("41_Amber".to_string());
        let derived = amber(&[
            raw(40, "2.0", &[("HGNC:5", "2")]),
            raw(41, "2.0", &[("HGNC:5", "2")]),
            raw(42, "2.0", &[("HGNC:5", "2")]),
        ]);

        let state = must_ok(TargetState::load(&gateway));
        let mutations = must_ok(reconcile(&derived, &state));
        let result = apply(&mutations, &mut gateway);

        assert_eq!(
            result,
            Err(PanelError::Persistence(
                "41_Amber: constraint violation".to_string()
            ))
        );
        assert!(gateway.rows.contains_key("40_Amber"));
        assert!(!gateway.rows.contains_key("42_Amber"));
    }

    #[test]
    fn rerunning_on_converged_state_only_reasserts() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5", "HGNC:6"]);
        gateway.seed_row("12_Amber", "0.5", true);
        let derived = amber(&[
            raw(34, "1.3", &[("HGNC:5", "2")]),
            raw(40, "2.0", &[("HGNC:6", "2")]),
        ]);

        let first = must_ok(reconcile(&derived, &must_ok(TargetState::load(&gateway))));
        must_ok(apply(&first, &mut gateway));
        let after_first = gateway.rows.clone();

        let second = must_ok(reconcile(&derived, &must_ok(TargetState::load(&gateway))));
        assert!(second.new_keys.is_empty());
        assert!(second.new_versions.is_empty());
        assert!(second.to_deactivate.is_empty());
        assert_eq!(second.to_insert().count(), 0);

        let stats = must_ok(apply(&second, &mut gateway));
        assert_eq!(stats.unchanged, 2);
        assert_eq!(gateway.rows, after_first);
    }

    #[test]
    fn verify_reports_drifted_sibling_activation() {
        let mut gateway = MemoryGateway::with_hgnc(&["HGNC:5"]);
        let derived = amber(&[raw(34, "1.3", &[("HGNC:5", "2")])]);
        let mutations = must_ok(reconcile(&derived, &must_ok(TargetState::load(&gateway))));
        must_ok(apply(&mutations, &mut gateway));

        gateway.seed_row("34_Amber", "1.2", true);
        assert!(matches!(
            verify(&mutations, &gateway),
            Err(PanelError::Invariant(_))
        ));
    }

    #[test]
    fn active_version_prefers_highest_when_state_drifted() {
        let mut state = TargetState::default();
        let rows = state.panels.entry("34_Amber".to_string()).or_default();
        rows.insert("1.6".to_string(), true);
        rows.insert("1.26".to_string(), true);
        rows.insert("2.0".to_string(), false);

        assert_eq!(state.active_version("34_Amber"), Some("1.26"));
        assert!(state.is_active("34_Amber"));
        assert!(!state.is_active_version("34_Amber", "2.0"));
        assert_eq!(state.active_version("missing"), None);
    }
}
