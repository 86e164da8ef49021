//! Checker enablement.
//!
//! Every analyzer reports its own checker list; each checker is in one of
//! three states. The seeded state is replayed against the ordered list of
//! user overrides, where later entries win.

use crate::error::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The possible states of a checker. A checker is either implicitly handled
/// (`Default`), or explicitly enabled or disabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckerState {
    #[default]
    Default,
    Enabled,
    Disabled,
}

impl CheckerState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, CheckerState::Enabled)
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, CheckerState::Disabled)
    }
}

/// Named checker groups: profiles seed the default-enabled subset, labels
/// group checkers by guideline or severity.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckerGroups {
    #[serde(default)]
    pub profiles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
}

impl CheckerGroups {
    pub fn available_profiles(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Members of the built-in `default` profile.
    fn default_profile(&self) -> &[String] {
        self.profiles.get("default").map(Vec::as_slice).unwrap_or_default()
    }
}

/// An ordered list of checker overrides; later entries win.
pub type CheckerOverrides = Vec<(String, bool)>;

/// Registry of all checkers known to one analyzer together with their
/// enablement state.
#[derive(Clone, Debug, Default)]
pub struct CheckerRegistry {
    checkers: BTreeMap<String, (CheckerState, String)>,
}

impl CheckerRegistry {
    /// Makes a checker available with implicit handling. Re-registration of
    /// an existing checker makes no modification.
    pub fn register_checker(&mut self, name: impl Into<String>, description: impl Into<String>) {
        self.checkers.entry(name.into()).or_insert((CheckerState::Default, description.into()));
    }

    /// State and description of a single checker.
    pub fn get(&self, name: &str) -> Option<&(CheckerState, String)> {
        self.checkers.get(name)
    }

    /// All checkers with their states, in deterministic order.
    pub fn checkers(&self) -> impl Iterator<Item = (&str, CheckerState, &str)> {
        self.checkers.iter().map(|(name, (state, descr))| (name.as_str(), *state, descr.as_str()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.checkers
            .iter()
            .filter(|(_, (state, _))| state.is_enabled())
            .map(|(name, _)| name.as_str())
    }

    pub fn disabled(&self) -> impl Iterator<Item = &str> {
        self.checkers
            .iter()
            .filter(|(_, (state, _))| state.is_disabled())
            .map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    /// Sets the state of all checkers whose name starts or ends with
    /// `target`. Both directions are matched to tolerate dotted and dashed
    /// checker hierarchies alike. Returns the number of affected checkers.
    fn set_matching(&mut self, target: &str, state: CheckerState) -> usize {
        let mut hits = 0;
        for (name, entry) in self.checkers.iter_mut() {
            if name.starts_with(target) || name.ends_with(target) {
                entry.0 = state;
                hits += 1;
            }
        }
        hits
    }

    /// Sets the state of all checkers whose name starts with the literal
    /// prefix. Returns the number of affected checkers.
    fn set_prefix(&mut self, prefix: &str, state: CheckerState) -> usize {
        let mut hits = 0;
        for (name, entry) in self.checkers.iter_mut() {
            if name.starts_with(prefix) {
                entry.0 = state;
                hits += 1;
            }
        }
        hits
    }

    /// Sets the state of the exactly named checker.
    fn set_exact(&mut self, name: &str, state: CheckerState) -> usize {
        match self.checkers.get_mut(name) {
            Some(entry) => {
                entry.0 = state;
                1
            }
            None => 0,
        }
    }

    /// All hierarchical prefixes of the registered checker names, e.g.
    /// `security`, `security.insecureAPI`, `security.insecureAPI.gets`.
    /// Used to warn about profile names shadowing checker groups.
    fn name_variations(&self) -> Vec<String> {
        let mut variations = Vec::new();
        for name in self.checkers.keys() {
            let delim = if name.contains('.') { '.' } else { '-' };
            let parts: Vec<&str> = name.split(delim).collect();
            for i in 0..parts.len() {
                variations.push(parts[..=i].join(&delim.to_string()));
            }
        }
        variations
    }

    /// Seeds the registry and replays the user overrides in order.
    ///
    /// Seeding registers every discovered checker with implicit handling,
    /// turns on the members of the `default` profile and, with
    /// `enable_all`, everything except the `alpha.` and `debug.` families
    /// (`osx.` stays off except on mac hosts). Afterwards every override is
    /// applied in order; the last one matching a checker wins.
    pub fn initialize_checkers(
        &mut self,
        groups: &CheckerGroups,
        checkers: &[(String, String)],
        overrides: &CheckerOverrides,
        enable_all: bool,
        strict: bool,
    ) -> Result<()> {
        for (name, description) in checkers {
            self.register_checker(name, description);
        }

        for checker_name in groups.default_profile() {
            self.set_matching(checker_name, CheckerState::Enabled);
        }

        if enable_all {
            for (name, _) in checkers {
                // A few families still need to be enabled by hand.
                if !name.starts_with("alpha.")
                    && !name.starts_with("debug.")
                    && !name.starts_with("osx.")
                {
                    self.set_matching(name, CheckerState::Enabled);
                }
                if name.starts_with("osx.") && cfg!(target_os = "macos") {
                    self.set_matching(name, CheckerState::Enabled);
                }
            }
        }

        let reserved_names = self.name_variations();

        for (identifier, enable) in overrides {
            let state =
                if *enable { CheckerState::Enabled } else { CheckerState::Disabled };

            let hits = if groups.profiles.contains_key(identifier) {
                if identifier == "list" {
                    return Err(DriverError::config(
                        "'list' is a reserved profile keyword, choose another profile name",
                    ));
                }
                if reserved_names.contains(identifier) {
                    warn!(
                        "Profile name '{identifier}' conflicts with a checker(-group) name."
                    );
                }
                let members = &groups.profiles[identifier];
                members.iter().map(|name| self.set_matching(name, state)).sum()
            } else if let Some(members) = groups.labels.get(identifier) {
                members.iter().map(|name| self.set_matching(name, state)).sum()
            } else if let Some(prefix) = identifier.strip_prefix("prefix:") {
                let hits = self.set_prefix(prefix, state);
                if hits == 0 {
                    let msg = format!("no checker name starts with '{prefix}'");
                    if strict {
                        return Err(DriverError::config(msg));
                    }
                    warn!("{msg}");
                    continue;
                }
                hits
            } else if let Some(name) = identifier.strip_prefix("checker:") {
                self.set_exact(name, state)
            } else {
                self.set_matching(identifier, state)
            };

            if hits == 0 {
                let msg = format!("no checker matches '{identifier}'");
                if strict {
                    return Err(DriverError::config(msg));
                }
                warn!("{msg}");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkers() -> Vec<(String, String)> {
        [
            "core.DivideZero",
            "core.NullDereference",
            "deadcode.DeadStores",
            "alpha.core.BoolAssignment",
            "debug.DumpCFG",
            "osx.API",
            "misc-dangling-handle",
        ]
        .iter()
        .map(|name| (name.to_string(), String::new()))
        .collect()
    }

    fn groups() -> CheckerGroups {
        let mut groups = CheckerGroups::default();
        groups
            .profiles
            .insert("default".into(), vec!["core".into(), "deadcode".into()]);
        groups.profiles.insert("sensitive".into(), vec!["alpha.core".into()]);
        groups
            .labels
            .insert("severity:HIGH".into(), vec!["core.NullDereference".into()]);
        groups
    }

    fn state(registry: &CheckerRegistry, name: &str) -> CheckerState {
        registry.get(name).unwrap().0
    }

    #[test]
    fn every_discovered_checker_starts_as_default() {
        let mut registry = CheckerRegistry::default();
        registry
            .initialize_checkers(&CheckerGroups::default(), &checkers(), &vec![], false, false)
            .unwrap();
        assert!(registry.checkers().all(|(_, state, _)| state == CheckerState::Default));
    }

    #[test]
    fn default_profile_members_are_enabled() {
        let mut registry = CheckerRegistry::default();
        registry.initialize_checkers(&groups(), &checkers(), &vec![], false, false).unwrap();
        assert_eq!(state(&registry, "core.DivideZero"), CheckerState::Enabled);
        assert_eq!(state(&registry, "deadcode.DeadStores"), CheckerState::Enabled);
        assert_eq!(state(&registry, "alpha.core.BoolAssignment"), CheckerState::Default);
    }

    #[test]
    fn enable_all_spares_alpha_debug_and_osx() {
        let mut registry = CheckerRegistry::default();
        registry.initialize_checkers(&groups(), &checkers(), &vec![], true, false).unwrap();
        assert_eq!(state(&registry, "misc-dangling-handle"), CheckerState::Enabled);
        assert_eq!(state(&registry, "debug.DumpCFG"), CheckerState::Default);
        if !cfg!(target_os = "macos") {
            assert_eq!(state(&registry, "osx.API"), CheckerState::Default);
        }
    }

    #[test]
    fn last_override_wins() {
        let overrides = vec![
            ("core".to_string(), false),
            ("core.DivideZero".to_string(), true),
            ("core.DivideZero".to_string(), false),
        ];
        let mut registry = CheckerRegistry::default();
        registry.initialize_checkers(&groups(), &checkers(), &overrides, false, false).unwrap();
        assert_eq!(state(&registry, "core.DivideZero"), CheckerState::Disabled);
        assert_eq!(state(&registry, "core.NullDereference"), CheckerState::Disabled);
    }

    #[test]
    fn profile_and_label_identifiers_resolve_to_members() {
        let overrides =
            vec![("sensitive".to_string(), true), ("severity:HIGH".to_string(), false)];
        let mut registry = CheckerRegistry::default();
        registry.initialize_checkers(&groups(), &checkers(), &overrides, false, false).unwrap();
        assert_eq!(state(&registry, "alpha.core.BoolAssignment"), CheckerState::Enabled);
        assert_eq!(state(&registry, "core.NullDereference"), CheckerState::Disabled);
    }

    #[test]
    fn suffix_matching_tolerates_dashed_hierarchies() {
        let overrides = vec![("dangling-handle".to_string(), true)];
        let mut registry = CheckerRegistry::default();
        registry.initialize_checkers(&groups(), &checkers(), &overrides, false, false).unwrap();
        assert_eq!(state(&registry, "misc-dangling-handle"), CheckerState::Enabled);
    }

    #[test]
    fn prefix_literal_only_matches_prefixes() {
        let overrides = vec![("prefix:misc".to_string(), true)];
        let mut registry = CheckerRegistry::default();
        registry.initialize_checkers(&groups(), &checkers(), &overrides, false, false).unwrap();
        assert_eq!(state(&registry, "misc-dangling-handle"), CheckerState::Enabled);

        let overrides = vec![("prefix:dangling-handle".to_string(), true)];
        let mut registry = CheckerRegistry::default();
        assert!(registry
            .initialize_checkers(&groups(), &checkers(), &overrides, false, true)
            .is_err());
    }

    #[test]
    fn exact_literal_matches_one_checker() {
        let overrides = vec![("checker:core.DivideZero".to_string(), false)];
        let mut registry = CheckerRegistry::default();
        registry.initialize_checkers(&groups(), &checkers(), &overrides, false, false).unwrap();
        assert_eq!(state(&registry, "core.DivideZero"), CheckerState::Disabled);
        assert_eq!(state(&registry, "core.NullDereference"), CheckerState::Enabled);
    }

    #[test]
    fn reserved_list_profile_is_fatal() {
        let mut groups = groups();
        groups.profiles.insert("list".into(), vec!["core".into()]);
        let overrides = vec![("list".to_string(), true)];
        let mut registry = CheckerRegistry::default();
        assert!(registry
            .initialize_checkers(&groups, &checkers(), &overrides, false, false)
            .is_err());
    }

    #[test]
    fn unresolved_identifier_fails_in_strict_mode_only() {
        let overrides = vec![("no.such.checker".to_string(), true)];

        let mut registry = CheckerRegistry::default();
        registry
            .initialize_checkers(&groups(), &checkers(), &overrides, false, false)
            .unwrap();

        let mut registry = CheckerRegistry::default();
        assert!(registry
            .initialize_checkers(&groups(), &checkers(), &overrides, false, true)
            .is_err());
    }
}
