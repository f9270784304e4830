//! Shared environment map.
//!
//! Launched commands and mode checks read from an [`EnvState`] instead of the
//! ambient process environment. After startup the only writer is the handoff
//! merge in the primary instance.

use std::{
    collections::BTreeMap,
    env,
    sync::{Arc, RwLock},
};

use tracing::debug;

use crate::config::ModeKeys;

pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct EnvState {
    vars: Arc<RwLock<EnvMap>>,
}

/// What a handoff merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffReport {
    pub applied: usize,
    pub stripped: Vec<String>,
}

impl EnvState {
    pub fn from_process() -> Self {
        let vars = env::vars().collect::<EnvMap>();
        Self::from_map(vars)
    }

    pub fn from_map(vars: EnvMap) -> Self {
        Self {
            vars: Arc::new(RwLock::new(vars)),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.read(|vars| vars.get(key).cloned())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.write(|vars| {
            vars.insert(key, value);
        });
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        let mut removed = None;
        self.write(|vars| removed = vars.remove(key));
        removed
    }

    pub fn snapshot(&self) -> EnvMap {
        self.read(|vars| vars.clone())
    }

    /// True when `key` holds a value other than empty, `0`, `false`, `no` or `off`
    /// (case-insensitive, surrounding whitespace ignored).
    pub fn is_truthy(&self, key: &str) -> bool {
        self.get(key)
            .map(|value| {
                let value = value.trim().to_ascii_lowercase();
                !matches!(value.as_str(), "" | "0" | "false" | "no" | "off")
            })
            .unwrap_or(false)
    }

    /// Merges variables forwarded by a secondary instance. The offline and
    /// develop markers never cross over; everything else overwrites.
    pub fn apply_handoff(&self, mut incoming: EnvMap, keys: &ModeKeys) -> HandoffReport {
        let mut report = HandoffReport::default();
        for key in [&keys.offline, &keys.develop] {
            if incoming.remove(key.as_str()).is_some() {
                report.stripped.push(key.clone());
            }
        }
        report.applied = incoming.len();
        self.write(|vars| vars.extend(incoming));
        debug!(
            applied = report.applied,
            stripped = ?report.stripped,
            "merged handoff environment"
        );
        report
    }

    fn read<R>(&self, f: impl FnOnce(&EnvMap) -> R) -> R {
        match self.vars.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write(&self, f: impl FnOnce(&mut EnvMap)) {
        match self.vars.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn handoff_keeps_primary_mode_markers() {
        let state = EnvState::from_map(map(&[("OFFLINE_MODE", "0")]));
        let report = state.apply_handoff(
            map(&[("OFFLINE_MODE", "1"), ("OTHER", "x")]),
            &ModeKeys::default(),
        );

        assert_eq!(state.get("OFFLINE_MODE").as_deref(), Some("0"));
        assert_eq!(state.get("OTHER").as_deref(), Some("x"));
        assert_eq!(report.applied, 1);
        assert_eq!(report.stripped, vec!["OFFLINE_MODE".to_string()]);
    }

    #[test]
    fn handoff_never_introduces_develop_marker() {
        let state = EnvState::from_map(EnvMap::new());
        state.apply_handoff(
            map(&[("DEVELOP_MODE", "1"), ("PATH", "/opt/bin")]),
            &ModeKeys::default(),
        );
        assert_eq!(state.get("DEVELOP_MODE"), None);
        assert_eq!(state.get("PATH").as_deref(), Some("/opt/bin"));
    }

    #[test]
    fn handoff_honours_renamed_marker_keys() {
        let keys = ModeKeys {
            offline: "STUDIO_OFFLINE".into(),
            develop: "STUDIO_DEV".into(),
        };
        let state = EnvState::from_map(EnvMap::new());
        state.apply_handoff(
            map(&[("STUDIO_OFFLINE", "1"), ("OFFLINE_MODE", "1")]),
            &keys,
        );
        assert_eq!(state.get("STUDIO_OFFLINE"), None);
        assert_eq!(state.get("OFFLINE_MODE").as_deref(), Some("1"));
    }

    #[test]
    fn truthiness_rules() {
        let state = EnvState::from_map(map(&[
            ("A", "1"),
            ("B", "0"),
            ("C", "False"),
            ("D", "yes"),
            ("E", " OFF "),
            ("F", "no"),
        ]));
        assert!(state.is_truthy("A"));
        assert!(!state.is_truthy("B"));
        assert!(!state.is_truthy("C"));
        assert!(state.is_truthy("D"));
        assert!(!state.is_truthy("E"));
        assert!(!state.is_truthy("F"));
        assert!(!state.is_truthy("MISSING"));
    }
}
