//! Static, config-driven language and isolation-profile lookup. No
//! hot-reload: the registry is built once from config and never mutated
//! after `Registry::new` returns.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::prelude::*;
use crate::model::{IsolationProfile, ResourceLimit};

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageSpec {
    pub compile_cmd: Option<Vec<String>>,
    pub run_cmd: Vec<String>,
    pub source_filename: String,
    #[serde(default)]
    pub extra_compile_flags_allowed: bool,
    #[serde(default)]
    pub default_limits: Option<ResourceLimit>,
    pub profile_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryManifest {
    pub languages: HashMap<String, LanguageSpec>,
    pub profiles: HashMap<String, IsolationProfile>,
}

pub struct Registry {
    languages: HashMap<String, LanguageSpec>,
    profiles: HashMap<String, IsolationProfile>,
}

impl Registry {
    /// Builds the registry from `manifest`, failing service startup if any
    /// language names a profile the manifest doesn't define.
    pub fn new(manifest: RegistryManifest) -> Result<Self> {
        for (lang, spec) in &manifest.languages {
            if !manifest.profiles.contains_key(&spec.profile_name) {
                bail!(
                    "language \"{lang}\" references undefined profile \"{}\"",
                    spec.profile_name
                );
            }
        }
        if !manifest.profiles.contains_key("compile") {
            bail!("registry manifest must define a \"compile\" profile");
        }
        if !manifest.profiles.contains_key("run") {
            bail!("registry manifest must define a \"run\" profile");
        }

        Ok(Self {
            languages: manifest.languages,
            profiles: manifest.profiles,
        })
    }

    pub fn resolve_language(&self, language_id: &str) -> Result<&LanguageSpec, JudgeError> {
        self.languages
            .get(language_id)
            .ok_or_else(|| JudgeError::validation(format!("unknown language \"{language_id}\"")))
    }

    pub fn resolve_profile(&self, profile_name: &str) -> Result<&IsolationProfile, JudgeError> {
        self.profiles
            .get(profile_name)
            .ok_or_else(|| JudgeError::validation(format!("unknown profile \"{profile_name}\"")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> RegistryManifest {
        let mut languages = HashMap::new();
        languages.insert(
            "cpp17".to_string(),
            LanguageSpec {
                compile_cmd: Some(vec!["g++".into(), "-O2".into()]),
                run_cmd: vec!["./a.out".into()],
                source_filename: "main.cpp".into(),
                extra_compile_flags_allowed: true,
                default_limits: None,
                profile_name: "run".into(),
            },
        );
        let mut profiles = HashMap::new();
        profiles.insert("compile".to_string(), IsolationProfile::default());
        profiles.insert("run".to_string(), IsolationProfile::default());
        RegistryManifest { languages, profiles }
    }

    #[test]
    fn rejects_dangling_profile_reference() {
        let mut manifest = manifest();
        manifest
            .languages
            .get_mut("cpp17")
            .unwrap()
            .profile_name = "sandboxed".into();
        assert!(Registry::new(manifest).is_err());
    }

    #[test]
    fn resolves_known_language_and_profile() {
        let registry = Registry::new(manifest()).expect("valid manifest");
        assert!(registry.resolve_language("cpp17").is_ok());
        assert!(registry.resolve_profile("run").is_ok());
        assert!(registry.resolve_language("nope").is_err());
    }
}
