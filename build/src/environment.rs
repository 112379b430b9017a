//! Resolution of a derivation's inputs and environment.
//!
//! Builders name their dependencies by the input-addressed paths
//! written into the derivation; the store knows them by their
//! content-addressed names. Two passes bridge the gap: the first
//! dereferences every declared input to its final name, the second
//! rewrites environment values that mention input paths.

use std::collections::BTreeMap;

use bstr::BString;

use nichts_compat::derivation::Derivation;
use nichts_store::{util, FsSession};

use crate::errors::BuildError;

/// Load and parse a derivation file from the store.
pub fn load_derivation(
    fs: &mut dyn FsSession,
    name: &str,
) -> Result<(Derivation, Vec<u8>), BuildError> {
    let name = name.trim_start_matches('/');
    let bytes = util::read_file(fs, &format!("/{name}"))
        .map_err(|_| BuildError::MissingDerivation(name.to_string()))?;
    let drv = Derivation::from_aterm_bytes(&bytes)?;
    Ok((drv, bytes))
}

/// The dereferenced inputs of one derivation: input-addressed name to
/// content-addressed name.
#[derive(Debug, Default)]
pub struct Inputs {
    map: BTreeMap<String, String>,
}

impl Inputs {
    /// Walk the derivation's input derivations and sources, resolving
    /// every declared output path against the store.
    pub fn resolve(fs: &mut dyn FsSession, drv: &Derivation) -> Result<Inputs, BuildError> {
        let mut map = BTreeMap::new();

        for input in &drv.input_derivations {
            let (dependency, _) = load_derivation(fs, &input.derivation)?;

            for want_id in &input.outputs {
                for output in &dependency.outputs {
                    if output.id != *want_id {
                        continue;
                    }
                    let link = output.path.trim_start_matches('/');
                    let target = util::dereference(fs, link).map_err(|_| {
                        tracing::error!(input = link, "missing input symlink");
                        BuildError::MissingDependency(link.to_string())
                    })?;
                    map.insert(link.to_string(), target);
                }
            }
        }

        for source in &drv.input_sources {
            let source = source.trim_start_matches('/');
            map.insert(source.to_string(), source.to_string());
        }

        Ok(Inputs { map })
    }

    pub fn lookup(&self, link: &str) -> Option<&str> {
        self.map.get(link).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Names a build may see: each input-addressed link and its
    /// content-addressed target.
    pub fn whitelist(&self, fs: &mut dyn FsSession) -> Vec<String> {
        let mut names = Vec::new();
        for (link, target) in self.iter() {
            names.push(link.to_string());
            names.push(target.to_string());
            // sources may themselves be symlinks
            if link == target {
                if let Ok(resolved) = util::dereference(fs, target) {
                    names.push(resolved);
                }
            }
        }
        names
    }
}

/// The builder-visible environment with input references rewritten to
/// content-addressed paths.
#[derive(Debug, Default)]
pub struct Environment {
    entries: Vec<(String, BString)>,
}

impl Environment {
    pub fn resolve(fs: &mut dyn FsSession, drv: &Derivation, inputs: &Inputs) -> Environment {
        let mut entries = Vec::with_capacity(drv.environment.len());

        for entry in &drv.environment {
            let value = match std::str::from_utf8(&entry.value) {
                Ok(value) => value,
                Err(_) => {
                    // not a path, keep the raw bytes
                    entries.push((entry.key.clone(), entry.value.clone()));
                    continue;
                }
            };
            let rewritten = rewrite_value(fs, inputs, value);
            entries.push((entry.key.clone(), BString::from(rewritten.into_bytes())));
        }

        Environment { entries }
    }

    pub fn lookup(&self, key: &str) -> Option<&BString> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// The value for `key`, when it is valid UTF-8.
    pub fn lookup_str(&self, key: &str) -> Option<&str> {
        self.lookup(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BString)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn rewrite_value(fs: &mut dyn FsSession, inputs: &Inputs, value: &str) -> String {
    let stripped = value.trim_start_matches('/');
    let (first, rest) = match stripped.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (stripped, None),
    };

    if let Some(target) = inputs.lookup(first) {
        return match rest {
            // the value is the input path itself
            None => target.to_string(),
            // the value points below the input; rewrite the prefix
            Some(rest) => format!("{target}/{rest}"),
        };
    }

    // maybe the value names a store object the derivation did not
    // declare as an input; resolve it if it does, else leave it alone
    if rest.is_none() && !first.is_empty() {
        if let Ok(target) = util::dereference(fs, first) {
            return target;
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nichts_compat::derivation::{EnvEntry, InputDerivation, Output};
    use pretty_assertions::assert_eq;
    use nichts_store::LocalStore;
    use tempfile::TempDir;

    const CONTENT_NAME: &str = "00000000000000000000000000000000-dep";

    /// A store holding one built dependency: the input path `dep-link`
    /// is a symlink to a real content-addressed directory.
    fn store_with_dependency() -> (TempDir, LocalStore) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join(CONTENT_NAME)).unwrap();
        std::os::unix::fs::symlink(CONTENT_NAME, tmp.path().join("dep-link")).unwrap();

        let dep = Derivation {
            outputs: vec![Output {
                id: "out".into(),
                path: "dep-link".into(),
                ..Default::default()
            }],
            platform: "test".into(),
            builder: "noop".into(),
            ..Default::default()
        };
        std::fs::write(tmp.path().join("dep.drv"), dep.to_aterm_bytes()).unwrap();

        let fs = LocalStore::open(tmp.path()).unwrap();
        (tmp, fs)
    }

    fn consumer() -> Derivation {
        Derivation {
            outputs: vec![Output {
                id: "out".into(),
                path: "consumer-out".into(),
                ..Default::default()
            }],
            input_derivations: vec![InputDerivation {
                derivation: "dep.drv".into(),
                outputs: vec!["out".into()],
            }],
            platform: "test".into(),
            builder: "noop".into(),
            environment: vec![
                EnvEntry {
                    key: "whole".into(),
                    value: "dep-link".into(),
                },
                EnvEntry {
                    key: "nested".into(),
                    value: "/dep-link/bin/tool".into(),
                },
                EnvEntry {
                    key: "plain".into(),
                    value: "just a value".into(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn inputs_resolve_to_content_names() {
        let (_tmp, mut fs) = store_with_dependency();
        let inputs = Inputs::resolve(&mut fs, &consumer()).unwrap();
        assert_eq!(inputs.lookup("dep-link"), Some(CONTENT_NAME));
    }

    #[test]
    fn missing_input_is_fatal() {
        let (tmp, mut fs) = store_with_dependency();
        std::fs::remove_file(tmp.path().join("dep-link")).unwrap();
        assert!(matches!(
            Inputs::resolve(&mut fs, &consumer()),
            Err(BuildError::MissingDependency(_))
        ));
    }

    #[test]
    fn environment_rewrites() {
        let (_tmp, mut fs) = store_with_dependency();
        let drv = consumer();
        let inputs = Inputs::resolve(&mut fs, &drv).unwrap();
        let env = Environment::resolve(&mut fs, &drv, &inputs);

        assert_eq!(env.lookup_str("whole"), Some(CONTENT_NAME));
        assert_eq!(
            env.lookup_str("nested"),
            Some(format!("{CONTENT_NAME}/bin/tool").as_str())
        );
        assert_eq!(env.lookup_str("plain"), Some("just a value"));
        assert_eq!(env.lookup("absent"), None);
    }

    #[test]
    fn undeclared_store_value_is_dereferenced() {
        let (tmp, mut fs) = store_with_dependency();
        std::os::unix::fs::symlink(CONTENT_NAME, tmp.path().join("stray")).unwrap();

        let mut drv = consumer();
        drv.environment.push(EnvEntry {
            key: "stray".into(),
            value: "stray".into(),
        });
        let inputs = Inputs::resolve(&mut fs, &drv).unwrap();
        let env = Environment::resolve(&mut fs, &drv, &inputs);
        assert_eq!(env.lookup_str("stray"), Some(CONTENT_NAME));
    }

    #[test]
    fn sources_map_to_themselves() {
        let (tmp, mut fs) = store_with_dependency();
        std::fs::write(tmp.path().join("src-tarball"), b"data").unwrap();

        let mut drv = consumer();
        drv.input_sources.push("src-tarball".into());
        let inputs = Inputs::resolve(&mut fs, &drv).unwrap();
        assert_eq!(inputs.lookup("src-tarball"), Some("src-tarball"));

        let names = inputs.whitelist(&mut fs);
        assert!(names.contains(&"dep-link".to_string()));
        assert!(names.contains(&CONTENT_NAME.to_string()));
        assert!(names.contains(&"src-tarball".to_string()));
    }
}
