//! # Compose Model
//!
//! A deliberately minimal view of compose files: just enough structure for
//! change detection (bind sources, env files, config/secret references,
//! image names), label injection, and swarm config/secret renaming. Full
//! compose semantics stay with the engine.
//!
//! Files are merged in order with later files taking precedence, the same
//! shallow-wins rule the compose CLI applies to scalars.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};

/// Ordered merge of one or more compose files.
#[derive(Debug, Clone)]
pub struct ComposeProject {
    doc: Value,
}

impl ComposeProject {
    /// Read and merge `files` in order.
    pub fn load(files: &[PathBuf]) -> Result<Self> {
        anyhow::ensure!(!files.is_empty(), "no compose files to load");
        let mut doc = Value::Mapping(Mapping::new());
        for file in files {
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("failed to read compose file {}", file.display()))?;
            let value: Value = serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid compose file {}", file.display()))?;
            merge_values(&mut doc, value);
        }
        Ok(Self { doc })
    }

    pub fn from_value(doc: Value) -> Self {
        Self { doc }
    }

    pub fn doc(&self) -> &Value {
        &self.doc
    }

    pub fn doc_mut(&mut self) -> &mut Value {
        &mut self.doc
    }

    fn services(&self) -> Option<&Mapping> {
        self.doc.get("services")?.as_mapping()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services()
            .map(|services| {
                services
                    .keys()
                    .filter_map(|k| k.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Desired image per service, with compose-style variable interpolation
    /// applied from `env`. Services without an image (build-only) are
    /// omitted.
    pub fn service_images(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut images = BTreeMap::new();
        let Some(services) = self.services() else {
            return images;
        };
        for (name, service) in services {
            let (Some(name), Some(image)) = (
                name.as_str(),
                service.get("image").and_then(Value::as_str),
            ) else {
                continue;
            };
            images.insert(name.to_string(), interpolate(image, env));
        }
        images
    }

    pub fn has_build(&self) -> bool {
        self.services()
            .map(|services| services.values().any(|s| s.get("build").is_some()))
            .unwrap_or(false)
    }

    /// Host paths of bind mounts, as written (relative paths stay relative
    /// to the working directory). Named volumes are excluded.
    pub fn bind_mount_sources(&self) -> Vec<String> {
        let mut sources = Vec::new();
        let Some(services) = self.services() else {
            return sources;
        };
        for service in services.values() {
            let Some(volumes) = service.get("volumes").and_then(Value::as_sequence) else {
                continue;
            };
            for volume in volumes {
                match volume {
                    Value::String(short) => {
                        if let Some(source) = bind_source_of_short_syntax(short) {
                            sources.push(source.to_string());
                        }
                    }
                    Value::Mapping(long) => {
                        let is_bind = long
                            .get(Value::String("type".into()))
                            .and_then(Value::as_str)
                            .map(|t| t == "bind")
                            .unwrap_or(false);
                        if is_bind {
                            if let Some(source) = long
                                .get(Value::String("source".into()))
                                .and_then(Value::as_str)
                            {
                                sources.push(source.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        sources
    }

    /// Env files referenced by services (`env_file`, string or list form).
    pub fn env_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        let Some(services) = self.services() else {
            return files;
        };
        for service in services.values() {
            match service.get("env_file") {
                Some(Value::String(path)) => files.push(path.clone()),
                Some(Value::Sequence(entries)) => {
                    for entry in entries {
                        match entry {
                            Value::String(path) => files.push(path.clone()),
                            Value::Mapping(m) => {
                                if let Some(path) =
                                    m.get(Value::String("path".into())).and_then(Value::as_str)
                                {
                                    files.push(path.to_string());
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        files
    }

    /// Files backing top-level configs and secrets.
    pub fn file_references(&self) -> Vec<String> {
        let mut files = Vec::new();
        for section in ["configs", "secrets"] {
            let Some(entries) = self.doc.get(section).and_then(Value::as_mapping) else {
                continue;
            };
            for entry in entries.values() {
                if let Some(path) = entry.get("file").and_then(Value::as_str) {
                    files.push(path.to_string());
                }
            }
        }
        files
    }

    /// Every repository-relative path this project depends on, used by
    /// commit-diff change detection. `working_dir` rebases relative paths.
    pub fn referenced_paths(&self, working_dir: &str) -> Vec<String> {
        let mut paths = Vec::new();
        for raw in self
            .bind_mount_sources()
            .into_iter()
            .chain(self.env_files())
            .chain(self.file_references())
        {
            if Path::new(&raw).is_absolute() {
                continue;
            }
            paths.push(rebase(working_dir, &raw));
        }
        paths
    }
}

/// `./data:/var/lib/data:ro` -> `./data`; named volumes (`db:/var/lib`) are
/// not binds.
fn bind_source_of_short_syntax(short: &str) -> Option<&str> {
    let source = short.split(':').next()?;
    if source.is_empty() {
        return None;
    }
    if source.starts_with('.') || source.starts_with('/') || source.contains('/') {
        Some(source)
    } else {
        None
    }
}

/// Normalize `working_dir` + relative path into a repository-relative path.
fn rebase(working_dir: &str, relative: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let joined = if working_dir == "." || working_dir.is_empty() {
        relative.to_string()
    } else {
        format!("{working_dir}/{relative}")
    };
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Deep-merge `overlay` into `base`: mappings merge recursively, everything
/// else is replaced by the overlay.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay,
    }
}

/// Compose-style `${VAR}`, `${VAR:-default}`, `$VAR` interpolation.
/// `$$` escapes a literal dollar. Unset variables without a default expand
/// to the empty string, matching the compose CLI.
pub fn interpolate(input: &str, env: &BTreeMap<String, String>) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if bytes[i] == b'$' && i + 1 < input.len() {
            if bytes[i + 1] == b'$' {
                out.push('$');
                i += 2;
                continue;
            }
            if bytes[i + 1] == b'{' {
                if let Some(end) = input[i + 2..].find('}') {
                    let expr = &input[i + 2..i + 2 + end];
                    let (name, default) = match expr.split_once(":-") {
                        Some((name, default)) => (name, Some(default)),
                        None => (expr, None),
                    };
                    match env.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            if let Some(default) = default {
                                out.push_str(default);
                            }
                        }
                    }
                    i += 2 + end + 1;
                    continue;
                }
            }
            let rest = &input[i + 1..];
            let name_len = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .count();
            if name_len > 0 {
                if let Some(value) = env.get(&rest[..name_len]) {
                    out.push_str(value);
                }
                i += 1 + name_len;
                continue;
            }
        }
        let ch = input[i..].chars().next().expect("index on char boundary");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
services:
  web:
    image: nginx:${NGINX_TAG:-1.27}
    volumes:
      - ./site:/usr/share/nginx/html:ro
      - logs:/var/log/nginx
    env_file: .env.web
  db:
    image: postgres:16
    volumes:
      - type: bind
        source: ./initdb
        target: /docker-entrypoint-initdb.d
volumes:
  logs:
configs:
  app_config:
    file: ./config/app.toml
"#;

    fn project() -> ComposeProject {
        ComposeProject::from_value(serde_yaml::from_str(BASE).unwrap())
    }

    #[test]
    fn test_service_names_and_images() {
        let project = project();
        let mut names = project.service_names();
        names.sort();
        assert_eq!(names, vec!["db", "web"]);

        let env = BTreeMap::new();
        let images = project.service_images(&env);
        assert_eq!(images["web"], "nginx:1.27");
        assert_eq!(images["db"], "postgres:16");

        let env: BTreeMap<String, String> =
            [("NGINX_TAG".to_string(), "1.28".to_string())].into();
        assert_eq!(project.service_images(&env)["web"], "nginx:1.28");
    }

    #[test]
    fn test_bind_mount_sources_exclude_named_volumes() {
        let mut sources = project().bind_mount_sources();
        sources.sort();
        assert_eq!(sources, vec!["./initdb", "./site"]);
    }

    #[test]
    fn test_env_files_and_file_references() {
        let project = project();
        assert_eq!(project.env_files(), vec![".env.web"]);
        assert_eq!(project.file_references(), vec!["./config/app.toml"]);
    }

    #[test]
    fn test_referenced_paths_rebased_to_working_dir() {
        let mut paths = project().referenced_paths("services/shop");
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "services/shop/.env.web",
                "services/shop/config/app.toml",
                "services/shop/initdb",
                "services/shop/site",
            ]
        );
    }

    #[test]
    fn test_merge_later_file_wins() {
        let mut base: Value = serde_yaml::from_str(BASE).unwrap();
        let overlay: Value = serde_yaml::from_str(
            "services:\n  web:\n    image: nginx:edge\n  worker:\n    image: busybox\n",
        )
        .unwrap();
        merge_values(&mut base, overlay);
        let project = ComposeProject::from_value(base);
        let images = project.service_images(&BTreeMap::new());
        assert_eq!(images["web"], "nginx:edge");
        assert_eq!(images["worker"], "busybox");
        // Untouched services survive the merge
        assert_eq!(images["db"], "postgres:16");
    }

    #[test]
    fn test_interpolate_forms() {
        let env: BTreeMap<String, String> = [
            ("TAG".to_string(), "v2".to_string()),
            ("NAME".to_string(), "shop".to_string()),
        ]
        .into();
        assert_eq!(interpolate("img:${TAG}", &env), "img:v2");
        assert_eq!(interpolate("img:$TAG", &env), "img:v2");
        assert_eq!(interpolate("${MISSING:-latest}", &env), "latest");
        assert_eq!(interpolate("${MISSING}", &env), "");
        assert_eq!(interpolate("cost: $$5", &env), "cost: $5");
        assert_eq!(interpolate("$NAME-$TAG", &env), "shop-v2");
    }

    #[test]
    fn test_has_build() {
        assert!(!project().has_build());
        let with_build: Value =
            serde_yaml::from_str("services:\n  app:\n    build: .\n").unwrap();
        assert!(ComposeProject::from_value(with_build).has_build());
    }
}
