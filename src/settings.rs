//! The dotted-path settings tree, persisted as JSON under the root dir.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub struct Settings {
    tree: Mutex<Value>,
    path: PathBuf,
}

fn default_tree() -> Value {
    json!({
        "cpu": {
            "jit": true,
            "jit_self_heal": false,
        },
        "video": {
            "vsync": true,
            "shader_cache": true,
        },
        "audio": {
            "enabled": true,
        },
        "system": {
            "language": "en",
        },
    })
}

impl Settings {
    /// Loads `settings.json` from `root_dir`, falling back to defaults.
    pub fn load(root_dir: &Path) -> Settings {
        let path = root_dir.join("settings.json");
        let tree = fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_else(default_tree);
        Settings {
            tree: Mutex::new(tree),
            path,
        }
    }

    /// Reads a value by dotted path, rendered as a bare string for
    /// scalars and as JSON for anything structured.
    pub fn get(&self, path: &str) -> Option<String> {
        let tree = self.tree.lock();
        let mut node = &*tree;
        for key in path.split('.') {
            node = node.get(key)?;
        }
        Some(match node {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Writes a value by dotted path, creating intermediate objects.
    /// Values that parse as JSON scalars keep their type; everything else
    /// is stored as a string.
    pub fn set(&self, path: &str, value: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let parsed: Value = serde_json::from_str(value)
            .ok()
            .filter(|v: &Value| !v.is_object() && !v.is_array())
            .unwrap_or_else(|| Value::String(value.to_owned()));
        let mut tree = self.tree.lock();
        let mut node = &mut *tree;
        let keys: Vec<&str> = path.split('.').collect();
        for key in &keys[..keys.len() - 1] {
            if !node.is_object() {
                return false;
            }
            node = node
                .as_object_mut()
                .unwrap()
                .entry(key.to_string())
                .or_insert_with(|| json!({}));
        }
        match node.as_object_mut() {
            Some(object) => {
                object.insert(keys[keys.len() - 1].to_string(), parsed);
                debug!("setting {path} updated");
                true
            }
            None => false,
        }
    }

    /// Persists the tree atomically (temp file, then rename).
    pub fn save(&self) -> std::io::Result<()> {
        let text = serde_json::to_string_pretty(&*self.tree.lock()).expect("settings are JSON");
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn save_best_effort(&self) {
        if let Err(e) = self.save() {
            warn!("could not persist settings: {e}");
        }
    }

    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        match self.get(path).as_deref() {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path());
        assert_eq!(settings.get("cpu.jit").as_deref(), Some("true"));
        assert_eq!(settings.get("system.language").as_deref(), Some("en"));
        assert_eq!(settings.get("no.such.path"), None);
    }

    #[test]
    fn set_get_round_trip_with_types() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path());
        assert!(settings.set("video.vsync", "false"));
        assert_eq!(settings.get("video.vsync").as_deref(), Some("false"));
        assert!(!settings.get_bool("video.vsync", true));
        assert!(settings.set("video.scale", "1.5"));
        assert_eq!(settings.get("video.scale").as_deref(), Some("1.5"));
        assert!(settings.set("system.nickname", "player one"));
        assert_eq!(
            settings.get("system.nickname").as_deref(),
            Some("player one")
        );
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let settings = Settings::load(dir.path());
            settings.set("cpu.jit", "false");
            settings.save().unwrap();
        }
        let settings = Settings::load(dir.path());
        assert_eq!(settings.get("cpu.jit").as_deref(), Some("false"));
    }
}
