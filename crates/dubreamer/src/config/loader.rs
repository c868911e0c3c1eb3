//! Locating the configuration file and layering environment overrides on top.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{Config, ConfigError, RawConfig, ValidationOptions};

/// Prefix of environment variables that override file values.
///
/// Nested keys are joined with a double underscore:
/// `DUBREAMER_AUTH__PASSWORD` sets `auth.password` and
/// `DUBREAMER_STREAM__NEWS__WINDOW_SIZE` sets `stream.news.window_size`.
pub const ENV_PREFIX: &str = "DUBREAMER_";

const NESTING_SEPARATOR: &str = "__";

/// A validated snapshot together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: PathBuf,
}

/// `/etc/dubreamer`, then `$HOME/.dubreamer`, then the working directory.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/dubreamer")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".dubreamer"));
    }
    paths.push(PathBuf::from("."));
    paths
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    name: String,
    search_paths: Vec<PathBuf>,
    env: Option<Vec<(OsString, OsString)>>,
    options: ValidationOptions,
}

impl ConfigLoader {
    /// `name` is either a base name (`config` resolves to `config.toml` in the
    /// search paths) or a path to a file.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            search_paths: default_search_paths(),
            env: None,
            options: ValidationOptions::default(),
        }
    }

    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Use the given variables instead of the process environment.
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn allow_default_credentials(mut self, allow: bool) -> Self {
        self.options.allow_default_credentials = allow;
        self
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let name = Path::new(&self.name);
        let mut candidates = Vec::new();

        if name.extension().is_some() || name.components().count() > 1 {
            candidates.push(name.to_path_buf());
            if name.is_absolute() {
                return candidates;
            }
        }

        let file_name = if name.extension().is_some() {
            self.name.clone()
        } else {
            format!("{}.toml", self.name)
        };
        candidates.extend(self.search_paths.iter().map(|dir| dir.join(&file_name)));
        candidates
    }

    /// First existing candidate file.
    pub fn locate(&self) -> Result<PathBuf, ConfigError> {
        let candidates = self.candidates();
        candidates
            .iter()
            .find(|path| path.is_file())
            .cloned()
            .ok_or_else(|| ConfigError::NotFound {
                name: self.name.clone(),
                searched: candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let path = self.locate()?;
        debug!(path = %path.display(), "Loading configuration");

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let mut table: toml::Table = text.parse().map_err(|e: toml::de::Error| {
            ConfigError::Parse {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;

        let overrides = match &self.env {
            Some(vars) => collect_overrides(vars.iter().cloned()),
            None => collect_overrides(std::env::vars_os()),
        };
        for (keys, value) in overrides {
            debug!(key = %keys.join("."), "Applying environment override");
            apply_override(&mut table, &keys, &value)?;
        }

        let raw: RawConfig = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let config = Config::from_raw(raw, self.options)?;
        Ok(LoadedConfig { config, path })
    }
}

/// Variables that are not valid UTF-8 are skipped; a prefixed one is logged.
fn collect_overrides(
    vars: impl Iterator<Item = (OsString, OsString)>,
) -> Vec<(Vec<String>, String)> {
    let mut overrides: Vec<_> = vars
        .filter_map(|(key, value)| {
            let key = key.into_string().ok()?;
            let rest = key.strip_prefix(ENV_PREFIX)?;
            let Ok(value) = value.into_string() else {
                warn!(key = %key, "Ignoring environment override with a non-UTF-8 value");
                return None;
            };
            let keys: Vec<String> = rest
                .split(NESTING_SEPARATOR)
                .map(|k| k.to_ascii_lowercase())
                .collect();
            if keys.iter().any(|k| k.is_empty()) {
                return None;
            }
            Some((keys, value))
        })
        .collect();
    // Deterministic application order regardless of environment ordering.
    overrides.sort();
    overrides
}

fn apply_override(table: &mut toml::Table, keys: &[String], value: &str) -> Result<(), ConfigError> {
    let Some((last, parents)) = keys.split_last() else {
        return Ok(());
    };

    let mut current = table;
    for (depth, key) in parents.iter().enumerate() {
        let entry = current
            .entry(key.clone())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        current = match entry {
            toml::Value::Table(inner) => inner,
            _ => {
                return Err(ConfigError::invalid(
                    keys[..=depth].join("."),
                    "environment override descends into a non-table value",
                ));
            }
        };
    }

    let typed = match current.get(last) {
        Some(toml::Value::String(_)) => toml::Value::String(value.to_string()),
        _ if is_string_key(keys) => toml::Value::String(value.to_string()),
        _ => infer_value(value),
    };
    current.insert(last.clone(), typed);
    Ok(())
}

/// Keys the file model declares as strings. Their overrides are taken
/// verbatim even when the text looks like a number or a boolean.
fn is_string_key(keys: &[String]) -> bool {
    match keys {
        [key] => key == "hostname",
        [section, key] if section == "auth" => key == "username" || key == "password",
        [section, _, key] if section == "stream" => key == "url" || key == "output",
        _ => false,
    }
}

fn infer_value(value: &str) -> toml::Value {
    if let Ok(i) = value.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(b) = value.parse::<bool>() {
        toml::Value::Boolean(b)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const BASE: &str = r#"
hostname = "relay.local"

[auth]
username = "ops"
password = "from-file"

[stream.news]
url = "http://origin.example.com/news.m3u8"
"#;

    fn write_config(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn searches_paths_in_order() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write_config(&second, "config.toml", BASE);

        let loader = ConfigLoader::new("config")
            .with_search_paths(vec![first.path().to_path_buf(), second.path().to_path_buf()])
            .with_env_vars(Vec::<(String, String)>::new());
        let loaded = loader.load().unwrap();
        assert_eq!(loaded.path, second.path().join("config.toml"));
        assert_eq!(loaded.config.hostname, "relay.local");

        write_config(&first, "config.toml", "hostname = \"first\"\n[auth]\nusername = \"a\"\npassword = \"b\"\n");
        assert_eq!(loader.load().unwrap().config.hostname, "first");
    }

    #[test]
    fn missing_file_lists_searched_locations() {
        let dir = TempDir::new().unwrap();
        let err = ConfigLoader::new("absent")
            .with_search_paths(vec![dir.path().to_path_buf()])
            .locate()
            .unwrap_err();
        match err {
            ConfigError::NotFound { searched, .. } => assert!(searched.contains("absent.toml")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn explicit_path_is_used_directly() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "relay.toml", BASE);
        let loaded = ConfigLoader::new(path.to_string_lossy())
            .with_search_paths(vec![])
            .with_env_vars(Vec::<(String, String)>::new())
            .load()
            .unwrap();
        assert_eq!(loaded.path, path);
    }

    #[test]
    fn environment_overrides_nested_keys() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "config.toml", BASE);

        let loaded = ConfigLoader::new("config")
            .with_search_paths(vec![dir.path().to_path_buf()])
            .with_env_vars([
                ("DUBREAMER_AUTH__PASSWORD", "from-env"),
                ("DUBREAMER_PORT", "7000"),
                ("DUBREAMER_STREAM__NEWS__WINDOW_SIZE", "4"),
                ("OTHER_PORT", "1"),
            ])
            .load()
            .unwrap();

        assert_eq!(loaded.config.auth.password, "from-env");
        assert_eq!(loaded.config.port, 7000);
        assert_eq!(loaded.config.stream("news").unwrap().window_size, 4);
    }

    #[test]
    fn numeric_override_of_string_key_stays_a_string() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "config.toml", BASE);

        let loaded = ConfigLoader::new("config")
            .with_search_paths(vec![dir.path().to_path_buf()])
            .with_env_vars([("DUBREAMER_AUTH__PASSWORD", "12345")])
            .load()
            .unwrap();
        assert_eq!(loaded.config.auth.password, "12345");
    }

    #[test]
    fn numeric_override_of_unset_string_key_stays_a_string() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "config.toml",
            "[auth]\nusername = \"ops\"\n[stream.news]\nurl = \"http://origin/news.m3u8\"\n",
        );

        let loaded = ConfigLoader::new("config")
            .with_search_paths(vec![dir.path().to_path_buf()])
            .with_env_vars([
                ("DUBREAMER_AUTH__PASSWORD", "12345"),
                ("DUBREAMER_HOSTNAME", "10"),
                ("DUBREAMER_STREAM__NEWS__OUTPUT", "2024"),
            ])
            .load()
            .unwrap();
        assert_eq!(loaded.config.auth.password, "12345");
        assert_eq!(loaded.config.hostname, "10");
        assert_eq!(loaded.config.stream("news").unwrap().output, "2024");
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_variables_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let dir = TempDir::new().unwrap();
        write_config(&dir, "config.toml", BASE);

        let loaded = ConfigLoader::new("config")
            .with_search_paths(vec![dir.path().to_path_buf()])
            .with_env_vars([
                (OsString::from("UNRELATED"), OsString::from_vec(vec![0xFF, 0xFE])),
                (OsString::from("DUBREAMER_HOSTNAME"), OsString::from_vec(vec![0xFF])),
                (OsString::from_vec(vec![0xFF, 0xFE]), OsString::from("x")),
                (OsString::from("DUBREAMER_PORT"), OsString::from("7001")),
            ])
            .load()
            .unwrap();
        assert_eq!(loaded.config.hostname, "relay.local");
        assert_eq!(loaded.config.port, 7001);
    }

    #[test]
    fn override_into_scalar_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "config.toml", BASE);

        let err = ConfigLoader::new("config")
            .with_search_paths(vec![dir.path().to_path_buf()])
            .with_env_vars([("DUBREAMER_HOSTNAME__X", "1")])
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn default_credentials_need_opt_in() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "config.toml", "port = 9000\n");
        let loader = ConfigLoader::new("config")
            .with_search_paths(vec![dir.path().to_path_buf()])
            .with_env_vars(Vec::<(String, String)>::new());

        assert!(matches!(loader.load(), Err(ConfigError::InsecureCredentials)));
        let loaded = loader.allow_default_credentials(true).load().unwrap();
        assert!(loaded.config.uses_default_credentials());
    }
}
