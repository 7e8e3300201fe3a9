//! Debug-symbol lookup.
//!
//! Navigation data for an assembly lives in a sidecar `<assembly path>.symbols.json`:
//!
//! ```json
//! [{ "type": "A.T1", "method": "should_pass", "file": "src/t1.fs", "line": 12 }]
//! ```
//!
//! A missing or unreadable symbol file is never an error. [`SymbolReader::open`] reports `false` and every
//! lookup afterwards answers `None`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const SYMBOLS_SUFFIX: &str = ".symbols.json";

/// Where a method is defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationData {
    pub file: String,
    pub min_line: u32,
}

#[derive(Debug, Deserialize)]
struct SymbolEntry {
    #[serde(rename = "type")]
    type_name: String,
    method: String,
    file: String,
    line: u32,
}

/// An open symbol session.
struct SymbolSession {
    source: PathBuf,
    methods: HashMap<(String, String), NavigationData>,
}

#[derive(Default)]
pub struct SymbolReader {
    session: Option<SymbolSession>,
}

impl SymbolReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbols_path(assembly: &Path) -> PathBuf {
        let mut file_name = assembly.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        file_name.push(SYMBOLS_SUFFIX);
        assembly.with_file_name(file_name)
    }

    /// Open symbols for `assembly`, releasing any previous session first.
    pub fn open(&mut self, assembly: &Path) -> bool {
        self.close();

        let path = Self::symbols_path(assembly);
        let entries = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<Vec<SymbolEntry>>(&text),
            Err(error) => {
                tracing::debug!(path = %path.display(), %error, "no symbols");
                return false;
            }
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "ignoring unreadable symbol file");
                return false;
            }
        };

        let mut methods = HashMap::with_capacity(entries.len());
        for entry in entries {
            let data = NavigationData {
                file: entry.file,
                min_line: entry.line,
            };
            // Overloads share a key; the lowest line wins.
            methods
                .entry((entry.type_name, entry.method))
                .and_modify(|existing: &mut NavigationData| {
                    if data.min_line < existing.min_line {
                        *existing = data.clone();
                    }
                })
                .or_insert_with(|| data.clone());
        }
        self.session = Some(SymbolSession { source: path, methods });
        true
    }

    /// Open symbols for `assembly` off the async workers.
    pub async fn load(assembly: &Path) -> Self {
        let assembly = assembly.to_path_buf();
        let loaded = tokio::task::spawn_blocking(move || {
            let mut reader = Self::new();
            reader.open(&assembly);
            reader
        })
        .await;
        match loaded {
            Ok(reader) => reader,
            Err(error) => {
                tracing::warn!(%error, "symbol read did not complete");
                Self::new()
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::trace!(path = %session.source.display(), "released symbols");
        }
    }

    pub fn lookup(&self, type_name: &str, method_name: &str) -> Option<NavigationData> {
        self.session
            .as_ref()?
            .methods
            .get(&(type_name.to_string(), method_name.to_string()))
            .cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_symbols_yield_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = SymbolReader::new();
        assert!(!reader.open(&dir.path().join("A.dll")));
        assert!(!reader.is_open());
        assert_eq!(reader.lookup("A.T1", "should_pass"), None);
    }

    #[test]
    fn test_malformed_symbols_yield_absent() {
        let dir = tempfile::tempdir().unwrap();
        let assembly = dir.path().join("A.dll");
        fs::write(SymbolReader::symbols_path(&assembly), "not json").unwrap();
        let mut reader = SymbolReader::new();
        assert!(!reader.open(&assembly));
        assert_eq!(reader.lookup("A.T1", "should_pass"), None);
    }

    #[test]
    fn test_lookup_uses_lowest_line_for_overloads() {
        let dir = tempfile::tempdir().unwrap();
        let assembly = dir.path().join("A.dll");
        fs::write(
            SymbolReader::symbols_path(&assembly),
            r#"[
                {"type":"A.T1","method":"should_pass","file":"t1.fs","line":30},
                {"type":"A.T1","method":"should_pass","file":"t1.fs","line":12}
            ]"#,
        )
        .unwrap();

        let mut reader = SymbolReader::new();
        assert!(reader.open(&assembly));
        assert_eq!(
            reader.lookup("A.T1", "should_pass"),
            Some(NavigationData {
                file: "t1.fs".to_string(),
                min_line: 12
            })
        );
        assert_eq!(reader.lookup("A.T1", "other"), None);
    }

    #[tokio::test]
    async fn test_load_reads_symbols_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let assembly = dir.path().join("A.dll");
        fs::write(
            SymbolReader::symbols_path(&assembly),
            r#"[{"type":"A.T1","method":"m","file":"a.fs","line":4}]"#,
        )
        .unwrap();

        let reader = SymbolReader::load(&assembly).await;
        assert!(reader.is_open());
        assert_eq!(reader.lookup("A.T1", "m").map(|n| n.min_line), Some(4));
        assert!(!SymbolReader::load(&dir.path().join("B.dll")).await.is_open());
    }

    #[test]
    fn test_reopen_releases_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("A.dll");
        fs::write(
            SymbolReader::symbols_path(&a),
            r#"[{"type":"A.T1","method":"m","file":"a.fs","line":1}]"#,
        )
        .unwrap();

        let mut reader = SymbolReader::new();
        assert!(reader.open(&a));
        assert!(!reader.open(&dir.path().join("B.dll")));
        assert_eq!(reader.lookup("A.T1", "m"), None);
    }
}
