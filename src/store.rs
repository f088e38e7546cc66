/// Append-only session log store.
///
/// One JSON object per line: a header first, then entries in append order.
/// Appends flush line-by-line so a crash loses at most the line being
/// written; the next open re-parses from the start and skips the partial
/// tail. Files with a missing or unparseable header are preserved with a
/// `.corrupt` suffix and re-headered rather than destroyed.
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::session_dir_for_cwd;
use crate::entry::{CURRENT_SESSION_VERSION, SessionEntry, SessionHeader};
use crate::error::{AgentError, Result};

/// Custom-message type renamed by the v2→v3 migration. Fresh installs never
/// write the old name; old logs still carry it.
const LEGACY_NOTE_TYPE: &str = "session-note";
const NOTE_TYPE: &str = "note";

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LogStore {
    /// None = in-memory session, nothing touches disk.
    path: Option<PathBuf>,
    header: SessionHeader,
    /// The header line is written lazily, on the first entry append.
    header_written: bool,
    entries: Vec<SessionEntry>,
}

impl LogStore {
    pub fn in_memory(header: SessionHeader) -> Self {
        Self {
            path: None,
            header,
            header_written: true,
            entries: Vec::new(),
        }
    }

    pub fn persistent(header: SessionHeader, path: PathBuf) -> Self {
        Self {
            path: Some(path),
            header,
            header_written: false,
            entries: Vec::new(),
        }
    }

    /// Open an existing session file: parse, migrate, and rewrite if the
    /// migration changed anything.
    pub fn open(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

        let header = match lines.next().map(parse_header) {
            Some(Some(header)) => header,
            _ => {
                // No header or an unparseable one: keep the damaged file
                // aside and start fresh in the same place.
                warn!(path = %path.display(), "session file has no valid header, re-headering");
                let backup = corrupt_backup_path(path);
                fs::copy(path, &backup)?;
                let cwd = std::env::current_dir()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let header = SessionHeader::new(uuid::Uuid::new_v4().to_string(), cwd);
                let store = Self {
                    path: Some(path.to_path_buf()),
                    header,
                    header_written: true,
                    entries: Vec::new(),
                };
                store.rewrite()?;
                return Ok(store);
            }
        };

        if header.version > CURRENT_SESSION_VERSION {
            return Err(AgentError::UnsupportedVersion {
                found: header.version,
                supported: CURRENT_SESSION_VERSION,
            });
        }

        let (header, entries, migrated) = migrate(header, lines)?;

        let store = Self {
            path: Some(path.to_path_buf()),
            header,
            header_written: true,
            entries,
        };
        if migrated {
            debug!(path = %path.display(), "migrated session file, rewriting");
            store.rewrite()?;
        }
        Ok(store)
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    /// Commit an entry. Fails only on I/O error; the in-memory list and the
    /// file line are written together.
    pub fn append(&mut self, entry: SessionEntry) -> Result<()> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            if !self.header_written {
                let header_line = serde_json::to_string(&self.header)?;
                writeln!(file, "{header_line}")?;
                self.header_written = true;
            }
            let line = serde_json::to_string(&entry)?;
            writeln!(file, "{line}")?;
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Rewrite the whole file (header + entries) atomically via a temp file.
    /// Used after migration and by branched-session copies.
    pub fn rewrite(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_log_atomic(path, &self.header, &self.entries)
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn parse_header(line: &str) -> Option<SessionHeader> {
    let header: SessionHeader = serde_json::from_str(line).ok()?;
    (header.type_field == "session").then_some(header)
}

/// Parse one entry line. Returns None for blank lines, unknown entry types
/// (skipped silently) and malformed lines (skipped with a warning).
fn parse_entry_line(line: &str) -> Option<SessionEntry> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            warn!("skipping malformed session line");
            return None;
        }
    };
    parse_entry_value(value)
}

fn parse_entry_value(value: Value) -> Option<SessionEntry> {
    match serde_json::from_value::<SessionEntry>(value.clone()) {
        Ok(entry) => Some(entry),
        Err(_) => {
            // Unknown entry types are skipped without noise so newer files
            // degrade gracefully; anything else is a malformed known type.
            if value
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(is_known_entry_type)
            {
                warn!("skipping malformed session entry");
            }
            None
        }
    }
}

fn is_known_entry_type(t: &str) -> bool {
    matches!(
        t,
        "message"
            | "model_change"
            | "thinking_level_change"
            | "compaction"
            | "branch_summary"
            | "custom"
            | "custom_message"
            | "label"
            | "session_info"
    )
}

// ── Migration ─────────────────────────────────────────────────────────────────

/// Bring a parsed file forward to the current schema version.
///
/// v1→v2: entries had no ids; synthesize them from file order, each entry's
/// parent becoming the previous entry's id.
/// v2→v3: rename the legacy custom-message type `session-note` to `note`.
fn migrate<'a>(
    mut header: SessionHeader,
    lines: impl Iterator<Item = &'a str>,
) -> Result<(SessionHeader, Vec<SessionEntry>, bool)> {
    let from_version = header.version;

    let mut entries: Vec<SessionEntry> = if from_version < 2 {
        // Pre-id files: inject identity into the raw values before parsing.
        let mut migrated = Vec::new();
        let mut previous_id: Option<String> = None;
        for line in lines {
            let Ok(mut value) = serde_json::from_str::<Value>(line) else {
                warn!("skipping malformed session line");
                continue;
            };
            let id = format!("{:08x}", migrated.len() as u64 + 1);
            if let Some(obj) = value.as_object_mut() {
                obj.insert("id".to_string(), Value::String(id.clone()));
                obj.insert(
                    "parentId".to_string(),
                    previous_id
                        .clone()
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                );
                if !obj.contains_key("timestamp") {
                    obj.insert(
                        "timestamp".to_string(),
                        Value::String(header.timestamp.clone()),
                    );
                }
            }
            if let Some(entry) = parse_entry_value(value) {
                previous_id = Some(id);
                migrated.push(entry);
            }
        }
        migrated
    } else {
        lines.filter_map(parse_entry_line).collect()
    };

    if from_version < 3 {
        for entry in &mut entries {
            if let SessionEntry::CustomMessage { custom_type, .. } = entry {
                if custom_type == LEGACY_NOTE_TYPE {
                    *custom_type = NOTE_TYPE.to_string();
                }
            }
        }
    }

    let migrated = from_version < CURRENT_SESSION_VERSION;
    header.version = CURRENT_SESSION_VERSION;
    Ok((header, entries, migrated))
}

// ── File helpers ──────────────────────────────────────────────────────────────

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session.jsonl".to_string());
    name.push_str(".corrupt");
    path.with_file_name(name)
}

fn write_log_atomic(path: &Path, header: &SessionHeader, entries: &[SessionEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        writeln!(file, "{}", serde_json::to_string(header)?)?;
        for entry in entries {
            writeln!(file, "{}", serde_json::to_string(entry)?)?;
        }
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// `<timestamp-with-colons-replaced-by-dashes>_<uuid>.jsonl`
pub fn session_file_name(timestamp: &str, uuid: &str) -> String {
    let stamped: String = timestamp
        .chars()
        .map(|c| if c == ':' { '-' } else { c })
        .collect();
    format!("{stamped}_{uuid}.jsonl")
}

/// Session files recorded for a working directory, most recently modified
/// first.
pub fn list_sessions(cwd: &str) -> Result<Vec<PathBuf>> {
    list_session_files(&session_dir_for_cwd(cwd))
}

/// All session files in a directory, most recently modified first.
pub fn list_session_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(dir)?
        .flatten()
        .filter(|e| {
            e.path()
                .extension()
                .map(|x| x == "jsonl")
                .unwrap_or(false)
        })
        .filter_map(|e| {
            let mtime = e.metadata().ok()?.modified().ok()?;
            Some((mtime, e.path()))
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

/// The most recently modified file in `dir` whose first non-blank line is a
/// valid session header.
pub fn most_recent_session(dir: &Path) -> Result<Option<PathBuf>> {
    for path in list_session_files(dir)? {
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        let first = raw.lines().find(|l| !l.trim().is_empty());
        if first.map(parse_header).flatten().is_some() {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::now_iso;
    use crate::model::Message;

    fn message_entry(id: &str, parent: Option<&str>, text: &str) -> SessionEntry {
        SessionEntry::Message {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            timestamp: now_iso(),
            message: Message::user(text),
        }
    }

    #[test]
    fn test_append_then_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let header = SessionHeader::new("sess1", "/tmp/p");

        let mut store = LogStore::persistent(header.clone(), path.clone());
        store.append(message_entry("00000001", None, "hi")).unwrap();
        store
            .append(message_entry("00000002", Some("00000001"), "there"))
            .unwrap();

        let reopened = LogStore::open(&path).unwrap();
        assert_eq!(reopened.header().id, "sess1");
        assert_eq!(reopened.entries().len(), 2);
        assert_eq!(reopened.entries()[1].parent_id(), Some("00000001"));
    }

    #[test]
    fn test_header_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let store = LogStore::persistent(SessionHeader::new("sess1", "/p"), path.clone());
        drop(store);
        // No entry appended — nothing on disk.
        assert!(!path.exists());
    }

    #[test]
    fn test_partial_trailing_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let mut store = LogStore::persistent(SessionHeader::new("sess1", "/p"), path.clone());
        store.append(message_entry("00000001", None, "hi")).unwrap();

        // Simulate a crash mid-append of the second entry.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"type\":\"message\",\"id\":\"0000").unwrap();
        drop(file);

        let reopened = LogStore::open(&path).unwrap();
        assert_eq!(reopened.entries().len(), 1);
    }

    #[test]
    fn test_unknown_entry_type_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let header_line = serde_json::to_string(&SessionHeader::new("s", "/p")).unwrap();
        let entry_line = serde_json::to_string(&message_entry("00000001", None, "hi")).unwrap();
        fs::write(
            &path,
            format!("{header_line}\n{{\"type\":\"telemetry\",\"id\":\"x\"}}\n{entry_line}\n"),
        )
        .unwrap();

        let store = LogStore::open(&path).unwrap();
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_missing_header_re_headers_and_preserves_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        fs::write(&path, "not json at all\n").unwrap();

        let store = LogStore::open(&path).unwrap();
        assert!(store.entries().is_empty());
        assert_eq!(store.header().version, CURRENT_SESSION_VERSION);

        let backup = dir.path().join("s.jsonl.corrupt");
        assert!(backup.exists());
        assert_eq!(fs::read_to_string(backup).unwrap(), "not json at all\n");

        // The re-headered file parses cleanly.
        let reopened = LogStore::open(&path).unwrap();
        assert!(reopened.entries().is_empty());
    }

    #[test]
    fn test_v1_migration_synthesizes_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let lines = [
            r#"{"type":"session","version":1,"id":"old","timestamp":"2024-01-01T00:00:00Z","cwd":"/p"}"#,
            r#"{"type":"message","message":{"role":"user","content":"first"}}"#,
            r#"{"type":"message","message":{"role":"user","content":"second"}}"#,
        ];
        fs::write(&path, lines.join("\n")).unwrap();

        let store = LogStore::open(&path).unwrap();
        assert_eq!(store.header().version, CURRENT_SESSION_VERSION);
        assert_eq!(store.entries().len(), 2);
        assert_eq!(store.entries()[0].id(), "00000001");
        assert_eq!(store.entries()[0].parent_id(), None);
        assert_eq!(store.entries()[1].parent_id(), Some("00000001"));

        // The migrated file was rewritten with the stamped version.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.lines().next().unwrap().contains("\"version\":3"));
    }

    #[test]
    fn test_v2_migration_renames_legacy_note_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let lines = [
            r#"{"type":"session","version":2,"id":"old","timestamp":"2024-01-01T00:00:00Z","cwd":"/p"}"#,
            r#"{"type":"custom_message","id":"00000001","parentId":null,"timestamp":"t","customType":"session-note","content":"remember this"}"#,
        ];
        fs::write(&path, lines.join("\n")).unwrap();

        let store = LogStore::open(&path).unwrap();
        match &store.entries()[0] {
            SessionEntry::CustomMessage { custom_type, .. } => assert_eq!(custom_type, "note"),
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_newer_version_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        fs::write(
            &path,
            r#"{"type":"session","version":99,"id":"x","timestamp":"t","cwd":"/p"}"#,
        )
        .unwrap();
        let err = LogStore::open(&path).unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedVersion { found: 99, .. }));
    }

    #[test]
    fn test_session_file_name() {
        let name = session_file_name("2024-03-01T10:22:33.000Z", "abc-def");
        assert_eq!(name, "2024-03-01T10-22-33.000Z_abc-def.jsonl");
    }

    #[test]
    fn test_in_memory_store_never_touches_disk() {
        let mut store = LogStore::in_memory(SessionHeader::new("s", "/p"));
        store.append(message_entry("00000001", None, "hi")).unwrap();
        assert!(store.path().is_none());
        assert_eq!(store.entries().len(), 1);
    }
}
