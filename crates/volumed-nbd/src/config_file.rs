use std::collections::BTreeMap;
use std::path::Path;

use volumed_domain::NbdExport;

use crate::error::NbdError;

/// One `[name]` section of the NBD server configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSection {
    pub name: String,
    pub volume_id: String,
    pub device: String,
    pub port: u16,
}

/// Render the set of active exports into the flat sectioned config file
/// format the NBD server reads. Sections are ordered by name so repeated
/// renders of the same export set are byte-identical.
pub fn render(exports: &[NbdExport]) -> String {
    let mut by_name: BTreeMap<&str, &NbdExport> = BTreeMap::new();
    for export in exports {
        by_name.insert(export.name.as_str(), export);
    }
    let mut out = String::new();
    for (name, export) in by_name {
        out.push_str(&format!("[{name}]\n"));
        out.push_str(&format!("volume_id = {}\n", export.volume_id.as_str()));
        out.push_str(&format!("device = {}\n", export.device_path));
        out.push_str(&format!("port = {}\n\n", export.port));
    }
    out
}

/// Parse the config file format back into sections, for reconcile-time
/// comparison against persistence.
pub fn parse(text: &str) -> Result<Vec<ExportSection>, NbdError> {
    let mut sections = Vec::new();
    let mut current: Option<(String, BTreeMap<String, String>)> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some((name, fields)) = current.take() {
                sections.push(finish_section(&name, fields, idx)?);
            }
            current = Some((name.to_string(), BTreeMap::new()));
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| NbdError::Malformed { line: idx + 1, detail: format!("expected 'key = value', got {line:?}") })?;
        let (key, value) = (key.trim().to_string(), value.trim().to_string());
        match &mut current {
            Some((_, fields)) => {
                fields.insert(key, value);
            }
            None => return Err(NbdError::Malformed { line: idx + 1, detail: "field outside of any [section]".into() }),
        }
    }
    if let Some((name, fields)) = current {
        sections.push(finish_section(&name, fields, text.lines().count())?);
    }
    Ok(sections)
}

fn finish_section(name: &str, fields: BTreeMap<String, String>, line: usize) -> Result<ExportSection, NbdError> {
    let get = |key: &str| fields.get(key).cloned().ok_or_else(|| NbdError::Malformed { line, detail: format!("section [{name}] missing '{key}'") });
    let port = get("port")?
        .parse::<u16>()
        .map_err(|e| NbdError::Malformed { line, detail: format!("section [{name}] bad port: {e}") })?;
    Ok(ExportSection { name: name.to_string(), volume_id: get("volume_id")?, device: get("device")?, port })
}

/// Atomically replace the file at `path` with `contents` (write-to-temp +
/// rename), so a concurrent reader never observes a partially-written file.
pub fn atomic_write(path: &Path, contents: &str) -> Result<(), NbdError> {
    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use volumed_domain::{ExportStatus, VolumeId};

    fn sample_export(name: &str, volume_id: &str, device: &str) -> NbdExport {
        NbdExport {
            name: volumed_domain::ExportName(name.to_string()),
            volume_id: VolumeId::new(volume_id),
            device_path: device.to_string(),
            port: 10809,
            status: ExportStatus::Active,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn render_then_parse_round_trips_fields() {
        let exports = vec![sample_export("migration-vol-a", "a", "/dev/nbd0"), sample_export("migration-vol-b", "b", "/dev/nbd1")];
        let rendered = render(&exports);
        let parsed = parse(&rendered).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "migration-vol-a");
        assert_eq!(parsed[0].device, "/dev/nbd0");
        assert_eq!(parsed[1].port, 10809);
    }

    #[test]
    fn parse_rejects_field_outside_section() {
        let err = parse("device = /dev/nbd0\n").unwrap_err();
        assert!(matches!(err, NbdError::Malformed { .. }));
    }

    #[test]
    fn render_is_deterministic_regardless_of_input_order() {
        let a = vec![sample_export("migration-vol-a", "a", "/dev/nbd0"), sample_export("migration-vol-b", "b", "/dev/nbd1")];
        let b = vec![sample_export("migration-vol-b", "b", "/dev/nbd1"), sample_export("migration-vol-a", "a", "/dev/nbd0")];
        assert_eq!(render(&a), render(&b));
    }
}
