pub mod extractor;

use std::path::{Path, PathBuf};

use which::which;

/// Resolves the full path to a tool binary.
/// Search order: explicit path → ./tools/{name} → ./{name} → system PATH
pub fn get_binary_path(tool_name: &str) -> Option<String> {
    let binary_name = if cfg!(target_os = "windows") && !tool_name.ends_with(".exe") {
        format!("{}.exe", tool_name)
    } else {
        tool_name.to_string()
    };

    // Explicit paths are taken as-is.
    let direct = Path::new(&binary_name);
    if direct.components().count() > 1 {
        return direct.exists().then(|| binary_name.clone());
    }

    let tools_path = PathBuf::from("./tools").join(&binary_name);
    if tools_path.exists() {
        return Some(tools_path.to_string_lossy().to_string());
    }

    let local_path = PathBuf::from("./").join(&binary_name);
    if local_path.exists() {
        return Some(local_path.to_string_lossy().to_string());
    }

    if let Ok(path) = which(&binary_name) {
        return Some(path.to_string_lossy().to_string());
    }

    None
}

/// Returns the first `max_lines` lines of a captured artifact, with a
/// truncation marker when there was more.
pub fn read_preview(bytes: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if i >= max_lines {
            out.push("... (truncated preview)".to_string());
            break;
        }
        out.push(line.to_string());
    }
    out.join("\n")
}
