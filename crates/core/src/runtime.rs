use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

/// Directories probed for bundled helper binaries (ffmpeg, ffprobe, model
/// runners) before falling back to `PATH`:
///   1. `<exe_dir>/`, `<exe_dir>/bin/`, `<exe_dir>/../bin/`
///   2. `<cwd>/`, `<cwd>/bin/`
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        for dir in [cwd.clone(), cwd.join("bin")] {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }

    dirs
}

fn candidate_binary_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    // Explicit paths are used as-is.
    if Path::new(binary).components().count() > 1 {
        return None;
    }

    let names = candidate_binary_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

pub fn command_for(binary: &str) -> ProcessCommand {
    match find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}
