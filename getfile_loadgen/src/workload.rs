//! Parses a workload file: one request path per line, blank lines and
//! `#`-prefixed comments skipped. Mirrors `gfclient_download.c`'s
//! `workload_parse`.

use std::io::{self, BufRead};
use std::path::Path;

pub fn load_workload(path: &Path) -> io::Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let reader = io::BufReader::new(file);
    let mut paths = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        paths.push(trimmed.to_string());
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        let mut path = std::env::temp_dir();
        path.push(format!("getfile_loadgen_workload_{}.txt", std::process::id()));
        std::fs::write(&path, "/a.txt\n\n# a comment\n/b.txt\n").unwrap();

        let paths = load_workload(&path).unwrap();
        assert_eq!(paths, vec!["/a.txt".to_string(), "/b.txt".to_string()]);

        std::fs::remove_file(&path).unwrap();
    }
}
