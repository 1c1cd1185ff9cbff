//! Playlist snapshot: written on clean shutdown, restored on startup.
//!
//! Format: a `# cursor N` header (N is −1 when no track is current),
//! then one path per line.

use std::io::{self, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Write the snapshot, replacing any previous one.
pub fn save(path: &Path, songs: &[PathBuf], cursor: Option<usize>) -> io::Result<()> {
    let mut out = Vec::new();
    let cursor = cursor.map(|i| i as i64).unwrap_or(-1);
    writeln!(out, "# cursor {}", cursor)?;
    for song in songs {
        out.extend_from_slice(song.as_os_str().as_bytes());
        out.push(b'\n');
    }
    std::fs::write(path, out)?;
    debug!(path = %path.display(), entries = songs.len(), "playlist snapshot written");
    Ok(())
}

/// Read the snapshot back. `None` when no snapshot exists; a malformed
/// header is tolerated (the cursor is simply dropped).
pub fn load(path: &Path) -> io::Result<Option<(Vec<PathBuf>, Option<usize>)>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut cursor: Option<usize> = None;
    let mut songs = Vec::new();
    for (n, line) in raw.split(|&b| b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        if n == 0 && line.starts_with(b"# cursor ") {
            match std::str::from_utf8(&line[9..])
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
            {
                Some(i) if i >= 0 => cursor = Some(i as usize),
                Some(_) => {}
                None => warn!(path = %path.display(), "ignoring malformed cursor header"),
            }
            continue;
        }
        songs.push(PathBuf::from(std::ffi::OsString::from_vec(line.to_vec())));
    }
    Ok(Some((songs, cursor)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("queue");
        let songs = vec![PathBuf::from("/music/a.ogg"), PathBuf::from("/music/b.mp3")];

        save(&file, &songs, Some(1)).unwrap();
        let (loaded, cursor) = load(&file).unwrap().unwrap();
        assert_eq!(loaded, songs);
        assert_eq!(cursor, Some(1));
    }

    #[test]
    fn no_cursor_roundtrips_as_minus_one() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("queue");
        save(&file, &[PathBuf::from("/a")], None).unwrap();

        let text = std::fs::read_to_string(&file).unwrap();
        assert!(text.starts_with("# cursor -1\n"));

        let (_, cursor) = load(&file).unwrap().unwrap();
        assert_eq!(cursor, None);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("queue")).unwrap().is_none());
    }

    #[test]
    fn tolerates_missing_header() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("queue");
        std::fs::write(&file, "/music/x.flac\n").unwrap();
        let (songs, cursor) = load(&file).unwrap().unwrap();
        assert_eq!(songs, vec![PathBuf::from("/music/x.flac")]);
        assert_eq!(cursor, None);
    }
}
