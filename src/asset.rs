use crate::error::AssetError;
use lofty::file::AudioFile;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Read the playable length of an audio file.
///
/// Missing files, empty files, undecodable files and files whose header
/// reports no length are all rejected, so callers can fall back to silence
/// before touching a player.
pub fn probe(path: &Path) -> Result<Duration, AssetError> {
    let meta = fs::metadata(path).map_err(|_| AssetError::Missing)?;
    if meta.len() == 0 {
        return Err(AssetError::ZeroLength);
    }

    let tagged_file =
        lofty::read_from_path(path).map_err(|e| AssetError::Corrupt(e.to_string()))?;

    let duration = tagged_file.properties().duration();
    if duration.is_zero() {
        return Err(AssetError::ZeroLength);
    }
    Ok(duration)
}

/// Format a duration as M:SS.
pub fn duration_display(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_rejected() {
        let result = probe(Path::new("nonexistent_line.mp3"));
        assert_eq!(result, Err(AssetError::Missing));
    }

    #[test]
    fn empty_file_is_zero_length() {
        let file = tempfile::Builder::new().suffix(".mp3").tempfile().unwrap();
        assert_eq!(probe(file.path()), Err(AssetError::ZeroLength));
    }

    #[test]
    fn garbage_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".mp3").tempfile().unwrap();
        file.write_all(b"definitely not an mpeg stream").unwrap();
        file.flush().unwrap();
        let result = probe(file.path());
        assert!(result.is_err());
        assert_ne!(result, Err(AssetError::Missing));
    }

    #[test]
    fn duration_display_formats_correctly() {
        assert_eq!(duration_display(Duration::from_secs(185)), "3:05");
        assert_eq!(duration_display(Duration::from_secs(18)), "0:18");
    }
}
