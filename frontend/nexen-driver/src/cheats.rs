//! Per-game cheat files: a JSON list of `{address, compare?, value}` entries.

use nexen_common::cheats::CheatCode;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheatFileError {
    #[error("error reading cheat file: {0}")]
    Io(#[from] std::io::Error),
    #[error("error parsing cheat file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Load a cheat file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid cheat list.
pub fn load_cheat_file(path: &Path) -> Result<Vec<CheatCode>, CheatFileError> {
    let contents = std::fs::read_to_string(path)?;
    let codes: Vec<CheatCode> = serde_json::from_str(&contents)?;
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cheat_json() {
        let json = r#"[
            {"address": 1879, "value": 99},
            {"address": 2048, "compare": 3, "value": 255}
        ]"#;
        let codes: Vec<CheatCode> = serde_json::from_str(json).unwrap();

        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].address, 1879);
        assert_eq!(codes[0].compare, None);
        assert_eq!(codes[1].compare, Some(3));
    }
}
